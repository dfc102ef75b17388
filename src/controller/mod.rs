//! Reconcilers of the Hetzner infrastructure provider
//!
//! Each reconciler works on a scope loaded by the caller, performs one bounded step and returns
//! a requeue directive. Persisting the mutated objects is left to the caller.

pub mod action;
pub mod conditions;
pub mod events;
pub mod failure_domain;
pub mod host;
pub mod inventory;
pub mod load_balancer;
pub mod probe;
pub mod remediation;
pub mod server;

pub use action::{ActionResult, Backoff, ReconcileOutcome};
pub use events::{EventSink, KubeEventSink, MemoryEventSink, Recorder};
pub use host::HostService;
pub use inventory::InventoryService;
pub use load_balancer::LoadBalancerReconciler;
pub use probe::{ApiServerProbe, KubeconfigProbe};
pub use remediation::{
    time_until_next_remediation, BareMetalRemediationService, HCloudRemediationService,
    HostRepository, KubeHostRepository,
};
pub use server::ServerService;
