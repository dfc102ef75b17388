//! Objects handed to the reconcilers for one pass
//!
//! A scope bundles the object under reconciliation with everything it reads: related objects,
//! provider clients and an event recorder. Loading a scope and persisting the mutated objects
//! afterwards is the caller's job, the reconcilers only work on the in-memory copies.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{ObjectReference, Secret};
use kube::ResourceExt;

use crate::config::Settings;
use crate::controller::events::Recorder;
use crate::controller::probe::ApiServerProbe;
use crate::controller::remediation::HostRepository;
use crate::crd::{
    BareMetalMachineHostStatus, Condition, HCloudMachine, HCloudMachineStatus, HCloudRemediation,
    HetznerBareMetalHost, HetznerBareMetalMachine, HetznerBareMetalRemediation, HetznerCluster,
    HetznerClusterStatus, RemediationStatus, SshSecretRef, DEFAULT_API_SERVER_PORT,
    HOST_ANNOTATION,
};
use crate::error::{Error, Result};
use crate::hcloud::HCloudClient;
use crate::robot::RobotClient;
use crate::ssh::SshClientFactory;

/// Label carrying the Cluster API cluster name
pub const CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";

/// Present on machines of the control plane
pub const CONTROL_PLANE_LABEL: &str = "cluster.x-k8s.io/control-plane";

const MACHINE_API_VERSION: &str = "cluster.x-k8s.io/v1beta1";

/// The Cluster API Machine owning an infrastructure machine
#[derive(Clone, Debug, Default)]
pub struct Machine {
    pub name: String,
    pub namespace: String,
    pub cluster_name: String,
    pub failure_domain: Option<String>,
    /// Secret holding the bootstrap data, unset until the bootstrap provider is done
    pub data_secret_name: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub conditions: Vec<Condition>,
}

impl Machine {
    pub fn is_control_plane(&self) -> bool {
        self.labels.contains_key(CONTROL_PLANE_LABEL)
    }

    pub fn object_ref(&self) -> ObjectReference {
        ObjectReference {
            api_version: Some(MACHINE_API_VERSION.to_string()),
            kind: Some("Machine".to_string()),
            name: Some(self.name.clone()),
            namespace: Some(self.namespace.clone()),
            ..Default::default()
        }
    }
}

/// The Cluster API Cluster
#[derive(Clone, Debug, Default)]
pub struct Cluster {
    pub name: String,
    pub namespace: String,
    pub infrastructure_ready: bool,
}

/// Cluster wide view shared by the HCloud reconcilers
pub struct ClusterScope {
    pub cluster: Cluster,
    pub hetzner_cluster: HetznerCluster,
    pub hcloud: Arc<dyn HCloudClient>,
    /// Token from the cluster secret, `None` when the secret has no HCloud token
    pub hcloud_token: Option<String>,
    /// Bound to the HetznerCluster
    pub recorder: Recorder,
}

impl ClusterScope {
    pub fn name(&self) -> String {
        self.hetzner_cluster.name_any()
    }

    /// Label key marking HCloud resources as owned by this cluster
    pub fn cluster_tag_key(&self) -> String {
        format!("caph-cluster-{}", self.name())
    }

    pub fn status(&self) -> Option<&HetznerClusterStatus> {
        self.hetzner_cluster.status.as_ref()
    }

    pub fn status_mut(&mut self) -> &mut HetznerClusterStatus {
        self.hetzner_cluster.status.get_or_insert_with(Default::default)
    }

    /// Port the API server is announced on
    pub fn control_plane_api_port(&self) -> i32 {
        match &self.hetzner_cluster.spec.control_plane_endpoint {
            Some(endpoint) if endpoint.port != 0 => endpoint.port,
            _ => {
                let port = self.hetzner_cluster.spec.control_plane_load_balancer.port;
                if port == 0 {
                    DEFAULT_API_SERVER_PORT
                } else {
                    port
                }
            }
        }
    }

    pub fn network_id(&self) -> Option<i64> {
        self.status().and_then(|s| s.network.as_ref()).map(|n| n.id)
    }
}

/// One HCloudMachine and its owners
pub struct MachineScope {
    pub cluster: ClusterScope,
    pub machine: Machine,
    pub hcloud_machine: HCloudMachine,
    /// Cloud-init payload, `None` until the bootstrap secret exists
    pub bootstrap_data: Option<String>,
    pub probe: Arc<dyn ApiServerProbe>,
    /// Bound to the HCloudMachine
    pub recorder: Recorder,
}

impl MachineScope {
    pub fn name(&self) -> String {
        self.hcloud_machine.name_any()
    }

    pub fn is_control_plane(&self) -> bool {
        self.machine.is_control_plane()
    }

    pub fn is_bootstrap_data_ready(&self) -> bool {
        self.machine.data_secret_name.is_some() && self.bootstrap_data.is_some()
    }

    pub fn status(&self) -> Option<&HCloudMachineStatus> {
        self.hcloud_machine.status.as_ref()
    }

    pub fn status_mut(&mut self) -> &mut HCloudMachineStatus {
        self.hcloud_machine.status.get_or_insert_with(Default::default)
    }

    pub fn set_ready(&mut self, ready: bool) {
        self.status_mut().ready = ready;
    }

    pub fn set_provider_id(&mut self, server_id: i64) {
        self.hcloud_machine.spec.provider_id =
            Some(crate::hcloud::provider_id_from_server_id(server_id));
    }
}

/// Remediation of one HCloudMachine
pub struct HCloudRemediationScope {
    pub remediation: HCloudRemediation,
    pub machine: Machine,
    pub hcloud_machine: HCloudMachine,
    pub hcloud: Arc<dyn HCloudClient>,
    /// Bound to the HCloudRemediation
    pub recorder: Recorder,
}

impl HCloudRemediationScope {
    pub fn status_mut(&mut self) -> &mut RemediationStatus {
        self.remediation.status.get_or_insert_with(Default::default)
    }
}

/// Remediation of one HetznerBareMetalMachine
pub struct BareMetalRemediationScope {
    pub remediation: HetznerBareMetalRemediation,
    pub machine: Machine,
    pub bare_metal_machine: HetznerBareMetalMachine,
    pub hosts: Arc<dyn HostRepository>,
    /// Bound to the HetznerBareMetalRemediation
    pub recorder: Recorder,
}

impl BareMetalRemediationScope {
    pub fn status_mut(&mut self) -> &mut RemediationStatus {
        self.remediation.status.get_or_insert_with(Default::default)
    }

    /// Namespace and name of the host consumed by the machine, from [`HOST_ANNOTATION`]
    pub fn host_key(&self) -> Result<Option<(String, String)>> {
        let Some(key) = self.bare_metal_machine.annotations().get(HOST_ANNOTATION) else {
            return Ok(None);
        };
        split_host_key(key).map(Some)
    }
}

/// `namespace/name` into its parts
pub fn split_host_key(key: &str) -> Result<(String, String)> {
    match key.split('/').collect::<Vec<_>>().as_slice() {
        [namespace, name] if !name.is_empty() => Ok((namespace.to_string(), name.to_string())),
        _ => Err(Error::ValidationError(format!(
            "unexpected host key {key:?}, want namespace/name"
        ))),
    }
}

/// Inventory sync of one HetznerBareMetalMachine
pub struct BareMetalMachineScope {
    pub hetzner_cluster: HetznerCluster,
    pub bare_metal_machine: HetznerBareMetalMachine,
    /// `None` when the cluster secret carries no Robot credentials
    pub robot: Option<Arc<dyn RobotClient>>,
    pub settings: Settings,
    /// Bound to the HetznerBareMetalMachine
    pub recorder: Recorder,
}

impl BareMetalMachineScope {
    pub fn set_status(&mut self, status: BareMetalMachineHostStatus) {
        let key = status.id.to_string();
        self.bare_metal_machine.status = Some(status.clone());
        self.hetzner_cluster
            .status
            .get_or_insert_with(Default::default)
            .bare_metal_inventory
            .insert(key, status);
    }
}

/// One HetznerBareMetalHost
pub struct HostScope {
    pub host: HetznerBareMetalHost,
    pub hetzner_cluster: HetznerCluster,
    pub robot: Arc<dyn RobotClient>,
    pub ssh_factory: Arc<dyn SshClientFactory>,
    /// Key pair for the installed OS, `None` while the secret is missing
    pub os_ssh_secret: Option<Secret>,
    /// Key pair for the rescue system, `None` while the secret is missing
    pub rescue_ssh_secret: Option<Secret>,
    pub settings: Settings,
    /// Bound to the host
    pub recorder: Recorder,
}

impl HostScope {
    /// Hostname given to the installed OS: `bm-<consumer>`, or the host name while unconsumed
    pub fn hostname(&self) -> String {
        let name = self
            .host
            .spec
            .consumer_ref
            .as_ref()
            .map(|c| c.name.clone())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| self.host.name_any());
        format!("bm-{name}")
    }

    pub fn rescue_secret_ref(&self) -> SshSecretRef {
        self.hetzner_cluster
            .spec
            .ssh_keys
            .robot_rescue_secret_ref
            .clone()
            .unwrap_or_default()
    }

    pub fn os_secret_ref(&self) -> SshSecretRef {
        self.host
            .spec
            .status
            .ssh_spec
            .as_ref()
            .map(|s| s.secret_ref.clone())
            .unwrap_or_default()
    }
}
