//! Custom Resource Definitions for the Hetzner infrastructure provider
//!
//! This module defines the Kubernetes CRDs for HCloud servers, bare metal hosts and their
//! remediation.

mod baremetal_machine;
mod cluster;
mod hcloud_machine;
mod host;
mod remediation;
pub mod types;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::CustomResourceExt;


pub use baremetal_machine::{
    BareMetalMachineHostStatus, HetznerBareMetalMachine, HetznerBareMetalMachineSpec,
};
pub use cluster::*;
pub use hcloud_machine::{
    HCloudMachine, HCloudMachineSpec, HCloudMachineStatus, MachineAddress, MachineAddressType,
    SshKeySpec,
};
pub use host::*;
pub use remediation::{
    parse_duration, HCloudRemediation, HCloudRemediationSpec, HetznerBareMetalRemediation,
    HetznerBareMetalRemediationSpec, RemediationPhase, RemediationStatus, RemediationStrategy,
    REMEDIATION_TYPE_REBOOT,
};
pub use types::*;

/// Every CustomResourceDefinition owned by the provider
pub fn crds() -> Vec<CustomResourceDefinition> {
    vec![
        HetznerCluster::crd(),
        HCloudMachine::crd(),
        HetznerBareMetalHost::crd(),
        HetznerBareMetalMachine::crd(),
        HCloudRemediation::crd(),
        HetznerBareMetalRemediation::crd(),
    ]
}

/// All definitions as one multi-document YAML stream
pub fn crds_yaml() -> Result<String, serde_yaml::Error> {
    let mut out = String::new();
    for crd in crds() {
        out.push_str("---\n");
        out.push_str(&serde_yaml::to_string(&crd)?);
    }
    Ok(out)
}
