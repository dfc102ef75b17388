//! HetznerBareMetalMachine Custom Resource Definition
//!
//! Inventory view of a Robot server: the controller only mirrors what the Robot API reports.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "HetznerBareMetalMachine",
    namespaced,
    status = "BareMetalMachineHostStatus",
    shortname = "hbmm",
    printcolumn = r#"{"name":"ServerID","type":"integer","jsonPath":".spec.serverID"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.hetznerStatus"}"#,
    printcolumn = r#"{"name":"DC","type":"string","jsonPath":".status.dataCenter"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct HetznerBareMetalMachineSpec {
    #[serde(rename = "serverID")]
    pub server_id: i32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BareMetalMachineHostStatus {
    #[serde(default)]
    pub hetzner_status: String,
    #[serde(default)]
    pub id: i32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub data_center: String,
    #[serde(default)]
    pub paid_until: String,
}
