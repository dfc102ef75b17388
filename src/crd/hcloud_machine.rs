//! HCloudMachine Custom Resource Definition

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "HCloudMachine",
    namespaced,
    status = "HCloudMachineStatus",
    shortname = "hcma",
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.instanceState"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"ProviderID","type":"string","jsonPath":".spec.providerID"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct HCloudMachineSpec {
    /// `hcloud://<server id>`, set once the server exists
    #[serde(default, rename = "providerID", skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,

    /// Server type, e.g. `cpx31`
    #[serde(rename = "type")]
    pub type_: String,

    /// Name of the image or the value of its `caph-image-name` label
    pub image_name: String,

    /// Overrides the ssh keys of the cluster when set
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ssh_keys: Vec<SshKeySpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placement_group_name: Option<String>,
}

/// HCloud ssh key, matched by name or by id
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SshKeySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HCloudMachineStatus {
    #[serde(default)]
    pub ready: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<MachineAddress>,

    /// Failure domain the server was placed in
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub region: String,

    /// Server status as reported by the provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_state: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum MachineAddressType {
    ExternalIP,
    InternalIP,
    ExternalDNS,
    InternalDNS,
    Hostname,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachineAddress {
    #[serde(rename = "type")]
    pub type_: MachineAddressType,
    pub address: String,
}

impl MachineAddress {
    pub fn new(type_: MachineAddressType, address: impl Into<String>) -> Self {
        Self {
            type_,
            address: address.into(),
        }
    }
}
