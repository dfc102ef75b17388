//! HetznerCluster Custom Resource Definition
//!
//! The cluster carries everything the machine reconcilers share: the private network, the
//! control plane load balancer and the provider credentials.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::baremetal_machine::BareMetalMachineHostStatus;
use super::hcloud_machine::SshKeySpec;
use super::types::{Condition, HetznerSecretRef, SshSecretRef};

/// Port of the kube-apiserver behind the load balancer
pub const DEFAULT_API_SERVER_PORT: i32 = 6443;

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "HetznerCluster",
    namespaced,
    status = "HetznerClusterStatus",
    shortname = "capihc",
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Endpoint","type":"string","jsonPath":".spec.controlPlaneEndpoint.host"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct HetznerClusterSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_endpoint: Option<ApiEndpoint>,

    #[serde(default)]
    pub control_plane_load_balancer: LoadBalancerSpec,

    /// Locations eligible for control plane servers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub control_plane_regions: Vec<String>,

    #[serde(default)]
    pub ssh_keys: HetznerSshKeys,

    pub hetzner_secret_ref: HetznerSecretRef,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApiEndpoint {
    pub host: String,
    pub port: i32,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerSpec {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Generated from the cluster name when empty
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default = "default_lb_type", rename = "type")]
    pub type_: String,

    #[serde(default)]
    pub algorithm: LoadBalancerAlgorithm,

    #[serde(default)]
    pub region: String,

    #[serde(default = "default_api_server_port")]
    pub port: i32,

    /// Services forwarded in addition to the kube-apiserver
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_services: Vec<LoadBalancerServiceSpec>,
}

fn default_true() -> bool {
    true
}

fn default_lb_type() -> String {
    "lb11".to_string()
}

fn default_api_server_port() -> i32 {
    DEFAULT_API_SERVER_PORT
}

impl Default for LoadBalancerSpec {
    fn default() -> Self {
        Self {
            enabled: true,
            name: None,
            type_: default_lb_type(),
            algorithm: LoadBalancerAlgorithm::default(),
            region: String::new(),
            port: DEFAULT_API_SERVER_PORT,
            extra_services: Vec::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancerAlgorithm {
    #[default]
    RoundRobin,
    LeastConnections,
}

impl LoadBalancerAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::LeastConnections => "least_connections",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerServiceSpec {
    #[serde(default = "default_protocol")]
    pub protocol: String,
    pub listen_port: i32,
    pub destination_port: i32,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HetznerSshKeys {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hcloud: Vec<SshKeySpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub robot_rescue_secret_ref: Option<SshSecretRef>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HetznerClusterStatus {
    #[serde(default)]
    pub ready: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_load_balancer: Option<LoadBalancerStatus>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hcloud_placement_groups: Vec<PlacementGroupStatus>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub failure_domains: BTreeMap<String, FailureDomainSpec>,

    /// Robot servers known to the cluster, keyed by server number
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub bare_metal_inventory: BTreeMap<String, BareMetalMachineHostStatus>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    pub id: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ip_range: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attached_servers: Vec<i64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerStatus {
    pub id: i64,
    #[serde(default)]
    pub ipv4: String,
    #[serde(default)]
    pub ipv6: String,
    /// Empty when the cluster has no private network
    #[serde(default)]
    pub internal_ip: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target: Vec<LoadBalancerTargetStatus>,
    #[serde(default)]
    pub protected: bool,
}

impl LoadBalancerStatus {
    pub fn has_server_target(&self, server_id: i64) -> bool {
        self.target
            .iter()
            .any(|t| t.type_ == LoadBalancerTargetType::Server && t.server_id == Some(server_id))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LoadBalancerTargetType {
    Server,
    Ip,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerTargetStatus {
    #[serde(rename = "type")]
    pub type_: LoadBalancerTargetType,
    #[serde(default, rename = "serverID", skip_serializing_if = "Option::is_none")]
    pub server_id: Option<i64>,
    #[serde(default, rename = "ip", skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlacementGroupStatus {
    pub id: i64,
    pub name: String,
    #[serde(default = "default_placement_group_type", rename = "type")]
    pub type_: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub servers: Vec<i64>,
}

fn default_placement_group_type() -> String {
    "spread".to_string()
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FailureDomainSpec {
    #[serde(default)]
    pub control_plane: bool,
}
