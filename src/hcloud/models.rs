//! HCloud API objects as seen by the reconcilers

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Initializing,
    Starting,
    Running,
    Stopping,
    Off,
    Deleting,
    Migrating,
    Rebuilding,
    Unknown,
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServerStatus::Initializing => "initializing",
            ServerStatus::Starting => "starting",
            ServerStatus::Running => "running",
            ServerStatus::Stopping => "stopping",
            ServerStatus::Off => "off",
            ServerStatus::Deleting => "deleting",
            ServerStatus::Migrating => "migrating",
            ServerStatus::Rebuilding => "rebuilding",
            ServerStatus::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PublicNet {
    pub ipv4: Option<String>,
    /// IPv6 network in CIDR notation, e.g. `2a01:4f8:1c1a:1234::/64`
    pub ipv6_network: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PrivateNet {
    pub network_id: i64,
    pub ip: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub id: i64,
    pub name: String,
    pub status: ServerStatus,
    #[serde(default)]
    pub public_net: PublicNet,
    #[serde(default)]
    pub private_net: Vec<PrivateNet>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SshKey {
    pub id: i64,
    pub name: String,
    pub fingerprint: String,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ServerCreateOpts {
    pub name: String,
    pub server_type: String,
    pub image_id: i64,
    pub location: String,
    pub placement_group_id: Option<i64>,
    pub ssh_key_ids: Vec<i64>,
    pub network_ids: Vec<i64>,
    pub labels: BTreeMap<String, String>,
    pub user_data: String,
    pub automount: bool,
    pub start_after_create: bool,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ImageListOpts {
    pub label_selector: Option<String>,
    pub name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancerService {
    pub protocol: String,
    pub listen_port: i32,
    pub destination_port: i32,
    pub proxyprotocol: bool,
}

impl LoadBalancerService {
    pub fn tcp(listen_port: i32, destination_port: i32) -> Self {
        Self {
            protocol: "tcp".to_string(),
            listen_port,
            destination_port,
            proxyprotocol: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadBalancerTarget {
    Server { id: i64, use_private_ip: bool },
    Ip(String),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancer {
    pub id: i64,
    pub name: String,
    pub lb_type: String,
    pub algorithm: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub ipv4: Option<String>,
    pub ipv6: Option<String>,
    #[serde(default)]
    pub private_net: Vec<PrivateNet>,
    #[serde(default)]
    pub services: Vec<LoadBalancerService>,
    #[serde(default)]
    pub targets: Vec<LoadBalancerTarget>,
    pub protection_delete: bool,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct LoadBalancerCreateOpts {
    pub name: String,
    pub lb_type: String,
    pub algorithm: String,
    pub location: String,
    pub network_id: Option<i64>,
    pub labels: BTreeMap<String, String>,
    pub services: Vec<LoadBalancerService>,
}
