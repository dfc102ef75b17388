//! Shared types for the infrastructure resources
//!
//! These types are used across the CRD definitions and the controller logic.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Severity of a condition that is not `True`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionSeverity {
    Error,
    Warning,
    Info,
}

/// Condition for status reporting (Kubernetes convention)
///
/// ```rust,no_run
/// use hetzner_k8s::crd::Condition;
///
/// let condition = Condition::new("HostReady", "True", "", "");
/// ```
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., "HostReady", "InstanceReady")
    #[serde(rename = "type")]
    pub type_: String,
    /// Status of the condition: "True", "False", or "Unknown"
    pub status: String,
    /// Last time the condition transitioned, RFC 3339
    pub last_transition_time: String,
    /// Machine-readable reason for the condition
    #[serde(default)]
    pub reason: String,
    /// Human-readable message
    #[serde(default)]
    pub message: String,
    /// Only set for conditions that are not `True`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<ConditionSeverity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    pub fn new(type_: &str, status: &str, reason: &str, message: &str) -> Self {
        Self {
            type_: type_.to_string(),
            status: status.to_string(),
            last_transition_time: now_rfc3339(),
            reason: reason.to_string(),
            message: message.to_string(),
            severity: None,
            observed_generation: None,
        }
    }

    /// Parsed `last_transition_time`, `None` when it is not a valid timestamp
    pub fn last_transition(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.last_transition_time)
    }
}

/// Reference to the object that consumes a host
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

/// Secret holding the provider credentials of a cluster
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HetznerSecretRef {
    pub name: String,
    #[serde(default)]
    pub key: HetznerSecretKeyRef,
}

/// Keys inside the credentials secret
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HetznerSecretKeyRef {
    #[serde(default = "default_hcloud_token_key")]
    pub hcloud_token: String,
    #[serde(default)]
    pub hetzner_robot_user: String,
    #[serde(default)]
    pub hetzner_robot_password: String,
}

fn default_hcloud_token_key() -> String {
    "hcloud".to_string()
}

impl Default for HetznerSecretKeyRef {
    fn default() -> Self {
        Self {
            hcloud_token: default_hcloud_token_key(),
            hetzner_robot_user: String::new(),
            hetzner_robot_password: String::new(),
        }
    }
}

/// Secret with the ssh key pair used for rescue or OS logins
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SshSecretRef {
    pub name: String,
    pub key: SshSecretKeyRef,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SshSecretKeyRef {
    pub name: String,
    pub public_key: String,
    pub private_key: String,
}

impl Default for SshSecretKeyRef {
    fn default() -> Self {
        Self {
            name: "sshkey-name".to_string(),
            public_key: "ssh-publickey".to_string(),
            private_key: "ssh-privatekey".to_string(),
        }
    }
}

/// Reference to a secret in a given namespace
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

/// Parse an RFC 3339 timestamp as written by [`now_rfc3339`].
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
