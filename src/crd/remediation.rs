//! Remediation Custom Resource Definitions
//!
//! HCloudRemediation and HetznerBareMetalRemediation are created by a MachineHealthCheck for an
//! unhealthy machine. Both share strategy and status.

use std::time::Duration;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{parse_timestamp, Condition};

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "HCloudRemediation",
    namespaced,
    status = "RemediationStatus",
    shortname = "hcr",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Retries","type":"integer","jsonPath":".status.retryCount"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct HCloudRemediationSpec {
    pub strategy: RemediationStrategy,
}

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "HetznerBareMetalRemediation",
    namespaced,
    status = "RemediationStatus",
    shortname = "hbmr",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Retries","type":"integer","jsonPath":".status.retryCount"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct HetznerBareMetalRemediationSpec {
    pub strategy: RemediationStrategy,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RemediationStrategy {
    /// Only `Reboot` is supported
    #[serde(rename = "type", default = "default_remediation_type")]
    pub type_: String,

    /// Reboots after the first one
    #[serde(default)]
    pub retry_limit: i32,

    /// Time between reboots, Go duration syntax such as `5m` or `300s`
    #[serde(default = "default_timeout")]
    pub timeout: String,
}

pub const REMEDIATION_TYPE_REBOOT: &str = "Reboot";

fn default_remediation_type() -> String {
    REMEDIATION_TYPE_REBOOT.to_string()
}

fn default_timeout() -> String {
    "5m0s".to_string()
}

impl RemediationStrategy {
    pub fn timeout(&self) -> Result<Duration, String> {
        parse_duration(&self.timeout)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum RemediationPhase {
    Running,
    Waiting,
    /// Handed back to the machine controller, which deletes the machine
    #[serde(rename = "Deleting machine")]
    Deleting,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RemediationStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<RemediationPhase>,

    #[serde(default)]
    pub retry_count: i32,

    /// RFC 3339 time of the last reboot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_remediated: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl RemediationStatus {
    pub fn last_remediated(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.last_remediated.as_deref().and_then(parse_timestamp)
    }
}

/// Parse a Go style duration (`1h30m`, `5m0s`, `300s`, `1.5s`, `250ms`).
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    if value == "0" {
        return Ok(Duration::ZERO);
    }
    if value.is_empty() {
        return Err("empty duration".to_string());
    }

    let mut total = 0f64;
    let mut rest = value;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| format!("missing unit in duration {value:?}"))?;
        if number_len == 0 {
            return Err(format!("invalid duration {value:?}"));
        }
        let number: f64 = rest[..number_len]
            .parse()
            .map_err(|_| format!("invalid duration {value:?}"))?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let seconds_per_unit = match &rest[..unit_len] {
            "h" => 3600.0,
            "m" => 60.0,
            "s" => 1.0,
            "ms" => 0.001,
            unit => return Err(format!("unknown unit {unit:?} in duration {value:?}")),
        };
        rest = &rest[unit_len..];
        total += number * seconds_per_unit;
    }
    Duration::try_from_secs_f64(total)
        .map_err(|e| format!("duration {value:?} out of range: {e}"))
}
