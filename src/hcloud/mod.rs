//! HCloud API surface consumed by the server, load balancer and remediation reconcilers
//!
//! Only the interface lives here. The HTTP client is wired in by the binary that embeds
//! the reconcilers; tests use the generated `MockHCloudClient`.

mod models;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

pub use models::*;

/// Error codes with a dedicated handling branch in the reconcilers
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HCloudErrorCode {
    RateLimitExceeded,
    NotFound,
    ServerAlreadyAttached,
    LoadBalancerAlreadyAttached,
    TargetAlreadyDefined,
    LoadBalancerTargetNotFound,
    Other(String),
}

impl HCloudErrorCode {
    pub fn from_api(code: &str) -> Self {
        match code {
            "rate_limit_exceeded" => Self::RateLimitExceeded,
            "not_found" => Self::NotFound,
            "server_already_attached" => Self::ServerAlreadyAttached,
            "load_balancer_already_attached" => Self::LoadBalancerAlreadyAttached,
            "target_already_defined" => Self::TargetAlreadyDefined,
            "load_balancer_target_not_found" => Self::LoadBalancerTargetNotFound,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::NotFound => "not_found",
            Self::ServerAlreadyAttached => "server_already_attached",
            Self::LoadBalancerAlreadyAttached => "load_balancer_already_attached",
            Self::TargetAlreadyDefined => "target_already_defined",
            Self::LoadBalancerTargetNotFound => "load_balancer_target_not_found",
            Self::Other(code) => code,
        }
    }
}

impl fmt::Display for HCloudErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Clone, Debug, PartialEq)]
#[error("{message} ({code})")]
pub struct HCloudError {
    pub code: HCloudErrorCode,
    pub message: String,
}

impl HCloudError {
    pub fn new(code: HCloudErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn is(&self, code: HCloudErrorCode) -> bool {
        self.code == code
    }

    pub fn is_rate_limit(&self) -> bool {
        self.is(HCloudErrorCode::RateLimitExceeded)
    }
}

pub type HCloudResult<T> = std::result::Result<T, HCloudError>;

/// Operations of the HCloud API used by this crate
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HCloudClient: Send + Sync {
    async fn list_servers(&self, label_selector: String) -> HCloudResult<Vec<Server>>;
    async fn get_server(&self, id: i64) -> HCloudResult<Option<Server>>;
    async fn create_server(&self, opts: ServerCreateOpts) -> HCloudResult<Server>;
    async fn power_on_server(&self, id: i64) -> HCloudResult<()>;
    async fn reboot_server(&self, id: i64) -> HCloudResult<()>;
    async fn shutdown_server(&self, id: i64) -> HCloudResult<()>;
    async fn delete_server(&self, id: i64) -> HCloudResult<()>;
    async fn attach_server_to_network(&self, server_id: i64, network_id: i64)
        -> HCloudResult<()>;

    async fn list_images(&self, opts: ImageListOpts) -> HCloudResult<Vec<Image>>;
    async fn list_ssh_keys(&self) -> HCloudResult<Vec<SshKey>>;

    async fn list_load_balancers(&self, label_selector: String)
        -> HCloudResult<Vec<LoadBalancer>>;
    async fn create_load_balancer(&self, opts: LoadBalancerCreateOpts)
        -> HCloudResult<LoadBalancer>;
    async fn delete_load_balancer(&self, id: i64) -> HCloudResult<()>;
    async fn change_load_balancer_type(&self, id: i64, lb_type: String) -> HCloudResult<()>;
    async fn change_load_balancer_algorithm(&self, id: i64, algorithm: String)
        -> HCloudResult<()>;
    async fn update_load_balancer_name(&self, id: i64, name: String) -> HCloudResult<()>;
    async fn attach_load_balancer_to_network(&self, id: i64, network_id: i64)
        -> HCloudResult<()>;
    async fn add_load_balancer_service(
        &self,
        id: i64,
        service: LoadBalancerService,
    ) -> HCloudResult<()>;
    async fn delete_load_balancer_service(&self, id: i64, listen_port: i32) -> HCloudResult<()>;
    async fn add_server_target(
        &self,
        lb_id: i64,
        server_id: i64,
        use_private_ip: bool,
    ) -> HCloudResult<()>;
    async fn delete_server_target(&self, lb_id: i64, server_id: i64) -> HCloudResult<()>;
}

/// `key==value` pairs joined by commas, in key order
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(key, value)| format!("{key}=={value}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Provider ID scheme for HCloud servers
pub const PROVIDER_ID_PREFIX: &str = "hcloud://";

pub fn provider_id_from_server_id(id: i64) -> String {
    format!("{PROVIDER_ID_PREFIX}{id}")
}

/// Parse `hcloud://<id>` back into a server ID.
pub fn server_id_from_provider_id(provider_id: Option<&str>) -> crate::Result<i64> {
    let provider_id = match provider_id {
        Some(p) if !p.is_empty() => p,
        _ => {
            return Err(crate::Error::ValidationError(
                "providerID is empty".to_string(),
            ))
        }
    };
    let id = provider_id.strip_prefix(PROVIDER_ID_PREFIX).ok_or_else(|| {
        crate::Error::ValidationError(format!("providerID is invalid: {provider_id}"))
    })?;
    id.parse::<i64>().map_err(|_| {
        crate::Error::ValidationError(format!("providerID has invalid server ID: {provider_id}"))
    })
}
