//! Robot (bare-metal) API surface consumed by the host and inventory reconcilers

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

use crate::crd::RebootType;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RobotErrorCode {
    ServerNotFound,
    NotFound,
    KeyAlreadyExists,
    RateLimitExceeded,
    Other(String),
}

impl RobotErrorCode {
    pub fn from_api(code: &str) -> Self {
        match code {
            "SERVER_NOT_FOUND" => Self::ServerNotFound,
            "NOT_FOUND" => Self::NotFound,
            "KEY_ALREADY_EXISTS" => Self::KeyAlreadyExists,
            "RATE_LIMIT_EXCEEDED" => Self::RateLimitExceeded,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for RobotErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ServerNotFound => f.write_str("SERVER_NOT_FOUND"),
            Self::NotFound => f.write_str("NOT_FOUND"),
            Self::KeyAlreadyExists => f.write_str("KEY_ALREADY_EXISTS"),
            Self::RateLimitExceeded => f.write_str("RATE_LIMIT_EXCEEDED"),
            Self::Other(code) => f.write_str(code),
        }
    }
}

/// Robot answers throttled requests with a bare 403 instead of a coded error.
const FORBIDDEN_MESSAGE: &str = "server responded with status code 403";

#[derive(Error, Clone, Debug, PartialEq)]
#[error("{code}: {message}")]
pub struct RobotError {
    pub code: RobotErrorCode,
    pub message: String,
}

impl RobotError {
    pub fn new(code: RobotErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn is(&self, code: RobotErrorCode) -> bool {
        self.code == code
    }

    pub fn is_rate_limit(&self) -> bool {
        self.code == RobotErrorCode::RateLimitExceeded || self.message.contains(FORBIDDEN_MESSAGE)
    }
}

pub type RobotResult<T> = std::result::Result<T, RobotError>;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RobotServer {
    pub server_number: i32,
    pub server_name: String,
    pub server_ip: String,
    /// IPv6 network prefix ending in `::`
    pub server_ipv6_net: String,
    pub status: String,
    pub dc: String,
    pub paid_until: String,
    pub rescue: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RobotSshKey {
    pub name: String,
    pub fingerprint: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Rescue {
    pub active: bool,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait RobotClient: Send + Sync {
    async fn get_bm_server(&self, server_id: i32) -> RobotResult<RobotServer>;
    async fn set_bm_server_name(&self, server_id: i32, name: String) -> RobotResult<()>;
    /// Reboot methods supported by the server, as reported by the API
    async fn get_reboot(&self, server_id: i32) -> RobotResult<Vec<RebootType>>;
    async fn reboot_bm_server(&self, server_id: i32, reboot_type: RebootType) -> RobotResult<()>;
    async fn get_boot_rescue(&self, server_id: i32) -> RobotResult<Rescue>;
    async fn set_boot_rescue(&self, server_id: i32, fingerprint: String) -> RobotResult<()>;
    async fn delete_boot_rescue(&self, server_id: i32) -> RobotResult<()>;
    async fn list_ssh_keys(&self) -> RobotResult<Vec<RobotSshKey>>;
    async fn set_ssh_key(&self, name: String, public_key: String) -> RobotResult<RobotSshKey>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forbidden_counts_as_rate_limit() {
        let err = RobotError::new(
            RobotErrorCode::Other("UNKNOWN".into()),
            "server responded with status code 403",
        );
        assert!(err.is_rate_limit());
        assert!(!RobotError::new(RobotErrorCode::NotFound, "gone").is_rate_limit());
    }

    #[test]
    fn codes_map_from_api() {
        assert_eq!(
            RobotErrorCode::from_api("KEY_ALREADY_EXISTS"),
            RobotErrorCode::KeyAlreadyExists
        );
        assert_eq!(RobotErrorCode::ServerNotFound.to_string(), "SERVER_NOT_FOUND");
    }
}
