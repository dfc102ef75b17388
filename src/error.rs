//! Error types for the Hetzner infrastructure provider

use thiserror::Error;

use crate::hcloud::HCloudError;
use crate::robot::RobotError;
use crate::ssh::SshError;

/// Result alias used throughout the crate
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("HCloud API error: {0}")]
    HCloudError(#[from] HCloudError),

    #[error("Robot API error: {0}")]
    RobotError(#[from] RobotError),

    #[error("SSH error: {0}")]
    SshError(#[from] SshError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Reconcile error: {0}")]
    ReconcileError(String),

    #[error("{}", join_errors(.0))]
    Aggregate(Vec<Error>),
}

fn join_errors(errors: &[Error]) -> String {
    let parts: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
    format!("[{}]", parts.join(", "))
}

impl Error {
    /// Prefix the error with context while keeping transient classification readable in logs.
    pub fn context(self, context: impl std::fmt::Display) -> Self {
        Error::ReconcileError(format!("{context}: {self}"))
    }

    /// Collapse a list of errors into one, `None` when the list is empty.
    pub fn aggregate(mut errors: Vec<Error>) -> Option<Error> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Error::Aggregate(errors)),
        }
    }

    /// Whether a retry with backoff is likely to succeed
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::KubeError(_) => true,
            Error::HCloudError(e) => e.is_rate_limit(),
            Error::RobotError(e) => e.is_rate_limit(),
            Error::SshError(e) => e.kind.is_transient(),
            Error::IoError(_) => true,
            Error::Aggregate(errors) => errors.iter().any(Error::is_retriable),
            _ => false,
        }
    }

    /// Whether the error carries a provider rate limit
    pub fn is_rate_limit(&self) -> bool {
        match self {
            Error::HCloudError(e) => e.is_rate_limit(),
            Error::RobotError(e) => e.is_rate_limit(),
            Error::Aggregate(errors) => errors.iter().any(Error::is_rate_limit),
            _ => false,
        }
    }
}
