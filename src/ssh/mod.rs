//! Remote command execution on bare-metal hosts
//!
//! Every operation opens a fresh session, runs one shell snippet and closes it again.
//! Callers get an [`Output`] back and decide themselves how to treat failures; the few
//! operations with richer results (install image state, disk checks) return `Result`.

mod client;
mod cloud_init;
mod credentials;
pub mod transport;

use std::fmt;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

pub use client::{is_valid_wwn, RemoteClient, RemoteClientFactory};
pub use cloud_init::remove_useless_lines_from_cloud_init_output;
pub use credentials::Credentials;

/// Where and how to connect
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Input {
    pub ip: String,
    pub private_key: String,
    pub port: u16,
}

/// Failure classes the reconcilers branch on
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SshErrorKind {
    ConnectionRefused,
    AuthenticationFailed,
    Timeout,
    /// The remote command ran and exited non-zero
    ExitStatus(u32),
    /// The session ended before an exit status arrived, typical for `reboot`
    ExitedWithoutStatus,
    EmptyStdOut,
    BrokenDisk,
    InvalidWwn,
    Other,
}

impl SshErrorKind {
    /// Map free-form error text from the transport onto a known kind.
    pub fn classify(text: &str) -> Self {
        let lower = text.to_lowercase();
        if lower.contains("connection refused") {
            Self::ConnectionRefused
        } else if lower.contains("unable to authenticate") || lower.contains("permission denied") {
            Self::AuthenticationFailed
        } else if lower.contains("i/o timeout") || lower.contains("timed out") {
            Self::Timeout
        } else if lower.contains("exited without exit status")
            || lower.contains("closed by remote host")
        {
            Self::ExitedWithoutStatus
        } else if let Some(status) = lower
            .strip_prefix("process exited with status ")
            .and_then(|s| s.trim().parse::<u32>().ok())
        {
            Self::ExitStatus(status)
        } else {
            Self::Other
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectionRefused | Self::Timeout | Self::ExitedWithoutStatus
        )
    }
}

impl fmt::Display for SshErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionRefused => f.write_str("connect: connection refused"),
            Self::AuthenticationFailed => f.write_str("ssh: unable to authenticate"),
            Self::Timeout => f.write_str("i/o timeout"),
            Self::ExitStatus(status) => write!(f, "Process exited with status {status}"),
            Self::ExitedWithoutStatus => {
                f.write_str("wait: remote command exited without exit status or exit signal")
            }
            Self::EmptyStdOut => f.write_str("unexpected empty output in stdout"),
            Self::BrokenDisk => f.write_str("CheckDisk failed"),
            Self::InvalidWwn => write!(f, "WWN does not match regex {:?}", client::WWN_PATTERN),
            Self::Other => f.write_str("ssh command failed"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SshError {
    pub kind: SshErrorKind,
    pub message: String,
}

impl SshError {
    pub fn new(kind: SshErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn from_kind(kind: SshErrorKind) -> Self {
        Self::new(kind, "")
    }

    /// Error whose kind is derived from its text
    pub fn classified(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(SshErrorKind::classify(&message), message)
    }

    /// Prepend context, keeping the kind.
    pub fn wrap(self, context: impl fmt::Display) -> Self {
        let message = if self.message.is_empty() {
            context.to_string()
        } else {
            format!("{context}: {}", self.message)
        };
        Self::new(self.kind, message)
    }

    pub fn is(&self, kind: &SshErrorKind) -> bool {
        &self.kind == kind
    }
}

impl fmt::Display for SshError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.kind, self.message.is_empty()) {
            (_, true) => write!(f, "{}", self.kind),
            (SshErrorKind::Other, false) => f.write_str(&self.message),
            (kind, false) => write!(f, "{}: {kind}", self.message),
        }
    }
}

impl std::error::Error for SshError {}

/// Result of one remote command
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Output {
    pub stdout: String,
    pub stderr: String,
    pub err: Option<SshError>,
}

impl Output {
    pub fn from_err(err: SshError) -> Self {
        Self {
            err: Some(err),
            ..Default::default()
        }
    }

    pub fn stdout(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Default::default()
        }
    }

    /// Exit status of the remote command.
    ///
    /// `Ok(0)` on success, `Ok(n)` when the command ran and exited non-zero, `Err` when the
    /// command could not be run at all.
    pub fn exit_status(&self) -> Result<u32, SshError> {
        match &self.err {
            None => Ok(0),
            Some(SshError {
                kind: SshErrorKind::ExitStatus(status),
                ..
            }) => Ok(*status),
            Some(err) => Err(err.clone()),
        }
    }

    pub fn err_is(&self, kind: &SshErrorKind) -> bool {
        self.err.as_ref().is_some_and(|e| e.is(kind))
    }
}

impl fmt::Display for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = Vec::with_capacity(3);
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            parts.push(stdout.to_string());
        }
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            if parts.is_empty() {
                parts.push(stderr.to_string());
            } else {
                parts.push(format!("Stderr: {stderr}"));
            }
        }
        if let Some(err) = &self.err {
            let err = err.to_string();
            let err = err.trim();
            if parts.is_empty() {
                parts.push(err.to_string());
            } else {
                parts.push(format!("Err: {err}"));
            }
        }
        f.write_str(&parts.join(". "))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstallImageState {
    NotStartedYet,
    Running,
    Finished,
}

impl fmt::Display for InstallImageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStartedYet => f.write_str("not-started-yet"),
            Self::Running => f.write_str("running"),
            Self::Finished => f.write_str("finished"),
        }
    }
}

/// Catalog of remote operations run against a single host
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SshClient: Send + Sync {
    async fn get_hostname(&self) -> Output;
    async fn get_hardware_details_ram(&self) -> Output;
    async fn get_hardware_details_nics(&self) -> Output;
    async fn get_hardware_details_storage(&self) -> Output;
    async fn get_hardware_details_cpu_arch(&self) -> Output;
    async fn get_hardware_details_cpu_model(&self) -> Output;
    async fn get_hardware_details_cpu_clock_gigahertz(&self) -> Output;
    async fn get_hardware_details_cpu_flags(&self) -> Output;
    async fn get_hardware_details_cpu_threads(&self) -> Output;
    async fn get_hardware_details_cpu_cores(&self) -> Output;
    async fn get_hardware_details_debug(&self) -> Output;
    async fn get_install_image_state(&self) -> Result<InstallImageState, SshError>;
    /// Only meaningful once installimage has terminated.
    async fn get_result_of_install_image(&self) -> Result<String, SshError>;
    async fn get_cloud_init_output(&self) -> Output;
    async fn create_auto_setup(&self, data: String) -> Output;
    async fn download_image(&self, path: String, url: String) -> Output;
    async fn create_post_install_script(&self, data: String) -> Output;
    async fn execute_install_image(&self, has_post_install_script: bool) -> Output;
    async fn reboot(&self) -> Output;
    async fn cloud_init_status(&self) -> Output;
    async fn check_cloud_init_logs_for_sigterm(&self) -> Output;
    async fn clean_cloud_init_logs(&self) -> Output;
    async fn clean_cloud_init_instances(&self) -> Output;
    async fn reset_kubeadm(&self) -> Output;
    async fn untar_tgz(&self) -> Output;
    async fn detect_linux_on_another_disk(&self, wwns: Vec<String>) -> Output;
    /// Erase filesystem, raid and partition-table signatures. `"all"` wipes every disk.
    async fn wipe_disk(&self, wwns: Vec<String>) -> Result<String, SshError>;
    /// SMART check; a broken disk yields [`SshErrorKind::BrokenDisk`].
    async fn check_disk(&self, wwns: Vec<String>) -> Result<String, SshError>;
    /// Copy a local script to the host and run it, returning exit status and combined output.
    async fn execute_pre_provision_command(&self, command: String)
        -> Result<(u32, String), SshError>;
}

/// Builds clients bound to one host
#[cfg_attr(test, automock)]
pub trait SshClientFactory: Send + Sync {
    fn new_client(&self, input: Input) -> Box<dyn SshClient>;
}
