//! Runtime settings shared by the reconcilers and the SSH transport

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

use crate::error::{Error, Result};

/// Operator settings, read from flags or the environment
#[derive(Args, Clone, Debug)]
pub struct Settings {
    /// ssh client binary used to reach bare-metal hosts
    #[arg(long, env = "SSH_BINARY", default_value = "ssh")]
    pub ssh_binary: String,

    /// Seconds to wait for an ssh connection to be established
    #[arg(long, env = "SSH_DIAL_TIMEOUT_SECONDS", default_value_t = 5)]
    pub ssh_dial_timeout_seconds: u64,

    /// Seconds a single remote command may run
    #[arg(long, env = "SSH_COMMAND_TIMEOUT_SECONDS", default_value_t = 300)]
    pub ssh_command_timeout_seconds: u64,

    /// Token handed to the OCI image download script on the rescue system
    #[arg(long, env = "OCI_REGISTRY_AUTH_TOKEN", default_value = "", hide_env_values = true)]
    pub oci_registry_auth_token: String,

    /// installimage tarball uploaded to the rescue system before installing
    #[arg(long, env = "INSTALLIMAGE_TGZ_PATH", default_value = "/installimage.tgz")]
    pub installimage_tgz_path: PathBuf,

    /// Local script executed on the rescue system before provisioning starts
    #[arg(long, env = "PRE_PROVISION_COMMAND")]
    pub pre_provision_command: Option<PathBuf>,

    /// Requeue interval after the Robot API rate limit was hit
    #[arg(long, env = "ROBOT_RATE_LIMIT_REQUEUE_SECONDS", default_value_t = 660)]
    pub robot_rate_limit_requeue_seconds: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ssh_binary: "ssh".to_string(),
            ssh_dial_timeout_seconds: 5,
            ssh_command_timeout_seconds: 300,
            oci_registry_auth_token: String::new(),
            installimage_tgz_path: PathBuf::from("/installimage.tgz"),
            pre_provision_command: None,
            robot_rate_limit_requeue_seconds: 660,
        }
    }
}

impl Settings {
    pub fn ssh_dial_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_dial_timeout_seconds)
    }

    pub fn ssh_command_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_command_timeout_seconds)
    }

    pub fn robot_rate_limit_requeue(&self) -> Duration {
        Duration::from_secs(self.robot_rate_limit_requeue_seconds)
    }

    /// Reject settings the reconcilers cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.ssh_binary.trim().is_empty() {
            return Err(Error::ConfigError("ssh binary must not be empty".to_string()));
        }
        if self.ssh_dial_timeout_seconds == 0 {
            return Err(Error::ConfigError(
                "ssh dial timeout must be at least one second".to_string(),
            ));
        }
        if self.ssh_command_timeout_seconds < self.ssh_dial_timeout_seconds {
            return Err(Error::ConfigError(format!(
                "ssh command timeout ({}s) is shorter than the dial timeout ({}s)",
                self.ssh_command_timeout_seconds, self.ssh_dial_timeout_seconds
            )));
        }
        if let Some(command) = &self.pre_provision_command {
            if !command.is_file() {
                return Err(Error::ConfigError(format!(
                    "pre-provision command {} is not a file",
                    command.display()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.ssh_dial_timeout(), Duration::from_secs(5));
        assert_eq!(settings.robot_rate_limit_requeue(), Duration::from_secs(660));
    }

    #[test]
    fn command_timeout_must_cover_dial() {
        let settings = Settings {
            ssh_command_timeout_seconds: 1,
            ..Default::default()
        };
        assert!(matches!(settings.validate(), Err(Error::ConfigError(_))));
    }

    #[test]
    fn missing_pre_provision_script_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            pre_provision_command: Some(dir.path().join("missing.sh")),
            ..Default::default()
        };
        assert!(settings.validate().is_err());

        let script = dir.path().join("check.sh");
        std::fs::write(&script, "#!/bin/sh\nexit 0\n").unwrap();
        let settings = Settings {
            pre_provision_command: Some(script),
            ..Default::default()
        };
        assert!(settings.validate().is_ok());
    }
}
