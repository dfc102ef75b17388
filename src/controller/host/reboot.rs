//! Reboots and the escalation of reboots that do not come back in time
//!
//! A triggered reboot is remembered as the host's error type. When the expected hostname does
//! not show up, the next reconcile escalates: ssh reboot, then a software reset via the API,
//! then hardware resets until the host answers.

use std::time::Duration;

use chrono::Utc;
use thiserror::Error as ThisError;

use super::hardware::trim_line_break;
use super::{
    HostService, CONNECTION_REFUSED_TIMEOUT, HARDWARE_RESET_TIMEOUT, REBOOT_WAIT_TIME,
    SOFTWARE_RESET_TIMEOUT, SSH_RESET_TIMEOUT,
};
use crate::controller::conditions::{
    mark_false, PROVISION_SUCCEEDED_CONDITION, SSH_CONNECTION_REFUSED_REASON,
};
use crate::crd::{
    now_rfc3339, parse_timestamp, ConditionSeverity, ErrorType, RebootType, RESCUE_HOSTNAME,
};
use crate::error::{Error, Result};
use crate::ssh::{Output, SshError, SshErrorKind};

/// Outcome of [`HostService::handle_incomplete_boot`]
#[derive(Debug, PartialEq, Eq)]
pub(super) enum BootCheck {
    /// Keep waiting, a reboot may have been escalated
    Waiting,
    /// Give up, the message is recorded as action failure
    Failed(String),
}

/// How a hostname check over ssh went wrong
#[derive(Debug, ThisError)]
pub(super) enum HostnameError {
    #[error("wrong ssh key: {0}")]
    WrongSshKey(SshError),
    #[error("unhandled ssh error while getting hostname: {0}")]
    Unhandled(SshError),
    #[error("failed to get hostname via ssh: StdErr: {0}")]
    Stderr(String),
    #[error("hostname is empty")]
    Empty,
    #[error("unexpected hostname: {0}")]
    Unexpected(String),
    #[error("failed to check whether reboot triggered: {0}")]
    RebootCheck(Error),
}

/// Transport symptoms of a host that is not (yet) reachable
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(super) struct BootProbe {
    pub timeout: bool,
    pub connection_refused: bool,
}

/// Classify a hostname check against an installed OS that did not answer with its hostname.
pub(super) fn analyze_ssh_output_provisioned(out: &Output) -> Result<BootProbe, HostnameError> {
    if let Some(err) = &out.err {
        return match err.kind {
            SshErrorKind::Timeout => Ok(BootProbe {
                timeout: true,
                ..Default::default()
            }),
            SshErrorKind::AuthenticationFailed => Err(HostnameError::WrongSshKey(err.clone())),
            SshErrorKind::ConnectionRefused => Ok(BootProbe {
                connection_refused: true,
                ..Default::default()
            }),
            _ => Err(HostnameError::Unhandled(err.clone())),
        };
    }
    if !out.stderr.is_empty() {
        return Err(HostnameError::Stderr(out.stderr.clone()));
    }
    match trim_line_break(&out.stdout) {
        "" => Err(HostnameError::Empty),
        // Booted into the rescue system, a reboot brings it back.
        RESCUE_HOSTNAME => Ok(BootProbe::default()),
        other => Err(HostnameError::Unexpected(other.to_string())),
    }
}

/// Whether `timeout` passed since `last_updated`. A missing timestamp counts as timed out.
pub(super) fn has_timed_out(last_updated: Option<&str>, timeout: Duration) -> bool {
    let Some(last) = last_updated.and_then(parse_timestamp) else {
        return true;
    };
    last + chrono::Duration::seconds(timeout.as_secs() as i64) < Utc::now()
}

impl HostService<'_> {
    /// Classify a hostname check against the rescue system.
    pub(super) async fn analyze_ssh_output_registering(
        &mut self,
        out: &Output,
    ) -> Result<BootProbe, HostnameError> {
        if let Some(err) = &out.err {
            // Rescue is deactivated by the Robot API once the server booted into it.
            let reboot_triggered = self.reboot_triggered().await.map_err(HostnameError::RebootCheck)?;
            return match err.kind {
                SshErrorKind::Timeout => Ok(BootProbe {
                    timeout: true,
                    ..Default::default()
                }),
                SshErrorKind::AuthenticationFailed if !reboot_triggered => Ok(BootProbe::default()),
                SshErrorKind::AuthenticationFailed => Err(HostnameError::WrongSshKey(err.clone())),
                SshErrorKind::ConnectionRefused
                    if !reboot_triggered
                        && self.scope.host.spec.status.error_type
                            != ErrorType::HardwareRebootTriggered =>
                {
                    Ok(BootProbe::default())
                }
                SshErrorKind::ConnectionRefused => Ok(BootProbe {
                    connection_refused: true,
                    ..Default::default()
                }),
                _ => Err(HostnameError::Unhandled(err.clone())),
            };
        }
        if !out.stderr.is_empty() {
            return Err(HostnameError::Stderr(out.stderr.clone()));
        }
        if trim_line_break(&out.stdout).is_empty() {
            return Err(HostnameError::Empty);
        }
        Ok(BootProbe::default())
    }

    async fn reboot_triggered(&mut self) -> Result<bool> {
        let server_id = self.scope.host.spec.server_id;
        match self.scope.robot.get_boot_rescue(server_id).await {
            Ok(rescue) => Ok(!rescue.active),
            Err(e) => Err(self
                .robot_call_failed(e, "GetBootRescue", "failed to get boot rescue")
                .await),
        }
    }

    fn last_updated(&self) -> Option<&str> {
        self.scope.host.spec.status.last_updated.as_deref()
    }

    /// A reboot was triggered moments ago, checking the hostname would only trigger it again.
    pub(super) fn has_just_rebooted(&self) -> bool {
        matches!(
            self.scope.host.spec.status.error_type,
            ErrorType::SshRebootTriggered
                | ErrorType::SoftwareRebootTriggered
                | ErrorType::HardwareRebootTriggered
        ) && !has_timed_out(self.last_updated(), REBOOT_WAIT_TIME)
    }

    /// Software reset if the server offers one, otherwise hardware reset
    pub(super) fn reboot_and_error_type_after_timeout(&self) -> Result<(RebootType, ErrorType)> {
        let reboot_types = &self.scope.host.spec.status.reboot_types;
        if reboot_types.contains(&RebootType::Software) {
            Ok((RebootType::Software, ErrorType::SoftwareRebootTriggered))
        } else if reboot_types.contains(&RebootType::Hardware) {
            Ok((RebootType::Hardware, ErrorType::HardwareRebootTriggered))
        } else {
            Err(Error::ReconcileError(
                "no software or hardware reboot available for host".to_string(),
            ))
        }
    }

    /// Publish a reboot event and return its message.
    pub(super) async fn create_reboot_event(&self, reboot_type: RebootType, message: &str) -> String {
        let state = self.scope.host.spec.status.provisioning_state;
        let reason = format!(
            "RebootBMServerVia{}ProvisioningState{}",
            reboot_type.verbose(),
            state.upper_camel_case()
        );
        let message = format!("Phase {state}, reboot via {}: {message}", reboot_type.verbose());
        self.scope.recorder.normal(&reason, &message).await;
        message
    }

    pub(super) async fn create_ssh_reboot_event(&self, message: &str) -> String {
        self.create_reboot_event(RebootType::Ssh, message).await
    }

    /// Drop a stale rescue activation and activate it again with the current key.
    pub(super) async fn enforce_rescue_mode(&mut self) -> Result<()> {
        let server_id = self.scope.host.spec.server_id;
        if let Err(e) = self.scope.robot.delete_boot_rescue(server_id).await {
            return Err(self
                .robot_call_failed(e, "DeleteBootRescue", "failed to delete boot rescue")
                .await);
        }
        let fingerprint = self.rescue_fingerprint();
        if let Err(e) = self.scope.robot.set_boot_rescue(server_id, fingerprint).await {
            return Err(self
                .robot_call_failed(e, "SetBootRescue", "failed to set boot rescue")
                .await);
        }
        Ok(())
    }

    /// Activate the rescue system unless it is still active.
    pub(super) async fn ensure_rescue_mode(&mut self) -> Result<()> {
        let server_id = self.scope.host.spec.server_id;
        let rescue = match self.scope.robot.get_boot_rescue(server_id).await {
            Ok(rescue) => rescue,
            Err(e) => {
                return Err(self
                    .robot_call_failed(e, "GetBootRescue", "failed to get boot rescue")
                    .await)
            }
        };
        if !rescue.active {
            let fingerprint = self.rescue_fingerprint();
            if let Err(e) = self.scope.robot.set_boot_rescue(server_id, fingerprint).await {
                return Err(self
                    .robot_call_failed(e, "SetBootRescue", "failed to set boot rescue")
                    .await);
            }
        }
        Ok(())
    }

    fn rescue_fingerprint(&self) -> String {
        self.scope
            .host
            .spec
            .status
            .ssh_status
            .rescue_key
            .as_ref()
            .map(|k| k.fingerprint.clone())
            .unwrap_or_default()
    }

    async fn reboot_via_api(&mut self, reboot_type: RebootType) -> Result<()> {
        let server_id = self.scope.host.spec.server_id;
        if let Err(e) = self.scope.robot.reboot_bm_server(server_id, reboot_type).await {
            return Err(self
                .robot_call_failed(e, "RebootBMServer", "failed to reboot bare metal server")
                .await);
        }
        Ok(())
    }

    /// React on a host that did not come up with the expected hostname.
    pub(super) async fn handle_incomplete_boot(
        &mut self,
        rescue: bool,
        timeout: bool,
        connection_refused: bool,
    ) -> Result<BootCheck> {
        let error_type = self.scope.host.spec.status.error_type;

        // Refused connections are normal right after a reboot, only a lasting refusal fails.
        if connection_refused {
            if error_type == ErrorType::ConnectionError {
                if has_timed_out(self.last_updated(), CONNECTION_REFUSED_TIMEOUT) {
                    let message = if rescue {
                        "Connection error. Can't reach rescue system via ssh."
                    } else {
                        "Connection error when targeting server with ssh that might be due to a wrong ssh port. Please check."
                    };
                    mark_false(
                        &mut self.scope.host.spec.status.conditions,
                        PROVISION_SUCCEEDED_CONDITION,
                        SSH_CONNECTION_REFUSED_REASON,
                        ConditionSeverity::Error,
                        message,
                    );
                    self.scope.recorder.warn("SSHConnectionError", message).await;
                    return Ok(BootCheck::Failed(
                        "ssh connection refused - might be due to wrong port".to_string(),
                    ));
                }
            } else {
                self.scope
                    .host
                    .set_error(ErrorType::ConnectionError, "ssh gave connection error");
            }
            return Ok(BootCheck::Waiting);
        }

        if error_type == ErrorType::ConnectionError {
            self.scope.host.clear_error();
        }

        match self.scope.host.spec.status.error_type {
            ErrorType::None => {
                if timeout {
                    // Server is still rebooting, start tracking it.
                    self.scope.host.set_error(
                        ErrorType::SshRebootTriggered,
                        "ssh timeout error - server has not restarted yet",
                    );
                    return Ok(BootCheck::Waiting);
                }
                self.handle_ssh_reboot_failed(timeout, rescue).await?;
            }
            ErrorType::SshRebootTriggered => self.handle_ssh_reboot_failed(timeout, rescue).await?,
            ErrorType::SoftwareRebootTriggered => {
                self.handle_software_reboot_failed(timeout, rescue).await?
            }
            ErrorType::HardwareRebootTriggered => {
                self.handle_hardware_reboot_failed(timeout, rescue).await?
            }
            other => {
                return Err(Error::ReconcileError(format!(
                    "unexpected error type: {other}"
                )))
            }
        }
        Ok(BootCheck::Waiting)
    }

    async fn handle_ssh_reboot_failed(&mut self, timeout: bool, rescue: bool) -> Result<()> {
        if timeout && !has_timed_out(self.last_updated(), SSH_RESET_TIMEOUT) {
            return Ok(());
        }
        if rescue {
            self.ensure_rescue_mode()
                .await
                .map_err(|e| e.context("failed to ensure rescue mode"))?;
        }
        let (reboot_type, error_type) = self.reboot_and_error_type_after_timeout()?;
        self.reboot_via_api(reboot_type).await?;

        let message = format!(
            "Reboot via ssh into {} failed. Now using rebootType {:?}.",
            reboot_target(rescue),
            reboot_type.as_str()
        );
        let message = self.create_reboot_event(reboot_type, &message).await;
        self.scope.host.set_error(error_type, message);
        Ok(())
    }

    async fn handle_software_reboot_failed(&mut self, timeout: bool, rescue: bool) -> Result<()> {
        if timeout && !has_timed_out(self.last_updated(), SOFTWARE_RESET_TIMEOUT) {
            return Ok(());
        }
        if rescue {
            self.ensure_rescue_mode()
                .await
                .map_err(|e| e.context("failed to ensure rescue mode"))?;
        }
        self.reboot_via_api(RebootType::Hardware).await?;

        let message = format!(
            "Reboot via type 'software' into {} failed. Now using rebootType {:?}.",
            reboot_target(rescue),
            RebootType::Hardware.as_str()
        );
        let message = self.create_reboot_event(RebootType::Hardware, &message).await;
        self.scope
            .host
            .set_error(ErrorType::HardwareRebootTriggered, message);
        Ok(())
    }

    async fn handle_hardware_reboot_failed(&mut self, timeout: bool, rescue: bool) -> Result<()> {
        if timeout && !has_timed_out(self.last_updated(), HARDWARE_RESET_TIMEOUT) {
            return Ok(());
        }
        if rescue {
            self.ensure_rescue_mode()
                .await
                .map_err(|e| e.context("failed to ensure rescue mode"))?;
        }
        // The error type stays the same, restart the clock by hand.
        self.scope.host.spec.status.last_updated = Some(now_rfc3339());

        self.reboot_via_api(RebootType::Hardware).await?;
        let message = format!(
            "Reboot via ssh into {} failed. Now using rebootType {:?}.",
            reboot_target(rescue),
            RebootType::Hardware.as_str()
        );
        self.create_reboot_event(RebootType::Hardware, &message).await;
        Ok(())
    }
}

fn reboot_target(rescue: bool) -> &'static str {
    if rescue {
        "rescue mode"
    } else {
        "node"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_timestamp_counts_as_timed_out() {
        assert!(has_timed_out(None, Duration::from_secs(60)));
        assert!(has_timed_out(Some("garbage"), Duration::from_secs(60)));
    }

    #[test]
    fn test_has_timed_out() {
        let recent = (Utc::now() - chrono::Duration::seconds(5)).to_rfc3339();
        assert!(!has_timed_out(Some(&recent), Duration::from_secs(60)));

        let old = (Utc::now() - chrono::Duration::minutes(10)).to_rfc3339();
        assert!(has_timed_out(Some(&old), Duration::from_secs(60)));
    }

    fn output_err(kind: SshErrorKind) -> Output {
        Output::from_err(SshError::from_kind(kind))
    }

    #[test]
    fn test_analyze_ssh_output_provisioned() {
        assert_eq!(
            analyze_ssh_output_provisioned(&output_err(SshErrorKind::Timeout)).unwrap(),
            BootProbe {
                timeout: true,
                connection_refused: false
            }
        );
        assert!(
            analyze_ssh_output_provisioned(&output_err(SshErrorKind::ConnectionRefused))
                .unwrap()
                .connection_refused
        );
        assert!(matches!(
            analyze_ssh_output_provisioned(&output_err(SshErrorKind::AuthenticationFailed)),
            Err(HostnameError::WrongSshKey(_))
        ));
        assert!(matches!(
            analyze_ssh_output_provisioned(&output_err(SshErrorKind::Other)),
            Err(HostnameError::Unhandled(_))
        ));
        assert_eq!(
            analyze_ssh_output_provisioned(&Output::stdout("rescue\n")).unwrap(),
            BootProbe::default()
        );
        assert!(matches!(
            analyze_ssh_output_provisioned(&Output::stdout("")),
            Err(HostnameError::Empty)
        ));
        let err = analyze_ssh_output_provisioned(&Output::stdout("other-host\n")).unwrap_err();
        assert_eq!(err.to_string(), "unexpected hostname: other-host");
    }

    #[test]
    fn test_reboot_target() {
        assert_eq!(reboot_target(true), "rescue mode");
        assert_eq!(reboot_target(false), "node");
    }
}
