//! installimage on the rescue system and the first boot of the installed OS

use tracing::info;

use super::autosetup::{build_auto_setup, AutoSetupInput};
use super::hardware::{check_ssh_output, device_names, obtain_storage, trim_line_break};
use super::reboot::{analyze_ssh_output_provisioned, BootCheck, HostnameError};
use super::{HostService, CLOUD_INIT_REQUEUE, POLL_REQUEUE, SHORT_REQUEUE};
use crate::controller::action::ActionResult;
use crate::controller::conditions::{
    mark_false, mark_true, CHECK_DISK_FAILED_REASON, IMAGE_DOWNLOAD_FAILED_REASON,
    IMAGE_SPEC_INVALID_REASON, LINUX_ON_OTHER_DISK_FOUND_REASON, NO_STORAGE_DEVICE_FOUND_REASON,
    PRE_PROVISION_COMMAND_FAILED_REASON, PROVISION_SUCCEEDED_CONDITION,
    SSH_TO_RESCUE_SYSTEM_FAILED_REASON,
};
use crate::crd::{ConditionSeverity, ErrorType, ProvisioningState};
use crate::error::Error;
use crate::ssh::{InstallImageState, SshClient, SshErrorKind};

fn err_string(err: &Option<crate::ssh::SshError>) -> String {
    err.as_ref().map(|e| e.to_string()).unwrap_or_default()
}

impl HostService<'_> {
    /// Start installimage, wait for it and reboot into the new OS once it finished.
    pub(super) async fn action_image_installing(&mut self) -> ActionResult {
        self.mark_provision_pending(ProvisioningState::ImageInstalling);
        let client = self.rescue_client();

        let state = match client.get_install_image_state().await {
            Ok(state) => state,
            Err(e) => {
                return Error::from(e)
                    .context("failed to get state of installimage")
                    .into()
            }
        };
        match state {
            InstallImageState::Running => ActionResult::Continue(POLL_REQUEUE),
            InstallImageState::Finished => self.finish_install_image(client.as_ref()).await,
            InstallImageState::NotStartedYet => self.start_install_image(client.as_ref()).await,
        }
    }

    async fn start_install_image(&mut self, client: &dyn SshClient) -> ActionResult {
        let os_ref = self.scope.os_secret_ref();
        let os_secret = self.scope.os_ssh_secret.clone();
        let os_key = match self.ensure_ssh_key(&os_ref, os_secret.as_ref()).await {
            Ok(key) => key,
            Err(result) => return result,
        };
        self.scope.host.spec.status.ssh_status.os_key = Some(os_key);

        let wwns = self
            .scope
            .host
            .spec
            .root_device_hints
            .as_ref()
            .map(|h| h.list_of_wwn())
            .unwrap_or_default();

        // Another Linux on a different disk would likely win the next boot.
        let out = client.detect_linux_on_another_disk(wwns.clone()).await;
        if let Some(err) = &out.err {
            if matches!(out.exit_status(), Ok(status) if status > 0) {
                let message = format!(
                    "DetectLinuxOnAnotherDisk failed (permanent error): {}. StdErr: {} ({err})",
                    out.stdout, out.stderr
                );
                mark_false(
                    &mut self.scope.host.spec.status.conditions,
                    PROVISION_SUCCEEDED_CONDITION,
                    LINUX_ON_OTHER_DISK_FOUND_REASON,
                    ConditionSeverity::Error,
                    message.as_str(),
                );
                self.scope
                    .recorder
                    .warn(LINUX_ON_OTHER_DISK_FOUND_REASON, &message)
                    .await;
                self.scope.host.set_error(ErrorType::PermanentError, message);
                return ActionResult::Stop;
            }

            let message = format!("will retry: {}. StdErr: {} ({err})", out.stdout, out.stderr);
            mark_false(
                &mut self.scope.host.spec.status.conditions,
                PROVISION_SUCCEEDED_CONDITION,
                SSH_TO_RESCUE_SYSTEM_FAILED_REASON,
                ConditionSeverity::Info,
                message.as_str(),
            );
            self.scope
                .recorder
                .normal(SSH_TO_RESCUE_SYSTEM_FAILED_REASON, &message)
                .await;
            return ActionResult::Continue(POLL_REQUEUE);
        }
        self.scope
            .recorder
            .normal(
                "NoLinuxOnAnotherDisk",
                format!("OK, no Linux on another disk:\n{}\n\n{}", out.stdout, out.stderr),
            )
            .await;

        match client.check_disk(wwns).await {
            Ok(_) => {}
            Err(e) if e.is(&SshErrorKind::BrokenDisk) => {
                let message = format!("check disk failed: {e}");
                mark_false(
                    &mut self.scope.host.spec.status.conditions,
                    PROVISION_SUCCEEDED_CONDITION,
                    CHECK_DISK_FAILED_REASON,
                    ConditionSeverity::Error,
                    message.as_str(),
                );
                self.scope
                    .recorder
                    .warn(CHECK_DISK_FAILED_REASON, &message)
                    .await;
                self.scope.host.set_error(ErrorType::PermanentError, message);
                return ActionResult::Stop;
            }
            Err(e) => return Error::from(e).context("failed to check disks").into(),
        }

        if let Some(command) = self.scope.settings.pre_provision_command.clone() {
            let command = command.display().to_string();
            match client.execute_pre_provision_command(command.clone()).await {
                Ok((0, _)) => {}
                Ok((status, output)) => {
                    let message = format!(
                        "pre provision command {command} failed with exit code {status}: {output}"
                    );
                    mark_false(
                        &mut self.scope.host.spec.status.conditions,
                        PROVISION_SUCCEEDED_CONDITION,
                        PRE_PROVISION_COMMAND_FAILED_REASON,
                        ConditionSeverity::Warning,
                        message.as_str(),
                    );
                    self.scope
                        .recorder
                        .warn(PRE_PROVISION_COMMAND_FAILED_REASON, &message)
                        .await;
                    return ActionResult::Continue(POLL_REQUEUE);
                }
                Err(e) => {
                    return Error::from(e)
                        .context("failed to execute pre provision command")
                        .into()
                }
            }
        }

        self.scope
            .recorder
            .normal(
                "InstallImagePreflightCheckSuccessful",
                "Rescue system reachable, disks look good.",
            )
            .await;

        let input = match self.create_auto_setup_input(client).await {
            Ok(input) => input,
            Err(result) => return result,
        };
        let install_image = self
            .scope
            .host
            .spec
            .status
            .install_image
            .clone()
            .unwrap_or_default();
        let auto_setup = build_auto_setup(&install_image, &input);

        let out = client.create_auto_setup(auto_setup.clone()).await;
        if out.err.is_some() || !out.stderr.is_empty() {
            return Error::ReconcileError(format!(
                "failed to create autosetup: {:?} {:?} {}. Content: {auto_setup}",
                out.stdout,
                out.stderr,
                err_string(&out.err)
            ))
            .into();
        }

        let post_install_script = install_image.post_install_script.clone();
        if !post_install_script.is_empty() {
            let out = client
                .create_post_install_script(post_install_script.clone())
                .await;
            if let Err(e) = check_ssh_output(&out) {
                return e.context("failed to create post install script").into();
            }
        }

        let image = install_image.image.to_string();
        self.scope
            .recorder
            .normal("InstallingMachineImageStarted", &image)
            .await;

        let out = client.untar_tgz().await;
        if let Some(err) = &out.err {
            self.scope
                .recorder
                .warn(
                    "UntarInstallimageTgzFailed",
                    format!("err: {err}, stderr: {}", out.stderr),
                )
                .await;
            return Error::ReconcileError(format!("UntarInstallimageTgzFailed: {err}")).into();
        }

        self.scope
            .recorder
            .normal("ExecuteInstallImageStarted", &image)
            .await;
        let out = client
            .execute_install_image(!post_install_script.is_empty())
            .await;
        if let Some(err) = out.err {
            self.scope
                .recorder
                .warn("ExecuteInstallImageFailed", &out.stdout)
                .await;
            return Error::from(err)
                .context("failed to execute installimage")
                .into();
        }

        ActionResult::Continue(POLL_REQUEUE)
    }

    async fn create_auto_setup_input(
        &mut self,
        client: &dyn SshClient,
    ) -> Result<AutoSetupInput, ActionResult> {
        let image = self
            .scope
            .host
            .spec
            .status
            .install_image
            .as_ref()
            .map(|i| i.image.clone())
            .unwrap_or_default();

        let (path, needs_download) = match image.details() {
            Ok(details) => details,
            Err(message) => {
                mark_false(
                    &mut self.scope.host.spec.status.conditions,
                    PROVISION_SUCCEEDED_CONDITION,
                    IMAGE_SPEC_INVALID_REASON,
                    ConditionSeverity::Error,
                    message.as_str(),
                );
                return Err(self.record_action_failure(ErrorType::ProvisioningError, &message));
            }
        };

        if needs_download {
            let out = client.download_image(path.clone(), image.url.clone()).await;
            if let Err(e) = check_ssh_output(&out) {
                let message = format!("failed to download image: {} {} {e}", out.stdout, out.stderr);
                mark_false(
                    &mut self.scope.host.spec.status.conditions,
                    PROVISION_SUCCEEDED_CONDITION,
                    IMAGE_DOWNLOAD_FAILED_REASON,
                    ConditionSeverity::Error,
                    message.as_str(),
                );
                return Err(Error::ReconcileError(message).into());
            }
        }

        // Kernel names may have changed since registering, read them again.
        let storage = obtain_storage(client)
            .await
            .map_err(|e| ActionResult::from(e.context("failed to obtain hardware details storage")))?;
        let wwns = self
            .scope
            .host
            .spec
            .root_device_hints
            .as_ref()
            .map(|h| h.list_of_wwn())
            .unwrap_or_default();
        let os_devices = device_names(&wwns, &storage);

        if os_devices.is_empty() {
            let message = "no suitable storage device found";
            mark_false(
                &mut self.scope.host.spec.status.conditions,
                PROVISION_SUCCEEDED_CONDITION,
                NO_STORAGE_DEVICE_FOUND_REASON,
                ConditionSeverity::Error,
                message,
            );
            return Err(self.record_action_failure(ErrorType::ProvisioningError, message));
        }

        Ok(AutoSetupInput {
            os_devices,
            hostname: self.scope.hostname(),
            image: path,
        })
    }

    async fn finish_install_image(&mut self, client: &dyn SshClient) -> ActionResult {
        let output = match client.get_result_of_install_image().await {
            Ok(output) => output,
            Err(e) => {
                return Error::from(e)
                    .context("failed to get result of installimage")
                    .into()
            }
        };
        self.scope
            .recorder
            .normal("ExecuteInstallImageSucceeded", &output)
            .await;
        info!("installimage finished");

        let server_id = self.scope.host.spec.server_id;
        let hostname = self.scope.hostname();
        if let Err(e) = self.scope.robot.set_bm_server_name(server_id, hostname).await {
            self.scope
                .recorder
                .warn("SetBMServerNameFailed", e.to_string())
                .await;
            return self
                .robot_call_failed(
                    e,
                    "SetBMServerName",
                    "failed to update name of host in robot API",
                )
                .await
                .into();
        }

        if let Err(e) = check_ssh_output(&client.reboot().await) {
            self.scope.recorder.warn("RebootFailed", e.to_string()).await;
            return e.context("failed to reboot server").into();
        }
        self.create_ssh_reboot_event("machine image was installed")
            .await;

        self.scope.host.clear_error();
        ActionResult::Complete
    }

    /// Wait for the installed OS to come up with its hostname and for cloud-init to finish.
    pub(super) async fn action_ensure_provisioned(&mut self) -> ActionResult {
        self.mark_provision_pending(ProvisioningState::EnsureProvisioned);
        let client = self.os_client(self.port_after_cloud_init());

        let result = self.ensure_provisioned(client.as_ref()).await;
        if !matches!(result, ActionResult::Continue(_)) {
            self.report_cloud_init_output(client.as_ref(), &result)
                .await;
        }
        result
    }

    async fn ensure_provisioned(&mut self, client: &dyn SshClient) -> ActionResult {
        let want = self.scope.hostname();
        let out = client.get_hostname().await;

        if trim_line_break(&out.stdout) != want {
            if self.has_just_rebooted() {
                return ActionResult::Continue(SHORT_REQUEUE);
            }

            let probe = match analyze_ssh_output_provisioned(&out) {
                Ok(probe) => probe,
                Err(e) => {
                    if let HostnameError::Unexpected(_) = e {
                        self.scope
                            .recorder
                            .warn(
                                "UnexpectedHostName",
                                format!("EnsureProvision: wanted {want:?}. {e}"),
                            )
                            .await;
                    }
                    return Error::ReconcileError(format!(
                        "failed to handle incomplete boot - provisioning: {e}"
                    ))
                    .into();
                }
            };

            if probe.connection_refused {
                if let Some(result) = self.handle_connection_refused().await {
                    return result;
                }
            }

            return match self
                .handle_incomplete_boot(false, probe.timeout, probe.connection_refused)
                .await
            {
                Ok(BootCheck::Failed(message)) => {
                    self.record_action_failure(ErrorType::ProvisioningError, &message)
                }
                Err(e) => e.context("failed to handle incomplete boot").into(),
                Ok(BootCheck::Waiting) => ActionResult::Continue(POLL_REQUEUE),
            };
        }

        let (result, _) = self.check_cloud_init_status(client).await;
        if !result.is_complete() {
            return result;
        }

        if self.port_after_install_image() == self.port_after_cloud_init() {
            let result = self.handle_cloud_init_not_started().await;
            if !result.is_complete() {
                return result;
            }
        }

        self.scope
            .recorder
            .normal("ServerProvisioned", "server successfully provisioned")
            .await;
        mark_true(
            &mut self.scope.host.spec.status.conditions,
            PROVISION_SUCCEEDED_CONDITION,
        );
        self.scope.host.clear_error();
        ActionResult::Complete
    }

    async fn report_cloud_init_output(&self, client: &dyn SshClient, result: &ActionResult) {
        let out = client.get_cloud_init_output().await;
        if out.err.is_some() || !out.stderr.is_empty() {
            let message = format!(
                "GetCloudInitOutput failed to get /var/log/cloud-init-output.log: stdout {:?}, stderr {:?}, err {:?}",
                out.stdout,
                out.stderr,
                err_string(&out.err)
            );
            self.scope
                .recorder
                .warn("GetCloudInitOutputFailed", message)
                .await;
            return;
        }

        if result.is_complete() {
            self.scope
                .recorder
                .normal(
                    "CloudInitOutput",
                    format!("/var/log/cloud-init-output.log: {}", out.stdout),
                )
                .await;
        } else {
            let err = match result {
                ActionResult::Error(e) => e.to_string(),
                _ => String::new(),
            };
            self.scope
                .recorder
                .warn(
                    "CloudInitOutput",
                    format!("cloud init output ({err}):\n{}", out.stdout),
                )
                .await;
        }
    }

    /// Map `cloud-init status` onto a result. The flag reports a failed ssh transport.
    async fn check_cloud_init_status(&mut self, client: &dyn SshClient) -> (ActionResult, bool) {
        let out = client.cloud_init_status().await;
        if let Some(err) = out.err.clone() {
            return (
                Error::from(err)
                    .context("failed to get cloud init status")
                    .into(),
                true,
            );
        }

        let stdout = trim_line_break(&out.stdout);
        if stdout.contains("status: running") {
            return (ActionResult::Continue(CLOUD_INIT_REQUEUE), false);
        }
        if stdout.contains("status: disabled") {
            if let Err(e) = check_ssh_output(&client.reboot().await) {
                return (e.context("failed to reboot").into(), false);
            }
            self.scope
                .host
                .set_error(ErrorType::SshRebootTriggered, "ssh reboot just triggered");
            self.scope
                .recorder
                .normal(
                    "SSHRebootAfterCloudInitStatusDisabled",
                    "cloud-init status was 'disabled'",
                )
                .await;
            return (ActionResult::Continue(CLOUD_INIT_REQUEUE), false);
        }
        if stdout.contains("status: done") {
            self.scope.host.clear_error();
            return (ActionResult::Complete, false);
        }
        if stdout.contains("status: error") {
            let message = "cloud init returned status error";
            self.scope.recorder.warn("CloudInitFailed", message).await;
            return (
                self.record_action_failure(ErrorType::FatalError, message),
                false,
            );
        }
        if let Err(e) = check_ssh_output(&out) {
            return (e.context("failed to get cloud init status").into(), false);
        }
        (ActionResult::Complete, false)
    }

    /// cloud-init killed by SIGTERM during the first boot leaves a half configured node.
    /// Clean its state and reboot so that it runs again.
    async fn handle_cloud_init_not_started(&mut self) -> ActionResult {
        let client = self.os_client(self.port_after_install_image());

        let out = client.check_cloud_init_logs_for_sigterm().await;
        if let Err(e) = check_ssh_output(&out) {
            return e
                .context("failed to check cloud init logs for sigterm")
                .into();
        }
        let sigterm = trim_line_break(&out.stdout).to_string();
        if sigterm.is_empty() {
            return ActionResult::Complete;
        }

        if let Err(e) = check_ssh_output(&client.clean_cloud_init_logs().await) {
            return e.context("failed to clean cloud init logs").into();
        }
        if let Err(e) = check_ssh_output(&client.clean_cloud_init_instances().await) {
            return e.context("failed to clean cloud init instances").into();
        }
        if let Err(e) = check_ssh_output(&client.reboot().await) {
            return e.context("failed to reboot").into();
        }
        self.scope
            .recorder
            .normal(
                "SSHRebootAfterCloudInitSigTermFound",
                format!("rebooted via ssh after cloud init logs contained sigterm: {sigterm}"),
            )
            .await;
        ActionResult::Continue(POLL_REQUEUE)
    }

    /// The OS still listens on the port used right after installimage, cloud-init has not
    /// switched the ssh port yet.
    async fn handle_connection_refused(&mut self) -> Option<ActionResult> {
        if self.port_after_install_image() == self.port_after_cloud_init() {
            return None;
        }
        let client = self.os_client(self.port_after_install_image());
        let (result, transport_failed) = self.check_cloud_init_status(client.as_ref()).await;
        if !transport_failed && result.is_complete() {
            let result = self.handle_cloud_init_not_started().await;
            if result.is_complete() {
                return Some(ActionResult::Continue(POLL_REQUEUE));
            }
            return Some(result);
        }
        if result.is_error() {
            None
        } else {
            Some(result)
        }
    }
}
