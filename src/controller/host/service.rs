//! Reconcile entry point, shared helpers and the handlers outside of image installation

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument};

use super::hardware::{
    check_ssh_output, obtain_hardware_details, trim_line_break, validate_root_device_wwns,
};
use super::reboot::{analyze_ssh_output_provisioned, BootCheck, HostnameError};
use super::{HostService, POLL_REQUEUE, SHORT_REQUEUE};
use crate::controller::action::{ActionResult, Backoff, ReconcileOutcome};
use crate::controller::conditions::{
    mark_false, mark_true, remove_condition, CREDENTIALS_AVAILABLE_CONDITION,
    DELETION_IN_PROGRESS_REASON, HETZNER_API_REACHABLE_CONDITION, HOST_READY_CONDITION,
    PROVISION_SUCCEEDED_CONDITION, RATE_LIMIT_EXCEEDED_REASON, RESCUE_SYSTEM_UNAVAILABLE_REASON,
    ROOT_DEVICE_HINTS_INVALID_REASON, ROOT_DEVICE_HINTS_VALIDATED_CONDITION,
    SERVER_NOT_FOUND_REASON, SSH_KEY_ALREADY_EXISTS_REASON, STILL_PROVISIONING_REASON,
};
use crate::crd::{
    now_rfc3339, ConditionSeverity, ControllerGeneratedStatus, ErrorType, ProvisioningState,
    RebootAnnotationArguments, RebootType, SshKey, SshSecretRef, REBOOT_ANNOTATION,
    RESCUE_HOSTNAME, WIPE_DISK_ANNOTATION,
};
use crate::error::{Error, Result};
use crate::robot::{RobotError, RobotErrorCode};
use crate::ssh::{Credentials, Input, SshClient, SshErrorKind};

const RESCUE_PORT: u16 = 22;

/// Parts of the host the reconcile may change
#[derive(PartialEq)]
struct Snapshot {
    status: ControllerGeneratedStatus,
    annotations: Option<BTreeMap<String, String>>,
    finalizers: Option<Vec<String>>,
}

impl HostService<'_> {
    /// Run one step of the provisioning state machine.
    ///
    /// The host in the scope is updated in place; `lastUpdated` is stamped whenever the pass
    /// changed anything, which the reboot timeouts are measured against.
    #[instrument(skip(self, backoff), fields(name = %self.scope.host.name_any(), namespace = self.scope.host.namespace()))]
    pub async fn reconcile(&mut self, backoff: &Backoff) -> Result<ReconcileOutcome> {
        let initial_state = self.scope.host.spec.status.provisioning_state;
        let before = self.snapshot();

        if self.scope.host.is_being_deleted() {
            mark_false(
                &mut self.scope.host.spec.status.conditions,
                HOST_READY_CONDITION,
                DELETION_IN_PROGRESS_REASON,
                ConditionSeverity::Warning,
                "Host is not ready because it is being deleted",
            );
        }

        let result = self.reconcile_state().await;

        if self.snapshot() != before {
            self.scope.host.spec.status.last_updated = Some(now_rfc3339());
        }

        result
            .into_outcome(backoff)
            .map_err(|e| e.context(format!("action {:?} failed", initial_state.as_str())))
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            status: self.scope.host.spec.status.clone(),
            annotations: self.scope.host.metadata.annotations.clone(),
            finalizers: self.scope.host.metadata.finalizers.clone(),
        }
    }

    /// Store the error on the host and back off based on how often it repeated.
    pub(super) fn record_action_failure(
        &mut self,
        error_type: ErrorType,
        message: &str,
    ) -> ActionResult {
        self.scope.host.set_error(error_type, message);
        error!(%error_type, "Action failure: {}", message);
        ActionResult::failed(error_type, self.scope.host.spec.status.error_count)
    }

    /// Surface a Robot rate limit on the host.
    pub(super) async fn handle_rate_limit(&mut self, err: &RobotError, function: &str) {
        if !err.is_rate_limit() {
            return;
        }
        let message = format!("exceeded robot rate limit with calling function {function:?}: {err}");
        mark_false(
            &mut self.scope.host.spec.status.conditions,
            HETZNER_API_REACHABLE_CONDITION,
            RATE_LIMIT_EXCEEDED_REASON,
            ConditionSeverity::Warning,
            message.as_str(),
        );
        self.scope.recorder.warn("RateLimitExceeded", &message).await;
    }

    /// [`Self::handle_rate_limit`] plus wrapping the error with context
    pub(super) async fn robot_call_failed(
        &mut self,
        err: RobotError,
        function: &str,
        context: &str,
    ) -> Error {
        self.handle_rate_limit(&err, function).await;
        Error::from(err).context(context)
    }

    pub(super) fn mark_provision_pending(&mut self, state: ProvisioningState) {
        mark_false(
            &mut self.scope.host.spec.status.conditions,
            PROVISION_SUCCEEDED_CONDITION,
            STILL_PROVISIONING_REASON,
            ConditionSeverity::Info,
            format!("host is still provisioning - state {:?}", state.as_str()),
        );
    }

    pub(super) fn rescue_client(&self) -> Box<dyn SshClient> {
        let private_key = self
            .scope
            .rescue_ssh_secret
            .as_ref()
            .map(|s| Credentials::from_secret(s, &self.scope.rescue_secret_ref()).private_key)
            .unwrap_or_default();
        self.scope.ssh_factory.new_client(Input {
            ip: self.scope.host.ip_address().to_string(),
            private_key,
            port: RESCUE_PORT,
        })
    }

    /// Client for the installed OS on the given port
    pub(super) fn os_client(&self, port: i32) -> Box<dyn SshClient> {
        let private_key = self
            .scope
            .os_ssh_secret
            .as_ref()
            .map(|s| Credentials::from_secret(s, &self.scope.os_secret_ref()).private_key)
            .unwrap_or_default();
        let port = u16::try_from(port)
            .ok()
            .filter(|p| *p != 0)
            .unwrap_or(RESCUE_PORT);
        self.scope.ssh_factory.new_client(Input {
            ip: self.scope.host.ip_address().to_string(),
            private_key,
            port,
        })
    }

    pub(super) fn port_after_cloud_init(&self) -> i32 {
        self.scope
            .host
            .spec
            .status
            .ssh_spec
            .as_ref()
            .map_or(0, |s| s.port_after_cloud_init)
    }

    pub(super) fn port_after_install_image(&self) -> i32 {
        self.scope
            .host
            .spec
            .status
            .ssh_spec
            .as_ref()
            .map_or(0, |s| s.port_after_install_image)
    }

    /// Find the key in the Robot account by name, or upload it.
    pub(super) async fn ensure_ssh_key(
        &mut self,
        secret_ref: &SshSecretRef,
        secret: Option<&Secret>,
    ) -> std::result::Result<SshKey, ActionResult> {
        let Some(secret) = secret else {
            return Err(Error::ValidationError("ssh secret is missing".to_string()).into());
        };
        let credentials = Credentials::from_secret(secret, secret_ref);

        let keys = match self.scope.robot.list_ssh_keys().await {
            Ok(keys) => keys,
            Err(e) => {
                self.handle_rate_limit(&e, "ListSSHKeys").await;
                if !e.is(RobotErrorCode::NotFound) {
                    return Err(Error::from(e).context("failed to list ssh keys").into());
                }
                Vec::new()
            }
        };

        let wanted = trim_line_break(&credentials.name);
        if let Some(key) = keys.iter().find(|k| k.name == wanted) {
            return Ok(SshKey {
                name: key.name.clone(),
                fingerprint: key.fingerprint.clone(),
            });
        }

        match self
            .scope
            .robot
            .set_ssh_key(credentials.name.clone(), credentials.public_key.clone())
            .await
        {
            Ok(key) => Ok(SshKey {
                name: key.name,
                fingerprint: key.fingerprint,
            }),
            Err(e) => {
                self.handle_rate_limit(&e, "SetSSHKey").await;
                if e.is(RobotErrorCode::KeyAlreadyExists) {
                    let message = format!(
                        "cannot upload ssh key {:?} (from secret {:?}) - exists already under a different name: {e}",
                        credentials.name, secret_ref.name
                    );
                    mark_false(
                        &mut self.scope.host.spec.status.conditions,
                        CREDENTIALS_AVAILABLE_CONDITION,
                        SSH_KEY_ALREADY_EXISTS_REASON,
                        ConditionSeverity::Error,
                        message.as_str(),
                    );
                    self.scope
                        .recorder
                        .warn(SSH_KEY_ALREADY_EXISTS_REASON, &message)
                        .await;
                    return Err(self.record_action_failure(ErrorType::PreparationError, &message));
                }
                Err(Error::from(e).context("failed to set ssh key").into())
            }
        }
    }

    /// Boot the server into the rescue system.
    pub(super) async fn action_preparing(&mut self) -> ActionResult {
        self.mark_provision_pending(ProvisioningState::Preparing);
        let server_id = self.scope.host.spec.server_id;

        let server = match self.scope.robot.get_bm_server(server_id).await {
            Ok(server) => server,
            Err(e) => {
                self.handle_rate_limit(&e, "GetBMServer").await;
                if e.is(RobotErrorCode::ServerNotFound) {
                    let message = "bare metal host not found";
                    mark_false(
                        &mut self.scope.host.spec.status.conditions,
                        PROVISION_SUCCEEDED_CONDITION,
                        SERVER_NOT_FOUND_REASON,
                        ConditionSeverity::Error,
                        message,
                    );
                    self.scope.host.set_error(ErrorType::PermanentError, message);
                    return ActionResult::Stop;
                }
                return Error::from(e).context("failed to get bare metal server").into();
            }
        };

        self.scope.host.spec.status.ipv4 = server.server_ip.clone();
        self.scope.host.spec.status.ipv6 = format!("{}1", server.server_ipv6_net);

        let rescue_ref = self.scope.rescue_secret_ref();
        let rescue_secret = self.scope.rescue_ssh_secret.clone();
        let rescue_key = match self.ensure_ssh_key(&rescue_ref, rescue_secret.as_ref()).await {
            Ok(key) => key,
            Err(result) => return result,
        };
        self.scope.host.spec.status.ssh_status.rescue_key = Some(rescue_key);

        if self.scope.host.spec.status.reboot_types.is_empty() {
            match self.scope.robot.get_reboot(server_id).await {
                Ok(types) => self.scope.host.spec.status.reboot_types = types,
                Err(e) => {
                    return self
                        .robot_call_failed(e, "GetReboot", "failed to get reboot")
                        .await
                        .into()
                }
            }
        }

        if !server.rescue {
            let message = format!("bm server {} has no rescue system", server.server_number);
            mark_false(
                &mut self.scope.host.spec.status.conditions,
                PROVISION_SUCCEEDED_CONDITION,
                RESCUE_SYSTEM_UNAVAILABLE_REASON,
                ConditionSeverity::Error,
                message.as_str(),
            );
            self.scope
                .recorder
                .warn("NoRescueSystemAvailable", &message)
                .await;
            self.scope.host.set_error(ErrorType::PermanentError, message);
            return ActionResult::Stop;
        }

        if let Err(e) = self.enforce_rescue_mode().await {
            return e.context("failed to enforce rescue mode").into();
        }

        // A reachable OS can be rebooted over ssh, everything else goes through the API.
        let client = self.os_client(self.port_after_cloud_init());
        let out = client.get_hostname().await;
        if !trim_line_break(&out.stdout).is_empty() {
            if let Err(e) = check_ssh_output(&client.reboot().await) {
                return e.context("failed to reboot server via ssh").into();
            }
            let message = self.create_ssh_reboot_event("Rebooting into rescue mode.").await;
            self.scope
                .host
                .set_error(ErrorType::SshRebootTriggered, message);
            return ActionResult::Complete;
        }

        let (reboot_type, error_type) = match self.reboot_and_error_type_after_timeout() {
            Ok(types) => types,
            Err(e) => return e.into(),
        };
        if let Err(e) = self.scope.robot.reboot_bm_server(server_id, reboot_type).await {
            return self
                .robot_call_failed(e, "RebootBMServer", "failed to reboot bare metal server")
                .await
                .into();
        }
        let message = self
            .create_reboot_event(reboot_type, "Reboot into rescue system.")
            .await;
        self.scope.host.set_error(error_type, message);
        ActionResult::Complete
    }

    /// Wait for the rescue system, collect hardware details and validate the root device hints.
    pub(super) async fn action_registering(&mut self) -> ActionResult {
        self.mark_provision_pending(ProvisioningState::Registering);
        let client = self.rescue_client();

        let out = client.get_hostname().await;
        if trim_line_break(&out.stdout) != RESCUE_HOSTNAME {
            if self.has_just_rebooted() {
                return ActionResult::Continue(SHORT_REQUEUE);
            }

            let probe = match self.analyze_ssh_output_registering(&out).await {
                Ok(probe) => probe,
                Err(e) => {
                    return Error::ReconcileError(format!(
                        "failed to handle incomplete boot - registering: {e}"
                    ))
                    .into()
                }
            };
            match self
                .handle_incomplete_boot(true, probe.timeout, probe.connection_refused)
                .await
            {
                Ok(BootCheck::Failed(message)) => {
                    return self.record_action_failure(ErrorType::ProvisioningError, &message)
                }
                Err(e) => return e.context("failed to handle incomplete boot").into(),
                Ok(BootCheck::Waiting) => {}
            }
            info!(
                stdout = %out.stdout,
                stderr = %out.stderr,
                timeout = probe.timeout,
                connection_refused = probe.connection_refused,
                "Could not reach rescue system, will retry"
            );
            return ActionResult::Continue(POLL_REQUEUE);
        }

        let debug_out = client.get_hardware_details_debug().await;
        if let Some(err) = debug_out.err {
            return Error::from(err)
                .context("failed to obtain hardware for debugging")
                .into();
        }
        let mut message = format!("{}\n\n", debug_out.stdout);
        if !debug_out.stderr.is_empty() {
            message.push_str(&format!("stderr:\n{}\n\n", debug_out.stderr));
        }
        self.scope.recorder.normal("GetHardwareDetails", &message).await;

        if self.scope.host.spec.status.hardware_details.is_none() {
            match obtain_hardware_details(client.as_ref()).await {
                Ok(details) => self.scope.host.spec.status.hardware_details = Some(details),
                Err(e) => return e.context("failed to get hardware details").into(),
            }
        }

        if let Some(result) = self.wipe_disks(client.as_ref()).await {
            return result;
        }

        let Some(hints) = self.scope.host.spec.root_device_hints.clone() else {
            return self.root_device_hints_invalid(
                ErrorType::RegistrationError,
                "no root device hints specified",
            );
        };
        let message = hints.is_valid_with_message();
        if !message.is_empty() {
            return self.root_device_hints_invalid(ErrorType::RegistrationError, &message);
        }
        let storage = self
            .scope
            .host
            .spec
            .status
            .hardware_details
            .as_ref()
            .map(|d| d.storage.clone())
            .unwrap_or_default();
        if let Err(e) = validate_root_device_wwns(&hints.list_of_wwn(), &storage) {
            let message = match e {
                Error::ValidationError(message) => message,
                other => other.to_string(),
            };
            return self.root_device_hints_invalid(ErrorType::RegistrationError, &message);
        }

        let swraid = self
            .scope
            .host
            .spec
            .status
            .install_image
            .as_ref()
            .map_or(0, |i| i.swraid);
        let message = if swraid != 0 && hints.raid.wwn.len() < 2 {
            "Invalid HetznerBareMetalHost: spec.status.installImage.swraid is active. Use at least two WWNs in spec.rootDevideHints.raid.wwn."
        } else if swraid == 0 && hints.wwn.is_empty() {
            "Invalid HetznerBareMetalHost: spec.status.installImage.swraid is not active. Use spec.rootDevideHints.wwn and leave raid.wwn empty."
        } else {
            ""
        };
        if !message.is_empty() {
            info!("{}", message);
            return self.root_device_hints_invalid(ErrorType::FatalError, message);
        }

        mark_true(
            &mut self.scope.host.spec.status.conditions,
            ROOT_DEVICE_HINTS_VALIDATED_CONDITION,
        );
        self.scope.host.clear_error();
        ActionResult::Complete
    }

    fn root_device_hints_invalid(&mut self, error_type: ErrorType, message: &str) -> ActionResult {
        mark_false(
            &mut self.scope.host.spec.status.conditions,
            ROOT_DEVICE_HINTS_VALIDATED_CONDITION,
            ROOT_DEVICE_HINTS_INVALID_REASON,
            ConditionSeverity::Error,
            message,
        );
        self.record_action_failure(error_type, message)
    }

    /// Wipe the disks listed in the wipe-disk annotation, then drop the annotation.
    async fn wipe_disks(&mut self, client: &dyn SshClient) -> Option<ActionResult> {
        let wwns: Vec<String> = self
            .scope
            .host
            .annotation(WIPE_DISK_ANNOTATION)?
            .split_whitespace()
            .map(String::from)
            .collect();

        match client.wipe_disk(wwns.clone()).await {
            Ok(out) => {
                self.scope
                    .recorder
                    .normal("WipeDiskSucceeded", format!("wiped {wwns:?}: {out}"))
                    .await;
            }
            Err(e) if e.is(&SshErrorKind::InvalidWwn) => {
                self.scope
                    .recorder
                    .warn("WipeDiskFailed", format!("invalid WWN in annotation, ignoring it: {e}"))
                    .await;
            }
            Err(e) => {
                self.scope.recorder.warn("WipeDiskFailed", e.to_string()).await;
                return Some(Error::from(e).context("failed to wipe disks").into());
            }
        }
        self.scope.host.remove_annotation(WIPE_DISK_ANNOTATION);
        None
    }

    /// Serve reboot requests made through the reboot annotation.
    pub(super) async fn action_provisioned(&mut self) -> ActionResult {
        mark_true(
            &mut self.scope.host.spec.status.conditions,
            PROVISION_SUCCEEDED_CONDITION,
        );

        let Some(annotation) = self.scope.host.annotation(REBOOT_ANNOTATION).map(String::from)
        else {
            return ActionResult::Stop;
        };
        let client = self.os_client(self.port_after_cloud_init());

        if self.scope.host.spec.status.rebooted {
            let out = client.get_hostname().await;
            let want = self.scope.hostname();
            if trim_line_break(&out.stdout) == want {
                self.scope.host.spec.status.rebooted = false;
                self.scope.host.remove_annotation(REBOOT_ANNOTATION);
                self.scope.host.clear_error();
                return ActionResult::Complete;
            }

            let probe = match analyze_ssh_output_provisioned(&out) {
                Ok(probe) => probe,
                Err(e) => {
                    if let HostnameError::Unexpected(_) = e {
                        self.scope
                            .recorder
                            .warn("UnexpectedHostName", format!("Provisioned: wanted {want:?}. {e}"))
                            .await;
                    }
                    return Error::ReconcileError(format!(
                        "failed to handle incomplete boot - provisioning: {e}"
                    ))
                    .into();
                }
            };
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

        let reboot_type = serde_json::from_str::<RebootAnnotationArguments>(&annotation)
            .map(|args| args.type_)
            .unwrap_or_else(|e| {
                debug!(error = %e, "Reboot annotation has no valid type, rebooting via ssh");
                RebootType::Ssh
            });

        let (event_type, error_type) = match reboot_type {
            RebootType::Ssh | RebootType::Manual => {
                if let Err(e) = check_ssh_output(&client.reboot().await) {
                    return e.into();
                }
                (RebootType::Ssh, ErrorType::SshRebootTriggered)
            }
            RebootType::Software => (RebootType::Software, ErrorType::SoftwareRebootTriggered),
            other => (other, ErrorType::HardwareRebootTriggered),
        };
        if event_type != RebootType::Ssh {
            let server_id = self.scope.host.spec.server_id;
            if let Err(e) = self.scope.robot.reboot_bm_server(server_id, event_type).await {
                return self
                    .robot_call_failed(e, "RebootBMServer", "failed to reboot bare metal server")
                    .await
                    .into();
            }
        }
        let message = self
            .create_reboot_event(event_type, "reboot annotation was set")
            .await;
        self.scope.host.set_error(error_type, message);
        self.scope.host.spec.status.rebooted = true;
        ActionResult::Continue(POLL_REQUEUE)
    }

    /// Reset the node and release the server name.
    pub(super) async fn action_deprovisioning(&mut self) -> ActionResult {
        let server_id = self.scope.host.spec.server_id;
        let name = self
            .scope
            .host
            .spec
            .consumer_ref
            .as_ref()
            .map(|c| c.name.clone())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| self.scope.host.name_any());
        if let Err(e) = self.scope.robot.set_bm_server_name(server_id, name).await {
            return self
                .robot_call_failed(
                    e,
                    "SetBMServerName",
                    "failed to update name of host in robot API",
                )
                .await
                .into();
        }

        if self.scope.os_ssh_secret.is_some() {
            let client = self.os_client(self.port_after_cloud_init());
            let out = client.reset_kubeadm().await;
            debug!(stdout = %out.stdout, stderr = %out.stderr, "Output of kubeadm reset");
            match out.err {
                Some(e) => {
                    self.scope
                        .recorder
                        .warn("FailedResetKubeAdm", format!("failed to reset kubeadm: {e}"))
                        .await
                }
                None => {
                    self.scope
                        .recorder
                        .normal("SuccessfulResetKubeAdm", "Reset was successful.")
                        .await
                }
            }
        } else {
            info!("OS ssh secret is missing, cannot reset kubeadm");
        }

        if self.scope.host.spec.status.error_type != ErrorType::PermanentError {
            self.scope.host.clear_error();
        }
        remove_condition(
            &mut self.scope.host.spec.status.conditions,
            PROVISION_SUCCEEDED_CONDITION,
        );
        ActionResult::Complete
    }

    pub(super) fn action_deleting(&mut self) -> ActionResult {
        self.scope.host.remove_finalizer();
        ActionResult::DeleteComplete
    }
}
