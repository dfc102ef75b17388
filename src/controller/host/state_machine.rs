//! State transitions and the checks run before every state handler

use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::HostService;
use crate::controller::action::ActionResult;
use crate::controller::conditions::{
    mark_false, mark_true, CREDENTIALS_AVAILABLE_CONDITION, SSH_CREDENTIALS_INVALID_REASON,
};
use crate::crd::{ConditionSeverity, ErrorType, ProvisioningState};
use crate::ssh::Credentials;

const MISSING_OR_INVALID_SECRET_DATA: &str = "ssh credentials are missing or invalid";

/// Hex encoded SHA-256 over the keys and values of a secret
pub(super) fn secret_data_hash(secret: &Secret) -> String {
    let mut hasher = Sha256::new();
    if let Some(data) = &secret.data {
        for (key, value) in data {
            hasher.update(key.as_bytes());
            hasher.update(&value.0);
        }
    }
    hex::encode(hasher.finalize())
}

impl HostService<'_> {
    /// Run the handler of the current state and store the state it picked.
    pub(super) async fn reconcile_state(&mut self) -> ActionResult {
        let initial = self.scope.host.spec.status.provisioning_state;
        self.next_state = initial;

        let result = self.dispatch(initial).await;

        if self.next_state != initial {
            debug!(old = %initial, new = %self.next_state, "Changing provisioning state");
            self.scope.host.spec.status.provisioning_state = self.next_state;
        }
        result
    }

    async fn dispatch(&mut self, state: ProvisioningState) -> ActionResult {
        if self.check_initiate_delete() {
            return ActionResult::Complete;
        }

        let result = self.update_ssh_key().await;
        if !result.is_complete() {
            return result;
        }
        mark_true(
            &mut self.scope.host.spec.status.conditions,
            CREDENTIALS_AVAILABLE_CONDITION,
        );

        let state = if state == ProvisioningState::Provisioning {
            info!(
                new_state = %ProvisioningState::ImageInstalling,
                "Host found in removed state provisioning, resetting"
            );
            if self.next_state == ProvisioningState::Provisioning {
                self.next_state = ProvisioningState::ImageInstalling;
            }
            ProvisioningState::ImageInstalling
        } else {
            state
        };

        match state {
            ProvisioningState::None => {
                if self.provisioning_cancelled() {
                    return ActionResult::Stop;
                }
                self.next_state = ProvisioningState::Preparing;
                ActionResult::Complete
            }
            ProvisioningState::Unmanaged => ActionResult::Stop,
            ProvisioningState::Preparing => {
                if let Some(result) = self.cancel_provisioning() {
                    return result;
                }
                let host = &self.scope.host;
                let message = format!("ServerID {} {}", host.spec.server_id, host.spec.description);
                self.scope
                    .recorder
                    .normal("PreparingForProvisioning", message)
                    .await;

                let result = self.action_preparing().await;
                if result.is_complete() {
                    self.next_state = ProvisioningState::Registering;
                }
                result
            }
            ProvisioningState::Registering => {
                if let Some(result) = self.cancel_provisioning() {
                    return result;
                }
                let result = self.action_registering().await;
                if result.is_complete() {
                    self.next_state = ProvisioningState::ImageInstalling;
                }
                result
            }
            ProvisioningState::ImageInstalling | ProvisioningState::Provisioning => {
                if let Some(result) = self.cancel_provisioning() {
                    return result;
                }
                let result = self.action_image_installing().await;
                match result {
                    ActionResult::Complete => self.next_state = ProvisioningState::EnsureProvisioned,
                    ActionResult::Error(_) => self.next_state = ProvisioningState::Preparing,
                    _ => {}
                }
                result
            }
            ProvisioningState::EnsureProvisioned => {
                if let Some(result) = self.cancel_provisioning() {
                    return result;
                }
                let result = self.action_ensure_provisioned().await;
                if result.is_complete() {
                    self.next_state = ProvisioningState::Provisioned;
                }
                result
            }
            ProvisioningState::Provisioned => {
                if let Some(result) = self.cancel_provisioning() {
                    return result;
                }
                self.action_provisioned().await
            }
            ProvisioningState::Deprovisioning => {
                let result = self.action_deprovisioning().await;
                if result.is_complete() {
                    self.next_state = ProvisioningState::None;
                }
                result
            }
            ProvisioningState::Deleting => self.action_deleting(),
        }
    }

    fn provisioning_cancelled(&self) -> bool {
        self.scope.host.spec.status.install_image.is_none()
    }

    /// Send the host to deprovisioning once the consumer took away the install image.
    fn cancel_provisioning(&mut self) -> Option<ActionResult> {
        if !self.provisioning_cancelled() {
            return None;
        }
        self.next_state = ProvisioningState::Deprovisioning;
        Some(ActionResult::Complete)
    }

    /// Route a deleted host to deprovisioning or deleting. Returns whether the state changed.
    fn check_initiate_delete(&mut self) -> bool {
        if !self.scope.host.is_being_deleted() {
            return false;
        }
        match self.next_state {
            ProvisioningState::Registering
            | ProvisioningState::ImageInstalling
            | ProvisioningState::Provisioning
            | ProvisioningState::EnsureProvisioned
            | ProvisioningState::Provisioned => {
                self.next_state = ProvisioningState::Deprovisioning;
                true
            }
            ProvisioningState::Deprovisioning | ProvisioningState::Deleting => false,
            _ => {
                self.next_state = ProvisioningState::Deleting;
                true
            }
        }
    }

    /// Track changes of the ssh secrets and validate their contents.
    async fn update_ssh_key(&mut self) -> ActionResult {
        if self.scope.host.spec.status.provisioning_state == ProvisioningState::Deprovisioning {
            return ActionResult::Complete;
        }

        if let Some(secret) = self.scope.os_ssh_secret.clone() {
            if let Some(result) = self.update_os_ssh_status(&secret).await {
                return result;
            }
        }

        if let Some(secret) = self.scope.rescue_ssh_secret.clone() {
            if let Some(result) = self.update_rescue_ssh_status(&secret).await {
                return result;
            }
        }

        ActionResult::Complete
    }

    async fn update_os_ssh_status(&mut self, secret: &Secret) -> Option<ActionResult> {
        let hash = secret_data_hash(secret);
        let ssh_status = &mut self.scope.host.spec.status.ssh_status;
        let current = ssh_status.current_os.get_or_insert_with(|| hash.clone());

        if *current != hash {
            match self.next_state {
                ProvisioningState::EnsureProvisioned => {
                    self.next_state = ProvisioningState::ImageInstalling;
                }
                ProvisioningState::Provisioned => {
                    let message = "secret has been modified although a provisioned machine uses it";
                    self.scope
                        .recorder
                        .normal("SSHSecretUnexpectedlyModified", message)
                        .await;
                    return Some(self.record_action_failure(ErrorType::RegistrationError, message));
                }
                _ => {}
            }
            self.scope.host.spec.status.ssh_status.current_os = Some(hash);
        }

        let credentials = Credentials::from_secret(secret, &self.scope.os_secret_ref());
        if let Err(e) = credentials.validate() {
            let message = format!("ssh credentials are invalid: {e}");
            mark_false(
                &mut self.scope.host.spec.status.conditions,
                CREDENTIALS_AVAILABLE_CONDITION,
                SSH_CREDENTIALS_INVALID_REASON,
                ConditionSeverity::Error,
                message.as_str(),
            );
            self.scope
                .recorder
                .warn(SSH_CREDENTIALS_INVALID_REASON, &message)
                .await;
            return Some(
                self.record_action_failure(ErrorType::PreparationError, MISSING_OR_INVALID_SECRET_DATA),
            );
        }
        None
    }

    async fn update_rescue_ssh_status(&mut self, secret: &Secret) -> Option<ActionResult> {
        let hash = secret_data_hash(secret);
        let ssh_status = &mut self.scope.host.spec.status.ssh_status;
        let current = ssh_status.current_rescue.get_or_insert_with(|| hash.clone());

        if *current != hash {
            if matches!(
                self.next_state,
                ProvisioningState::Preparing
                    | ProvisioningState::Registering
                    | ProvisioningState::ImageInstalling
            ) {
                let message = "stopped provisioning host as rescue ssh secret was updated";
                self.scope
                    .recorder
                    .warn("HostProvisioningStopped", message)
                    .await;
                debug!(
                    host = %self.scope.host.name_any(),
                    state = %self.next_state,
                    "{}", message
                );
                self.next_state = ProvisioningState::None;
            }
            self.scope.host.spec.status.ssh_status.current_rescue = Some(hash);
        }

        let credentials = Credentials::from_secret(secret, &self.scope.rescue_secret_ref());
        if let Err(e) = credentials.validate() {
            let message = format!("ssh credentials for rescue system are invalid: {e}");
            mark_false(
                &mut self.scope.host.spec.status.conditions,
                CREDENTIALS_AVAILABLE_CONDITION,
                SSH_CREDENTIALS_INVALID_REASON,
                ConditionSeverity::Error,
                message,
            );
            return Some(
                self.record_action_failure(ErrorType::PreparationError, MISSING_OR_INVALID_SECRET_DATA),
            );
        }
        None
    }
}
