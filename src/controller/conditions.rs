//! Condition management helpers following Cluster API conventions
//!
//! Conditions that are not `True` carry a severity, `True` conditions never do.

use chrono::{DateTime, Utc};

use crate::crd::{Condition, ConditionSeverity};

/// Condition types
pub const HOST_READY_CONDITION: &str = "HostReady";
pub const PROVISION_SUCCEEDED_CONDITION: &str = "ProvisionSucceeded";
pub const ROOT_DEVICE_HINTS_VALIDATED_CONDITION: &str = "RootDeviceHintsValidated";
pub const CREDENTIALS_AVAILABLE_CONDITION: &str = "CredentialsAvailable";
pub const HETZNER_API_REACHABLE_CONDITION: &str = "HetznerAPIReachable";
pub const INSTANCE_READY_CONDITION: &str = "InstanceReady";
pub const LOAD_BALANCER_READY_CONDITION: &str = "LoadBalancerReady";
pub const LOAD_BALANCER_ATTACHED_TO_NETWORK_CONDITION: &str = "LoadBalancerAttachedToNetwork";
pub const MACHINE_OWNER_REMEDIATED_CONDITION: &str = "MachineOwnerRemediated";

/// Reasons
pub const DELETION_IN_PROGRESS_REASON: &str = "DeletionInProgress";
pub const INSTANCE_TERMINATED_REASON: &str = "InstanceTerminated";
pub const INSTANCE_HAS_NON_EXISTING_PLACEMENT_GROUP_REASON: &str =
    "InstanceHasNonExistingPlacementGroup";
pub const SERVER_NOT_FOUND_REASON: &str = "ServerNotFound";
pub const RATE_LIMIT_EXCEEDED_REASON: &str = "RateLimitExceeded";
pub const WAITING_FOR_REMEDIATION_REASON: &str = "WaitingForRemediation";
pub const NO_NETWORK_REASON: &str = "NoNetwork";
pub const ROOT_DEVICE_HINTS_INVALID_REASON: &str = "ValidationFailed";
pub const STATE_CHANGED_REASON: &str = "StateChanged";
pub const SSH_CREDENTIALS_INVALID_REASON: &str = "SSHCredentialsInSecretInvalid";
pub const LOAD_BALANCER_FAILED_TO_CREATE_REASON: &str = "FailedToCreate";
pub const LOAD_BALANCER_FAILED_TO_ATTACH_REASON: &str = "FailedToAttach";
pub const STILL_PROVISIONING_REASON: &str = "StillProvisioning";
pub const SSH_CONNECTION_REFUSED_REASON: &str = "SSHConnectionRefused";
pub const RESCUE_SYSTEM_UNAVAILABLE_REASON: &str = "RescueSystemUnavailable";
pub const SSH_KEY_ALREADY_EXISTS_REASON: &str = "SSHKeyAlreadyExists";
pub const LINUX_ON_OTHER_DISK_FOUND_REASON: &str = "LinuxOnOtherDiskFound";
pub const SSH_TO_RESCUE_SYSTEM_FAILED_REASON: &str = "SSHToRescueSystemFailed";
pub const CHECK_DISK_FAILED_REASON: &str = "CheckDiskFailed";
pub const PRE_PROVISION_COMMAND_FAILED_REASON: &str = "PreProvisionCommandFailed";
pub const IMAGE_SPEC_INVALID_REASON: &str = "ImageSpecInvalid";
pub const IMAGE_DOWNLOAD_FAILED_REASON: &str = "ImageDownloadFailed";
pub const NO_STORAGE_DEVICE_FOUND_REASON: &str = "NoStorageDeviceFound";

/// Condition statuses
pub const CONDITION_STATUS_TRUE: &str = "True";
pub const CONDITION_STATUS_FALSE: &str = "False";
pub const CONDITION_STATUS_UNKNOWN: &str = "Unknown";

/// Update or add a condition.
///
/// The transition time only moves when the status changes.
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        let status_changed = existing.status != condition.status;
        existing.status = condition.status;
        existing.reason = condition.reason;
        existing.message = condition.message;
        existing.severity = condition.severity;
        if status_changed {
            existing.last_transition_time = condition.last_transition_time;
        }
    } else {
        conditions.push(condition);
    }
}

pub fn mark_true(conditions: &mut Vec<Condition>, type_: &str) {
    set_condition(
        conditions,
        Condition::new(type_, CONDITION_STATUS_TRUE, "", ""),
    );
}

pub fn mark_false(
    conditions: &mut Vec<Condition>,
    type_: &str,
    reason: &str,
    severity: ConditionSeverity,
    message: impl Into<String>,
) {
    let message = message.into();
    set_condition(
        conditions,
        Condition {
            severity: Some(severity),
            ..Condition::new(type_, CONDITION_STATUS_FALSE, reason, &message)
        },
    );
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_).is_some_and(|c| c.status == CONDITION_STATUS_TRUE)
}

pub fn is_condition_false(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_).is_some_and(|c| c.status == CONDITION_STATUS_FALSE)
}

/// Remove a condition by type
pub fn remove_condition(conditions: &mut Vec<Condition>, type_: &str) {
    conditions.retain(|c| c.type_ != type_);
}

pub fn last_transition_time(conditions: &[Condition], type_: &str) -> Option<DateTime<Utc>> {
    find_condition(conditions, type_).and_then(Condition::last_transition)
}

/// Reason of a condition, empty when it is missing
pub fn reason<'a>(conditions: &'a [Condition], type_: &str) -> &'a str {
    find_condition(conditions, type_)
        .map(|c| c.reason.as_str())
        .unwrap_or_default()
}
