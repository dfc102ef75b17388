//! Bare metal host provisioning
//!
//! A host walks through a fixed sequence of provisioning states. Each reconcile runs the handler
//! of the current state once; the handler reports an [`ActionResult`] and may pick the next
//! state. Reboots are tracked through the host's error type so that a reboot which does not
//! come back in time is escalated from ssh to a software and finally a hardware reset.
//!
//! [`ActionResult`]: crate::controller::action::ActionResult

mod autosetup;
mod hardware;
mod install;
mod reboot;
mod service;
mod state_machine;

use std::time::Duration;

use crate::crd::ProvisioningState;
use crate::scope::HostScope;

pub use hardware::{obtain_hardware_details, valid_json_from_ssh_output};

/// A reboot triggered less than this ago is not checked yet
const REBOOT_WAIT_TIME: Duration = Duration::from_secs(15);
const SSH_RESET_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const SOFTWARE_RESET_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const HARDWARE_RESET_TIMEOUT: Duration = Duration::from_secs(60 * 60);
/// Refused connections are tolerated this long after a reboot
const CONNECTION_REFUSED_TIMEOUT: Duration = Duration::from_secs(60);

const SHORT_REQUEUE: Duration = Duration::from_secs(2);
const POLL_REQUEUE: Duration = Duration::from_secs(10);
const CLOUD_INIT_REQUEUE: Duration = Duration::from_secs(5);

/// Reconciles one HetznerBareMetalHost
pub struct HostService<'a> {
    scope: &'a mut HostScope,
    next_state: ProvisioningState,
}

impl<'a> HostService<'a> {
    pub fn new(scope: &'a mut HostScope) -> Self {
        let next_state = scope.host.spec.status.provisioning_state;
        Self { scope, next_state }
    }
}
