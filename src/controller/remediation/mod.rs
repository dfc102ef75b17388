//! Reboot based remediation of unhealthy machines
//!
//! HCloud servers and bare metal hosts share one phase machine:
//!
//! - `Running`: reboot, then reboot again every `timeout` until the retry limit is reached
//! - `Waiting`: give the last reboot `timeout` to heal the machine
//! - `Deleting machine`: hand the machine back to its owner by marking
//!   `MachineOwnerRemediated` false; the owner deletes and replaces it
//!
//! Phases only move forward.

mod baremetal;
mod hcloud;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use serde_json::json;

#[cfg(test)]
use mockall::automock;

use crate::controller::conditions::{
    mark_false, MACHINE_OWNER_REMEDIATED_CONDITION, WAITING_FOR_REMEDIATION_REASON,
};
use crate::crd::{ConditionSeverity, HetznerBareMetalHost, RemediationStrategy};
use crate::error::{Error, Result};
use crate::scope::Machine;

pub use baremetal::BareMetalRemediationService;
pub use hcloud::HCloudRemediationService;

/// Pad added to the remaining time so the next pass lands after the deadline
const REMEDIATION_PAD: Duration = Duration::from_secs(1);

/// Access to bare metal hosts from the remediation of their machines
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HostRepository: Send + Sync {
    /// `None` when the host does not exist.
    async fn get_host(&self, namespace: String, name: String)
        -> Result<Option<HetznerBareMetalHost>>;

    async fn set_annotation(
        &self,
        namespace: String,
        name: String,
        key: String,
        value: String,
    ) -> Result<()>;
}

/// [`HostRepository`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeHostRepository {
    client: Client,
}

impl KubeHostRepository {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HostRepository for KubeHostRepository {
    async fn get_host(
        &self,
        namespace: String,
        name: String,
    ) -> Result<Option<HetznerBareMetalHost>> {
        let api: Api<HetznerBareMetalHost> = Api::namespaced(self.client.clone(), &namespace);
        Ok(api.get_opt(&name).await?)
    }

    async fn set_annotation(
        &self,
        namespace: String,
        name: String,
        key: String,
        value: String,
    ) -> Result<()> {
        let api: Api<HetznerBareMetalHost> = Api::namespaced(self.client.clone(), &namespace);
        let patch = json!({ "metadata": { "annotations": { key: value } } });
        api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Time until the next remediation step is due.
///
/// Before the first reboot this is the full timeout. Once the timeout since the last reboot has
/// passed it is zero, otherwise the remaining time plus one second.
pub fn time_until_next_remediation(
    last_remediated: Option<DateTime<Utc>>,
    timeout: Duration,
    now: DateTime<Utc>,
) -> Duration {
    let Some(last) = last_remediated else {
        return timeout;
    };
    let elapsed = now
        .signed_duration_since(last)
        .to_std()
        .unwrap_or(Duration::ZERO);
    if elapsed > timeout {
        return Duration::ZERO;
    }
    timeout - elapsed + REMEDIATION_PAD
}

/// A retry limit of zero allows the first reboot only.
pub fn retries_exhausted(retry_limit: i32, retry_count: i32) -> bool {
    retry_limit <= 0 || retry_count >= retry_limit
}

fn strategy_timeout(strategy: &RemediationStrategy) -> Result<Duration> {
    strategy
        .timeout()
        .map_err(|e| Error::ValidationError(format!("invalid remediation timeout: {e}")))
}

/// Give the machine back to its owner, which deletes it.
fn mark_owner_remediated(machine: &mut Machine, message: &str) {
    mark_false(
        &mut machine.conditions,
        MACHINE_OWNER_REMEDIATED_CONDITION,
        WAITING_FOR_REMEDIATION_REASON,
        ConditionSeverity::Warning,
        message,
    );
}
