//! Remediation of HCloud servers through the HCloud reboot action

use chrono::{DateTime, Utc};
use kube::ResourceExt;
use tracing::{error, info, instrument};

use super::{
    mark_owner_remediated, retries_exhausted, strategy_timeout, time_until_next_remediation,
};
use crate::controller::action::ReconcileOutcome;
use crate::controller::conditions::{
    mark_false, HETZNER_API_REACHABLE_CONDITION, RATE_LIMIT_EXCEEDED_REASON,
};
use crate::crd::{ConditionSeverity, RemediationPhase, REMEDIATION_TYPE_REBOOT};
use crate::error::{Error, Result};
use crate::hcloud::{server_id_from_provider_id, HCloudError, Server};
use crate::scope::HCloudRemediationScope;

pub struct HCloudRemediationService<'a> {
    scope: &'a mut HCloudRemediationScope,
}

impl<'a> HCloudRemediationService<'a> {
    pub fn new(scope: &'a mut HCloudRemediationScope) -> Self {
        Self { scope }
    }

    #[instrument(skip(self), fields(name = %self.scope.remediation.name_any(), namespace = self.scope.remediation.namespace()))]
    pub async fn reconcile(&mut self) -> Result<ReconcileOutcome> {
        self.reconcile_at(Utc::now()).await
    }

    pub(super) async fn reconcile_at(&mut self, now: DateTime<Utc>) -> Result<ReconcileOutcome> {
        let Some(server) = self
            .find_server()
            .await
            .map_err(|e| e.context("failed to find the server of unhealthy machine"))?
        else {
            let provider_id = self
                .scope
                .hcloud_machine
                .spec
                .provider_id
                .clone()
                .unwrap_or_else(|| "nil".to_string());
            let message = format!(
                "exit remediation because hcloud server (providerID={provider_id}) does not exist"
            );
            error!("{}", message);
            self.scope.status_mut().phase = Some(RemediationPhase::Deleting);
            mark_owner_remediated(&mut self.scope.machine, &message);
            self.scope.recorder.warn("ExitRemediation", &message).await;
            return Ok(ReconcileOutcome::done());
        };

        let strategy = self.scope.remediation.spec.strategy.clone();
        if strategy.type_ != REMEDIATION_TYPE_REBOOT {
            info!(strategy = %strategy.type_, "Unsupported remediation strategy");
            self.scope
                .recorder
                .warn(
                    "UnsupportedRemediationStrategy",
                    format!("remediation strategy {:?} is unsupported", strategy.type_),
                )
                .await;
            return Ok(ReconcileOutcome::done());
        }
        let timeout = strategy_timeout(&strategy)?;

        let phase = *self
            .scope
            .status_mut()
            .phase
            .get_or_insert(RemediationPhase::Running);

        match phase {
            RemediationPhase::Running => {
                if self.last_remediated().is_none() {
                    self.reboot(&server, now).await?;
                }

                let status = self.scope.status_mut();
                if retries_exhausted(strategy.retry_limit, status.retry_count) {
                    status.phase = Some(RemediationPhase::Waiting);
                    return Ok(requeue(time_until_next_remediation(
                        self.last_remediated(),
                        timeout,
                        now,
                    )));
                }

                let next = time_until_next_remediation(self.last_remediated(), timeout, now);
                if !next.is_zero() {
                    return Ok(ReconcileOutcome::after(next));
                }
                self.reboot(&server, now).await?;
                Ok(ReconcileOutcome::after(timeout))
            }
            RemediationPhase::Waiting => {
                let next = time_until_next_remediation(self.last_remediated(), timeout, now);
                if !next.is_zero() {
                    return Ok(ReconcileOutcome::after(next));
                }

                self.scope.status_mut().phase = Some(RemediationPhase::Deleting);
                mark_owner_remediated(&mut self.scope.machine, "remediation through reboot failed");
                self.scope
                    .recorder
                    .normal(
                        "SetOwnerRemediatedCondition",
                        "exit remediation because retryLimit is reached and reboot timed out",
                    )
                    .await;
                Ok(ReconcileOutcome::done())
            }
            RemediationPhase::Deleting => Ok(ReconcileOutcome::done()),
        }
    }

    fn last_remediated(&self) -> Option<DateTime<Utc>> {
        self.scope
            .remediation
            .status
            .as_ref()
            .and_then(|s| s.last_remediated())
    }

    async fn find_server(&mut self) -> Result<Option<Server>> {
        let provider_id = self.scope.hcloud_machine.spec.provider_id.clone();
        if provider_id.as_deref().map_or(true, str::is_empty) {
            return Ok(None);
        }
        let server_id = server_id_from_provider_id(provider_id.as_deref())?;

        match self.scope.hcloud.get_server(server_id).await {
            Ok(server) => Ok(server),
            Err(e) => {
                self.handle_rate_limit(&e, "GetServer").await;
                Err(Error::from(e).context("failed to get server"))
            }
        }
    }

    async fn reboot(&mut self, server: &Server, now: DateTime<Utc>) -> Result<()> {
        if let Err(e) = self.scope.hcloud.reboot_server(server.id).await {
            self.handle_rate_limit(&e, "RebootServer").await;
            self.scope
                .recorder
                .warn("FailedRebootServer", e.to_string())
                .await;
            return Err(Error::from(e).context(format!(
                "failed to reboot server {} with ID {}",
                server.name, server.id
            )));
        }
        self.scope
            .recorder
            .normal("ServerRebooted", "Server has been rebooted")
            .await;

        let status = self.scope.status_mut();
        status.last_remediated = Some(now.to_rfc3339());
        status.retry_count += 1;
        Ok(())
    }

    /// Throttling shows up on the HCloudMachine, where operators look for it.
    async fn handle_rate_limit(&mut self, err: &HCloudError, function: &str) {
        if !err.is_rate_limit() {
            return;
        }
        let message = format!("exceeded hcloud rate limit with calling function {function:?}");
        let status = self
            .scope
            .hcloud_machine
            .status
            .get_or_insert_with(Default::default);
        mark_false(
            &mut status.conditions,
            HETZNER_API_REACHABLE_CONDITION,
            RATE_LIMIT_EXCEEDED_REASON,
            ConditionSeverity::Warning,
            message.as_str(),
        );
        self.scope.recorder.warn("RateLimitExceeded", &message).await;
    }
}

fn requeue(after: std::time::Duration) -> ReconcileOutcome {
    if after.is_zero() {
        ReconcileOutcome::now()
    } else {
        ReconcileOutcome::after(after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    use k8s_openapi::api::core::v1::ObjectReference;

    use crate::controller::conditions::{
        is_condition_false, reason, MACHINE_OWNER_REMEDIATED_CONDITION,
    };
    use crate::controller::events::{MemoryEventSink, Recorder};
    use crate::crd::{
        HCloudMachine, HCloudMachineSpec, HCloudRemediation, HCloudRemediationSpec,
        RemediationStatus, RemediationStrategy,
    };
    use crate::hcloud::{HCloudErrorCode, MockHCloudClient, PublicNet, ServerStatus};
    use crate::scope::Machine;

    fn server() -> Server {
        Server {
            id: 1,
            name: "m1".into(),
            status: ServerStatus::Running,
            public_net: PublicNet::default(),
            private_net: vec![],
            labels: BTreeMap::new(),
        }
    }

    fn scope(
        hcloud: MockHCloudClient,
        retry_limit: i32,
        status: Option<RemediationStatus>,
    ) -> (HCloudRemediationScope, Arc<MemoryEventSink>) {
        let sink = Arc::new(MemoryEventSink::new());
        let mut remediation = HCloudRemediation::new(
            "m1",
            HCloudRemediationSpec {
                strategy: RemediationStrategy {
                    type_: REMEDIATION_TYPE_REBOOT.into(),
                    retry_limit,
                    timeout: "1m".into(),
                },
            },
        );
        remediation.status = status;

        let scope = HCloudRemediationScope {
            remediation,
            machine: Machine {
                name: "m1".into(),
                namespace: "default".into(),
                ..Default::default()
            },
            hcloud_machine: HCloudMachine::new(
                "m1",
                HCloudMachineSpec {
                    provider_id: Some("hcloud://1".into()),
                    type_: "cpx31".into(),
                    image_name: "ubuntu-24.04".into(),
                    ssh_keys: vec![],
                    placement_group_name: None,
                },
            ),
            hcloud: Arc::new(hcloud),
            recorder: Recorder::new(
                sink.clone(),
                ObjectReference {
                    kind: Some("HCloudRemediation".into()),
                    name: Some("m1".into()),
                    ..Default::default()
                },
            ),
        };
        (scope, sink)
    }

    fn found(hcloud: &mut MockHCloudClient) {
        hcloud
            .expect_get_server()
            .withf(|id| *id == 1)
            .returning(|_| Ok(Some(server())));
    }

    fn phase(scope: &HCloudRemediationScope) -> Option<RemediationPhase> {
        scope.remediation.status.as_ref().and_then(|s| s.phase)
    }

    #[tokio::test]
    async fn test_first_pass_reboots() {
        let mut hcloud = MockHCloudClient::new();
        found(&mut hcloud);
        hcloud.expect_reboot_server().times(1).returning(|_| Ok(()));

        let (mut scope, sink) = scope(hcloud, 2, None);
        let now = Utc::now();
        let outcome = HCloudRemediationService::new(&mut scope)
            .reconcile_at(now)
            .await
            .unwrap();

        assert_eq!(outcome, ReconcileOutcome::after(Duration::from_secs(61)));
        let status = scope.remediation.status.clone().unwrap();
        assert_eq!(status.retry_count, 1);
        assert_eq!(status.phase, Some(RemediationPhase::Running));
        assert_eq!(status.last_remediated, Some(now.to_rfc3339()));
        assert!(sink.has_reason("ServerRebooted"));
    }

    #[tokio::test]
    async fn test_unusable_timeout_is_rejected_without_reboot() {
        for timeout in ["99999999999999999999h", "5d"] {
            let mut hcloud = MockHCloudClient::new();
            found(&mut hcloud);
            hcloud.expect_reboot_server().never();

            let (mut scope, _) = scope(hcloud, 2, None);
            scope.remediation.spec.strategy.timeout = timeout.into();
            let result = HCloudRemediationService::new(&mut scope)
                .reconcile_at(Utc::now())
                .await;

            assert!(
                matches!(result, Err(Error::ValidationError(_))),
                "timeout {timeout:?}: {result:?}"
            );
            assert!(phase(&scope).is_none());
        }
    }

    #[tokio::test]
    async fn test_zero_retry_limit_waits_after_first_reboot() {
        let mut hcloud = MockHCloudClient::new();
        found(&mut hcloud);
        hcloud.expect_reboot_server().times(1).returning(|_| Ok(()));

        let (mut scope, _) = scope(hcloud, 0, None);
        HCloudRemediationService::new(&mut scope)
            .reconcile_at(Utc::now())
            .await
            .unwrap();

        assert_eq!(phase(&scope), Some(RemediationPhase::Waiting));
    }

    #[tokio::test]
    async fn test_reboots_again_after_timeout() {
        let mut hcloud = MockHCloudClient::new();
        found(&mut hcloud);
        hcloud.expect_reboot_server().times(1).returning(|_| Ok(()));

        let now = Utc::now();
        let (mut scope, _) = scope(
            hcloud,
            3,
            Some(RemediationStatus {
                phase: Some(RemediationPhase::Running),
                retry_count: 1,
                last_remediated: Some((now - chrono::Duration::minutes(2)).to_rfc3339()),
                conditions: vec![],
            }),
        );
        HCloudRemediationService::new(&mut scope)
            .reconcile_at(now)
            .await
            .unwrap();

        assert_eq!(scope.remediation.status.as_ref().unwrap().retry_count, 2);
    }

    #[tokio::test]
    async fn test_waiting_hands_over_to_owner() {
        let mut hcloud = MockHCloudClient::new();
        found(&mut hcloud);
        hcloud.expect_reboot_server().times(0);

        let now = Utc::now();
        let (mut scope, sink) = scope(
            hcloud,
            1,
            Some(RemediationStatus {
                phase: Some(RemediationPhase::Waiting),
                retry_count: 1,
                last_remediated: Some((now - chrono::Duration::minutes(2)).to_rfc3339()),
                conditions: vec![],
            }),
        );
        HCloudRemediationService::new(&mut scope)
            .reconcile_at(now)
            .await
            .unwrap();

        assert_eq!(phase(&scope), Some(RemediationPhase::Deleting));
        assert!(is_condition_false(
            &scope.machine.conditions,
            MACHINE_OWNER_REMEDIATED_CONDITION
        ));
        assert!(sink.has_reason("SetOwnerRemediatedCondition"));
    }

    #[tokio::test]
    async fn test_missing_server_exits_remediation() {
        let mut hcloud = MockHCloudClient::new();
        hcloud.expect_get_server().returning(|_| Ok(None));

        let (mut scope, sink) = scope(hcloud, 1, None);
        HCloudRemediationService::new(&mut scope)
            .reconcile_at(Utc::now())
            .await
            .unwrap();

        assert_eq!(phase(&scope), Some(RemediationPhase::Deleting));
        assert!(sink.has_reason("ExitRemediation"));
    }

    #[tokio::test]
    async fn test_unsupported_strategy() {
        let mut hcloud = MockHCloudClient::new();
        found(&mut hcloud);
        hcloud.expect_reboot_server().times(0);

        let (mut scope, sink) = scope(hcloud, 1, None);
        scope.remediation.spec.strategy.type_ = "Replace".into();
        HCloudRemediationService::new(&mut scope)
            .reconcile_at(Utc::now())
            .await
            .unwrap();

        assert_eq!(phase(&scope), None);
        assert!(sink.has_reason("UnsupportedRemediationStrategy"));
    }

    #[tokio::test]
    async fn test_rate_limited_reboot() {
        let mut hcloud = MockHCloudClient::new();
        found(&mut hcloud);
        hcloud.expect_reboot_server().returning(|_| {
            Err(HCloudError::new(HCloudErrorCode::RateLimitExceeded, "limit"))
        });

        let (mut scope, _) = scope(hcloud, 1, None);
        let result = HCloudRemediationService::new(&mut scope)
            .reconcile_at(Utc::now())
            .await;

        assert!(result.is_err());
        let conditions = &scope.hcloud_machine.status.as_ref().unwrap().conditions;
        assert_eq!(
            reason(conditions, HETZNER_API_REACHABLE_CONDITION),
            RATE_LIMIT_EXCEEDED_REASON
        );
        assert_eq!(scope.remediation.status.as_ref().unwrap().retry_count, 0);
    }
}
