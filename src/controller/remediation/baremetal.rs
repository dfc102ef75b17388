//! Remediation of bare metal hosts
//!
//! The remediation never talks to Robot itself: it sets the reboot annotation on the host and
//! leaves the reboot to the host state machine.

use chrono::{DateTime, Utc};
use kube::ResourceExt;
use tracing::{info, instrument};

use super::{
    mark_owner_remediated, retries_exhausted, strategy_timeout, time_until_next_remediation,
};
use crate::controller::action::ReconcileOutcome;
use crate::crd::{
    ErrorType, HetznerBareMetalHost, ProvisioningState, RebootAnnotationArguments, RebootType,
    RemediationPhase, REBOOT_ANNOTATION, REMEDIATION_TYPE_REBOOT,
};
use crate::error::{Error, Result};
use crate::scope::BareMetalRemediationScope;

const REMEDIATION_FAILED_MESSAGE: &str = "remediation through reboot failed";

pub struct BareMetalRemediationService<'a> {
    scope: &'a mut BareMetalRemediationScope,
}

impl<'a> BareMetalRemediationService<'a> {
    pub fn new(scope: &'a mut BareMetalRemediationScope) -> Self {
        Self { scope }
    }

    #[instrument(skip(self), fields(name = %self.scope.remediation.name_any(), namespace = self.scope.remediation.namespace()))]
    pub async fn reconcile(&mut self) -> Result<ReconcileOutcome> {
        self.reconcile_at(Utc::now()).await
    }

    pub(super) async fn reconcile_at(&mut self, now: DateTime<Utc>) -> Result<ReconcileOutcome> {
        let host = match self.get_host().await {
            Ok(Some(host)) => host,
            Ok(None) => {
                return self
                    .exit_remediation("exit remediation because the HetznerBareMetalHost was not found")
                    .await
            }
            Err(e) => {
                let err = e.context("failed to find the unhealthy host");
                self.scope
                    .recorder
                    .warn("FailedToFindHost", err.to_string())
                    .await;
                return Err(err);
            }
        };

        let status = &host.spec.status;
        if status.provisioning_state != ProvisioningState::Provisioned {
            info!(
                state = status.provisioning_state.as_str(),
                "Deleting host without remediation"
            );
            return self
                .exit_remediation("exit remediation because the host is not provisioned")
                .await;
        }
        if matches!(
            status.error_type,
            ErrorType::FatalError | ErrorType::PermanentError
        ) {
            let message = format!(
                "exit remediation because the host has a {}: {}",
                status.error_type, status.error_message
            );
            return self.exit_remediation(&message).await;
        }

        let strategy = self.scope.remediation.spec.strategy.clone();
        if strategy.type_ != REMEDIATION_TYPE_REBOOT {
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
                    self.remediate(&host, now).await?;
                }

                let status = self.scope.status_mut();
                if retries_exhausted(strategy.retry_limit, status.retry_count) {
                    status.phase = Some(RemediationPhase::Waiting);
                    return Ok(ReconcileOutcome::after(time_until_next_remediation(
                        self.last_remediated(),
                        timeout,
                        now,
                    )));
                }

                let next = time_until_next_remediation(self.last_remediated(), timeout, now);
                if !next.is_zero() {
                    return Ok(ReconcileOutcome::after(next));
                }
                self.remediate(&host, now).await?;
                Ok(ReconcileOutcome::after(timeout))
            }
            RemediationPhase::Waiting => {
                let next = time_until_next_remediation(self.last_remediated(), timeout, now);
                if !next.is_zero() {
                    return Ok(ReconcileOutcome::after(next));
                }
                self.scope.status_mut().phase = Some(RemediationPhase::Deleting);
                mark_owner_remediated(&mut self.scope.machine, REMEDIATION_FAILED_MESSAGE);
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

    /// The host named by the machine's host annotation; `None` when it is unknown or gone.
    async fn get_host(&self) -> Result<Option<HetznerBareMetalHost>> {
        let Some((namespace, name)) = self.scope.host_key()? else {
            return Ok(None);
        };
        self.scope.hosts.get_host(namespace, name).await
    }

    async fn exit_remediation(&mut self, message: &str) -> Result<ReconcileOutcome> {
        self.scope.status_mut().phase = Some(RemediationPhase::Deleting);
        mark_owner_remediated(&mut self.scope.machine, REMEDIATION_FAILED_MESSAGE);
        self.scope.recorder.warn("ExitRemediation", message).await;
        Ok(ReconcileOutcome::done())
    }

    /// Ask the host for a hardware reboot, unless it is in maintenance mode.
    async fn remediate(&mut self, host: &HetznerBareMetalHost, now: DateTime<Utc>) -> Result<()> {
        if host.spec.maintenance_mode {
            info!(host = %host.name_any(), "Host is in maintenance mode, not rebooting it");
        } else {
            let value = serde_json::to_string(&RebootAnnotationArguments {
                type_: RebootType::Hardware,
            })?;
            self.scope
                .hosts
                .set_annotation(
                    host.namespace().unwrap_or_default(),
                    host.name_any(),
                    REBOOT_ANNOTATION.to_string(),
                    value,
                )
                .await
                .map_err(|e: Error| e.context(format!("failed to patch host {}", host.name_any())))?;
            self.scope
                .recorder
                .normal(
                    "RebootRequested",
                    format!("Requested a hardware reboot of host {}", host.name_any()),
                )
                .await;
        }

        let status = self.scope.status_mut();
        status.last_remediated = Some(now.to_rfc3339());
        status.retry_count += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    use k8s_openapi::api::core::v1::ObjectReference;

    use crate::controller::conditions::{is_condition_false, MACHINE_OWNER_REMEDIATED_CONDITION};
    use crate::controller::events::{MemoryEventSink, Recorder};
    use crate::controller::remediation::MockHostRepository;
    use crate::crd::{
        ControllerGeneratedStatus, HetznerBareMetalHostSpec, HetznerBareMetalMachine,
        HetznerBareMetalMachineSpec, HetznerBareMetalRemediation, HetznerBareMetalRemediationSpec,
        RemediationStatus, RemediationStrategy, HOST_ANNOTATION,
    };
    use crate::scope::Machine;

    fn host(state: ProvisioningState, maintenance_mode: bool) -> HetznerBareMetalHost {
        let mut host = HetznerBareMetalHost::new(
            "bm-0",
            HetznerBareMetalHostSpec {
                server_id: 42,
                root_device_hints: None,
                consumer_ref: None,
                maintenance_mode,
                description: String::new(),
                status: ControllerGeneratedStatus {
                    provisioning_state: state,
                    ..Default::default()
                },
            },
        );
        host.metadata.namespace = Some("default".into());
        host
    }

    fn scope(
        hosts: MockHostRepository,
        status: Option<RemediationStatus>,
    ) -> (BareMetalRemediationScope, Arc<MemoryEventSink>) {
        let sink = Arc::new(MemoryEventSink::new());
        let mut remediation = HetznerBareMetalRemediation::new(
            "m1",
            HetznerBareMetalRemediationSpec {
                strategy: RemediationStrategy {
                    type_: REMEDIATION_TYPE_REBOOT.into(),
                    retry_limit: 1,
                    timeout: "5m".into(),
                },
            },
        );
        remediation.status = status;

        let mut bare_metal_machine =
            HetznerBareMetalMachine::new("m1", HetznerBareMetalMachineSpec { server_id: 42 });
        bare_metal_machine.metadata.annotations = Some(BTreeMap::from([(
            HOST_ANNOTATION.to_string(),
            "default/bm-0".to_string(),
        )]));

        let scope = BareMetalRemediationScope {
            remediation,
            machine: Machine {
                name: "m1".into(),
                namespace: "default".into(),
                ..Default::default()
            },
            bare_metal_machine,
            hosts: Arc::new(hosts),
            recorder: Recorder::new(
                sink.clone(),
                ObjectReference {
                    kind: Some("HetznerBareMetalRemediation".into()),
                    name: Some("m1".into()),
                    ..Default::default()
                },
            ),
        };
        (scope, sink)
    }

    fn returns(hosts: &mut MockHostRepository, host: HetznerBareMetalHost) {
        hosts
            .expect_get_host()
            .withf(|namespace: &String, name: &String| namespace == "default" && name == "bm-0")
            .returning(move |_, _| Ok(Some(host.clone())));
    }

    #[tokio::test]
    async fn test_first_pass_sets_reboot_annotation() {
        let mut hosts = MockHostRepository::new();
        returns(&mut hosts, host(ProvisioningState::Provisioned, false));
        hosts
            .expect_set_annotation()
            .withf(|_, name, key, value| {
                name == "bm-0" && key == REBOOT_ANNOTATION && value == r#"{"type":"hw"}"#
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let (mut scope, sink) = scope(hosts, None);
        let outcome = BareMetalRemediationService::new(&mut scope)
            .reconcile_at(Utc::now())
            .await
            .unwrap();

        // retry limit 1 is used up by the first reboot
        assert_eq!(outcome, ReconcileOutcome::after(Duration::from_secs(301)));
        let status = scope.remediation.status.clone().unwrap();
        assert_eq!(status.phase, Some(RemediationPhase::Waiting));
        assert_eq!(status.retry_count, 1);
        assert!(sink.has_reason("RebootRequested"));
    }

    #[tokio::test]
    async fn test_maintenance_mode_skips_reboot() {
        let mut hosts = MockHostRepository::new();
        returns(&mut hosts, host(ProvisioningState::Provisioned, true));
        hosts.expect_set_annotation().times(0);

        let (mut scope, _) = scope(hosts, None);
        BareMetalRemediationService::new(&mut scope)
            .reconcile_at(Utc::now())
            .await
            .unwrap();

        assert_eq!(scope.remediation.status.as_ref().unwrap().retry_count, 1);
    }

    #[tokio::test]
    async fn test_unprovisioned_host_exits_remediation() {
        let mut hosts = MockHostRepository::new();
        returns(&mut hosts, host(ProvisioningState::ImageInstalling, false));
        hosts.expect_set_annotation().times(0);

        let (mut scope, sink) = scope(hosts, None);
        BareMetalRemediationService::new(&mut scope)
            .reconcile_at(Utc::now())
            .await
            .unwrap();

        assert!(is_condition_false(
            &scope.machine.conditions,
            MACHINE_OWNER_REMEDIATED_CONDITION
        ));
        assert!(sink.has_reason("ExitRemediation"));
    }

    #[tokio::test]
    async fn test_missing_host_exits_remediation() {
        let mut hosts = MockHostRepository::new();
        hosts.expect_get_host().returning(|_, _| Ok(None));

        let (mut scope, _) = scope(hosts, None);
        BareMetalRemediationService::new(&mut scope)
            .reconcile_at(Utc::now())
            .await
            .unwrap();

        assert_eq!(
            scope.remediation.status.as_ref().unwrap().phase,
            Some(RemediationPhase::Deleting)
        );
    }

    #[tokio::test]
    async fn test_fatal_host_error_exits_remediation() {
        let mut hosts = MockHostRepository::new();
        let mut broken = host(ProvisioningState::Provisioned, false);
        broken.spec.status.error_type = ErrorType::FatalError;
        returns(&mut hosts, broken);
        hosts.expect_set_annotation().times(0);

        let (mut scope, _) = scope(hosts, None);
        BareMetalRemediationService::new(&mut scope)
            .reconcile_at(Utc::now())
            .await
            .unwrap();

        assert!(is_condition_false(
            &scope.machine.conditions,
            MACHINE_OWNER_REMEDIATED_CONDITION
        ));
    }

    #[tokio::test]
    async fn test_waiting_until_timeout() {
        let mut hosts = MockHostRepository::new();
        returns(&mut hosts, host(ProvisioningState::Provisioned, false));

        let now = Utc::now();
        let (mut scope, _) = scope(
            hosts,
            Some(RemediationStatus {
                phase: Some(RemediationPhase::Waiting),
                retry_count: 1,
                last_remediated: Some((now - chrono::Duration::minutes(1)).to_rfc3339()),
                conditions: vec![],
            }),
        );
        let outcome = BareMetalRemediationService::new(&mut scope)
            .reconcile_at(now)
            .await
            .unwrap();

        assert_eq!(outcome, ReconcileOutcome::after(Duration::from_secs(241)));
        assert_eq!(
            scope.remediation.status.as_ref().unwrap().phase,
            Some(RemediationPhase::Waiting)
        );
    }
}
