//! Inventory sync of bare metal machines
//!
//! Mirrors what Robot reports about a server onto its HetznerBareMetalMachine and into the
//! cluster wide inventory.

use std::sync::Arc;

use kube::ResourceExt;
use tracing::{info, instrument};

use crate::controller::action::ReconcileOutcome;
use crate::crd::BareMetalMachineHostStatus;
use crate::error::{Error, Result};
use crate::robot::{RobotClient, RobotErrorCode, RobotServer};
use crate::scope::BareMetalMachineScope;

pub struct InventoryService<'a> {
    scope: &'a mut BareMetalMachineScope,
}

impl<'a> InventoryService<'a> {
    pub fn new(scope: &'a mut BareMetalMachineScope) -> Self {
        Self { scope }
    }

    fn server_id(&self) -> i32 {
        self.scope.bare_metal_machine.spec.server_id
    }

    #[instrument(skip(self), fields(name = %self.scope.bare_metal_machine.name_any(), namespace = self.scope.bare_metal_machine.namespace()))]
    pub async fn reconcile(&mut self) -> Result<ReconcileOutcome> {
        info!(server_id = self.server_id(), "Reconciling bare metal machine");

        let robot = self.robot().await?;
        let server = match robot.get_bm_server(self.server_id()).await {
            Ok(server) => server,
            Err(e) if e.is_rate_limit() => {
                let wait = self.scope.settings.robot_rate_limit_requeue();
                self.scope
                    .recorder
                    .warn(
                        "HRobotRateLimitExceeded",
                        format!(
                            "HRobot rate limit exceeded. Wait for {} sec before trying again.",
                            wait.as_secs()
                        ),
                    )
                    .await;
                return Ok(ReconcileOutcome::after(wait));
            }
            Err(e) if e.is(RobotErrorCode::ServerNotFound) => {
                let message = format!(
                    "No matching bare metal machine found with ID {}",
                    self.server_id()
                );
                self.scope
                    .recorder
                    .warn("BareMetalMachineNotFound", &message)
                    .await;
                return Err(Error::ReconcileError(message));
            }
            Err(e) => return Err(Error::from(e).context("failed to get instance")),
        };

        self.scope.set_status(status_from_api(&server));
        Ok(ReconcileOutcome::done())
    }

    /// Nothing to clean up at the provider, the server stays in the Robot account.
    #[instrument(skip(self), fields(name = %self.scope.bare_metal_machine.name_any(), namespace = self.scope.bare_metal_machine.namespace()))]
    pub async fn delete(&mut self) -> Result<ReconcileOutcome> {
        self.scope
            .recorder
            .normal(
                "BareMetalMachineDeleted",
                format!(
                    "Bare metal inventory machine with ID {} deleted",
                    self.server_id()
                ),
            )
            .await;
        Ok(ReconcileOutcome::done())
    }

    async fn robot(&self) -> Result<Arc<dyn RobotClient>> {
        let has_user = !self
            .scope
            .hetzner_cluster
            .spec
            .hetzner_secret_ref
            .key
            .hetzner_robot_user
            .is_empty();
        match &self.scope.robot {
            Some(robot) if has_user => Ok(robot.clone()),
            _ => {
                self.scope
                    .recorder
                    .warn("NoTokenFound", "No HRobot token found")
                    .await;
                Err(Error::ConfigError(
                    "no token for Hetzner Robot provided - cannot reconcile bare metal server"
                        .to_string(),
                ))
            }
        }
    }
}

pub fn status_from_api(server: &RobotServer) -> BareMetalMachineHostStatus {
    BareMetalMachineHostStatus {
        hetzner_status: server.status.clone(),
        id: server.server_number,
        name: server.server_name.clone(),
        data_center: server.dc.clone(),
        paid_until: server.paid_until.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use k8s_openapi::api::core::v1::ObjectReference;

    use crate::config::Settings;
    use crate::controller::events::{MemoryEventSink, Recorder};
    use crate::crd::{
        HetznerBareMetalMachine, HetznerBareMetalMachineSpec, HetznerCluster, HetznerClusterSpec,
        HetznerSecretRef,
    };
    use crate::robot::{MockRobotClient, RobotError};

    fn scope(robot: Option<MockRobotClient>) -> (BareMetalMachineScope, Arc<MemoryEventSink>) {
        let sink = Arc::new(MemoryEventSink::new());
        let mut secret_ref = HetznerSecretRef::default();
        secret_ref.key.hetzner_robot_user = "robot-user".into();

        let scope = BareMetalMachineScope {
            hetzner_cluster: HetznerCluster::new(
                "c1",
                HetznerClusterSpec {
                    control_plane_endpoint: None,
                    control_plane_load_balancer: Default::default(),
                    control_plane_regions: vec![],
                    ssh_keys: Default::default(),
                    hetzner_secret_ref: secret_ref,
                },
            ),
            bare_metal_machine: HetznerBareMetalMachine::new(
                "bm-m1",
                HetznerBareMetalMachineSpec { server_id: 321 },
            ),
            robot: robot.map(|r| Arc::new(r) as Arc<dyn RobotClient>),
            settings: Settings::default(),
            recorder: Recorder::new(
                sink.clone(),
                ObjectReference {
                    kind: Some("HetznerBareMetalMachine".into()),
                    name: Some("bm-m1".into()),
                    ..Default::default()
                },
            ),
        };
        (scope, sink)
    }

    #[tokio::test]
    async fn test_copies_server_into_status_and_inventory() {
        let mut robot = MockRobotClient::new();
        robot
            .expect_get_bm_server()
            .withf(|id| *id == 321)
            .returning(|_| {
                Ok(RobotServer {
                    server_number: 321,
                    server_name: "bm-m1".into(),
                    status: "ready".into(),
                    dc: "FSN1-DC14".into(),
                    paid_until: "2026-12-31".into(),
                    ..Default::default()
                })
            });

        let (mut scope, _) = scope(Some(robot));
        let outcome = InventoryService::new(&mut scope).reconcile().await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::done());
        let expected = BareMetalMachineHostStatus {
            hetzner_status: "ready".into(),
            id: 321,
            name: "bm-m1".into(),
            data_center: "FSN1-DC14".into(),
            paid_until: "2026-12-31".into(),
        };
        assert_eq!(scope.bare_metal_machine.status.as_ref(), Some(&expected));
        let inventory = &scope.hetzner_cluster.status.as_ref().unwrap().bare_metal_inventory;
        assert_eq!(inventory.get("321"), Some(&expected));
    }

    #[tokio::test]
    async fn test_rate_limit_requeues() {
        let mut robot = MockRobotClient::new();
        robot.expect_get_bm_server().returning(|_| {
            Err(RobotError::new(RobotErrorCode::RateLimitExceeded, "limit"))
        });

        let (mut scope, sink) = scope(Some(robot));
        let outcome = InventoryService::new(&mut scope).reconcile().await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::after(Duration::from_secs(660)));
        assert!(scope.bare_metal_machine.status.is_none());
        assert!(sink.has_reason("HRobotRateLimitExceeded"));
    }

    #[tokio::test]
    async fn test_server_not_found() {
        let mut robot = MockRobotClient::new();
        robot.expect_get_bm_server().returning(|_| {
            Err(RobotError::new(RobotErrorCode::ServerNotFound, "server not found"))
        });

        let (mut scope, sink) = scope(Some(robot));
        assert!(InventoryService::new(&mut scope).reconcile().await.is_err());
        assert!(sink.has_reason("BareMetalMachineNotFound"));
    }

    #[tokio::test]
    async fn test_missing_credentials() {
        let (mut scope, sink) = scope(None);
        let result = InventoryService::new(&mut scope).reconcile().await;

        assert!(matches!(result, Err(Error::ConfigError(_))));
        assert!(sink.has_reason("NoTokenFound"));
    }

    #[tokio::test]
    async fn test_delete_only_records_event() {
        let (mut scope, sink) = scope(Some(MockRobotClient::new()));
        InventoryService::new(&mut scope).delete().await.unwrap();
        assert_eq!(sink.reasons(), vec!["BareMetalMachineDeleted".to_string()]);
    }
}
