//! HCloud server reconciler
//!
//! Drives one HCloudMachine to a running server: creates it on first sight, powers it on,
//! attaches it to the cluster network and, for control plane machines, registers it with the
//! API server load balancer before declaring the machine ready.

use std::collections::BTreeMap;
use std::net::Ipv6Addr;
use std::time::Duration;

use chrono::Utc;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use crate::controller::action::ReconcileOutcome;
use crate::controller::conditions::{
    is_condition_false, last_transition_time, mark_false, mark_true, reason,
    HETZNER_API_REACHABLE_CONDITION, INSTANCE_READY_CONDITION, INSTANCE_TERMINATED_REASON,
    LOAD_BALANCER_ATTACHED_TO_NETWORK_CONDITION, RATE_LIMIT_EXCEEDED_REASON,
};
use crate::controller::failure_domain::resolve_failure_domain;
use crate::crd::{ConditionSeverity, MachineAddress, MachineAddressType};
use crate::error::{Error, Result};
use crate::hcloud::{
    label_selector, HCloudError, HCloudErrorCode, ImageListOpts, Server, ServerCreateOpts,
    ServerStatus,
};
use crate::scope::MachineScope;

/// Label holding the machine name on its server
pub const MACHINE_NAME_LABEL: &str = "machine.caph-name";

/// Label telling control plane and worker servers apart
pub const MACHINE_TYPE_LABEL: &str = "machine_type";

/// Label an image is matched by besides its name
pub const IMAGE_NAME_LABEL: &str = "caph-image-name";

const BOOTSTRAP_REQUEUE: Duration = Duration::from_secs(10);
const TRANSITION_REQUEUE: Duration = Duration::from_secs(2);
const SHUTDOWN_REQUEUE: Duration = Duration::from_secs(30);
const DELETE_TRANSITION_REQUEUE: Duration = Duration::from_secs(5);

/// Time a server gets to shut down gracefully before it is deleted anyway
pub const MAX_SHUTDOWN_TIME: Duration = Duration::from_secs(120);

pub struct ServerService<'a> {
    scope: &'a mut MachineScope,
}

impl<'a> ServerService<'a> {
    pub fn new(scope: &'a mut MachineScope) -> Self {
        Self { scope }
    }

    #[instrument(skip(self), fields(name = %self.scope.hcloud_machine.name_any(), namespace = self.scope.hcloud_machine.namespace()))]
    pub async fn reconcile(&mut self) -> Result<ReconcileOutcome> {
        if self
            .scope
            .cluster
            .hcloud_token
            .as_deref()
            .map_or(true, str::is_empty)
        {
            self.scope
                .recorder
                .warn("NoTokenFound", "No HCloudToken found")
                .await;
            return Err(Error::ConfigError(
                "no token for HCloud provided - cannot reconcile hcloud server".to_string(),
            ));
        }

        let failure_domains = self
            .scope
            .cluster
            .status()
            .map(|s| s.failure_domains.clone())
            .unwrap_or_default();
        let region = resolve_failure_domain(
            self.scope.machine.failure_domain.as_deref(),
            &failure_domains,
            &self.scope.name(),
            self.scope.is_control_plane(),
        )?;
        self.scope.status_mut().region = region;

        if !self.scope.is_bootstrap_data_ready() {
            info!("Bootstrap not ready - requeuing");
            return Ok(ReconcileOutcome::after(BOOTSTRAP_REQUEUE));
        }

        let (server, created) = match self.find_server().await? {
            Some(server) => (server, false),
            None => (self.create_server().await?, true),
        };

        self.set_status_from_api(&server);

        match server.status {
            ServerStatus::Off if !created => {
                if let Err(e) = self.scope.cluster.hcloud.power_on_server(server.id).await {
                    return Err(self.hcloud_call_failed(e, "PowerOnServer").await);
                }
            }
            ServerStatus::Off | ServerStatus::Running => {}
            other => {
                debug!(status = %other, "Server is in a transitional state");
                self.scope.set_ready(false);
                return Ok(ReconcileOutcome::after(TRANSITION_REQUEUE));
            }
        }

        self.reconcile_network_attachment(&server).await?;

        if self.scope.is_control_plane() {
            self.reconcile_load_balancer_attachment(&server).await?;
            self.check_control_plane_ready().await?;
        }

        self.scope.set_provider_id(server.id);
        self.scope.set_ready(true);
        mark_true(
            &mut self.scope.status_mut().conditions,
            INSTANCE_READY_CONDITION,
        );
        Ok(ReconcileOutcome::done())
    }

    #[instrument(skip(self), fields(name = %self.scope.hcloud_machine.name_any(), namespace = self.scope.hcloud_machine.namespace()))]
    pub async fn delete(&mut self) -> Result<ReconcileOutcome> {
        let Some(server) = self.find_server().await? else {
            let message = format!(
                "Unable to find matching HCloud server for {}",
                self.scope.name()
            );
            self.scope.recorder.warn("NoInstanceFound", &message).await;
            return Ok(ReconcileOutcome::done());
        };

        if self.scope.is_control_plane() {
            self.delete_load_balancer_target(&server).await?;
        }

        match server.status {
            ServerStatus::Running => {
                let conditions = self
                    .scope
                    .status()
                    .map(|s| s.conditions.clone())
                    .unwrap_or_default();
                let shutting_down = is_condition_false(&conditions, INSTANCE_READY_CONDITION)
                    && reason(&conditions, INSTANCE_READY_CONDITION) == INSTANCE_TERMINATED_REASON;

                if !shutting_down {
                    return self.shutdown_server(&server).await;
                }

                let since = last_transition_time(&conditions, INSTANCE_READY_CONDITION)
                    .map(|t| Utc::now().signed_duration_since(t))
                    .and_then(|d| d.to_std().ok())
                    .unwrap_or_default();
                if since < MAX_SHUTDOWN_TIME {
                    debug!(?since, "Waiting for the server to shut down");
                    return Ok(ReconcileOutcome::after(SHUTDOWN_REQUEUE));
                }
                warn!("Server did not shut down in time, deleting it");
                self.delete_server(&server).await
            }
            ServerStatus::Off => self.delete_server(&server).await,
            other => {
                debug!(status = %other, "Server is in a transitional state");
                Ok(ReconcileOutcome::after(DELETE_TRANSITION_REQUEUE))
            }
        }
    }

    fn server_labels(&self) -> BTreeMap<String, String> {
        let machine_type = if self.scope.is_control_plane() {
            "control_plane"
        } else {
            "worker"
        };
        BTreeMap::from([
            (self.scope.cluster.cluster_tag_key(), "owned".to_string()),
            (MACHINE_NAME_LABEL.to_string(), self.scope.name()),
            (MACHINE_TYPE_LABEL.to_string(), machine_type.to_string()),
        ])
    }

    async fn find_server(&mut self) -> Result<Option<Server>> {
        let selector = label_selector(&self.server_labels());
        let mut servers = match self.scope.cluster.hcloud.list_servers(selector).await {
            Ok(servers) => servers,
            Err(e) => return Err(self.hcloud_call_failed(e, "ListServers").await),
        };

        if servers.len() > 1 {
            let message = format!(
                "Found {} servers for machine {}, expected at most one",
                servers.len(),
                self.scope.name()
            );
            self.scope.recorder.warn("MultipleInstances", &message).await;
            return Err(Error::ReconcileError(message));
        }
        Ok(servers.pop())
    }

    async fn create_server(&mut self) -> Result<Server> {
        let name = self.scope.name();
        let Some(user_data) = self.scope.bootstrap_data.clone() else {
            self.scope
                .recorder
                .warn("FailedGetBootstrapData", "Bootstrap data is not available")
                .await;
            return Err(Error::ReconcileError(
                "failed to get raw bootstrap data".to_string(),
            ));
        };

        let image_id = self.image_id().await?;
        let placement_group_id = self.placement_group_id()?;
        let ssh_key_ids = self.ssh_key_ids().await?;

        let opts = ServerCreateOpts {
            name: name.clone(),
            server_type: self.scope.hcloud_machine.spec.type_.clone(),
            image_id,
            location: self.scope.status().map(|s| s.region.clone()).unwrap_or_default(),
            placement_group_id,
            ssh_key_ids,
            network_ids: self.scope.cluster.network_id().into_iter().collect(),
            labels: self.server_labels(),
            user_data,
            automount: false,
            start_after_create: true,
        };

        match self.scope.cluster.hcloud.create_server(opts).await {
            Ok(server) => {
                self.scope
                    .recorder
                    .normal(
                        "SuccessfulCreate",
                        format!("Created new server with id {}", server.id),
                    )
                    .await;
                Ok(server)
            }
            Err(e) => {
                let message = format!("Failed to create HCloud server {name}: {e}");
                self.scope
                    .recorder
                    .warn("FailedCreateHCloudServer", &message)
                    .await;
                Err(self.hcloud_call_failed(e, "CreateServer").await)
            }
        }
    }

    /// Image matching the machine's image name, by label or by name
    async fn image_id(&mut self) -> Result<i64> {
        let image_name = self.scope.hcloud_machine.spec.image_name.clone();
        let by_label = ImageListOpts {
            label_selector: Some(format!("{IMAGE_NAME_LABEL}=={image_name}")),
            name: None,
        };
        let by_name = ImageListOpts {
            label_selector: None,
            name: Some(image_name.clone()),
        };

        let mut images = Vec::new();
        for opts in [by_label, by_name] {
            match self.scope.cluster.hcloud.list_images(opts).await {
                Ok(found) => images.extend(found),
                Err(e) => return Err(self.hcloud_call_failed(e, "ListImages").await),
            }
        }
        images.sort_by_key(|i| i.id);
        images.dedup_by_key(|i| i.id);

        match images.as_slice() {
            [image] => Ok(image.id),
            [] => {
                let message = format!("No image found with name {image_name}");
                self.scope.recorder.warn("ImageNotFound", &message).await;
                Err(Error::ValidationError(message))
            }
            many => {
                let message = format!("{} images have name {image_name}", many.len());
                self.scope.recorder.warn("ImageNameAmbiguous", &message).await;
                Err(Error::ValidationError(message))
            }
        }
    }

    fn placement_group_id(&self) -> Result<Option<i64>> {
        let Some(name) = self.scope.hcloud_machine.spec.placement_group_name.as_deref() else {
            return Ok(None);
        };
        self.scope
            .cluster
            .status()
            .and_then(|s| s.hcloud_placement_groups.iter().find(|pg| pg.name == name))
            .map(|pg| Some(pg.id))
            .ok_or_else(|| {
                Error::ValidationError(format!(
                    "failed to find server's placement group {name:?}"
                ))
            })
    }

    /// Ids of the ssh keys of the machine, or of the cluster when the machine names none
    async fn ssh_key_ids(&mut self) -> Result<Vec<i64>> {
        let wanted = if self.scope.hcloud_machine.spec.ssh_keys.is_empty() {
            self.scope.cluster.hetzner_cluster.spec.ssh_keys.hcloud.clone()
        } else {
            self.scope.hcloud_machine.spec.ssh_keys.clone()
        };
        if wanted.is_empty() {
            return Ok(Vec::new());
        }

        let keys = match self.scope.cluster.hcloud.list_ssh_keys().await {
            Ok(keys) => keys,
            Err(e) => return Err(self.hcloud_call_failed(e, "ListSSHKeys").await),
        };
        Ok(keys
            .into_iter()
            .filter(|key| {
                wanted.iter().any(|w| {
                    w.name.as_deref() == Some(key.name.as_str()) || w.id == Some(key.id)
                })
            })
            .map(|key| key.id)
            .collect())
    }

    fn set_status_from_api(&mut self, server: &Server) {
        let mut addresses = Vec::new();
        if let Some(ipv4) = server.public_net.ipv4.as_deref().filter(|ip| !ip.is_empty()) {
            addresses.push(MachineAddress::new(MachineAddressType::ExternalIP, ipv4));
        }
        if let Some(ipv6) = server
            .public_net
            .ipv6_network
            .as_deref()
            .and_then(first_host_of_network)
        {
            addresses.push(MachineAddress::new(MachineAddressType::ExternalIP, ipv6));
        }
        for net in &server.private_net {
            addresses.push(MachineAddress::new(
                MachineAddressType::InternalIP,
                net.ip.clone(),
            ));
        }

        let status = self.scope.status_mut();
        status.instance_state = Some(server.status.to_string());
        status.addresses = addresses;
    }

    async fn reconcile_network_attachment(&mut self, server: &Server) -> Result<()> {
        let Some(network) = self.scope.cluster.status().and_then(|s| s.network.clone()) else {
            return Ok(());
        };
        if network.attached_servers.contains(&server.id)
            || server.private_net.iter().any(|n| n.network_id == network.id)
        {
            return Ok(());
        }

        match self
            .scope
            .cluster
            .hcloud
            .attach_server_to_network(server.id, network.id)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is(HCloudErrorCode::ServerAlreadyAttached) => Ok(()),
            Err(e) => Err(self.hcloud_call_failed(e, "AttachServerToNetwork").await),
        }
    }

    async fn reconcile_load_balancer_attachment(&mut self, server: &Server) -> Result<()> {
        let Some(status) = self.scope.cluster.status() else {
            return Ok(());
        };
        let Some(lb) = status.control_plane_load_balancer.as_ref() else {
            return Ok(());
        };
        if lb.has_server_target(server.id) {
            return Ok(());
        }

        let use_private_ip = !server.private_net.is_empty();
        if use_private_ip
            && is_condition_false(&status.conditions, LOAD_BALANCER_ATTACHED_TO_NETWORK_CONDITION)
        {
            debug!("Load balancer is not attached to the network yet");
            return Ok(());
        }

        let lb_id = lb.id;
        match self
            .scope
            .cluster
            .hcloud
            .add_server_target(lb_id, server.id, use_private_ip)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is(HCloudErrorCode::TargetAlreadyDefined) => return Ok(()),
            Err(e) => return Err(self.hcloud_call_failed(e, "AddTargetServerToLoadBalancer").await),
        }

        self.scope
            .cluster
            .recorder
            .normal(
                "AddedAsTargetToLoadBalancer",
                format!("Added new server with id {} to the loadbalancer {lb_id}", server.id),
            )
            .await;
        Ok(())
    }

    async fn delete_load_balancer_target(&mut self, server: &Server) -> Result<()> {
        let Some(lb_id) = self
            .scope
            .cluster
            .status()
            .and_then(|s| s.control_plane_load_balancer.as_ref())
            .map(|lb| lb.id)
        else {
            return Ok(());
        };

        match self
            .scope
            .cluster
            .hcloud
            .delete_server_target(lb_id, server.id)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is(HCloudErrorCode::LoadBalancerTargetNotFound) => return Ok(()),
            Err(e) => return Err(self.hcloud_call_failed(e, "DeleteTargetServer").await),
        }

        self.scope
            .cluster
            .recorder
            .normal(
                "DeletedTargetOfLoadBalancer",
                format!("Deleted server with id {} from the loadbalancer {lb_id}", server.id),
            )
            .await;
        Ok(())
    }

    /// The API server has to answer on one of the machine's external addresses.
    async fn check_control_plane_ready(&mut self) -> Result<()> {
        let port = self.scope.cluster.control_plane_api_port();
        let hosts: Vec<String> = self
            .scope
            .status()
            .map(|s| {
                s.addresses
                    .iter()
                    .filter(|a| {
                        matches!(
                            a.type_,
                            MachineAddressType::ExternalIP | MachineAddressType::ExternalDNS
                        )
                    })
                    .map(|a| a.address.clone())
                    .collect()
            })
            .unwrap_or_default();

        let mut errors = Vec::new();
        for host in hosts {
            match self.scope.probe.check(host.clone(), port).await {
                Ok(()) => return Ok(()),
                Err(e) => errors.push(e.context(format!("probing {host}"))),
            }
        }

        let err = Error::aggregate(errors).unwrap_or_else(|| {
            Error::ReconcileError("control plane not ready - no usable address found".into())
        });
        self.scope
            .recorder
            .warn(
                "APIServerNotReady",
                format!("Health check for API server failed: {err}"),
            )
            .await;
        Err(err.context("control plane not ready"))
    }

    async fn shutdown_server(&mut self, server: &Server) -> Result<ReconcileOutcome> {
        if let Err(e) = self.scope.cluster.hcloud.shutdown_server(server.id).await {
            return Err(self.hcloud_call_failed(e, "ShutdownServer").await);
        }
        mark_false(
            &mut self.scope.status_mut().conditions,
            INSTANCE_READY_CONDITION,
            INSTANCE_TERMINATED_REASON,
            ConditionSeverity::Info,
            "Instance has been shut down",
        );
        Ok(ReconcileOutcome::after(SHUTDOWN_REQUEUE))
    }

    async fn delete_server(&mut self, server: &Server) -> Result<ReconcileOutcome> {
        let name = self.scope.name();
        if let Err(e) = self.scope.cluster.hcloud.delete_server(server.id).await {
            self.scope
                .recorder
                .warn(
                    "FailedDeleteHCloudServer",
                    format!("Failed to delete HCloud server {name}: {e}"),
                )
                .await;
            return Err(self.hcloud_call_failed(e, "DeleteServer").await);
        }
        self.scope
            .recorder
            .normal("HCloudServerDeleted", format!("HCloud server {name} deleted"))
            .await;
        Ok(ReconcileOutcome::done())
    }

    /// Surface a rate limit on the machine and wrap the error.
    async fn hcloud_call_failed(&mut self, err: HCloudError, function: &str) -> Error {
        if err.is_rate_limit() {
            let message = format!("exceeded hcloud rate limit with calling function {function:?}");
            mark_false(
                &mut self.scope.status_mut().conditions,
                HETZNER_API_REACHABLE_CONDITION,
                RATE_LIMIT_EXCEEDED_REASON,
                ConditionSeverity::Warning,
                message.as_str(),
            );
            self.scope.recorder.warn("RateLimitExceeded", &message).await;
            return Error::from(err);
        }
        Error::from(err).context(format!("failed to call {function}"))
    }
}

/// `2a01:4f8:1c1a:1234::/64` becomes `2a01:4f8:1c1a:1234::1`
fn first_host_of_network(network: &str) -> Option<String> {
    let prefix = network.split('/').next()?;
    let mut segments = prefix.parse::<Ipv6Addr>().ok()?.segments();
    segments[7] = segments[7].checked_add(1)?;
    Some(Ipv6Addr::from(segments).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_host_of_network() {
        assert_eq!(
            first_host_of_network("2a01:4f8:1c1a:1234::/64").as_deref(),
            Some("2a01:4f8:1c1a:1234::1")
        );
        assert_eq!(first_host_of_network("not-an-ip"), None);
    }
}
