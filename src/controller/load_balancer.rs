//! Control plane load balancer of a HetznerCluster

use std::collections::{BTreeMap, BTreeSet};

use kube::ResourceExt;
use rand::Rng;
use tracing::{debug, info, instrument};

use crate::controller::action::ReconcileOutcome;
use crate::controller::conditions::{
    mark_false, mark_true, HETZNER_API_REACHABLE_CONDITION,
    LOAD_BALANCER_ATTACHED_TO_NETWORK_CONDITION, LOAD_BALANCER_FAILED_TO_ATTACH_REASON,
    LOAD_BALANCER_FAILED_TO_CREATE_REASON, LOAD_BALANCER_READY_CONDITION, NO_NETWORK_REASON,
    RATE_LIMIT_EXCEEDED_REASON,
};
use crate::crd::{
    ConditionSeverity, LoadBalancerStatus, LoadBalancerTargetStatus, LoadBalancerTargetType,
};
use crate::error::{Error, Result};
use crate::hcloud::{
    label_selector, HCloudError, HCloudErrorCode, LoadBalancer, LoadBalancerCreateOpts,
    LoadBalancerService, LoadBalancerTarget,
};
use crate::scope::ClusterScope;

const NAME_SUFFIX_CHARS: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";
const NAME_SUFFIX_LEN: usize = 5;

pub struct LoadBalancerReconciler<'a> {
    scope: &'a mut ClusterScope,
}

impl<'a> LoadBalancerReconciler<'a> {
    pub fn new(scope: &'a mut ClusterScope) -> Self {
        Self { scope }
    }

    #[instrument(skip(self), fields(name = %self.scope.hetzner_cluster.name_any(), namespace = self.scope.hetzner_cluster.namespace()))]
    pub async fn reconcile(&mut self) -> Result<ReconcileOutcome> {
        if !self.scope.hetzner_cluster.spec.control_plane_load_balancer.enabled {
            return Ok(ReconcileOutcome::done());
        }

        let lb = match self.find_load_balancer().await? {
            Some(lb) => lb,
            None => self.create_load_balancer().await?,
        };

        let has_network = self.scope.network_id().is_some();
        self.scope.status_mut().control_plane_load_balancer = Some(api_to_status(&lb, has_network));

        self.reconcile_properties(&lb).await?;
        self.reconcile_network_attachment(&lb).await?;
        self.reconcile_services(&lb).await?;

        mark_true(
            &mut self.scope.status_mut().conditions,
            LOAD_BALANCER_READY_CONDITION,
        );
        Ok(ReconcileOutcome::done())
    }

    #[instrument(skip(self), fields(name = %self.scope.hetzner_cluster.name_any(), namespace = self.scope.hetzner_cluster.namespace()))]
    pub async fn delete(&mut self) -> Result<ReconcileOutcome> {
        let Some(status) = self
            .scope
            .status()
            .and_then(|s| s.control_plane_load_balancer.clone())
        else {
            return Ok(ReconcileOutcome::done());
        };

        if status.protected {
            self.scope
                .recorder
                .normal(
                    "LoadBalancerProtectedFromDeletion",
                    format!(
                        "Load balancer {} is protected from deletion and is left in place",
                        status.id
                    ),
                )
                .await;
            return Ok(ReconcileOutcome::done());
        }

        match self.scope.hcloud.delete_load_balancer(status.id).await {
            Ok(()) => {
                self.scope
                    .recorder
                    .normal(
                        "DeleteLoadBalancer",
                        format!("Deleted load balancer {}", status.id),
                    )
                    .await;
            }
            Err(e) if e.is(HCloudErrorCode::NotFound) => {
                debug!(id = status.id, "Load balancer is already gone");
            }
            Err(e) => {
                self.scope
                    .recorder
                    .warn(
                        "FailedLoadBalancerDelete",
                        format!("Failed to delete load balancer {}: {e}", status.id),
                    )
                    .await;
                return Err(self.hcloud_call_failed(e, "DeleteLoadBalancer").await);
            }
        }

        self.scope.status_mut().control_plane_load_balancer = None;
        Ok(ReconcileOutcome::done())
    }

    fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(self.scope.cluster_tag_key(), "owned".to_string())])
    }

    async fn find_load_balancer(&mut self) -> Result<Option<LoadBalancer>> {
        let selector = label_selector(&self.labels());
        let mut found = match self.scope.hcloud.list_load_balancers(selector).await {
            Ok(found) => found,
            Err(e) => return Err(self.hcloud_call_failed(e, "ListLoadBalancers").await),
        };
        if found.len() > 1 {
            return Err(Error::ReconcileError(format!(
                "found {} loadbalancers owned by the cluster, expected at most one",
                found.len()
            )));
        }
        Ok(found.pop())
    }

    async fn create_load_balancer(&mut self) -> Result<LoadBalancer> {
        let spec = &self.scope.hetzner_cluster.spec.control_plane_load_balancer;
        let name = spec.name.clone().unwrap_or_else(|| {
            format!(
                "{}-kube-apiserver-{}",
                self.scope.name(),
                random_suffix(&mut rand::thread_rng())
            )
        });
        info!(algorithm = spec.algorithm.as_str(), %name, "Creating load balancer");

        let opts = LoadBalancerCreateOpts {
            name,
            lb_type: spec.type_.clone(),
            algorithm: spec.algorithm.as_str().to_string(),
            location: spec.region.clone(),
            network_id: self.scope.network_id(),
            labels: self.labels(),
            services: vec![LoadBalancerService::tcp(
                self.scope.control_plane_api_port(),
                spec.port,
            )],
        };

        match self.scope.hcloud.create_load_balancer(opts).await {
            Ok(lb) => {
                self.scope
                    .recorder
                    .normal("CreateLoadBalancer", "Created load balancer")
                    .await;
                Ok(lb)
            }
            Err(e) => {
                let message = format!("Failed to create load balancer: {e}");
                self.scope
                    .recorder
                    .warn("FailedCreateLoadBalancer", &message)
                    .await;
                mark_false(
                    &mut self.scope.status_mut().conditions,
                    LOAD_BALANCER_READY_CONDITION,
                    LOAD_BALANCER_FAILED_TO_CREATE_REASON,
                    ConditionSeverity::Error,
                    message.as_str(),
                );
                Err(self.hcloud_call_failed(e, "CreateLoadBalancer").await)
            }
        }
    }

    /// Type, algorithm and name, each only changed when it drifted from the cluster configuration.
    ///
    /// A rate limit stops the pass right away, other failures are collected.
    async fn reconcile_properties(&mut self, lb: &LoadBalancer) -> Result<()> {
        let spec = self.scope.hetzner_cluster.spec.control_plane_load_balancer.clone();
        let mut errors = Vec::new();

        if lb.lb_type != spec.type_ {
            match self
                .scope
                .hcloud
                .change_load_balancer_type(lb.id, spec.type_.clone())
                .await
            {
                Ok(()) => {
                    self.scope
                        .recorder
                        .normal(
                            "ChangeLoadBalancerType",
                            format!("Changed load balancer type to {}", spec.type_),
                        )
                        .await;
                }
                Err(e) if e.is_rate_limit() => {
                    return Err(self.hcloud_call_failed(e, "ChangeLoadBalancerType").await)
                }
                Err(e) => errors.push(Error::from(e).context("failed to change load balancer type")),
            }
        }

        let algorithm = spec.algorithm.as_str();
        if lb.algorithm != algorithm {
            match self
                .scope
                .hcloud
                .change_load_balancer_algorithm(lb.id, algorithm.to_string())
                .await
            {
                Ok(()) => {
                    self.scope
                        .recorder
                        .normal(
                            "ChangeLoadBalancerAlgorithm",
                            format!("Changed load balancer algorithm to {algorithm}"),
                        )
                        .await;
                }
                Err(e) if e.is_rate_limit() => {
                    return Err(self
                        .hcloud_call_failed(e, "ChangeLoadBalancerAlgorithm")
                        .await)
                }
                Err(e) => errors
                    .push(Error::from(e).context("failed to change load balancer algorithm")),
            }
        }

        if let Some(name) = spec.name.as_deref().filter(|n| *n != lb.name) {
            match self
                .scope
                .hcloud
                .update_load_balancer_name(lb.id, name.to_string())
                .await
            {
                Ok(()) => {
                    self.scope
                        .recorder
                        .normal(
                            "ChangeLoadBalancerName",
                            format!("Changed load balancer name to {name}"),
                        )
                        .await;
                }
                Err(e) => {
                    if e.is_rate_limit() {
                        self.mark_rate_limited("UpdateLoadBalancerName").await;
                    }
                    errors.push(Error::from(e).context("failed to update load balancer name"));
                }
            }
        }

        Error::aggregate(errors).map_or(Ok(()), Err)
    }

    async fn reconcile_network_attachment(&mut self, lb: &LoadBalancer) -> Result<()> {
        if !lb.private_net.is_empty() {
            mark_true(
                &mut self.scope.status_mut().conditions,
                LOAD_BALANCER_ATTACHED_TO_NETWORK_CONDITION,
            );
            return Ok(());
        }

        let Some(network_id) = self.scope.network_id() else {
            mark_false(
                &mut self.scope.status_mut().conditions,
                LOAD_BALANCER_ATTACHED_TO_NETWORK_CONDITION,
                NO_NETWORK_REASON,
                ConditionSeverity::Info,
                "no network found",
            );
            return Ok(());
        };

        match self
            .scope
            .hcloud
            .attach_load_balancer_to_network(lb.id, network_id)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is(HCloudErrorCode::LoadBalancerAlreadyAttached) => {}
            Err(e) => {
                let message = format!("Failed to attach load balancer to network: {e}");
                self.scope
                    .recorder
                    .warn("FailedAttachLoadBalancer", &message)
                    .await;
                mark_false(
                    &mut self.scope.status_mut().conditions,
                    LOAD_BALANCER_ATTACHED_TO_NETWORK_CONDITION,
                    LOAD_BALANCER_FAILED_TO_ATTACH_REASON,
                    ConditionSeverity::Error,
                    message.as_str(),
                );
                return Err(self
                    .hcloud_call_failed(e, "AttachLoadBalancerToNetwork")
                    .await);
            }
        }

        mark_true(
            &mut self.scope.status_mut().conditions,
            LOAD_BALANCER_ATTACHED_TO_NETWORK_CONDITION,
        );
        Ok(())
    }

    /// Converge the extra services. The API server service is never touched here.
    async fn reconcile_services(&mut self, lb: &LoadBalancer) -> Result<()> {
        let api_port = self.scope.control_plane_api_port();
        let wanted: BTreeMap<i32, LoadBalancerService> = self
            .scope
            .hetzner_cluster
            .spec
            .control_plane_load_balancer
            .extra_services
            .iter()
            .filter(|s| s.listen_port != api_port)
            .map(|s| {
                let service = LoadBalancerService {
                    protocol: s.protocol.clone(),
                    listen_port: s.listen_port,
                    destination_port: s.destination_port,
                    proxyprotocol: false,
                };
                (s.listen_port, service)
            })
            .collect();
        let present: BTreeSet<i32> = lb
            .services
            .iter()
            .map(|s| s.listen_port)
            .filter(|port| *port != api_port)
            .collect();

        let mut errors = Vec::new();
        for port in present.iter().filter(|p| !wanted.contains_key(p)) {
            if let Err(e) = self.scope.hcloud.delete_load_balancer_service(lb.id, *port).await {
                errors.push(
                    Error::from(e).context(format!("error deleting service {port} from load balancer")),
                );
            }
        }
        for (port, service) in wanted.into_iter().filter(|(p, _)| !present.contains(p)) {
            if let Err(e) = self.scope.hcloud.add_load_balancer_service(lb.id, service).await {
                errors.push(
                    Error::from(e).context(format!("error adding service {port} to load balancer")),
                );
            }
        }

        Error::aggregate(errors).map_or(Ok(()), Err)
    }

    async fn mark_rate_limited(&mut self, function: &str) {
        let message = format!("exceeded hcloud rate limit with calling function {function:?}");
        mark_false(
            &mut self.scope.status_mut().conditions,
            HETZNER_API_REACHABLE_CONDITION,
            RATE_LIMIT_EXCEEDED_REASON,
            ConditionSeverity::Warning,
            message.as_str(),
        );
        self.scope.recorder.warn("RateLimitExceeded", &message).await;
    }

    async fn hcloud_call_failed(&mut self, err: HCloudError, function: &str) -> Error {
        if err.is_rate_limit() {
            self.mark_rate_limited(function).await;
            return Error::from(err);
        }
        Error::from(err).context(format!("failed to call {function}"))
    }
}

/// Status view of a provider load balancer.
///
/// The internal IP stays empty unless the cluster has a network and the load balancer is in it.
pub fn api_to_status(lb: &LoadBalancer, has_network: bool) -> LoadBalancerStatus {
    let internal_ip = if has_network {
        lb.private_net
            .first()
            .map(|n| n.ip.clone())
            .unwrap_or_default()
    } else {
        String::new()
    };

    let target = lb
        .targets
        .iter()
        .map(|t| match t {
            LoadBalancerTarget::Server { id, .. } => LoadBalancerTargetStatus {
                type_: LoadBalancerTargetType::Server,
                server_id: Some(*id),
                ip: None,
            },
            LoadBalancerTarget::Ip(ip) => LoadBalancerTargetStatus {
                type_: LoadBalancerTargetType::Ip,
                server_id: None,
                ip: Some(ip.clone()),
            },
        })
        .collect();

    LoadBalancerStatus {
        id: lb.id,
        ipv4: lb.ipv4.clone().unwrap_or_default(),
        ipv6: lb.ipv6.clone().unwrap_or_default(),
        internal_ip,
        target,
        protected: lb.protection_delete,
    }
}

fn random_suffix(rng: &mut impl Rng) -> String {
    (0..NAME_SUFFIX_LEN)
        .map(|_| char::from(NAME_SUFFIX_CHARS[rng.gen_range(0..NAME_SUFFIX_CHARS.len())]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use k8s_openapi::api::core::v1::ObjectReference;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use crate::controller::conditions::{is_condition_false, is_condition_true, reason};
    use crate::controller::events::{MemoryEventSink, Recorder};
    use crate::crd::{
        ApiEndpoint, HetznerCluster, HetznerClusterSpec, HetznerClusterStatus,
        LoadBalancerServiceSpec, LoadBalancerSpec, NetworkStatus,
    };
    use crate::hcloud::{MockHCloudClient, PrivateNet};
    use crate::scope::Cluster;

    fn scope(
        hcloud: MockHCloudClient,
        lb_spec: LoadBalancerSpec,
        status: HetznerClusterStatus,
    ) -> (ClusterScope, Arc<MemoryEventSink>) {
        let sink = Arc::new(MemoryEventSink::new());
        let mut hetzner_cluster = HetznerCluster::new(
            "c1",
            HetznerClusterSpec {
                control_plane_endpoint: Some(ApiEndpoint {
                    host: "lb.example.com".into(),
                    port: 6443,
                }),
                control_plane_load_balancer: lb_spec,
                control_plane_regions: vec!["fsn1".into()],
                ssh_keys: Default::default(),
                hetzner_secret_ref: Default::default(),
            },
        );
        hetzner_cluster.status = Some(status);

        let scope = ClusterScope {
            cluster: Cluster {
                name: "c1".into(),
                namespace: "default".into(),
                infrastructure_ready: false,
            },
            hetzner_cluster,
            hcloud: Arc::new(hcloud),
            hcloud_token: Some("token".into()),
            recorder: Recorder::new(
                sink.clone(),
                ObjectReference {
                    kind: Some("HetznerCluster".into()),
                    name: Some("c1".into()),
                    ..Default::default()
                },
            ),
        };
        (scope, sink)
    }

    fn enabled() -> LoadBalancerSpec {
        LoadBalancerSpec {
            enabled: true,
            region: "fsn1".into(),
            ..Default::default()
        }
    }

    /// Provider side matching `enabled()`, already in the network
    fn existing() -> LoadBalancer {
        LoadBalancer {
            id: 3,
            name: "c1-kube-apiserver-abcde".into(),
            lb_type: "lb11".into(),
            algorithm: "round_robin".into(),
            ipv4: Some("198.51.100.1".into()),
            private_net: vec![PrivateNet {
                network_id: 5,
                ip: "10.0.0.100".into(),
            }],
            services: vec![LoadBalancerService::tcp(6443, 6443)],
            ..Default::default()
        }
    }

    fn network() -> HetznerClusterStatus {
        HetznerClusterStatus {
            network: Some(NetworkStatus {
                id: 5,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_services_diff() {
        let mut lb = existing();
        lb.services.push(LoadBalancerService::tcp(80, 80));
        lb.services.push(LoadBalancerService::tcp(443, 443));

        let mut spec = enabled();
        spec.extra_services = vec![
            LoadBalancerServiceSpec {
                protocol: "tcp".into(),
                listen_port: 443,
                destination_port: 443,
            },
            LoadBalancerServiceSpec {
                protocol: "tcp".into(),
                listen_port: 8080,
                destination_port: 8080,
            },
        ];

        let mut hcloud = MockHCloudClient::new();
        hcloud
            .expect_list_load_balancers()
            .withf(|selector: &String| selector == "caph-cluster-c1==owned")
            .returning(move |_| Ok(vec![lb.clone()]));
        hcloud
            .expect_delete_load_balancer_service()
            .withf(|id, port| *id == 3 && *port == 80)
            .times(1)
            .returning(|_, _| Ok(()));
        hcloud
            .expect_add_load_balancer_service()
            .withf(|id, service| *id == 3 && *service == LoadBalancerService::tcp(8080, 8080))
            .times(1)
            .returning(|_, _| Ok(()));

        let (mut scope, _) = scope(hcloud, spec, network());
        let outcome = LoadBalancerReconciler::new(&mut scope).reconcile().await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::done());
        let status = scope.status().unwrap();
        let lb_status = status.control_plane_load_balancer.as_ref().unwrap();
        assert_eq!(lb_status.internal_ip, "10.0.0.100");
        assert_eq!(lb_status.ipv6, "");
        assert!(is_condition_true(&status.conditions, LOAD_BALANCER_READY_CONDITION));
    }

    #[tokio::test]
    async fn test_create_load_balancer() {
        let mut hcloud = MockHCloudClient::new();
        hcloud.expect_list_load_balancers().returning(|_| Ok(vec![]));
        hcloud
            .expect_create_load_balancer()
            .withf(|opts| {
                opts.name.starts_with("c1-kube-apiserver-")
                    && opts.lb_type == "lb11"
                    && opts.algorithm == "round_robin"
                    && opts.location == "fsn1"
                    && opts.network_id.is_none()
                    && opts.services == vec![LoadBalancerService::tcp(6443, 6443)]
            })
            .times(1)
            .returning(|opts| {
                Ok(LoadBalancer {
                    id: 3,
                    name: opts.name,
                    lb_type: opts.lb_type,
                    algorithm: opts.algorithm,
                    services: opts.services,
                    ..Default::default()
                })
            });

        let (mut scope, sink) = scope(hcloud, enabled(), HetznerClusterStatus::default());
        LoadBalancerReconciler::new(&mut scope).reconcile().await.unwrap();

        let status = scope.status().unwrap();
        assert_eq!(status.control_plane_load_balancer.as_ref().unwrap().id, 3);
        assert_eq!(
            status.control_plane_load_balancer.as_ref().unwrap().internal_ip,
            ""
        );
        assert!(is_condition_false(
            &status.conditions,
            LOAD_BALANCER_ATTACHED_TO_NETWORK_CONDITION
        ));
        assert_eq!(
            reason(&status.conditions, LOAD_BALANCER_ATTACHED_TO_NETWORK_CONDITION),
            NO_NETWORK_REASON
        );
        assert!(sink.has_reason("CreateLoadBalancer"));
    }

    #[tokio::test]
    async fn test_multiple_load_balancers_is_an_error() {
        let mut hcloud = MockHCloudClient::new();
        hcloud
            .expect_list_load_balancers()
            .returning(|_| Ok(vec![existing(), existing()]));

        let (mut scope, _) = scope(hcloud, enabled(), network());
        let result = LoadBalancerReconciler::new(&mut scope).reconcile().await;
        assert!(matches!(result, Err(Error::ReconcileError(_))));
    }

    #[tokio::test]
    async fn test_property_drift_errors_are_aggregated() {
        let mut lb = existing();
        lb.lb_type = "lb21".into();
        lb.algorithm = "least_connections".into();

        let mut hcloud = MockHCloudClient::new();
        hcloud
            .expect_list_load_balancers()
            .returning(move |_| Ok(vec![lb.clone()]));
        hcloud
            .expect_change_load_balancer_type()
            .times(1)
            .returning(|_, _| Err(HCloudError::new(HCloudErrorCode::Other("locked".into()), "locked")));
        hcloud
            .expect_change_load_balancer_algorithm()
            .times(1)
            .returning(|_, _| Err(HCloudError::new(HCloudErrorCode::Other("locked".into()), "locked")));

        let (mut scope, sink) = scope(hcloud, enabled(), network());
        let result = LoadBalancerReconciler::new(&mut scope).reconcile().await;

        match result {
            Err(Error::Aggregate(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("expected aggregated errors, got {other:?}"),
        }
        assert!(!sink.has_reason("ChangeLoadBalancerType"));
    }

    #[tokio::test]
    async fn test_rate_limit_stops_property_reconcile() {
        let mut lb = existing();
        lb.lb_type = "lb21".into();
        lb.algorithm = "least_connections".into();

        let mut hcloud = MockHCloudClient::new();
        hcloud
            .expect_list_load_balancers()
            .returning(move |_| Ok(vec![lb.clone()]));
        hcloud.expect_change_load_balancer_type().returning(|_, _| {
            Err(HCloudError::new(HCloudErrorCode::RateLimitExceeded, "limit"))
        });
        hcloud.expect_change_load_balancer_algorithm().times(0);

        let (mut scope, sink) = scope(hcloud, enabled(), network());
        let result = LoadBalancerReconciler::new(&mut scope).reconcile().await;

        assert!(result.unwrap_err().is_rate_limit());
        let conditions = &scope.status().unwrap().conditions;
        assert_eq!(
            reason(conditions, HETZNER_API_REACHABLE_CONDITION),
            RATE_LIMIT_EXCEEDED_REASON
        );
        assert!(sink.has_reason("RateLimitExceeded"));
    }

    #[tokio::test]
    async fn test_network_attach_failure() {
        let mut lb = existing();
        lb.private_net.clear();

        let mut hcloud = MockHCloudClient::new();
        hcloud
            .expect_list_load_balancers()
            .returning(move |_| Ok(vec![lb.clone()]));
        hcloud
            .expect_attach_load_balancer_to_network()
            .withf(|id, network| *id == 3 && *network == 5)
            .returning(|_, _| Err(HCloudError::new(HCloudErrorCode::Other("conflict".into()), "busy")));

        let (mut scope, sink) = scope(hcloud, enabled(), network());
        assert!(LoadBalancerReconciler::new(&mut scope).reconcile().await.is_err());

        let conditions = &scope.status().unwrap().conditions;
        assert_eq!(
            reason(conditions, LOAD_BALANCER_ATTACHED_TO_NETWORK_CONDITION),
            LOAD_BALANCER_FAILED_TO_ATTACH_REASON
        );
        assert!(sink.has_reason("FailedAttachLoadBalancer"));
    }

    #[tokio::test]
    async fn test_network_already_attached() {
        let mut lb = existing();
        lb.private_net.clear();

        let mut hcloud = MockHCloudClient::new();
        hcloud
            .expect_list_load_balancers()
            .returning(move |_| Ok(vec![lb.clone()]));
        hcloud.expect_attach_load_balancer_to_network().returning(|_, _| {
            Err(HCloudError::new(
                HCloudErrorCode::LoadBalancerAlreadyAttached,
                "already attached",
            ))
        });

        let (mut scope, _) = scope(hcloud, enabled(), network());
        assert!(LoadBalancerReconciler::new(&mut scope).reconcile().await.is_ok());
        assert!(is_condition_true(
            &scope.status().unwrap().conditions,
            LOAD_BALANCER_ATTACHED_TO_NETWORK_CONDITION
        ));
    }

    #[tokio::test]
    async fn test_disabled_load_balancer_is_left_alone() {
        let (mut scope, _) = scope(
            MockHCloudClient::new(),
            LoadBalancerSpec {
                enabled: false,
                ..Default::default()
            },
            HetznerClusterStatus::default(),
        );
        let outcome = LoadBalancerReconciler::new(&mut scope).reconcile().await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::done());
    }

    #[tokio::test]
    async fn test_delete() {
        let mut hcloud = MockHCloudClient::new();
        hcloud
            .expect_delete_load_balancer()
            .withf(|id| *id == 3)
            .times(1)
            .returning(|_| Err(HCloudError::new(HCloudErrorCode::NotFound, "gone")));

        let mut status = network();
        status.control_plane_load_balancer = Some(api_to_status(&existing(), true));
        let (mut scope, _) = scope(hcloud, enabled(), status);

        LoadBalancerReconciler::new(&mut scope).delete().await.unwrap();
        assert!(scope.status().unwrap().control_plane_load_balancer.is_none());
    }

    #[tokio::test]
    async fn test_delete_protected() {
        let mut hcloud = MockHCloudClient::new();
        hcloud.expect_delete_load_balancer().times(0);

        let mut lb = existing();
        lb.protection_delete = true;
        let mut status = network();
        status.control_plane_load_balancer = Some(api_to_status(&lb, true));
        let (mut scope, sink) = scope(hcloud, enabled(), status);

        LoadBalancerReconciler::new(&mut scope).delete().await.unwrap();
        assert!(scope.status().unwrap().control_plane_load_balancer.is_some());
        assert!(sink.has_reason("LoadBalancerProtectedFromDeletion"));
    }

    #[test]
    fn test_api_to_status_targets() {
        let mut lb = existing();
        lb.targets = vec![
            LoadBalancerTarget::Server {
                id: 1,
                use_private_ip: true,
            },
            LoadBalancerTarget::Ip("203.0.113.7".into()),
        ];

        let status = api_to_status(&lb, false);
        assert_eq!(status.internal_ip, "");
        assert!(status.has_server_target(1));
        assert_eq!(status.target[1].ip.as_deref(), Some("203.0.113.7"));
    }

    #[test]
    fn test_random_suffix() {
        let suffix = random_suffix(&mut StdRng::seed_from_u64(7));
        assert_eq!(suffix.len(), NAME_SUFFIX_LEN);
        assert!(suffix.bytes().all(|b| NAME_SUFFIX_CHARS.contains(&b)));
    }
}
