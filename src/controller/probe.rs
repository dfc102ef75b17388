//! Reachability check of a workload cluster's API server
//!
//! Control plane machines only become ready once their kube-apiserver answers on the node's own
//! address. The probe takes the cluster kubeconfig and points it at one node.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::error::{Error, Result};

/// Key of the kubeconfig in the `<cluster>-kubeconfig` secret
pub const KUBECONFIG_SECRET_KEY: &str = "value";

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[cfg_attr(test, automock)]
#[async_trait]
pub trait ApiServerProbe: Send + Sync {
    /// Succeeds when the API server answers on `host:port`.
    async fn check(&self, host: String, port: i32) -> Result<()>;
}

/// Probes with the credentials of the cluster kubeconfig
#[derive(Clone)]
pub struct KubeconfigProbe {
    kubeconfig: Kubeconfig,
}

impl KubeconfigProbe {
    pub fn new(kubeconfig: Kubeconfig) -> Self {
        Self { kubeconfig }
    }

    pub fn from_secret(secret: &Secret) -> Result<Self> {
        let data = secret
            .data
            .as_ref()
            .and_then(|d| d.get(KUBECONFIG_SECRET_KEY))
            .ok_or_else(|| {
                Error::ConfigError(format!(
                    "missing key {KUBECONFIG_SECRET_KEY:?} in kubeconfig secret"
                ))
            })?;
        let yaml = String::from_utf8_lossy(&data.0);
        let kubeconfig = Kubeconfig::from_yaml(&yaml)
            .map_err(|e| Error::ConfigError(format!("invalid kubeconfig: {e}")))?;
        Ok(Self::new(kubeconfig))
    }
}

/// Point every cluster entry of the kubeconfig at `host:port`.
pub fn rewrite_endpoint(kubeconfig: &Kubeconfig, host: &str, port: i32) -> Kubeconfig {
    let mut kubeconfig = kubeconfig.clone();
    let server = if host.contains(':') {
        format!("https://[{host}]:{port}")
    } else {
        format!("https://{host}:{port}")
    };
    for named in &mut kubeconfig.clusters {
        if let Some(cluster) = named.cluster.as_mut() {
            cluster.server = Some(server.clone());
        }
    }
    kubeconfig
}

#[async_trait]
impl ApiServerProbe for KubeconfigProbe {
    async fn check(&self, host: String, port: i32) -> Result<()> {
        let kubeconfig = rewrite_endpoint(&self.kubeconfig, &host, port);
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| Error::ConfigError(format!("failed to build client config: {e}")))?;
        let client = Client::try_from(config)?;

        match tokio::time::timeout(PROBE_TIMEOUT, client.apiserver_version()).await {
            Ok(Ok(version)) => {
                debug!(%host, port, version = %version.git_version, "API server answered");
                Ok(())
            }
            Ok(Err(e)) => Err(Error::from(e).context(format!("API server at {host}:{port}"))),
            Err(_) => Err(Error::ReconcileError(format!(
                "API server at {host}:{port} did not answer within {}s",
                PROBE_TIMEOUT.as_secs()
            ))),
        }
    }
}
