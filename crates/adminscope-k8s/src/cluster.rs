//! kube-rs backed implementations of the directory and tunnel transport

use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Pod};
use kube::Api;
use kube::api::ListParams;

use crate::directory::PodDirectory;
use crate::tunnel::{TunnelStream, TunnelTransport};
use adminscope_types::{Error, LabelSelector, NamespaceInfo, PodInfo, PodPhase, Result, Target};

/// Cluster access through a live kube::Client
#[derive(Clone)]
pub struct ClusterApi {
    client: kube::Client,
}

impl ClusterApi {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    /// Read one key of a ConfigMap; `None` when the ConfigMap or key is absent
    pub async fn config_map_value(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<Option<String>> {
        let config_maps: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let config_map = config_maps.get_opt(name).await.map_err(|e| {
            Error::Kubernetes(format!(
                "failed to get configmap {}/{}: {}",
                namespace, name, e
            ))
        })?;

        Ok(config_map
            .and_then(|cm| cm.data)
            .and_then(|mut data| data.remove(key)))
    }

    /// Convert a k8s Pod to PodInfo
    fn pod_to_info(pod: Pod, namespace: &str) -> PodInfo {
        let name = pod.metadata.name.unwrap_or_default();
        let namespace = pod
            .metadata
            .namespace
            .unwrap_or_else(|| namespace.to_string());
        let mut info = PodInfo::new(name, namespace);

        if let Some(status) = pod.status {
            info.phase = status
                .phase
                .as_deref()
                .map(PodPhase::from)
                .unwrap_or(PodPhase::Unknown);

            info.ready = status
                .conditions
                .unwrap_or_default()
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True");
        }

        info
    }
}

impl PodDirectory for ClusterApi {
    async fn list_pods(&self, namespace: &str, selector: &LabelSelector) -> Result<Vec<PodInfo>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = pods
            .list(&ListParams::default().labels(&selector.to_query()))
            .await
            .map_err(|e| {
                Error::Kubernetes(format!("list pods failed in ns {}: {}", namespace, e))
            })?;

        Ok(list
            .items
            .into_iter()
            .map(|pod| Self::pod_to_info(pod, namespace))
            .collect())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<PodInfo>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pod = pods.get_opt(name).await.map_err(|e| {
            Error::Kubernetes(format!("get pod {}/{} failed: {}", namespace, name, e))
        })?;

        Ok(pod.map(|p| Self::pod_to_info(p, namespace)))
    }

    async fn list_namespaces(&self) -> Result<Vec<NamespaceInfo>> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let list = namespaces
            .list(&ListParams::default())
            .await
            .map_err(|e| Error::Kubernetes(format!("Failed to list namespaces: {}", e)))?;

        Ok(list
            .items
            .into_iter()
            .map(|ns| {
                let name = ns.metadata.name.unwrap_or_default();
                let status = ns
                    .status
                    .and_then(|s| s.phase)
                    .unwrap_or_else(|| "Unknown".to_string());
                NamespaceInfo::new(name, status)
            })
            .collect())
    }
}

impl TunnelTransport for ClusterApi {
    async fn open(&self, target: &Target, remote_port: u16) -> Result<TunnelStream> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &target.namespace);
        let mut forwarder = pods
            .portforward(&target.name, &[remote_port])
            .await
            .map_err(|e| Error::Tunnel {
                target: target.to_string(),
                reason: e.to_string(),
            })?;

        let stream = forwarder.take_stream(remote_port).ok_or_else(|| Error::Tunnel {
            target: target.to_string(),
            reason: format!("no stream for port {}", remote_port),
        })?;

        // The forwarder task ends once the stream is closed
        let label = target.to_string();
        tokio::spawn(async move {
            if let Err(e) = forwarder.join().await {
                tracing::debug!(pod = %label, error = %e, "port-forward closed with error");
            }
        });

        Ok(Box::new(stream))
    }
}
