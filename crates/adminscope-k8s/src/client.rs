//! Kubeconfig loading and client construction

use anyhow::{Context, Result};
use kube::config::{KubeConfigOptions, Kubeconfig};

use crate::cluster::ClusterApi;

/// Kubernetes client wrapper
pub struct KubeClient {
    kubeconfig: Option<Kubeconfig>,
}

impl KubeClient {
    /// Create a new KubeClient by loading the kubeconfig
    ///
    /// A missing kubeconfig is not an error here: inside a pod the in-cluster
    /// service account config is used instead.
    pub fn new() -> Self {
        match Kubeconfig::read() {
            Ok(kubeconfig) => Self {
                kubeconfig: Some(kubeconfig),
            },
            Err(e) => {
                tracing::debug!(error = %e, "no kubeconfig found, relying on in-cluster config");
                Self { kubeconfig: None }
            }
        }
    }

    /// Create a kube::Client for a specific context, or the current one
    pub async fn client_for_context(&self, context_name: Option<&str>) -> Result<kube::Client> {
        let config = match (&self.kubeconfig, context_name) {
            (Some(kubeconfig), Some(name)) => {
                if !kubeconfig.contexts.iter().any(|c| c.name == name) {
                    anyhow::bail!("Context '{}' not found in kubeconfig", name);
                }
                kube::Config::from_custom_kubeconfig(
                    kubeconfig.clone(),
                    &KubeConfigOptions {
                        context: Some(name.to_string()),
                        ..Default::default()
                    },
                )
                .await
                .context(format!("Failed to create config for context: {}", name))?
            }
            (None, Some(name)) => {
                anyhow::bail!(
                    "Context '{}' requested but no kubeconfig could be read. Is kubectl configured?",
                    name
                );
            }
            (_, None) => kube::Config::infer()
                .await
                .context("Failed to infer Kubernetes config. Is kubectl configured?")?,
        };

        kube::Client::try_from(config).context("Failed to create Kubernetes client")
    }

    /// Connect and wrap the client in the cluster API used by the collector
    pub async fn connect(&self, context_name: Option<&str>) -> Result<ClusterApi> {
        let client = self.client_for_context(context_name).await?;
        Ok(ClusterApi::new(client))
    }
}

impl Default for KubeClient {
    fn default() -> Self {
        Self::new()
    }
}
