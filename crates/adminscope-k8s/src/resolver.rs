//! Scope to target resolution

use std::sync::Arc;

use futures::future::try_join_all;

use crate::directory::PodDirectory;
use adminscope_types::{Error, LabelSelector, PodInfo, Result, Scope, Target, TargetRole};

/// Turns a request scope into the Running pods to query
pub struct TargetResolver<D> {
    directory: Arc<D>,
}

impl<D> Clone for TargetResolver<D> {
    fn clone(&self) -> Self {
        Self {
            directory: Arc::clone(&self.directory),
        }
    }
}

impl<D: PodDirectory> TargetResolver<D> {
    pub fn new(directory: Arc<D>) -> Self {
        Self { directory }
    }

    /// Resolve a scope into targets, every one of them Running
    pub async fn resolve(&self, scope: &Scope, role: TargetRole) -> Result<Vec<Target>> {
        let targets = match scope {
            Scope::Pod { namespace, name } => {
                let pod = self
                    .directory
                    .get_pod(namespace, name)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("pod {}/{}", namespace, name)))?;
                vec![running_target(pod, role)?]
            }
            Scope::Selector {
                namespace,
                selector,
                expect_one,
            } => {
                let selector = selector.or(role.default_selector());
                let pods = self.directory.list_pods(namespace, &selector).await?;
                if pods.is_empty() {
                    return Err(Error::NotFound(format!(
                        "no pods in namespace {} match label selector {}",
                        namespace, selector
                    )));
                }
                if *expect_one && pods.len() > 1 {
                    return Err(Error::AmbiguousTarget {
                        selector: selector.to_string(),
                        matches: pods.iter().map(PodInfo::namespaced_name).collect(),
                    });
                }
                pods.into_iter()
                    .map(|pod| running_target(pod, role))
                    .collect::<Result<Vec<_>>>()?
            }
            Scope::AllNamespaces { selector } => {
                let selector = selector.or(role.default_selector());
                let namespaces = self.directory.list_namespaces().await?;
                let per_namespace = try_join_all(
                    namespaces
                        .iter()
                        .map(|ns| self.directory.list_pods(&ns.name, &selector)),
                )
                .await?;

                let pods: Vec<PodInfo> = per_namespace.into_iter().flatten().collect();
                if pods.is_empty() {
                    return Err(Error::NotFound(format!(
                        "no pods in any namespace match label selector {}",
                        selector
                    )));
                }
                let mut targets = pods
                    .into_iter()
                    .map(|pod| running_target(pod, role))
                    .collect::<Result<Vec<_>>>()?;
                targets.sort();
                targets
            }
        };

        tracing::debug!(count = targets.len(), role = %role, "resolved targets");
        Ok(targets)
    }

    /// Pods matching `selector` that are Running and Ready; others are skipped
    pub async fn resolve_ready(
        &self,
        namespace: &str,
        selector: &LabelSelector,
        role: TargetRole,
    ) -> Result<Vec<Target>> {
        let selector = selector.or(role.default_selector());
        let pods = self.directory.list_pods(namespace, &selector).await?;

        let targets: Vec<Target> = pods
            .into_iter()
            .filter(|pod| {
                let usable = pod.is_running() && pod.ready;
                if !usable {
                    tracing::debug!(pod = %pod.namespaced_name(), phase = %pod.phase, "skipping pod that is not ready");
                }
                usable
            })
            .map(|pod| Target::new(pod.namespace, pod.name, role))
            .collect();

        if targets.is_empty() {
            return Err(Error::NotFound(format!(
                "no ready {} pods in namespace {} match label selector {}, check that the instance starts properly",
                role, namespace, selector
            )));
        }
        Ok(targets)
    }
}

fn running_target(pod: PodInfo, role: TargetRole) -> Result<Target> {
    if !pod.is_running() {
        return Err(Error::NotRunning {
            pod: pod.namespaced_name(),
            phase: pod.phase.to_string(),
        });
    }
    Ok(Target::new(pod.namespace, pod.name, role))
}
