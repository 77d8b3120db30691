use std::future::Future;

use adminscope_types::{LabelSelector, NamespaceInfo, PodInfo, Result};

/// Read access to the pods and namespaces of a cluster
pub trait PodDirectory: Send + Sync + 'static {
    /// List pods in a namespace matching a label selector
    fn list_pods(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> impl Future<Output = Result<Vec<PodInfo>>> + Send;

    /// Fetch one pod; `None` when it does not exist
    fn get_pod(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<Option<PodInfo>>> + Send;

    /// List every namespace in the cluster
    fn list_namespaces(&self) -> impl Future<Output = Result<Vec<NamespaceInfo>>> + Send;
}
