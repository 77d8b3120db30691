//! Shared types for adminscope
//!
//! This crate contains data structures used across multiple adminscope crates:
//! targets, scopes, requests, admin resources and the error taxonomy.

mod error;
mod resource;
mod selector;

use std::collections::BTreeMap;
use std::fmt;

pub use error::{AggregationError, Error, Result, TargetFailure};
pub use resource::{
    AdminPath, AdminResource, ControllerResourceType, ProxyResourceType, StatsFormat,
    StatsType,
};
pub use selector::LabelSelector;

// ============================================================================
// Kubernetes Resource Types
// ============================================================================

/// The kind of process a target pod runs, used to pick its admin port and path
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TargetRole {
    /// Envoy proxy data-plane pod
    Proxy,
    /// Envoy Gateway control-plane pod
    Controller,
    /// Envoy rate limit service pod
    RateLimit,
}

impl TargetRole {
    /// Label selector used when the caller does not provide one
    pub fn default_selector(&self) -> LabelSelector {
        let terms: &[&str] = match self {
            Self::Proxy => &[
                "app.kubernetes.io/name=envoy",
                "app.kubernetes.io/component=proxy",
                "app.kubernetes.io/managed-by=envoy-gateway",
            ],
            Self::Controller => &["control-plane=envoy-gateway"],
            Self::RateLimit => &[
                "app.kubernetes.io/name=envoy-ratelimit",
                "app.kubernetes.io/component=ratelimit",
                "app.kubernetes.io/managed-by=envoy-gateway",
            ],
        };
        LabelSelector::from_trusted(terms.iter().map(|t| t.to_string()).collect())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Proxy => "proxy",
            Self::Controller => "controller",
            Self::RateLimit => "ratelimit",
        }
    }
}

impl fmt::Display for TargetRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single pod to query
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Target {
    pub namespace: String,
    pub name: String,
    pub role: TargetRole,
}

impl Target {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, role: TargetRole) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            role,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Pod lifecycle phase as reported by the API server
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl From<&str> for PodPhase {
    fn from(s: &str) -> Self {
        match s {
            "Pending" => Self::Pending,
            "Running" => Self::Running,
            "Succeeded" => Self::Succeeded,
            "Failed" => Self::Failed,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for PodPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// Pod information
#[derive(Clone, Debug)]
pub struct PodInfo {
    pub name: String,
    pub namespace: String,
    pub phase: PodPhase,
    /// Whether the pod carries condition Ready=True
    pub ready: bool,
}

impl PodInfo {
    pub fn new(name: String, namespace: String) -> Self {
        Self {
            name,
            namespace,
            phase: PodPhase::Unknown,
            ready: false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.phase == PodPhase::Running
    }

    /// "namespace/name"
    pub fn namespaced_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// Namespace information
#[derive(Clone, Debug)]
pub struct NamespaceInfo {
    pub name: String,
    pub status: String,
}

impl NamespaceInfo {
    pub fn new(name: String, status: String) -> Self {
        Self { name, status }
    }
}

/// Admin ports per target role
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdminPorts {
    pub proxy: u16,
    pub controller: u16,
    pub rate_limit: u16,
}

impl AdminPorts {
    pub fn for_role(&self, role: TargetRole) -> u16 {
        match role {
            TargetRole::Proxy => self.proxy,
            TargetRole::Controller => self.controller,
            TargetRole::RateLimit => self.rate_limit,
        }
    }
}

impl Default for AdminPorts {
    fn default() -> Self {
        Self {
            proxy: 19000,
            controller: 19000,
            rate_limit: 6070,
        }
    }
}

// ============================================================================
// Request Types
// ============================================================================

/// Which pods a request targets
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Scope {
    /// One pod by name
    Pod { namespace: String, name: String },
    /// Pods matching a selector in one namespace; an empty selector means the
    /// role's default selector
    Selector {
        namespace: String,
        selector: LabelSelector,
        expect_one: bool,
    },
    /// Pods matching a selector in every namespace
    AllNamespaces { selector: LabelSelector },
}

impl Scope {
    /// Whether any per-target failure must fail the whole request
    pub fn expects_single(&self) -> bool {
        match self {
            Self::Pod { .. } => true,
            Self::Selector { expect_one, .. } => *expect_one,
            Self::AllNamespaces { .. } => false,
        }
    }
}

/// Output encoding
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Json,
    Yaml,
}

impl std::str::FromStr for OutputFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "yaml" | "yml" => Ok(Self::Yaml),
            other => Err(Error::InvalidArgument(format!(
                "unknown output format '{}', expected json or yaml",
                other
            ))),
        }
    }
}

/// One collection: what to fetch, from where, and how to encode it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CollectionRequest {
    pub resource_type: AdminResource,
    pub output: OutputFormat,
    pub scope: Scope,
}

impl CollectionRequest {
    pub fn new(resource_type: AdminResource, scope: Scope, output: OutputFormat) -> Self {
        Self {
            resource_type,
            output,
            scope,
        }
    }

    /// Role of the pods this request talks to
    pub fn role(&self) -> TargetRole {
        self.resource_type.role()
    }
}

// ============================================================================
// Result Types
// ============================================================================

/// Decoded payloads keyed by namespace, then pod name
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize)]
#[serde(transparent)]
pub struct CollectionResult(BTreeMap<String, BTreeMap<String, serde_json::Value>>);

impl CollectionResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, target: &Target, payload: serde_json::Value) {
        self.0
            .entry(target.namespace.clone())
            .or_default()
            .insert(target.name.clone(), payload);
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<&serde_json::Value> {
        self.0.get(namespace).and_then(|pods| pods.get(name))
    }

    /// Number of pod entries across all namespaces
    pub fn len(&self) -> usize {
        self.0.values().map(|pods| pods.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate (namespace, pod, payload) in sorted order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &serde_json::Value)> {
        self.0.iter().flat_map(|(ns, pods)| {
            pods.iter()
                .map(move |(name, payload)| (ns.as_str(), name.as_str(), payload))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pod_phase_from_str() {
        assert_eq!(PodPhase::from("Running"), PodPhase::Running);
        assert_eq!(PodPhase::from("CrashLoopBackOff"), PodPhase::Unknown);
    }

    #[test]
    fn test_scope_expects_single() {
        let pod = Scope::Pod {
            namespace: "default".to_string(),
            name: "envoy-0".to_string(),
        };
        assert!(pod.expects_single());

        let all = Scope::AllNamespaces {
            selector: LabelSelector::default(),
        };
        assert!(!all.expects_single());
    }

    #[test]
    fn test_collection_result_keys() {
        let mut result = CollectionResult::new();
        result.insert(
            &Target::new("ns-a", "pod-1", TargetRole::Proxy),
            serde_json::json!({"a": 1}),
        );
        result.insert(
            &Target::new("ns-b", "pod-2", TargetRole::Proxy),
            serde_json::Value::Null,
        );
        assert_eq!(result.len(), 2);
        assert!(result.get("ns-a", "pod-1").is_some());
        assert!(result.get("ns-a", "pod-2").is_none());

        let keys: Vec<_> = result.iter().map(|(ns, pod, _)| (ns, pod)).collect();
        assert_eq!(keys, vec![("ns-a", "pod-1"), ("ns-b", "pod-2")]);
    }

    #[test]
    fn test_output_format_parse() {
        assert_eq!("YAML".parse::<OutputFormat>().unwrap(), OutputFormat::Yaml);
        assert!("prom".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_default_admin_ports() {
        let ports = AdminPorts::default();
        assert_eq!(ports.for_role(TargetRole::Proxy), 19000);
        assert_eq!(ports.for_role(TargetRole::RateLimit), 6070);
    }
}
