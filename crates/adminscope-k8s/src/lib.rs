//! Kubernetes client for adminscope
//!
//! This crate resolves the pods a request targets and opens port-forward
//! tunnels to their admin ports.

mod client;
mod cluster;
mod directory;
mod resolver;
mod tunnel;

pub use client::KubeClient;
pub use cluster::ClusterApi;
pub use directory::PodDirectory;
pub use resolver::TargetResolver;
pub use tunnel::{
    ReconnectBackoff, TunnelIo, TunnelOptions, TunnelSession, TunnelState, TunnelStatus,
    TunnelStream, TunnelTransport,
};

// Re-export types that are used in our public API
pub use adminscope_types::{
    Error, LabelSelector, NamespaceInfo, PodInfo, PodPhase, Result, Scope, Target, TargetRole,
};
