//! Admin API resources and the paths that serve them

use std::fmt;
use std::str::FromStr;

use crate::TargetRole;
use crate::error::{Error, Result};

/// Path and raw query string of an admin endpoint
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdminPath {
    pub path: String,
    pub query: Option<String>,
}

impl AdminPath {
    fn new(path: &str, query: Option<String>) -> Self {
        Self {
            path: path.to_string(),
            query,
        }
    }
}

/// What a collection request fetches
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AdminResource {
    /// Proxy xDS config dump, optionally projected to one resource type
    ProxyConfig {
        resource: ProxyResourceType,
        include_eds: bool,
    },
    /// Proxy statistics
    ProxyStats {
        kind: StatsType,
        format: StatsFormat,
    },
    /// Controller resource dump
    ControllerConfig { resource: ControllerResourceType },
    /// Rate limit service configuration
    RateLimitConfig,
}

impl AdminResource {
    pub fn role(&self) -> TargetRole {
        match self {
            Self::ProxyConfig { .. } | Self::ProxyStats { .. } => TargetRole::Proxy,
            Self::ControllerConfig { .. } => TargetRole::Controller,
            Self::RateLimitConfig => TargetRole::RateLimit,
        }
    }

    pub fn admin_path(&self) -> AdminPath {
        match self {
            Self::ProxyConfig { include_eds, .. } => AdminPath::new(
                "/config_dump",
                include_eds.then(|| "include_eds".to_string()),
            ),
            Self::ProxyStats { kind, format } => {
                let json = Some("format=json".to_string());
                match (kind, format) {
                    (StatsType::Server, StatsFormat::Json) => AdminPath::new("/stats", json),
                    (StatsType::Server, StatsFormat::Text) => {
                        AdminPath::new("/stats/prometheus", None)
                    }
                    (StatsType::Clusters, StatsFormat::Json) => AdminPath::new("/clusters", json),
                    (StatsType::Clusters, StatsFormat::Text) => AdminPath::new("/clusters", None),
                }
            }
            Self::ControllerConfig { resource } => AdminPath::new(
                "/api/config_dump",
                Some(format!("resource={}", resource.as_str())),
            ),
            Self::RateLimitConfig => AdminPath::new("/rlconfig", None),
        }
    }
}

// ============================================================================
// Proxy resource types
// ============================================================================

/// xDS resource types that can be projected out of a proxy config dump
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum ProxyResourceType {
    #[default]
    All,
    Bootstrap,
    Cluster,
    Endpoint,
    Listener,
    Route,
}

impl ProxyResourceType {
    pub const VALUES: [Self; 6] = [
        Self::All,
        Self::Bootstrap,
        Self::Cluster,
        Self::Endpoint,
        Self::Listener,
        Self::Route,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Bootstrap => "bootstrap",
            Self::Cluster => "cluster",
            Self::Endpoint => "endpoint",
            Self::Listener => "listener",
            Self::Route => "route",
        }
    }

    /// `@type` discriminator of the matching config dump entry
    pub fn type_url(&self) -> Option<&'static str> {
        match self {
            Self::All => None,
            Self::Bootstrap => Some("type.googleapis.com/envoy.admin.v3.BootstrapConfigDump"),
            Self::Cluster => Some("type.googleapis.com/envoy.admin.v3.ClustersConfigDump"),
            Self::Endpoint => Some("type.googleapis.com/envoy.admin.v3.EndpointsConfigDump"),
            Self::Listener => Some("type.googleapis.com/envoy.admin.v3.ListenersConfigDump"),
            Self::Route => Some("type.googleapis.com/envoy.admin.v3.RoutesConfigDump"),
        }
    }
}

impl FromStr for ProxyResourceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::VALUES
            .into_iter()
            .find(|t| t.as_str() == s.to_lowercase())
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "unknown resource type '{}'. Valid types are {}",
                    s,
                    Self::VALUES.map(|t| t.as_str()).join(", ")
                ))
            })
    }
}

impl fmt::Display for ProxyResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which statistics endpoint to read
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum StatsType {
    /// Server counters, gauges and histograms
    #[default]
    Server,
    /// Upstream cluster membership and health
    Clusters,
}

impl FromStr for StatsType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "" | "server" => Ok(Self::Server),
            "cluster" | "clusters" => Ok(Self::Clusters),
            other => Err(Error::InvalidArgument(format!("unknown stats type {}", other))),
        }
    }
}

/// Encoding asked of a stats endpoint
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum StatsFormat {
    #[default]
    Json,
    /// Prometheus exposition for server stats, plain listing for clusters
    Text,
}

// ============================================================================
// Controller resource types
// ============================================================================

macro_rules! controller_resources {
    ($( $variant:ident => $name:literal, [$($alias:literal),*] ;)*) => {
        /// Resource kinds served by the controller's config dump endpoint
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub enum ControllerResourceType {
            $( $variant, )*
        }

        impl ControllerResourceType {
            pub const VALUES: &'static [Self] = &[ $( Self::$variant, )* ];

            /// Value of the `resource` query parameter
            pub fn as_str(&self) -> &'static str {
                match self {
                    $( Self::$variant => $name, )*
                }
            }

            /// Short command aliases
            pub fn aliases(&self) -> &'static [&'static str] {
                match self {
                    $( Self::$variant => &[$($alias),*], )*
                }
            }
        }
    };
}

controller_resources! {
    All => "all", [];
    GatewayClass => "gatewayclass", ["gc"];
    Gateway => "gateway", ["gw"];
    HttpRoute => "httproute", ["hr"];
    GrpcRoute => "grpcroute", ["gr"];
    TlsRoute => "tlsroute", ["tr"];
    TcpRoute => "tcproute", ["tcr"];
    UdpRoute => "udproute", ["ur"];
    ClientTrafficPolicy => "clienttrafficpolicy", ["ctp"];
    BackendTrafficPolicy => "backendtrafficpolicy", ["btp"];
    BackendTlsPolicy => "backendtlspolicy", ["btlsp"];
    SecurityPolicy => "securitypolicy", ["sp"];
    EnvoyPatchPolicy => "envoypatchpolicy", ["epp"];
    EnvoyExtensionPolicy => "envoyextensionpolicy", ["eep"];
    Service => "service", ["svc"];
    Secret => "secret", ["sec"];
    ConfigMap => "configmap", ["cm"];
    Namespace => "namespace", ["ns"];
    EndpointSlice => "endpointslice", ["eps"];
    ReferenceGrant => "referencegrant", ["rg"];
    HttpRouteFilter => "httproutefilter", ["hrf"];
    EnvoyProxy => "envoyproxy", ["ep"];
    Backend => "backend", ["be"];
    ServiceImport => "serviceimport", ["si"];
}

impl FromStr for ControllerResourceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.to_lowercase();
        Self::VALUES
            .iter()
            .copied()
            .find(|t| t.as_str() == wanted || t.aliases().contains(&wanted.as_str()))
            .ok_or_else(|| {
                Error::InvalidArgument(format!("unknown envoy gateway resource type '{}'", s))
            })
    }
}

impl fmt::Display for ControllerResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
