//! Settings file
//!
//! Optional TOML file read from `--config` or `ADMINSCOPE_CONFIG`. Every
//! field has a default, so an absent file and an empty file are equivalent.

use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use adminscope_collect::CollectorSettings;
use adminscope_k8s::TunnelOptions;
use adminscope_types::AdminPorts;

/// Namespace the gateway controller is installed in
pub const DEFAULT_CONTROLLER_NAMESPACE: &str = "envoy-gateway-system";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Kubeconfig context; the current context when unset
    pub kube_context: Option<String>,
    pub controller_namespace: String,
    pub bind_address: IpAddr,
    /// 0 removes the limit
    pub max_concurrency: usize,
    pub ready_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub ports: PortSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PortSettings {
    pub proxy: u16,
    pub controller: u16,
    pub rate_limit: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            kube_context: None,
            controller_namespace: DEFAULT_CONTROLLER_NAMESPACE.to_string(),
            bind_address: IpAddr::from([127, 0, 0, 1]),
            max_concurrency: 32,
            ready_timeout_secs: 30,
            request_timeout_secs: 60,
            ports: PortSettings::default(),
        }
    }
}

impl Default for PortSettings {
    fn default() -> Self {
        let ports = AdminPorts::default();
        Self {
            proxy: ports.proxy,
            controller: ports.controller,
            rate_limit: ports.rate_limit,
        }
    }
}

impl Settings {
    /// Load settings from `path`, or defaults when no path is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let settings = Self::parse(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))?;

        tracing::debug!(path = %path.display(), "loaded settings");
        Ok(settings)
    }

    fn parse(content: &str) -> Result<Self> {
        let settings: Self = toml::from_str(content)?;
        if settings.ready_timeout_secs == 0 || settings.request_timeout_secs == 0 {
            anyhow::bail!("timeouts must be at least one second");
        }
        Ok(settings)
    }

    pub fn admin_ports(&self) -> AdminPorts {
        AdminPorts {
            proxy: self.ports.proxy,
            controller: self.ports.controller,
            rate_limit: self.ports.rate_limit,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn tunnel_options(&self, local_port: u16) -> TunnelOptions {
        TunnelOptions {
            bind_address: self.bind_address,
            local_port,
            ready_timeout: Duration::from_secs(self.ready_timeout_secs),
            ..Default::default()
        }
    }

    pub fn collector_settings(&self) -> CollectorSettings {
        CollectorSettings {
            ports: self.admin_ports(),
            max_concurrency: self.max_concurrency,
            tunnel: self.tunnel_options(0),
        }
    }
}
