use serde::Deserialize;

use adminscope_types::{Error, Result};

/// ConfigMap holding the controller's own configuration
pub const CONTROLLER_CONFIG_MAP: &str = "envoy-gateway-config";
/// Key of the controller configuration document inside the ConfigMap
pub const CONTROLLER_CONFIG_KEY: &str = "envoy-gateway.yaml";

const CONTROLLER_API_VERSION: &str = "gateway.envoyproxy.io/v1alpha1";
const CONTROLLER_KIND: &str = "EnvoyGateway";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ControllerConfig {
    api_version: Option<String>,
    kind: Option<String>,
    rate_limit: Option<RateLimit>,
}

#[derive(Debug, Deserialize)]
struct RateLimit {
    backend: Option<RateLimitBackend>,
}

#[derive(Debug, Deserialize)]
struct RateLimitBackend {
    redis: Option<serde_yaml::Value>,
}

/// Whether the controller configuration enables global rate limiting
pub fn rate_limit_enabled(document: &str) -> Result<bool> {
    let config: ControllerConfig = serde_yaml::from_str(document)
        .map_err(|e| Error::Config(format!("invalid controller configuration: {}", e)))?;

    if config.api_version.as_deref() != Some(CONTROLLER_API_VERSION)
        || config.kind.as_deref() != Some(CONTROLLER_KIND)
    {
        return Err(Error::Config(format!(
            "controller configuration is not a {} {}",
            CONTROLLER_API_VERSION, CONTROLLER_KIND
        )));
    }

    Ok(config
        .rate_limit
        .and_then(|rl| rl.backend)
        .and_then(|backend| backend.redis)
        .is_some_and(|redis| !redis.is_null()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_enabled_with_redis() {
        let doc = r#"
apiVersion: gateway.envoyproxy.io/v1alpha1
kind: EnvoyGateway
rateLimit:
  backend:
    type: Redis
    redis:
      url: redis.redis-system.svc.cluster.local:6379
"#;
        assert!(rate_limit_enabled(doc).unwrap());
    }

    #[test]
    fn test_rate_limit_disabled_without_backend() {
        let doc = r#"
apiVersion: gateway.envoyproxy.io/v1alpha1
kind: EnvoyGateway
gateway:
  controllerName: gateway.envoyproxy.io/gatewayclass-controller
"#;
        assert!(!rate_limit_enabled(doc).unwrap());
    }

    #[test]
    fn test_rate_limit_rejects_foreign_document() {
        let doc = "apiVersion: v1\nkind: ConfigMap\n";
        assert!(matches!(rate_limit_enabled(doc), Err(Error::Config(_))));
        assert!(rate_limit_enabled(": not yaml :").is_err());
    }
}
