use serde_json::Value;

use adminscope_types::{Error, ProxyResourceType, Result};

/// Extract one resource type from a proxy config dump
///
/// `All` returns the dump unchanged. Otherwise the first entry of `configs`
/// whose `@type` matches the resource's type URL is returned.
pub fn project(dump: &Value, resource: ProxyResourceType) -> Result<Value> {
    let Some(type_url) = resource.type_url() else {
        return Ok(dump.clone());
    };

    dump.get("configs")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .find(|entry| entry.get("@type").and_then(Value::as_str) == Some(type_url))
        .cloned()
        .ok_or_else(|| Error::NotFound(format!("{} config in config dump", resource)))
}
