//! Turn raw admin API bodies into payload values

use serde_json::Value;

use crate::projection::project;
use adminscope_types::{AdminResource, Error, Result, StatsFormat};

/// Decode one admin response for `resource`
///
/// JSON endpoints keep the admin API's own document so explicit nulls and
/// key order survive; text endpoints become a JSON string.
pub fn decode(resource: &AdminResource, body: &[u8]) -> Result<Value> {
    match resource {
        AdminResource::ProxyConfig { resource, .. } => {
            let dump = decode_config_dump(body)?;
            project(&dump, *resource)
        }
        AdminResource::ProxyStats { format, .. } => match format {
            StatsFormat::Json => Ok(serde_json::from_slice(body)?),
            StatsFormat::Text => decode_text(body),
        },
        AdminResource::ControllerConfig { .. } => decode_controller_dump(body),
        AdminResource::RateLimitConfig => decode_text(body),
    }
}

fn decode_config_dump(body: &[u8]) -> Result<Value> {
    let dump: Value = serde_json::from_slice(body)?;
    match dump.get("configs") {
        Some(Value::Array(_)) => Ok(dump),
        Some(_) => Err(Error::DecodeFailure(
            "config dump field 'configs' is not an array".to_string(),
        )),
        None => Err(Error::DecodeFailure(
            "config dump has no 'configs' field".to_string(),
        )),
    }
}

fn decode_controller_dump(body: &[u8]) -> Result<Value> {
    let mut dump: Value = serde_json::from_slice(body)?;
    if !dump.is_object() {
        return Err(Error::DecodeFailure(
            "controller config dump is not an object".to_string(),
        ));
    }
    // an absent or null list means the controller holds no resources
    match dump.get_mut("resources").map(Value::take) {
        Some(resources @ Value::Array(_)) => Ok(resources),
        None | Some(Value::Null) => Ok(Value::Array(Vec::new())),
        Some(_) => Err(Error::DecodeFailure(
            "controller config dump field 'resources' is not a list".to_string(),
        )),
    }
}

fn decode_text(body: &[u8]) -> Result<Value> {
    std::str::from_utf8(body)
        .map(|text| Value::String(text.to_string()))
        .map_err(|e| Error::DecodeFailure(format!("response is not valid UTF-8: {}", e)))
}
