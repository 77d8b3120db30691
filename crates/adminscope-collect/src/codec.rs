//! JSON and YAML output encoding

use serde::Serialize;

use adminscope_types::{Error, OutputFormat, Result};

/// Encode `value` in the requested format
///
/// JSON is the canonical form. YAML is produced by converting the encoded
/// JSON, so both outputs always describe the same document.
pub fn encode<T: Serialize + ?Sized>(value: &T, format: OutputFormat) -> Result<Vec<u8>> {
    let json = encode_json(value)?;
    match format {
        OutputFormat::Json => Ok(json),
        OutputFormat::Yaml => json_to_yaml(&json),
    }
}

fn encode_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let mut out = serde_json::to_vec_pretty(value)
        .map_err(|e| Error::DecodeFailure(format!("failed to encode JSON: {}", e)))?;
    out.push(b'\n');
    Ok(out)
}

fn json_to_yaml(json: &[u8]) -> Result<Vec<u8>> {
    let value: serde_json::Value = serde_json::from_slice(json)?;
    serde_yaml::to_string(&value)
        .map(String::into_bytes)
        .map_err(|e| Error::DecodeFailure(format!("failed to encode YAML: {}", e)))
}
