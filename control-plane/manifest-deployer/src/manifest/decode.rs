use kube::core::DynamicObject;
use serde_json::Value;

use crate::crd::ManifestEntry;
use crate::error::DeployerError;

/// Turn one manifest entry into a typed dynamic object.
///
/// String manifests are parsed as a single YAML document (JSON is valid YAML).
pub fn decode_manifest(
    index: usize,
    entry: &ManifestEntry,
) -> Result<DynamicObject, DeployerError> {
    let raw = match &entry.manifest {
        Value::String(text) => serde_yaml::from_str::<Value>(text).map_err(|e| {
            DeployerError::Decode {
                index,
                message: e.to_string(),
            }
        })?,
        other => other.clone(),
    };
    validate(index, &raw)?;
    serde_json::from_value::<DynamicObject>(raw).map_err(|e| DeployerError::Decode {
        index,
        message: e.to_string(),
    })
}

fn validate(index: usize, raw: &Value) -> Result<(), DeployerError> {
    let fail = |message: &str| DeployerError::Decode {
        index,
        message: message.to_string(),
    };
    let obj = raw.as_object().ok_or_else(|| fail("manifest is not an object"))?;
    let non_empty = |v: Option<&Value>| {
        v.and_then(Value::as_str).map(|s| !s.is_empty()).unwrap_or(false)
    };
    if !non_empty(obj.get("apiVersion")) {
        return Err(fail("apiVersion is missing"));
    }
    if !non_empty(obj.get("kind")) {
        return Err(fail("kind is missing"));
    }
    if !non_empty(obj.get("metadata").and_then(|m| m.get("name"))) {
        return Err(fail("metadata.name is missing"));
    }
    Ok(())
}
