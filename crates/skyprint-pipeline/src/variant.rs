//! Tagged-dictionary restore helpers.
//!
//! Saved configurations are JSON objects carrying a tag field
//! (`cutout_type`, `processing_type`, `class_name`, `similarity_type`).
//! Restoring checks the tag against the known table first so an unknown
//! variant is reported as [`PipelineError::UnknownVariant`] rather than a
//! generic deserialization failure.

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::types::PipelineError;

/// Read the string tag stored under `field`.
///
/// # Errors
///
/// Returns [`PipelineError::InvalidConfig`] if the value is not an object
/// or the tag is missing or not a string.
pub fn tag_of<'a>(value: &'a Value, field: &str) -> Result<&'a str, PipelineError> {
    value
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| PipelineError::InvalidConfig(format!("missing {field:?} tag")))
}

/// Validate the tag under `field` against `known`, then deserialize.
///
/// # Errors
///
/// Returns [`PipelineError::UnknownVariant`] for tags outside `known`,
/// [`PipelineError::InvalidConfig`] for a missing tag and
/// [`PipelineError::Serialization`] when the parameters do not parse.
pub fn load_variant<T: DeserializeOwned>(
    value: &Value,
    field: &str,
    kind: &str,
    known: &[&str],
) -> Result<T, PipelineError> {
    let tag = tag_of(value, field)?;
    if !known.contains(&tag) {
        return Err(PipelineError::unknown_variant(kind, tag));
    }
    Ok(T::deserialize(value)?)
}
