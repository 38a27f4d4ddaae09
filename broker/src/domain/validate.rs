//! Parameter validation against an addon's allow-list.
//!
//! Addon authors declare coarse entries (`deployment.image`); callers may set
//! any dotted descendant (`deployment.image.tag`). Keys supplied through the
//! `rawValues` blob are flattened and checked exactly like explicit keys.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use broker_common::params::flatten_value;
use broker_common::{AllowParameter, Parameters};
use serde_json::Value;

use crate::domain::error::{BrokerError, BrokerResult};

/// Comma-joined violations. Empty strings mean no violation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterReport {
    pub disallowed: String,
    pub missing: String,
}

impl ParameterReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.disallowed.is_empty() && self.missing.is_empty()
    }

    /// # Errors
    ///
    /// Returns [`BrokerError::InvalidParameters`] naming the offending keys.
    pub fn into_result(self) -> BrokerResult<()> {
        if self.is_clean() {
            Ok(())
        } else {
            Err(BrokerError::InvalidParameters {
                disallowed: self.disallowed,
                missing: self.missing,
            })
        }
    }
}

/// `key` is `name` itself or one of its dotted descendants.
fn covers(name: &str, key: &str) -> bool {
    key == name
        || key
            .strip_prefix(name)
            .is_some_and(|rest| rest.starts_with('.'))
}

/// Check flattened keys against the allow-list.
#[must_use]
pub fn verify_keys(allow: &[AllowParameter], keys: &[String]) -> ParameterReport {
    let mut disallowed: Vec<&str> = Vec::new();
    for key in keys {
        let allowed = allow.iter().any(|p| covers(&p.name, key));
        if !allowed && !disallowed.contains(&key.as_str()) {
            disallowed.push(key);
        }
    }
    let missing: Vec<&str> = allow
        .iter()
        .filter(|p| p.required)
        .filter(|p| !keys.iter().any(|k| covers(&p.name, k)))
        .map(|p| p.name.as_str())
        .collect();
    ParameterReport {
        disallowed: disallowed.join(","),
        missing: missing.join(","),
    }
}

/// Validate `parameters` (explicit keys plus the decoded `rawValues` blob).
///
/// # Errors
///
/// Returns [`BrokerError::InvalidRequest`] when `rawValues` is not base64 of a
/// YAML mapping. Allow-list violations are reported, not raised.
pub fn verify(allow: &[AllowParameter], parameters: &Parameters) -> BrokerResult<ParameterReport> {
    let keys = collect_keys(parameters)?;
    Ok(verify_keys(allow, &keys))
}

/// Explicit keys followed by raw-values keys, deduplicated in first-seen order.
///
/// # Errors
///
/// See [`verify`].
pub fn collect_keys(parameters: &Parameters) -> BrokerResult<Vec<String>> {
    let mut keys = parameters.flatten_keys();
    if let Some(encoded) = parameters.raw_values() {
        let yaml = decode_raw_values(encoded)?;
        for key in raw_values_keys(&yaml)? {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
    }
    Ok(keys)
}

/// Decode the base64 `rawValues` blob into YAML text.
///
/// # Errors
///
/// Returns [`BrokerError::InvalidRequest`] on bad base64 or non-UTF-8 content.
pub fn decode_raw_values(encoded: &str) -> BrokerResult<String> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| BrokerError::InvalidRequest(format!("rawValues is not valid base64: {e}")))?;
    String::from_utf8(bytes)
        .map_err(|_| BrokerError::InvalidRequest("rawValues is not valid UTF-8".to_string()))
}

/// Dotted keys of a YAML values document.
///
/// # Errors
///
/// Returns [`BrokerError::InvalidRequest`] when the document is not a mapping.
pub fn raw_values_keys(yaml: &str) -> BrokerResult<Vec<String>> {
    let value: Value = serde_yaml::from_str(yaml)
        .map_err(|e| BrokerError::InvalidRequest(format!("rawValues is not valid YAML: {e}")))?;
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Object(map) => {
            let mut out = Vec::new();
            for (k, v) in &map {
                flatten_value(k, v, &mut out);
            }
            Ok(out)
        }
        _ => Err(BrokerError::InvalidRequest(
            "rawValues must be a YAML mapping".to_string(),
        )),
    }
}
