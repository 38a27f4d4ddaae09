//! Ordered request parameters with flatten and merge semantics.
//!
//! Callers address nested chart values with dotted keys (`a.b.c`). A nested
//! JSON object and its dotted spelling are treated the same by `flatten_keys`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Parameter carrying a base64-encoded YAML values document.
pub const RAW_VALUES_KEY: &str = "rawValues";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Parameters(BTreeMap<String, Value>);

impl Parameters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// The encoded bulk values blob, if supplied as a string.
    #[must_use]
    pub fn raw_values(&self) -> Option<&str> {
        self.0.get(RAW_VALUES_KEY).and_then(Value::as_str)
    }

    /// Dotted leaf keys of every explicit parameter except the bulk blob.
    #[must_use]
    pub fn flatten_keys(&self) -> Vec<String> {
        let mut out = Vec::new();
        for (key, value) in self.0.iter().filter(|(k, _)| k.as_str() != RAW_VALUES_KEY) {
            flatten_value(key, value, &mut out);
        }
        out
    }

    /// Overlay `update` on `self`. Keys whose new value is empty are removed.
    #[must_use]
    pub fn merged(&self, update: &Parameters) -> Parameters {
        let mut merged = self.0.clone();
        for (key, value) in &update.0 {
            if is_empty_value(value) {
                merged.remove(key);
            } else {
                merged.insert(key.clone(), value.clone());
            }
        }
        Parameters(merged)
    }

    /// `key=value` strings for the deployment tool's `--set` flags, one per
    /// leaf. Nested objects become dotted keys.
    #[must_use]
    pub fn set_overrides(&self) -> Vec<String> {
        let mut out = Vec::new();
        for (key, value) in self.0.iter().filter(|(k, _)| k.as_str() != RAW_VALUES_KEY) {
            push_override(key, value, &mut out);
        }
        out
    }
}

impl FromIterator<(String, Value)> for Parameters {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Parameters(iter.into_iter().collect())
    }
}

/// Append the dotted leaf keys of `value` under `prefix` to `out`.
///
/// Objects recurse; scalars, arrays and empty objects are leaves.
pub fn flatten_value(prefix: &str, value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (k, v) in map {
                flatten_value(&format!("{prefix}.{k}"), v, out);
            }
        }
        _ => out.push(prefix.to_string()),
    }
}

// Strings go out verbatim and lists of scalars in `{a,b}` list syntax. Any
// other leaf is rendered as compact JSON.
fn push_override(key: &str, value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (k, v) in map {
                push_override(&format!("{key}.{k}"), v, out);
            }
        }
        Value::String(s) => out.push(format!("{key}={s}")),
        Value::Array(items) if !items.is_empty() && items.iter().all(is_scalar) => {
            let rendered: Vec<String> = items
                .iter()
                .map(|item| match item {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect();
            out.push(format!("{key}={{{}}}", rendered.join(",")));
        }
        other => out.push(format!("{key}={other}")),
    }
}

fn is_scalar(value: &Value) -> bool {
    !matches!(value, Value::Array(_) | Value::Object(_))
}

/// Null, `""`, `{}` and `[]` count as "unset" when merging.
#[must_use]
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}
