//! Binding templates and credential sources.
//!
//! A plan's `bind.yaml` renders to a `credential:` list. Each entry carries
//! either a literal `value` or a `valueFrom` reference to a field of a
//! cluster object in the instance's namespace.

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// Name of the template file whose rendered section carries credentials.
const BIND_SOURCE_SUFFIX: &str = "/templates/bind.yaml";

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct BindTemplate {
    #[serde(default)]
    pub credential: Vec<CredentialEntry>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct CredentialEntry {
    pub name: String,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default, rename = "valueFrom")]
    pub value_from: Option<ValueFrom>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ValueFrom {
    #[serde(default)]
    pub service_ref: Option<FieldRef>,
    #[serde(default)]
    pub config_map_ref: Option<FieldRef>,
    #[serde(default)]
    pub secret_key_ref: Option<FieldRef>,
}

/// A JSONPath query against one named object.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct FieldRef {
    pub name: String,
    pub jsonpath: String,
}

/// Where a credential value comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    Literal(String),
    Service(FieldRef),
    ConfigMap(FieldRef),
    /// Secret data is base64-encoded and decoded after lookup.
    Secret(FieldRef),
    /// Neither a value nor a recognized reference.
    Invalid,
}

impl CredentialSource {
    /// Cluster-API query arguments, `None` for literals and invalid sources.
    #[must_use]
    pub fn query_args(&self, namespace: &str) -> Option<Vec<String>> {
        let (resource, field) = match self {
            CredentialSource::Service(f) => ("svc", f),
            CredentialSource::ConfigMap(f) => ("cm", f),
            CredentialSource::Secret(f) => ("secret", f),
            CredentialSource::Literal(_) | CredentialSource::Invalid => return None,
        };
        Some(vec![
            "get".to_string(),
            resource.to_string(),
            field.name.clone(),
            "-n".to_string(),
            namespace.to_string(),
            "-o".to_string(),
            format!("jsonpath={}", field.jsonpath),
        ])
    }
}

impl CredentialEntry {
    /// A literal value wins over a reference. The first populated reference
    /// is used, checked in service, config map, secret order.
    #[must_use]
    pub fn source(&self) -> CredentialSource {
        if let Some(value) = &self.value {
            return CredentialSource::Literal(match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            });
        }
        let Some(from) = &self.value_from else {
            return CredentialSource::Invalid;
        };
        if let Some(f) = &from.service_ref {
            CredentialSource::Service(f.clone())
        } else if let Some(f) = &from.config_map_ref {
            CredentialSource::ConfigMap(f.clone())
        } else if let Some(f) = &from.secret_key_ref {
            CredentialSource::Secret(f.clone())
        } else {
            CredentialSource::Invalid
        }
    }
}

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("rendered output has no bind.yaml section")]
    Missing,
    #[error("bind.yaml is not valid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// The rendered `bind.yaml` section of a multi-document template output.
///
/// The section starts after its `# Source: <chart>/templates/bind.yaml`
/// marker and ends at the next `---` separator or end of output.
#[must_use]
pub fn extract_bind_section(rendered: &str) -> Option<String> {
    let mut lines = rendered.lines();
    lines.by_ref().find(|line| {
        line.strip_prefix("# Source:")
            .is_some_and(|src| src.trim_end().ends_with(BIND_SOURCE_SUFFIX))
    })?;
    let section: Vec<&str> = lines.take_while(|line| line.trim_end() != "---").collect();
    Some(section.join("\n"))
}

/// Parse the credential list out of a full template render.
///
/// # Errors
///
/// Returns [`TemplateError::Missing`] when no bind section was rendered and
/// [`TemplateError::Yaml`] when it does not parse.
pub fn parse_bind_template(rendered: &str) -> Result<BindTemplate, TemplateError> {
    let section = extract_bind_section(rendered).ok_or(TemplateError::Missing)?;
    if section.trim().is_empty() {
        return Ok(BindTemplate::default());
    }
    Ok(serde_yaml::from_str(&section)?)
}
