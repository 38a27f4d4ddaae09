//! Builds the addon catalog from addon and plan `meta.yaml` files.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use broker_common::Catalog;
use serde_json::{Map, Value};

use crate::application::ports::FileStore;
use crate::application::services::metadata::MetadataStore;
use crate::domain::error::{BrokerError, BrokerResult};

const META_FILE: &str = "meta.yaml";

pub struct CatalogLoader {
    metadata: Arc<MetadataStore>,
    files: Arc<dyn FileStore>,
}

impl CatalogLoader {
    pub fn new(metadata: Arc<MetadataStore>, files: Arc<dyn FileStore>) -> Self {
        Self { metadata, files }
    }

    /// Scan the addons root, then validate and save the resulting catalog.
    ///
    /// # Errors
    ///
    /// `Schema` when a `meta.yaml` is malformed or the assembled catalog
    /// fails validation.
    pub async fn load(&self) -> BrokerResult<Catalog> {
        let root = self.metadata.layout().addons_root();
        let mut addons = Map::new();
        for addon_dir in self.files.list_dirs(&root).await? {
            let Some(mut meta) = self.read_meta(&addon_dir).await? else {
                continue;
            };
            normalize(&mut meta);
            let mut plans = Vec::new();
            for plan_dir in self.files.list_dirs(&addon_dir.join("plans")).await? {
                if let Some(plan) = self.read_meta(&plan_dir).await? {
                    plans.push(Value::Object(plan));
                }
            }
            meta.insert("plans".into(), Value::Array(plans));
            let key = display_name(&meta).ok_or_else(|| schema(&addon_dir, "no displayName or name"))?;
            tracing::debug!(addon = %key, dir = %addon_dir.display(), "addon discovered");
            addons.insert(key, Value::Object(meta));
        }

        let mut catalog: Catalog =
            serde_json::from_value(Value::Object(addons)).map_err(|e| BrokerError::Schema {
                kind: "catalog",
                reason: e.to_string(),
            })?;
        self.metadata.save("", &mut catalog).await?;
        tracing::info!(addons = catalog.addons.len(), "catalog loaded");
        Ok(catalog)
    }

    async fn read_meta(&self, dir: &Path) -> BrokerResult<Option<Map<String, Value>>> {
        let path = dir.join(META_FILE);
        let Some(text) = self.files.read(&path).await? else {
            return Ok(None);
        };
        let value: Value = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))
            .map_err(|e| schema(&path, &format!("{e:#}")))?;
        match value {
            Value::Object(map) => Ok(Some(map)),
            _ => Err(schema(&path, "not a mapping")),
        }
    }
}

fn schema(path: &Path, reason: &str) -> BrokerError {
    BrokerError::Schema {
        kind: "catalog",
        reason: format!("{}: {reason}", path.display()),
    }
}

fn display_name(meta: &Map<String, Value>) -> Option<String> {
    ["displayName", "name"]
        .iter()
        .find_map(|k| meta.get(*k).and_then(Value::as_str))
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// `tags: "a, b"` becomes `["a", "b"]` and an unquoted `version: 1.0`
/// becomes a string.
fn normalize(meta: &mut Map<String, Value>) {
    if let Some(Value::Number(n)) = meta.get("version") {
        let version = n.to_string();
        meta.insert("version".into(), Value::String(version));
    }
    let tags = match meta.remove("tags") {
        Some(Value::String(s)) => s
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(|t| Value::String(t.to_string()))
            .collect(),
        Some(Value::Array(list)) => list,
        _ => Vec::new(),
    };
    meta.insert("tags".into(), Value::Array(tags));
}
