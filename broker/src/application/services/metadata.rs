//! Metadata store: durable JSON documents behind a read-through cache.
//!
//! The file under the broker root is the single source of truth. The cache is
//! refreshed on every save and consulted first on load, but any cache fault
//! falls through to the file.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use broker_common::{
    Binding, Catalog, HookResult, Operation, ServiceInstance, binding_key, hooks_key,
    instance_key, keys, validate_instance_id,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::application::ports::{Cache, FileStore};
use crate::domain::error::{BrokerError, BrokerResult};
use crate::domain::layout::Layout;

/// A persisted document kind.
pub trait Document: Serialize + DeserializeOwned + Send + Sync {
    /// Kind name used in errors and logs.
    const KIND: &'static str;

    fn cache_key(key: &str) -> String;

    fn path(layout: &Layout, key: &str) -> PathBuf;

    /// Structural checks beyond what deserialization enforces.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Schema`] describing the first violation.
    fn validate(&self) -> BrokerResult<()>;

    /// Stamp the modification time, for kinds that carry one.
    fn touch(&mut self, now: DateTime<Utc>);
}

fn schema(kind: &'static str, reason: impl Into<String>) -> BrokerError {
    BrokerError::Schema {
        kind,
        reason: reason.into(),
    }
}

fn check_id(kind: &'static str, id: &str) -> BrokerResult<()> {
    validate_instance_id(id).map_err(|reason| schema(kind, format!("id '{id}': {reason}")))
}

impl Document for ServiceInstance {
    const KIND: &'static str = "instance";

    fn cache_key(key: &str) -> String {
        instance_key(key)
    }

    fn path(layout: &Layout, key: &str) -> PathBuf {
        layout.instance_file(key)
    }

    fn validate(&self) -> BrokerResult<()> {
        check_id(Self::KIND, &self.id)?;
        if self.details.service_id.is_empty() {
            return Err(schema(Self::KIND, "details.service_id is empty"));
        }
        if self.details.plan_id.is_empty() {
            return Err(schema(Self::KIND, "details.plan_id is empty"));
        }
        match self.last_operation.operation {
            Operation::Provision | Operation::Update | Operation::Deprovision => Ok(()),
            other => Err(schema(
                Self::KIND,
                format!("last_operation.operation '{other}' is not an instance operation"),
            )),
        }
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.last_modified_time = now;
    }
}

impl Document for Binding {
    const KIND: &'static str = "binding";

    fn cache_key(key: &str) -> String {
        binding_key(key)
    }

    fn path(layout: &Layout, key: &str) -> PathBuf {
        layout.binding_file(key)
    }

    fn validate(&self) -> BrokerResult<()> {
        check_id(Self::KIND, &self.id)?;
        if self.binding_id.is_empty() {
            return Err(schema(Self::KIND, "binding_id is empty"));
        }
        match self.last_operation.operation {
            Operation::Bind | Operation::Unbind => Ok(()),
            other => Err(schema(
                Self::KIND,
                format!("last_operation.operation '{other}' is not a binding operation"),
            )),
        }
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.last_modified_time = now;
    }
}

impl Document for HookResult {
    const KIND: &'static str = "hook result";

    fn cache_key(key: &str) -> String {
        hooks_key(key)
    }

    fn path(layout: &Layout, key: &str) -> PathBuf {
        layout.hooks_result_file(key)
    }

    fn validate(&self) -> BrokerResult<()> {
        check_id(Self::KIND, &self.instance_id)
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.last_modified_time = now;
    }
}

/// The catalog is a singleton; its key is ignored.
impl Document for Catalog {
    const KIND: &'static str = "catalog";

    fn cache_key(_key: &str) -> String {
        keys::ADDONS.to_string()
    }

    fn path(layout: &Layout, _key: &str) -> PathBuf {
        layout.catalog_file()
    }

    fn validate(&self) -> BrokerResult<()> {
        for (display, addon) in &self.addons {
            for (field, value) in [
                ("id", &addon.id),
                ("name", &addon.name),
                ("version", &addon.version),
            ] {
                if value.is_empty() {
                    return Err(schema(Self::KIND, format!("addon '{display}': {field} is empty")));
                }
            }
            if addon.plans.is_empty() {
                return Err(schema(Self::KIND, format!("addon '{display}' has no plans")));
            }
            if let Some(plan) = addon.plans.iter().find(|p| p.id.is_empty() || p.name.is_empty()) {
                return Err(schema(
                    Self::KIND,
                    format!("addon '{display}': plan '{}' lacks an id or name", plan.name),
                ));
            }
        }
        Ok(())
    }

    fn touch(&mut self, _now: DateTime<Utc>) {}
}

pub struct MetadataStore {
    files: Arc<dyn FileStore>,
    cache: Arc<dyn Cache>,
    layout: Layout,
    ttl: Duration,
}

impl MetadataStore {
    pub fn new(
        files: Arc<dyn FileStore>,
        cache: Arc<dyn Cache>,
        layout: Layout,
        ttl: Duration,
    ) -> Self {
        Self {
            files,
            cache,
            layout,
            ttl,
        }
    }

    #[must_use]
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Validate, stamp, persist durably, then refresh the cache.
    ///
    /// # Errors
    ///
    /// [`BrokerError::Schema`] when the document is invalid (nothing is
    /// written) and [`BrokerError::Unavailable`] when the durable write fails.
    pub async fn save<D: Document>(&self, key: &str, doc: &mut D) -> BrokerResult<()> {
        doc.touch(Utc::now());
        doc.validate()?;
        let json = serde_json::to_string_pretty(doc)
            .map_err(|e| schema(D::KIND, format!("serialize: {e}")))?;

        let path = D::path(&self.layout, key);
        self.files
            .write_atomic(&path, &json)
            .await
            .map_err(|e| BrokerError::unavailable(&format!("writing {} document", D::KIND), &e))?;

        let cache_key = D::cache_key(key);
        if let Err(e) = self.cache.set(&cache_key, &json, self.ttl).await {
            tracing::warn!(key = %cache_key, error = %format!("{e:#}"), "cache refresh failed");
            self.evict_key(&cache_key).await;
        }
        Ok(())
    }

    /// Load a document.
    ///
    /// # Errors
    ///
    /// [`BrokerError::NotFound`] when no durable copy exists,
    /// [`BrokerError::Schema`] when the stored copy is invalid.
    pub async fn load<D: Document>(&self, key: &str) -> BrokerResult<D> {
        self.try_load(key)
            .await?
            .ok_or_else(|| BrokerError::NotFound(format!("{} '{key}'", D::KIND)))
    }

    /// Like [`MetadataStore::load`] but a missing document is `None`.
    ///
    /// # Errors
    ///
    /// See [`MetadataStore::load`].
    pub async fn try_load<D: Document>(&self, key: &str) -> BrokerResult<Option<D>> {
        let cache_key = D::cache_key(key);
        match self.cache.get(&cache_key).await {
            Ok(Some(json)) => match decode::<D>(&json) {
                Ok(doc) => return Ok(Some(doc)),
                Err(e) => {
                    tracing::warn!(key = %cache_key, error = %e, "discarding unreadable cache entry");
                    self.evict_key(&cache_key).await;
                }
            },
            Ok(None) => tracing::debug!(key = %cache_key, "cache miss"),
            Err(e) => tracing::warn!(
                key = %cache_key,
                error = %format!("{e:#}"),
                "cache read failed, falling through to durable copy"
            ),
        }

        let path = D::path(&self.layout, key);
        let Some(json) = self
            .files
            .read(&path)
            .await
            .map_err(|e| BrokerError::unavailable(&format!("reading {} document", D::KIND), &e))?
        else {
            return Ok(None);
        };
        let doc = decode::<D>(&json)?;
        if let Err(e) = self.cache.set(&cache_key, &json, self.ttl).await {
            tracing::warn!(key = %cache_key, error = %format!("{e:#}"), "cache repopulate failed");
        }
        Ok(Some(doc))
    }

    /// Whether a durable copy exists. Never answered from the cache.
    ///
    /// # Errors
    ///
    /// [`BrokerError::Unavailable`] when the durable store cannot be read.
    pub async fn exists<D: Document>(&self, key: &str) -> BrokerResult<bool> {
        self.files
            .exists(&D::path(&self.layout, key))
            .await
            .map_err(|e| BrokerError::unavailable(&format!("checking {} document", D::KIND), &e))
    }

    /// Remove the durable copy and its cache entry. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// [`BrokerError::Unavailable`] when the durable delete fails.
    pub async fn delete<D: Document>(&self, key: &str) -> BrokerResult<bool> {
        let existed = self
            .files
            .remove_file(&D::path(&self.layout, key))
            .await
            .map_err(|e| BrokerError::unavailable(&format!("deleting {} document", D::KIND), &e))?;
        self.evict_key(&D::cache_key(key)).await;
        Ok(existed)
    }

    /// Drop the cache entry only.
    pub async fn evict<D: Document>(&self, key: &str) {
        self.evict_key(&D::cache_key(key)).await;
    }

    async fn evict_key(&self, cache_key: &str) {
        if let Err(e) = self.cache.delete(cache_key).await {
            tracing::warn!(key = %cache_key, error = %format!("{e:#}"), "cache evict failed");
        }
    }
}

fn decode<D: Document>(json: &str) -> BrokerResult<D> {
    let doc: D = serde_json::from_str(json).map_err(|e| schema(D::KIND, e.to_string()))?;
    doc.validate()?;
    Ok(doc)
}
