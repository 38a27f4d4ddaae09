//! Reaper for finished and abandoned instance directories.

use std::sync::Arc;
use std::time::Duration;

use broker_common::{Binding, HookResult, Operation, OperationState, ServiceInstance};
use chrono::Utc;

use crate::application::ports::{FileStore, LockManager};
use crate::application::services::intake::intake_key;
use crate::application::services::metadata::MetadataStore;
use crate::domain::error::BrokerResult;

pub struct Reaper {
    metadata: Arc<MetadataStore>,
    files: Arc<dyn FileStore>,
    locks: Arc<dyn LockManager>,
    reap_after: Duration,
}

impl Reaper {
    pub fn new(
        metadata: Arc<MetadataStore>,
        files: Arc<dyn FileStore>,
        locks: Arc<dyn LockManager>,
        reap_after: Duration,
    ) -> Self {
        Self {
            metadata,
            files,
            locks,
            reap_after,
        }
    }

    /// Remove instance directories that are deprovisioned, stuck in a failed
    /// deprovision past the grace period, or have no instance document.
    /// Returns the removed instance ids.
    ///
    /// # Errors
    ///
    /// Fails when the instances root cannot be listed or a lock cannot be
    /// taken. Unreadable documents are skipped.
    pub async fn clean(&self) -> BrokerResult<Vec<String>> {
        let layout = self.metadata.layout().clone();
        let mut reaped = Vec::new();
        for dir in self.files.list_dirs(&layout.instances_root()).await? {
            let Some(instance_id) = dir.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            let mut guard = self.locks.acquire(&intake_key(&instance_id)).await?;
            let verdict = self.should_reap(&instance_id).await;
            let removed = match verdict {
                Some(reason) => self.remove(&instance_id, &dir, reason).await,
                None => false,
            };
            guard.release().await;
            if removed {
                reaped.push(instance_id);
            }
        }
        Ok(reaped)
    }

    async fn should_reap(&self, instance_id: &str) -> Option<&'static str> {
        let instance = match self.metadata.try_load::<ServiceInstance>(instance_id).await {
            Ok(Some(instance)) => instance,
            Ok(None) => return Some("no instance document"),
            Err(e) => {
                tracing::warn!(instance_id, error = %e, "skipping unreadable instance");
                return None;
            }
        };
        let last = &instance.last_operation;
        if last.operation != Operation::Deprovision {
            return None;
        }
        if last.state == OperationState::Succeeded {
            return Some("deprovisioned");
        }
        let age = Utc::now()
            .signed_duration_since(instance.last_modified_time)
            .to_std()
            .unwrap_or_default();
        (age > self.reap_after).then_some("deprovision abandoned")
    }

    async fn remove(&self, instance_id: &str, dir: &std::path::Path, reason: &str) -> bool {
        if let Err(e) = self.files.remove_tree(dir).await {
            tracing::warn!(instance_id, error = %format!("{e:#}"), "could not remove instance directory");
            return false;
        }
        self.metadata.evict::<ServiceInstance>(instance_id).await;
        self.metadata.evict::<Binding>(instance_id).await;
        self.metadata.evict::<HookResult>(instance_id).await;
        tracing::info!(instance_id, reason, "instance reaped");
        true
    }
}
