//! Savepoints: timestamped copies of an instance's templates taken before
//! every mutation.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;

use crate::application::ports::FileStore;
use crate::domain::error::BrokerResult;
use crate::domain::layout::{ADDON_VALUES_FILE, CUSTOM_VALUES_FILE, INSTANCE_FILE, Layout};

/// Backup directory names sort chronologically.
const BACKUP_STAMP: &str = "%Y%m%dT%H%M%S%.6fZ";

pub struct SavepointManager {
    files: Arc<dyn FileStore>,
    layout: Layout,
}

impl SavepointManager {
    pub fn new(files: Arc<dyn FileStore>, layout: Layout) -> Self {
        Self { files, layout }
    }

    /// Copy chart, plan and values overlays into `backups/<timestamp>/`.
    ///
    /// With `include_document`, the current `instance.json` is copied too.
    ///
    /// # Errors
    ///
    /// Fails when the chart or plan cannot be copied. Values files and the
    /// instance document are best-effort.
    pub async fn snapshot(&self, instance_id: &str, include_document: bool) -> BrokerResult<PathBuf> {
        let backup = self
            .layout
            .backups_dir(instance_id)
            .join(Utc::now().format(BACKUP_STAMP).to_string());

        self.files
            .copy_tree(&self.layout.chart_dir(instance_id), &backup.join("chart"))
            .await
            .with_context(|| format!("savepoint of chart for '{instance_id}'"))?;
        self.files
            .copy_tree(&self.layout.plan_dir(instance_id), &backup.join("plan"))
            .await
            .with_context(|| format!("savepoint of plan for '{instance_id}'"))?;

        let instance_dir = self.layout.instance_dir(instance_id);
        let mut optional = vec![ADDON_VALUES_FILE, CUSTOM_VALUES_FILE];
        if include_document {
            optional.push(INSTANCE_FILE);
        }
        for name in optional {
            self.copy_optional(&instance_dir.join(name), &backup.join(name)).await;
        }

        tracing::info!(instance_id, backup = %backup.display(), "savepoint taken");
        Ok(backup)
    }

    async fn copy_optional(&self, from: &Path, to: &Path) {
        match self.files.exists(from).await {
            Ok(false) => {}
            Ok(true) => {
                if let Err(e) = self.files.copy_file(from, to).await {
                    tracing::warn!(file = %from.display(), error = %format!("{e:#}"), "savepoint skipped file");
                }
            }
            Err(e) => {
                tracing::warn!(file = %from.display(), error = %format!("{e:#}"), "savepoint skipped file");
            }
        }
    }
}
