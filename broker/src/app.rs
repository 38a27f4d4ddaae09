//! Application context: one explicitly constructed set of clients and
//! services per process.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::application::ports::{
    Cache, ChartRepository, CommandRunner, FileStore, LockManager, TaskQueue,
};
use crate::application::services::catalog::CatalogLoader;
use crate::application::services::cleaner::Reaper;
use crate::application::services::executor::CommandExecutor;
use crate::application::services::hooks::HookRunner;
use crate::application::services::intake::Intake;
use crate::application::services::metadata::MetadataStore;
use crate::application::services::orchestrator::Orchestrator;
use crate::application::services::repository::RepositorySync;
use crate::application::services::savepoint::SavepointManager;
use crate::application::services::worker::WorkerPool;
use crate::domain::config::BrokerConfig;
use crate::infra::command_runner::TokioCommandRunner;
use crate::infra::fs_store::LocalFileStore;
use crate::infra::memory::{MemoryCache, MemoryLockManager, MemoryQueue};
use crate::infra::valkey::{self, ValkeyCache, ValkeyLockManager, ValkeyQueue};

/// Where cache, locks and queues live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Shared Valkey instance; required when intake and workers run in
    /// different processes.
    Valkey,
    /// In-process substitutes. Tasks only reach workers of this process.
    Local,
}

/// The coordination substrate, as trait objects.
pub struct Substrate {
    pub cache: Arc<dyn Cache>,
    pub locks: Arc<dyn LockManager>,
    pub queue: Arc<dyn TaskQueue>,
}

impl Substrate {
    /// Connect to Valkey, or build the in-memory stand-ins.
    ///
    /// # Errors
    ///
    /// Returns an error when Valkey cannot be reached.
    pub async fn connect(config: &BrokerConfig, backend: Backend) -> Result<Self> {
        match backend {
            Backend::Local => Ok(Self::local()),
            Backend::Valkey => {
                let client = valkey::connect(&config.valkey_url)
                    .await
                    .with_context(|| format!("connecting to Valkey at {}", config.valkey_url))?;
                let queue = ValkeyQueue::new(client.clone());
                Ok(Self {
                    cache: Arc::new(ValkeyCache::new(client.clone())),
                    locks: Arc::new(ValkeyLockManager::new(client, config.lock_lease())),
                    queue: Arc::new(queue),
                })
            }
        }
    }

    #[must_use]
    pub fn local() -> Self {
        Self {
            cache: Arc::new(MemoryCache::new()),
            locks: Arc::new(MemoryLockManager::new()),
            queue: Arc::new(MemoryQueue::new()),
        }
    }
}

pub struct AppContext {
    pub config: BrokerConfig,
    pub metadata: Arc<MetadataStore>,
    pub orchestrator: Arc<Orchestrator>,
    pub intake: Intake,
    pub workers: Arc<WorkerPool>,
    pub reaper: Reaper,
    pub catalog: CatalogLoader,
    files: Arc<dyn FileStore>,
}

impl AppContext {
    /// Wire every service over `substrate`, using real processes and the
    /// local filesystem.
    #[must_use]
    pub fn new(config: BrokerConfig, substrate: Substrate) -> Self {
        Self::with_runner(config, substrate, Arc::new(TokioCommandRunner::new()))
    }

    /// Like [`AppContext::new`] with a custom command runner.
    #[must_use]
    pub fn with_runner(config: BrokerConfig, substrate: Substrate, runner: Arc<dyn CommandRunner>) -> Self {
        let Substrate { cache, locks, queue } = substrate;
        let layout = config.layout();
        let files: Arc<dyn FileStore> = Arc::new(LocalFileStore::new());
        let metadata = Arc::new(MetadataStore::new(
            Arc::clone(&files),
            cache,
            layout.clone(),
            config.cache_ttl(),
        ));

        let hooks = HookRunner::new(
            Arc::clone(&runner),
            Arc::clone(&files),
            Arc::clone(&metadata),
            config.hook_timeout(),
        );
        let executor = CommandExecutor::new(
            runner,
            layout.clone(),
            config.helm_bin.clone(),
            config.kubectl_bin.clone(),
            config.command_timeout(),
        );
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&metadata),
            Arc::clone(&locks),
            Arc::clone(&files),
            hooks,
            SavepointManager::new(Arc::clone(&files), layout),
            executor,
            config.command_timeout(),
        ));

        let workers = Arc::new(WorkerPool::new(
            Arc::clone(&orchestrator),
            Arc::clone(&queue),
            config.worker_name.clone(),
            config.workers,
        ));
        let intake = Intake::new(Arc::clone(&metadata), Arc::clone(&locks), queue, Arc::clone(&files));
        let reaper = Reaper::new(Arc::clone(&metadata), Arc::clone(&files), locks, config.reap_after());
        let catalog = CatalogLoader::new(Arc::clone(&metadata), Arc::clone(&files));

        Self {
            config,
            metadata,
            orchestrator,
            intake,
            workers,
            reaper,
            catalog,
            files,
        }
    }

    /// Mirror addon repositories through `repository` into this broker's
    /// addons root.
    #[must_use]
    pub fn repository_sync(&self, repository: Arc<dyn ChartRepository>) -> RepositorySync {
        RepositorySync::new(repository, Arc::clone(&self.files), self.config.layout())
    }
}
