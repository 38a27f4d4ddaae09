//! Worker pool: pulls tasks from the queue and runs them.
//!
//! Each worker consumes under its own name, `<pool name>-<index>`. A task
//! stays on that consumer's processing list until it has been settled, so a
//! process that dies mid-task leaves it behind for [`WorkerPool::recover`].

use std::sync::Arc;
use std::time::Duration;

use broker_common::TaskMessage;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::application::ports::TaskQueue;
use crate::application::services::orchestrator::Orchestrator;

/// Deliveries attempted before a task failing on an unavailable substrate
/// is abandoned.
pub const MAX_ATTEMPTS: u32 = 5;

const POLL: Duration = Duration::from_secs(2);
const RETRY_BASE: Duration = Duration::from_millis(500);

pub struct WorkerPool {
    orchestrator: Arc<Orchestrator>,
    queue: Arc<dyn TaskQueue>,
    name: String,
    workers: usize,
    poll: Duration,
    retry_base: Duration,
}

impl WorkerPool {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        queue: Arc<dyn TaskQueue>,
        name: impl Into<String>,
        workers: usize,
    ) -> Self {
        Self {
            orchestrator,
            queue,
            name: name.into(),
            workers,
            poll: POLL,
            retry_base: RETRY_BASE,
        }
    }

    /// Shorten the dequeue poll and retry backoff.
    #[must_use]
    pub fn with_timing(mut self, poll: Duration, retry_base: Duration) -> Self {
        self.poll = poll;
        self.retry_base = retry_base;
        self
    }

    /// Queue consumer name of worker `index`.
    #[must_use]
    pub fn consumer(&self, index: usize) -> String {
        format!("{}-{index}", self.name)
    }

    /// Put back tasks that a previous process of the same name took and
    /// never settled. Returns how many were requeued.
    ///
    /// # Errors
    ///
    /// Returns the queue error; nothing is lost, the tasks stay where they
    /// were.
    pub async fn recover(&self) -> anyhow::Result<usize> {
        let mut recovered = 0;
        for index in 0..self.workers {
            let consumer = self.consumer(index);
            let n = self.queue.recover(&consumer).await?;
            if n > 0 {
                tracing::warn!(consumer = %consumer, tasks = n, "redelivering unacknowledged tasks");
            }
            recovered += n;
        }
        Ok(recovered)
    }

    /// Recover, then run `workers` loops until `shutdown` flips to `true`.
    /// In-flight tasks finish before this returns.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        if let Err(e) = self.recover().await {
            tracing::error!(error = %format!("{e:#}"), "task recovery failed");
        }
        let mut set = JoinSet::new();
        for worker in 0..self.workers {
            let pool = Arc::clone(&self);
            let shutdown = shutdown.clone();
            set.spawn(async move { pool.worker_loop(worker, shutdown).await });
        }
        tracing::info!(name = %self.name, workers = self.workers, "worker pool started");
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "worker exited abnormally");
            }
        }
        tracing::info!("worker pool stopped");
    }

    // The dequeue is never raced against shutdown: dropping a take in flight
    // could strand a task the substrate already handed over.
    async fn worker_loop(&self, worker: usize, shutdown: watch::Receiver<bool>) {
        let consumer = self.consumer(worker);
        while !*shutdown.borrow() {
            match self.queue.dequeue(&consumer, self.poll).await {
                Ok(Some(task)) => self.settle(&consumer, task).await,
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(worker, error = %format!("{e:#}"), "dequeue failed");
                    tokio::time::sleep(self.poll).await;
                }
            }
        }
    }

    /// Pull and handle at most one task as worker 0. Returns whether one was
    /// handled.
    ///
    /// # Errors
    ///
    /// Returns the queue error when no task could be pulled.
    pub async fn process_next(&self, timeout: Duration) -> anyhow::Result<bool> {
        let consumer = self.consumer(0);
        match self.queue.dequeue(&consumer, timeout).await? {
            Some(task) => {
                self.settle(&consumer, task).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Handle tasks until the queue stays empty for `idle`.
    ///
    /// # Errors
    ///
    /// Returns the first queue error.
    pub async fn drain(&self, idle: Duration) -> anyhow::Result<usize> {
        let mut handled = 0;
        while self.process_next(idle).await? {
            handled += 1;
        }
        Ok(handled)
    }

    /// Handle the task, then acknowledge it once its outcome is durable:
    /// finished, requeued, or recorded as abandoned.
    async fn settle(&self, consumer: &str, task: TaskMessage) {
        if !self.handle(task).await {
            tracing::error!(consumer, "task left unacknowledged for redelivery");
            return;
        }
        if let Err(e) = self.queue.ack(consumer).await {
            tracing::warn!(consumer, error = %format!("{e:#}"), "acknowledgement failed; task may be redelivered");
        }
    }

    /// Run one task. Substrate outages are retried with backoff; any other
    /// error, an outage outlasting [`MAX_ATTEMPTS`], or a refused requeue is
    /// recorded as a failed operation so the instance does not stay in
    /// progress forever.
    ///
    /// Returns `false` when not even the failure could be recorded.
    async fn handle(&self, mut task: TaskMessage) -> bool {
        let Err(e) = self.orchestrator.execute(&task).await else {
            return true;
        };
        task.attempts += 1;
        let mut reason = e.to_string();
        if e.is_retryable() && task.attempts < MAX_ATTEMPTS {
            let backoff = self.retry_base * 2u32.saturating_pow(task.attempts - 1);
            tracing::warn!(
                instance_id = %task.instance_id,
                attempt = task.attempts,
                backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                "substrate unavailable, requeueing task"
            );
            tokio::time::sleep(backoff).await;
            match self.queue.enqueue(&task).await {
                Ok(()) => return true,
                Err(requeue) => {
                    tracing::error!(instance_id = %task.instance_id, error = %format!("{requeue:#}"), "requeue failed");
                    reason = format!("{reason}; requeue failed: {requeue:#}");
                }
            }
        }
        tracing::error!(instance_id = %task.instance_id, attempts = task.attempts, "giving up on task");
        match self.orchestrator.abandon(&task, &reason).await {
            Ok(()) => true,
            Err(e2) => {
                tracing::error!(instance_id = %task.instance_id, error = %e2, "could not record abandoned task");
                false
            }
        }
    }
}
