//! Port trait definitions for the application layer.
//!
//! Ports are the contracts infrastructure must fulfill. This file imports
//! only from `crate::domain` and `broker_common`, never from `crate::infra`.
//!
//! Every port is object-safe and `Send + Sync` so services can hold them as
//! `Arc<dyn Port>` and move work onto spawned tasks.

use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use broker_common::TaskMessage;

use crate::domain::error::BrokerResult;

// ── Command Runner Port ───────────────────────────────────────────────────────

/// One subprocess invocation.
#[derive(Debug, Clone, Copy)]
pub struct CommandSpec<'a> {
    pub program: &'a str,
    pub args: &'a [String],
    /// Extra environment on top of the inherited one.
    pub envs: &'a [(String, String)],
    pub cwd: Option<&'a Path>,
    pub timeout: Duration,
}

/// Abstracts process execution so services can be tested without helm,
/// kubectl or bash on the host.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a program to completion and capture its output.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be spawned or exceeds
    /// `spec.timeout`. On timeout the child must be killed, not orphaned.
    async fn run(&self, spec: &CommandSpec<'_>) -> Result<Output>;
}

// ── Filesystem Port ───────────────────────────────────────────────────────────

/// Durable storage for documents and instance template trees.
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Read a file, `None` when it does not exist.
    async fn read(&self, path: &Path) -> Result<Option<String>>;

    /// Replace a file atomically. Once this returns the write survives a
    /// crash. Parent directories are created.
    async fn write_atomic(&self, path: &Path, contents: &str) -> Result<()>;

    /// Remove a file. Returns whether it existed.
    async fn remove_file(&self, path: &Path) -> Result<bool>;

    async fn exists(&self, path: &Path) -> Result<bool>;

    /// Copy one file, creating the destination's parent directories.
    async fn copy_file(&self, from: &Path, to: &Path) -> Result<()>;

    /// Recursively copy `from` to `to`, replacing anything already at `to`.
    async fn copy_tree(&self, from: &Path, to: &Path) -> Result<()>;

    /// Remove a directory tree. Returns whether it existed.
    async fn remove_tree(&self, path: &Path) -> Result<bool>;

    /// Immediate subdirectories of `path`, sorted. Empty when `path` is missing.
    async fn list_dirs(&self, path: &Path) -> Result<Vec<PathBuf>>;

    /// Unpack a gzip-compressed tarball into `dest`, creating it. Entries
    /// that would land outside `dest` are skipped.
    async fn unpack_tgz(&self, archive: Vec<u8>, dest: &Path) -> Result<()>;
}

// ── Chart Repository Port ─────────────────────────────────────────────────────

/// Read access to a remote addon repository.
#[async_trait]
pub trait ChartRepository: Send + Sync {
    /// Fetch the body at `url`.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failures and non-success statuses.
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

// ── Cache Port ────────────────────────────────────────────────────────────────

/// Advisory read-through cache shared by every broker process.
///
/// Never authoritative: callers fall back to [`FileStore`] on a miss or an
/// error.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

// ── Lock Port ─────────────────────────────────────────────────────────────────

/// The substrate-specific half of a held lock.
#[async_trait]
pub trait Lease: Send {
    /// Give the lock back. Called at most once per lease.
    async fn release(&mut self) -> Result<()>;
}

/// Shared flag a lease raises once the substrate no longer holds it for us.
///
/// Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct LeaseWatch(Arc<AtomicBool>);

impl LeaseWatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that the lease expired or was taken over.
    pub fn mark_lost(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_lost(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-instance mutual exclusion shared across all worker processes.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Wait until the instance's lock is free and take it.
    ///
    /// # Errors
    ///
    /// Returns [`crate::domain::error::BrokerError::Unavailable`] when the
    /// lock substrate cannot be reached. The caller must not proceed.
    async fn acquire(&self, instance_id: &str) -> BrokerResult<LockHandle>;
}

/// A held instance lock.
///
/// [`LockHandle::release`] is idempotent. Dropping an unreleased handle
/// drops its lease, whose own `Drop` gives the lock back on a best-effort
/// basis; the lease expiry bounds how long a lost release can block others.
pub struct LockHandle {
    instance_id: String,
    lease: Option<Box<dyn Lease>>,
    watch: LeaseWatch,
}

impl LockHandle {
    /// `watch` must be the flag the lease raises when it is lost.
    pub fn new(instance_id: impl Into<String>, lease: Box<dyn Lease>, watch: LeaseWatch) -> Self {
        Self {
            instance_id: instance_id.into(),
            lease: Some(lease),
            watch,
        }
    }

    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// A handle on the lease-lost flag, for work done under this lock.
    #[must_use]
    pub fn watch(&self) -> LeaseWatch {
        self.watch.clone()
    }

    #[must_use]
    pub fn is_held(&self) -> bool {
        self.lease.is_some()
    }

    /// Release the lock. Safe to call repeatedly and after the substrate
    /// connection dropped; failures are logged, not returned.
    pub async fn release(&mut self) {
        let Some(mut lease) = self.lease.take() else {
            return;
        };
        match lease.release().await {
            Ok(()) => tracing::debug!(instance_id = %self.instance_id, "lock released"),
            Err(e) => tracing::warn!(
                instance_id = %self.instance_id,
                error = %format!("{e:#}"),
                "lock release failed; lease expiry will reclaim it"
            ),
        }
    }
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("instance_id", &self.instance_id)
            .field("held", &self.is_held())
            .field("lost", &self.watch.is_lost())
            .finish()
    }
}

// ── Task Queue Port ───────────────────────────────────────────────────────────

/// The scheduling substrate between intake and workers.
///
/// Delivery is at-least-once: a dequeued task stays on the consumer's
/// processing list until acknowledged, and [`TaskQueue::recover`] puts back
/// whatever a dead consumer of the same name left there.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Submit a task on the queue of its priority class. Never blocks on
    /// execution.
    async fn enqueue(&self, task: &TaskMessage) -> Result<()>;

    /// Move the next task, high priority first, onto `consumer`'s
    /// processing list and return it. `None` after `timeout` without work.
    async fn dequeue(&self, consumer: &str, timeout: Duration) -> Result<Option<TaskMessage>>;

    /// Drop the task most recently handed to `consumer` from its processing
    /// list.
    async fn ack(&self, consumer: &str) -> Result<()>;

    /// Return every task on `consumer`'s processing list to the head of its
    /// queue. Returns how many were put back.
    async fn recover(&self, consumer: &str) -> Result<usize>;
}
