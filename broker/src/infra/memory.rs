//! In-process cache, lock and queue.
//!
//! Used by the single-process binary mode and by tests. Semantics match the
//! Valkey implementations except that nothing is shared between processes.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use broker_common::{Priority, TaskMessage};
use tokio::sync::{Notify, OwnedMutexGuard};
use tokio::time::Instant;

use crate::application::ports::{Cache, Lease, LeaseWatch, LockHandle, LockManager, TaskQueue};
use crate::domain::error::{BrokerError, BrokerResult};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Cache ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
    failing: AtomicBool,
}

impl MemoryCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail, to exercise fall-through paths.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        lock(&self.entries).clear();
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        lock(&self.entries)
            .get(key)
            .is_some_and(|(_, expires)| *expires > Instant::now())
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("cache unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check()?;
        let mut entries = lock(&self.entries);
        match entries.get(key) {
            Some((value, expires)) if *expires > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.check()?;
        lock(&self.entries).insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check()?;
        lock(&self.entries).remove(key);
        Ok(())
    }
}

// ── Lock ──────────────────────────────────────────────────────────────────────

type LockTable = Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>;

/// Per-instance tokio mutexes. Waiters are served in FIFO order.
///
/// A table entry lives only while someone holds or waits for its lock.
#[derive(Debug, Default)]
pub struct MemoryLockManager {
    locks: LockTable,
    unavailable: AtomicBool,
    lose_leases: AtomicBool,
}

impl MemoryLockManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `acquire` fail as if the substrate were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Hand out leases that are already lost, as if each one expired right
    /// after it was granted.
    pub fn set_lose_leases(&self, lose: bool) {
        self.lose_leases.store(lose, Ordering::SeqCst);
    }

    /// Number of lock entries currently tracked.
    #[must_use]
    pub fn tracked(&self) -> usize {
        lock(&self.locks).len()
    }

    fn mutex_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(lock(&self.locks).entry(key.to_string()).or_default())
    }
}

struct MemoryLease {
    guard: Option<OwnedMutexGuard<()>>,
    key: String,
    table: LockTable,
}

impl MemoryLease {
    /// Unlock, then forget the entry unless another task holds a reference.
    fn unlock(&mut self) {
        if self.guard.take().is_none() {
            return;
        }
        let mut table = lock(&self.table);
        if table.get(&self.key).is_some_and(|m| Arc::strong_count(m) == 1) {
            table.remove(&self.key);
        }
    }
}

#[async_trait]
impl Lease for MemoryLease {
    async fn release(&mut self) -> Result<()> {
        self.unlock();
        Ok(())
    }
}

impl Drop for MemoryLease {
    fn drop(&mut self) {
        self.unlock();
    }
}

#[async_trait]
impl LockManager for MemoryLockManager {
    async fn acquire(&self, instance_id: &str) -> BrokerResult<LockHandle> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BrokerError::Unavailable(format!(
                "lock substrate unreachable for '{instance_id}'"
            )));
        }
        let guard = self.mutex_for(instance_id).lock_owned().await;
        tracing::debug!(instance_id, "lock acquired");
        let watch = LeaseWatch::new();
        if self.lose_leases.load(Ordering::SeqCst) {
            watch.mark_lost();
        }
        let lease = MemoryLease {
            guard: Some(guard),
            key: instance_id.to_string(),
            table: Arc::clone(&self.locks),
        };
        Ok(LockHandle::new(instance_id, Box::new(lease), watch))
    }
}

// ── Queue ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Queues {
    high: VecDeque<TaskMessage>,
    low: VecDeque<TaskMessage>,
    processing: HashMap<String, Vec<TaskMessage>>,
}

#[derive(Debug, Default)]
pub struct MemoryQueue {
    queues: Mutex<Queues>,
    notify: Notify,
    refuse_enqueue: AtomicBool,
}

impl MemoryQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `enqueue` fail as if the substrate were unreachable.
    pub fn set_refuse_enqueue(&self, refuse: bool) {
        self.refuse_enqueue.store(refuse, Ordering::SeqCst);
    }

    /// Tasks waiting to be dequeued.
    #[must_use]
    pub fn len(&self) -> usize {
        let q = lock(&self.queues);
        q.high.len() + q.low.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tasks taken by `consumer` and not yet acknowledged.
    #[must_use]
    pub fn in_flight(&self, consumer: &str) -> usize {
        lock(&self.queues).processing.get(consumer).map_or(0, Vec::len)
    }

    fn take(&self, consumer: &str) -> Option<TaskMessage> {
        let mut q = lock(&self.queues);
        let task = q.high.pop_front().or_else(|| q.low.pop_front())?;
        q.processing
            .entry(consumer.to_string())
            .or_default()
            .push(task.clone());
        Some(task)
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn enqueue(&self, task: &TaskMessage) -> Result<()> {
        if self.refuse_enqueue.load(Ordering::SeqCst) {
            anyhow::bail!("queue unavailable");
        }
        {
            let mut q = lock(&self.queues);
            match task.priority() {
                Priority::High => q.high.push_back(task.clone()),
                Priority::Low => q.low.push_back(task.clone()),
            }
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self, consumer: &str, timeout: Duration) -> Result<Option<TaskMessage>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if let Some(task) = self.take(consumer) {
                return Ok(Some(task));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(self.take(consumer));
            }
        }
    }

    async fn ack(&self, consumer: &str) -> Result<()> {
        let mut q = lock(&self.queues);
        if let Some(list) = q.processing.get_mut(consumer) {
            list.pop();
            if list.is_empty() {
                q.processing.remove(consumer);
            }
        }
        Ok(())
    }

    async fn recover(&self, consumer: &str) -> Result<usize> {
        let recovered = {
            let mut q = lock(&self.queues);
            let Some(list) = q.processing.remove(consumer) else {
                return Ok(0);
            };
            for task in list.iter().rev() {
                match task.priority() {
                    Priority::High => q.high.push_front(task.clone()),
                    Priority::Low => q.low.push_front(task.clone()),
                }
            }
            list.len()
        };
        for _ in 0..recovered {
            self.notify.notify_one();
        }
        Ok(recovered)
    }
}
