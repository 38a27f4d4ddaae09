//! Valkey-backed cache, lock and queue, built on a Fred client.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use broker_common::keys::{QUEUE_HIGH, QUEUE_LOW};
use broker_common::{Priority, TaskMessage, lock_key, processing_key};
use fred::prelude::*;
use fred::types::SetOptions;
use tokio::task::JoinHandle;

use crate::application::ports::{Cache, Lease, LeaseWatch, LockHandle, LockManager, TaskQueue};
use crate::domain::error::{BrokerError, BrokerResult};

/// Delete the key only while it still holds our token.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
  return redis.call("DEL", KEYS[1])
end
return 0
"#;

/// Extend the lease only while it still holds our token.
const RENEW_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
  return redis.call("PEXPIRE", KEYS[1], ARGV[2])
end
return 0
"#;

/// Pop the oldest task, high priority first, onto the processing list.
const TAKE_SCRIPT: &str = r#"
local task = redis.call("RPOP", KEYS[1])
if not task then
  task = redis.call("RPOP", KEYS[2])
end
if task then
  redis.call("LPUSH", KEYS[3], task)
end
return task
"#;

/// Move one task from the processing list back to the consuming end of its
/// queue, if it is still there.
const RESTORE_SCRIPT: &str = r#"
if redis.call("LREM", KEYS[1], 1, ARGV[1]) == 1 then
  redis.call("RPUSH", KEYS[2], ARGV[1])
  return 1
end
return 0
"#;

const ACK_SCRIPT: &str = r#"
return redis.call("LREM", KEYS[1], 1, ARGV[1])
"#;

const LIST_SCRIPT: &str = r#"
return redis.call("LRANGE", KEYS[1], 0, -1)
"#;

const MIN_POLL: Duration = Duration::from_millis(50);
const MAX_POLL: Duration = Duration::from_secs(1);

/// Connect and verify with a startup PING.
///
/// # Errors
///
/// Returns an error if the URL is invalid or the server does not answer.
pub async fn connect(valkey_url: &str) -> Result<Client> {
    let config = Config::from_url(valkey_url).context("invalid Valkey URL")?;
    let client = Builder::from_config(config)
        .with_connection_config(|conn_config| {
            conn_config.connection_timeout = Duration::from_secs(5);
            conn_config.internal_command_timeout = Duration::from_secs(10);
        })
        .set_policy(ReconnectPolicy::new_exponential(0, 100, 5000, 5))
        .build()?;
    client.init().await.context("Valkey connection failed")?;
    client
        .ping::<String>(None)
        .await
        .context("Valkey startup PING failed")?;
    tracing::info!(valkey_url, "Valkey connection ready");
    Ok(client)
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

// ── Cache ─────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct ValkeyCache {
    client: Client,
}

impl ValkeyCache {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Cache for ValkeyCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.client
            .get::<Option<String>, _>(key)
            .await
            .with_context(|| format!("GET {key}"))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.client
            .set::<(), _, _>(key, value, Some(Expiration::PX(millis(ttl))), None, false)
            .await
            .with_context(|| format!("SET {key}"))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .del::<i64, _>(key)
            .await
            .with_context(|| format!("DEL {key}"))?;
        Ok(())
    }
}

// ── Lock ──────────────────────────────────────────────────────────────────────

/// `SET NX PX` lease with a random token, renewed every third of the lease.
///
/// A crashed holder stops renewing, so its key expires within one lease.
pub struct ValkeyLockManager {
    client: Client,
    lease: Duration,
}

impl ValkeyLockManager {
    #[must_use]
    pub fn new(client: Client, lease: Duration) -> Self {
        Self { client, lease }
    }

    fn spawn_renewal(&self, key: String, token: String, watch: LeaseWatch) -> JoinHandle<()> {
        let client = self.client.clone();
        let lease = self.lease;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(lease / 3);
            interval.tick().await;
            loop {
                interval.tick().await;
                match client
                    .eval::<i64, _, _, _>(
                        RENEW_SCRIPT,
                        vec![key.clone()],
                        vec![token.clone(), millis(lease).to_string()],
                    )
                    .await
                {
                    Ok(1) => {}
                    Ok(_) => {
                        tracing::warn!(key = %key, "lock lease lost before release");
                        watch.mark_lost();
                        return;
                    }
                    Err(e) => tracing::warn!(key = %key, error = %e, "lock lease renewal failed"),
                }
            }
        })
    }
}

struct ValkeyLease {
    client: Client,
    key: String,
    token: String,
    renewal: JoinHandle<()>,
    released: bool,
}

#[async_trait]
impl Lease for ValkeyLease {
    async fn release(&mut self) -> Result<()> {
        self.renewal.abort();
        self.released = true;
        self.client
            .eval::<i64, _, _, _>(RELEASE_SCRIPT, vec![self.key.clone()], vec![self.token.clone()])
            .await
            .with_context(|| format!("releasing {}", self.key))?;
        Ok(())
    }
}

impl Drop for ValkeyLease {
    fn drop(&mut self) {
        self.renewal.abort();
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let (client, key, token) = (self.client.clone(), self.key.clone(), self.token.clone());
        handle.spawn(async move {
            if let Err(e) = client
                .eval::<i64, _, _, _>(RELEASE_SCRIPT, vec![key.clone()], vec![token])
                .await
            {
                tracing::warn!(key = %key, error = %e, "best-effort lock release failed");
            }
        });
    }
}

#[async_trait]
impl LockManager for ValkeyLockManager {
    async fn acquire(&self, instance_id: &str) -> BrokerResult<LockHandle> {
        let key = lock_key(instance_id);
        let token = uuid::Uuid::new_v4().to_string();
        let mut poll = MIN_POLL;
        loop {
            let set = self
                .client
                .set::<Option<String>, _, _>(
                    &key,
                    token.as_str(),
                    Some(Expiration::PX(millis(self.lease))),
                    Some(SetOptions::NX),
                    false,
                )
                .await
                .map_err(|e| {
                    BrokerError::unavailable(&format!("acquiring lock {key}"), &anyhow::Error::new(e))
                })?;
            if set.is_some() {
                break;
            }
            tokio::time::sleep(poll).await;
            poll = (poll * 2).min(MAX_POLL);
        }
        tracing::debug!(instance_id, "lock acquired");
        let watch = LeaseWatch::new();
        let renewal = self.spawn_renewal(key.clone(), token.clone(), watch.clone());
        Ok(LockHandle::new(
            instance_id,
            Box::new(ValkeyLease {
                client: self.client.clone(),
                key,
                token,
                renewal,
                released: false,
            }),
            watch,
        ))
    }
}

// ── Queue ─────────────────────────────────────────────────────────────────────

/// Two lists, pushed on the left and taken from the right, high priority
/// first. A taken task is moved atomically onto the consumer's processing
/// list and stays there until acknowledged.
///
/// Taking is a polled script rather than a blocking pop, because no blocking
/// command moves from one of two lists.
pub struct ValkeyQueue {
    client: Client,
    poll: Duration,
    /// Raw payload of the task each consumer holds, for acknowledgement.
    holding: Mutex<HashMap<String, String>>,
}

const QUEUE_POLL: Duration = Duration::from_millis(200);

impl ValkeyQueue {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self {
            client,
            poll: QUEUE_POLL,
            holding: Mutex::new(HashMap::new()),
        }
    }

    async fn take(&self, processing: &str) -> Result<Option<String>> {
        self.client
            .eval::<Option<String>, _, _, _>(
                TAKE_SCRIPT,
                vec![QUEUE_HIGH.to_string(), QUEUE_LOW.to_string(), processing.to_string()],
                Vec::<String>::new(),
            )
            .await
            .context("taking task from queues")
    }

    fn remember(&self, consumer: &str, payload: Option<String>) {
        let mut holding = self.holding.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match payload {
            Some(payload) => holding.insert(consumer.to_string(), payload),
            None => holding.remove(consumer),
        };
    }
}

fn queue_of(task: &TaskMessage) -> &'static str {
    match task.priority() {
        Priority::High => QUEUE_HIGH,
        Priority::Low => QUEUE_LOW,
    }
}

#[async_trait]
impl TaskQueue for ValkeyQueue {
    async fn enqueue(&self, task: &TaskMessage) -> Result<()> {
        let queue = queue_of(task);
        let json = serde_json::to_string(task).context("serializing task")?;
        self.client
            .lpush::<i64, _, _>(queue, json)
            .await
            .with_context(|| format!("LPUSH {queue}"))?;
        Ok(())
    }

    async fn dequeue(&self, consumer: &str, timeout: Duration) -> Result<Option<TaskMessage>> {
        let processing = processing_key(consumer);
        let deadline = tokio::time::Instant::now() + timeout;
        let json = loop {
            if let Some(json) = self.take(&processing).await? {
                break json;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll.min(deadline - now)).await;
        };
        let task = match serde_json::from_str(&json) {
            Ok(task) => task,
            Err(e) => {
                // An undecodable payload would be redelivered forever.
                let _ = self
                    .client
                    .eval::<i64, _, _, _>(ACK_SCRIPT, vec![processing.clone()], vec![json])
                    .await;
                return Err(anyhow::Error::new(e).context(format!("decoding task taken by {consumer}")));
            }
        };
        self.remember(consumer, Some(json));
        Ok(Some(task))
    }

    async fn ack(&self, consumer: &str) -> Result<()> {
        let payload = self
            .holding
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(consumer);
        let Some(payload) = payload else {
            return Ok(());
        };
        let processing = processing_key(consumer);
        self.client
            .eval::<i64, _, _, _>(ACK_SCRIPT, vec![processing.clone()], vec![payload])
            .await
            .with_context(|| format!("acknowledging task on {processing}"))?;
        Ok(())
    }

    async fn recover(&self, consumer: &str) -> Result<usize> {
        let processing = processing_key(consumer);
        let pending = self
            .client
            .eval::<Vec<String>, _, _, _>(LIST_SCRIPT, vec![processing.clone()], Vec::<String>::new())
            .await
            .with_context(|| format!("listing {processing}"))?;
        let mut recovered = 0;
        // The oldest delivery sits at the right end; restore it last so it
        // is taken first.
        for json in pending {
            let queue = match serde_json::from_str::<TaskMessage>(&json) {
                Ok(task) => queue_of(&task),
                Err(e) => {
                    tracing::warn!(consumer, error = %e, "dropping undecodable task");
                    self.client
                        .eval::<i64, _, _, _>(ACK_SCRIPT, vec![processing.clone()], vec![json])
                        .await
                        .with_context(|| format!("pruning {processing}"))?;
                    continue;
                }
            };
            recovered += self
                .client
                .eval::<i64, _, _, _>(RESTORE_SCRIPT, vec![processing.clone(), queue.to_string()], vec![json])
                .await
                .with_context(|| format!("restoring task from {processing}"))?;
        }
        self.remember(consumer, None);
        Ok(usize::try_from(recovered).unwrap_or(0))
    }
}
