//! Broker configuration schema.
//!
//! Values are loaded from `HELMBROKER_*` environment variables by
//! `infra::config`; this module only defines the shape, defaults and checks.

use std::path::PathBuf;
use std::time::Duration;

use broker_common::ttl;
use serde::Deserialize;

use crate::domain::error::ConfigError;
use crate::domain::layout::Layout;

pub const ENV_PREFIX: &str = "HELMBROKER_";

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct BrokerConfig {
    /// Root holding `addons/`, `config/` and `instances/`.
    #[serde(default = "default_config_root")]
    pub config_root: PathBuf,

    /// Valkey (Redis-compatible) URL for cache, locks and queues.
    #[serde(default = "default_valkey_url")]
    pub valkey_url: String,

    #[serde(default = "default_helm_bin")]
    pub helm_bin: String,

    #[serde(default = "default_kubectl_bin")]
    pub kubectl_bin: String,

    /// Upper bound on any deployment-tool or cluster-API subprocess.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,

    #[serde(default = "default_hook_timeout_secs")]
    pub hook_timeout_secs: u64,

    #[serde(default = "default_lock_lease_secs")]
    pub lock_lease_secs: u64,

    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Concurrent worker tasks per process.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Age after which a failed deprovision is reaped.
    #[serde(default = "default_reap_after_secs")]
    pub reap_after_secs: u64,

    /// Stable name of this process. Its workers' unacknowledged tasks are
    /// redelivered when a process of the same name starts again.
    #[serde(default = "default_worker_name")]
    pub worker_name: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            config_root: default_config_root(),
            valkey_url: default_valkey_url(),
            helm_bin: default_helm_bin(),
            kubectl_bin: default_kubectl_bin(),
            command_timeout_secs: default_command_timeout_secs(),
            hook_timeout_secs: default_hook_timeout_secs(),
            lock_lease_secs: default_lock_lease_secs(),
            cache_ttl_secs: default_cache_ttl_secs(),
            workers: default_workers(),
            reap_after_secs: default_reap_after_secs(),
            worker_name: default_worker_name(),
        }
    }
}

impl BrokerConfig {
    #[must_use]
    pub fn layout(&self) -> Layout {
        Layout::new(&self.config_root)
    }

    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    #[must_use]
    pub fn hook_timeout(&self) -> Duration {
        Duration::from_secs(self.hook_timeout_secs)
    }

    #[must_use]
    pub fn lock_lease(&self) -> Duration {
        Duration::from_secs(self.lock_lease_secs)
    }

    #[must_use]
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    #[must_use]
    pub fn reap_after(&self) -> Duration {
        Duration::from_secs(self.reap_after_secs)
    }

    /// Reject settings that would make workers hang or locks flap.
    ///
    /// # Errors
    ///
    /// Returns the first offending setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Zero { key: "workers" });
        }
        if self.command_timeout_secs == 0 {
            return Err(ConfigError::Zero {
                key: "command_timeout_secs",
            });
        }
        if self.hook_timeout_secs == 0 {
            return Err(ConfigError::Zero {
                key: "hook_timeout_secs",
            });
        }
        if self.cache_ttl_secs == 0 {
            return Err(ConfigError::Zero {
                key: "cache_ttl_secs",
            });
        }
        if self.worker_name.trim().is_empty() {
            return Err(ConfigError::Empty { key: "worker_name" });
        }
        if self.lock_lease_secs < 3 {
            return Err(ConfigError::LeaseTooShort(self.lock_lease_secs));
        }
        Ok(())
    }
}

fn default_config_root() -> PathBuf {
    PathBuf::from("/etc/helmbroker")
}

fn default_valkey_url() -> String {
    "redis://localhost:6379/0".to_string()
}

fn default_helm_bin() -> String {
    "helm".to_string()
}

fn default_kubectl_bin() -> String {
    "kubectl".to_string()
}

fn default_command_timeout_secs() -> u64 {
    30 * 60
}

fn default_hook_timeout_secs() -> u64 {
    10 * 60
}

fn default_lock_lease_secs() -> u64 {
    ttl::LOCK_LEASE_SECS
}

fn default_cache_ttl_secs() -> u64 {
    ttl::CACHE_SECS
}

fn default_workers() -> usize {
    4
}

fn default_reap_after_secs() -> u64 {
    24 * 3600
}

fn default_worker_name() -> String {
    "helm-broker".to_string()
}
