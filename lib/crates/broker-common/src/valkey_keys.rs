/// Valkey key prefixes for broker state
pub mod keys {
    /// Cached instance document
    /// Format: helmbroker:instance:{instance_id}
    /// Value: JSON-serialized ServiceInstance
    pub const INSTANCE: &str = "helmbroker:instance";

    /// Cached binding document
    /// Format: helmbroker:binding:{instance_id}
    /// Value: JSON-serialized Binding
    pub const BINDING: &str = "helmbroker:binding";

    /// Cached hook result of the last stage
    /// Format: helmbroker:hooks:{instance_id}
    /// Value: JSON-serialized HookResult
    pub const HOOKS: &str = "helmbroker:hooks";

    /// Cached addon catalog
    /// Value: JSON-serialized Catalog
    pub const ADDONS: &str = "helmbroker:addons";

    /// Per-instance lock
    /// Format: helmbroker:lock:{instance_id}
    /// Value: holder token
    /// TTL: lock lease, renewed while held
    pub const LOCK: &str = "helmbroker:lock";

    /// Task queue for install/upgrade/bind/unbind (list, LPUSH, popped from the right)
    pub const QUEUE_HIGH: &str = "helmbroker:queue:high";

    /// Task queue for uninstall (list, LPUSH, popped from the right)
    pub const QUEUE_LOW: &str = "helmbroker:queue:low";

    /// Tasks a consumer has taken but not yet acknowledged
    /// Format: helmbroker:queue:processing:{consumer}
    /// Value: list of JSON-serialized TaskMessage
    pub const PROCESSING: &str = "helmbroker:queue:processing";
}

/// TTL defaults
pub mod ttl {
    /// Cached document freshness window (1 hour)
    pub const CACHE_SECS: u64 = 3600;

    /// Lock lease (30 seconds, renewed every third of the lease)
    pub const LOCK_LEASE_SECS: u64 = 30;
}

pub fn instance_key(instance_id: &str) -> String {
    format!("{}:{}", keys::INSTANCE, instance_id)
}

pub fn binding_key(instance_id: &str) -> String {
    format!("{}:{}", keys::BINDING, instance_id)
}

pub fn hooks_key(instance_id: &str) -> String {
    format!("{}:{}", keys::HOOKS, instance_id)
}

pub fn lock_key(instance_id: &str) -> String {
    format!("{}:{}", keys::LOCK, instance_id)
}

pub fn processing_key(consumer: &str) -> String {
    format!("{}:{}", keys::PROCESSING, consumer)
}

/// Maximum length of an instance id.
pub const MAX_INSTANCE_ID_LEN: usize = 128;

/// Validate an externally issued instance id.
///
/// Instance ids become directory names and Valkey key suffixes, so only
/// `[A-Za-z0-9._-]` is accepted and `.`/`..` are rejected.
/// SECURITY: call before deriving paths or keys from untrusted input.
pub fn validate_instance_id(instance_id: &str) -> Result<(), &'static str> {
    if instance_id.is_empty() {
        return Err("instance id must not be empty");
    }
    if instance_id.len() > MAX_INSTANCE_ID_LEN {
        return Err("instance id must be at most 128 characters");
    }
    if instance_id == "." || instance_id == ".." {
        return Err("instance id must not be a relative path component");
    }
    if !instance_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err("instance id may only contain [A-Za-z0-9._-]");
    }
    Ok(())
}
