//! Shared document, task and key types for helm-broker.

pub mod params;
pub mod types;
pub mod valkey_keys;

pub use params::{Parameters, RAW_VALUES_KEY};
pub use types::*;
pub use valkey_keys::{
    binding_key, hooks_key, instance_key, keys, lock_key, processing_key, ttl,
    validate_instance_id,
};
