//! The primitive set every cache engine implements.
//!
//! Engines implement [`CacheStore`]; everything callers use on top of it
//! (bulk operations, mapping lookups, iteration, the map view) lives once in
//! [`Cache`](super::Cache).

use serde::{Deserialize, Serialize};

use super::types::{CacheKey, CacheStats, CacheValue};
use crate::coordination::DistributedLock;
use crate::error::CacheResult;

/// What an engine can honor. Builders reject configurations that ask for a
/// capability the selected engine lacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// State is shared by every process using the same backend
    pub distributed: bool,
    /// `expire_after_access` is supported
    pub access_expiry: bool,
    /// `maximum_size` is supported
    pub max_size: bool,
    /// EXPIRED notifications are delivered for entries the engine reaps
    pub expiry_notifications: bool,
    /// Weak keys/values are honored. No engine does; the builder flags are hints.
    pub weak_references: bool,
    /// Write expiry is enforced by the remote server per field
    pub native_field_expiry: bool,
}

impl Capabilities {
    pub const LOCAL: Capabilities = Capabilities {
        distributed: false,
        access_expiry: true,
        max_size: true,
        expiry_notifications: true,
        weak_references: false,
        native_field_expiry: false,
    };

    pub const DISTRIBUTED_GENERIC: Capabilities = Capabilities {
        distributed: true,
        access_expiry: true,
        max_size: true,
        expiry_notifications: true,
        weak_references: false,
        native_field_expiry: false,
    };

    pub const fn distributed_native(expiry_notifications: bool) -> Capabilities {
        Capabilities {
            distributed: true,
            access_expiry: false,
            max_size: false,
            expiry_notifications,
            weak_references: false,
            native_field_expiry: true,
        }
    }
}

/// Backend primitive set
pub trait CacheStore<K: CacheKey, V: CacheValue>: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    /// Look up `key`, invoking the configured loader on a miss. Concurrent
    /// misses on one key share a single loader call and its outcome.
    fn get(&self, key: &K) -> CacheResult<Option<V>>;

    /// Look up `key` without consulting the loader
    fn get_if_present(&self, key: &K) -> CacheResult<Option<V>>;

    /// Upsert, returning the value it replaced
    fn insert(&self, key: K, value: V) -> CacheResult<Option<V>>;

    /// Store only if absent; returns the existing value when there was one
    fn put_if_absent(&self, key: K, value: V) -> CacheResult<Option<V>>;

    /// Remove `key`, returning the value it held
    fn remove(&self, key: &K) -> CacheResult<Option<V>>;

    fn invalidate_all(&self) -> CacheResult<()>;

    /// Approximate entry count
    fn estimated_size(&self) -> CacheResult<u64>;

    /// Snapshot of the live entries
    fn entries(&self) -> CacheResult<Vec<(K, V)>>;

    /// Advisory lock scoped to this cache and `key`
    fn lock(&self, key: &K) -> CacheResult<DistributedLock>;

    /// Best-effort synchronous expiry sweep
    fn clean_up(&self) -> CacheResult<()> {
        Ok(())
    }

    /// Release engine resources. Idempotent.
    fn close(&self) -> CacheResult<()> {
        Ok(())
    }

    fn is_closed(&self) -> bool {
        false
    }

    fn stats(&self) -> CacheStats;
}
