//! # Cache Handle
//!
//! [`Cache`] is the per-cache runtime object callers hold. It is a cheap,
//! cloneable handle over one engine and derives the bulk and convenience
//! operations from the engine's primitives, so every engine behaves the
//! same way for them.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use super::traits::{Capabilities, CacheStore};
use super::types::{CacheKey, CacheStats, CacheValue};
use crate::coordination::DistributedLock;
use crate::error::{CacheError, CacheResult};

/// Handle to one named cache
pub struct Cache<K: CacheKey, V: CacheValue> {
    store: Arc<dyn CacheStore<K, V>>,
}

impl<K: CacheKey, V: CacheValue> Clone for Cache<K, V> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<K: CacheKey, V: CacheValue> fmt::Debug for Cache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("name", &self.store.name())
            .field("capabilities", &self.store.capabilities())
            .field("closed", &self.store.is_closed())
            .finish()
    }
}

impl<K: CacheKey, V: CacheValue> Cache<K, V> {
    /// Wrap an engine. Engines are normally built through a
    /// [`CacheBuilder`](super::CacheBuilder).
    pub fn from_store(store: Arc<dyn CacheStore<K, V>>) -> Self {
        Self { store }
    }

    pub fn name(&self) -> &str {
        self.store.name()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.store.capabilities()
    }

    pub fn stats(&self) -> CacheStats {
        self.store.stats()
    }

    /// Value for `key`, loading it when a loader is configured.
    /// Loader failures propagate and are not cached.
    pub fn get(&self, key: &K) -> CacheResult<Option<V>> {
        self.store.get(key)
    }

    /// Value for `key` if present, never loading
    pub fn get_if_present(&self, key: &K) -> CacheResult<Option<V>> {
        self.store.get_if_present(key)
    }

    /// Value for `key`, falling back to `mapping` when neither the cache nor
    /// its loader produced one. A mapped value is stored unless another
    /// writer got there first, in which case the stored value wins.
    pub fn get_with<F>(&self, key: &K, mapping: F) -> CacheResult<Option<V>>
    where
        F: FnOnce(&K) -> anyhow::Result<Option<V>>,
    {
        if let Some(value) = self.store.get(key)? {
            return Ok(Some(value));
        }

        let computed = mapping(key).map_err(|e| CacheError::loader(self.name(), e))?;
        match computed {
            Some(value) => {
                let existing = self.store.put_if_absent(key.clone(), value.clone())?;
                Ok(Some(existing.unwrap_or(value)))
            }
            None => Ok(None),
        }
    }

    /// Values for the keys that resolved, through the cache or its loader.
    /// Unresolved keys are omitted. Each key is an independent lookup.
    pub fn get_all<I>(&self, keys: I) -> CacheResult<HashMap<K, V>>
    where
        I: IntoIterator<Item = K>,
    {
        let mut found = HashMap::new();
        for key in keys {
            if let Some(value) = self.store.get(&key)? {
                found.insert(key, value);
            }
        }
        Ok(found)
    }

    /// Unconditional upsert. Replacing a value emits REPLACED for the old one.
    pub fn put(&self, key: K, value: V) -> CacheResult<()> {
        self.store.insert(key, value).map(|_| ())
    }

    /// Independent per-key puts, stopping at the first failure
    pub fn put_all<I>(&self, entries: I) -> CacheResult<()>
    where
        I: IntoIterator<Item = (K, V)>,
    {
        for (key, value) in entries {
            self.store.insert(key, value)?;
        }
        Ok(())
    }

    /// Remove `key`, emitting EXPLICIT when it was present
    pub fn invalidate(&self, key: &K) -> CacheResult<()> {
        self.store.remove(key).map(|_| ())
    }

    pub fn invalidate_keys<I>(&self, keys: I) -> CacheResult<()>
    where
        I: IntoIterator<Item = K>,
    {
        for key in keys {
            self.store.remove(&key)?;
        }
        Ok(())
    }

    pub fn invalidate_all(&self) -> CacheResult<()> {
        self.store.invalidate_all()
    }

    /// Approximate entry count; not exact under concurrent mutation
    pub fn estimated_size(&self) -> CacheResult<u64> {
        self.store.estimated_size()
    }

    /// Snapshot iterator over the current entries
    pub fn iter(&self) -> CacheResult<std::vec::IntoIter<(K, V)>> {
        Ok(self.store.entries()?.into_iter())
    }

    /// Live, mutable map view. Lookups through the view consult the loader.
    pub fn as_map(&self) -> MapView<'_, K, V> {
        MapView { cache: self }
    }

    /// Reentrant advisory lock for `key`, cluster-wide on distributed engines.
    /// The cache itself never takes it.
    pub fn get_lock(&self, key: &K) -> CacheResult<DistributedLock> {
        self.store.lock(key)
    }

    pub fn clean_up(&self) -> CacheResult<()> {
        self.store.clean_up()
    }

    /// Release engine resources. Idempotent; later operations fail with
    /// [`CacheError::Closed`].
    pub fn close(&self) -> CacheResult<()> {
        debug!(cache = %self.name(), "Closing cache");
        self.store.close()
    }

    pub fn is_closed(&self) -> bool {
        self.store.is_closed()
    }
}

/// Map-style view over a [`Cache`]
pub struct MapView<'a, K: CacheKey, V: CacheValue> {
    cache: &'a Cache<K, V>,
}

impl<K: CacheKey, V: CacheValue> MapView<'_, K, V> {
    /// Lookup through the loader
    pub fn get(&self, key: &K) -> CacheResult<Option<V>> {
        self.cache.get(key)
    }

    pub fn contains_key(&self, key: &K) -> CacheResult<bool> {
        Ok(self.cache.get(key)?.is_some())
    }

    /// Upsert returning the previous value
    pub fn insert(&self, key: K, value: V) -> CacheResult<Option<V>> {
        self.cache.store.insert(key, value)
    }

    pub fn put_if_absent(&self, key: K, value: V) -> CacheResult<Option<V>> {
        self.cache.store.put_if_absent(key, value)
    }

    pub fn compute_if_absent<F>(&self, key: &K, mapping: F) -> CacheResult<Option<V>>
    where
        F: FnOnce(&K) -> anyhow::Result<Option<V>>,
    {
        self.cache.get_with(key, mapping)
    }

    pub fn remove(&self, key: &K) -> CacheResult<Option<V>> {
        self.cache.store.remove(key)
    }

    pub fn len(&self) -> CacheResult<u64> {
        self.cache.estimated_size()
    }

    pub fn is_empty(&self) -> CacheResult<bool> {
        Ok(self.len()? == 0)
    }

    pub fn clear(&self) -> CacheResult<()> {
        self.cache.invalidate_all()
    }

    pub fn entries(&self) -> CacheResult<Vec<(K, V)>> {
        self.cache.store.entries()
    }
}
