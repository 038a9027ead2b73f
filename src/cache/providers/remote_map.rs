//! Distributed engine over a plain shared hash.
//!
//! Each cache is one hash in the [`RemoteStore`]; fields are JSON-encoded keys
//! and values are JSON envelopes carrying write and access timestamps. Expiry
//! and size bounding are enforced by the client: an expired envelope is
//! removed with a compare-and-delete the first time any instance sees it, so
//! exactly one instance emits EXPIRED for it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{decode_key, encode_key};
use crate::cache::builder::BuilderConfig;
use crate::cache::single_flight::SingleFlight;
use crate::cache::traits::{Capabilities, CacheStore};
use crate::cache::types::{
    CacheKey, CacheStats, CacheValue, Loader, Notifier, RemovalCause, StatsCounter,
};
use crate::coordination::{CallSite, DistributedCoordinator, DistributedLock};
use crate::error::{CacheError, CacheResult};
use crate::store::RemoteStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope<V> {
    value: V,
    written_at: i64,
    accessed_at: i64,
}

impl<V> Envelope<V> {
    fn fresh(value: V, now: i64) -> Self {
        Self {
            value,
            written_at: now,
            accessed_at: now,
        }
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn as_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

pub struct RemoteMapStore<K: CacheKey, V: CacheValue> {
    name: String,
    store: Arc<dyn RemoteStore>,
    expire_after_write: Option<i64>,
    expire_after_access: Option<i64>,
    maximum_size: Option<u64>,
    loader: Option<Loader<K, V>>,
    notifier: Notifier<K, V>,
    flights: SingleFlight<K, Option<V>>,
    coordinator: DistributedCoordinator,
    lock_site: CallSite,
    stats: Arc<StatsCounter>,
    closed: AtomicBool,
}

impl<K: CacheKey, V: CacheValue> RemoteMapStore<K, V> {
    pub(crate) fn build(
        config: &BuilderConfig<K, V>,
        loader: Option<Loader<K, V>>,
        store: Arc<dyn RemoteStore>,
        coordinator: DistributedCoordinator,
    ) -> Self {
        let stats = Arc::new(StatsCounter::default());

        debug!(
            cache = %config.name(),
            store = %store.driver_name(),
            max_size = ?config.maximum_size(),
            ttl = ?config.expire_after_write(),
            tti = ?config.expire_after_access(),
            loader = loader.is_some(),
            "Remote map cache created"
        );

        Self {
            name: config.name().to_string(),
            store,
            expire_after_write: config.expire_after_write().map(as_millis),
            expire_after_access: config.expire_after_access().map(as_millis),
            maximum_size: config.maximum_size(),
            loader,
            notifier: Notifier::new(
                config.name(),
                config.removal_listener(),
                Arc::clone(&stats),
            ),
            flights: SingleFlight::new(),
            coordinator,
            lock_site: CallSite::for_cache(config.name()),
            stats,
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> CacheResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(CacheError::Closed(self.name.clone()))
        } else {
            Ok(())
        }
    }

    fn tracks_access(&self) -> bool {
        self.expire_after_access.is_some() || self.maximum_size.is_some()
    }

    fn is_expired(&self, envelope: &Envelope<V>, now: i64) -> bool {
        let written_out = self
            .expire_after_write
            .is_some_and(|ttl| now.saturating_sub(envelope.written_at) >= ttl);
        let idle_out = self
            .expire_after_access
            .is_some_and(|tti| now.saturating_sub(envelope.accessed_at) >= tti);
        written_out || idle_out
    }

    fn decode(raw: &str) -> CacheResult<Envelope<V>> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Remove an expired envelope unless another writer already changed it
    fn expire(&self, key: &K, field: &str, raw: &str, value: &V) -> CacheResult<()> {
        if self.store.map_remove_if(&self.name, field, raw)? {
            self.notifier.notify(key, value, RemovalCause::Expired);
        }
        Ok(())
    }

    fn read(&self, key: &K, field: &str) -> CacheResult<Option<V>> {
        let Some(raw) = self.store.map_get(&self.name, field)? else {
            return Ok(None);
        };
        let envelope = Self::decode(&raw)?;
        let now = now_millis();

        if self.is_expired(&envelope, now) {
            self.expire(key, field, &raw, &envelope.value)?;
            return Ok(None);
        }

        if self.tracks_access() {
            let touched = Envelope {
                accessed_at: now,
                ..envelope.clone()
            };
            // A lost race means someone else rewrote the entry, which is fresher anyway
            self.store
                .map_replace_if(&self.name, field, &raw, &serde_json::to_string(&touched)?)?;
        }

        Ok(Some(envelope.value))
    }

    fn lookup(&self, key: &K, field: &str) -> CacheResult<Option<V>> {
        let found = self.read(key, field)?;
        if found.is_some() {
            self.stats.record_hit();
        } else {
            self.stats.record_miss();
        }
        Ok(found)
    }

    /// Drop expired entries, then the least recently accessed ones, until the
    /// hash fits `maximum_size`
    fn enforce_capacity(&self) -> CacheResult<()> {
        let Some(max) = self.maximum_size else {
            return Ok(());
        };
        if self.store.map_len(&self.name)? <= max {
            return Ok(());
        }

        let now = now_millis();
        let mut live = Vec::new();
        for (field, raw) in self.store.map_entries(&self.name)? {
            let envelope = Self::decode(&raw)?;
            let key: K = decode_key(&field)?;
            if self.is_expired(&envelope, now) {
                self.expire(&key, &field, &raw, &envelope.value)?;
            } else {
                live.push((envelope.accessed_at, key, field, raw, envelope.value));
            }
        }

        let excess = live.len().saturating_sub(usize::try_from(max).unwrap_or(usize::MAX));
        if excess == 0 {
            return Ok(());
        }

        live.sort_by_key(|(accessed_at, ..)| *accessed_at);
        for (_, key, field, raw, value) in live.into_iter().take(excess) {
            if self.store.map_remove_if(&self.name, &field, &raw)? {
                self.notifier.notify(&key, &value, RemovalCause::Size);
            }
        }
        Ok(())
    }
}

impl<K: CacheKey, V: CacheValue> CacheStore<K, V> for RemoteMapStore<K, V> {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::DISTRIBUTED_GENERIC
    }

    fn get(&self, key: &K) -> CacheResult<Option<V>> {
        self.ensure_open()?;
        let field = encode_key(key)?;
        if let Some(value) = self.lookup(key, &field)? {
            return Ok(Some(value));
        }
        let Some(loader) = &self.loader else {
            return Ok(None);
        };

        self.flights.run(key, || {
            // Another instance may have stored it while this one waited
            if let Some(value) = self.read(key, &field)? {
                return Ok(Some(value));
            }

            let outcome = loader(key);
            self.stats.record_load(outcome.is_ok());
            match outcome.map_err(|e| CacheError::loader(&self.name, e))? {
                Some(value) => {
                    let existing = self.put_if_absent(key.clone(), value.clone())?;
                    Ok(Some(existing.unwrap_or(value)))
                }
                None => Ok(None),
            }
        })
    }

    fn get_if_present(&self, key: &K) -> CacheResult<Option<V>> {
        self.ensure_open()?;
        self.lookup(key, &encode_key(key)?)
    }

    fn insert(&self, key: K, value: V) -> CacheResult<Option<V>> {
        self.ensure_open()?;
        let field = encode_key(&key)?;
        let now = now_millis();
        let raw = serde_json::to_string(&Envelope::fresh(value, now))?;

        let previous = match self.store.map_put(&self.name, &field, &raw, None)? {
            Some(old_raw) => {
                let old = Self::decode(&old_raw)?;
                if self.is_expired(&old, now) {
                    self.notifier.notify(&key, &old.value, RemovalCause::Expired);
                    None
                } else {
                    self.notifier.notify(&key, &old.value, RemovalCause::Replaced);
                    Some(old.value)
                }
            }
            None => None,
        };

        self.enforce_capacity()?;
        Ok(previous)
    }

    fn put_if_absent(&self, key: K, value: V) -> CacheResult<Option<V>> {
        self.ensure_open()?;
        let field = encode_key(&key)?;
        let raw = serde_json::to_string(&Envelope::fresh(value, now_millis()))?;

        loop {
            let Some(existing_raw) =
                self.store
                    .map_put_if_absent(&self.name, &field, &raw, None)?
            else {
                self.enforce_capacity()?;
                return Ok(None);
            };

            let existing = Self::decode(&existing_raw)?;
            if !self.is_expired(&existing, now_millis()) {
                return Ok(Some(existing.value));
            }
            if self
                .store
                .map_replace_if(&self.name, &field, &existing_raw, &raw)?
            {
                self.notifier
                    .notify(&key, &existing.value, RemovalCause::Expired);
                return Ok(None);
            }
            // Lost to a concurrent writer; look again
        }
    }

    fn remove(&self, key: &K) -> CacheResult<Option<V>> {
        self.ensure_open()?;
        let field = encode_key(key)?;
        let Some(raw) = self.store.map_remove(&self.name, &field)? else {
            return Ok(None);
        };

        let envelope = Self::decode(&raw)?;
        if self.is_expired(&envelope, now_millis()) {
            self.notifier
                .notify(key, &envelope.value, RemovalCause::Expired);
            Ok(None)
        } else {
            self.notifier
                .notify(key, &envelope.value, RemovalCause::Explicit);
            Ok(Some(envelope.value))
        }
    }

    fn invalidate_all(&self) -> CacheResult<()> {
        self.ensure_open()?;
        let now = now_millis();
        for (field, raw) in self.store.map_entries(&self.name)? {
            if !self.store.map_remove_if(&self.name, &field, &raw)? {
                continue;
            }
            let envelope = Self::decode(&raw)?;
            let key: K = decode_key(&field)?;
            let cause = if self.is_expired(&envelope, now) {
                RemovalCause::Expired
            } else {
                RemovalCause::Explicit
            };
            self.notifier.notify(&key, &envelope.value, cause);
        }
        Ok(())
    }

    fn estimated_size(&self) -> CacheResult<u64> {
        self.ensure_open()?;
        self.store.map_len(&self.name)
    }

    fn entries(&self) -> CacheResult<Vec<(K, V)>> {
        self.ensure_open()?;
        let now = now_millis();
        let mut live = Vec::new();
        for (field, raw) in self.store.map_entries(&self.name)? {
            let envelope = Self::decode(&raw)?;
            if !self.is_expired(&envelope, now) {
                live.push((decode_key(&field)?, envelope.value));
            }
        }
        Ok(live)
    }

    fn lock(&self, key: &K) -> CacheResult<DistributedLock> {
        self.ensure_open()?;
        Ok(self.coordinator.get_lock(&self.lock_site, &encode_key(key)?))
    }

    fn clean_up(&self) -> CacheResult<()> {
        self.ensure_open()?;
        let now = now_millis();
        for (field, raw) in self.store.map_entries(&self.name)? {
            let envelope = Self::decode(&raw)?;
            if self.is_expired(&envelope, now) {
                let key: K = decode_key(&field)?;
                self.expire(&key, &field, &raw, &envelope.value)?;
            }
        }
        Ok(())
    }

    fn close(&self) -> CacheResult<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(cache = %self.name, "Remote map cache closed; shared entries kept");
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }
}
