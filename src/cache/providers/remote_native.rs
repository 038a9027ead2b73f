//! Distributed engine using server-side per-field expiration.
//!
//! Values are written with the cache's write TTL attached to the hash field,
//! so the server reaps them without client involvement. The engine cannot
//! bound size or expire on access; builders reject those settings. EXPIRED
//! notifications arrive only through drivers that expose an expiry hook.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::{decode_key, decode_value, encode_key, encode_value};
use crate::cache::builder::BuilderConfig;
use crate::cache::single_flight::SingleFlight;
use crate::cache::traits::{Capabilities, CacheStore};
use crate::cache::types::{
    CacheKey, CacheStats, CacheValue, Loader, Notifier, RemovalCause, StatsCounter,
};
use crate::coordination::{CallSite, DistributedCoordinator, DistributedLock};
use crate::error::{CacheError, CacheResult};
use crate::store::{RemoteStore, SubscriptionId};

pub struct RemoteNativeStore<K: CacheKey, V: CacheValue> {
    name: String,
    store: Arc<dyn RemoteStore>,
    ttl: Option<Duration>,
    loader: Option<Loader<K, V>>,
    notifier: Arc<Notifier<K, V>>,
    flights: SingleFlight<K, Option<V>>,
    coordinator: DistributedCoordinator,
    lock_site: CallSite,
    stats: Arc<StatsCounter>,
    subscription: Option<SubscriptionId>,
    closed: AtomicBool,
}

impl<K: CacheKey, V: CacheValue> RemoteNativeStore<K, V> {
    pub(crate) fn build(
        config: &BuilderConfig<K, V>,
        loader: Option<Loader<K, V>>,
        store: Arc<dyn RemoteStore>,
        coordinator: DistributedCoordinator,
    ) -> Self {
        let stats = Arc::new(StatsCounter::default());
        let notifier = Arc::new(Notifier::new(
            config.name(),
            config.removal_listener(),
            Arc::clone(&stats),
        ));

        let subscription = {
            let notifier = Arc::clone(&notifier);
            let cache = config.name().to_string();
            store.subscribe_expired(
                config.name(),
                Arc::new(move |field: &str, raw: &str| {
                    match (decode_key::<K>(field), decode_value::<V>(raw)) {
                        (Ok(key), Ok(value)) => {
                            notifier.notify(&key, &value, RemovalCause::Expired)
                        }
                        _ => warn!(cache = %cache, field = %field, "Undecodable expired entry"),
                    }
                }),
            )
        };

        debug!(
            cache = %config.name(),
            store = %store.driver_name(),
            ttl = ?config.expire_after_write(),
            expiry_notifications = subscription.is_some(),
            loader = loader.is_some(),
            "Remote native cache created"
        );

        Self {
            name: config.name().to_string(),
            store,
            ttl: config.expire_after_write(),
            loader,
            notifier,
            flights: SingleFlight::new(),
            coordinator,
            lock_site: CallSite::for_cache(config.name()),
            stats,
            subscription,
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

    fn read(&self, field: &str) -> CacheResult<Option<V>> {
        self.store
            .map_get(&self.name, field)?
            .map(|raw| decode_value(&raw))
            .transpose()
    }

    fn lookup(&self, field: &str) -> CacheResult<Option<V>> {
        let found = self.read(field)?;
        if found.is_some() {
            self.stats.record_hit();
        } else {
            self.stats.record_miss();
        }
        Ok(found)
    }
}

impl<K: CacheKey, V: CacheValue> CacheStore<K, V> for RemoteNativeStore<K, V> {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::distributed_native(self.subscription.is_some())
    }

    fn get(&self, key: &K) -> CacheResult<Option<V>> {
        self.ensure_open()?;
        let field = encode_key(key)?;
        if let Some(value) = self.lookup(&field)? {
            return Ok(Some(value));
        }
        let Some(loader) = &self.loader else {
            return Ok(None);
        };

        self.flights.run(key, || {
            if let Some(value) = self.read(&field)? {
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
        self.lookup(&encode_key(key)?)
    }

    fn insert(&self, key: K, value: V) -> CacheResult<Option<V>> {
        self.ensure_open()?;
        let field = encode_key(&key)?;
        let previous = self
            .store
            .map_put(&self.name, &field, &encode_value(&value)?, self.ttl)?
            .map(|raw| decode_value::<V>(&raw))
            .transpose()?;

        if let Some(old) = &previous {
            self.notifier.notify(&key, old, RemovalCause::Replaced);
        }
        Ok(previous)
    }

    fn put_if_absent(&self, key: K, value: V) -> CacheResult<Option<V>> {
        self.ensure_open()?;
        let field = encode_key(&key)?;
        self.store
            .map_put_if_absent(&self.name, &field, &encode_value(&value)?, self.ttl)?
            .map(|raw| decode_value(&raw))
            .transpose()
    }

    fn remove(&self, key: &K) -> CacheResult<Option<V>> {
        self.ensure_open()?;
        let removed = self
            .store
            .map_remove(&self.name, &encode_key(key)?)?
            .map(|raw| decode_value::<V>(&raw))
            .transpose()?;

        if let Some(value) = &removed {
            self.notifier.notify(key, value, RemovalCause::Explicit);
        }
        Ok(removed)
    }

    fn invalidate_all(&self) -> CacheResult<()> {
        self.ensure_open()?;
        for (field, raw) in self.store.map_entries(&self.name)? {
            if self.store.map_remove_if(&self.name, &field, &raw)? {
                let key: K = decode_key(&field)?;
                let value: V = decode_value(&raw)?;
                self.notifier.notify(&key, &value, RemovalCause::Explicit);
            }
        }
        Ok(())
    }

    fn estimated_size(&self) -> CacheResult<u64> {
        self.ensure_open()?;
        self.store.map_len(&self.name)
    }

    fn entries(&self) -> CacheResult<Vec<(K, V)>> {
        self.ensure_open()?;
        self.store
            .map_entries(&self.name)?
            .into_iter()
            .map(|(field, raw)| Ok((decode_key(&field)?, decode_value(&raw)?)))
            .collect()
    }

    fn lock(&self, key: &K) -> CacheResult<DistributedLock> {
        self.ensure_open()?;
        Ok(self.coordinator.get_lock(&self.lock_site, &encode_key(key)?))
    }

    fn clean_up(&self) -> CacheResult<()> {
        self.ensure_open()?;
        let reaped = self.store.purge_expired()?;
        debug!(cache = %self.name, reaped = reaped, "Native expiry sweep");
        Ok(())
    }

    fn close(&self) -> CacheResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(id) = self.subscription {
            self.store.unsubscribe(id);
        }
        debug!(cache = %self.name, "Remote native cache closed; shared entries kept");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }
}

impl<K: CacheKey, V: CacheValue> Drop for RemoteNativeStore<K, V> {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            if let Some(id) = self.subscription {
                self.store.unsubscribe(id);
            }
        }
    }
}
