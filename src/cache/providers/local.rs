//! In-process engine using Moka.
//!
//! Moka supplies size-bounded eviction, write and access TTL, per-key load
//! coalescing (`try_get_with`) and removal notifications, so this engine is
//! mostly a translation layer. State is NOT shared between processes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use moka::sync::Cache as MokaCache;
use tracing::debug;

use crate::cache::builder::BuilderConfig;
use crate::cache::providers::encode_key;
use crate::cache::traits::{Capabilities, CacheStore};
use crate::cache::types::{CacheKey, CacheStats, CacheValue, Loader, Notifier, StatsCounter};
use crate::coordination::{CallSite, DistributedCoordinator, DistributedLock};
use crate::error::{CacheError, CacheResult};

/// Why a coalesced load produced no value
#[derive(Debug)]
enum LoadMiss {
    Absent,
    Failed(CacheError),
}

pub struct LocalCacheStore<K: CacheKey, V: CacheValue> {
    name: String,
    cache: MokaCache<K, V>,
    loader: Option<Loader<K, V>>,
    coordinator: DistributedCoordinator,
    lock_site: CallSite,
    stats: Arc<StatsCounter>,
    closed: AtomicBool,
}

impl<K: CacheKey, V: CacheValue> LocalCacheStore<K, V> {
    pub(crate) fn build(
        config: &BuilderConfig<K, V>,
        loader: Option<Loader<K, V>>,
        coordinator: DistributedCoordinator,
    ) -> Self {
        let stats = Arc::new(StatsCounter::default());
        let notifier = Arc::new(Notifier::new(
            config.name(),
            config.removal_listener(),
            Arc::clone(&stats),
        ));

        let mut builder = MokaCache::builder().name(config.name());
        if let Some(max) = config.maximum_size() {
            builder = builder.max_capacity(max);
        }
        if let Some(ttl) = config.expire_after_write() {
            builder = builder.time_to_live(ttl);
        }
        if let Some(tti) = config.expire_after_access() {
            builder = builder.time_to_idle(tti);
        }
        let cache = builder
            .eviction_listener(move |key: Arc<K>, value: V, cause| {
                notifier.notify(&key, &value, cause.into());
            })
            .build();

        debug!(
            cache = %config.name(),
            max_capacity = ?config.maximum_size(),
            ttl = ?config.expire_after_write(),
            tti = ?config.expire_after_access(),
            loader = loader.is_some(),
            "Local cache created"
        );

        Self {
            name: config.name().to_string(),
            lock_site: CallSite::for_cache(config.name()),
            cache,
            loader,
            coordinator,
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

    fn lookup(&self, key: &K) -> Option<V> {
        let found = self.cache.get(key);
        if found.is_some() {
            self.stats.record_hit();
        } else {
            self.stats.record_miss();
        }
        found
    }
}

impl<K: CacheKey, V: CacheValue> CacheStore<K, V> for LocalCacheStore<K, V> {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::LOCAL
    }

    fn get(&self, key: &K) -> CacheResult<Option<V>> {
        self.ensure_open()?;
        if let Some(value) = self.lookup(key) {
            return Ok(Some(value));
        }
        let Some(loader) = &self.loader else {
            return Ok(None);
        };

        let loaded = self.cache.try_get_with(key.clone(), || {
            let outcome = loader(key);
            self.stats.record_load(outcome.is_ok());
            match outcome {
                Ok(Some(value)) => Ok(value),
                Ok(None) => Err(LoadMiss::Absent),
                Err(e) => Err(LoadMiss::Failed(CacheError::loader(&self.name, e))),
            }
        });

        match loaded {
            Ok(value) => Ok(Some(value)),
            Err(miss) => match miss.as_ref() {
                LoadMiss::Absent => Ok(None),
                LoadMiss::Failed(e) => Err(e.clone()),
            },
        }
    }

    fn get_if_present(&self, key: &K) -> CacheResult<Option<V>> {
        self.ensure_open()?;
        Ok(self.lookup(key))
    }

    fn insert(&self, key: K, value: V) -> CacheResult<Option<V>> {
        self.ensure_open()?;
        let previous = self.cache.get(&key);
        self.cache.insert(key, value);
        Ok(previous)
    }

    fn put_if_absent(&self, key: K, value: V) -> CacheResult<Option<V>> {
        self.ensure_open()?;
        let entry = self.cache.entry(key).or_insert_with(|| value);
        if entry.is_fresh() {
            Ok(None)
        } else {
            Ok(Some(entry.into_value()))
        }
    }

    fn remove(&self, key: &K) -> CacheResult<Option<V>> {
        self.ensure_open()?;
        Ok(self.cache.remove(key))
    }

    fn invalidate_all(&self) -> CacheResult<()> {
        self.ensure_open()?;
        self.cache.invalidate_all();
        self.cache.run_pending_tasks();
        Ok(())
    }

    fn estimated_size(&self) -> CacheResult<u64> {
        self.ensure_open()?;
        self.cache.run_pending_tasks();
        Ok(self.cache.entry_count())
    }

    fn entries(&self) -> CacheResult<Vec<(K, V)>> {
        self.ensure_open()?;
        Ok(self
            .cache
            .iter()
            .map(|(key, value)| (K::clone(&key), value))
            .collect())
    }

    fn lock(&self, key: &K) -> CacheResult<DistributedLock> {
        self.ensure_open()?;
        Ok(self.coordinator.get_lock(&self.lock_site, &encode_key(key)?))
    }

    fn clean_up(&self) -> CacheResult<()> {
        self.ensure_open()?;
        self.cache.run_pending_tasks();
        Ok(())
    }

    fn close(&self) -> CacheResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.cache.invalidate_all();
        self.cache.run_pending_tasks();
        debug!(cache = %self.name, "Local cache closed");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }
}
