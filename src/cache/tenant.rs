//! # Tenant-Partitioned Cache
//!
//! One logical cache facade over one physical cache per tenant. Every
//! operation resolves the calling tenant, get-or-creates that tenant's child
//! and forwards the call unchanged, so tenants never observe each other's
//! entries.
//!
//! Children live in a bounded Moka index that expires idle tenants. The
//! index's eviction listener closes the evicted child; a failing close is
//! logged and never propagates. Closing the facade evicts the whole index.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error};

use super::handle::Cache;
use super::traits::{Capabilities, CacheStore};
use super::types::{CacheKey, CacheStats, CacheValue};
use crate::constants::TENANT_INDEX_CAPACITY;
use crate::coordination::DistributedLock;
use crate::error::{CacheError, CacheResult};
use crate::logging::log_isolated_error;
use crate::tenancy::TenantResolver;

type ChildFactory<K, V> = Arc<dyn Fn(&str) -> CacheResult<Cache<K, V>> + Send + Sync>;

pub struct TenantPartitionedCache<K: CacheKey, V: CacheValue> {
    name: String,
    capabilities: Capabilities,
    resolver: Arc<dyn TenantResolver>,
    index: moka::sync::Cache<String, Cache<K, V>>,
    factory: ChildFactory<K, V>,
    closed: AtomicBool,
}

impl<K: CacheKey, V: CacheValue> fmt::Debug for TenantPartitionedCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantPartitionedCache")
            .field("name", &self.name)
            .field("tenants", &self.index.entry_count())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

fn close_evicted_child<K: CacheKey, V: CacheValue>(
    tenant_id: &str,
    child: &Cache<K, V>,
    cause: moka::notification::RemovalCause,
) {
    debug!(
        cache = %child.name(),
        tenant_id = %tenant_id,
        cause = ?cause,
        "Evicting tenant cache"
    );
    match catch_unwind(AssertUnwindSafe(|| child.close())) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log_isolated_error(
            "tenant_index",
            "close_child",
            &e.to_string(),
            Some(child.name()),
        ),
        Err(_) => {
            error!(cache = %child.name(), tenant_id = %tenant_id, "Tenant cache close panicked")
        }
    }
}

impl<K: CacheKey, V: CacheValue> TenantPartitionedCache<K, V> {
    /// `factory` builds the child for a tenant id; `idle_timeout` is how long
    /// an untouched tenant keeps its child
    pub fn new<F>(
        name: &str,
        capabilities: Capabilities,
        resolver: Arc<dyn TenantResolver>,
        idle_timeout: Duration,
        factory: F,
    ) -> Self
    where
        F: Fn(&str) -> CacheResult<Cache<K, V>> + Send + Sync + 'static,
    {
        let index = moka::sync::Cache::builder()
            .name(name)
            .max_capacity(TENANT_INDEX_CAPACITY)
            .time_to_idle(idle_timeout)
            .eviction_listener(|tenant_id: Arc<String>, child: Cache<K, V>, cause| {
                close_evicted_child(&tenant_id, &child, cause);
            })
            .build();

        debug!(
            cache = %name,
            idle_timeout_secs = idle_timeout.as_secs(),
            "Tenant-partitioned cache created"
        );

        Self {
            name: name.to_string(),
            capabilities,
            resolver,
            index,
            factory: Arc::new(factory),
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

    /// Child cache of the calling tenant, created on first use
    pub fn current_partition(&self) -> CacheResult<Cache<K, V>> {
        self.ensure_open()?;
        let tenant_id = self.resolver.current_tenant();
        self.index
            .try_get_with(tenant_id.clone(), || {
                debug!(cache = %self.name, tenant_id = %tenant_id, "Creating tenant cache");
                (self.factory)(&tenant_id)
            })
            .map_err(|e| CacheError::clone(&e))
    }

    /// Tenants that currently hold a live child
    pub fn active_tenants(&self) -> Vec<String> {
        self.index.run_pending_tasks();
        let mut tenants: Vec<String> = self.index.iter().map(|(t, _)| (*t).clone()).collect();
        tenants.sort();
        tenants
    }

    /// Evict one tenant's child, closing it
    pub fn evict_tenant(&self, tenant_id: &str) {
        self.index.invalidate(tenant_id);
        self.index.run_pending_tasks();
    }
}

impl<K: CacheKey, V: CacheValue> CacheStore<K, V> for TenantPartitionedCache<K, V> {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn get(&self, key: &K) -> CacheResult<Option<V>> {
        self.current_partition()?.get(key)
    }

    fn get_if_present(&self, key: &K) -> CacheResult<Option<V>> {
        self.current_partition()?.get_if_present(key)
    }

    fn insert(&self, key: K, value: V) -> CacheResult<Option<V>> {
        self.current_partition()?.as_map().insert(key, value)
    }

    fn put_if_absent(&self, key: K, value: V) -> CacheResult<Option<V>> {
        self.current_partition()?.as_map().put_if_absent(key, value)
    }

    fn remove(&self, key: &K) -> CacheResult<Option<V>> {
        self.current_partition()?.as_map().remove(key)
    }

    fn invalidate_all(&self) -> CacheResult<()> {
        self.current_partition()?.invalidate_all()
    }

    fn estimated_size(&self) -> CacheResult<u64> {
        self.current_partition()?.estimated_size()
    }

    fn entries(&self) -> CacheResult<Vec<(K, V)>> {
        self.current_partition()?.as_map().entries()
    }

    fn lock(&self, key: &K) -> CacheResult<DistributedLock> {
        self.current_partition()?.get_lock(key)
    }

    fn clean_up(&self) -> CacheResult<()> {
        self.ensure_open()?;
        self.index.run_pending_tasks();
        self.current_partition()?.clean_up()
    }

    fn close(&self) -> CacheResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.index.invalidate_all();
        self.index.run_pending_tasks();
        debug!(cache = %self.name, "Tenant-partitioned cache closed");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Sum over the live tenant partitions
    fn stats(&self) -> CacheStats {
        self.index
            .iter()
            .map(|(_, child)| child.stats())
            .fold(CacheStats::default(), CacheStats::merge)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendKind;
    use crate::tenancy::{FixedTenant, ThreadTenantResolver};
    use std::sync::atomic::AtomicUsize;

    fn partitioned(
        resolver: Arc<dyn TenantResolver>,
        idle: Duration,
    ) -> TenantPartitionedCache<String, u32> {
        let backend = BackendKind::local();
        TenantPartitionedCache::new(
            "tenant-test",
            Capabilities::LOCAL,
            resolver,
            idle,
            move |tenant: &str| {
                backend
                    .builder::<String, u32>(format!("tenant-test@{tenant}"))
                    .build()
            },
        )
    }

    #[test]
    fn test_children_are_named_and_created_lazily() {
        let cache = partitioned(Arc::new(ThreadTenantResolver::default()), Duration::from_secs(60));
        assert!(cache.active_tenants().is_empty());

        ThreadTenantResolver::with_tenant("acme", || {
            assert_eq!(cache.current_partition().unwrap().name(), "tenant-test@acme");
        });
        assert_eq!(cache.active_tenants(), vec!["acme".to_string()]);
    }

    #[test]
    fn test_idle_tenant_is_evicted_and_closed() {
        let cache = partitioned(Arc::new(FixedTenant::new("acme")), Duration::from_millis(50));
        let child = cache.current_partition().unwrap();
        child.put("k".to_string(), 1).unwrap();

        std::thread::sleep(Duration::from_millis(120));
        cache.index.run_pending_tasks();

        assert!(child.is_closed());
        assert!(cache.active_tenants().is_empty());

        let fresh = cache.current_partition().unwrap();
        assert!(!fresh.is_closed());
        assert_eq!(fresh.get(&"k".to_string()).unwrap(), None);
    }

    #[test]
    fn test_factory_failure_surfaces_and_is_not_cached() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let seen = attempts.clone();
        let cache: TenantPartitionedCache<String, u32> = TenantPartitionedCache::new(
            "failing",
            Capabilities::LOCAL,
            Arc::new(FixedTenant::new("acme")),
            Duration::from_secs(60),
            move |_: &str| {
                seen.fetch_add(1, Ordering::SeqCst);
                Err(CacheError::backend_unavailable("store down"))
            },
        );

        assert!(cache.get(&"k".to_string()).unwrap_err().is_backend_unavailable());
        assert!(cache.get(&"k".to_string()).is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_closed_facade_rejects_operations() {
        let cache = partitioned(Arc::new(FixedTenant::new("acme")), Duration::from_secs(60));
        let child = cache.current_partition().unwrap();
        cache.close().unwrap();
        cache.close().unwrap();

        assert!(child.is_closed());
        assert!(matches!(
            cache.get(&"k".to_string()),
            Err(CacheError::Closed(_))
        ));
    }
}
