//! # Cache Context
//!
//! Dependency-injection root of the cache layer. A [`CacheContext`] holds the
//! resolved [`BackendKind`], the tenant resolver and the tenant index idle
//! timeout, and hands out builders wired with all three. Hosts build one at
//! startup, optionally [`install`](CacheContext::install) it as the
//! process-wide instance, and pass it (or [`CacheContext::global`]) to the
//! code that creates caches.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tracing::info;

use crate::backend::BackendKind;
use crate::cache::{CacheBuilder, CacheKey, CacheValue};
use crate::config::{CacheGroup, CacheProviderInfo, CacheSettings};
use crate::constants::MIN_TENANT_IDLE_TIMEOUT;
use crate::coordination::DistributedCoordinator;
use crate::error::{CacheError, CacheResult};
use crate::logging::log_cache_operation;
use crate::tenancy::{SingleTenant, TenantResolver};

static GLOBAL_CONTEXT: OnceLock<CacheContext> = OnceLock::new();

#[derive(Debug, Clone)]
pub struct CacheContext {
    backend: BackendKind,
    local: BackendKind,
    provider_info: CacheProviderInfo,
    tenant_resolver: Arc<dyn TenantResolver>,
    tenant_idle_timeout: Duration,
}

impl CacheContext {
    /// Context over an already-resolved backend
    pub fn new(backend: BackendKind) -> Self {
        let provider_info = CacheProviderInfo::new(backend.name());
        let local = match &backend {
            BackendKind::Local { .. } => backend.clone(),
            _ => BackendKind::local(),
        };
        Self {
            backend,
            local,
            provider_info,
            tenant_resolver: Arc::new(SingleTenant),
            tenant_idle_timeout: MIN_TENANT_IDLE_TIMEOUT,
        }
    }

    /// Resolve `group` from `settings`. Without a provider the local engine
    /// is used.
    pub fn from_settings(settings: &CacheSettings, group: CacheGroup) -> CacheResult<Self> {
        let lock_options = settings.lock_options()?;
        let tenant_idle_timeout = settings.tenant_idle_timeout()?;

        let mut context = match settings.provider_info(group) {
            Some(provider_info) => {
                let backend = BackendKind::resolve(&provider_info, lock_options)?;
                let mut context = Self::new(backend);
                context.provider_info = provider_info;
                context
            }
            None => {
                info!(group = %group, "No cache provider configured; using local engine");
                Self::new(BackendKind::local())
            }
        };
        context.tenant_idle_timeout = tenant_idle_timeout;

        log_cache_operation(
            "resolve",
            &group.to_string(),
            context.backend.name(),
            Some(context.provider_info.provider()),
        );
        Ok(context)
    }

    pub fn with_tenant_resolver(mut self, resolver: Arc<dyn TenantResolver>) -> Self {
        self.tenant_resolver = resolver;
        self
    }

    /// Idle timeout of the tenant index, floored at one day
    pub fn with_tenant_idle_timeout(mut self, timeout: Duration) -> Self {
        self.tenant_idle_timeout = timeout.max(MIN_TENANT_IDLE_TIMEOUT);
        self
    }

    /// Builder on the configured backend
    pub fn builder<K: CacheKey, V: CacheValue>(&self, name: impl Into<String>) -> CacheBuilder<K, V> {
        self.backend
            .builder(name)
            .with_tenancy(Arc::clone(&self.tenant_resolver), self.tenant_idle_timeout)
    }

    /// Builder on the local engine whatever the configured backend, for state
    /// that must never leave the process
    pub fn in_memory_builder<K: CacheKey, V: CacheValue>(
        &self,
        name: impl Into<String>,
    ) -> CacheBuilder<K, V> {
        self.local
            .builder(name)
            .with_tenancy(Arc::clone(&self.tenant_resolver), self.tenant_idle_timeout)
    }

    pub fn backend(&self) -> &BackendKind {
        &self.backend
    }

    pub fn coordinator(&self) -> &DistributedCoordinator {
        self.backend.coordinator()
    }

    pub fn provider_info(&self) -> &CacheProviderInfo {
        &self.provider_info
    }

    pub fn tenant_resolver(&self) -> &Arc<dyn TenantResolver> {
        &self.tenant_resolver
    }

    pub fn tenant_idle_timeout(&self) -> Duration {
        self.tenant_idle_timeout
    }

    pub fn is_distributed(&self) -> bool {
        self.backend.is_distributed()
    }

    /// Ping the remote store; always healthy on the local engine
    pub fn health_check(&self) -> CacheResult<()> {
        match self.backend.store() {
            Some(store) => store.ping(),
            None => Ok(()),
        }
    }

    /// Make this the process-wide context. Only the first call wins.
    pub fn install(self) -> CacheResult<&'static CacheContext> {
        let backend = self.backend.name();
        GLOBAL_CONTEXT.set(self).map_err(|_| {
            CacheError::configuration("a process-wide cache context is already installed")
        })?;
        log_cache_operation("install", "*", backend, None);
        GLOBAL_CONTEXT
            .get()
            .ok_or_else(|| CacheError::Internal("cache context vanished after install".into()))
    }

    pub fn global() -> Option<&'static CacheContext> {
        GLOBAL_CONTEXT.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ProviderKind;
    use crate::tenancy::FixedTenant;

    #[test]
    fn test_missing_provider_falls_back_to_local() {
        let context =
            CacheContext::from_settings(&CacheSettings::new(), CacheGroup::Application).unwrap();
        assert_eq!(context.backend().kind(), ProviderKind::Local);
        assert!(context.health_check().is_ok());
    }

    #[test]
    fn test_provider_info_is_exposed() {
        let settings = CacheSettings::new()
            .with("cache.provider", "redis")
            .with("cache.config.url", "memory://context-info");
        let context = CacheContext::from_settings(&settings, CacheGroup::Orm).unwrap();
        assert_eq!(context.provider_info().provider(), "redis");
        assert_eq!(
            context.provider_info().config().get("url").map(String::as_str),
            Some("memory://context-info")
        );
        assert!(context.is_distributed());
    }

    #[test]
    fn test_in_memory_builder_ignores_distributed_provider() {
        let settings = CacheSettings::new()
            .with("cache.provider", "distributed")
            .with("cache.config.url", "memory://context-in-memory");
        let context = CacheContext::from_settings(&settings, CacheGroup::Application).unwrap();

        let cache = context
            .in_memory_builder::<String, u32>("context::sockets")
            .build()
            .unwrap();
        assert!(!cache.capabilities().distributed);

        let shared = context.builder::<String, u32>("context::shared").build().unwrap();
        assert!(shared.capabilities().distributed);
    }

    #[test]
    fn test_tenant_idle_timeout_is_floored() {
        let context = CacheContext::new(BackendKind::local())
            .with_tenant_idle_timeout(Duration::from_secs(60));
        assert_eq!(context.tenant_idle_timeout(), MIN_TENANT_IDLE_TIMEOUT);
    }

    #[test]
    fn test_tenant_aware_builder_partitions() {
        let context = CacheContext::new(BackendKind::local())
            .with_tenant_resolver(Arc::new(FixedTenant::new("acme")));
        let cache = context
            .builder::<String, u32>("context::tenant")
            .tenant_aware()
            .build()
            .unwrap();
        assert_eq!(cache.name(), "context::tenant");
        cache.put("k".to_string(), 1).unwrap();
        assert_eq!(cache.get(&"k".to_string()).unwrap(), Some(1));
    }

    #[test]
    fn test_unknown_provider_fails_resolution() {
        let settings = CacheSettings::new().with("cache.provider", "ehcache");
        let err = CacheContext::from_settings(&settings, CacheGroup::Application).unwrap_err();
        assert!(err.is_configuration());
    }
}
