//! # Cache Builder
//!
//! Fluent configuration that ends in [`CacheBuilder::build`] or
//! [`CacheBuilder::build_with_loader`]. The terminal call validates the
//! configuration against the selected backend's [`Capabilities`] and hands
//! it to the backend-specific factory.
//!
//! ```rust
//! use std::time::Duration;
//! use polycache::backend::BackendKind;
//!
//! let cache = BackendKind::local()
//!     .builder::<String, u64>("polycache::docs::lengths")
//!     .maximum_size(1_000)
//!     .expire_after_write(Duration::from_secs(60))
//!     .build_with_loader(|key: &String| Ok(Some(key.len() as u64)))
//!     .unwrap();
//!
//! assert_eq!(cache.get(&"hello".to_string()).unwrap(), Some(5));
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use super::handle::Cache;
use super::tenant::TenantPartitionedCache;
use super::traits::Capabilities;
use super::types::{CacheKey, CacheValue, Loader, RemovalCause, RemovalListener};
use crate::backend::BackendKind;
use crate::config::ConfigurationError;
use crate::constants::{MIN_TENANT_IDLE_TIMEOUT, TENANT_NAME_SEPARATOR};
use crate::error::CacheResult;
use crate::tenancy::{SingleTenant, TenantResolver};

/// Everything a backend needs to construct one cache
pub struct BuilderConfig<K, V> {
    name: String,
    maximum_size: Option<u64>,
    expire_after_write: Option<Duration>,
    expire_after_access: Option<Duration>,
    weak_keys: bool,
    weak_values: bool,
    tenant_aware: bool,
    removal_listener: Option<RemovalListener<K, V>>,
}

impl<K, V> Clone for BuilderConfig<K, V> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            maximum_size: self.maximum_size,
            expire_after_write: self.expire_after_write,
            expire_after_access: self.expire_after_access,
            weak_keys: self.weak_keys,
            weak_values: self.weak_values,
            tenant_aware: self.tenant_aware,
            removal_listener: self.removal_listener.clone(),
        }
    }
}

impl<K, V> fmt::Debug for BuilderConfig<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuilderConfig")
            .field("name", &self.name)
            .field("maximum_size", &self.maximum_size)
            .field("expire_after_write", &self.expire_after_write)
            .field("expire_after_access", &self.expire_after_access)
            .field("weak_keys", &self.weak_keys)
            .field("weak_values", &self.weak_values)
            .field("tenant_aware", &self.tenant_aware)
            .field("removal_listener", &self.removal_listener.is_some())
            .finish()
    }
}

impl<K, V> BuilderConfig<K, V> {
    fn new(name: String) -> Self {
        Self {
            name,
            maximum_size: None,
            expire_after_write: None,
            expire_after_access: None,
            weak_keys: false,
            weak_values: false,
            tenant_aware: false,
            removal_listener: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn maximum_size(&self) -> Option<u64> {
        self.maximum_size
    }

    pub fn expire_after_write(&self) -> Option<Duration> {
        self.expire_after_write
    }

    pub fn expire_after_access(&self) -> Option<Duration> {
        self.expire_after_access
    }

    pub fn weak_keys(&self) -> bool {
        self.weak_keys
    }

    pub fn weak_values(&self) -> bool {
        self.weak_values
    }

    pub fn is_tenant_aware(&self) -> bool {
        self.tenant_aware
    }

    pub fn removal_listener(&self) -> Option<RemovalListener<K, V>> {
        self.removal_listener.clone()
    }

    /// Same configuration under the per-tenant name `base@tenant`
    pub(crate) fn for_tenant(&self, tenant_id: &str) -> Self {
        let mut config = self.clone();
        config.name = format!("{}{}{}", self.name, TENANT_NAME_SEPARATOR, tenant_id);
        config.tenant_aware = false;
        config
    }

    /// Reject settings the engine cannot honor
    pub(crate) fn validate(
        &self,
        backend: &str,
        capabilities: Capabilities,
    ) -> Result<(), ConfigurationError> {
        if self.name.trim().is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "name",
                "cache builder",
            ));
        }
        if self.maximum_size == Some(0) {
            return Err(ConfigurationError::invalid_value(
                "maximum_size",
                "0",
                format!("cache '{}' needs a positive maximum size", self.name),
            ));
        }
        for (field, duration) in [
            ("expire_after_write", self.expire_after_write),
            ("expire_after_access", self.expire_after_access),
        ] {
            if duration.is_some_and(|d| d.is_zero()) {
                return Err(ConfigurationError::invalid_value(
                    field,
                    "0s",
                    format!("cache '{}' needs a positive duration", self.name),
                ));
            }
        }

        if self.expire_after_access.is_some() && !capabilities.access_expiry {
            return Err(ConfigurationError::unsupported(
                &self.name,
                backend,
                "access-based expiry is not supported; use expire_after_write",
            ));
        }
        if self.maximum_size.is_some() && !capabilities.max_size {
            return Err(ConfigurationError::unsupported(
                &self.name,
                backend,
                "maximum size is not supported",
            ));
        }

        if (self.weak_keys || self.weak_values) && !capabilities.weak_references {
            warn!(
                cache = %self.name,
                backend = %backend,
                weak_keys = self.weak_keys,
                weak_values = self.weak_values,
                "Weak references requested but not honored; entries are held strongly"
            );
        }
        Ok(())
    }
}

/// Fluent builder for one named cache
pub struct CacheBuilder<K: CacheKey, V: CacheValue> {
    backend: BackendKind,
    config: BuilderConfig<K, V>,
    tenant_resolver: Arc<dyn TenantResolver>,
    tenant_idle_timeout: Duration,
}

impl<K: CacheKey, V: CacheValue> fmt::Debug for CacheBuilder<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheBuilder")
            .field("backend", &self.backend.name())
            .field("config", &self.config)
            .field("tenant_resolver", &self.tenant_resolver)
            .finish()
    }
}

impl<K: CacheKey, V: CacheValue> CacheBuilder<K, V> {
    /// Builder for a cache called `name` on `backend`. Names must be unique
    /// process-wide; use the module path plus a suffix.
    pub fn new<S: Into<String>>(name: S, backend: BackendKind) -> Self {
        Self {
            backend,
            config: BuilderConfig::new(name.into()),
            tenant_resolver: Arc::new(SingleTenant),
            tenant_idle_timeout: MIN_TENANT_IDLE_TIMEOUT,
        }
    }

    pub(crate) fn with_tenancy(
        mut self,
        resolver: Arc<dyn TenantResolver>,
        idle_timeout: Duration,
    ) -> Self {
        self.tenant_resolver = resolver;
        self.tenant_idle_timeout = idle_timeout;
        self
    }

    pub fn maximum_size(mut self, size: u64) -> Self {
        self.config.maximum_size = Some(size);
        self
    }

    pub fn expire_after_write(mut self, duration: Duration) -> Self {
        self.config.expire_after_write = Some(duration);
        self
    }

    pub fn expire_after_access(mut self, duration: Duration) -> Self {
        self.config.expire_after_access = Some(duration);
        self
    }

    /// Hint only; no engine holds keys weakly
    pub fn weak_keys(mut self) -> Self {
        self.config.weak_keys = true;
        self
    }

    /// Hint only; no engine holds values weakly
    pub fn weak_values(mut self) -> Self {
        self.config.weak_values = true;
        self
    }

    /// Partition by tenant when multi-tenancy is active
    pub fn tenant_aware(mut self) -> Self {
        self.config.tenant_aware = true;
        self
    }

    pub fn removal_listener<F>(mut self, listener: F) -> Self
    where
        F: Fn(&K, &V, RemovalCause) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.config.removal_listener = Some(Arc::new(listener));
        self
    }

    pub fn config(&self) -> &BuilderConfig<K, V> {
        &self.config
    }

    pub fn build(self) -> CacheResult<Cache<K, V>> {
        self.build_inner(None)
    }

    /// Build with a loader consulted on every miss
    pub fn build_with_loader<F>(self, loader: F) -> CacheResult<Cache<K, V>>
    where
        F: Fn(&K) -> anyhow::Result<Option<V>> + Send + Sync + 'static,
    {
        self.build_inner(Some(Arc::new(loader)))
    }

    fn build_inner(self, loader: Option<Loader<K, V>>) -> CacheResult<Cache<K, V>> {
        self.config
            .validate(self.backend.name(), self.backend.capabilities())?;

        if !(self.config.tenant_aware && self.tenant_resolver.is_multi_tenant()) {
            return self.backend.build_cache(&self.config, loader);
        }

        let backend = self.backend.clone();
        let config = self.config.clone();
        let factory = move |tenant_id: &str| {
            backend.build_cache(&config.for_tenant(tenant_id), loader.clone())
        };

        let partitioned = TenantPartitionedCache::new(
            self.config.name(),
            self.backend.capabilities(),
            self.tenant_resolver,
            self.tenant_idle_timeout,
            factory,
        );
        Ok(Cache::from_store(Arc::new(partitioned)))
    }
}
