//! # Backend Registry
//!
//! The closed set of cache engines. A [`BackendKind`] is resolved once from a
//! [`CacheProviderInfo`] and then handed out by value: it builds caches,
//! carries the [`DistributedCoordinator`] for its store and reports whether
//! it is distributed.
//!
//! Provider names are matched case-insensitively after normalizing `-`,
//! `.` and spaces to `_`, so `Redis-Native`, `redis_native` and
//! `REDIS NATIVE` all select the native engine.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cache::providers::{LocalCacheStore, RemoteMapStore, RemoteNativeStore};
use crate::cache::{BuilderConfig, Cache, CacheBuilder, CacheKey, CacheValue, Capabilities, Loader};
use crate::config::{CacheProviderInfo, ConfigurationError, LockOptions};
use crate::coordination::DistributedCoordinator;
use crate::error::CacheResult;
use crate::logging::log_cache_operation;
use crate::store::{self, RemoteStore};

/// Provider config key holding the remote store URL
pub const STORE_URL_KEY: &str = "url";

/// Engine selector, as named in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Local,
    DistributedGeneric,
    DistributedNative,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::DistributedGeneric => "distributed_generic",
            Self::DistributedNative => "distributed_native",
        }
    }

    pub fn is_distributed(self) -> bool {
        !matches!(self, Self::Local)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lowercase and fold `-`, `.` and whitespace into `_`
fn normalize_provider_name(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| match c {
            '-' | '.' => '_',
            c if c.is_whitespace() => '_',
            c => c.to_ascii_lowercase(),
        })
        .collect()
}

impl FromStr for ProviderKind {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_provider_name(s).as_str() {
            "local" | "memory" | "in_memory" | "caffeine" | "moka" => Ok(Self::Local),
            "distributed" | "distributed_generic" | "redis" | "redisson" | "valkey" => {
                Ok(Self::DistributedGeneric)
            }
            "distributed_native" | "redis_native" | "redisson_native" | "native" => {
                Ok(Self::DistributedNative)
            }
            _ => Err(ConfigurationError::unknown_provider("cache", s)),
        }
    }
}

/// A resolved engine together with its store and coordinator
#[derive(Clone)]
pub enum BackendKind {
    Local {
        coordinator: DistributedCoordinator,
    },
    DistributedGeneric {
        store: Arc<dyn RemoteStore>,
        coordinator: DistributedCoordinator,
    },
    DistributedNative {
        store: Arc<dyn RemoteStore>,
        coordinator: DistributedCoordinator,
    },
}

impl fmt::Debug for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("BackendKind");
        s.field("kind", &self.kind());
        if let Some(store) = self.store() {
            s.field("store", &store.driver_name());
        }
        s.finish()
    }
}

impl BackendKind {
    /// In-process engine with a process-local coordinator
    pub fn local() -> Self {
        Self::Local {
            coordinator: DistributedCoordinator::local(),
        }
    }

    pub fn distributed_generic(store: Arc<dyn RemoteStore>) -> Self {
        Self::distributed_generic_with(store, LockOptions::default())
    }

    pub fn distributed_generic_with(store: Arc<dyn RemoteStore>, options: LockOptions) -> Self {
        let coordinator = DistributedCoordinator::remote(Arc::clone(&store), options);
        Self::DistributedGeneric { store, coordinator }
    }

    /// Fails when the store cannot expire individual hash fields
    pub fn distributed_native(store: Arc<dyn RemoteStore>) -> CacheResult<Self> {
        Self::distributed_native_with(store, LockOptions::default())
    }

    pub fn distributed_native_with(
        store: Arc<dyn RemoteStore>,
        options: LockOptions,
    ) -> CacheResult<Self> {
        if !store.supports_field_expiration() {
            return Err(ConfigurationError::unsupported(
                "*",
                ProviderKind::DistributedNative.as_str(),
                format!(
                    "the {} store cannot expire individual hash fields",
                    store.driver_name()
                ),
            )
            .into());
        }
        let coordinator = DistributedCoordinator::remote(Arc::clone(&store), options);
        Ok(Self::DistributedNative { store, coordinator })
    }

    /// Resolve the engine a provider entry names, opening its store
    pub fn resolve(info: &CacheProviderInfo, options: LockOptions) -> CacheResult<Self> {
        let kind: ProviderKind = info.provider().parse()?;

        let backend = match kind {
            ProviderKind::Local => Self::local(),
            ProviderKind::DistributedGeneric | ProviderKind::DistributedNative => {
                let url = info.config().get(STORE_URL_KEY).ok_or_else(|| {
                    ConfigurationError::missing_required_field(
                        format!("{}{}", info.config_prefix(), STORE_URL_KEY),
                        format!("provider '{}'", info.provider()),
                    )
                })?;
                let store = store::open(url)?;
                if kind == ProviderKind::DistributedNative {
                    Self::distributed_native_with(store, options)?
                } else {
                    Self::distributed_generic_with(store, options)
                }
            }
        };

        info!(
            provider = %info.provider(),
            backend = %backend.name(),
            distributed = backend.is_distributed(),
            "Cache backend resolved"
        );
        Ok(backend)
    }

    pub fn kind(&self) -> ProviderKind {
        match self {
            Self::Local { .. } => ProviderKind::Local,
            Self::DistributedGeneric { .. } => ProviderKind::DistributedGeneric,
            Self::DistributedNative { .. } => ProviderKind::DistributedNative,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind().as_str()
    }

    /// Drives lock elision in [`DistributedCoordinator::get_lock_if_distributed`]
    pub fn is_distributed(&self) -> bool {
        self.kind().is_distributed()
    }

    pub fn coordinator(&self) -> &DistributedCoordinator {
        match self {
            Self::Local { coordinator }
            | Self::DistributedGeneric { coordinator, .. }
            | Self::DistributedNative { coordinator, .. } => coordinator,
        }
    }

    pub fn store(&self) -> Option<&Arc<dyn RemoteStore>> {
        match self {
            Self::Local { .. } => None,
            Self::DistributedGeneric { store, .. } | Self::DistributedNative { store, .. } => {
                Some(store)
            }
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        match self {
            Self::Local { .. } => Capabilities::LOCAL,
            Self::DistributedGeneric { .. } => Capabilities::DISTRIBUTED_GENERIC,
            Self::DistributedNative { store, .. } => {
                Capabilities::distributed_native(store.supports_expiry_notifications())
            }
        }
    }

    /// Builder for a cache called `name` on this engine
    pub fn builder<K: CacheKey, V: CacheValue>(&self, name: impl Into<String>) -> CacheBuilder<K, V> {
        CacheBuilder::new(name, self.clone())
    }

    /// Construct one cache; `config` has already been validated
    pub(crate) fn build_cache<K: CacheKey, V: CacheValue>(
        &self,
        config: &BuilderConfig<K, V>,
        loader: Option<Loader<K, V>>,
    ) -> CacheResult<Cache<K, V>> {
        let cache = match self {
            Self::Local { coordinator } => Cache::from_store(Arc::new(LocalCacheStore::build(
                config,
                loader,
                coordinator.clone(),
            ))),
            Self::DistributedGeneric { store, coordinator } => {
                Cache::from_store(Arc::new(RemoteMapStore::build(
                    config,
                    loader,
                    Arc::clone(store),
                    coordinator.clone(),
                )))
            }
            Self::DistributedNative { store, coordinator } => {
                Cache::from_store(Arc::new(RemoteNativeStore::build(
                    config,
                    loader,
                    Arc::clone(store),
                    coordinator.clone(),
                )))
            }
        };
        log_cache_operation("build", config.name(), self.name(), None);
        Ok(cache)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use proptest::prelude::*;

    #[test]
    fn test_aliases_resolve_to_kinds() {
        for name in ["local", "memory", "in_memory", "caffeine", "moka"] {
            assert_eq!(name.parse::<ProviderKind>().unwrap(), ProviderKind::Local);
        }
        for name in ["distributed", "redis", "redisson", "valkey"] {
            assert_eq!(
                name.parse::<ProviderKind>().unwrap(),
                ProviderKind::DistributedGeneric
            );
        }
        for name in ["distributed_native", "redis_native", "redisson_native", "native"] {
            assert_eq!(
                name.parse::<ProviderKind>().unwrap(),
                ProviderKind::DistributedNative
            );
        }
    }

    #[test]
    fn test_unknown_provider_is_configuration_error() {
        let err = "hazelcast".parse::<ProviderKind>().unwrap_err();
        assert!(matches!(err, ConfigurationError::UnknownProvider { .. }));
    }

    #[test]
    fn test_resolve_local_needs_no_url() {
        let backend =
            BackendKind::resolve(&CacheProviderInfo::new("Caffeine"), LockOptions::default())
                .unwrap();
        assert_eq!(backend.kind(), ProviderKind::Local);
        assert!(!backend.is_distributed());
        assert!(backend.store().is_none());
    }

    #[test]
    fn test_resolve_distributed_requires_url() {
        let err = BackendKind::resolve(&CacheProviderInfo::new("redis"), LockOptions::default())
            .unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("url"));
    }

    #[test]
    fn test_resolve_distributed_over_memory_url() {
        let info = CacheProviderInfo::new("Redis-Native").with_config("url", "memory://backend-resolve");
        let backend = BackendKind::resolve(&info, LockOptions::default()).unwrap();
        assert_eq!(backend.kind(), ProviderKind::DistributedNative);
        assert!(backend.is_distributed());
        assert!(backend.coordinator().is_distributed());
        assert!(backend.capabilities().expiry_notifications);
    }

    #[test]
    fn test_unknown_store_scheme_is_rejected() {
        let info = CacheProviderInfo::new("redis").with_config("url", "zookeeper://host");
        assert!(BackendKind::resolve(&info, LockOptions::default())
            .unwrap_err()
            .is_configuration());
    }

    #[test]
    fn test_capabilities_per_kind() {
        let store: Arc<dyn RemoteStore> = Arc::new(MemoryStore::new());
        assert!(BackendKind::local().capabilities().access_expiry);
        assert!(BackendKind::distributed_generic(Arc::clone(&store))
            .capabilities()
            .max_size);
        let native = BackendKind::distributed_native(store).unwrap();
        assert!(!native.capabilities().max_size);
        assert!(native.capabilities().native_field_expiry);
    }

    proptest! {
        #[test]
        fn prop_case_and_separators_do_not_matter(
            upper in proptest::collection::vec(any::<bool>(), 18),
            sep in prop::sample::select(vec!['_', '-', '.', ' ']),
        ) {
            let name: String = "redis_native"
                .chars()
                .zip(upper.iter().cycle())
                .map(|(c, up)| match c {
                    '_' => sep,
                    c if *up => c.to_ascii_uppercase(),
                    c => c,
                })
                .collect();
            prop_assert_eq!(name.parse::<ProviderKind>().unwrap(), ProviderKind::DistributedNative);
        }

        #[test]
        fn prop_unknown_names_never_resolve(name in "[a-z]{1,12}") {
            let known = [
                "local", "memory", "caffeine", "moka", "distributed", "redis",
                "redisson", "valkey", "native",
            ];
            prop_assume!(!known.contains(&name.as_str()));
            prop_assert!(name.parse::<ProviderKind>().is_err());
        }
    }
}
