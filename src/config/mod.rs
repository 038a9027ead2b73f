//! # Cache Configuration
//!
//! Settings are a flat map of dotted keys. Three independent resolution
//! groups read from it, each producing the `(provider, config)` pair a
//! [`BackendKind`](crate::backend::BackendKind) is resolved from:
//!
//! - **Application**: `cache.provider` / `cache.config`
//! - **ORM second-level cache**: `cache.orm.*`, falling back to the application group
//! - **Access control**: `cache.access_control.*`, falling back to the application group
//!
//! A group without a resolvable provider is absent.
//!
//! ## Usage
//!
//! ```rust
//! use polycache::config::{CacheGroup, CacheSettings};
//!
//! let settings = CacheSettings::new()
//!     .with("cache.provider", "redis")
//!     .with("cache.config.url", "redis://127.0.0.1:6379");
//!
//! let info = settings.provider_info(CacheGroup::Orm).expect("falls back to application");
//! assert_eq!(info.provider(), "redis");
//! assert_eq!(info.config().get("url").map(String::as_str), Some("redis://127.0.0.1:6379"));
//! ```

pub mod error;
pub mod loader;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{self, settings_keys};

pub use error::{ConfigResult, ConfigurationError};

/// Key under which a scalar `<group>.config` value is exposed in the config map
pub const CONFIG_PATH_KEY: &str = "path";

/// One of the three cache resolution groups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheGroup {
    Application,
    Orm,
    AccessControl,
}

impl CacheGroup {
    fn provider_key(self) -> &'static str {
        match self {
            Self::Application => settings_keys::APP_PROVIDER,
            Self::Orm => settings_keys::ORM_PROVIDER,
            Self::AccessControl => settings_keys::ACCESS_CONTROL_PROVIDER,
        }
    }

    fn config_key(self) -> &'static str {
        match self {
            Self::Application => settings_keys::APP_CONFIG,
            Self::Orm => settings_keys::ORM_CONFIG,
            Self::AccessControl => settings_keys::ACCESS_CONTROL_CONFIG,
        }
    }
}

impl fmt::Display for CacheGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Application => write!(f, "application cache"),
            Self::Orm => write!(f, "ORM cache"),
            Self::AccessControl => write!(f, "access-control cache"),
        }
    }
}

/// Resolved provider name plus its prefix-stripped config map
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheProviderInfo {
    provider: String,
    config: BTreeMap<String, String>,
    config_prefix: String,
}

impl CacheProviderInfo {
    pub fn new<P: Into<String>>(provider: P) -> Self {
        Self {
            provider: provider.into(),
            config: BTreeMap::new(),
            config_prefix: String::new(),
        }
    }

    pub fn with_config<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn config(&self) -> &BTreeMap<String, String> {
        &self.config
    }

    /// Settings prefix the config map was read from (`cache.orm.config.`)
    pub fn config_prefix(&self) -> &str {
        &self.config_prefix
    }

    /// Scalar config value, if the group used the `<group>.config = "..."` form
    pub fn config_path(&self) -> Option<&str> {
        self.config.get(CONFIG_PATH_KEY).map(String::as_str)
    }
}

/// Timing used by distributed locks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    pub lease: Duration,
    pub retry_interval: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            lease: constants::DEFAULT_LOCK_LEASE,
            retry_interval: constants::DEFAULT_LOCK_RETRY_INTERVAL,
        }
    }
}

/// Flat settings map with typed accessors
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSettings {
    values: BTreeMap<String, String>,
}

impl CacheSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Builder-style insert
    pub fn with<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.set(key, value);
        self
    }

    pub fn set<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) -> &mut Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Parse a value, treating a missing key as `None`
    pub fn get_parsed<T>(&self, key: &str) -> ConfigResult<Option<T>>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|e| ConfigurationError::invalid_value(key, raw, e.to_string())),
        }
    }

    /// All entries under `prefix`, with the prefix removed from each key
    pub fn prefixed(&self, prefix: &str) -> BTreeMap<String, String> {
        self.values
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter_map(|(k, v)| {
                let stripped = &k[prefix.len()..];
                (!stripped.is_empty()).then(|| (stripped.to_string(), v.clone()))
            })
            .collect()
    }

    /// Resolve the provider and config map for a group, applying the
    /// specific-then-application override chain
    pub fn provider_info(&self, group: CacheGroup) -> Option<CacheProviderInfo> {
        let app = CacheGroup::Application;

        let provider = self
            .get(group.provider_key())
            .or_else(|| self.get(app.provider_key()))?
            .trim()
            .to_string();

        let (config, config_key) = match self.config_map(group.config_key()) {
            Some(map) => (map, group.config_key()),
            None if group != app => match self.config_map(app.config_key()) {
                Some(map) => (map, app.config_key()),
                None => (BTreeMap::new(), group.config_key()),
            },
            None => (BTreeMap::new(), group.config_key()),
        };

        Some(CacheProviderInfo {
            provider,
            config,
            config_prefix: format!("{config_key}."),
        })
    }

    fn config_map(&self, config_key: &str) -> Option<BTreeMap<String, String>> {
        let mut map = self.prefixed(&format!("{config_key}."));
        if let Some(scalar) = self.get(config_key) {
            map.insert(CONFIG_PATH_KEY.to_string(), scalar.to_string());
        }
        (!map.is_empty()).then_some(map)
    }

    /// Tenant index idle timeout, never below one day
    pub fn tenant_idle_timeout(&self) -> ConfigResult<Duration> {
        let configured = self
            .get_parsed::<u64>(settings_keys::TENANT_IDLE_TIMEOUT_SECS)?
            .map(Duration::from_secs)
            .unwrap_or(constants::MIN_TENANT_IDLE_TIMEOUT);
        Ok(configured.max(constants::MIN_TENANT_IDLE_TIMEOUT))
    }

    pub fn lock_options(&self) -> ConfigResult<LockOptions> {
        let defaults = LockOptions::default();
        let lease = self
            .get_parsed::<u64>(settings_keys::LOCK_LEASE_MS)?
            .map(Duration::from_millis)
            .unwrap_or(defaults.lease);
        let retry_interval = self
            .get_parsed::<u64>(settings_keys::LOCK_RETRY_INTERVAL_MS)?
            .map(Duration::from_millis)
            .unwrap_or(defaults.retry_interval);

        if lease.is_zero() {
            return Err(ConfigurationError::invalid_value(
                settings_keys::LOCK_LEASE_MS,
                "0",
                "lock lease must be positive",
            ));
        }

        if retry_interval.is_zero() {
            return Err(ConfigurationError::invalid_value(
                settings_keys::LOCK_RETRY_INTERVAL_MS,
                "0",
                "lock retry interval must be positive",
            ));
        }

        Ok(LockOptions {
            lease,
            retry_interval,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_application_group_configures_every_group() {
        let settings = CacheSettings::new()
            .with("cache.provider", "redis")
            .with("cache.config", "redis.yaml");

        for group in [
            CacheGroup::Application,
            CacheGroup::Orm,
            CacheGroup::AccessControl,
        ] {
            let info = settings.provider_info(group).expect("provider resolved");
            assert_eq!(info.provider(), "redis");
            assert_eq!(info.config_path(), Some("redis.yaml"));
        }
    }

    #[test]
    fn test_specific_group_does_not_leak_to_others() {
        let settings = CacheSettings::new()
            .with("cache.orm.provider", "redis")
            .with("cache.orm.config", "redis-orm.yaml");

        assert!(settings.provider_info(CacheGroup::Application).is_none());
        assert!(settings.provider_info(CacheGroup::AccessControl).is_none());

        let orm = settings.provider_info(CacheGroup::Orm).unwrap();
        assert_eq!(orm.provider(), "redis");
        assert_eq!(orm.config_path(), Some("redis-orm.yaml"));
    }

    #[test]
    fn test_specific_config_overrides_application_config() {
        let settings = CacheSettings::new()
            .with("cache.provider", "redis")
            .with("cache.config", "redis.yaml")
            .with("cache.orm.config", "redis-orm.yaml")
            .with("cache.access_control.config", "redis-acl.yaml");

        let app = settings.provider_info(CacheGroup::Application).unwrap();
        assert_eq!(app.config_path(), Some("redis.yaml"));

        let orm = settings.provider_info(CacheGroup::Orm).unwrap();
        assert_eq!(orm.provider(), "redis");
        assert_eq!(orm.config_path(), Some("redis-orm.yaml"));

        let acl = settings.provider_info(CacheGroup::AccessControl).unwrap();
        assert_eq!(acl.provider(), "redis");
        assert_eq!(acl.config_path(), Some("redis-acl.yaml"));
    }

    #[test]
    fn test_provider_without_config_has_empty_map() {
        let settings = CacheSettings::new().with("cache.provider", "redis");
        let info = settings.provider_info(CacheGroup::Application).unwrap();
        assert!(info.config().is_empty());
        assert!(info.config_path().is_none());
    }

    #[test]
    fn test_config_without_provider_is_absent() {
        let settings = CacheSettings::new().with("cache.config", "config.yaml");
        assert!(settings.provider_info(CacheGroup::Application).is_none());
    }

    #[test]
    fn test_nested_config_is_prefix_stripped() {
        let settings = CacheSettings::new()
            .with("cache.provider", "redis")
            .with("cache.config.url", "redis://localhost:6379")
            .with("cache.config.database", "2")
            .with("cache.configured", "not part of the map");

        let info = settings.provider_info(CacheGroup::Application).unwrap();
        assert_eq!(info.config_prefix(), "cache.config.");
        assert_eq!(info.config().len(), 2);
        assert_eq!(info.config()["url"], "redis://localhost:6379");
        assert_eq!(info.config()["database"], "2");
    }

    #[test]
    fn test_blank_provider_is_treated_as_missing() {
        let settings = CacheSettings::new().with("cache.provider", "  ");
        assert!(settings.provider_info(CacheGroup::Application).is_none());
    }

    #[test]
    fn test_tenant_idle_timeout_has_one_day_floor() {
        let short = CacheSettings::new().with("cache.tenant.idle_timeout_secs", "60");
        assert_eq!(
            short.tenant_idle_timeout().unwrap(),
            constants::MIN_TENANT_IDLE_TIMEOUT
        );

        let long = CacheSettings::new().with("cache.tenant.idle_timeout_secs", "172800");
        assert_eq!(
            long.tenant_idle_timeout().unwrap(),
            Duration::from_secs(172_800)
        );

        let invalid = CacheSettings::new().with("cache.tenant.idle_timeout_secs", "soon");
        assert!(matches!(
            invalid.tenant_idle_timeout(),
            Err(ConfigurationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_lock_options() {
        assert_eq!(
            CacheSettings::new().lock_options().unwrap(),
            LockOptions::default()
        );

        let custom = CacheSettings::new()
            .with("cache.lock.lease_ms", "5000")
            .with("cache.lock.retry_interval_ms", "2");
        let options = custom.lock_options().unwrap();
        assert_eq!(options.lease, Duration::from_secs(5));
        assert_eq!(options.retry_interval, Duration::from_millis(2));

        let zero = CacheSettings::new().with("cache.lock.lease_ms", "0");
        assert!(zero.lock_options().is_err());
    }

    #[test]
    fn test_zero_retry_interval_is_rejected() {
        let settings = CacheSettings::new().with("cache.lock.retry_interval_ms", "0");
        let err = settings.lock_options().unwrap_err();
        assert!(err.to_string().contains("cache.lock.retry_interval_ms"));
    }
}
