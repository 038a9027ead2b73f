//! # System Constants
//!
//! Defaults shared by the builder, the coordinator and the tenant index.

use std::time::Duration;

/// Tenant id reported when multi-tenancy is inactive
pub const DEFAULT_TENANT_ID: &str = "default";

/// Floor for the tenant index idle timeout (one day)
pub const MIN_TENANT_IDLE_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Upper bound of live per-tenant caches held by one tenant index
pub const TENANT_INDEX_CAPACITY: u64 = 10_000;

/// Lease applied to distributed locks so a crashed holder cannot block forever
pub const DEFAULT_LOCK_LEASE: Duration = Duration::from_secs(30);

/// Pause between remote lock acquisition attempts
pub const DEFAULT_LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Separator between a call-site namespace and the requested name
pub const NAMESPACE_SEPARATOR: char = ':';

/// Separator between a tenant-aware cache's base name and the tenant id
pub const TENANT_NAME_SEPARATOR: char = '@';

/// Key prefixes used inside a remote store
pub mod store_keys {
    pub const LOCK_PREFIX: &str = "polycache:lock:";
    pub const COUNTER_PREFIX: &str = "polycache:counter:";
    pub const MAP_PREFIX: &str = "polycache:map:";
}

/// Settings keys, all relative to the root of `CacheSettings`
pub mod settings_keys {
    pub const APP_PROVIDER: &str = "cache.provider";
    pub const APP_CONFIG: &str = "cache.config";
    pub const ORM_PROVIDER: &str = "cache.orm.provider";
    pub const ORM_CONFIG: &str = "cache.orm.config";
    pub const ACCESS_CONTROL_PROVIDER: &str = "cache.access_control.provider";
    pub const ACCESS_CONTROL_CONFIG: &str = "cache.access_control.config";
    pub const TENANT_IDLE_TIMEOUT_SECS: &str = "cache.tenant.idle_timeout_secs";
    pub const LOCK_LEASE_MS: &str = "cache.lock.lease_ms";
    pub const LOCK_RETRY_INTERVAL_MS: &str = "cache.lock.retry_interval_ms";
}

/// Prefix for environment variable overrides (`POLYCACHE__CACHE__PROVIDER`)
pub const ENV_PREFIX: &str = "POLYCACHE";
