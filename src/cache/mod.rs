//! # Cache Abstraction
//!
//! A backend-independent cache handle with three interchangeable engines:
//!
//! - **Local**: in-process Moka cache
//! - **Distributed generic**: shared hash with client-side expiry and size
//!   bounding
//! - **Distributed native**: shared hash with server-side per-field expiry
//!
//! Callers build caches through [`CacheBuilder`] and only ever see
//! [`Cache`]; tenant-aware caches transparently become a
//! [`TenantPartitionedCache`] when multi-tenancy is active.

pub mod builder;
pub mod handle;
pub mod providers;
pub(crate) mod single_flight;
pub mod tenant;
pub mod traits;
pub mod types;

pub use builder::{BuilderConfig, CacheBuilder};
pub use handle::{Cache, MapView};
pub use tenant::TenantPartitionedCache;
pub use traits::{CacheStore, Capabilities};
pub use types::{
    CacheKey, CacheStats, CacheValue, Loader, RemovalCause, RemovalListener, RemovalNotification,
};
