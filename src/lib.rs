#![allow(clippy::doc_markdown)] // Allow technical terms like HPEXPIRE, Moka in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Polycache
//!
//! A backend-independent caching layer with pluggable local and distributed
//! engines, cluster-aware locks and counters, and per-tenant partitioning.
//!
//! ## Overview
//!
//! Application code builds named caches through a [`CacheContext`] and only
//! ever holds a [`Cache`] handle. Which engine stores the entries is decided
//! once at startup from configuration:
//!
//! - **local**: in-process Moka cache
//! - **distributed_generic**: shared hash in a remote store, with expiry and
//!   size bounding enforced by the clients
//! - **distributed_native**: shared hash whose fields expire on the server
//!
//! ## Module Organization
//!
//! - [`cache`] - Cache handle, builder, engines and tenant partitioning
//! - [`backend`] - Engine registry and provider name resolution
//! - [`coordination`] - Distributed locks and atomic counters
//! - [`store`] - Remote store drivers (in-memory, redis)
//! - [`config`] - Settings, provider resolution groups and loading
//! - [`context`] - Dependency-injection root
//! - [`tenancy`] - Tenant resolvers
//! - [`error`] - Structured error handling
//! - [`logging`] - Structured logging setup
//!
//! ## Quick Start
//!
//! ```rust
//! use std::time::Duration;
//! use polycache::config::{CacheGroup, CacheSettings};
//! use polycache::CacheContext;
//!
//! # fn main() -> polycache::CacheResult<()> {
//! let settings = CacheSettings::new()
//!     .with("cache.provider", "distributed")
//!     .with("cache.config.url", "memory://quick-start");
//! let context = CacheContext::from_settings(&settings, CacheGroup::Application)?;
//!
//! let users = context
//!     .builder::<u64, String>("app::users::by_id")
//!     .expire_after_write(Duration::from_secs(300))
//!     .build_with_loader(|id: &u64| Ok(Some(format!("user-{id}"))))?;
//!
//! assert_eq!(users.get(&7)?, Some("user-7".to_string()));
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod cache;
pub mod config;
pub mod constants;
pub mod context;
pub mod coordination;
pub mod error;
pub mod logging;
pub mod store;
pub mod tenancy;
pub mod test_utils;

pub use backend::{BackendKind, ProviderKind};
pub use cache::{
    Cache, CacheBuilder, CacheStats, Capabilities, MapView, RemovalCause, RemovalNotification,
    TenantPartitionedCache,
};
pub use config::{CacheGroup, CacheProviderInfo, CacheSettings, ConfigurationError};
pub use context::CacheContext;
pub use coordination::{AtomicCounter, CallSite, DistributedCoordinator, DistributedLock};
pub use error::{CacheError, CacheResult};
pub use logging::init_structured_logging;
pub use tenancy::{FixedTenant, SingleTenant, TenantResolver, ThreadTenantResolver};
