//! Cache engines behind [`BackendKind`](crate::backend::BackendKind).
//!
//! - **Local**: Moka, in-process only
//! - **Remote map**: entries in a shared hash with client-side write/access
//!   expiry and size bounding
//! - **Remote native**: entries in a shared hash whose fields expire on the
//!   server

mod local;
mod remote_map;
mod remote_native;

pub use local::LocalCacheStore;
pub use remote_map::RemoteMapStore;
pub use remote_native::RemoteNativeStore;

use crate::cache::types::{CacheKey, CacheValue};
use crate::error::CacheResult;

/// Serialized form of a key, used as hash field and lock name
pub(crate) fn encode_key<K: CacheKey>(key: &K) -> CacheResult<String> {
    Ok(serde_json::to_string(key)?)
}

pub(crate) fn decode_key<K: CacheKey>(field: &str) -> CacheResult<K> {
    Ok(serde_json::from_str(field)?)
}

pub(crate) fn encode_value<V: CacheValue>(value: &V) -> CacheResult<String> {
    Ok(serde_json::to_string(value)?)
}

pub(crate) fn decode_value<V: CacheValue>(raw: &str) -> CacheResult<V> {
    Ok(serde_json::from_str(raw)?)
}
