//! Shared cache vocabulary: key/value bounds, removal causes, loader and
//! listener callbacks, statistics.

use std::fmt;
use std::fmt::Debug;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::error;

/// Bound for cache keys. Keys are serialized to reach remote engines and
/// lock names, hence the serde bounds.
pub trait CacheKey:
    Clone + Send + Sync + Debug + Hash + Eq + serde::Serialize + serde::de::DeserializeOwned + 'static
{
}

impl<T> CacheKey for T where
    T: Clone
        + Send
        + Sync
        + Debug
        + Hash
        + Eq
        + serde::Serialize
        + serde::de::DeserializeOwned
        + 'static
{
}

/// Bound for cache values
pub trait CacheValue:
    Clone + Send + Sync + serde::Serialize + serde::de::DeserializeOwned + 'static
{
}

impl<T> CacheValue for T where
    T: Clone + Send + Sync + serde::Serialize + serde::de::DeserializeOwned + 'static
{
}

/// Why an entry left a cache. Every engine maps its native reasons onto
/// exactly these four.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RemovalCause {
    /// Invalidated or removed by a caller
    Explicit,
    /// Overwritten by a put
    Replaced,
    /// Write or access TTL elapsed
    Expired,
    /// Evicted to honor the maximum size
    Size,
}

impl RemovalCause {
    /// `true` for removals the cache decided on by itself
    pub fn was_evicted(self) -> bool {
        matches!(self, Self::Expired | Self::Size)
    }
}

impl fmt::Display for RemovalCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Explicit => "EXPLICIT",
            Self::Replaced => "REPLACED",
            Self::Expired => "EXPIRED",
            Self::Size => "SIZE",
        };
        f.write_str(label)
    }
}

impl From<moka::notification::RemovalCause> for RemovalCause {
    fn from(cause: moka::notification::RemovalCause) -> Self {
        use moka::notification::RemovalCause as Native;
        match cause {
            Native::Explicit => Self::Explicit,
            Native::Replaced => Self::Replaced,
            Native::Expired => Self::Expired,
            Native::Size => Self::Size,
        }
    }
}

/// A delivered removal, as captured by recording listeners
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovalNotification<K, V> {
    pub key: K,
    pub value: V,
    pub cause: RemovalCause,
}

/// Computes the value for a missing key. `Ok(None)` means "no value";
/// nothing is stored and the lookup reports a miss.
pub type Loader<K, V> = Arc<dyn Fn(&K) -> anyhow::Result<Option<V>> + Send + Sync>;

/// Receives every removal. Errors and panics are logged, never propagated.
pub type RemovalListener<K, V> = Arc<dyn Fn(&K, &V, RemovalCause) -> anyhow::Result<()> + Send + Sync>;

/// Point-in-time counters for one cache handle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub loads: u64,
    pub load_failures: u64,
    pub evictions: u64,
}

impl CacheStats {
    pub fn requests(&self) -> u64 {
        self.hits + self.misses
    }

    pub fn hit_rate(&self) -> f64 {
        match self.requests() {
            0 => 0.0,
            total => self.hits as f64 / total as f64,
        }
    }

    /// Field-wise sum, used to aggregate tenant partitions
    pub fn merge(self, other: CacheStats) -> CacheStats {
        CacheStats {
            hits: self.hits + other.hits,
            misses: self.misses + other.misses,
            loads: self.loads + other.loads,
            load_failures: self.load_failures + other.load_failures,
            evictions: self.evictions + other.evictions,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounter {
    hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    load_failures: AtomicU64,
    evictions: AtomicU64,
}

impl StatsCounter {
    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_load(&self, succeeded: bool) {
        self.loads.fetch_add(1, Ordering::Relaxed);
        if !succeeded {
            self.load_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            load_failures: self.load_failures.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

/// Delivers removals to the configured listener, isolating its failures
pub(crate) struct Notifier<K, V> {
    cache: String,
    listener: Option<RemovalListener<K, V>>,
    stats: Arc<StatsCounter>,
}

impl<K: CacheKey, V: CacheValue> Notifier<K, V> {
    pub(crate) fn new(
        cache: &str,
        listener: Option<RemovalListener<K, V>>,
        stats: Arc<StatsCounter>,
    ) -> Self {
        Self {
            cache: cache.to_string(),
            listener,
            stats,
        }
    }

    pub(crate) fn notify(&self, key: &K, value: &V, cause: RemovalCause) {
        if cause.was_evicted() {
            self.stats.record_eviction();
        }

        let Some(listener) = &self.listener else {
            return;
        };

        match catch_unwind(AssertUnwindSafe(|| listener(key, value, cause))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(
                    cache = %self.cache,
                    key = ?key,
                    cause = %cause,
                    error = %e,
                    "Removal listener failed"
                );
            }
            Err(_) => {
                error!(
                    cache = %self.cache,
                    key = ?key,
                    cause = %cause,
                    "Removal listener panicked"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_native_causes_map_one_to_one() {
        use moka::notification::RemovalCause as Native;
        assert_eq!(RemovalCause::from(Native::Explicit), RemovalCause::Explicit);
        assert_eq!(RemovalCause::from(Native::Replaced), RemovalCause::Replaced);
        assert_eq!(RemovalCause::from(Native::Expired), RemovalCause::Expired);
        assert_eq!(RemovalCause::from(Native::Size), RemovalCause::Size);
    }

    #[test]
    fn test_only_expiry_and_size_count_as_evictions() {
        assert!(RemovalCause::Expired.was_evicted());
        assert!(RemovalCause::Size.was_evicted());
        assert!(!RemovalCause::Explicit.was_evicted());
        assert!(!RemovalCause::Replaced.was_evicted());
    }

    #[test]
    fn test_failing_listener_is_isolated() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let listener: RemovalListener<String, u32> = Arc::new(move |_, _, cause| {
            seen.fetch_add(1, Ordering::SeqCst);
            match cause {
                RemovalCause::Explicit => Err(anyhow::anyhow!("listener rejected")),
                RemovalCause::Size => panic!("listener exploded"),
                _ => Ok(()),
            }
        });
        let stats = Arc::new(StatsCounter::default());
        let notifier = Notifier::new("isolated", Some(listener), stats.clone());

        notifier.notify(&"a".to_string(), &1, RemovalCause::Explicit);
        notifier.notify(&"b".to_string(), &2, RemovalCause::Size);
        notifier.notify(&"c".to_string(), &3, RemovalCause::Expired);

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(stats.snapshot().evictions, 2);
    }

    #[test]
    fn test_stats_hit_rate_and_merge() {
        let a = CacheStats {
            hits: 3,
            misses: 1,
            ..Default::default()
        };
        let b = CacheStats {
            hits: 1,
            misses: 3,
            loads: 2,
            ..Default::default()
        };
        assert!((a.hit_rate() - 0.75).abs() < f64::EPSILON);
        assert_eq!(CacheStats::default().hit_rate(), 0.0);

        let merged = a.merge(b);
        assert_eq!(merged.requests(), 8);
        assert_eq!(merged.loads, 2);
    }
}
