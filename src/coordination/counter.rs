//! Named signed 64-bit atomic counters.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::error::{CacheError, CacheResult};
use crate::store::RemoteStore;

/// Counter handle. Handles obtained for the same namespaced name share state;
/// remote counters share it across every process using the store.
#[derive(Clone)]
pub enum AtomicCounter {
    Local {
        name: String,
        value: Arc<AtomicI64>,
    },
    Remote {
        name: String,
        key: String,
        store: Arc<dyn RemoteStore>,
    },
}

impl fmt::Debug for AtomicCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local { name, value } => f
                .debug_struct("Local")
                .field("name", name)
                .field("value", &value.load(Ordering::SeqCst))
                .finish(),
            Self::Remote { name, key, .. } => f
                .debug_struct("Remote")
                .field("name", name)
                .field("key", key)
                .finish(),
        }
    }
}

impl AtomicCounter {
    pub fn name(&self) -> &str {
        match self {
            Self::Local { name, .. } | Self::Remote { name, .. } => name,
        }
    }

    pub fn get(&self) -> CacheResult<i64> {
        match self {
            Self::Local { value, .. } => Ok(value.load(Ordering::SeqCst)),
            Self::Remote { key, store, .. } => store.counter_get(key),
        }
    }

    pub fn set(&self, new_value: i64) -> CacheResult<()> {
        match self {
            Self::Local { value, .. } => {
                value.store(new_value, Ordering::SeqCst);
                Ok(())
            }
            Self::Remote { key, store, .. } => store.counter_set(key, new_value),
        }
    }

    pub fn get_and_set(&self, new_value: i64) -> CacheResult<i64> {
        match self {
            Self::Local { value, .. } => Ok(value.swap(new_value, Ordering::SeqCst)),
            Self::Remote { key, store, .. } => store.counter_get_and_set(key, new_value),
        }
    }

    /// Set to `update` only if the current value is `expect`
    pub fn compare_and_set(&self, expect: i64, update: i64) -> CacheResult<bool> {
        match self {
            Self::Local { value, .. } => Ok(value
                .compare_exchange(expect, update, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()),
            Self::Remote { key, store, .. } => store.counter_compare_and_set(key, expect, update),
        }
    }

    /// Add `delta` and return the new value. Overflow is an error and
    /// leaves the counter unchanged.
    pub fn add_and_get(&self, delta: i64) -> CacheResult<i64> {
        match self {
            Self::Local { name, value } => value
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                    current.checked_add(delta)
                })
                .map(|previous| previous + delta)
                .map_err(|_| CacheError::counter_overflow(name.as_str(), delta)),
            Self::Remote { key, store, .. } => store.counter_add(key, delta),
        }
    }

    pub fn increment_and_get(&self) -> CacheResult<i64> {
        self.add_and_get(1)
    }

    pub fn decrement_and_get(&self) -> CacheResult<i64> {
        self.add_and_get(-1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn local(initial: i64) -> AtomicCounter {
        AtomicCounter::Local {
            name: "test".to_string(),
            value: Arc::new(AtomicI64::new(initial)),
        }
    }

    #[test]
    fn test_counter_operations() {
        let counter = local(0);
        assert_eq!(counter.increment_and_get().unwrap(), 1);
        assert_eq!(counter.decrement_and_get().unwrap(), 0);
        assert_eq!(counter.add_and_get(41).unwrap(), 41);
        assert_eq!(counter.get_and_set(7).unwrap(), 41);
        assert!(!counter.compare_and_set(41, 9).unwrap());
        assert!(counter.compare_and_set(7, 9).unwrap());
        counter.set(-3).unwrap();
        assert_eq!(counter.get().unwrap(), -3);
    }

    #[test]
    fn test_add_rejects_overflow_and_keeps_value() {
        let counter = local(i64::MAX);
        let err = counter.increment_and_get().unwrap_err();
        assert!(matches!(err, CacheError::CounterOverflow { delta: 1, .. }));
        assert_eq!(counter.get().unwrap(), i64::MAX);

        let low = local(i64::MIN);
        assert!(low.decrement_and_get().is_err());
        assert_eq!(low.get().unwrap(), i64::MIN);
    }

    proptest! {
        #[test]
        fn prop_add_and_get_matches_checked_sum(
            initial in any::<i64>(),
            deltas in proptest::collection::vec(any::<i64>(), 0..16)
        ) {
            let counter = local(initial);
            let mut expected = initial;
            for delta in deltas {
                match expected.checked_add(delta) {
                    Some(sum) => {
                        expected = sum;
                        prop_assert_eq!(counter.add_and_get(delta).unwrap(), expected);
                    }
                    None => prop_assert!(counter.add_and_get(delta).is_err()),
                }
            }
            prop_assert_eq!(counter.get().unwrap(), expected);
        }
    }
}
