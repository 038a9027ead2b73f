//! Per-key loader coalescing for engines without a native compute primitive.
//!
//! The first caller for a key becomes the leader and runs the load; callers
//! arriving while it runs block until it finishes and receive a clone of the
//! same outcome, error included.

use std::hash::Hash;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};

use crate::error::{CacheError, CacheResult};

struct Flight<T> {
    outcome: Mutex<Option<CacheResult<T>>>,
    done: Condvar,
}

impl<T: Clone> Flight<T> {
    fn new() -> Self {
        Self {
            outcome: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    fn complete(&self, outcome: CacheResult<T>) {
        *self.outcome.lock() = Some(outcome);
        self.done.notify_all();
    }

    fn wait(&self) -> CacheResult<T> {
        let mut slot = self.outcome.lock();
        loop {
            if let Some(outcome) = slot.as_ref() {
                return outcome.clone();
            }
            self.done.wait(&mut slot);
        }
    }
}

pub(crate) struct SingleFlight<K, T> {
    flights: DashMap<K, Arc<Flight<T>>>,
}

impl<K, T> SingleFlight<K, T>
where
    K: Hash + Eq + Clone,
    T: Clone,
{
    pub(crate) fn new() -> Self {
        Self {
            flights: DashMap::new(),
        }
    }

    /// Run `load` for `key` unless a load for it is already in flight, in
    /// which case wait for and share that outcome
    pub(crate) fn run<F>(&self, key: &K, load: F) -> CacheResult<T>
    where
        F: FnOnce() -> CacheResult<T>,
    {
        let (flight, leader) = match self.flights.entry(key.clone()) {
            Entry::Occupied(existing) => (Arc::clone(existing.get()), false),
            Entry::Vacant(slot) => {
                let flight = Arc::new(Flight::new());
                slot.insert(Arc::clone(&flight));
                (flight, true)
            }
        };

        if !leader {
            return flight.wait();
        }

        let result = catch_unwind(AssertUnwindSafe(load));
        self.flights.remove(key);

        match result {
            Ok(outcome) => {
                flight.complete(outcome.clone());
                outcome
            }
            Err(panic) => {
                flight.complete(Err(CacheError::Internal("loader panicked".to_string())));
                resume_unwind(panic)
            }
        }
    }

    #[cfg(test)]
    fn in_flight(&self) -> usize {
        self.flights.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_concurrent_callers_share_one_load() {
        let flights = Arc::new(SingleFlight::<String, u64>::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let flights = flights.clone();
                let calls = calls.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    flights.run(&"key".to_string(), || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(50));
                        Ok(42)
                    })
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap().unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(flights.in_flight(), 0);
    }

    #[test]
    fn test_errors_are_shared_and_not_remembered() {
        let flights = SingleFlight::<u32, u32>::new();
        let err = flights
            .run(&1, || Err(CacheError::backend_unavailable("down")))
            .unwrap_err();
        assert!(err.is_backend_unavailable());

        assert_eq!(flights.run(&1, || Ok(7)).unwrap(), 7);
    }

    #[test]
    fn test_panicking_leader_releases_key() {
        let flights = SingleFlight::<u32, u32>::new();
        let result = catch_unwind(AssertUnwindSafe(|| {
            flights.run(&1, || panic!("loader blew up"))
        }));
        assert!(result.is_err());
        assert_eq!(flights.in_flight(), 0);
        assert_eq!(flights.run(&1, || Ok(3)).unwrap(), 3);
    }
}
