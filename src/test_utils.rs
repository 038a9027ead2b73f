//! # Test Utilities
//!
//! Fixtures shared by unit tests, integration tests and benches: recording
//! removal listeners, counting loaders and one backend of each kind over a
//! fresh in-memory remote store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::backend::BackendKind;
use crate::cache::{CacheKey, CacheValue, RemovalCause, RemovalNotification};
use crate::context::CacheContext;
use crate::store::{MemoryStore, RemoteStore};

/// Captures every removal notification it receives
#[derive(Debug)]
pub struct RecordingListener<K, V> {
    seen: Arc<Mutex<Vec<RemovalNotification<K, V>>>>,
}

impl<K, V> Clone for RecordingListener<K, V> {
    fn clone(&self) -> Self {
        Self {
            seen: Arc::clone(&self.seen),
        }
    }
}

impl<K, V> Default for RecordingListener<K, V> {
    fn default() -> Self {
        Self {
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<K: CacheKey, V: CacheValue> RecordingListener<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Closure to pass to `CacheBuilder::removal_listener`
    pub fn listener(&self) -> impl Fn(&K, &V, RemovalCause) -> anyhow::Result<()> + Send + Sync + 'static {
        let seen = Arc::clone(&self.seen);
        move |key: &K, value: &V, cause: RemovalCause| {
            seen.lock().push(RemovalNotification {
                key: key.clone(),
                value: value.clone(),
                cause,
            });
            Ok(())
        }
    }

    pub fn notifications(&self) -> Vec<RemovalNotification<K, V>> {
        self.seen.lock().clone()
    }

    pub fn count(&self, cause: RemovalCause) -> usize {
        self.seen.lock().iter().filter(|n| n.cause == cause).count()
    }

    pub fn clear(&self) {
        self.seen.lock().clear();
    }

    /// Poll until `expected` notifications with `cause` arrived
    pub fn wait_for(&self, cause: RemovalCause, expected: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.count(cause) >= expected {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

/// Loader that counts invocations and answers from a function
pub struct CountingLoader<K, V> {
    calls: Arc<AtomicUsize>,
    answer: Arc<dyn Fn(&K) -> Option<V> + Send + Sync>,
    delay: Duration,
}

impl<K, V> Clone for CountingLoader<K, V> {
    fn clone(&self) -> Self {
        Self {
            calls: Arc::clone(&self.calls),
            answer: Arc::clone(&self.answer),
            delay: self.delay,
        }
    }
}

impl<K: CacheKey, V: CacheValue> CountingLoader<K, V> {
    pub fn new<F>(answer: F) -> Self
    where
        F: Fn(&K) -> Option<V> + Send + Sync + 'static,
    {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            answer: Arc::new(answer),
            delay: Duration::ZERO,
        }
    }

    /// Sleep this long inside every load, to widen race windows
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn loader(&self) -> impl Fn(&K) -> anyhow::Result<Option<V>> + Send + Sync + 'static {
        let this = self.clone();
        move |key: &K| {
            this.calls.fetch_add(1, Ordering::SeqCst);
            if !this.delay.is_zero() {
                std::thread::sleep(this.delay);
            }
            Ok((this.answer)(key))
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub fn memory_store() -> Arc<dyn RemoteStore> {
    Arc::new(MemoryStore::new())
}

pub fn local_backend() -> BackendKind {
    BackendKind::local()
}

pub fn generic_backend(store: Arc<dyn RemoteStore>) -> BackendKind {
    BackendKind::distributed_generic(store)
}

/// Native backend over `store`, which must support field expiration
pub fn native_backend(store: Arc<dyn RemoteStore>) -> BackendKind {
    match BackendKind::distributed_native(Arc::clone(&store)) {
        Ok(backend) => backend,
        Err(e) => panic!("store cannot host the native backend: {e}"),
    }
}

/// One backend of each kind; the distributed ones share a fresh store
pub fn all_backends() -> Vec<BackendKind> {
    let store = memory_store();
    vec![
        local_backend(),
        generic_backend(Arc::clone(&store)),
        native_backend(store),
    ]
}

pub fn local_context() -> CacheContext {
    CacheContext::new(local_backend())
}

pub fn generic_context(store: Arc<dyn RemoteStore>) -> CacheContext {
    CacheContext::new(generic_backend(store))
}

pub fn native_context(store: Arc<dyn RemoteStore>) -> CacheContext {
    CacheContext::new(native_backend(store))
}
