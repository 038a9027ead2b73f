//! Named reentrant locks.
//!
//! A [`DistributedLock`] is a handle; acquiring it yields a [`LockGuard`] that
//! releases on drop. Local locks are `parking_lot` reentrant mutexes; remote
//! locks are owner-counted leases in the shared store, so re-acquiring on the
//! thread that holds the lock never blocks.
//!
//! Remote ownership is the coordinator instance plus the acquiring thread,
//! taken at acquire time, so clones of one handle on different threads still
//! exclude each other. While a remote guard lives, a watchdog thread renews
//! its lease every third of the lease period.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::config::LockOptions;
use crate::error::{CacheError, CacheResult};
use crate::store::RemoteStore;

/// Process-local lock table, keyed by namespaced lock name
pub(crate) type LockRegistry = DashMap<String, Arc<ReentrantMutex<()>>>;

/// Lock handle returned by the coordinator and by `Cache::get_lock`
#[derive(Clone)]
pub enum DistributedLock {
    /// In-process reentrant mutex
    Local(LocalLock),
    /// Lease held in a remote store, owned per instance and thread
    Remote(RemoteLock),
    /// Never blocks; handed out when coordination is not needed
    NoOp { name: String },
}

impl fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(lock) => f.debug_tuple("Local").field(&lock.name).finish(),
            Self::Remote(lock) => f.debug_tuple("Remote").field(&lock.name).finish(),
            Self::NoOp { name } => f.debug_tuple("NoOp").field(name).finish(),
        }
    }
}

impl DistributedLock {
    pub fn name(&self) -> &str {
        match self {
            Self::Local(lock) => &lock.name,
            Self::Remote(lock) => &lock.name,
            Self::NoOp { name } => name,
        }
    }

    pub fn is_distributed(&self) -> bool {
        matches!(self, Self::Remote(_))
    }

    /// Block until acquired
    pub fn lock(&self) -> CacheResult<LockGuard<'_>> {
        match self {
            Self::Local(lock) => Ok(LockGuard::local(lock.mutex.lock())),
            Self::Remote(lock) => {
                let owner = lock.current_owner();
                lock.acquire(&owner, None)?;
                LockGuard::remote(lock, owner)
            }
            Self::NoOp { .. } => Ok(LockGuard::noop()),
        }
    }

    /// Acquire only if free (or already held by this thread)
    pub fn try_lock(&self) -> CacheResult<Option<LockGuard<'_>>> {
        match self {
            Self::Local(lock) => Ok(lock.mutex.try_lock().map(LockGuard::local)),
            Self::Remote(lock) => {
                let owner = lock.current_owner();
                if lock.try_acquire(&owner)? {
                    LockGuard::remote(lock, owner).map(Some)
                } else {
                    Ok(None)
                }
            }
            Self::NoOp { .. } => Ok(Some(LockGuard::noop())),
        }
    }

    /// Wait at most `timeout` for the lock
    pub fn try_lock_for(&self, timeout: Duration) -> CacheResult<Option<LockGuard<'_>>> {
        match self {
            Self::Local(lock) => Ok(lock.mutex.try_lock_for(timeout).map(LockGuard::local)),
            Self::Remote(lock) => {
                let owner = lock.current_owner();
                if lock.acquire(&owner, Some(timeout))? {
                    LockGuard::remote(lock, owner).map(Some)
                } else {
                    Ok(None)
                }
            }
            Self::NoOp { .. } => Ok(Some(LockGuard::noop())),
        }
    }
}

/// In-process lock. The table entry is dropped together with the last
/// handle, so the table only holds names somebody still refers to.
#[derive(Clone)]
pub struct LocalLock {
    name: String,
    mutex: Arc<ReentrantMutex<()>>,
    registry: Weak<LockRegistry>,
}

impl LocalLock {
    pub(crate) fn new(
        name: String,
        mutex: Arc<ReentrantMutex<()>>,
        registry: Weak<LockRegistry>,
    ) -> Self {
        Self {
            name,
            mutex,
            registry,
        }
    }

    #[cfg(test)]
    pub(crate) fn shares_mutex_with(&self, other: &LocalLock) -> bool {
        Arc::ptr_eq(&self.mutex, &other.mutex)
    }
}

impl Drop for LocalLock {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        // Table entry plus this handle
        registry.remove_if(&self.name, |_, mutex| {
            Arc::ptr_eq(mutex, &self.mutex) && Arc::strong_count(mutex) <= 2
        });
    }
}

/// Remote lock state: store key, owning instance and lease timing
#[derive(Clone)]
pub struct RemoteLock {
    name: String,
    key: String,
    instance_id: Uuid,
    store: Arc<dyn RemoteStore>,
    options: LockOptions,
}

impl RemoteLock {
    pub(crate) fn new(
        name: String,
        key: String,
        instance_id: Uuid,
        store: Arc<dyn RemoteStore>,
        options: LockOptions,
    ) -> Self {
        Self {
            name,
            key,
            instance_id,
            store,
            options,
        }
    }

    fn current_owner(&self) -> String {
        format!("{}:{:?}", self.instance_id, thread::current().id())
    }

    fn try_acquire(&self, owner: &str) -> CacheResult<bool> {
        self.store.try_lock(&self.key, owner, self.options.lease)
    }

    /// Poll until acquired or `timeout` elapses; `None` waits forever
    fn acquire(&self, owner: &str, timeout: Option<Duration>) -> CacheResult<bool> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.try_acquire(owner)? {
                debug!(lock = %self.name, owner = %owner, "Remote lock acquired");
                return Ok(true);
            }
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return Ok(false);
                }
                thread::sleep(self.options.retry_interval.min(deadline - now));
            } else {
                thread::sleep(self.options.retry_interval);
            }
        }
    }

    /// Drop one hold; `false` when `owner` no longer held the lock
    fn release(&self, owner: &str) -> CacheResult<bool> {
        let released = self.store.unlock(&self.key, owner)?;
        if !released {
            warn!(
                lock = %self.name,
                owner = %owner,
                "Released a remote lock this owner no longer held"
            );
        }
        Ok(released)
    }
}

/// Renews a held lease until stopped
struct LeaseWatchdog {
    stop: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
    lost: Arc<AtomicBool>,
}

impl LeaseWatchdog {
    fn start(lock: &RemoteLock, owner: &str) -> CacheResult<Self> {
        let (stop, stopped) = mpsc::channel::<()>();
        let lost = Arc::new(AtomicBool::new(false));

        let store = Arc::clone(&lock.store);
        let key = lock.key.clone();
        let name = lock.name.clone();
        let owner = owner.to_string();
        let lease = lock.options.lease;
        let interval = (lease / 3).max(Duration::from_millis(1));
        let flag = Arc::clone(&lost);

        let handle = thread::Builder::new()
            .name("polycache-lease".to_string())
            .spawn(move || loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => match store.extend_lock(&key, &owner, lease) {
                        Ok(true) => trace!(lock = %name, "Lease renewed"),
                        Ok(false) => {
                            warn!(lock = %name, owner = %owner, "Lease lost while guard was held");
                            flag.store(true, Ordering::SeqCst);
                            return;
                        }
                        Err(e) => warn!(lock = %name, error = %e, "Lease renewal failed"),
                    },
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                }
            })
            .map_err(|e| CacheError::Internal(format!("cannot start lease watchdog: {e}")))?;

        Ok(Self {
            stop: Some(stop),
            handle: Some(handle),
            lost,
        })
    }

    /// Stop renewing; `true` when the lease had already been lost
    fn stop(&mut self) -> bool {
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Lease watchdog panicked");
            }
        }
        self.lost.load(Ordering::SeqCst)
    }
}

impl Drop for LeaseWatchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

enum GuardInner<'a> {
    Local(ReentrantMutexGuard<'a, ()>),
    Remote {
        lock: &'a RemoteLock,
        owner: String,
        watchdog: LeaseWatchdog,
    },
    NoOp,
}

/// Held lock; released on drop or with [`LockGuard::unlock`]
pub struct LockGuard<'a> {
    inner: Option<GuardInner<'a>>,
}

impl<'a> LockGuard<'a> {
    fn local(guard: ReentrantMutexGuard<'a, ()>) -> Self {
        Self {
            inner: Some(GuardInner::Local(guard)),
        }
    }

    fn remote(lock: &'a RemoteLock, owner: String) -> CacheResult<Self> {
        let watchdog = match LeaseWatchdog::start(lock, &owner) {
            Ok(watchdog) => watchdog,
            Err(e) => {
                lock.release(&owner)?;
                return Err(e);
            }
        };
        Ok(Self {
            inner: Some(GuardInner::Remote {
                lock,
                owner,
                watchdog,
            }),
        })
    }

    fn noop() -> Self {
        Self {
            inner: Some(GuardInner::NoOp),
        }
    }

    /// Release now. A remote lock whose lease was lost while held is
    /// reported as [`CacheError::LockLost`].
    pub fn unlock(mut self) -> CacheResult<()> {
        match self.inner.take() {
            Some(GuardInner::Remote {
                lock,
                owner,
                mut watchdog,
            }) => {
                let lost = watchdog.stop();
                if lock.release(&owner)? && !lost {
                    Ok(())
                } else {
                    Err(CacheError::LockLost(lock.name.clone()))
                }
            }
            _ => Ok(()),
        }
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Some(GuardInner::Remote {
            lock,
            owner,
            mut watchdog,
        }) = self.inner.take()
        {
            watchdog.stop();
            if let Err(e) = lock.release(&owner) {
                warn!(lock = %lock.name, error = %e, "Failed to release remote lock");
            }
        }
    }
}

impl fmt::Debug for LockGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.inner {
            Some(GuardInner::Local(_)) => "local",
            Some(GuardInner::Remote { .. }) => "remote",
            Some(GuardInner::NoOp) => "noop",
            None => "released",
        };
        f.debug_struct("LockGuard").field("kind", &kind).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    fn local(name: &str) -> DistributedLock {
        DistributedLock::Local(LocalLock::new(
            name.to_string(),
            Arc::new(ReentrantMutex::new(())),
            Weak::new(),
        ))
    }

    fn remote(store: Arc<dyn RemoteStore>, lease: Duration) -> DistributedLock {
        DistributedLock::Remote(RemoteLock::new(
            "remote".to_string(),
            "lock:remote".to_string(),
            Uuid::new_v4(),
            store,
            LockOptions {
                lease,
                retry_interval: Duration::from_millis(1),
            },
        ))
    }

    #[test]
    fn test_local_lock_is_reentrant() {
        let lock = local("reentrant");
        let _outer = lock.lock().unwrap();
        let inner = lock.try_lock().unwrap();
        assert!(inner.is_some());
    }

    #[test]
    fn test_local_lock_excludes_other_threads() {
        let lock = local("exclusive");
        let held = lock.lock().unwrap();

        let contender = lock.clone();
        let acquired = thread::spawn(move || {
            contender
                .try_lock_for(Duration::from_millis(20))
                .unwrap()
                .is_some()
        })
        .join()
        .unwrap();
        assert!(!acquired);

        drop(held);
        let contender = lock.clone();
        let acquired = thread::spawn(move || contender.try_lock().unwrap().is_some())
            .join()
            .unwrap();
        assert!(acquired);
    }

    #[test]
    fn test_noop_lock_never_blocks() {
        let lock = DistributedLock::NoOp {
            name: "noop".to_string(),
        };
        let _held = lock.lock().unwrap();

        let (tx, rx) = mpsc::channel();
        let contender = lock.clone();
        thread::spawn(move || {
            let guard = contender.lock().unwrap();
            tx.send(()).unwrap();
            guard.unlock().unwrap();
        });
        assert!(rx.recv_timeout(Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn test_cloned_remote_handle_excludes_other_threads() {
        let lock = remote(Arc::new(MemoryStore::new()), Duration::from_secs(5));
        let inside = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let lock = lock.clone();
                let inside = Arc::clone(&inside);
                let peak = Arc::clone(&peak);
                thread::spawn(move || {
                    for _ in 0..5 {
                        let guard = lock.lock().unwrap();
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(2));
                        inside.fetch_sub(1, Ordering::SeqCst);
                        guard.unlock().unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remote_guard_renews_its_lease() {
        let store: Arc<dyn RemoteStore> = Arc::new(MemoryStore::new());
        let lock = remote(Arc::clone(&store), Duration::from_millis(40));
        let guard = lock.lock().unwrap();

        thread::sleep(Duration::from_millis(150));
        assert!(!store
            .try_lock("lock:remote", "someone-else", Duration::from_secs(1))
            .unwrap());
        guard.unlock().unwrap();
        assert!(store
            .try_lock("lock:remote", "someone-else", Duration::from_secs(1))
            .unwrap());
    }

    #[test]
    fn test_unlock_reports_a_lost_lease() {
        let store: Arc<dyn RemoteStore> = Arc::new(MemoryStore::new());
        let lock = remote(Arc::clone(&store), Duration::from_secs(5));
        let guard = lock.lock().unwrap();

        // Simulate the server dropping the lease out from under the holder
        let DistributedLock::Remote(remote) = &lock else {
            unreachable!()
        };
        let owner = remote.current_owner();
        assert!(store.unlock("lock:remote", &owner).unwrap());

        let err = guard.unlock().unwrap_err();
        assert!(matches!(err, CacheError::LockLost(name) if name == "remote"));
    }
}
