//! In-process [`RemoteStore`].
//!
//! Behaves like a shared server for every handle in the process: caches and
//! coordinators built over the same `MemoryStore` see each other's state,
//! which is how several application instances are simulated in one test
//! binary. Field TTLs are reaped lazily on access and by
//! [`RemoteStore::purge_expired`], firing expiry hooks.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use super::{ExpiryHook, RemoteStore, SubscriptionId};
use crate::error::{CacheError, CacheResult};

#[derive(Debug)]
struct Field {
    value: String,
    expires_at: Option<Instant>,
}

impl Field {
    fn new(value: &str, ttl: Option<Duration>) -> Self {
        Self {
            value: value.to_string(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug)]
struct LockLease {
    owner: String,
    holds: u32,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct State {
    maps: HashMap<String, HashMap<String, Field>>,
    locks: HashMap<String, LockLease>,
    counters: HashMap<String, i64>,
}

type Reaped = Vec<(String, String)>;

fn reap(fields: &mut HashMap<String, Field>, now: Instant) -> Reaped {
    let expired: Vec<String> = fields
        .iter()
        .filter(|(_, f)| f.is_expired(now))
        .map(|(k, _)| k.clone())
        .collect();
    expired
        .into_iter()
        .filter_map(|k| fields.remove(&k).map(|f| (k, f.value)))
        .collect()
}

/// Shared in-process store
pub struct MemoryStore {
    state: Mutex<State>,
    hooks: RwLock<HashMap<String, Vec<(SubscriptionId, ExpiryHook)>>>,
    next_subscription: AtomicU64,
    available: AtomicBool,
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryStore")
            .field("maps", &state.maps.len())
            .field("locks", &state.locks.len())
            .field("counters", &state.counters.len())
            .field("available", &self.available.load(Ordering::SeqCst))
            .finish()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            hooks: RwLock::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: while unavailable every operation fails with
    /// `BackendUnavailable`
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> CacheResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CacheError::backend_unavailable("memory store is unavailable"))
        }
    }

    fn with_map<T>(
        &self,
        map: &str,
        op: impl FnOnce(&mut HashMap<String, Field>) -> T,
    ) -> CacheResult<T> {
        self.check_available()?;
        let (result, reaped) = {
            let mut state = self.state.lock();
            let fields = state.maps.entry(map.to_string()).or_default();
            let reaped = reap(fields, Instant::now());
            (op(fields), reaped)
        };
        self.fire_expired(map, reaped);
        Ok(result)
    }

    fn fire_expired(&self, map: &str, reaped: Reaped) {
        if reaped.is_empty() {
            return;
        }
        trace!(map = %map, count = reaped.len(), "Reaped expired fields");

        let hooks: Vec<ExpiryHook> = self
            .hooks
            .read()
            .get(map)
            .map(|subs| subs.iter().map(|(_, hook)| hook.clone()).collect())
            .unwrap_or_default();

        for (field, value) in &reaped {
            for hook in &hooks {
                hook(field, value);
            }
        }
    }

    fn with_state<T>(&self, op: impl FnOnce(&mut State) -> T) -> CacheResult<T> {
        self.check_available()?;
        Ok(op(&mut self.state.lock()))
    }
}

impl RemoteStore for MemoryStore {
    fn driver_name(&self) -> &'static str {
        "memory"
    }

    fn ping(&self) -> CacheResult<()> {
        self.check_available()
    }

    fn supports_field_expiration(&self) -> bool {
        true
    }

    fn supports_expiry_notifications(&self) -> bool {
        true
    }

    fn map_get(&self, map: &str, field: &str) -> CacheResult<Option<String>> {
        self.with_map(map, |fields| fields.get(field).map(|f| f.value.clone()))
    }

    fn map_put(
        &self,
        map: &str,
        field: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> CacheResult<Option<String>> {
        self.with_map(map, |fields| {
            fields
                .insert(field.to_string(), Field::new(value, ttl))
                .map(|previous| previous.value)
        })
    }

    fn map_put_if_absent(
        &self,
        map: &str,
        field: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> CacheResult<Option<String>> {
        self.with_map(map, |fields| match fields.get(field) {
            Some(existing) => Some(existing.value.clone()),
            None => {
                fields.insert(field.to_string(), Field::new(value, ttl));
                None
            }
        })
    }

    fn map_remove(&self, map: &str, field: &str) -> CacheResult<Option<String>> {
        self.with_map(map, |fields| fields.remove(field).map(|f| f.value))
    }

    fn map_remove_if(&self, map: &str, field: &str, expected: &str) -> CacheResult<bool> {
        self.with_map(map, |fields| {
            let matches = fields.get(field).is_some_and(|f| f.value == expected);
            if matches {
                fields.remove(field);
            }
            matches
        })
    }

    fn map_replace_if(
        &self,
        map: &str,
        field: &str,
        expected: &str,
        value: &str,
    ) -> CacheResult<bool> {
        self.with_map(map, |fields| match fields.get_mut(field) {
            Some(current) if current.value == expected => {
                current.value = value.to_string();
                true
            }
            _ => false,
        })
    }

    fn map_entries(&self, map: &str) -> CacheResult<Vec<(String, String)>> {
        self.with_map(map, |fields| {
            fields
                .iter()
                .map(|(k, f)| (k.clone(), f.value.clone()))
                .collect()
        })
    }

    fn map_len(&self, map: &str) -> CacheResult<u64> {
        self.with_map(map, |fields| fields.len() as u64)
    }

    fn subscribe_expired(&self, map: &str, hook: ExpiryHook) -> Option<SubscriptionId> {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::SeqCst));
        self.hooks
            .write()
            .entry(map.to_string())
            .or_default()
            .push((id, hook));
        debug!(map = %map, subscription = id.0, "Expiry hook registered");
        Some(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        let mut hooks = self.hooks.write();
        for subs in hooks.values_mut() {
            subs.retain(|(sub, _)| *sub != id);
        }
        hooks.retain(|_, subs| !subs.is_empty());
    }

    fn purge_expired(&self) -> CacheResult<u64> {
        self.check_available()?;
        let now = Instant::now();
        let reaped: Vec<(String, Reaped)> = {
            let mut state = self.state.lock();
            state
                .maps
                .iter_mut()
                .map(|(map, fields)| (map.clone(), reap(fields, now)))
                .filter(|(_, reaped)| !reaped.is_empty())
                .collect()
        };

        let mut total = 0u64;
        for (map, fields) in reaped {
            total += fields.len() as u64;
            self.fire_expired(&map, fields);
        }
        Ok(total)
    }

    fn try_lock(&self, name: &str, owner: &str, lease: Duration) -> CacheResult<bool> {
        self.with_state(|state| {
            let now = Instant::now();
            match state.locks.get_mut(name) {
                Some(held) if held.owner == owner && held.expires_at > now => {
                    held.holds += 1;
                    held.expires_at = now + lease;
                    true
                }
                Some(held) if held.expires_at > now => false,
                _ => {
                    state.locks.insert(
                        name.to_string(),
                        LockLease {
                            owner: owner.to_string(),
                            holds: 1,
                            expires_at: now + lease,
                        },
                    );
                    true
                }
            }
        })
    }

    fn unlock(&self, name: &str, owner: &str) -> CacheResult<bool> {
        self.with_state(|state| {
            let now = Instant::now();
            match state.locks.get_mut(name) {
                Some(held) if held.owner == owner && held.expires_at > now => {
                    held.holds -= 1;
                    if held.holds == 0 {
                        state.locks.remove(name);
                    }
                    true
                }
                _ => false,
            }
        })
    }

    fn extend_lock(&self, name: &str, owner: &str, lease: Duration) -> CacheResult<bool> {
        self.with_state(|state| {
            let now = Instant::now();
            match state.locks.get_mut(name) {
                Some(held) if held.owner == owner && held.expires_at > now => {
                    held.expires_at = now + lease;
                    true
                }
                _ => false,
            }
        })
    }

    fn counter_get(&self, name: &str) -> CacheResult<i64> {
        self.with_state(|state| state.counters.get(name).copied().unwrap_or(0))
    }

    fn counter_set(&self, name: &str, value: i64) -> CacheResult<()> {
        self.with_state(|state| {
            state.counters.insert(name.to_string(), value);
        })
    }

    fn counter_add(&self, name: &str, delta: i64) -> CacheResult<i64> {
        self.with_state(|state| -> CacheResult<i64> {
            let slot = state.counters.entry(name.to_string()).or_insert(0);
            let sum = slot
                .checked_add(delta)
                .ok_or_else(|| CacheError::counter_overflow(name, delta))?;
            *slot = sum;
            Ok(sum)
        })?
    }

    fn counter_get_and_set(&self, name: &str, value: i64) -> CacheResult<i64> {
        self.with_state(|state| {
            state
                .counters
                .insert(name.to_string(), value)
                .unwrap_or(0)
        })
    }

    fn counter_compare_and_set(&self, name: &str, expect: i64, update: i64) -> CacheResult<bool> {
        self.with_state(|state| {
            let slot = state.counters.entry(name.to_string()).or_insert(0);
            if *slot == expect {
                *slot = update;
                true
            } else {
                false
            }
        })
    }
}
