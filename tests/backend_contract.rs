//! Behavior every backend kind must share, run against all three

mod common;

use std::collections::HashMap;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use common::{for_each_backend, unique_name, IDLE_TTL, NOTIFY_WAIT, PAST_TTL, SHORT_TTL};
use polycache::test_utils::{CountingLoader, RecordingListener};
use polycache::{CacheError, RemovalCause};

#[test]
fn put_then_get_round_trips() {
    for_each_backend(|backend| {
        let cache = backend
            .builder::<String, u64>(unique_name("contract::put_get"))
            .build()
            .unwrap();

        assert_eq!(cache.get(&"a".to_string()).unwrap(), None);
        cache.put("a".to_string(), 1).unwrap();
        assert_eq!(cache.get(&"a".to_string()).unwrap(), Some(1));
        assert_eq!(cache.get_if_present(&"a".to_string()).unwrap(), Some(1));
    });
}

#[test]
fn replacing_a_value_notifies_replaced_with_old_value() {
    for_each_backend(|backend| {
        let recorder = RecordingListener::<String, u64>::new();
        let cache = backend
            .builder::<String, u64>(unique_name("contract::replace"))
            .removal_listener(recorder.listener())
            .build()
            .unwrap();

        cache.put("a".to_string(), 1).unwrap();
        cache.put("a".to_string(), 2).unwrap();

        assert!(recorder.wait_for(RemovalCause::Replaced, 1, NOTIFY_WAIT));
        let replaced: Vec<_> = recorder
            .notifications()
            .into_iter()
            .filter(|n| n.cause == RemovalCause::Replaced)
            .collect();
        assert_eq!(replaced.len(), 1);
        assert_eq!(replaced[0].key, "a");
        assert_eq!(replaced[0].value, 1);
        assert_eq!(cache.get(&"a".to_string()).unwrap(), Some(2));
    });
}

#[test]
fn invalidation_notifies_explicit() {
    for_each_backend(|backend| {
        let recorder = RecordingListener::<String, u64>::new();
        let cache = backend
            .builder::<String, u64>(unique_name("contract::invalidate"))
            .removal_listener(recorder.listener())
            .build()
            .unwrap();

        cache
            .put_all((0..4).map(|i| (format!("k{i}"), i)))
            .unwrap();
        cache.invalidate(&"k0".to_string()).unwrap();
        assert!(recorder.wait_for(RemovalCause::Explicit, 1, NOTIFY_WAIT));
        assert_eq!(cache.get(&"k0".to_string()).unwrap(), None);

        cache.invalidate_all().unwrap();
        assert!(recorder.wait_for(RemovalCause::Explicit, 4, NOTIFY_WAIT));
        assert_eq!(cache.estimated_size().unwrap(), 0);
        assert_eq!(recorder.count(RemovalCause::Replaced), 0);
    });
}

#[test]
fn loader_fills_misses_and_get_all_omits_unresolved() {
    for_each_backend(|backend| {
        let loader = CountingLoader::new(|key: &u32| (key % 2 == 0).then(|| key * 10));
        let cache = backend
            .builder::<u32, u32>(unique_name("contract::loader"))
            .build_with_loader(loader.loader())
            .unwrap();

        assert_eq!(cache.get(&4).unwrap(), Some(40));
        assert_eq!(cache.get(&4).unwrap(), Some(40));
        assert_eq!(loader.calls(), 1);

        let found = cache.get_all([1, 2, 3, 4]).unwrap();
        let expected: HashMap<u32, u32> = [(2, 20), (4, 40)].into_iter().collect();
        assert_eq!(found, expected);
    });
}

#[test]
fn concurrent_misses_invoke_loader_once() {
    for_each_backend(|backend| {
        let loader =
            CountingLoader::new(|key: &String| Some(key.len())).with_delay(Duration::from_millis(50));
        let cache = backend
            .builder::<String, usize>(unique_name("contract::coalesce"))
            .build_with_loader(loader.loader())
            .unwrap();

        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    cache.get(&"shared-key".to_string()).unwrap()
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), Some(10));
        }
        assert_eq!(loader.calls(), 1);
    });
}

#[test]
fn loader_errors_propagate_and_are_not_cached() {
    for_each_backend(|backend| {
        let attempts = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen = Arc::clone(&attempts);
        let cache = backend
            .builder::<String, u64>(unique_name("contract::loader_error"))
            .build_with_loader(move |_key: &String| {
                if seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                    anyhow::bail!("database offline")
                }
                Ok(Some(7))
            })
            .unwrap();

        let err = cache.get(&"k".to_string()).unwrap_err();
        assert!(err.is_loader());
        assert!(err.to_string().contains("database offline"));

        assert_eq!(cache.get(&"k".to_string()).unwrap(), Some(7));
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 2);
    });
}

#[test]
fn mapping_function_is_skipped_when_loader_resolves() {
    for_each_backend(|backend| {
        let cache = backend
            .builder::<u32, String>(unique_name("contract::get_with"))
            .build_with_loader(|key: &u32| Ok((*key < 10).then(|| format!("loaded-{key}"))))
            .unwrap();

        let value = cache
            .get_with(&1, |_| panic!("mapping must not run when the loader resolved"))
            .unwrap();
        assert_eq!(value.as_deref(), Some("loaded-1"));

        let mapped = cache
            .get_with(&42, |key| Ok(Some(format!("mapped-{key}"))))
            .unwrap();
        assert_eq!(mapped.as_deref(), Some("mapped-42"));
        assert_eq!(cache.get_if_present(&42).unwrap().as_deref(), Some("mapped-42"));

        let failed = cache.get_with(&99, |_| anyhow::bail!("no source")).unwrap_err();
        assert!(failed.is_loader());
    });
}

#[test]
fn map_view_is_live_and_consults_loader() {
    for_each_backend(|backend| {
        let cache = backend
            .builder::<String, u64>(unique_name("contract::as_map"))
            .build_with_loader(|key: &String| Ok(key.strip_prefix("n").and_then(|n| n.parse().ok())))
            .unwrap();
        let map = cache.as_map();

        assert_eq!(map.get(&"n5".to_string()).unwrap(), Some(5));
        assert!(map.contains_key(&"n6".to_string()).unwrap());
        assert!(!map.contains_key(&"other".to_string()).unwrap());

        assert_eq!(map.insert("x".to_string(), 1).unwrap(), None);
        assert_eq!(map.insert("x".to_string(), 2).unwrap(), Some(1));
        assert_eq!(map.put_if_absent("x".to_string(), 3).unwrap(), Some(2));
        assert_eq!(map.remove(&"x".to_string()).unwrap(), Some(2));
        assert_eq!(cache.get_if_present(&"x".to_string()).unwrap(), None);

        map.clear().unwrap();
        assert!(map.is_empty().unwrap());
    });
}

#[test]
fn iteration_returns_current_entries() {
    for_each_backend(|backend| {
        let cache = backend
            .builder::<u32, u32>(unique_name("contract::iter"))
            .build()
            .unwrap();
        cache.put_all((0..5).map(|i| (i, i * i))).unwrap();

        let mut entries: Vec<_> = cache.iter().unwrap().collect();
        entries.sort_unstable();
        assert_eq!(entries, vec![(0, 0), (1, 1), (2, 4), (3, 9), (4, 16)]);
    });
}

#[test]
fn write_expiry_hides_entries_and_notifies_expired() {
    for_each_backend(|backend| {
        let recorder = RecordingListener::<String, u64>::new();
        let cache = backend
            .builder::<String, u64>(unique_name("contract::ttl"))
            .expire_after_write(SHORT_TTL)
            .removal_listener(recorder.listener())
            .build()
            .unwrap();

        cache.put("k".to_string(), 1).unwrap();
        thread::sleep(PAST_TTL);

        assert_eq!(cache.get(&"k".to_string()).unwrap(), None);
        cache.clean_up().unwrap();
        assert!(recorder.wait_for(RemovalCause::Expired, 1, NOTIFY_WAIT));
        assert!(recorder.notifications().iter().all(|n| n.cause != RemovalCause::Explicit));
    });
}

#[test]
fn access_expiry_keeps_read_entries_and_drops_idle_ones() {
    for_each_backend(|backend| {
        if !backend.capabilities().access_expiry {
            return;
        }
        let recorder = RecordingListener::<String, u64>::new();
        let cache = backend
            .builder::<String, u64>(unique_name("contract::idle"))
            .expire_after_access(IDLE_TTL)
            .removal_listener(recorder.listener())
            .build()
            .unwrap();

        cache.put("read".to_string(), 1).unwrap();
        cache.put("idle".to_string(), 2).unwrap();
        for _ in 0..6 {
            thread::sleep(IDLE_TTL / 4);
            assert_eq!(cache.get(&"read".to_string()).unwrap(), Some(1));
        }
        assert_eq!(cache.get_if_present(&"idle".to_string()).unwrap(), None);

        recorder.clear();
        thread::sleep(IDLE_TTL * 2);
        assert_eq!(cache.get(&"read".to_string()).unwrap(), None);
        cache.clean_up().unwrap();
        assert!(recorder.wait_for(RemovalCause::Expired, 1, NOTIFY_WAIT));
    });
}

#[test]
fn size_bound_is_enforced_where_supported() {
    for_each_backend(|backend| {
        if !backend.capabilities().max_size {
            return;
        }
        let recorder = RecordingListener::<u32, u32>::new();
        let cache = backend
            .builder::<u32, u32>(unique_name("contract::size"))
            .maximum_size(5)
            .removal_listener(recorder.listener())
            .build()
            .unwrap();

        for i in 0..20 {
            cache.put(i, i).unwrap();
        }
        cache.clean_up().unwrap();

        assert!(cache.estimated_size().unwrap() <= 5);
        assert!(recorder.count(RemovalCause::Size) >= 15);
    });
}

#[test]
fn listener_failures_never_reach_the_caller() {
    for_each_backend(|backend| {
        let cache = backend
            .builder::<String, u64>(unique_name("contract::listener_error"))
            .removal_listener(|_: &String, _: &u64, _| anyhow::bail!("listener exploded"))
            .build()
            .unwrap();

        cache.put("k".to_string(), 1).unwrap();
        cache.put("k".to_string(), 2).unwrap();
        cache.invalidate(&"k".to_string()).unwrap();
        assert_eq!(cache.get(&"k".to_string()).unwrap(), None);
        assert_eq!(cache.stats().evictions, 0);
    });
}

#[test]
fn per_key_lock_is_reentrant() {
    for_each_backend(|backend| {
        let cache = backend
            .builder::<String, u64>(unique_name("contract::lock"))
            .build()
            .unwrap();
        let lock = cache.get_lock(&"counter".to_string()).unwrap();
        assert_eq!(lock.is_distributed(), backend.is_distributed());

        let outer = lock.lock().unwrap();
        let inner = lock.try_lock().unwrap();
        assert!(inner.is_some());
        drop(inner);
        outer.unlock().unwrap();
    });
}

#[test]
fn close_is_idempotent_and_rejects_later_use() {
    for_each_backend(|backend| {
        let cache = backend
            .builder::<String, u64>(unique_name("contract::close"))
            .build()
            .unwrap();
        cache.put("k".to_string(), 1).unwrap();

        cache.close().unwrap();
        cache.close().unwrap();
        assert!(cache.is_closed());
        assert!(matches!(
            cache.get(&"k".to_string()),
            Err(CacheError::Closed(_))
        ));
    });
}

#[test]
fn stats_track_hits_misses_and_loads() {
    for_each_backend(|backend| {
        let cache = backend
            .builder::<u32, u32>(unique_name("contract::stats"))
            .build_with_loader(|key: &u32| Ok(Some(*key)))
            .unwrap();

        cache.get(&1).unwrap();
        cache.get(&1).unwrap();
        cache.get_if_present(&2).unwrap();

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.loads, 1);
        assert_eq!(stats.load_failures, 0);
    });
}
