//! Helpers shared by the integration tests

#![allow(dead_code)]

use std::time::Duration;

use polycache::test_utils;
use polycache::BackendKind;
use uuid::Uuid;

pub const SHORT_TTL: Duration = Duration::from_millis(60);
pub const PAST_TTL: Duration = Duration::from_millis(180);
pub const NOTIFY_WAIT: Duration = Duration::from_secs(2);
pub const IDLE_TTL: Duration = Duration::from_millis(150);

/// Cache name unique to one test run, so shared stores never collide
pub fn unique_name(prefix: &str) -> String {
    format!("{prefix}::{}", Uuid::new_v4().simple())
}

/// Every backend kind, distributed ones over a fresh in-memory store
pub fn each_backend() -> Vec<BackendKind> {
    test_utils::all_backends()
}

/// Run `check` once per backend kind, naming the kind on failure
pub fn for_each_backend<F: Fn(&BackendKind)>(check: F) {
    for backend in each_backend() {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| check(&backend)));
        if let Err(panic) = result {
            eprintln!("backend {} failed", backend.name());
            std::panic::resume_unwind(panic);
        }
    }
}
