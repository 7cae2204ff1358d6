// src/core/clock.rs

//! An injectable time source, so timeouts and tick bookkeeping are testable.

use std::time::{SystemTime, UNIX_EPOCH};

/// Provides the current wall-clock time in whole seconds since the UNIX epoch.
/// All timeout arithmetic in the core goes through this trait.
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

/// The production clock, backed by `SystemTime`.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64
    }
}
