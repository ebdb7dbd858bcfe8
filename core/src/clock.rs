//! Engine clock — the single source of "now".
//!
//! RULE: Nothing in the engine reads the system time directly.
//! Cooldowns, expiry and stats periods all go through a Clock,
//! so tests can pin and advance time deterministically.

use crate::types::Timestamp;
use chrono::{Duration, Utc};
use std::sync::{Arc, Mutex};

pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Wall-clock time. Used by the runner.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now()
    }
}

/// A clock that only moves when told to. Clones share the same instant.
#[derive(Debug, Clone)]
pub struct ManualClock {
    current: Arc<Mutex<Timestamp>>,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            current: Arc::new(Mutex::new(start)),
        }
    }

    pub fn set(&self, at: Timestamp) {
        *self.lock() = at;
    }

    /// Move forward by `by`. Returns the new instant.
    pub fn advance(&self, by: Duration) -> Timestamp {
        let mut guard = self.lock();
        *guard += by;
        *guard
    }

    pub fn advance_hours(&self, hours: i64) -> Timestamp {
        self.advance(Duration::hours(hours))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Timestamp> {
        // A panic while holding the guard cannot leave a Timestamp half-written.
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.lock()
    }
}
