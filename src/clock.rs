// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Logical write-time source.
//!
//! Every local mutation is stamped with a timestamp from the store's clock.
//! Timestamps are strictly increasing per node even if the wall clock steps
//! backward; collisions across nodes are expected and resolved by the
//! identifier tie-break.

use std::sync::atomic::{AtomicI64, Ordering};

/// Source of logical write times (milliseconds).
pub trait Clock: Send + Sync + 'static {
    /// Next timestamp; strictly greater than every value previously returned.
    fn now(&self) -> i64;

    /// Make sure future timestamps are greater than `observed`.
    ///
    /// Called when a remote entry is applied so that a local write after it
    /// is never stamped in its past.
    fn observe(&self, observed: i64);
}

/// Wall-clock milliseconds with a monotonic guard.
#[derive(Debug, Default)]
pub struct SystemClock {
    last: AtomicI64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            last: AtomicI64::new(0),
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        let wall = chrono::Utc::now().timestamp_millis();
        let mut prev = self.last.load(Ordering::Acquire);
        loop {
            let next = wall.max(prev + 1);
            match self
                .last
                .compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }

    fn observe(&self, observed: i64) {
        self.last.fetch_max(observed, Ordering::AcqRel);
    }
}

/// Manually driven clock for deterministic tests.
///
/// `now()` returns the set time and then advances it by one, so two writes
/// without an explicit `set` still get distinct timestamps.
#[derive(Debug, Default)]
pub struct ManualClock {
    next: AtomicI64,
}

impl ManualClock {
    pub fn new(start: i64) -> Self {
        Self {
            next: AtomicI64::new(start),
        }
    }

    /// Set the timestamp the next `now()` will return.
    pub fn set(&self, ts: i64) {
        self.next.store(ts, Ordering::Release);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.next.fetch_add(1, Ordering::AcqRel)
    }

    fn observe(&self, observed: i64) {
        self.next.fetch_max(observed + 1, Ordering::AcqRel);
    }
}
