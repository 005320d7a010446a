//! Encode counters for Disc Archiver
//!
//! The coordinator owns one [`EncodeCounters`] per run. Workers update it
//! under a single mutex so "N of M" log lines always agree with each other.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// Point-in-time view of the encode counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CountersSnapshot {
    pub queued: u64,
    pub started: u64,
    pub finished: u64,
    pub failed: u64,
}

impl CountersSnapshot {
    /// Jobs queued but not yet finished or failed.
    pub fn outstanding(&self) -> u64 {
        self.queued.saturating_sub(self.finished + self.failed)
    }
}

/// Shared, mutex-guarded encode counters.
#[derive(Debug, Clone, Default)]
pub struct EncodeCounters {
    inner: Arc<Mutex<CountersSnapshot>>,
}

impl EncodeCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a newly queued job; returns the new queued total.
    pub fn record_queued(&self) -> u64 {
        self.update(|c| {
            c.queued += 1;
            c.queued
        })
    }

    /// Count a started job; returns `(started, queued)`.
    pub fn record_started(&self) -> (u64, u64) {
        self.update(|c| {
            c.started += 1;
            (c.started, c.queued)
        })
    }

    /// Count a finished job; returns `(finished, queued)`.
    pub fn record_finished(&self) -> (u64, u64) {
        self.update(|c| {
            c.finished += 1;
            (c.finished, c.queued)
        })
    }

    pub fn record_failed(&self) -> u64 {
        self.update(|c| {
            c.failed += 1;
            c.failed
        })
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        self.update(|c| *c)
    }

    fn update<T>(&self, f: impl FnOnce(&mut CountersSnapshot) -> T) -> T {
        // A poisoned lock still holds valid counts.
        let mut guard = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}
