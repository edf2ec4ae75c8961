//! Run-level job accounting
//!
//! One [`Session`] spans a whole run, including every pass in loop mode.
//! Counters are atomics so workers update them without a lock.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Terminal outcome of one job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug)]
pub struct Session {
    started: Instant,
    dispatched: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    passes: AtomicU64,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            dispatched: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            passes: AtomicU64::new(0),
        }
    }

    /// A job was admitted to a worker and is about to start
    pub fn record_dispatch(&self) {
        self.dispatched.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record(&self, outcome: Outcome) {
        let counter = match outcome {
            Outcome::Succeeded => &self.succeeded,
            Outcome::Failed => &self.failed,
            Outcome::Cancelled => &self.cancelled,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_pass(&self) {
        self.passes.fetch_add(1, Ordering::SeqCst);
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::SeqCst)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn report(&self) -> SessionReport {
        let elapsed = self.elapsed();
        SessionReport {
            dispatched: self.dispatched.load(Ordering::SeqCst),
            succeeded: self.succeeded.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            cancelled: self.cancelled.load(Ordering::SeqCst),
            passes: self.passes.load(Ordering::SeqCst),
            elapsed_secs: elapsed.as_secs(),
            elapsed: format_elapsed(elapsed),
        }
    }
}

/// Point-in-time copy of a [`Session`]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionReport {
    pub dispatched: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub passes: u64,
    pub elapsed_secs: u64,
    /// `HH:MM:SS`
    pub elapsed: String,
}

impl SessionReport {
    /// Jobs that reached a terminal state
    pub fn finished(&self) -> u64 {
        self.succeeded + self.failed + self.cancelled
    }

    pub fn summary_line(&self) -> String {
        format!(
            "processed {} videos in {} ({} failed, {} cancelled)",
            self.succeeded, self.elapsed, self.failed, self.cancelled
        )
    }
}

/// Format a duration as `HH:MM:SS`; hours grow past two digits if needed.
pub fn format_elapsed(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    format!(
        "{:02}:{:02}:{:02}",
        total / 3600,
        (total % 3600) / 60,
        total % 60
    )
}
