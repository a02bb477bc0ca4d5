//! Scheduler tick source.
//!
//! The core never reads a hardware timer; the embedder advances the tick
//! counter from its clock interrupt (or a test advances it directly) and
//! calls into `sched_tick`/`sched_balance` at the appropriate cadence.

use core::sync::atomic::{AtomicU64, Ordering};

/// Scheduler tick frequency, ticks per second.
pub const HZ: u64 = 100;

/// Convert milliseconds to ticks, rounding up to at least one tick.
pub const fn mstohz(ms: u64) -> u64 {
    let t = ms * HZ / 1000;
    if t == 0 {
        1
    } else {
        t
    }
}

/// Convert ticks back to milliseconds.
pub const fn hztoms(ticks: u64) -> u64 {
    ticks * 1000 / HZ
}

pub struct Clock {
    ticks: AtomicU64,
}

impl Clock {
    pub(crate) fn new() -> Self {
        Self {
            ticks: AtomicU64::new(0),
        }
    }

    /// Current tick count since bring-up.
    pub fn current_ticks(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    /// Advance the clock by `n` ticks. Called by the embedder's timer path.
    pub fn advance(&self, n: u64) -> u64 {
        self.ticks.fetch_add(n, Ordering::Release) + n
    }
}
