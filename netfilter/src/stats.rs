//! Packet disposition counters

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct FilterStats {
    pub received: AtomicU64,
    pub sampled: AtomicU64,
    pub denied: AtomicU64,
    pub invalid: AtomicU64,
    pub rate_limited: AtomicU64,
    pub answered: AtomicU64,
    pub delivered: AtomicU64,
    pub stalls: AtomicU64,
}

impl FilterStats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            sampled: self.sampled.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            answered: self.answered.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            stalls: self.stalls.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub sampled: u64,
    pub denied: u64,
    pub invalid: u64,
    pub rate_limited: u64,
    pub answered: u64,
    pub delivered: u64,
    /// Receive iterations skipped because the accepted queue was full.
    pub stalls: u64,
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "received={} delivered={} answered={} denied={} invalid={} rate_limited={} sampled={} stalls={}",
            self.received,
            self.delivered,
            self.answered,
            self.denied,
            self.invalid,
            self.rate_limited,
            self.sampled,
            self.stalls
        )
    }
}
