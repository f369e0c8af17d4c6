//! Lock manager metrics collector.
//!
//! Counts grant/deny/block/cancel outcomes and migration activity for
//! monitoring. Counters are monotonically increasing atomics; a snapshot
//! can be scraped at any time without stalling request paths.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for lock manager activity.
#[derive(Default)]
pub struct LockMetrics {
    granted: AtomicU64,
    denied: AtomicU64,
    blocked: AtomicU64,
    cancelled: AtomicU64,
    unlocked: AtomicU64,
    invalid: AtomicU64,
    purged: AtomicU64,
    migrated: AtomicU64,
}

/// Point-in-time copy of all counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Requests granted, immediately or after blocking.
    pub granted: u64,
    /// Non-blocking requests denied with WouldBlock.
    pub denied: u64,
    /// Requests that entered the blocked queue.
    pub blocked: u64,
    /// Blocked requests cancelled before grant.
    pub cancelled: u64,
    /// Unlock operations processed.
    pub unlocked: u64,
    /// Requests rejected for malformed ranges.
    pub invalid: u64,
    /// Records purged on connection close or grace expiry.
    pub purged: u64,
    /// Records re-owned across a connection replacement.
    pub migrated: u64,
}

impl LockMetrics {
    /// Creates a zeroed metrics collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an immediate or eventual grant.
    pub fn record_granted(&self) {
        self.granted.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a WouldBlock denial.
    pub fn record_denied(&self) {
        self.denied.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a request entering the blocked queue.
    pub fn record_blocked(&self) {
        self.blocked.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a cancelled blocked request.
    pub fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an unlock operation.
    pub fn record_unlocked(&self) {
        self.unlocked.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an InvalidRange rejection.
    pub fn record_invalid(&self) {
        self.invalid.fetch_add(1, Ordering::Relaxed);
    }

    /// Records `n` purged lock records.
    pub fn record_purged(&self, n: u64) {
        self.purged.fetch_add(n, Ordering::Relaxed);
    }

    /// Records `n` migrated lock records.
    pub fn record_migrated(&self, n: u64) {
        self.migrated.fetch_add(n, Ordering::Relaxed);
    }

    /// Copies out all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            granted: self.granted.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            unlocked: self.unlocked.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
            purged: self.purged.load(Ordering::Relaxed),
            migrated: self.migrated.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_start_at_zero() {
        let m = LockMetrics::new();
        let s = m.snapshot();
        assert_eq!(s.granted, 0);
        assert_eq!(s.denied, 0);
        assert_eq!(s.purged, 0);
    }

    #[test]
    fn test_counters_accumulate() {
        let m = LockMetrics::new();
        m.record_granted();
        m.record_granted();
        m.record_denied();
        m.record_blocked();
        m.record_cancelled();
        m.record_unlocked();
        m.record_invalid();
        m.record_purged(3);
        m.record_migrated(2);

        let s = m.snapshot();
        assert_eq!(s.granted, 2);
        assert_eq!(s.denied, 1);
        assert_eq!(s.blocked, 1);
        assert_eq!(s.cancelled, 1);
        assert_eq!(s.unlocked, 1);
        assert_eq!(s.invalid, 1);
        assert_eq!(s.purged, 3);
        assert_eq!(s.migrated, 2);
    }
}
