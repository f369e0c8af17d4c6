//! Shared helpers for lock manager integration tests.

use weldfs_locks::engine::{LockManager, LockRequest};
use weldfs_locks::range::ByteRange;
use weldfs_locks::record::{LockKind, LockRecord, LockState};
use weldfs_locks::types::{ConnectionId, FileKey, LockConfig, OwnerId};

pub fn manager() -> LockManager {
    init_tracing();
    LockManager::new(LockConfig::default())
}

/// Installs a test subscriber once so failures print the engine's debug
/// events alongside the assertion output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub fn owner(n: u64) -> OwnerId {
    OwnerId::new(n as u32, n)
}

pub fn conn(n: u64) -> ConnectionId {
    ConnectionId::new(n)
}

pub fn range(start: u64, len: u64) -> ByteRange {
    ByteRange::new(start, len).unwrap()
}

pub fn req(file: FileKey, n: u64, kind: LockKind, start: u64, len: u64) -> LockRequest {
    LockRequest::new(file, owner(n), conn(n), kind, range(start, len))
}

/// Asserts the core safety invariant over a table snapshot: no two
/// granted records from different owners overlap when either is a write
/// lock, and no two granted records from the same owner overlap at all.
pub fn assert_safety(locks: &[LockRecord]) {
    let granted: Vec<&LockRecord> = locks
        .iter()
        .filter(|r| r.state == LockState::Granted)
        .collect();
    for (i, a) in granted.iter().enumerate() {
        for b in &granted[i + 1..] {
            if !a.range.overlaps(&b.range) {
                continue;
            }
            if a.owner == b.owner {
                panic!("same owner holds overlapping records: {:?} / {:?}", a, b);
            }
            assert!(
                a.kind != LockKind::Write && b.kind != LockKind::Write,
                "conflicting cross-owner overlap: {:?} / {:?}",
                a,
                b
            );
        }
    }
}
