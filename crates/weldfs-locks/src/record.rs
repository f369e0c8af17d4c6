//! Lock records: one granted or pending byte-range lock.

use crate::range::ByteRange;
use crate::types::{ConnectionId, FileKey, OwnerId};
use serde::{Deserialize, Serialize};

/// Kind of a lock request.
///
/// `Unlock` is a request kind only (the F_UNLCK path): it releases the
/// owner's locks over a range and is never stored in the table.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockKind {
    /// Shared lock; readers from any owner may overlap.
    Read,
    /// Exclusive lock; no cross-owner overlap of any kind.
    Write,
    /// Release request over a range.
    Unlock,
}

impl LockKind {
    /// True if a granted lock of `self` and one of `other`, held by
    /// different owners over overlapping ranges, cannot coexist.
    pub fn conflicts_with(&self, other: LockKind) -> bool {
        matches!(
            (self, other),
            (LockKind::Write, LockKind::Read)
                | (LockKind::Write, LockKind::Write)
                | (LockKind::Read, LockKind::Write)
        )
    }
}

/// Lifecycle state of a lock record.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockState {
    /// The lock is held.
    Granted,
    /// The request is queued behind a conflicting lock (SETLKW).
    Pending,
}

/// A single byte-range lock, granted or pending.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// File the lock applies to.
    pub file: FileKey,
    /// Logical holder of the lock.
    pub owner: OwnerId,
    /// Read or Write. Never `Unlock` for a stored record.
    pub kind: LockKind,
    /// Byte range covered.
    pub range: ByteRange,
    /// Connection the request arrived on; rewritten on migration.
    pub connection: ConnectionId,
    /// Granted or pending.
    pub state: LockState,
}

impl LockRecord {
    /// Creates a granted record.
    pub fn granted(
        file: FileKey,
        owner: OwnerId,
        kind: LockKind,
        range: ByteRange,
        connection: ConnectionId,
    ) -> Self {
        LockRecord {
            file,
            owner,
            kind,
            range,
            connection,
            state: LockState::Granted,
        }
    }

    /// Returns a copy of this record covering `range` instead, keeping
    /// owner, kind, and connection. Used when a partial unlock or a
    /// same-owner overwrite narrows or splits the record.
    pub fn with_range(&self, range: ByteRange) -> Self {
        LockRecord { range, ..self.clone() }
    }
}
