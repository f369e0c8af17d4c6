//! Per-file lock table: the ordered set of granted records plus the FIFO
//! queue of blocked requests.
//!
//! The table implements the fcntl overlap algebra: cross-owner conflict
//! detection, same-owner replace/merge on grant, and split on partial
//! unlock. One table exists per [`FileKey`]; all mutations run under the
//! single mutex the engine wraps around it.

use std::collections::VecDeque;

use tokio::sync::oneshot;

use crate::range::ByteRange;
use crate::record::{LockKind, LockRecord, LockState};
use crate::types::{ConnectionId, FileKey, LockError, OwnerId};

/// Outcome delivered to a parked blocked request.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum WaitOutcome {
    /// The lock was granted and, for lock requests, installed. Carries
    /// the owner's granted records that overlapped the request just
    /// before install, so a requester whose future was dropped without
    /// observing the grant can restore the table to its pre-grant state.
    Granted(Vec<LockRecord>),
    /// The request was removed from the queue without being granted.
    Cancelled(&'static str),
}

/// A queued blocked request and its wait channel.
pub(crate) struct Waiter {
    pub(crate) id: u64,
    pub(crate) record: LockRecord,
    /// Lock requests install a record on grant; mandatory-mode I/O
    /// probes only wait for the range to clear.
    pub(crate) installs: bool,
    pub(crate) tx: oneshot::Sender<WaitOutcome>,
}

/// Per-file collection of granted and pending byte-range locks.
pub struct LockTable {
    file: FileKey,
    /// Granted records, ordered by range start for overlap scans.
    granted: Vec<LockRecord>,
    /// Blocked requests in FIFO arrival order.
    waiters: VecDeque<Waiter>,
    /// Mandatory-locking policy flag for this file.
    mandatory: bool,
    next_waiter_id: u64,
}

impl LockTable {
    /// Creates an empty table for `file`.
    pub fn new(file: FileKey) -> Self {
        LockTable {
            file,
            granted: Vec::new(),
            waiters: VecDeque::new(),
            mandatory: false,
            next_waiter_id: 1,
        }
    }

    /// The file this table belongs to.
    pub fn file(&self) -> FileKey {
        self.file
    }

    /// True when the table holds no state worth keeping: no granted
    /// records, no waiters, mandatory flag clear.
    pub fn is_empty(&self) -> bool {
        self.granted.is_empty() && self.waiters.is_empty() && !self.mandatory
    }

    /// Sets the per-file mandatory-locking flag.
    pub fn set_mandatory(&mut self, on: bool) {
        self.mandatory = on;
    }

    /// Whether mandatory locking is flagged for this file.
    pub fn mandatory(&self) -> bool {
        self.mandatory
    }

    /// Number of granted records.
    pub fn granted_count(&self) -> usize {
        self.granted.len()
    }

    /// Number of queued blocked requests.
    pub fn pending_count(&self) -> usize {
        self.waiters.len()
    }

    /// First granted record from a different owner that conflicts with
    /// the request. Same-owner records never conflict; Read conflicts
    /// only with Write; Unlock conflicts with nothing.
    pub fn first_conflict(
        &self,
        owner: OwnerId,
        kind: LockKind,
        range: &ByteRange,
    ) -> Option<&LockRecord> {
        if kind == LockKind::Unlock {
            return None;
        }
        self.granted
            .iter()
            .find(|rec| rec.owner != owner && rec.range.overlaps(range) && kind.conflicts_with(rec.kind))
    }

    /// All conflicting granted records for the request, in range order.
    pub fn conflicts(&self, owner: OwnerId, kind: LockKind, range: &ByteRange) -> Vec<LockRecord> {
        if kind == LockKind::Unlock {
            return Vec::new();
        }
        self.granted
            .iter()
            .filter(|rec| {
                rec.owner != owner && rec.range.overlaps(range) && kind.conflicts_with(rec.kind)
            })
            .cloned()
            .collect()
    }

    /// True when the request conflicts with no granted record.
    pub fn grantable(&self, owner: OwnerId, kind: LockKind, range: &ByteRange) -> bool {
        self.first_conflict(owner, kind, range).is_none()
    }

    /// True if `owner` already holds a granted record overlapping the
    /// range. Such a request rewrites the owner's own coverage
    /// (upgrade, downgrade, extension) rather than competing for free
    /// bytes, so it is exempt from the queued-conflict barrier: barring
    /// it would make an owner's locks conflict with themselves and
    /// deadlock against a waiter that is itself blocked on this owner.
    pub fn holds_overlapping(&self, owner: OwnerId, range: &ByteRange) -> bool {
        self.granted
            .iter()
            .any(|rec| rec.owner == owner && rec.range.overlaps(range))
    }

    /// True when a queued blocked request from another owner conflicts
    /// with the range. Fresh requests must not overtake such waiters, or
    /// a stream of readers could starve a blocked writer.
    pub fn has_queued_conflict(&self, owner: OwnerId, kind: LockKind, range: &ByteRange) -> bool {
        if kind == LockKind::Unlock {
            return false;
        }
        self.waiters.iter().any(|w| {
            w.record.owner != owner
                && w.record.range.overlaps(range)
                && kind.conflicts_with(w.record.kind)
        })
    }

    /// GETLK: first conflicting record a hypothetical lock of this
    /// owner/kind/range would hit, or `None`.
    pub fn get_lock_info(
        &self,
        owner: OwnerId,
        kind: LockKind,
        range: &ByteRange,
    ) -> Option<LockRecord> {
        self.first_conflict(owner, kind, range).cloned()
    }

    /// Installs a record, replacing whatever the same owner already held
    /// over the range and coalescing touching same-kind records.
    ///
    /// An `Unlock` record runs the subtract pass only: it narrows or
    /// splits the owner's overlapping records and installs nothing.
    /// Cross-owner conflicts must have been ruled out by the caller; the
    /// safety invariant is re-checked before returning.
    pub fn insert_or_merge(&mut self, rec: LockRecord) -> Result<(), LockError> {
        // Replace pass: subtract the request range from every record the
        // same owner holds over it. Pieces keep their original kind, so
        // an upgrade/downgrade rewrites exactly the overlapped region.
        let mut replaced = Vec::new();
        let mut i = 0;
        while i < self.granted.len() {
            if self.granted[i].owner == rec.owner && self.granted[i].range.overlaps(&rec.range) {
                let old = self.granted.remove(i);
                for part in old.range.subtract(&rec.range) {
                    replaced.push(old.with_range(part));
                }
            } else {
                i += 1;
            }
        }
        self.granted.extend(replaced);

        if rec.kind != LockKind::Unlock {
            // Merge pass: grow the new record over touching same-owner
            // same-kind neighbors until it stops touching any.
            let mut merged = LockRecord {
                state: LockState::Granted,
                ..rec
            };
            loop {
                let hit = self.granted.iter().position(|g| {
                    g.owner == merged.owner
                        && g.kind == merged.kind
                        && g.range.touches(&merged.range)
                });
                match hit {
                    Some(idx) => {
                        let neighbor = self.granted.remove(idx);
                        merged.range = merged.range.span(&neighbor.range);
                    }
                    None => break,
                }
            }
            self.granted.push(merged);
        }

        self.granted.sort_by_key(|r| r.range.start());
        self.verify()
    }

    /// Releases the owner's locks over `range`, splitting records that
    /// straddle it. A range the owner does not hold is a no-op success,
    /// per fcntl semantics.
    pub fn remove_range(&mut self, owner: OwnerId, range: &ByteRange) -> Result<(), LockError> {
        let unlock = LockRecord {
            file: self.file,
            owner,
            kind: LockKind::Unlock,
            range: *range,
            connection: ConnectionId::new(0),
            state: LockState::Granted,
        };
        self.insert_or_merge(unlock)
    }

    /// Snapshot of all records, granted first, then pending in queue
    /// order.
    pub fn locks_on(&self) -> Vec<LockRecord> {
        let mut out = self.granted.clone();
        out.extend(self.waiters.iter().map(|w| LockRecord {
            state: LockState::Pending,
            ..w.record.clone()
        }));
        out
    }

    /// Queues a blocked request and returns its waiter id.
    pub(crate) fn push_waiter(
        &mut self,
        record: LockRecord,
        installs: bool,
        tx: oneshot::Sender<WaitOutcome>,
    ) -> u64 {
        let id = self.next_waiter_id;
        self.next_waiter_id += 1;
        self.waiters.push_back(Waiter {
            id,
            record: LockRecord {
                state: LockState::Pending,
                ..record
            },
            installs,
            tx,
        });
        id
    }

    /// Removes a queued request by id without granting it. Returns true
    /// if the waiter was still queued.
    pub(crate) fn remove_waiter(&mut self, id: u64) -> bool {
        match self.waiters.iter().position(|w| w.id == id) {
            Some(idx) => {
                self.waiters.remove(idx);
                true
            }
            None => false,
        }
    }

    /// FIFO grant pass over the blocked queue.
    ///
    /// Scans front to back; a waiter is granted only when it conflicts
    /// with neither the granted set nor an earlier waiter still blocked
    /// in this pass, preserving arrival order per contended region. A
    /// grant whose receiver has gone away is skipped without mutating
    /// the table.
    pub(crate) fn wake(&mut self) -> Result<usize, LockError> {
        let mut still_blocked: Vec<(OwnerId, LockKind, ByteRange)> = Vec::new();
        let mut woken = 0;
        let mut i = 0;
        while i < self.waiters.len() {
            let (owner, kind, range) = {
                let w = &self.waiters[i];
                (w.record.owner, w.record.kind, w.record.range)
            };
            let blocked_by_granted = self.first_conflict(owner, kind, &range).is_some();
            let blocked_by_earlier = still_blocked.iter().any(|(o, k, r)| {
                *o != owner && r.overlaps(&range) && k.conflicts_with(kind)
            });
            if blocked_by_granted || blocked_by_earlier {
                still_blocked.push((owner, kind, range));
                i += 1;
                continue;
            }
            let waiter = self
                .waiters
                .remove(i)
                .ok_or_else(|| LockError::internal("waiter index out of bounds"))?;
            let preimage: Vec<LockRecord> = if waiter.installs {
                self.granted
                    .iter()
                    .filter(|g| {
                        g.owner == waiter.record.owner && g.range.overlaps(&waiter.record.range)
                    })
                    .cloned()
                    .collect()
            } else {
                Vec::new()
            };
            if waiter.tx.send(WaitOutcome::Granted(preimage)).is_ok() {
                if waiter.installs {
                    self.insert_or_merge(LockRecord {
                        state: LockState::Granted,
                        ..waiter.record
                    })?;
                }
                woken += 1;
            } else {
                tracing::debug!(
                    file = %self.file,
                    waiter = waiter.id,
                    "blocked requester went away before grant"
                );
            }
        }
        Ok(woken)
    }

    /// Drops all granted records held through `conn`. Returns the number
    /// removed.
    pub(crate) fn purge_connection(&mut self, conn: ConnectionId) -> usize {
        let before = self.granted.len();
        self.granted.retain(|rec| rec.connection != conn);
        before - self.granted.len()
    }

    /// Cancels queued requests that arrived on `conn`.
    pub(crate) fn cancel_waiters_for_connection(
        &mut self,
        conn: ConnectionId,
        reason: &'static str,
    ) -> usize {
        let mut cancelled = 0;
        let mut i = 0;
        while i < self.waiters.len() {
            if self.waiters[i].record.connection == conn {
                if let Some(w) = self.waiters.remove(i) {
                    let _ = w.tx.send(WaitOutcome::Cancelled(reason));
                    cancelled += 1;
                }
            } else {
                i += 1;
            }
        }
        cancelled
    }

    /// Rewrites the connection id on every record and waiter owned
    /// through `old`. No conflict re-check: the locks' validity was
    /// already established and the client is the same logical actor.
    pub(crate) fn reown_connection(&mut self, old: ConnectionId, new: ConnectionId) -> usize {
        let mut moved = 0;
        for rec in &mut self.granted {
            if rec.connection == old {
                rec.connection = new;
                moved += 1;
            }
        }
        for w in &mut self.waiters {
            if w.record.connection == old {
                w.record.connection = new;
                moved += 1;
            }
        }
        moved
    }

    /// Re-checks the core safety invariant after a mutation. A violation
    /// is a logic bug: the table is cleared, every waiter cancelled, and
    /// the error surfaced to the caller.
    fn verify(&mut self) -> Result<(), LockError> {
        for (i, a) in self.granted.iter().enumerate() {
            for b in &self.granted[i + 1..] {
                if !a.range.overlaps(&b.range) {
                    continue;
                }
                let broken = if a.owner == b.owner {
                    // Same-owner overlap means replace/merge failed.
                    true
                } else {
                    a.kind == LockKind::Write || b.kind == LockKind::Write
                };
                if broken {
                    let msg = format!(
                        "lock table for {} corrupt: {:?} {} by {} overlaps {:?} {} by {}",
                        self.file, a.kind, a.range, a.owner, b.kind, b.range, b.owner
                    );
                    tracing::error!(file = %self.file, "{msg}");
                    self.granted.clear();
                    while let Some(w) = self.waiters.pop_front() {
                        let _ = w.tx.send(WaitOutcome::Cancelled("lock table aborted"));
                    }
                    return Err(LockError::internal(msg));
                }
            }
        }
        Ok(())
    }
}
