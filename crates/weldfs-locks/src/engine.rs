//! The lock manager: conflict resolution, blocking grants, mandatory-mode
//! I/O checks, and connection migration over the per-file lock tables.
//!
//! Tables are held in a sharded map keyed by [`FileKey`]; each table has
//! its own mutex and no operation ever takes two table mutexes at once,
//! so cross-file lock-ordering deadlocks cannot occur. Blocked requests
//! park on a oneshot wait channel and are woken by whatever operation
//! removes or downgrades the conflicting record; the table mutex is never
//! held across an await.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::metrics::{LockMetrics, MetricsSnapshot};
use crate::migrate::ConnectionRegistry;
use crate::range::ByteRange;
use crate::record::{LockKind, LockRecord};
use crate::table::{LockTable, WaitOutcome};
use crate::types::{ConnectionId, ContinuityToken, FileKey, LockConfig, LockError, OwnerId};

/// A lock operation as submitted by the RPC layer.
#[derive(Clone, Debug)]
pub struct LockRequest {
    /// File to lock.
    pub file: FileKey,
    /// Logical lock holder.
    pub owner: OwnerId,
    /// Connection the request arrived on.
    pub connection: ConnectionId,
    /// Read, Write, or Unlock.
    pub kind: LockKind,
    /// Byte range to cover.
    pub range: ByteRange,
}

impl LockRequest {
    /// Assembles a request.
    pub fn new(
        file: FileKey,
        owner: OwnerId,
        connection: ConnectionId,
        kind: LockKind,
        range: ByteRange,
    ) -> Self {
        LockRequest {
            file,
            owner,
            connection,
            kind,
            range,
        }
    }

    fn record(&self) -> LockRecord {
        LockRecord::granted(self.file, self.owner, self.kind, self.range, self.connection)
    }
}

/// A GETLK probe, and its reply.
///
/// On a non-conflicting probe the reply is the probe itself with the kind
/// switched to `Unlock`, every other field untouched, mirroring how
/// fcntl(2) leaves the caller's flock struct intact and only flips
/// `l_type` to `F_UNLCK`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockProbe {
    /// Owner the hypothetical lock would belong to.
    pub owner: OwnerId,
    /// Kind of the hypothetical lock (`Unlock` in a no-conflict reply).
    pub kind: LockKind,
    /// Range probed.
    pub range: ByteRange,
}

/// Data operation kind for mandatory-mode checks.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IoOp {
    /// A read of the range; conflicts with other owners' write locks.
    Read,
    /// A write of the range; conflicts with any other owner's lock.
    Write,
}

impl IoOp {
    /// The lock kind whose conflict rules this operation follows.
    fn as_kind(self) -> LockKind {
        match self {
            IoOp::Read => LockKind::Read,
            IoOp::Write => LockKind::Write,
        }
    }
}

/// Byte-range advisory lock manager for one storage node.
pub struct LockManager {
    config: LockConfig,
    tables: DashMap<FileKey, Arc<Mutex<LockTable>>>,
    registry: Mutex<ConnectionRegistry>,
    metrics: Arc<LockMetrics>,
}

impl LockManager {
    /// Creates a lock manager with the given configuration.
    pub fn new(config: LockConfig) -> Self {
        LockManager {
            config,
            tables: DashMap::new(),
            registry: Mutex::new(ConnectionRegistry::new()),
            metrics: Arc::new(LockMetrics::new()),
        }
    }

    /// Parses an fcntl-style `(start, length)` pair, counting malformed
    /// ranges. `length == 0` maps to a to-EOF range per `struct flock`.
    pub fn parse_range(&self, start: u64, length: u64) -> Result<ByteRange, LockError> {
        if length == 0 {
            return Ok(ByteRange::to_eof(start));
        }
        ByteRange::new(start, length).map_err(|e| {
            self.metrics.record_invalid();
            e
        })
    }

    /// Number of live per-file tables.
    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    /// Copies out the activity counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    fn slot(&self, file: FileKey) -> Arc<Mutex<LockTable>> {
        self.tables
            .entry(file)
            .or_insert_with(|| Arc::new(Mutex::new(LockTable::new(file))))
            .clone()
    }

    fn existing_slot(&self, file: FileKey) -> Option<Arc<Mutex<LockTable>>> {
        self.tables.get(&file).map(|entry| entry.value().clone())
    }

    /// Drops the table for `file` once it is empty and unshared. The
    /// strong-count check runs under the map's shard lock, so no caller
    /// can clone the Arc out concurrently with removal.
    fn maybe_gc(&self, file: FileKey) {
        self.tables.remove_if(&file, |_, slot| {
            Arc::strong_count(slot) == 1
                && slot.lock().map(|t| t.is_empty()).unwrap_or(false)
        });
    }

    fn locked<'a>(
        slot: &'a Arc<Mutex<LockTable>>,
    ) -> Result<std::sync::MutexGuard<'a, LockTable>, LockError> {
        slot.lock()
            .map_err(|_| LockError::internal("lock table mutex poisoned"))
    }

    /// SETLK: grants immediately or fails with `WouldBlock`.
    ///
    /// An `Unlock` request behaves as [`unlock`](Self::unlock). A fresh
    /// request that conflicts with a queued blocked request is denied
    /// even when the granted set alone would admit it, so queued writers
    /// cannot be starved by a stream of fresh readers. Requests over a
    /// range the owner already holds are exempt from that barrier: an
    /// owner's locks never conflict with themselves, they replace each
    /// other.
    pub fn try_lock(&self, req: &LockRequest) -> Result<(), LockError> {
        if req.kind == LockKind::Unlock {
            return self.unlock(req.file, req.owner, &req.range);
        }
        let slot = self.slot(req.file);
        {
            let mut t = Self::locked(&slot)?;
            // The queue barrier applies to fresh competitors only. An
            // owner rewriting a range it already holds must go through,
            // or its own granted lock would block it via the waiter it
            // is blocking.
            let barred = t.has_queued_conflict(req.owner, req.kind, &req.range)
                && !t.holds_overlapping(req.owner, &req.range);
            if !t.grantable(req.owner, req.kind, &req.range) || barred {
                self.metrics.record_denied();
                return Err(LockError::WouldBlock);
            }
            t.insert_or_merge(req.record())?;
            // A same-owner downgrade can make queued requests grantable.
            t.wake()?;
        }
        self.metrics.record_granted();
        tracing::debug!(file = %req.file, owner = %req.owner, kind = ?req.kind, range = %req.range, "lock granted");
        Ok(())
    }

    /// SETLKW: grants immediately when possible, otherwise parks until a
    /// conflicting record is removed or downgraded.
    ///
    /// Returns `Cancelled` if the request's connection is torn down
    /// first. Dropping the returned future deregisters the request; a
    /// grant that raced with the drop is rolled back.
    pub async fn lock(&self, req: &LockRequest) -> Result<(), LockError> {
        if req.kind == LockKind::Unlock {
            return self.unlock(req.file, req.owner, &req.range);
        }
        let slot = self.slot(req.file);
        let handle = {
            let mut t = Self::locked(&slot)?;
            let barred = t.has_queued_conflict(req.owner, req.kind, &req.range)
                && !t.holds_overlapping(req.owner, &req.range);
            if t.grantable(req.owner, req.kind, &req.range) && !barred {
                t.insert_or_merge(req.record())?;
                t.wake()?;
                self.metrics.record_granted();
                return Ok(());
            }
            if t.pending_count() >= self.config.max_pending_per_file {
                self.metrics.record_denied();
                return Err(LockError::WouldBlock);
            }
            let (tx, rx) = oneshot::channel();
            let id = t.push_waiter(req.record(), true, tx);
            self.metrics.record_blocked();
            tracing::debug!(file = %req.file, owner = %req.owner, range = %req.range, "lock request blocked");
            WaitHandle {
                mgr: self,
                file: req.file,
                owner: req.owner,
                range: req.range,
                id,
                installs: true,
                rx: Some(rx),
                completed: false,
            }
        };
        let outcome = handle.wait().await;
        if outcome.is_ok() {
            self.metrics.record_granted();
        }
        outcome
    }

    /// SETLKW with a deadline: `Cancelled` once `dur` elapses.
    pub async fn lock_with_timeout(
        &self,
        req: &LockRequest,
        dur: Duration,
    ) -> Result<(), LockError> {
        match tokio::time::timeout(dur, self.lock(req)).await {
            Ok(res) => res,
            Err(_) => Err(LockError::Cancelled("timed out")),
        }
    }

    /// Releases `owner`'s locks over `range` on `file`. Unlocking a
    /// range that is not held is a no-op success, per fcntl semantics.
    pub fn unlock(
        &self,
        file: FileKey,
        owner: OwnerId,
        range: &ByteRange,
    ) -> Result<(), LockError> {
        let Some(slot) = self.existing_slot(file) else {
            self.metrics.record_unlocked();
            return Ok(());
        };
        {
            let mut t = Self::locked(&slot)?;
            t.remove_range(owner, range)?;
            t.wake()?;
        }
        drop(slot);
        self.metrics.record_unlocked();
        self.maybe_gc(file);
        Ok(())
    }

    /// GETLK: the first granted record a lock described by `probe` would
    /// conflict with, or `None`.
    pub fn get_conflicting(
        &self,
        file: FileKey,
        probe: &LockProbe,
    ) -> Result<Option<LockRecord>, LockError> {
        match self.existing_slot(file) {
            None => Ok(None),
            Some(slot) => {
                let t = Self::locked(&slot)?;
                Ok(t.get_lock_info(probe.owner, probe.kind, &probe.range))
            }
        }
    }

    /// GETLK with the full fcntl reply convention: either the conflicting
    /// record's fields, or the probe echoed back with kind `Unlock`.
    pub fn getlk(&self, file: FileKey, probe: LockProbe) -> Result<LockProbe, LockError> {
        Ok(match self.get_conflicting(file, &probe)? {
            Some(conflict) => LockProbe {
                owner: conflict.owner,
                kind: conflict.kind,
                range: conflict.range,
            },
            None => LockProbe {
                kind: LockKind::Unlock,
                ..probe
            },
        })
    }

    /// Snapshot of all granted and pending records on `file`.
    pub fn locks_on(&self, file: FileKey) -> Vec<LockRecord> {
        match self.existing_slot(file) {
            None => Vec::new(),
            Some(slot) => slot.lock().map(|t| t.locks_on()).unwrap_or_default(),
        }
    }

    /// Flags or clears mandatory locking for `file`. Enforcement also
    /// requires `LockConfig::mandatory_enabled`.
    pub fn set_mandatory(&self, file: FileKey, on: bool) -> Result<(), LockError> {
        if on {
            let slot = self.slot(file);
            Self::locked(&slot)?.set_mandatory(true);
        } else if let Some(slot) = self.existing_slot(file) {
            Self::locked(&slot)?.set_mandatory(false);
            drop(slot);
            self.maybe_gc(file);
        }
        Ok(())
    }

    /// Non-blocking mandatory-mode check: treats the data operation as an
    /// implicit lock probe over the bytes it touches. Returns
    /// `WouldBlock` when another owner's lock forbids it. A no-op unless
    /// mandatory mode is enforced for the file.
    pub fn check_io(
        &self,
        file: FileKey,
        owner: OwnerId,
        op: IoOp,
        range: &ByteRange,
    ) -> Result<(), LockError> {
        if !self.config.mandatory_enabled {
            return Ok(());
        }
        let Some(slot) = self.existing_slot(file) else {
            return Ok(());
        };
        let t = Self::locked(&slot)?;
        if !t.mandatory() {
            return Ok(());
        }
        match t.first_conflict(owner, op.as_kind(), range) {
            Some(_) => Err(LockError::WouldBlock),
            None => Ok(()),
        }
    }

    /// Blocking mandatory-mode check: parks the data operation until the
    /// conflicting range clears. Installs no lock record.
    pub async fn wait_io(
        &self,
        file: FileKey,
        owner: OwnerId,
        connection: ConnectionId,
        op: IoOp,
        range: &ByteRange,
    ) -> Result<(), LockError> {
        if !self.config.mandatory_enabled {
            return Ok(());
        }
        let Some(slot) = self.existing_slot(file) else {
            return Ok(());
        };
        let handle = {
            let mut t = Self::locked(&slot)?;
            if !t.mandatory() || t.first_conflict(owner, op.as_kind(), range).is_none() {
                return Ok(());
            }
            if t.pending_count() >= self.config.max_pending_per_file {
                self.metrics.record_denied();
                return Err(LockError::WouldBlock);
            }
            let (tx, rx) = oneshot::channel();
            let record =
                LockRecord::granted(file, owner, op.as_kind(), *range, connection);
            let id = t.push_waiter(record, false, tx);
            self.metrics.record_blocked();
            WaitHandle {
                mgr: self,
                file,
                owner,
                range: *range,
                id,
                installs: false,
                rx: Some(rx),
                completed: false,
            }
        };
        handle.wait().await
    }

    /// Registers a connection and the continuity token the session layer
    /// minted for it.
    pub fn register_connection(
        &self,
        conn: ConnectionId,
        token: ContinuityToken,
    ) -> Result<(), LockError> {
        self.registry_mut()?.register(conn, token);
        Ok(())
    }

    /// Reports a connection lost, starting its grace period. Its locks
    /// survive until [`expire_lost_connections`](Self::expire_lost_connections)
    /// finds the grace period elapsed, or a replacement arrives first.
    pub fn notify_connection_lost(&self, conn: ConnectionId) -> Result<(), LockError> {
        self.registry_mut()?.mark_lost(conn, Instant::now());
        tracing::info!(connection = %conn, "connection lost, grace period started");
        Ok(())
    }

    /// Re-owns every lock of `old` to `new` after validating the
    /// continuity proof. Ranges and kinds are preserved exactly and no
    /// conflict re-check is performed. Returns the number of records and
    /// waiters re-owned.
    pub fn notify_connection_replaced(
        &self,
        old: ConnectionId,
        new: ConnectionId,
        proof: &ContinuityToken,
    ) -> Result<usize, LockError> {
        self.registry_mut()?.validate_replacement(old, new, proof)?;
        let mut moved = 0;
        for file in self.file_keys() {
            if let Some(slot) = self.existing_slot(file) {
                moved += Self::locked(&slot)?.reown_connection(old, new);
            }
        }
        self.metrics.record_migrated(moved as u64);
        tracing::info!(old = %old, new = %new, moved, "connection replaced, locks re-owned");
        Ok(moved)
    }

    /// Purges every lock and queued request of `conn` immediately, with
    /// no grace period. Returns the number of granted records dropped.
    pub fn notify_connection_closed(&self, conn: ConnectionId) -> Result<usize, LockError> {
        self.registry_mut()?.deregister(conn);
        let purged = self.purge(conn, "connection closed")?;
        tracing::info!(connection = %conn, purged, "connection closed, locks purged");
        Ok(purged)
    }

    /// Purges locks of every lost connection whose grace period elapsed
    /// as of `now`. Returns the number of connections purged.
    pub fn expire_lost_connections(&self, now: Instant) -> Result<usize, LockError> {
        let grace = Duration::from_millis(self.config.grace_period_ms);
        let expired = self.registry_mut()?.expired(now, grace);
        for conn in &expired {
            self.registry_mut()?.deregister(*conn);
            let purged = self.purge(*conn, "connection grace period expired")?;
            tracing::info!(connection = %conn, purged, "grace period expired, locks purged");
        }
        Ok(expired.len())
    }

    fn registry_mut(&self) -> Result<std::sync::MutexGuard<'_, ConnectionRegistry>, LockError> {
        self.registry
            .lock()
            .map_err(|_| LockError::internal("connection registry mutex poisoned"))
    }

    fn file_keys(&self) -> Vec<FileKey> {
        self.tables.iter().map(|entry| *entry.key()).collect()
    }

    fn purge(&self, conn: ConnectionId, reason: &'static str) -> Result<usize, LockError> {
        let mut purged = 0;
        for file in self.file_keys() {
            let Some(slot) = self.existing_slot(file) else {
                continue;
            };
            {
                let mut t = Self::locked(&slot)?;
                purged += t.purge_connection(conn);
                let cancelled = t.cancel_waiters_for_connection(conn, reason);
                for _ in 0..cancelled {
                    self.metrics.record_cancelled();
                }
                // Whatever this connection held may have been blocking
                // someone else.
                t.wake()?;
            }
            drop(slot);
            self.maybe_gc(file);
        }
        self.metrics.record_purged(purged as u64);
        Ok(purged)
    }
}

/// Parked blocked request. Dropping it before completion removes the
/// waiter from the queue; a grant that was already delivered but never
/// observed is rolled back so no orphaned lock survives.
struct WaitHandle<'a> {
    mgr: &'a LockManager,
    file: FileKey,
    owner: OwnerId,
    range: ByteRange,
    id: u64,
    installs: bool,
    rx: Option<oneshot::Receiver<WaitOutcome>>,
    completed: bool,
}

impl WaitHandle<'_> {
    async fn wait(mut self) -> Result<(), LockError> {
        // Awaiting through &mut keeps the receiver inside self so the
        // Drop impl can inspect it if this future is dropped mid-wait.
        let outcome = match self.rx.as_mut() {
            Some(rx) => rx.await,
            None => return Err(LockError::internal("wait channel missing")),
        };
        self.completed = true;
        match outcome {
            Ok(WaitOutcome::Granted(_)) => Ok(()),
            Ok(WaitOutcome::Cancelled(reason)) => {
                self.mgr.metrics.record_cancelled();
                Err(LockError::Cancelled(reason))
            }
            Err(_) => Err(LockError::internal("wait channel dropped by granter")),
        }
    }
}

impl Drop for WaitHandle<'_> {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        let Some(slot) = self.mgr.existing_slot(self.file) else {
            return;
        };
        if let Ok(mut t) = slot.lock() {
            if t.remove_waiter(self.id) {
                self.mgr.metrics.record_cancelled();
            } else if let Some(mut rx) = self.rx.take() {
                // Already dequeued: a grant may have raced the drop. Undo
                // it so the lock does not outlive its requester: strip
                // the granted range, then reinstall the coverage the
                // owner held before the grant, carried in the message.
                if let Ok(WaitOutcome::Granted(prior)) = rx.try_recv() {
                    if self.installs {
                        let _ = t.remove_range(self.owner, &self.range);
                        for rec in prior {
                            let _ = t.insert_or_merge(rec);
                        }
                        let _ = t.wake();
                    }
                }
            }
        }
        drop(slot);
        self.mgr.maybe_gc(self.file);
    }
}
