//! Core identifier types, configuration, and error taxonomy for the lock
//! manager.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable, opaque identity of a locked file.
///
/// The lock manager never creates or destroys files; callers resolve a
/// path or handle to a `FileKey` through the metadata service and hand it
/// in with every request.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileKey(uuid::Uuid);

impl FileKey {
    /// Creates a FileKey from an existing file identity.
    pub fn new(id: uuid::Uuid) -> Self {
        FileKey(id)
    }

    /// Generates a fresh random FileKey.
    pub fn random() -> Self {
        FileKey(uuid::Uuid::new_v4())
    }

    /// Returns the underlying uuid.
    pub fn as_uuid(&self) -> uuid::Uuid {
        self.0
    }
}

impl fmt::Display for FileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The logical holder of a lock.
///
/// Equality is over the whole (pid, token) pair, so two threads or
/// connections sharing a pid but carrying distinct owner tokens are
/// distinct owners. All policy logic needs only equality and hashing,
/// never owner-specific behavior.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerId {
    /// Client process id, as reported in `struct flock.l_pid`.
    pub pid: u32,
    /// Opaque lock-owner cookie supplied by the session layer.
    pub token: u64,
}

impl OwnerId {
    /// Creates an OwnerId from a pid and an owner cookie.
    pub fn new(pid: u32, token: u64) -> Self {
        OwnerId { pid, token }
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:#x}", self.pid, self.token)
    }
}

/// Identifies the transport connection a lock request arrived on.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Creates a new ConnectionId from a raw u64 value.
    pub fn new(id: u64) -> Self {
        ConnectionId(id)
    }

    /// Returns the raw u64 value of this connection ID.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque token asserting that a new connection represents the same
/// logical client as a prior one.
///
/// The session layer mints it; the lock manager only compares it
/// byte-wise during [`notify_connection_replaced`] and never inspects
/// its structure.
///
/// [`notify_connection_replaced`]: crate::engine::LockManager::notify_connection_replaced
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuityToken(Vec<u8>);

impl ContinuityToken {
    /// Wraps raw token bytes.
    pub fn new(bytes: Vec<u8>) -> Self {
        ContinuityToken(bytes)
    }

    /// Returns the raw token bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Configuration for the lock manager.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// How long after a connection is reported lost its locks are kept
    /// waiting for a continuity proof before being purged.
    pub grace_period_ms: u64,
    /// Master switch for mandatory-mode enforcement. When false,
    /// per-file mandatory flags are ignored and data operations are
    /// never checked against the lock table.
    pub mandatory_enabled: bool,
    /// Upper bound on queued blocked requests per file. Requests beyond
    /// the cap are denied with `WouldBlock` instead of queued.
    pub max_pending_per_file: usize,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 30_000,
            mandatory_enabled: false,
            max_pending_per_file: 1024,
        }
    }
}

/// Error taxonomy for lock operations.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Zero-length or overflowing byte range. Rejected locally, never
    /// retried automatically.
    #[error("invalid byte range: {0}")]
    InvalidRange(&'static str),

    /// A non-blocking request conflicts with an existing lock. Maps to
    /// the POSIX EAGAIN outcome; the caller decides retry policy.
    #[error("lock request would block")]
    WouldBlock,

    /// A blocked request was aborted by timeout or disconnect before it
    /// could be granted. Maps to the POSIX EINTR-style outcome.
    #[error("blocked lock request cancelled: {0}")]
    Cancelled(&'static str),

    /// A connection-replacement proof did not match the registered
    /// continuity token, or the old connection is unknown.
    #[error("connection replacement rejected: {0}")]
    Rejected(&'static str),

    /// Lock table corruption detected. Fatal for the affected file's
    /// table; indicates a logic bug, not caller misuse.
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl LockError {
    /// Shorthand for an internal invariant failure.
    pub fn internal(msg: impl Into<String>) -> Self {
        LockError::Internal(msg.into())
    }
}
