//! Connection registry backing lock migration and recovery.
//!
//! The registry tracks, per connection, the opaque continuity token the
//! session layer registered and whether the connection has been reported
//! lost. The engine consults it when a "connection replaced" event
//! arrives (a live reconfiguration or reconnect of the owning client)
//! and when sweeping connections whose grace period expired.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::types::{ConnectionId, ContinuityToken, LockError};

/// Registered state of one connection.
#[derive(Clone, Debug)]
struct ConnState {
    token: ContinuityToken,
    lost_at: Option<Instant>,
}

/// Tracks connection identities, continuity tokens, and loss deadlines.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, ConnState>,
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection with its continuity token. Re-registering
    /// overwrites the token and clears any pending loss state.
    pub fn register(&mut self, conn: ConnectionId, token: ContinuityToken) {
        self.connections.insert(
            conn,
            ConnState {
                token,
                lost_at: None,
            },
        );
    }

    /// Removes a connection entirely (closed, purged, or superseded).
    pub fn deregister(&mut self, conn: ConnectionId) {
        self.connections.remove(&conn);
    }

    /// Whether the connection is known.
    pub fn is_registered(&self, conn: ConnectionId) -> bool {
        self.connections.contains_key(&conn)
    }

    /// Marks a connection lost as of `now`, starting its grace period.
    /// Unknown connections are ignored.
    pub fn mark_lost(&mut self, conn: ConnectionId, now: Instant) {
        if let Some(state) = self.connections.get_mut(&conn) {
            state.lost_at.get_or_insert(now);
        }
    }

    /// Validates a continuity proof for replacing `old` with `new`.
    ///
    /// The proof must match the token registered for `old` byte-wise. On
    /// success `old` is deregistered and `new` inherits the token.
    pub fn validate_replacement(
        &mut self,
        old: ConnectionId,
        new: ConnectionId,
        proof: &ContinuityToken,
    ) -> Result<(), LockError> {
        let state = self
            .connections
            .get(&old)
            .ok_or(LockError::Rejected("unknown connection"))?;
        if state.token != *proof {
            return Err(LockError::Rejected("continuity token mismatch"));
        }
        let token = state.token.clone();
        self.connections.remove(&old);
        self.register(new, token);
        Ok(())
    }

    /// Connections whose grace period has elapsed as of `now`. The
    /// caller purges their locks and then deregisters them.
    pub fn expired(&self, now: Instant, grace: Duration) -> Vec<ConnectionId> {
        self.connections
            .iter()
            .filter_map(|(conn, state)| match state.lost_at {
                Some(lost) if now.duration_since(lost) >= grace => Some(*conn),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(b: u8) -> ContinuityToken {
        ContinuityToken::new(vec![b; 16])
    }

    #[test]
    fn test_register_and_lookup() {
        let mut reg = ConnectionRegistry::new();
        reg.register(ConnectionId::new(1), token(0xaa));
        assert!(reg.is_registered(ConnectionId::new(1)));
        assert!(!reg.is_registered(ConnectionId::new(2)));
    }

    #[test]
    fn test_replacement_with_matching_proof() {
        let mut reg = ConnectionRegistry::new();
        reg.register(ConnectionId::new(1), token(0xaa));

        reg.validate_replacement(ConnectionId::new(1), ConnectionId::new(2), &token(0xaa))
            .unwrap();
        assert!(!reg.is_registered(ConnectionId::new(1)));
        assert!(reg.is_registered(ConnectionId::new(2)));
    }

    #[test]
    fn test_replacement_token_mismatch_rejected() {
        let mut reg = ConnectionRegistry::new();
        reg.register(ConnectionId::new(1), token(0xaa));

        match reg.validate_replacement(ConnectionId::new(1), ConnectionId::new(2), &token(0xbb)) {
            Err(LockError::Rejected(_)) => {}
            other => panic!("expected Rejected, got {:?}", other),
        }
        assert!(reg.is_registered(ConnectionId::new(1)));
    }

    #[test]
    fn test_replacement_unknown_connection_rejected() {
        let mut reg = ConnectionRegistry::new();
        match reg.validate_replacement(ConnectionId::new(7), ConnectionId::new(8), &token(1)) {
            Err(LockError::Rejected(_)) => {}
            other => panic!("expected Rejected, got {:?}", other),
        }
    }

    #[test]
    fn test_grace_period_expiry() {
        let mut reg = ConnectionRegistry::new();
        let t0 = Instant::now();
        reg.register(ConnectionId::new(1), token(1));
        reg.register(ConnectionId::new(2), token(2));
        reg.mark_lost(ConnectionId::new(1), t0);

        let grace = Duration::from_secs(30);
        assert!(reg.expired(t0 + Duration::from_secs(10), grace).is_empty());
        assert_eq!(
            reg.expired(t0 + Duration::from_secs(30), grace),
            vec![ConnectionId::new(1)]
        );
    }

    #[test]
    fn test_mark_lost_keeps_first_deadline() {
        let mut reg = ConnectionRegistry::new();
        let t0 = Instant::now();
        reg.register(ConnectionId::new(1), token(1));
        reg.mark_lost(ConnectionId::new(1), t0);
        // A second loss report must not extend the grace period.
        reg.mark_lost(ConnectionId::new(1), t0 + Duration::from_secs(20));
        let grace = Duration::from_secs(30);
        assert_eq!(
            reg.expired(t0 + Duration::from_secs(30), grace),
            vec![ConnectionId::new(1)]
        );
    }

    #[test]
    fn test_replacement_clears_loss_state() {
        let mut reg = ConnectionRegistry::new();
        let t0 = Instant::now();
        reg.register(ConnectionId::new(1), token(1));
        reg.mark_lost(ConnectionId::new(1), t0);
        reg.validate_replacement(ConnectionId::new(1), ConnectionId::new(2), &token(1))
            .unwrap();
        assert!(reg
            .expired(t0 + Duration::from_secs(3600), Duration::from_secs(30))
            .is_empty());
    }
}
