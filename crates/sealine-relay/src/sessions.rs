use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use sealine_types::error::RelayError;

/// Coarse session health as visible to the server. The server never holds
/// ratchet material; it only knows whether the pair is usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionHealth {
    Active,
    OutOfSync,
}

#[derive(Debug, Clone)]
pub struct SessionState {
    pub last_sent_seq: u64,
    pub last_acked_seq: u64,
    pub health: SessionHealth,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            last_sent_seq: 0,
            last_acked_seq: 0,
            health: SessionHealth::Active,
        }
    }
}

/// Per-(sender, recipient) session bookkeeping, in memory. After a restart
/// senders see `SessionMissing` and re-bootstrap through a bundle fetch,
/// which is the protocol's own recovery path.
///
/// One entry per directed pair ever established, never evicted; a few
/// machine words each, so a sweep would only matter at millions of pairs.
#[derive(Clone, Default)]
pub struct SessionStore {
    inner: Arc<RwLock<HashMap<(Uuid, Uuid), SessionState>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent pre-send check. Absent session means the sender has not
    /// fetched a bundle yet; an out-of-sync session rejects sends until
    /// re-established.
    pub async fn ensure(&self, local: Uuid, remote: Uuid) -> Result<(), RelayError> {
        let sessions = self.inner.read().await;
        match sessions.get(&(local, remote)) {
            None => Err(RelayError::SessionMissing(remote)),
            Some(s) if s.health == SessionHealth::OutOfSync => {
                Err(RelayError::SessionDesync(remote))
            }
            Some(_) => Ok(()),
        }
    }

    /// Create or reset the session to Active. Called on a successful bundle
    /// fetch; counters survive re-establishment so desync detection keeps
    /// its history.
    pub async fn establish(&self, local: Uuid, remote: Uuid) {
        let mut sessions = self.inner.write().await;
        let state = sessions.entry((local, remote)).or_default();
        state.health = SessionHealth::Active;
    }

    /// Record an outgoing stamp. The sequencer only moves forward, so a
    /// stamp at or below the last one means the pair state is corrupt:
    /// flag it and reject.
    pub async fn record_send(&self, local: Uuid, remote: Uuid, seq: u64) -> Result<(), RelayError> {
        let mut sessions = self.inner.write().await;
        let state = sessions
            .get_mut(&(local, remote))
            .ok_or(RelayError::SessionMissing(remote))?;
        if state.health == SessionHealth::OutOfSync {
            return Err(RelayError::SessionDesync(remote));
        }
        if seq <= state.last_sent_seq {
            state.health = SessionHealth::OutOfSync;
            return Err(RelayError::SessionDesync(remote));
        }
        state.last_sent_seq = seq;
        Ok(())
    }

    /// Flag a pair out of sync (e.g. an ack referenced an envelope id that
    /// was never issued). Subsequent sends fail until `establish`.
    pub async fn flag_desync(&self, local: Uuid, remote: Uuid) {
        let mut sessions = self.inner.write().await;
        let state = sessions.entry((local, remote)).or_default();
        state.health = SessionHealth::OutOfSync;
    }

    /// Advance the acked counter, monotonically.
    pub async fn advance_acked(&self, local: Uuid, remote: Uuid, envelope_id: u64) {
        let mut sessions = self.inner.write().await;
        if let Some(state) = sessions.get_mut(&(local, remote)) {
            state.last_acked_seq = state.last_acked_seq.max(envelope_id);
        }
    }

    pub async fn health(&self, local: Uuid, remote: Uuid) -> Option<SessionHealth> {
        self.inner.read().await.get(&(local, remote)).map(|s| s.health)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_requires_established_session() {
        let store = SessionStore::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        assert!(matches!(
            store.ensure(a, b).await,
            Err(RelayError::SessionMissing(_))
        ));

        store.establish(a, b).await;
        assert!(store.ensure(a, b).await.is_ok());
        // Directional: b -> a still needs its own bundle fetch.
        assert!(store.ensure(b, a).await.is_err());
    }

    #[tokio::test]
    async fn backward_stamp_flags_pair() {
        let store = SessionStore::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        store.establish(a, b).await;

        store.record_send(a, b, 5).await.unwrap();
        assert!(matches!(
            store.record_send(a, b, 5).await,
            Err(RelayError::SessionDesync(_))
        ));
        assert_eq!(store.health(a, b).await, Some(SessionHealth::OutOfSync));
        // Stays rejected until re-established.
        assert!(store.ensure(a, b).await.is_err());
        store.establish(a, b).await;
        assert!(store.ensure(a, b).await.is_ok());
        store.record_send(a, b, 6).await.unwrap();
    }

    #[tokio::test]
    async fn acked_counter_is_monotonic() {
        let store = SessionStore::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        store.establish(a, b).await;
        store.advance_acked(a, b, 4).await;
        store.advance_acked(a, b, 2).await;
        let sessions = store.inner.read().await;
        assert_eq!(sessions[&(a, b)].last_acked_seq, 4);
    }
}
