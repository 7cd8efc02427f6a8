//! Mesh peer bookkeeping
//!
//! Tracks the set of live peer connections, enforces one record per
//! remote peer, and arbitrates the single automatic recovery attempt a
//! troubled connection gets before removal.

use super::connection::{PeerConnection, PeerConnectionState, PeerStateEvent};
use meshvoice_core::{Error, IceConfiguration, Result, TransportId, UserId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

/// What the session loop should do after a peer state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Nothing to do
    None,
    /// Re-offer to this peer. The attempt is consumed only when the
    /// re-offer is actually issued; a connection that self-heals first
    /// keeps it.
    Renegotiate,
    /// Attempt spent or state terminal; drop the peer
    Remove,
}

/// Owns all peer connections for one channel session.
pub struct PeerManager {
    peers: RwLock<HashMap<TransportId, Arc<PeerConnection>>>,
    ice: IceConfiguration,
    state_tx: mpsc::UnboundedSender<PeerStateEvent>,
}

impl PeerManager {
    /// Create a manager. Returns the receiver side of the peer state
    /// stream for the session loop to drive.
    pub fn new(
        ice: IceConfiguration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<PeerStateEvent>) {
        let (state_tx, state_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                peers: RwLock::new(HashMap::new()),
                ice,
                state_tx,
            }),
            state_rx,
        )
    }

    /// Create and register a connection for a remote peer.
    ///
    /// Rejects a second record for the same peer id; the existing
    /// connection must be removed before a new one is created.
    pub async fn create_peer(
        &self,
        peer_id: TransportId,
        user_id: UserId,
    ) -> Result<Arc<PeerConnection>> {
        {
            let peers = self.peers.read().await;
            if peers.contains_key(&peer_id) {
                return Err(Error::DuplicatePeer(peer_id));
            }
        }

        let connection = Arc::new(
            PeerConnection::new(
                peer_id.clone(),
                user_id,
                &self.ice,
                self.state_tx.clone(),
            )
            .await?,
        );

        let mut peers = self.peers.write().await;
        // A concurrent create may have won the race while the
        // connection was being built
        if peers.contains_key(&peer_id) {
            let _ = connection.close().await;
            return Err(Error::DuplicatePeer(peer_id));
        }

        info!(%peer_id, "peer registered");
        peers.insert(peer_id, Arc::clone(&connection));
        Ok(connection)
    }

    pub async fn get(&self, peer_id: &str) -> Option<Arc<PeerConnection>> {
        self.peers.read().await.get(peer_id).cloned()
    }

    pub async fn contains(&self, peer_id: &str) -> bool {
        self.peers.read().await.contains_key(peer_id)
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peer_ids(&self) -> Vec<TransportId> {
        self.peers.read().await.keys().cloned().collect()
    }

    /// Close and remove one peer. Returns the removed connection.
    pub async fn remove_peer(&self, peer_id: &str) -> Option<Arc<PeerConnection>> {
        let removed = self.peers.write().await.remove(peer_id);
        if let Some(connection) = &removed {
            debug!(%peer_id, "peer removed");
            if let Err(e) = connection.close().await {
                warn!(%peer_id, error = %e, "error closing removed peer");
            }
        }
        removed
    }

    /// Close every connection. Used on channel leave and shutdown.
    pub async fn close_all(&self) {
        let drained: Vec<_> = self.peers.write().await.drain().collect();
        for (peer_id, connection) in drained {
            if let Err(e) = connection.close().await {
                warn!(%peer_id, error = %e, "error closing peer during shutdown");
            }
        }
    }

    /// Decide how to react to a peer state transition.
    ///
    /// A connection that reports Disconnected or Failed gets exactly one
    /// renegotiation per failure episode; a degradation after the attempt
    /// was spent removes it. The attempt itself is consumed at re-offer
    /// time, not here, so a disconnect that self-heals during its grace
    /// period leaves the attempt intact. Events for peers already removed
    /// resolve to `None`.
    pub async fn on_state_change(&self, event: &PeerStateEvent) -> RecoveryAction {
        let Some(connection) = self.get(&event.peer_id).await else {
            return RecoveryAction::None;
        };

        match event.state {
            PeerConnectionState::Disconnected | PeerConnectionState::Failed => {
                if connection.recovery_available() {
                    info!(peer_id = %event.peer_id, state = ?event.state, "recovery eligible");
                    RecoveryAction::Renegotiate
                } else {
                    warn!(peer_id = %event.peer_id, "recovery already attempted, removing peer");
                    RecoveryAction::Remove
                }
            }
            PeerConnectionState::Closed => RecoveryAction::Remove,
            _ => RecoveryAction::None,
        }
    }

    /// Replace a troubled connection with a fresh one for the same peer,
    /// carrying the spent recovery attempt over.
    ///
    /// A failed ICE transport cannot be revived by re-offering on the
    /// same connection object; recovery tears the object down and starts
    /// negotiation over from scratch.
    pub async fn recreate_peer(&self, peer_id: &str) -> Result<Arc<PeerConnection>> {
        let Some(old) = self.remove_peer(peer_id).await else {
            return Err(Error::PeerNotFound(peer_id.to_string()));
        };
        let user_id = old.user_id().to_string();

        let replacement = self.create_peer(peer_id.to_string(), user_id).await?;
        replacement.mark_recovery_spent();
        info!(%peer_id, "peer connection recreated for recovery");
        Ok(replacement)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (Arc<PeerManager>, mpsc::UnboundedReceiver<PeerStateEvent>) {
        PeerManager::new(IceConfiguration::new(
            vec!["stun:stun.l.google.com:19302".to_string()],
            vec![],
        ))
    }

    #[tokio::test]
    async fn test_create_and_lookup_peer() {
        let (manager, _rx) = manager();
        manager
            .create_peer("peer-1".to_string(), "bob".to_string())
            .await
            .unwrap();

        assert!(manager.contains("peer-1").await);
        assert_eq!(manager.peer_count().await, 1);
        let conn = manager.get("peer-1").await.unwrap();
        assert_eq!(conn.user_id(), "bob");
    }

    #[tokio::test]
    async fn test_duplicate_peer_rejected() {
        let (manager, _rx) = manager();
        manager
            .create_peer("peer-1".to_string(), "bob".to_string())
            .await
            .unwrap();

        let err = manager
            .create_peer("peer-1".to_string(), "bob".to_string())
            .await;
        assert!(matches!(err, Err(Error::DuplicatePeer(_))));
        assert_eq!(manager.peer_count().await, 1);
    }

    #[tokio::test]
    async fn test_remove_peer_closes_connection() {
        let (manager, _rx) = manager();
        manager
            .create_peer("peer-1".to_string(), "bob".to_string())
            .await
            .unwrap();

        let removed = manager.remove_peer("peer-1").await.unwrap();
        assert_eq!(removed.state().await, PeerConnectionState::Closed);
        assert!(!manager.contains("peer-1").await);

        // A fresh record for the same peer is now allowed
        manager
            .create_peer("peer-1".to_string(), "bob".to_string())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_failure_after_spent_attempt_removes() {
        let (manager, _rx) = manager();
        let conn = manager
            .create_peer("peer-1".to_string(), "bob".to_string())
            .await
            .unwrap();

        let event = PeerStateEvent {
            peer_id: "peer-1".to_string(),
            state: PeerConnectionState::Failed,
        };
        assert_eq!(
            manager.on_state_change(&event).await,
            RecoveryAction::Renegotiate
        );

        // The re-offer consumes the attempt; the next failure removes
        assert!(conn.take_recovery_attempt());
        assert_eq!(
            manager.on_state_change(&event).await,
            RecoveryAction::Remove
        );
    }

    #[tokio::test]
    async fn test_self_healed_disconnect_keeps_the_attempt() {
        let (manager, _rx) = manager();
        manager
            .create_peer("peer-1".to_string(), "bob".to_string())
            .await
            .unwrap();

        let disconnected = PeerStateEvent {
            peer_id: "peer-1".to_string(),
            state: PeerConnectionState::Disconnected,
        };
        let failed = PeerStateEvent {
            peer_id: "peer-1".to_string(),
            state: PeerConnectionState::Failed,
        };

        // Disconnect reported, but the connection recovers during the
        // grace period so no re-offer is ever issued
        assert_eq!(
            manager.on_state_change(&disconnected).await,
            RecoveryAction::Renegotiate
        );

        // A later genuine failure must still get its recovery
        assert_eq!(
            manager.on_state_change(&failed).await,
            RecoveryAction::Renegotiate
        );
    }

    #[tokio::test]
    async fn test_disconnect_and_failure_share_one_attempt() {
        let (manager, _rx) = manager();
        let conn = manager
            .create_peer("peer-1".to_string(), "bob".to_string())
            .await
            .unwrap();

        let disconnected = PeerStateEvent {
            peer_id: "peer-1".to_string(),
            state: PeerConnectionState::Disconnected,
        };
        let failed = PeerStateEvent {
            peer_id: "peer-1".to_string(),
            state: PeerConnectionState::Failed,
        };
        assert_eq!(
            manager.on_state_change(&disconnected).await,
            RecoveryAction::Renegotiate
        );
        assert!(conn.take_recovery_attempt());
        assert_eq!(
            manager.on_state_change(&failed).await,
            RecoveryAction::Remove
        );
    }

    #[tokio::test]
    async fn test_recreate_peer_replaces_connection_with_spent_attempt() {
        let (manager, _rx) = manager();
        let old = manager
            .create_peer("peer-1".to_string(), "bob".to_string())
            .await
            .unwrap();
        assert!(old.take_recovery_attempt());

        let fresh = manager.recreate_peer("peer-1").await.unwrap();
        assert_eq!(manager.peer_count().await, 1);
        assert_eq!(old.state().await, PeerConnectionState::Closed);
        assert_eq!(fresh.state().await, PeerConnectionState::New);
        assert_eq!(fresh.user_id(), "bob");

        // The replacement failing outright earns no second recovery
        assert!(!fresh.recovery_available());
        let failed = PeerStateEvent {
            peer_id: "peer-1".to_string(),
            state: PeerConnectionState::Failed,
        };
        assert_eq!(
            manager.on_state_change(&failed).await,
            RecoveryAction::Remove
        );
    }

    #[tokio::test]
    async fn test_recreate_unknown_peer_is_an_error() {
        let (manager, _rx) = manager();
        let err = manager.recreate_peer("ghost").await;
        assert!(matches!(err, Err(Error::PeerNotFound(_))));
    }

    #[tokio::test]
    async fn test_event_for_unknown_peer_is_ignored() {
        let (manager, _rx) = manager();
        let event = PeerStateEvent {
            peer_id: "ghost".to_string(),
            state: PeerConnectionState::Failed,
        };
        assert_eq!(manager.on_state_change(&event).await, RecoveryAction::None);
    }

    #[tokio::test]
    async fn test_connected_event_requires_no_action() {
        let (manager, _rx) = manager();
        manager
            .create_peer("peer-1".to_string(), "bob".to_string())
            .await
            .unwrap();

        let event = PeerStateEvent {
            peer_id: "peer-1".to_string(),
            state: PeerConnectionState::Connected,
        };
        assert_eq!(manager.on_state_change(&event).await, RecoveryAction::None);
    }

    #[tokio::test]
    async fn test_close_all_drains_mesh() {
        let (manager, _rx) = manager();
        for i in 0..3 {
            manager
                .create_peer(format!("peer-{i}"), "bob".to_string())
                .await
                .unwrap();
        }
        assert_eq!(manager.peer_count().await, 3);

        manager.close_all().await;
        assert_eq!(manager.peer_count().await, 0);
    }
}
