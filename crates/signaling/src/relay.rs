//! Signaling relay
//!
//! Routes negotiation messages between peer pairs inside a channel and
//! drives the membership registry. The glare rule lives here: the newly
//! joined peer always offers to every pre-existing occupant, and existing
//! occupants never initiate toward a newcomer, so two sides can never
//! create simultaneous offers for the same pairing.
//!
//! A message addressed to a transport that is not present (already left,
//! wrong channel) is dropped silently; the sender finds out through its
//! own connection-state timeouts, never through relay acknowledgments.

use crate::auth::ChannelAuthorizer;
use crate::bus::{BusEnvelope, MessageBus};
use crate::ice::IceConfigProvider;
use crate::registry::MembershipRegistry;
use crate::SignalingConfig;
use dashmap::DashMap;
use meshvoice_core::{ChannelId, Error, Result, SignalingMessage, TransportId, UserId};
use meshvoice_core::protocol::OccupantInfo;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outbound handle of one connected transport. Messages pushed here are
/// delivered in order, which gives per-pair FIFO for negotiation traffic.
type TransportSender = mpsc::UnboundedSender<SignalingMessage>;

struct ConnectionEntry {
    tx: TransportSender,
    channel_id: ChannelId,
    user_id: UserId,
}

/// Server-side router for one process's connected transports.
///
/// Membership is shared through the injected [`MembershipRegistry`]; the
/// send-handle table below only covers transports connected to this
/// process. Traffic for transports owned by another process goes over the
/// injected [`MessageBus`], and [`run_bus_pump`] delivers the reverse
/// direction.
///
/// [`run_bus_pump`]: SignalingRelay::run_bus_pump
pub struct SignalingRelay {
    registry: Arc<dyn MembershipRegistry>,
    authorizer: Arc<dyn ChannelAuthorizer>,
    ice_provider: IceConfigProvider,
    bus: Arc<dyn MessageBus>,
    process_id: String,
    connections: DashMap<TransportId, ConnectionEntry>,
    max_channel_occupants: usize,
}

impl SignalingRelay {
    /// Create a relay over the given registry, authorizer, and bus.
    pub fn new(
        config: &SignalingConfig,
        registry: Arc<dyn MembershipRegistry>,
        authorizer: Arc<dyn ChannelAuthorizer>,
        bus: Arc<dyn MessageBus>,
    ) -> Self {
        Self {
            registry,
            authorizer,
            ice_provider: IceConfigProvider::new(config),
            bus,
            process_id: Uuid::new_v4().to_string(),
            connections: DashMap::new(),
            max_channel_occupants: config.max_channel_occupants,
        }
    }

    /// Number of transports currently registered with this process.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Handle a channel join for a fresh transport.
    ///
    /// On success the joiner receives a `Joined` message carrying the
    /// occupant snapshot (excluding itself) and the ICE configuration, and
    /// every pre-existing occupant receives `PeerJoined`. Authorization or
    /// capacity failures abort before any membership state is created.
    pub async fn handle_join(
        &self,
        transport_id: &TransportId,
        user_id: &UserId,
        channel_id: &ChannelId,
        tx: TransportSender,
    ) -> Result<()> {
        self.authorizer.authorize(channel_id, user_id).await?;

        let current = self.registry.occupants(channel_id).await?;
        if current.len() >= self.max_channel_occupants {
            return Err(Error::Unauthorized(format!(
                "channel {channel_id} is full ({} occupants)",
                current.len()
            )));
        }

        let snapshot = self
            .registry
            .join(channel_id, user_id, transport_id)
            .await?;

        self.connections.insert(
            transport_id.clone(),
            ConnectionEntry {
                tx: tx.clone(),
                channel_id: channel_id.clone(),
                user_id: user_id.clone(),
            },
        );

        info!(
            user = %user_id,
            channel = %channel_id,
            transport = %transport_id,
            peers = snapshot.len(),
            "user joined voice channel"
        );

        let occupants: Vec<OccupantInfo> = snapshot
            .iter()
            .map(|p| OccupantInfo {
                user_id: p.user_id.clone(),
                peer_id: p.transport_id.clone(),
            })
            .collect();

        let joined = SignalingMessage::Joined {
            peer_id: transport_id.clone(),
            occupants,
            ice: self.ice_provider.configuration(),
        };
        if tx.send(joined).is_err() {
            // Transport died between accept and join; the disconnect path
            // will clean the registry entry up
            warn!(transport = %transport_id, "joiner hung up before Joined was delivered");
        }

        let announcement = SignalingMessage::PeerJoined {
            peer_id: transport_id.clone(),
            user_id: user_id.clone(),
        };
        self.broadcast(channel_id, Some(transport_id), announcement)
            .await;

        Ok(())
    }

    /// Dispatch a message from a registered transport.
    pub async fn handle_message(
        &self,
        transport_id: &TransportId,
        message: SignalingMessage,
    ) -> Result<()> {
        match message {
            msg if msg.is_negotiation() => {
                self.relay_negotiation(transport_id, msg).await;
                Ok(())
            }
            SignalingMessage::Heartbeat => self.handle_heartbeat(transport_id).await,
            SignalingMessage::TransmitState {
                user_id,
                transmitting,
            } => {
                self.handle_transmit_state(transport_id, user_id, transmitting)
                    .await;
                Ok(())
            }
            SignalingMessage::Leave => self.remove_transport(transport_id).await,
            SignalingMessage::Join {
                channel_id,
                user_id,
            } => {
                // Channel switch on a live transport: leave the old channel
                // first, then join the new one over the same handle
                let tx = match self.connections.get(transport_id) {
                    Some(entry) => entry.tx.clone(),
                    None => {
                        return Err(Error::SignalingError(
                            "join on unregistered transport".to_string(),
                        ))
                    }
                };
                self.remove_transport(transport_id).await?;
                self.handle_join(transport_id, &user_id, &channel_id, tx)
                    .await
            }
            other => {
                debug!(
                    transport = %transport_id,
                    "ignoring server-bound message a client should not send: {other:?}"
                );
                Ok(())
            }
        }
    }

    /// Transport hung up without an explicit leave.
    pub async fn handle_disconnect(&self, transport_id: &TransportId) -> Result<()> {
        self.remove_transport(transport_id).await
    }

    async fn relay_negotiation(&self, transport_id: &TransportId, mut message: SignalingMessage) {
        // The sender field must name the sending transport; rewrite rather
        // than trusting the client, so a peer cannot impersonate another
        match &mut message {
            SignalingMessage::Offer { from, .. }
            | SignalingMessage::Answer { from, .. }
            | SignalingMessage::IceCandidate { from, .. } => {
                *from = transport_id.clone();
            }
            _ => return,
        }

        let Some(to) = message.destination().map(str::to_string) else {
            return;
        };

        let sender_channel = match self.connections.get(transport_id) {
            Some(entry) => entry.channel_id.clone(),
            None => {
                debug!(transport = %transport_id, "dropping negotiation from unregistered transport");
                return;
            }
        };

        let delivered_locally = match self.connections.get(&to) {
            Some(dest) if dest.channel_id == sender_channel => {
                if dest.tx.send(message.clone()).is_err() {
                    debug!(to = %to, "destination transport closed; dropping negotiation message");
                }
                true
            }
            Some(_) => {
                debug!(to = %to, "destination is in another channel; dropping negotiation message");
                true
            }
            None => false,
        };

        if delivered_locally {
            return;
        }

        // Not connected to this process: forward over the bus so the
        // process that owns the transport can deliver it. If no process
        // does (peer already left), nothing delivers and the drop stays
        // silent toward the sender.
        debug!(to = %to, "destination not local; forwarding negotiation over bus");
        let envelope = BusEnvelope {
            origin: self.process_id.clone(),
            channel_id: sender_channel,
            to: Some(to),
            exclude: None,
            message,
        };
        if let Err(e) = self.bus.publish(envelope).await {
            warn!("bus publish failed: {e}");
        }
    }

    async fn handle_heartbeat(&self, transport_id: &TransportId) -> Result<()> {
        let channel_id = match self.connections.get(transport_id) {
            Some(entry) => entry.channel_id.clone(),
            None => return Ok(()),
        };

        let renewed = self.registry.renew(&channel_id, transport_id).await?;
        if !renewed {
            // Evicted before the renewal arrived; re-register so a live
            // transport is never left unlisted
            let user_id = self
                .connections
                .get(transport_id)
                .map(|e| e.user_id.clone());
            if let Some(user_id) = user_id {
                warn!(transport = %transport_id, "renewal after eviction; re-registering entry");
                self.registry.join(&channel_id, &user_id, transport_id).await?;
            }
        }
        Ok(())
    }

    async fn handle_transmit_state(
        &self,
        transport_id: &TransportId,
        user_id: UserId,
        transmitting: bool,
    ) {
        let Some(entry) = self.connections.get(transport_id) else {
            return;
        };
        let channel_id = entry.channel_id.clone();
        drop(entry);

        self.broadcast(
            &channel_id,
            Some(transport_id),
            SignalingMessage::TransmitState {
                user_id,
                transmitting,
            },
        )
        .await;
    }

    async fn remove_transport(&self, transport_id: &TransportId) -> Result<()> {
        let Some((_, entry)) = self.connections.remove(transport_id) else {
            return Ok(());
        };

        self.registry.leave(&entry.channel_id, transport_id).await?;

        info!(
            user = %entry.user_id,
            channel = %entry.channel_id,
            transport = %transport_id,
            "user left voice channel"
        );

        self.broadcast(
            &entry.channel_id,
            None,
            SignalingMessage::PeerLeft {
                peer_id: transport_id.clone(),
            },
        )
        .await;

        Ok(())
    }

    /// Deliver to every local member of a channel and publish the same
    /// message for other processes' members.
    async fn broadcast(
        &self,
        channel_id: &ChannelId,
        exclude: Option<&TransportId>,
        message: SignalingMessage,
    ) {
        self.deliver_local(channel_id, exclude, message.clone());

        let envelope = BusEnvelope {
            origin: self.process_id.clone(),
            channel_id: channel_id.clone(),
            to: None,
            exclude: exclude.cloned(),
            message,
        };
        if let Err(e) = self.bus.publish(envelope).await {
            warn!("bus publish failed: {e}");
        }
    }

    fn deliver_local(
        &self,
        channel_id: &ChannelId,
        exclude: Option<&TransportId>,
        message: SignalingMessage,
    ) {
        for entry in self.connections.iter() {
            if entry.value().channel_id != *channel_id {
                continue;
            }
            if exclude.is_some_and(|t| t == entry.key()) {
                continue;
            }
            if entry.value().tx.send(message.clone()).is_err() {
                debug!(transport = %entry.key(), "broadcast to closed transport dropped");
            }
        }
    }

    /// Periodic eviction sweep. Runs until the shutdown channel fires;
    /// every evicted participant's channel gets a `PeerLeft` broadcast.
    pub async fn run_eviction_sweep(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.registry.evict_expired().await {
                        Ok(evicted) => {
                            for participant in evicted {
                                warn!(
                                    user = %participant.user_id,
                                    channel = %participant.channel_id,
                                    "transport evicted after missed heartbeats"
                                );
                                self.connections.remove(&participant.transport_id);
                                self.broadcast(
                                    &participant.channel_id,
                                    None,
                                    SignalingMessage::PeerLeft {
                                        peer_id: participant.transport_id,
                                    },
                                )
                                .await;
                            }
                        }
                        Err(e) => warn!("eviction sweep failed: {e}"),
                    }
                }
                _ = shutdown_rx.recv() => {
                    debug!("eviction sweep shutting down");
                    break;
                }
            }
        }
    }

    /// Deliver bus traffic from other processes to this process's
    /// transports. Runs until the shutdown channel fires.
    pub async fn run_bus_pump(
        self: Arc<Self>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<()> {
        let mut bus_rx = self.bus.subscribe().await?;
        loop {
            tokio::select! {
                envelope = bus_rx.recv() => {
                    let Some(envelope) = envelope else {
                        debug!("bus subscription closed");
                        break;
                    };
                    self.deliver_from_bus(envelope);
                }
                _ = shutdown_rx.recv() => {
                    debug!("bus pump shutting down");
                    break;
                }
            }
        }
        Ok(())
    }

    fn deliver_from_bus(&self, envelope: BusEnvelope) {
        let BusEnvelope {
            origin,
            channel_id,
            to,
            exclude,
            message,
        } = envelope;

        // Own publications were already delivered locally
        if origin == self.process_id {
            return;
        }

        match to {
            Some(to) => {
                let Some(dest) = self.connections.get(&to) else {
                    // Another process owns the transport, or it left
                    return;
                };
                if dest.channel_id != channel_id {
                    debug!(to = %to, "bus message for transport in another channel dropped");
                    return;
                }
                if dest.tx.send(message).is_err() {
                    debug!(to = %to, "bus destination closed; message dropped");
                }
            }
            None => self.deliver_local(&channel_id, exclude.as_ref(), message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AllowAllAuthorizer;
    use crate::bus::MemoryBus;
    use crate::registry::memory::MemoryRegistry;

    fn relay() -> Arc<SignalingRelay> {
        let config = SignalingConfig::default();
        Arc::new(SignalingRelay::new(
            &config,
            Arc::new(MemoryRegistry::new(config.entry_ttl)),
            Arc::new(AllowAllAuthorizer),
            Arc::new(MemoryBus::new()),
        ))
    }

    /// Two relays over one registry and one bus, each with its pump
    /// running, as two server processes would be deployed.
    async fn two_process_mesh() -> (Arc<SignalingRelay>, Arc<SignalingRelay>, broadcast::Sender<()>) {
        let config = SignalingConfig::default();
        let registry = Arc::new(MemoryRegistry::new(config.entry_ttl));
        let bus: Arc<dyn MessageBus> = Arc::new(MemoryBus::new());

        let relay_1 = Arc::new(SignalingRelay::new(
            &config,
            Arc::clone(&registry) as Arc<dyn MembershipRegistry>,
            Arc::new(AllowAllAuthorizer),
            Arc::clone(&bus),
        ));
        let relay_2 = Arc::new(SignalingRelay::new(
            &config,
            registry,
            Arc::new(AllowAllAuthorizer),
            bus,
        ));

        let (shutdown_tx, _) = broadcast::channel(1);
        tokio::spawn(Arc::clone(&relay_1).run_bus_pump(shutdown_tx.subscribe()));
        tokio::spawn(Arc::clone(&relay_2).run_bus_pump(shutdown_tx.subscribe()));

        // Let both pumps reach their subscription before traffic flows
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }

        (relay_1, relay_2, shutdown_tx)
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<SignalingMessage>) -> SignalingMessage {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("message within deadline")
            .expect("channel open")
    }

    async fn join(
        relay: &SignalingRelay,
        transport: &str,
        user: &str,
        channel: &str,
    ) -> mpsc::UnboundedReceiver<SignalingMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        relay
            .handle_join(
                &transport.to_string(),
                &user.to_string(),
                &channel.to_string(),
                tx,
            )
            .await
            .unwrap();
        rx
    }

    #[tokio::test]
    async fn test_first_joiner_sees_empty_snapshot() {
        let relay = relay();
        let mut rx = join(&relay, "t-a", "alice", "c1").await;

        match rx.recv().await.unwrap() {
            SignalingMessage::Joined {
                peer_id, occupants, ice,
            } => {
                assert_eq!(peer_id, "t-a");
                assert!(occupants.is_empty());
                assert!(!ice.stun_servers.is_empty());
            }
            other => panic!("expected Joined, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_newcomer_gets_snapshot_and_existing_get_peer_joined() {
        let relay = relay();
        let mut rx_a = join(&relay, "t-a", "alice", "c1").await;
        let _ = rx_a.recv().await.unwrap(); // Joined

        let mut rx_b = join(&relay, "t-b", "bob", "c1").await;
        match rx_b.recv().await.unwrap() {
            SignalingMessage::Joined { occupants, .. } => {
                assert_eq!(occupants.len(), 1);
                assert_eq!(occupants[0].peer_id, "t-a");
            }
            other => panic!("expected Joined, got {other:?}"),
        }

        match rx_a.recv().await.unwrap() {
            SignalingMessage::PeerJoined { peer_id, user_id } => {
                assert_eq!(peer_id, "t-b");
                assert_eq!(user_id, "bob");
            }
            other => panic!("expected PeerJoined, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_negotiation_forwarded_within_channel() {
        let relay = relay();
        let mut rx_a = join(&relay, "t-a", "alice", "c1").await;
        let _ = rx_a.recv().await.unwrap();
        let mut rx_b = join(&relay, "t-b", "bob", "c1").await;
        let _ = rx_b.recv().await.unwrap();
        let _ = rx_a.recv().await.unwrap(); // PeerJoined(b)

        relay
            .handle_message(
                &"t-b".to_string(),
                SignalingMessage::Offer {
                    from: "t-b".to_string(),
                    to: "t-a".to_string(),
                    sdp: "v=0...".to_string(),
                },
            )
            .await
            .unwrap();

        match rx_a.recv().await.unwrap() {
            SignalingMessage::Offer { from, to, .. } => {
                assert_eq!(from, "t-b");
                assert_eq!(to, "t-a");
            }
            other => panic!("expected Offer, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_spoofed_sender_is_rewritten() {
        let relay = relay();
        let mut rx_a = join(&relay, "t-a", "alice", "c1").await;
        let _ = rx_a.recv().await.unwrap();
        let mut rx_b = join(&relay, "t-b", "bob", "c1").await;
        let _ = rx_b.recv().await.unwrap();
        let _ = rx_a.recv().await.unwrap();

        relay
            .handle_message(
                &"t-b".to_string(),
                SignalingMessage::Offer {
                    from: "t-somebody-else".to_string(),
                    to: "t-a".to_string(),
                    sdp: "v=0...".to_string(),
                },
            )
            .await
            .unwrap();

        match rx_a.recv().await.unwrap() {
            SignalingMessage::Offer { from, .. } => assert_eq!(from, "t-b"),
            other => panic!("expected Offer, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_destination_dropped_silently() {
        let relay = relay();
        let mut rx_a = join(&relay, "t-a", "alice", "c1").await;
        let _ = rx_a.recv().await.unwrap();

        // No error surfaces to the sender
        relay
            .handle_message(
                &"t-a".to_string(),
                SignalingMessage::Offer {
                    from: "t-a".to_string(),
                    to: "t-gone".to_string(),
                    sdp: "v=0...".to_string(),
                },
            )
            .await
            .unwrap();

        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cross_channel_negotiation_dropped() {
        let relay = relay();
        let mut rx_a = join(&relay, "t-a", "alice", "c1").await;
        let _ = rx_a.recv().await.unwrap();
        let mut rx_b = join(&relay, "t-b", "bob", "c2").await;
        let _ = rx_b.recv().await.unwrap();

        relay
            .handle_message(
                &"t-a".to_string(),
                SignalingMessage::Offer {
                    from: "t-a".to_string(),
                    to: "t-b".to_string(),
                    sdp: "v=0...".to_string(),
                },
            )
            .await
            .unwrap();

        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_leave_broadcasts_peer_left() {
        let relay = relay();
        let mut rx_a = join(&relay, "t-a", "alice", "c1").await;
        let _ = rx_a.recv().await.unwrap();
        let mut rx_b = join(&relay, "t-b", "bob", "c1").await;
        let _ = rx_b.recv().await.unwrap();
        let _ = rx_a.recv().await.unwrap();

        relay
            .handle_message(&"t-b".to_string(), SignalingMessage::Leave)
            .await
            .unwrap();

        match rx_a.recv().await.unwrap() {
            SignalingMessage::PeerLeft { peer_id } => assert_eq!(peer_id, "t-b"),
            other => panic!("expected PeerLeft, got {other:?}"),
        }
        assert_eq!(relay.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_equivalent_to_leave() {
        let relay = relay();
        let mut rx_a = join(&relay, "t-a", "alice", "c1").await;
        let _ = rx_a.recv().await.unwrap();
        let mut rx_b = join(&relay, "t-b", "bob", "c1").await;
        let _ = rx_b.recv().await.unwrap();
        let _ = rx_a.recv().await.unwrap();

        relay.handle_disconnect(&"t-b".to_string()).await.unwrap();

        match rx_a.recv().await.unwrap() {
            SignalingMessage::PeerLeft { peer_id } => assert_eq!(peer_id, "t-b"),
            other => panic!("expected PeerLeft, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_transmit_state_broadcast_excludes_sender() {
        let relay = relay();
        let mut rx_a = join(&relay, "t-a", "alice", "c1").await;
        let _ = rx_a.recv().await.unwrap();
        let mut rx_b = join(&relay, "t-b", "bob", "c1").await;
        let _ = rx_b.recv().await.unwrap();
        let _ = rx_a.recv().await.unwrap();

        relay
            .handle_message(
                &"t-b".to_string(),
                SignalingMessage::TransmitState {
                    user_id: "bob".to_string(),
                    transmitting: true,
                },
            )
            .await
            .unwrap();

        match rx_a.recv().await.unwrap() {
            SignalingMessage::TransmitState {
                user_id,
                transmitting,
            } => {
                assert_eq!(user_id, "bob");
                assert!(transmitting);
            }
            other => panic!("expected TransmitState, got {other:?}"),
        }
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_channel_capacity_enforced() {
        let mut config = SignalingConfig::default();
        config.max_channel_occupants = 2;
        let relay = Arc::new(SignalingRelay::new(
            &config,
            Arc::new(MemoryRegistry::new(config.entry_ttl)),
            Arc::new(AllowAllAuthorizer),
            Arc::new(MemoryBus::new()),
        ));

        let _rx_a = join(&relay, "t-a", "alice", "c1").await;
        let _rx_b = join(&relay, "t-b", "bob", "c1").await;

        let (tx, _rx) = mpsc::unbounded_channel();
        let err = relay
            .handle_join(
                &"t-c".to_string(),
                &"carol".to_string(),
                &"c1".to_string(),
                tx,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_channel_switch_over_same_transport() {
        let relay = relay();
        let mut rx_a = join(&relay, "t-a", "alice", "c1").await;
        let _ = rx_a.recv().await.unwrap();
        let mut rx_b = join(&relay, "t-b", "bob", "c1").await;
        let _ = rx_b.recv().await.unwrap();
        let _ = rx_a.recv().await.unwrap();

        relay
            .handle_message(
                &"t-b".to_string(),
                SignalingMessage::Join {
                    channel_id: "c2".to_string(),
                    user_id: "bob".to_string(),
                },
            )
            .await
            .unwrap();

        // Old channel sees the departure
        match rx_a.recv().await.unwrap() {
            SignalingMessage::PeerLeft { peer_id } => assert_eq!(peer_id, "t-b"),
            other => panic!("expected PeerLeft, got {other:?}"),
        }
        // Switcher gets a fresh Joined for the new channel
        match rx_b.recv().await.unwrap() {
            SignalingMessage::PeerLeft { .. } => {
                // Own PeerLeft broadcast may arrive first; the Joined follows
                match rx_b.recv().await.unwrap() {
                    SignalingMessage::Joined { occupants, .. } => assert!(occupants.is_empty()),
                    other => panic!("expected Joined, got {other:?}"),
                }
            }
            SignalingMessage::Joined { occupants, .. } => assert!(occupants.is_empty()),
            other => panic!("expected Joined or PeerLeft, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_eviction_sweep_broadcasts_peer_left() {
        let mut config = SignalingConfig::default();
        config.entry_ttl = Duration::from_millis(30);
        config.heartbeat_interval = Duration::from_millis(5);
        let relay = Arc::new(SignalingRelay::new(
            &config,
            Arc::new(MemoryRegistry::new(config.entry_ttl)),
            Arc::new(AllowAllAuthorizer),
            Arc::new(MemoryBus::new()),
        ));

        let mut rx_a = join(&relay, "t-a", "alice", "c1").await;
        let _ = rx_a.recv().await.unwrap();
        let mut rx_b = join(&relay, "t-b", "bob", "c1").await;
        let _ = rx_b.recv().await.unwrap();
        let _ = rx_a.recv().await.unwrap();

        // Keep alice alive across the TTL window, let bob lapse
        tokio::time::sleep(Duration::from_millis(20)).await;
        relay
            .handle_message(&"t-a".to_string(), SignalingMessage::Heartbeat)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let sweep = tokio::spawn(
            Arc::clone(&relay).run_eviction_sweep(Duration::from_millis(10), shutdown_rx),
        );

        match rx_a.recv().await.unwrap() {
            SignalingMessage::PeerLeft { peer_id } => assert_eq!(peer_id, "t-b"),
            other => panic!("expected PeerLeft, got {other:?}"),
        }

        let _ = shutdown_tx.send(());
        sweep.await.unwrap();
    }

    #[tokio::test]
    async fn test_membership_events_cross_processes() {
        let (relay_1, relay_2, _shutdown) = two_process_mesh().await;

        let mut rx_a = join(&relay_1, "t-a", "alice", "c1").await;
        let _ = rx_a.recv().await.unwrap(); // Joined

        // Bob connects to the other process but the same channel
        let mut rx_b = join(&relay_2, "t-b", "bob", "c1").await;
        match rx_b.recv().await.unwrap() {
            SignalingMessage::Joined { occupants, .. } => {
                assert_eq!(occupants.len(), 1);
                assert_eq!(occupants[0].peer_id, "t-a");
            }
            other => panic!("expected Joined, got {other:?}"),
        }

        // Alice's PeerJoined arrives through the bus
        match recv(&mut rx_a).await {
            SignalingMessage::PeerJoined { peer_id, user_id } => {
                assert_eq!(peer_id, "t-b");
                assert_eq!(user_id, "bob");
            }
            other => panic!("expected PeerJoined, got {other:?}"),
        }

        relay_2
            .handle_message(&"t-b".to_string(), SignalingMessage::Leave)
            .await
            .unwrap();
        match recv(&mut rx_a).await {
            SignalingMessage::PeerLeft { peer_id } => assert_eq!(peer_id, "t-b"),
            other => panic!("expected PeerLeft, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_negotiation_crosses_processes() {
        let (relay_1, relay_2, _shutdown) = two_process_mesh().await;

        let mut rx_a = join(&relay_1, "t-a", "alice", "c1").await;
        let _ = rx_a.recv().await.unwrap();
        let mut rx_b = join(&relay_2, "t-b", "bob", "c1").await;
        let _ = rx_b.recv().await.unwrap();
        let _ = recv(&mut rx_a).await; // PeerJoined(b)

        // Bob, the newcomer, offers toward a transport his process does
        // not own; the offer must still reach alice
        relay_2
            .handle_message(
                &"t-b".to_string(),
                SignalingMessage::Offer {
                    from: "t-b".to_string(),
                    to: "t-a".to_string(),
                    sdp: "v=0...".to_string(),
                },
            )
            .await
            .unwrap();
        match recv(&mut rx_a).await {
            SignalingMessage::Offer { from, to, .. } => {
                assert_eq!(from, "t-b");
                assert_eq!(to, "t-a");
            }
            other => panic!("expected Offer, got {other:?}"),
        }

        // And alice's answer crosses back
        relay_1
            .handle_message(
                &"t-a".to_string(),
                SignalingMessage::Answer {
                    from: "t-a".to_string(),
                    to: "t-b".to_string(),
                    sdp: "v=0...".to_string(),
                },
            )
            .await
            .unwrap();
        match recv(&mut rx_b).await {
            SignalingMessage::Answer { from, .. } => assert_eq!(from, "t-a"),
            other => panic!("expected Answer, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_transmit_state_crosses_processes() {
        let (relay_1, relay_2, _shutdown) = two_process_mesh().await;

        let mut rx_a = join(&relay_1, "t-a", "alice", "c1").await;
        let _ = rx_a.recv().await.unwrap();
        let mut rx_b = join(&relay_2, "t-b", "bob", "c1").await;
        let _ = rx_b.recv().await.unwrap();
        let _ = recv(&mut rx_a).await;

        relay_2
            .handle_message(
                &"t-b".to_string(),
                SignalingMessage::TransmitState {
                    user_id: "bob".to_string(),
                    transmitting: true,
                },
            )
            .await
            .unwrap();

        match recv(&mut rx_a).await {
            SignalingMessage::TransmitState { user_id, transmitting } => {
                assert_eq!(user_id, "bob");
                assert!(transmitting);
            }
            other => panic!("expected TransmitState, got {other:?}"),
        }
        // The sender's own process never echoes it back
        assert!(rx_b.try_recv().is_err());
    }
}
