//! Cross-process message bus
//!
//! A relay only holds send handles for transports connected to its own
//! process. In a multi-node deployment the membership registry makes
//! occupants visible everywhere, so negotiation messages and membership
//! broadcasts must be able to reach transports that live on another
//! process. The bus carries exactly that traffic: a relay publishes an
//! envelope whenever the destination is not local, and every relay runs
//! a pump that delivers envelopes from other processes to its own
//! transports.
//!
//! Two backends implement the same contract: an in-process broadcast
//! channel for single-node runs (and tests), and redis pub/sub alongside
//! the replicated registry for multi-node.

use async_trait::async_trait;
use futures_util::StreamExt;
use meshvoice_core::{ChannelId, Error, Result, SignalingMessage, TransportId};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

/// Redis pub/sub topic all relay processes share.
const BUS_TOPIC: &str = "meshvoice:bus";

/// In-process broadcast buffer; a lagging pump drops the oldest envelopes.
const MEMORY_BUS_CAPACITY: usize = 256;

/// One relayed unit of cross-process traffic.
///
/// `to: Some(..)` addresses a single transport; `to: None` is a channel
/// broadcast, optionally excluding one transport (the one the triggering
/// message came from). `origin` names the publishing process so a pump
/// never re-delivers its own traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusEnvelope {
    pub origin: String,
    pub channel_id: ChannelId,
    pub to: Option<TransportId>,
    pub exclude: Option<TransportId>,
    pub message: SignalingMessage,
}

/// Fan-out contract between relay processes.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish an envelope for other processes to deliver.
    async fn publish(&self, envelope: BusEnvelope) -> Result<()>;

    /// Stream of envelopes published by any process, including this one;
    /// the subscriber filters by `origin`.
    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<BusEnvelope>>;
}

/// Single-process bus over a tokio broadcast channel.
///
/// With one relay per bus nothing is ever delivered (the pump skips its
/// own origin); with several relays sharing the instance it behaves like
/// the redis bus without the network hop, which is how the cross-process
/// paths are tested.
pub struct MemoryBus {
    tx: broadcast::Sender<BusEnvelope>,
}

impl MemoryBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(MEMORY_BUS_CAPACITY);
        Self { tx }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, envelope: BusEnvelope) -> Result<()> {
        // No subscribers is fine; single-node traffic has nowhere to go
        let _ = self.tx.send(envelope);
        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<BusEnvelope>> {
        let mut rx = self.tx.subscribe();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) => {
                        if out_tx.send(envelope).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "bus subscriber lagged, envelopes dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(out_rx)
    }
}

/// Redis pub/sub bus. Pairs with [`crate::ReplicatedRegistry`]: the
/// registry makes membership global, this makes delivery global.
pub struct RedisBus {
    client: redis::Client,
    conn: redis::aio::MultiplexedConnection,
}

impl RedisBus {
    /// Connect to redis at `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(bus_err)?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(bus_err)?;
        Ok(Self { client, conn })
    }
}

fn bus_err(e: redis::RedisError) -> Error {
    Error::SignalingError(format!("bus error: {e}"))
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn publish(&self, envelope: BusEnvelope) -> Result<()> {
        let payload = serde_json::to_string(&envelope)
            .map_err(|e| Error::SerializationError(e.to_string()))?;
        let mut conn = self.conn.clone();
        redis::AsyncCommands::publish::<_, _, ()>(&mut conn, BUS_TOPIC, payload)
            .await
            .map_err(bus_err)?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<BusEnvelope>> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(bus_err)?;
        pubsub.subscribe(BUS_TOPIC).await.map_err(bus_err)?;

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!("unreadable bus payload: {e}");
                        continue;
                    }
                };
                match serde_json::from_str::<BusEnvelope>(&payload) {
                    Ok(envelope) => {
                        if out_tx.send(envelope).is_err() {
                            break;
                        }
                    }
                    Err(e) => debug!("skipping malformed bus envelope: {e}"),
                }
            }
            debug!("bus subscription ended");
        });
        Ok(out_rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn envelope(origin: &str, to: Option<&str>) -> BusEnvelope {
        BusEnvelope {
            origin: origin.to_string(),
            channel_id: "c1".to_string(),
            to: to.map(str::to_string),
            exclude: None,
            message: SignalingMessage::PeerLeft {
                peer_id: "t-a".to_string(),
            },
        }
    }

    #[test]
    fn test_envelope_round_trips_through_json() {
        let env = envelope("proc-1", Some("t-b"));
        let json = serde_json::to_string(&env).unwrap();
        let back: BusEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(env, back);
    }

    #[tokio::test]
    async fn test_memory_bus_delivers_to_all_subscribers() {
        let bus = Arc::new(MemoryBus::new());
        let mut rx_1 = bus.subscribe().await.unwrap();
        let mut rx_2 = bus.subscribe().await.unwrap();

        bus.publish(envelope("proc-1", None)).await.unwrap();

        assert_eq!(rx_1.recv().await.unwrap().origin, "proc-1");
        assert_eq!(rx_2.recv().await.unwrap().origin, "proc-1");
    }

    #[tokio::test]
    async fn test_memory_bus_publish_without_subscribers_is_harmless() {
        let bus = MemoryBus::new();
        bus.publish(envelope("proc-1", Some("t-b"))).await.unwrap();
    }
}
