//! Redis-backed membership registry
//!
//! Multi-node backend: every server process reads and writes the same
//! keyspace, so occupant lists agree across processes up to redis
//! replication lag. Entry TTLs are enforced server-side by redis, which
//! keeps occupant reads clean without any sweeping. A sorted-set index
//! scored by deadline records every entry alongside its key, so the
//! eviction sweep can still name the participants whose entries lapsed
//! and broadcast their departure; without it a transport dying with its
//! server process would simply vanish, and no `PeerLeft` would ever
//! reach the remaining occupants.
//!
//! Keys: `meshvoice:chan:{channel}:{transport}` holding the serialized
//! [`Participant`]; `meshvoice:expiry` holding the same payloads scored
//! by deadline. Renewal is `EXPIRE` plus a score refresh, so a renewal
//! that lands before the deadline always wins.

use super::{MembershipRegistry, Participant};
use async_trait::async_trait;
use meshvoice_core::{ChannelId, Error, Result, TransportId, UserId};
use redis::AsyncCommands;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

const KEY_PREFIX: &str = "meshvoice:chan";
const EXPIRY_INDEX: &str = "meshvoice:expiry";

fn entry_key(channel_id: &str, transport_id: &str) -> String {
    format!("{KEY_PREFIX}:{channel_id}:{transport_id}")
}

fn channel_pattern(channel_id: &str) -> String {
    format!("{KEY_PREFIX}:{channel_id}:*")
}

fn registry_err(e: redis::RedisError) -> Error {
    Error::RegistryError(e.to_string())
}

fn epoch_secs(t: SystemTime) -> f64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

/// Replicated registry over a shared redis instance.
pub struct ReplicatedRegistry {
    conn: redis::aio::MultiplexedConnection,
    ttl: Duration,
}

impl ReplicatedRegistry {
    /// Connect to redis at `url` with the given entry TTL.
    pub async fn connect(url: &str, ttl: Duration) -> Result<Self> {
        let client = redis::Client::open(url).map_err(registry_err)?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(registry_err)?;

        Ok(Self { conn, ttl })
    }

    fn deadline(&self) -> f64 {
        epoch_secs(SystemTime::now() + self.ttl)
    }

    async fn scan_channel(&self, channel_id: &ChannelId) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut keys = Vec::new();
        let mut iter = conn
            .scan_match::<_, String>(channel_pattern(channel_id))
            .await
            .map_err(registry_err)?;
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }

    async fn load_entries(&self, keys: &[String]) -> Result<Vec<Participant>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.conn.clone();
        let values: Vec<Option<String>> = conn.mget(keys).await.map_err(registry_err)?;

        // A key may expire between SCAN and MGET; skip the holes
        let mut participants = Vec::new();
        for value in values.into_iter().flatten() {
            match serde_json::from_str::<Participant>(&value) {
                Ok(p) => participants.push(p),
                Err(e) => {
                    debug!("skipping unparseable registry entry: {e}");
                }
            }
        }
        participants.sort_by(|a, b| a.joined_at.cmp(&b.joined_at));
        Ok(participants)
    }
}

#[async_trait]
impl MembershipRegistry for ReplicatedRegistry {
    async fn join(
        &self,
        channel_id: &ChannelId,
        user_id: &UserId,
        transport_id: &TransportId,
    ) -> Result<Vec<Participant>> {
        let keys = self.scan_channel(channel_id).await?;
        let own_key = entry_key(channel_id, transport_id);
        let other_keys: Vec<String> = keys.into_iter().filter(|k| *k != own_key).collect();
        let occupants = self.load_entries(&other_keys).await?;

        let participant = Participant {
            user_id: user_id.clone(),
            channel_id: channel_id.clone(),
            transport_id: transport_id.clone(),
            joined_at: SystemTime::now(),
        };
        let payload = serde_json::to_string(&participant)
            .map_err(|e| Error::SerializationError(e.to_string()))?;

        let mut conn = self.conn.clone();

        // A rejoin replaces the payload, so its old index member would
        // linger and look expired later; drop it first
        let previous: Option<String> = conn.get(&own_key).await.map_err(registry_err)?;
        if let Some(previous) = previous {
            if previous != payload {
                conn.zrem::<_, _, ()>(EXPIRY_INDEX, &previous)
                    .await
                    .map_err(registry_err)?;
            }
        }

        // SET with EX is one atomic command, so a rejoin simply refreshes
        // the entry and its TTL
        conn.set_ex::<_, _, ()>(&own_key, &payload, self.ttl.as_secs())
            .await
            .map_err(registry_err)?;
        conn.zadd::<_, _, _, ()>(EXPIRY_INDEX, &payload, self.deadline())
            .await
            .map_err(registry_err)?;

        debug!(
            channel = %channel_id,
            transport = %transport_id,
            occupants = occupants.len(),
            "transport joined channel (replicated)"
        );

        Ok(occupants)
    }

    async fn leave(
        &self,
        channel_id: &ChannelId,
        transport_id: &TransportId,
    ) -> Result<Option<Participant>> {
        let key = entry_key(channel_id, transport_id);
        let mut conn = self.conn.clone();

        let value: Option<String> = conn.get(&key).await.map_err(registry_err)?;
        let removed = match value {
            Some(v) => {
                conn.del::<_, ()>(&key).await.map_err(registry_err)?;
                conn.zrem::<_, _, ()>(EXPIRY_INDEX, &v)
                    .await
                    .map_err(registry_err)?;
                serde_json::from_str(&v).ok()
            }
            None => None,
        };

        Ok(removed)
    }

    async fn renew(&self, channel_id: &ChannelId, transport_id: &TransportId) -> Result<bool> {
        let key = entry_key(channel_id, transport_id);
        let mut conn = self.conn.clone();
        let renewed: bool = conn
            .expire(&key, self.ttl.as_secs() as i64)
            .await
            .map_err(registry_err)?;
        if renewed {
            // Refresh the index deadline with the stored payload so the
            // sweep never evicts a renewed entry
            let payload: Option<String> = conn.get(&key).await.map_err(registry_err)?;
            if let Some(payload) = payload {
                conn.zadd::<_, _, _, ()>(EXPIRY_INDEX, &payload, self.deadline())
                    .await
                    .map_err(registry_err)?;
            }
        }
        Ok(renewed)
    }

    async fn occupants(&self, channel_id: &ChannelId) -> Result<Vec<Participant>> {
        let keys = self.scan_channel(channel_id).await?;
        self.load_entries(&keys).await
    }

    async fn evict_expired(&self) -> Result<Vec<Participant>> {
        let mut conn = self.conn.clone();
        let now = epoch_secs(SystemTime::now());

        let members: Vec<String> = conn
            .zrangebyscore(EXPIRY_INDEX, "-inf", now)
            .await
            .map_err(registry_err)?;

        let mut evicted = Vec::new();
        for member in members {
            let Ok(participant) = serde_json::from_str::<Participant>(&member) else {
                conn.zrem::<_, _, ()>(EXPIRY_INDEX, &member)
                    .await
                    .map_err(registry_err)?;
                continue;
            };

            let key = entry_key(&participant.channel_id, &participant.transport_id);
            let current: Option<String> = conn.get(&key).await.map_err(registry_err)?;
            match current {
                // Entry still alive: a renewal beat us to the key but not
                // the index; resync the deadline instead of evicting
                Some(value) if value == member => {
                    conn.zadd::<_, _, _, ()>(EXPIRY_INDEX, &member, self.deadline())
                        .await
                        .map_err(registry_err)?;
                }
                // Superseded by a rejoin; only the stale index member goes
                Some(_) => {
                    conn.zrem::<_, _, ()>(EXPIRY_INDEX, &member)
                        .await
                        .map_err(registry_err)?;
                }
                // Redis expired the entry; the index names who it was
                None => {
                    conn.zrem::<_, _, ()>(EXPIRY_INDEX, &member)
                        .await
                        .map_err(registry_err)?;
                    evicted.push(participant);
                }
            }
        }

        Ok(evicted)
    }
}
