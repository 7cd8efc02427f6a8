//! In-process membership registry
//!
//! DashMap-backed implementation for single-node deployments. Per-key
//! atomicity comes from the map's sharded entry locks.

use super::{MembershipRegistry, Participant};
use async_trait::async_trait;
use dashmap::DashMap;
use meshvoice_core::{ChannelId, Result, TransportId, UserId};
use std::time::{Duration, Instant, SystemTime};
use tracing::debug;

struct Entry {
    participant: Participant,
    expires_at: Instant,
}

/// In-memory registry with TTL eviction.
pub struct MemoryRegistry {
    entries: DashMap<(ChannelId, TransportId), Entry>,
    ttl: Duration,
}

impl MemoryRegistry {
    /// Create a registry whose entries lapse after `ttl` without renewal.
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    fn snapshot_channel(&self, channel_id: &ChannelId, exclude: &TransportId) -> Vec<Participant> {
        let now = Instant::now();
        let mut occupants: Vec<Participant> = self
            .entries
            .iter()
            .filter(|kv| {
                let (chan, transport) = kv.key();
                chan == channel_id && transport != exclude && kv.value().expires_at > now
            })
            .map(|kv| kv.value().participant.clone())
            .collect();
        // Stable order keeps join snapshots deterministic for callers
        occupants.sort_by(|a, b| a.joined_at.cmp(&b.joined_at));
        occupants
    }
}

#[async_trait]
impl MembershipRegistry for MemoryRegistry {
    async fn join(
        &self,
        channel_id: &ChannelId,
        user_id: &UserId,
        transport_id: &TransportId,
    ) -> Result<Vec<Participant>> {
        let occupants = self.snapshot_channel(channel_id, transport_id);

        let key = (channel_id.clone(), transport_id.clone());
        let expires_at = Instant::now() + self.ttl;

        // entry() holds the shard lock, so a racing join/leave for the same
        // key serializes here
        self.entries
            .entry(key)
            .and_modify(|e| e.expires_at = expires_at)
            .or_insert_with(|| Entry {
                participant: Participant {
                    user_id: user_id.clone(),
                    channel_id: channel_id.clone(),
                    transport_id: transport_id.clone(),
                    joined_at: SystemTime::now(),
                },
                expires_at,
            });

        debug!(
            channel = %channel_id,
            transport = %transport_id,
            occupants = occupants.len(),
            "transport joined channel"
        );

        Ok(occupants)
    }

    async fn leave(
        &self,
        channel_id: &ChannelId,
        transport_id: &TransportId,
    ) -> Result<Option<Participant>> {
        let removed = self
            .entries
            .remove(&(channel_id.clone(), transport_id.clone()))
            .map(|(_, e)| e.participant);

        if removed.is_some() {
            debug!(channel = %channel_id, transport = %transport_id, "transport left channel");
        }

        Ok(removed)
    }

    async fn renew(&self, channel_id: &ChannelId, transport_id: &TransportId) -> Result<bool> {
        match self
            .entries
            .get_mut(&(channel_id.clone(), transport_id.clone()))
        {
            Some(mut entry) => {
                // Renewal wins over a pending eviction as long as the entry
                // is still present, even if its deadline already lapsed
                entry.expires_at = Instant::now() + self.ttl;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn occupants(&self, channel_id: &ChannelId) -> Result<Vec<Participant>> {
        let now = Instant::now();
        let mut occupants: Vec<Participant> = self
            .entries
            .iter()
            .filter(|kv| kv.key().0 == *channel_id && kv.value().expires_at > now)
            .map(|kv| kv.value().participant.clone())
            .collect();
        occupants.sort_by(|a, b| a.joined_at.cmp(&b.joined_at));
        Ok(occupants)
    }

    async fn evict_expired(&self) -> Result<Vec<Participant>> {
        let now = Instant::now();
        let expired_keys: Vec<(ChannelId, TransportId)> = self
            .entries
            .iter()
            .filter(|kv| kv.value().expires_at <= now)
            .map(|kv| kv.key().clone())
            .collect();

        let mut evicted = Vec::new();
        for key in expired_keys {
            // remove_if re-checks the deadline under the shard lock, so a
            // renewal that landed between the scan and this call survives
            if let Some((_, e)) = self
                .entries
                .remove_if(&key, |_, e| e.expires_at <= Instant::now())
            {
                debug!(
                    channel = %e.participant.channel_id,
                    transport = %e.participant.transport_id,
                    "evicted expired registry entry"
                );
                evicted.push(e.participant);
            }
        }

        Ok(evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(ttl_ms: u64) -> MemoryRegistry {
        MemoryRegistry::new(Duration::from_millis(ttl_ms))
    }

    #[tokio::test]
    async fn test_join_returns_existing_occupants_only() {
        let reg = registry(10_000);
        let c1 = "c1".to_string();

        let snapshot = reg
            .join(&c1, &"alice".to_string(), &"t-a".to_string())
            .await
            .unwrap();
        assert!(snapshot.is_empty());

        let snapshot = reg
            .join(&c1, &"bob".to_string(), &"t-b".to_string())
            .await
            .unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].user_id, "alice");
    }

    #[tokio::test]
    async fn test_join_is_idempotent_per_transport() {
        let reg = registry(10_000);
        let c1 = "c1".to_string();
        let t = "t-a".to_string();

        reg.join(&c1, &"alice".to_string(), &t).await.unwrap();
        reg.join(&c1, &"alice".to_string(), &t).await.unwrap();

        assert_eq!(reg.occupants(&c1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_same_user_multiple_transports() {
        let reg = registry(10_000);
        let c1 = "c1".to_string();

        reg.join(&c1, &"alice".to_string(), &"t-1".to_string())
            .await
            .unwrap();
        reg.join(&c1, &"alice".to_string(), &"t-2".to_string())
            .await
            .unwrap();

        assert_eq!(reg.occupants(&c1).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_n_joins_n_leaves_empty_channel() {
        let reg = registry(10_000);
        let c1 = "c1".to_string();
        let transports: Vec<String> = (0..5).map(|i| format!("t-{i}")).collect();

        for t in &transports {
            reg.join(&c1, &format!("user-{t}"), t).await.unwrap();
        }
        // Leave in a different order than join
        for t in transports.iter().rev() {
            assert!(reg.leave(&c1, t).await.unwrap().is_some());
        }

        assert!(reg.occupants(&c1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_double_leave_is_harmless() {
        let reg = registry(10_000);
        let c1 = "c1".to_string();
        let t = "t-a".to_string();

        reg.join(&c1, &"alice".to_string(), &t).await.unwrap();
        assert!(reg.leave(&c1, &t).await.unwrap().is_some());
        assert!(reg.leave(&c1, &t).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_entries_are_evicted() {
        let reg = registry(20);
        let c1 = "c1".to_string();

        reg.join(&c1, &"alice".to_string(), &"t-a".to_string())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let evicted = reg.evict_expired().await.unwrap();
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].user_id, "alice");
        assert!(reg.occupants(&c1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_renewal_beats_eviction() {
        let reg = registry(30);
        let c1 = "c1".to_string();
        let t = "t-a".to_string();

        reg.join(&c1, &"alice".to_string(), &t).await.unwrap();
        tokio::time::sleep(Duration::from_millis(15)).await;
        assert!(reg.renew(&c1, &t).await.unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;

        // 35ms since join but only 20ms since renewal: entry survives
        assert!(reg.evict_expired().await.unwrap().is_empty());
        assert_eq!(reg.occupants(&c1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_renew_unknown_entry_reports_false() {
        let reg = registry(10_000);
        assert!(!reg
            .renew(&"c1".to_string(), &"t-missing".to_string())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_expired_entries_hidden_from_occupants() {
        let reg = registry(10);
        let c1 = "c1".to_string();

        reg.join(&c1, &"alice".to_string(), &"t-a".to_string())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        // Not yet swept, but already invisible
        assert!(reg.occupants(&c1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_channels_are_isolated() {
        let reg = registry(10_000);

        reg.join(&"c1".to_string(), &"alice".to_string(), &"t-a".to_string())
            .await
            .unwrap();
        reg.join(&"c2".to_string(), &"bob".to_string(), &"t-b".to_string())
            .await
            .unwrap();

        let c1 = reg.occupants(&"c1".to_string()).await.unwrap();
        assert_eq!(c1.len(), 1);
        assert_eq!(c1[0].user_id, "alice");
    }
}
