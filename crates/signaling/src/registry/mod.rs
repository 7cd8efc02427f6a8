//! Channel membership registry
//!
//! One logical map of `(channel, transport)` to participant, shared by
//! every server process. Two backends implement the same contract: an
//! in-process concurrent map for single-node deployments and a
//! redis-backed implementation for multi-node. The backend is injected
//! into the relay; nothing else in the server knows which one runs.
//!
//! Entries carry a TTL and must be renewed by the owning transport. The
//! eviction sweep is a cleanup mechanism for abnormal disconnects (process
//! crash, network partition), not primary lifecycle management; a renewal
//! that lands before the sweep fires always wins.

pub mod memory;
pub mod replicated;

use async_trait::async_trait;
use meshvoice_core::{ChannelId, Result, TransportId, UserId};
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// One live membership entry. A user with several transports (for example
/// several devices) holds one entry per transport; uniqueness is per
/// `(channel_id, transport_id)`, never per user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    /// Authenticated user id
    pub user_id: UserId,

    /// Channel the entry belongs to
    pub channel_id: ChannelId,

    /// Owning transport
    pub transport_id: TransportId,

    /// When the entry was created
    pub joined_at: SystemTime,
}

/// Shared membership registry contract.
///
/// All mutations are atomic per `(channel, transport)` key; two racing
/// events for the same transport (rapid reconnect) never produce a lost
/// update. Cross-process reads through the replicated backend are
/// eventually consistent, which the relay tolerates by relying on the
/// explicit join-time occupant snapshot.
#[async_trait]
pub trait MembershipRegistry: Send + Sync {
    /// Register a transport in a channel and return the occupants that
    /// were already present (excluding the joiner). Joining the same
    /// `(channel, transport)` twice is idempotent: the entry is refreshed,
    /// never duplicated.
    async fn join(
        &self,
        channel_id: &ChannelId,
        user_id: &UserId,
        transport_id: &TransportId,
    ) -> Result<Vec<Participant>>;

    /// Remove a transport from a channel. Returns the removed entry, or
    /// `None` if it was already gone (double leave is harmless).
    async fn leave(
        &self,
        channel_id: &ChannelId,
        transport_id: &TransportId,
    ) -> Result<Option<Participant>>;

    /// Renew the TTL of an entry. Returns `false` if the entry no longer
    /// exists (already evicted or left).
    async fn renew(&self, channel_id: &ChannelId, transport_id: &TransportId) -> Result<bool>;

    /// Current occupants of a channel.
    async fn occupants(&self, channel_id: &ChannelId) -> Result<Vec<Participant>>;

    /// Remove every entry whose TTL has lapsed and return them so the
    /// relay can notify the remaining occupants.
    async fn evict_expired(&self) -> Result<Vec<Participant>>;
}
