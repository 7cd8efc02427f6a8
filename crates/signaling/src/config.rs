//! Configuration for the signaling server

use meshvoice_core::{Error, IceConfiguration, Result, TurnServerConfig};
use std::time::Duration;

/// Main configuration for the signaling server
#[derive(Debug, Clone)]
pub struct SignalingConfig {
    /// Port the WebSocket listener binds to
    pub bind_port: u16,

    /// Time-to-live of a registry entry. Entries not renewed within this
    /// window are evicted by the sweep task.
    pub entry_ttl: Duration,

    /// Interval at which clients are expected to renew. Must be strictly
    /// shorter than `entry_ttl`; the default is one fifth of it.
    pub heartbeat_interval: Duration,

    /// Interval between eviction sweeps over the registry
    pub eviction_interval: Duration,

    /// STUN server URLs handed to joining clients (static fallback applies
    /// when empty)
    pub stun_servers: Vec<String>,

    /// TURN relay, included in the ICE configuration only when configured
    pub turn_server: Option<TurnServerConfig>,

    /// Upper bound on occupants per channel (full mesh: every occupant
    /// connects to every other)
    pub max_channel_occupants: usize,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        let entry_ttl = Duration::from_secs(30);
        Self {
            bind_port: 8443,
            entry_ttl,
            heartbeat_interval: entry_ttl / 5,
            eviction_interval: Duration::from_secs(5),
            stun_servers: Vec::new(),
            turn_server: None,
            max_channel_occupants: 16,
        }
    }
}

impl SignalingConfig {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `heartbeat_interval` is not strictly shorter than `entry_ttl`
    /// - `entry_ttl` or `eviction_interval` is zero
    /// - `max_channel_occupants` is below 2
    pub fn validate(&self) -> Result<()> {
        if self.entry_ttl.is_zero() {
            return Err(Error::InvalidConfig("entry_ttl must be non-zero".to_string()));
        }

        if self.heartbeat_interval >= self.entry_ttl {
            return Err(Error::InvalidConfig(format!(
                "heartbeat_interval ({:?}) must be strictly shorter than entry_ttl ({:?})",
                self.heartbeat_interval, self.entry_ttl
            )));
        }

        if self.eviction_interval.is_zero() {
            return Err(Error::InvalidConfig(
                "eviction_interval must be non-zero".to_string(),
            ));
        }

        if self.max_channel_occupants < 2 {
            return Err(Error::InvalidConfig(format!(
                "max_channel_occupants must be at least 2, got {}",
                self.max_channel_occupants
            )));
        }

        Ok(())
    }

    /// ICE configuration distributed to joining clients.
    pub fn ice_configuration(&self) -> IceConfiguration {
        IceConfiguration::new(
            self.stun_servers.clone(),
            self.turn_server.clone().into_iter().collect(),
        )
    }

    /// Set the entry TTL and re-derive the heartbeat interval (ttl / 5).
    pub fn with_entry_ttl(mut self, ttl: Duration) -> Self {
        self.entry_ttl = ttl;
        self.heartbeat_interval = ttl / 5;
        self
    }
}
