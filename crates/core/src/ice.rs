//! ICE configuration distributed to joining clients

use serde::{Deserialize, Serialize};

/// Static STUN fallback, always present even when the server config lists
/// no STUN endpoints of its own.
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// TURN relay configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// TURN server URL (turn:// or turns://)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

/// ICE server set supplied once per join.
///
/// A client does not re-fetch this mid-session unless it explicitly asks
/// for a refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceConfiguration {
    /// STUN server URLs (never empty)
    pub stun_servers: Vec<String>,

    /// TURN relay configurations; present only when credentials are configured
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub turn_servers: Vec<TurnServerConfig>,
}

impl Default for IceConfiguration {
    fn default() -> Self {
        Self {
            stun_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            turn_servers: Vec::new(),
        }
    }
}

impl IceConfiguration {
    /// Build a configuration, falling back to the static STUN list when
    /// `stun_servers` is empty.
    pub fn new(stun_servers: Vec<String>, turn_servers: Vec<TurnServerConfig>) -> Self {
        let stun_servers = if stun_servers.is_empty() {
            DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect()
        } else {
            stun_servers
        };

        Self {
            stun_servers,
            turn_servers,
        }
    }

    /// Whether a TURN relay is available.
    pub fn has_turn(&self) -> bool {
        !self.turn_servers.is_empty()
    }
}
