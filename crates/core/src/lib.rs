//! Shared types for MeshVoice group voice channels.
//!
//! This crate defines the wire protocol exchanged between voice clients and
//! the signaling server, the ICE configuration handed to joining clients,
//! and the error taxonomy used across the workspace. It deliberately holds
//! no I/O: both the server and the client crates depend on it and speak
//! the same closed message set.

pub mod error;
pub mod ice;
pub mod protocol;

pub use error::{DeviceErrorReason, Error, Result};
pub use ice::{IceConfiguration, TurnServerConfig};
pub use protocol::{OccupantInfo, SignalingMessage};

/// Identifier of an authenticated user, supplied by the external identity
/// collaborator. The core trusts this value and never re-validates it.
pub type UserId = String;

/// Identifier of a named voice channel.
pub type ChannelId = String;

/// Identifier of one connected signaling transport. A user may hold several
/// transports at once; membership is tracked per transport, not per user.
pub type TransportId = String;

/// Generate a fresh transport identifier.
pub fn new_transport_id() -> TransportId {
    uuid::Uuid::new_v4().to_string()
}
