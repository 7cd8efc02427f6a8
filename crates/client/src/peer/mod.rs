//! Peer connection lifecycle and mesh membership

mod connection;
mod manager;

pub use connection::{PeerConnection, PeerConnectionState, PeerStateEvent};
pub use manager::{PeerManager, RecoveryAction};
