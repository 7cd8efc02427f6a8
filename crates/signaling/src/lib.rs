//! MeshVoice signaling server
//!
//! Server-side half of the voice mesh: keeps the channel membership
//! registry, relays SDP/ICE negotiation messages between peer pairs inside
//! a channel, hands the ICE (STUN/TURN) configuration to joining clients,
//! and evicts transports that stop renewing their TTL.
//!
//! The server never touches media. Audio flows directly between peers over
//! the WebRTC connections the clients negotiate through this relay.

pub mod auth;
pub mod bus;
pub mod config;
pub mod ice;
pub mod registry;
pub mod relay;
pub mod ws;

pub use auth::{AllowAllAuthorizer, ChannelAuthorizer};
pub use bus::{BusEnvelope, MemoryBus, MessageBus, RedisBus};
pub use config::SignalingConfig;
pub use ice::IceConfigProvider;
pub use registry::{memory::MemoryRegistry, replicated::ReplicatedRegistry};
pub use registry::{MembershipRegistry, Participant};
pub use relay::SignalingRelay;
pub use ws::{SignalingServer, SignalingServerHandle};

pub use meshvoice_core::{Error, Result};
