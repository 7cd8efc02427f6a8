//! Signaling wire protocol
//!
//! A closed, tagged message set exchanged between clients and the signaling
//! server. Every inbound frame is deserialized through [`SignalingMessage`]
//! before dispatch; anything that does not parse into one of these variants
//! is rejected at the boundary.

use crate::{ChannelId, IceConfiguration, UserId};
use serde::{Deserialize, Serialize};

/// One occupant as reported in a join snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccupantInfo {
    /// Authenticated user id of the occupant
    pub user_id: UserId,

    /// Peer id to negotiate with (the occupant's transport id)
    pub peer_id: String,
}

/// Signaling messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    /// Client requests to join a channel. Must be the first message on a
    /// fresh transport; the user id has already been validated upstream.
    Join {
        /// Channel to join
        channel_id: ChannelId,
        /// Authenticated user id
        user_id: UserId,
    },

    /// Server reply to a successful join: the occupant snapshot (excluding
    /// the joiner) and the ICE configuration for this session. The joiner
    /// offers to every listed occupant; they never offer back.
    Joined {
        /// Peer id assigned to the joiner
        peer_id: String,
        /// Occupants already in the channel
        occupants: Vec<OccupantInfo>,
        /// STUN/TURN endpoints for this session
        ice: IceConfiguration,
    },

    /// SDP offer from one peer to another
    Offer {
        /// Sender peer id
        from: String,
        /// Recipient peer id
        to: String,
        /// SDP offer
        sdp: String,
    },

    /// SDP answer from one peer to another
    Answer {
        /// Sender peer id
        from: String,
        /// Recipient peer id
        to: String,
        /// SDP answer
        sdp: String,
    },

    /// ICE candidate exchange
    IceCandidate {
        /// Sender peer id
        from: String,
        /// Recipient peer id
        to: String,
        /// ICE candidate string
        candidate: String,
        /// SDP media stream identification
        #[serde(skip_serializing_if = "Option::is_none")]
        sdp_mid: Option<String>,
        /// SDP media line index
        #[serde(skip_serializing_if = "Option::is_none")]
        sdp_mline_index: Option<u16>,
    },

    /// Broadcast when a new peer joins the channel
    PeerJoined {
        /// Peer id of the newcomer
        peer_id: String,
        /// User id of the newcomer
        user_id: UserId,
    },

    /// Broadcast when a peer leaves (or its transport dies); receivers tear
    /// down the corresponding connection record immediately.
    PeerLeft {
        /// Peer id of the departed occupant
        peer_id: String,
    },

    /// Transmit indicator, broadcast so peers can render "currently
    /// transmitting" without inspecting the audio stream.
    TransmitState {
        /// User whose gate changed
        user_id: UserId,
        /// Whether the microphone is currently transmitting
        transmitting: bool,
    },

    /// Registry TTL renewal. Sent at a fixed fraction of the entry TTL.
    Heartbeat,

    /// Explicit leave; the transport may stay open for a later re-join.
    Leave,

    /// Error message from the server
    Error {
        /// Human-readable description
        message: String,
    },
}

impl SignalingMessage {
    /// Serialize to a JSON wire frame.
    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| {
            crate::Error::SerializationError(format!("Failed to serialize signaling message: {e}"))
        })
    }

    /// Parse a JSON wire frame, rejecting anything outside the closed set.
    pub fn from_json(json: &str) -> crate::Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            crate::Error::SerializationError(format!(
                "Failed to deserialize signaling message: {e}"
            ))
        })
    }

    /// Destination peer id for point-to-point negotiation messages.
    pub fn destination(&self) -> Option<&str> {
        match self {
            SignalingMessage::Offer { to, .. }
            | SignalingMessage::Answer { to, .. }
            | SignalingMessage::IceCandidate { to, .. } => Some(to),
            _ => None,
        }
    }

    /// Sender peer id for point-to-point negotiation messages.
    pub fn sender(&self) -> Option<&str> {
        match self {
            SignalingMessage::Offer { from, .. }
            | SignalingMessage::Answer { from, .. }
            | SignalingMessage::IceCandidate { from, .. } => Some(from),
            _ => None,
        }
    }

    /// Whether this is a negotiation message the relay forwards verbatim.
    pub fn is_negotiation(&self) -> bool {
        self.destination().is_some()
    }
}
