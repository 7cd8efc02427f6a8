//! Events surfaced to the embedding application
//!
//! The session pushes these over a bounded channel; consumers that fall
//! behind lose the oldest events rather than backpressuring the session.

use crate::peer::PeerConnectionState;
use meshvoice_core::{TransportId, UserId};
use tokio::sync::mpsc;
use tracing::warn;

/// Everything the UI layer needs to render channel state.
#[derive(Debug, Clone, PartialEq)]
pub enum VoiceEvent {
    /// Signaling connection established and channel joined
    ChannelJoined {
        peer_id: TransportId,
        occupants: Vec<UserId>,
    },

    /// Session left the channel or the signaling connection dropped
    ChannelLeft { reason: String },

    /// Another participant entered the channel
    PeerJoined {
        peer_id: TransportId,
        user_id: UserId,
    },

    /// A participant left or was evicted
    PeerLeft { peer_id: TransportId },

    /// A peer connection moved through its lifecycle
    PeerStateChanged {
        peer_id: TransportId,
        state: PeerConnectionState,
    },

    /// Local transmit gate opened or closed
    TransmitChanged { transmitting: bool },

    /// Local voice activity state changed
    SpeakingChanged { speaking: bool },

    /// A remote participant started or stopped transmitting
    RemoteTransmitChanged {
        user_id: UserId,
        transmitting: bool,
    },

    /// Non-fatal error the application may want to surface
    Error { message: String },
}

/// Sender half used inside the session; drops events when the consumer
/// is not keeping up instead of blocking the signaling loop.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<VoiceEvent>,
}

impl EventSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<VoiceEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: VoiceEvent) {
        if let Err(e) = self.tx.try_send(event) {
            match e {
                mpsc::error::TrySendError::Full(event) => {
                    warn!(?event, "event buffer full, dropping event");
                }
                mpsc::error::TrySendError::Closed(_) => {}
            }
        }
    }
}
