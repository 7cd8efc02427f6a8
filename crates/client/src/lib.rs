//! MeshVoice client
//!
//! Client-side half of the voice mesh. A [`session::VoiceSession`] joins a
//! named channel through the signaling server, negotiates one WebRTC
//! connection per remote occupant ([`peer`]), captures the local
//! microphone ([`media`]), classifies speech with an adaptive-energy
//! detector ([`vad`]), and gates transmission through a push-to-talk gate
//! ([`ptt`]). Everything runs on the embedding application's tokio
//! runtime; outcomes surface as [`events::VoiceEvent`]s on a bounded
//! channel.

pub mod config;
pub mod encoder;
pub mod events;
pub mod media;
pub mod peer;
pub mod ptt;
pub mod session;
pub mod vad;
pub mod video;

pub use config::ClientConfig;
pub use encoder::{EncodedPacket, VoiceEncoder, VoiceEncoderConfig};
pub use events::VoiceEvent;
pub use media::{
    list_input_devices, list_output_devices, AudioDevice, AudioFrame, CaptureHandle,
    MediaStreamManager,
};
pub use peer::{PeerConnection, PeerConnectionState, PeerManager, PeerStateEvent, RecoveryAction};
pub use ptt::{InputEvent, KeyBinding, Modifier, PttConfig, PushToTalkGate, TransmitTransition};
pub use session::VoiceSession;
pub use vad::{VadConfig, VadEvent, VoiceActivityDetector};
pub use video::{
    VideoCaptureHandle, VideoConstraints, VideoFrame, VideoSource, VideoSourceKind,
};

pub use meshvoice_core::{Error, Result};
