//! WebRTC peer connection wrapper
//!
//! One instance per remote participant. Holds the underlying
//! RTCPeerConnection, tracks lifecycle state, and carries the outbound
//! audio track. State changes from the ICE layer are forwarded to the
//! session over an unbounded channel so recovery decisions happen in
//! one place.

use meshvoice_core::{Error, IceConfiguration, Result, TransportId, UserId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Lifecycle of a single peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    /// Created, no negotiation yet
    New,
    /// Offer/answer exchange or ICE checks in progress
    Negotiating,
    /// Media is flowing
    Connected,
    /// Transport lost; eligible for one recovery attempt
    Disconnected,
    /// ICE gave up; eligible for one recovery attempt
    Failed,
    /// Torn down; late signaling for this peer is discarded
    Closed,
}

impl PeerConnectionState {
    /// Whether the connection can still carry or regain media.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PeerConnectionState::Closed)
    }

    /// States from which an automatic renegotiation may be attempted.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PeerConnectionState::Disconnected | PeerConnectionState::Failed
        )
    }
}

/// State transition forwarded to the session loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStateEvent {
    pub peer_id: TransportId,
    pub state: PeerConnectionState,
}

/// Wraps an RTCPeerConnection for one remote participant.
pub struct PeerConnection {
    peer_id: TransportId,
    user_id: UserId,
    state: Arc<RwLock<PeerConnectionState>>,
    pc: Arc<RTCPeerConnection>,
    audio_track: Arc<TrackLocalStaticSample>,
    video_track: RwLock<Option<Arc<TrackLocalStaticSample>>>,
    connected_at: Arc<RwLock<Option<SystemTime>>>,

    /// Set while the single automatic recovery is pending; cleared again
    /// once the connection reaches Connected
    recovery_spent: Arc<AtomicBool>,
}

impl PeerConnection {
    /// Create a connection and its outbound audio track.
    ///
    /// `state_tx` receives every lifecycle transition; the session loop
    /// uses it to drive recovery and surface peer state to the UI.
    pub async fn new(
        peer_id: TransportId,
        user_id: UserId,
        ice: &IceConfiguration,
        state_tx: mpsc::UnboundedSender<PeerStateEvent>,
    ) -> Result<Self> {
        info!(%peer_id, %user_id, "creating peer connection");

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::PeerConnectionError(format!("failed to register codecs: {e}")))?;

        let registry = register_default_interceptors(Default::default(), &mut media_engine)
            .map_err(|e| {
                Error::PeerConnectionError(format!("failed to register interceptors: {e}"))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers: Vec<RTCIceServer> = ice
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .chain(ice.turn_servers.iter().map(|turn| RTCIceServer {
                urls: vec![turn.url.clone()],
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            }))
            .collect();

        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers,
                ..Default::default()
            })
            .await
            .map_err(|e| {
                Error::PeerConnectionError(format!("failed to create peer connection: {e}"))
            })?,
        );

        let state = Arc::new(RwLock::new(PeerConnectionState::New));
        let connected_at = Arc::new(RwLock::new(None));
        let recovery_spent = Arc::new(AtomicBool::new(false));

        {
            let state = Arc::clone(&state);
            let connected_at = Arc::clone(&connected_at);
            let recovery_spent = Arc::clone(&recovery_spent);
            let peer_id = peer_id.clone();
            pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let state = Arc::clone(&state);
                let connected_at = Arc::clone(&connected_at);
                let recovery_spent = Arc::clone(&recovery_spent);
                let peer_id = peer_id.clone();
                let state_tx = state_tx.clone();

                Box::pin(async move {
                    let new_state = match s {
                        RTCPeerConnectionState::Connecting => PeerConnectionState::Negotiating,
                        RTCPeerConnectionState::Connected => {
                            *connected_at.write().await = Some(SystemTime::now());
                            // A fresh failure episode gets a fresh attempt
                            recovery_spent.store(false, Ordering::SeqCst);
                            PeerConnectionState::Connected
                        }
                        RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
                        RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
                        RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
                        _ => return,
                    };

                    let mut guard = state.write().await;
                    if *guard == new_state || guard.is_terminal() {
                        return;
                    }
                    debug!(%peer_id, from = ?*guard, to = ?new_state, "peer state transition");
                    *guard = new_state;
                    drop(guard);

                    let _ = state_tx.send(PeerStateEvent {
                        peer_id,
                        state: new_state,
                    });
                })
            }));
        }

        // Outbound track added up front so it is present in every offer
        let audio_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: 48_000,
                channels: 2,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            format!("audio-{user_id}"),
            format!("voice-{peer_id}"),
        ));

        pc.add_track(Arc::clone(&audio_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| Error::PeerConnectionError(format!("failed to add audio track: {e}")))?;

        Ok(Self {
            peer_id,
            user_id,
            state,
            pc,
            audio_track,
            video_track: RwLock::new(None),
            connected_at,
            recovery_spent,
        })
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub async fn state(&self) -> PeerConnectionState {
        *self.state.read().await
    }

    async fn set_state(&self, new_state: PeerConnectionState) {
        let mut guard = self.state.write().await;
        if *guard != new_state && !guard.is_terminal() {
            debug!(peer_id = %self.peer_id, from = ?*guard, to = ?new_state, "peer state transition");
            *guard = new_state;
        }
    }

    /// Whether an automatic recovery may still be attempted for the
    /// current failure episode.
    pub fn recovery_available(&self) -> bool {
        !self.recovery_spent.load(Ordering::SeqCst)
    }

    /// Consume the automatic recovery attempt. Returns true the first
    /// time within a failure episode, false until the connection
    /// re-establishes.
    pub fn take_recovery_attempt(&self) -> bool {
        !self.recovery_spent.swap(true, Ordering::SeqCst)
    }

    /// Carry a spent attempt over onto a replacement connection, so the
    /// replacement failing outright does not earn a second recovery.
    pub fn mark_recovery_spent(&self) {
        self.recovery_spent.store(true, Ordering::SeqCst);
    }

    /// Underlying RTCPeerConnection, for remote-track callbacks.
    pub fn rtc(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }

    /// Create an offer and install it as the local description.
    pub async fn create_offer(&self) -> Result<String> {
        self.set_state(PeerConnectionState::Negotiating).await;

        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| Error::SdpError(format!("failed to create offer: {e}")))?;

        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| Error::SdpError(format!("failed to set local description: {e}")))?;

        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| Error::SdpError("no local description after offer".to_string()))?;

        debug!(peer_id = %self.peer_id, "created offer");
        Ok(local.sdp)
    }

    /// Apply a remote offer and produce the answer.
    pub async fn create_answer(&self, offer_sdp: String) -> Result<String> {
        self.set_state(PeerConnectionState::Negotiating).await;

        let offer = RTCSessionDescription::offer(offer_sdp)
            .map_err(|e| Error::SdpError(format!("malformed offer: {e}")))?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| Error::SdpError(format!("failed to set remote offer: {e}")))?;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| Error::SdpError(format!("failed to create answer: {e}")))?;
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| Error::SdpError(format!("failed to set local description: {e}")))?;

        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| Error::SdpError("no local description after answer".to_string()))?;

        debug!(peer_id = %self.peer_id, "created answer");
        Ok(local.sdp)
    }

    /// Apply the remote answer to our offer.
    pub async fn apply_answer(&self, answer_sdp: String) -> Result<()> {
        let answer = RTCSessionDescription::answer(answer_sdp)
            .map_err(|e| Error::SdpError(format!("malformed answer: {e}")))?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| Error::SdpError(format!("failed to set remote answer: {e}")))?;
        Ok(())
    }

    /// Add a trickled remote ICE candidate.
    pub async fn add_remote_candidate(
        &self,
        candidate: String,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
    ) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate,
                sdp_mid,
                sdp_mline_index,
                ..Default::default()
            })
            .await
            .map_err(|e| Error::IceCandidateError(format!("failed to add candidate: {e}")))?;
        Ok(())
    }

    /// Write one encoded audio sample to the outbound track.
    pub async fn write_audio(&self, sample: Sample) -> Result<()> {
        self.audio_track.write_sample(&sample).await.map_err(|e| {
            warn!(peer_id = %self.peer_id, error = %e, "audio write failed");
            Error::PeerConnectionError(format!("audio write failed: {e}"))
        })
    }

    /// Attach an outbound video track to the live connection.
    ///
    /// The connection object is reused; the caller follows up with a
    /// renegotiation offer so the new track reaches the remote side.
    /// Attaching twice is an error.
    pub async fn attach_video_track(&self) -> Result<Arc<TrackLocalStaticSample>> {
        let mut slot = self.video_track.write().await;
        if slot.is_some() {
            return Err(Error::PeerConnectionError(format!(
                "video track already attached for peer {}",
                self.peer_id
            )));
        }

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: "video/VP8".to_string(),
                clock_rate: 90_000,
                ..Default::default()
            },
            format!("video-{}", self.user_id),
            format!("voice-{}", self.peer_id),
        ));

        self.pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| Error::PeerConnectionError(format!("failed to add video track: {e}")))?;

        info!(peer_id = %self.peer_id, "video track attached");
        *slot = Some(Arc::clone(&track));
        Ok(track)
    }

    /// Whether a video track has been attached.
    pub async fn has_video_track(&self) -> bool {
        self.video_track.read().await.is_some()
    }

    /// Write one encoded video sample to the outbound video track, if
    /// one has been attached.
    pub async fn write_video(&self, sample: Sample) -> Result<()> {
        let track = self.video_track.read().await.clone();
        let Some(track) = track else {
            return Err(Error::PeerConnectionError(format!(
                "no video track attached for peer {}",
                self.peer_id
            )));
        };
        track.write_sample(&sample).await.map_err(|e| {
            warn!(peer_id = %self.peer_id, error = %e, "video write failed");
            Error::PeerConnectionError(format!("video write failed: {e}"))
        })
    }

    /// How long this connection has been established.
    pub async fn connection_duration(&self) -> Option<std::time::Duration> {
        self.connected_at
            .read()
            .await
            .and_then(|t| t.elapsed().ok())
    }

    /// Tear the connection down. Idempotent.
    pub async fn close(&self) -> Result<()> {
        {
            let mut guard = self.state.write().await;
            if *guard == PeerConnectionState::Closed {
                return Ok(());
            }
            info!(peer_id = %self.peer_id, "closing peer connection");
            *guard = PeerConnectionState::Closed;
        }

        self.pc
            .close()
            .await
            .map_err(|e| Error::PeerConnectionError(format!("failed to close: {e}")))?;
        Ok(())
    }
}
