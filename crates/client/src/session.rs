//! Voice session orchestration
//!
//! A [`VoiceSession`] joins one channel and runs until it leaves or the
//! signaling connection drops. The join order is deliberate: the
//! microphone is acquired before any network traffic, so a device
//! failure aborts the join without ever registering the user in the
//! channel. After the roster arrives, the session offers to every
//! existing occupant; occupants only ever answer newcomers, which keeps
//! offer/answer roles unambiguous when two clients join back to back.

use crate::config::ClientConfig;
use crate::encoder::{VoiceEncoder, VoiceEncoderConfig};
use crate::events::{EventSink, VoiceEvent};
use crate::media::{AudioFrame, CaptureHandle, MediaStreamManager};
use crate::peer::{PeerConnection, PeerConnectionState, PeerManager, PeerStateEvent, RecoveryAction};
use crate::ptt::{InputEvent, PushToTalkGate, TransmitTransition};
use crate::vad::VoiceActivityDetector;
use crate::video::{self, VideoCaptureHandle, VideoConstraints, VideoFrame, VideoSource};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use meshvoice_core::{ChannelId, Error, Result, SignalingMessage, TransportId, UserId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::media::Sample;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Interval at which the session renews its registry entry
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Commands from the session handle into the loop.
enum Command {
    Input(InputEvent),
    Renegotiate(TransportId),
    EnableVideo {
        source: Arc<dyn VideoSource>,
        constraints: VideoConstraints,
    },
    Leave,
}

/// Handle to a running voice session.
///
/// Dropping the handle does not leave the channel; call [`leave`] for a
/// clean exit. The session also ends on its own when the signaling
/// connection closes.
///
/// [`leave`]: VoiceSession::leave
pub struct VoiceSession {
    cmd_tx: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
    transmitting: Arc<AtomicBool>,
}

impl VoiceSession {
    /// Join a channel and start the session loop.
    ///
    /// Returns the session handle and the event stream. Fails without
    /// side effects when the microphone cannot be acquired, the server
    /// is unreachable, or the join is rejected.
    pub async fn join(
        config: ClientConfig,
        channel_id: ChannelId,
    ) -> Result<(Self, mpsc::Receiver<VoiceEvent>)> {
        config.validate()?;

        // Microphone first: a device failure must abort the join before
        // the user is visible to anyone
        let (capture, frame_rx) = MediaStreamManager::start_capture(config.input_device.as_deref())?;

        let (ws, _) = connect_async(&config.signaling_url)
            .await
            .map_err(|e| Error::WebSocketError(format!("connect failed: {e}")))?;
        let (sink, mut stream) = ws.split();

        let (ws_tx, ws_rx) = mpsc::unbounded_channel::<SignalingMessage>();
        tokio::spawn(drain_outgoing(ws_rx, sink));

        ws_tx
            .send(SignalingMessage::Join {
                channel_id: channel_id.clone(),
                user_id: config.user_id.clone(),
            })
            .map_err(|_| Error::WebSocketError("connection closed during join".to_string()))?;

        let (local_peer_id, occupants, ice) =
            tokio::time::timeout(config.negotiation_timeout, await_joined(&mut stream))
                .await
                .map_err(|_| Error::SessionError("timed out waiting for join ack".to_string()))??;

        info!(peer_id = %local_peer_id, occupants = occupants.len(), %channel_id, "joined channel");

        let (events, event_rx) = EventSink::channel(config.event_buffer);
        events.emit(VoiceEvent::ChannelJoined {
            peer_id: local_peer_id.clone(),
            occupants: occupants.iter().map(|o| o.user_id.clone()).collect(),
        });

        let (manager, state_rx) = PeerManager::new(ice);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let transmitting = Arc::new(AtomicBool::new(false));

        let mut roster: HashMap<TransportId, UserId> = HashMap::new();

        // As the newcomer, offer to everyone already present
        for occupant in occupants {
            roster.insert(occupant.peer_id.clone(), occupant.user_id.clone());
            match manager
                .create_peer(occupant.peer_id.clone(), occupant.user_id.clone())
                .await
            {
                Ok(conn) => {
                    wire_connection(&conn, &local_peer_id, &ws_tx);
                    match conn.create_offer().await {
                        Ok(sdp) => {
                            let _ = ws_tx.send(SignalingMessage::Offer {
                                from: local_peer_id.clone(),
                                to: occupant.peer_id.clone(),
                                sdp,
                            });
                        }
                        Err(e) => {
                            warn!(peer_id = %occupant.peer_id, error = %e, "offer failed");
                            manager.remove_peer(&occupant.peer_id).await;
                        }
                    }
                }
                Err(e) => warn!(peer_id = %occupant.peer_id, error = %e, "peer setup failed"),
            }
        }

        let gate = PushToTalkGate::new(config.ptt.clone())?;
        let vad = VoiceActivityDetector::new(config.vad.clone())?;
        let encoder = VoiceEncoder::new(&VoiceEncoderConfig::default())?;

        let session_loop = SessionLoop {
            config,
            local_peer_id,
            manager,
            gate,
            vad,
            encoder,
            roster,
            events,
            ws_tx,
            cmd_tx: cmd_tx.clone(),
            transmitting: Arc::clone(&transmitting),
            video_enabled: false,
            _capture: capture,
            _video_capture: None,
        };

        let task = tokio::spawn(session_loop.run(stream, frame_rx, state_rx, cmd_rx));

        Ok((
            Self {
                cmd_tx,
                task,
                transmitting,
            },
            event_rx,
        ))
    }

    /// Feed a platform input event (key or focus) into the push-to-talk
    /// gate.
    pub fn handle_input(&self, event: InputEvent) {
        let _ = self.cmd_tx.send(Command::Input(event));
    }

    /// Whether the local gate is currently open.
    pub fn is_transmitting(&self) -> bool {
        self.transmitting.load(Ordering::Relaxed)
    }

    /// Start sending camera or screen video to every peer.
    ///
    /// Acquisition runs inside the session loop; a device failure is
    /// reported as a [`VoiceEvent::Error`] rather than tearing the call
    /// down. Each live connection gets the video track attached and is
    /// re-offered in place.
    pub fn enable_video(&self, source: Arc<dyn VideoSource>, constraints: VideoConstraints) {
        let _ = self.cmd_tx.send(Command::EnableVideo {
            source,
            constraints,
        });
    }

    /// Leave the channel and wait for the session loop to finish.
    pub async fn leave(self) {
        let _ = self.cmd_tx.send(Command::Leave);
        let _ = self.task.await;
    }
}

/// Wait for the server's join acknowledgement, surfacing a server-side
/// rejection as a session error.
async fn await_joined(
    stream: &mut SplitStream<WsStream>,
) -> Result<(
    TransportId,
    Vec<meshvoice_core::OccupantInfo>,
    meshvoice_core::IceConfiguration,
)> {
    while let Some(frame) = stream.next().await {
        let frame = frame.map_err(|e| Error::WebSocketError(e.to_string()))?;
        let Message::Text(text) = frame else { continue };
        match SignalingMessage::from_json(&text) {
            Ok(SignalingMessage::Joined {
                peer_id,
                occupants,
                ice,
            }) => return Ok((peer_id, occupants, ice)),
            Ok(SignalingMessage::Error { message }) => {
                return Err(Error::SessionError(message));
            }
            Ok(other) => debug!(?other, "ignoring pre-join message"),
            Err(e) => warn!(error = %e, "malformed frame while joining"),
        }
    }
    Err(Error::WebSocketError(
        "connection closed before join ack".to_string(),
    ))
}

async fn drain_outgoing(
    mut rx: mpsc::UnboundedReceiver<SignalingMessage>,
    mut sink: SplitSink<WsStream, Message>,
) {
    while let Some(msg) = rx.recv().await {
        match msg.to_json() {
            Ok(text) => {
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            Err(e) => warn!(error = %e, "failed to encode outbound message"),
        }
    }
    let _ = sink.close().await;
}

/// Register candidate trickling and remote-track draining on a fresh
/// connection.
fn wire_connection(
    conn: &Arc<PeerConnection>,
    local_peer_id: &str,
    ws_tx: &mpsc::UnboundedSender<SignalingMessage>,
) {
    let pc = conn.rtc();

    let from = local_peer_id.to_string();
    let to = conn.peer_id().to_string();
    let tx = ws_tx.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let from = from.clone();
        let to = to.clone();
        let tx = tx.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else { return };
            match candidate.to_json() {
                Ok(init) => {
                    let _ = tx.send(SignalingMessage::IceCandidate {
                        from,
                        to,
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    });
                }
                Err(e) => warn!(error = %e, "failed to serialize local candidate"),
            }
        })
    }));

    let peer_id = conn.peer_id().to_string();
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let peer_id = peer_id.clone();
        Box::pin(async move {
            info!(%peer_id, kind = %track.kind(), "remote track attached");
            // Drain RTP so the receiver keeps feeding the playback path
            tokio::spawn(async move {
                while track.read_rtp().await.is_ok() {}
                debug!(%peer_id, "remote track ended");
            });
        })
    }));
}

struct SessionLoop {
    config: ClientConfig,
    local_peer_id: TransportId,
    manager: Arc<PeerManager>,
    gate: PushToTalkGate,
    vad: VoiceActivityDetector,
    encoder: VoiceEncoder,
    roster: HashMap<TransportId, UserId>,
    events: EventSink,
    ws_tx: mpsc::UnboundedSender<SignalingMessage>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    transmitting: Arc<AtomicBool>,
    video_enabled: bool,
    _capture: CaptureHandle,
    _video_capture: Option<VideoCaptureHandle>,
}

impl SessionLoop {
    async fn run(
        mut self,
        mut stream: SplitStream<WsStream>,
        mut frame_rx: mpsc::Receiver<AudioFrame>,
        mut state_rx: mpsc::UnboundedReceiver<PeerStateEvent>,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    ) {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        // Present only after the user enables video
        let mut video_rx: Option<mpsc::Receiver<VideoFrame>> = None;

        loop {
            let gate_deadline = self.gate.next_deadline();

            tokio::select! {
                frame = stream.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => match SignalingMessage::from_json(&text) {
                            Ok(msg) => self.handle_server_message(msg).await,
                            Err(e) => warn!(error = %e, "malformed server frame"),
                        },
                        Some(Ok(Message::Close(_))) | None => {
                            self.shutdown("signaling connection closed").await;
                            return;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            self.shutdown(&format!("signaling error: {e}")).await;
                            return;
                        }
                    }
                }

                Some(frame) = frame_rx.recv() => {
                    self.handle_capture_frame(frame).await;
                }

                frame = recv_opt(&mut video_rx) => {
                    match frame {
                        Some(frame) => self.handle_video_frame(frame).await,
                        None => {
                            info!("video source ended");
                            video_rx = None;
                            self._video_capture = None;
                        }
                    }
                }

                Some(event) = state_rx.recv() => {
                    self.handle_peer_state(event).await;
                }

                Some(cmd) = cmd_rx.recv() => {
                    match cmd {
                        Command::Input(event) => {
                            let transition = self.gate.handle_input(event, Instant::now());
                            self.apply_transition(transition);
                        }
                        Command::Renegotiate(peer_id) => self.renegotiate(&peer_id).await,
                        Command::EnableVideo { source, constraints } => {
                            match self.enable_video(source.as_ref(), &constraints).await {
                                Ok((handle, rx)) => {
                                    self._video_capture = Some(handle);
                                    video_rx = Some(rx);
                                }
                                Err(e) => {
                                    warn!(error = %e, "video acquisition failed");
                                    self.events.emit(VoiceEvent::Error {
                                        message: format!("video unavailable: {e}"),
                                    });
                                }
                            }
                        }
                        Command::Leave => {
                            let _ = self.ws_tx.send(SignalingMessage::Leave);
                            self.shutdown("left channel").await;
                            return;
                        }
                    }
                }

                _ = heartbeat.tick() => {
                    let _ = self.ws_tx.send(SignalingMessage::Heartbeat);
                }

                _ = sleep_until_opt(gate_deadline) => {
                    let transition = self.gate.poll(Instant::now());
                    self.apply_transition(transition);
                }
            }
        }
    }

    async fn shutdown(&mut self, reason: &str) {
        info!(reason, "session ending");
        self.manager.close_all().await;
        if self.transmitting.swap(false, Ordering::Relaxed) {
            self.events
                .emit(VoiceEvent::TransmitChanged { transmitting: false });
        }
        self.events.emit(VoiceEvent::ChannelLeft {
            reason: reason.to_string(),
        });
    }

    fn apply_transition(&mut self, transition: Option<TransmitTransition>) {
        let Some(transition) = transition else { return };
        let transmitting = transition == TransmitTransition::Started;
        if !transmitting {
            // Buffered tail samples would otherwise leak into the next
            // transmission burst
            self.encoder.reset();
        }
        self.transmitting.store(transmitting, Ordering::Relaxed);
        self.events.emit(VoiceEvent::TransmitChanged { transmitting });
        let _ = self.ws_tx.send(SignalingMessage::TransmitState {
            user_id: self.config.user_id.clone(),
            transmitting,
        });
    }

    async fn handle_capture_frame(&mut self, frame: AudioFrame) {
        if let Some(vad_event) = self.vad.process_frame(&frame.samples) {
            self.events.emit(VoiceEvent::SpeakingChanged {
                speaking: vad_event.speaking,
            });
            let transition = self.gate.vad_changed(vad_event.speaking, Instant::now());
            self.apply_transition(transition);
        }

        if !self.transmitting.load(Ordering::Relaxed) {
            return;
        }

        // The track is Opus; raw capture samples are encoded into 20ms
        // packets before they touch the RTP path
        let packets = match self.encoder.push(&frame.samples) {
            Ok(packets) => packets,
            Err(e) => {
                warn!(error = %e, "audio encoding failed");
                return;
            }
        };

        for packet in packets {
            let sample = Sample {
                data: packet.data.into(),
                duration: packet.duration,
                ..Default::default()
            };
            for peer_id in self.manager.peer_ids().await {
                if let Some(conn) = self.manager.get(&peer_id).await {
                    if conn.state().await == PeerConnectionState::Connected {
                        // webrtc-media's `Sample` does not implement `Clone`;
                        // copy it field-by-field (`Bytes` clones by refcount)
                        let sample = Sample {
                            data: sample.data.clone(),
                            timestamp: sample.timestamp,
                            duration: sample.duration,
                            packet_timestamp: sample.packet_timestamp,
                            prev_dropped_packets: sample.prev_dropped_packets,
                            prev_padding_packets: sample.prev_padding_packets,
                        };
                        let _ = conn.write_audio(sample).await;
                    }
                }
            }
        }
    }

    async fn handle_video_frame(&mut self, frame: VideoFrame) {
        let sample = Sample {
            data: frame.data.into(),
            duration: frame.duration,
            ..Default::default()
        };
        for peer_id in self.manager.peer_ids().await {
            if let Some(conn) = self.manager.get(&peer_id).await {
                if conn.state().await == PeerConnectionState::Connected
                    && conn.has_video_track().await
                {
                    // webrtc-media's `Sample` does not implement `Clone`;
                    // copy it field-by-field (`Bytes` clones by refcount)
                    let sample = Sample {
                        data: sample.data.clone(),
                        timestamp: sample.timestamp,
                        duration: sample.duration,
                        packet_timestamp: sample.packet_timestamp,
                        prev_dropped_packets: sample.prev_dropped_packets,
                        prev_padding_packets: sample.prev_padding_packets,
                    };
                    let _ = conn.write_video(sample).await;
                }
            }
        }
    }

    /// Acquire the video source, then attach a track to every live
    /// connection and re-offer each one in place.
    async fn enable_video(
        &mut self,
        source: &dyn VideoSource,
        constraints: &VideoConstraints,
    ) -> Result<(VideoCaptureHandle, mpsc::Receiver<VideoFrame>)> {
        let acquired = video::acquire(source, constraints)?;
        self.video_enabled = true;
        info!(source = %constraints.source, "video enabled");

        for peer_id in self.manager.peer_ids().await {
            let Some(conn) = self.manager.get(&peer_id).await else { continue };
            if conn.has_video_track().await {
                continue;
            }
            if let Err(e) = conn.attach_video_track().await {
                warn!(%peer_id, error = %e, "failed to attach video track");
                continue;
            }
            // The media set changed; the existing connection is
            // re-offered, not replaced
            match conn.create_offer().await {
                Ok(sdp) => {
                    let _ = self.ws_tx.send(SignalingMessage::Offer {
                        from: self.local_peer_id.clone(),
                        to: peer_id,
                        sdp,
                    });
                }
                Err(e) => warn!(%peer_id, error = %e, "video renegotiation offer failed"),
            }
        }

        Ok(acquired)
    }

    async fn handle_server_message(&mut self, msg: SignalingMessage) {
        match msg {
            SignalingMessage::Offer { from, sdp, .. } => self.handle_offer(from, sdp).await,
            SignalingMessage::Answer { from, sdp, .. } => {
                match self.manager.get(&from).await {
                    Some(conn) => {
                        if let Err(e) = conn.apply_answer(sdp).await {
                            warn!(peer_id = %from, error = %e, "failed to apply answer");
                        }
                    }
                    None => debug!(peer_id = %from, "answer for unknown peer discarded"),
                }
            }
            SignalingMessage::IceCandidate {
                from,
                candidate,
                sdp_mid,
                sdp_mline_index,
                ..
            } => match self.manager.get(&from).await {
                Some(conn) => {
                    if let Err(e) = conn
                        .add_remote_candidate(candidate, sdp_mid, sdp_mline_index)
                        .await
                    {
                        warn!(peer_id = %from, error = %e, "failed to add remote candidate");
                    }
                }
                None => debug!(peer_id = %from, "candidate for unknown peer discarded"),
            },
            SignalingMessage::PeerJoined { peer_id, user_id } => {
                // The newcomer offers; our connection appears when their
                // offer arrives
                self.roster.insert(peer_id.clone(), user_id.clone());
                self.events.emit(VoiceEvent::PeerJoined { peer_id, user_id });
            }
            SignalingMessage::PeerLeft { peer_id } => {
                self.roster.remove(&peer_id);
                self.manager.remove_peer(&peer_id).await;
                self.events.emit(VoiceEvent::PeerLeft { peer_id });
            }
            SignalingMessage::TransmitState {
                user_id,
                transmitting,
            } => {
                self.events.emit(VoiceEvent::RemoteTransmitChanged {
                    user_id,
                    transmitting,
                });
            }
            SignalingMessage::Error { message } => {
                warn!(%message, "server error");
                self.events.emit(VoiceEvent::Error { message });
            }
            other => debug!(?other, "unexpected server message"),
        }
    }

    async fn handle_offer(&mut self, from: TransportId, sdp: String) {
        // Membership is authoritative. An offer from a sender not in
        // the roster is stale (they already left) and must not
        // resurrect a connection for them.
        let Some(user_id) = self.roster.get(&from).cloned() else {
            debug!(peer_id = %from, "offer from non-member discarded");
            return;
        };

        let conn = if let Some(existing) = self.manager.get(&from).await {
            let state = existing.state().await;
            if state.is_recoverable() || state.is_terminal() {
                // The offerer gave up on the old transport and started
                // over; answer from a fresh connection of our own
                info!(peer_id = %from, ?state, "re-offer for a dead connection, recreating");
                match self.manager.recreate_peer(&from).await {
                    Ok(conn) => {
                        wire_connection(&conn, &self.local_peer_id, &self.ws_tx);
                        conn
                    }
                    Err(e) => {
                        warn!(peer_id = %from, error = %e, "failed to recreate answering peer");
                        return;
                    }
                }
            } else {
                // Mid-call renegotiation (the peer changed its media
                // set, e.g. enabled video); answer in place
                debug!(peer_id = %from, "renegotiation offer for live peer");
                existing
            }
        } else {
            match self.manager.create_peer(from.clone(), user_id).await {
                Ok(conn) => {
                    wire_connection(&conn, &self.local_peer_id, &self.ws_tx);
                    conn
                }
                Err(e) => {
                    warn!(peer_id = %from, error = %e, "failed to create answering peer");
                    return;
                }
            }
        };

        if self.video_enabled && !conn.has_video_track().await {
            if let Err(e) = conn.attach_video_track().await {
                warn!(peer_id = %from, error = %e, "failed to attach video track");
            }
        }

        match conn.create_answer(sdp).await {
            Ok(answer) => {
                let _ = self.ws_tx.send(SignalingMessage::Answer {
                    from: self.local_peer_id.clone(),
                    to: from,
                    sdp: answer,
                });
            }
            Err(e) => {
                warn!(peer_id = %from, error = %e, "failed to answer offer");
                self.manager.remove_peer(&from).await;
            }
        }
    }

    async fn handle_peer_state(&mut self, event: PeerStateEvent) {
        self.events.emit(VoiceEvent::PeerStateChanged {
            peer_id: event.peer_id.clone(),
            state: event.state,
        });

        match self.manager.on_state_change(&event).await {
            RecoveryAction::None => {}
            RecoveryAction::Renegotiate => {
                // Disconnections often self-heal; give them the grace
                // period before re-offering. Failures retry at once.
                let delay = if event.state == PeerConnectionState::Disconnected {
                    self.config.disconnect_grace
                } else {
                    Duration::ZERO
                };
                self.schedule_renegotiate(event.peer_id, delay);
            }
            RecoveryAction::Remove => {
                self.manager.remove_peer(&event.peer_id).await;
                self.events.emit(VoiceEvent::PeerLeft {
                    peer_id: event.peer_id,
                });
            }
        }
    }

    fn schedule_renegotiate(&self, peer_id: TransportId, delay: Duration) {
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let _ = cmd_tx.send(Command::Renegotiate(peer_id));
        });
    }

    async fn renegotiate(&mut self, peer_id: &str) {
        let Some(conn) = self.manager.get(peer_id).await else { return };
        if conn.state().await == PeerConnectionState::Connected {
            // Self-healed during the grace period; the recovery
            // attempt stays unspent
            debug!(%peer_id, "connection recovered on its own");
            return;
        }

        // The attempt is consumed here, at the moment a re-offer is
        // actually issued
        if !conn.take_recovery_attempt() {
            info!(%peer_id, "recovery attempt already spent, dropping peer");
            self.manager.remove_peer(peer_id).await;
            self.events.emit(VoiceEvent::PeerLeft {
                peer_id: peer_id.to_string(),
            });
            return;
        }

        // ICE state is stuck on the old transport; a re-offer only
        // helps from a fresh connection
        let replacement = match self.manager.recreate_peer(peer_id).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(%peer_id, error = %e, "failed to recreate peer for recovery");
                return;
            }
        };
        wire_connection(&replacement, &self.local_peer_id, &self.ws_tx);

        if self.video_enabled {
            if let Err(e) = replacement.attach_video_track().await {
                warn!(%peer_id, error = %e, "failed to attach video track");
            }
        }

        match replacement.create_offer().await {
            Ok(sdp) => {
                let _ = self.ws_tx.send(SignalingMessage::Offer {
                    from: self.local_peer_id.clone(),
                    to: peer_id.to_string(),
                    sdp,
                });
            }
            Err(e) => warn!(%peer_id, error = %e, "renegotiation failed"),
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}

/// Receive from a channel that may not exist yet. Pends forever while
/// the option is empty so it can sit in a select arm.
async fn recv_opt<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshvoice_core::IceConfiguration;

    /// A session loop with no microphone or network behind it, for
    /// driving [`SessionLoop::handle_server_message`] directly.
    /// Outbound signaling lands on the returned receiver.
    fn offline_loop() -> (
        SessionLoop,
        mpsc::UnboundedReceiver<SignalingMessage>,
        mpsc::Receiver<VoiceEvent>,
        mpsc::UnboundedReceiver<PeerStateEvent>,
    ) {
        let config = ClientConfig::new("ws://127.0.0.1:9/", "alice");
        let (manager, state_rx) = PeerManager::new(IceConfiguration::default());
        let (events, event_rx) = EventSink::channel(32);
        let (ws_tx, ws_rx) = mpsc::unbounded_channel();
        let (cmd_tx, _cmd_rx) = mpsc::unbounded_channel();
        let gate = PushToTalkGate::new(config.ptt.clone()).unwrap();
        let vad = VoiceActivityDetector::new(config.vad.clone()).unwrap();
        let encoder = VoiceEncoder::new(&VoiceEncoderConfig::default()).unwrap();

        let session = SessionLoop {
            config,
            local_peer_id: "t-local".to_string(),
            manager,
            gate,
            vad,
            encoder,
            roster: HashMap::new(),
            events,
            ws_tx,
            cmd_tx,
            transmitting: Arc::new(AtomicBool::new(false)),
            video_enabled: false,
            _capture: CaptureHandle::detached(),
            _video_capture: None,
        };
        (session, ws_rx, event_rx, state_rx)
    }

    /// A real offer SDP from a scratch connection, for feeding the
    /// answering path.
    async fn real_offer_sdp() -> String {
        let (manager, _rx) = PeerManager::new(IceConfiguration::default());
        let conn = manager
            .create_peer("t-scratch".to_string(), "scratch".to_string())
            .await
            .unwrap();
        conn.create_offer().await.unwrap()
    }

    #[tokio::test]
    async fn test_peer_joined_creates_no_connection_and_sends_nothing() {
        let (mut session, mut ws_rx, _events, _state_rx) = offline_loop();

        session
            .handle_server_message(SignalingMessage::PeerJoined {
                peer_id: "t-new".to_string(),
                user_id: "bob".to_string(),
            })
            .await;

        // The newcomer offers; we only track them in the roster
        assert_eq!(session.manager.peer_count().await, 0);
        assert!(ws_rx.try_recv().is_err());
        assert_eq!(session.roster.get("t-new"), Some(&"bob".to_string()));
    }

    #[tokio::test]
    async fn test_offer_from_non_member_is_dropped() {
        let (mut session, mut ws_rx, _events, _state_rx) = offline_loop();
        let sdp = real_offer_sdp().await;

        session
            .handle_server_message(SignalingMessage::Offer {
                from: "t-ghost".to_string(),
                to: "t-local".to_string(),
                sdp,
            })
            .await;

        assert_eq!(session.manager.peer_count().await, 0);
        assert!(ws_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_offer_after_peer_left_is_dropped() {
        let (mut session, mut ws_rx, _events, _state_rx) = offline_loop();
        let sdp = real_offer_sdp().await;

        session
            .handle_server_message(SignalingMessage::PeerJoined {
                peer_id: "t-b".to_string(),
                user_id: "bob".to_string(),
            })
            .await;
        session
            .handle_server_message(SignalingMessage::PeerLeft {
                peer_id: "t-b".to_string(),
            })
            .await;

        // A late offer from the departed peer must not resurrect them
        session
            .handle_server_message(SignalingMessage::Offer {
                from: "t-b".to_string(),
                to: "t-local".to_string(),
                sdp,
            })
            .await;

        assert_eq!(session.manager.peer_count().await, 0);
        assert!(ws_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_offer_from_roster_member_is_answered() {
        let (mut session, mut ws_rx, _events, _state_rx) = offline_loop();
        let sdp = real_offer_sdp().await;

        session
            .handle_server_message(SignalingMessage::PeerJoined {
                peer_id: "t-b".to_string(),
                user_id: "bob".to_string(),
            })
            .await;
        session
            .handle_server_message(SignalingMessage::Offer {
                from: "t-b".to_string(),
                to: "t-local".to_string(),
                sdp,
            })
            .await;

        assert_eq!(session.manager.peer_count().await, 1);
        // Trickled candidates may interleave; only the answer matters
        let mut answered = false;
        while let Ok(msg) = ws_rx.try_recv() {
            if let SignalingMessage::Answer { to, .. } = msg {
                assert_eq!(to, "t-b");
                answered = true;
            }
        }
        assert!(answered);
    }

    #[tokio::test]
    async fn test_sleep_until_none_never_fires() {
        let quick = tokio::time::timeout(
            Duration::from_millis(20),
            sleep_until_opt(None),
        )
        .await;
        assert!(quick.is_err());

        let due = tokio::time::timeout(
            Duration::from_millis(200),
            sleep_until_opt(Some(Instant::now() + Duration::from_millis(10))),
        )
        .await;
        assert!(due.is_ok());
    }
}
