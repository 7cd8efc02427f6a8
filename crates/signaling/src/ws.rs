//! WebSocket signaling transport
//!
//! Accept loop plus per-connection handler. Each accepted socket becomes
//! one transport: an unbounded outbound queue feeds the write half (which
//! preserves per-pair FIFO ordering for relayed negotiation messages),
//! and the read half feeds the relay. The first frame on a fresh socket
//! must be a `Join`.

use crate::relay::SignalingRelay;
use crate::SignalingConfig;
use futures_util::{SinkExt, StreamExt};
use meshvoice_core::{new_transport_id, Error, Result, SignalingMessage};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// WebSocket signaling server
pub struct SignalingServer {
    addr: SocketAddr,
    relay: Arc<SignalingRelay>,
    eviction_interval: std::time::Duration,
}

impl SignalingServer {
    /// Create a server that will bind to the configured port.
    pub fn new(config: &SignalingConfig, relay: Arc<SignalingRelay>) -> Self {
        let addr: SocketAddr = ([0, 0, 0, 0], config.bind_port).into();
        Self {
            addr,
            relay,
            eviction_interval: config.eviction_interval,
        }
    }

    /// Bind the listener and start accepting connections.
    ///
    /// The eviction sweep is spawned alongside the accept loop; both stop
    /// when the returned handle is shut down.
    pub async fn start(self) -> Result<SignalingServerHandle> {
        let listener = TcpListener::bind(&self.addr).await?;
        let local_addr = listener.local_addr()?;
        info!("signaling server listening on ws://{local_addr}");

        let (shutdown_tx, _) = broadcast::channel::<()>(1);

        let sweep = tokio::spawn(
            Arc::clone(&self.relay)
                .run_eviction_sweep(self.eviction_interval, shutdown_tx.subscribe()),
        );

        let pump_relay = Arc::clone(&self.relay);
        let pump_shutdown = shutdown_tx.subscribe();
        let bus_pump = tokio::spawn(async move {
            if let Err(e) = pump_relay.run_bus_pump(pump_shutdown).await {
                error!("bus pump failed: {e}");
            }
        });

        let relay = Arc::clone(&self.relay);
        let mut shutdown_rx = shutdown_tx.subscribe();
        let accept_loop = tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer_addr)) => {
                                debug!("accepted connection from {peer_addr}");
                                let relay = Arc::clone(&relay);
                                tokio::spawn(async move {
                                    if let Err(e) = handle_connection(stream, relay).await {
                                        debug!("connection from {peer_addr} ended with error: {e}");
                                    }
                                });
                            }
                            Err(e) => {
                                error!("failed to accept connection: {e}");
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("signaling server accept loop shutting down");
                        break;
                    }
                }
            }
        });

        Ok(SignalingServerHandle {
            local_addr,
            shutdown_tx,
            accept_loop,
            sweep,
            bus_pump,
        })
    }
}

/// Handle for controlling a running signaling server
pub struct SignalingServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    accept_loop: JoinHandle<()>,
    sweep: JoinHandle<()>,
    bus_pump: JoinHandle<()>,
}

impl SignalingServerHandle {
    /// The bound address (useful when binding to port 0 in tests).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections and end the background tasks.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.accept_loop.await;
        let _ = self.sweep.await;
        let _ = self.bus_pump.await;
    }
}

/// Serve one WebSocket connection until it closes.
async fn handle_connection(stream: TcpStream, relay: Arc<SignalingRelay>) -> Result<()> {
    let ws = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| Error::WebSocketError(format!("handshake failed: {e}")))?;
    let (mut sink, mut source) = ws.split();

    let transport_id = new_transport_id();
    let (tx, mut rx) = mpsc::unbounded_channel::<SignalingMessage>();

    // Writer half: drain the outbound queue into the socket
    let writer_transport = transport_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let json = match message.to_json() {
                Ok(json) => json,
                Err(e) => {
                    warn!(transport = %writer_transport, "failed to encode outbound message: {e}");
                    continue;
                }
            };
            if sink.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut joined = false;
    while let Some(frame) = source.next().await {
        let frame = match frame {
            Ok(f) => f,
            Err(e) => {
                debug!(transport = %transport_id, "socket read error: {e}");
                break;
            }
        };

        let text = match frame {
            Message::Text(text) => text,
            Message::Close(_) => break,
            // Pings are answered by tungstenite; binary frames have no
            // meaning in this protocol
            _ => continue,
        };

        let message = match SignalingMessage::from_json(&text) {
            Ok(m) => m,
            Err(e) => {
                debug!(transport = %transport_id, "rejecting malformed frame: {e}");
                let _ = tx.send(SignalingMessage::Error {
                    message: "malformed signaling message".to_string(),
                });
                continue;
            }
        };

        if !joined {
            match message {
                SignalingMessage::Join {
                    channel_id,
                    user_id,
                } => {
                    match relay
                        .handle_join(&transport_id, &user_id, &channel_id, tx.clone())
                        .await
                    {
                        Ok(()) => joined = true,
                        Err(e) => {
                            // Authorization and capacity failures surface to
                            // the caller; nothing was registered
                            let _ = tx.send(SignalingMessage::Error {
                                message: e.to_string(),
                            });
                            break;
                        }
                    }
                }
                other => {
                    debug!(
                        transport = %transport_id,
                        "first frame must be join, got {other:?}"
                    );
                    let _ = tx.send(SignalingMessage::Error {
                        message: "expected join".to_string(),
                    });
                    break;
                }
            }
            continue;
        }

        if let Err(e) = relay.handle_message(&transport_id, message).await {
            warn!(transport = %transport_id, "message handling failed: {e}");
            let _ = tx.send(SignalingMessage::Error {
                message: e.to_string(),
            });
        }
    }

    if joined {
        relay.handle_disconnect(&transport_id).await?;
    }
    drop(tx);
    let _ = writer.await;

    Ok(())
}
