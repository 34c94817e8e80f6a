//! WebSocket Server Implementation
//!
//! Accepts client connections, attaches each one to the broadcast hub,
//! forwards serialized pipeline events, and services command requests
//! on the same connection. A connection that cannot be written to is
//! detached; nothing a single client does can take down the server.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::websocket::{commands, AppState};

/// WebSocket server for broadcasting telemetry and receiving commands.
pub struct WebSocketServer {
    /// Port to listen on
    port: u16,

    /// Shared pipeline handles for command dispatch
    state: Arc<AppState>,
}

impl WebSocketServer {
    pub fn new(port: u16, state: Arc<AppState>) -> Self {
        Self { port, state }
    }

    /// Start the server and accept connections until the task is dropped.
    pub async fn run(self) -> Result<()> {
        let addr = format!("127.0.0.1:{}", self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .context(format!("Failed to bind to {}", addr))?;

        info!("🌐 WebSocket server listening on {}", addr);

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    info!("🔌 New connection from {}", peer_addr);

                    let state = self.state.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer_addr, state).await {
                            warn!("⚠️  Connection error for {}: {}", peer_addr, e);
                        }
                        info!("👋 Client {} disconnected", peer_addr);
                    });
                }
                Err(e) => {
                    error!("❌ Failed to accept connection: {}", e);
                }
            }
        }
    }
}

/// Handle an individual WebSocket connection.
///
/// One select loop serves both directions: hub frames flow out, command
/// requests come in and are answered inline. Event-loop handlers never
/// block; serial and registry work behind the commands is lock-brief.
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<AppState>,
) -> Result<()> {
    let ws_stream = accept_async(stream)
        .await
        .context("Failed to accept WebSocket handshake")?;

    debug!("✅ WebSocket handshake completed for {}", peer_addr);

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    // Attach to the hub before anything can be published for us
    let (subscriber_id, mut frames) = state.hub.attach();

    let welcome = serde_json::json!({
        "type": "connection",
        "status": "connected",
        "message": "Ground Station Telemetry Backend",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });
    if let Err(e) = ws_sender.send(Message::Text(welcome.to_string())).await {
        state.hub.detach(subscriber_id);
        return Err(e).context("Failed to send welcome message");
    }

    loop {
        tokio::select! {
            // Pipeline events fanned out by the hub
            frame = frames.recv() => {
                match frame {
                    Some(frame) => {
                        if let Err(e) = ws_sender.send(Message::Text(frame.to_string())).await {
                            debug!("Failed to send to {}: {}", peer_addr, e);
                            break;
                        }
                    }
                    // The hub dropped us (backlog or shutdown)
                    None => break,
                }
            }

            // Command requests from the client
            incoming = ws_receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        debug!("📥 Received from {}: {}", peer_addr, text);
                        match serde_json::from_str::<serde_json::Value>(&text) {
                            Ok(request) => {
                                let response = commands::handle_command(&state, request).await;
                                if let Err(e) = ws_sender.send(Message::Text(response.to_string())).await {
                                    debug!("Failed to respond to {}: {}", peer_addr, e);
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!("⚠️  Malformed request from {}: {}", peer_addr, e);
                            }
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!("🚪 Close frame from {}: {:?}", peer_addr, frame);
                        break;
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        // Pong is automatically handled by tungstenite
                    }
                    Some(Ok(Message::Binary(data))) => {
                        debug!("📥 Ignoring binary frame from {}: {} bytes", peer_addr, data.len());
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => {
                        warn!("⚠️  Error receiving from {}: {}", peer_addr, e);
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    // Transport failures and disconnects both end here: detach and close
    state.hub.detach(subscriber_id);
    let _ = ws_sender.send(Message::Close(None)).await;

    Ok(())
}
