//! WebSocket Server
//!
//! Accept loop and per-connection handler.
//!
//! ```text
//!                      CouncilServer
//!                           │
//!          ┌────────────────┼────────────────┐
//!          │                │                │
//!     session-1         session-2        session-3
//!   reader │ writer   reader │ writer   reader │ writer
//!          └───────── Dispatcher (shared) ───┘
//! ```
//!
//! Each connection runs a reader loop and a writer task. The writer is the
//! only code that touches the socket sink; everything else reaches it
//! through the session's [`Multiplexer`] queue, so frames from concurrent
//! model subtasks are never interleaved mid-write.
//!
//! Turns outlive their connection. When the client drops, the writer is
//! stopped and later events are discarded, but the turn still persists.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn, Instrument};

use crate::config::ServerConfig;
use crate::dispatcher::Dispatcher;
use crate::messages::SessionId;
use crate::multiplexer::Multiplexer;
use crate::protocol::ServerEvent;
use crate::session::{Session, TurnSlot};
use crate::transport::frame::{decode_request, encode};

const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// Connection bookkeeping
struct ConnectionState {
    connected_at: Instant,
    peer: SocketAddr,
    turn: TurnSlot,
    abort_handle: tokio::task::AbortHandle,
}

/// Statistics for a single connection
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    /// Session bound to the connection
    pub session_id: SessionId,
    /// Remote address
    pub peer: SocketAddr,
    /// Connection uptime in seconds
    pub uptime_secs: u64,
    /// Whether a turn is in flight
    pub turn_in_flight: bool,
}

/// Duplex channel server
pub struct CouncilServer {
    config: ServerConfig,
    dispatcher: Dispatcher,
    connections: Arc<DashMap<SessionId, ConnectionState>>,
}

impl CouncilServer {
    /// Create a server around a dispatcher
    pub fn new(config: ServerConfig, dispatcher: Dispatcher) -> Self {
        Self {
            config,
            dispatcher,
            connections: Arc::new(DashMap::new()),
        }
    }

    /// Bind the configured address
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn bind(&self) -> Result<TcpListener> {
        TcpListener::bind(&self.config.bind_address)
            .await
            .with_context(|| format!("Failed to bind to {}", self.config.bind_address))
    }

    /// Bind and serve until `shutdown` is set
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn run(&self, shutdown: Arc<AtomicBool>) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` is set
    ///
    /// # Errors
    ///
    /// Currently infallible once the listener exists; accept errors are
    /// logged and the loop continues.
    pub async fn serve(&self, listener: TcpListener, shutdown: Arc<AtomicBool>) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!(addr = %addr, "Listening for connections");
        }

        loop {
            if shutdown.load(Ordering::SeqCst) {
                info!("Shutdown requested, stopping accept loop");
                break;
            }

            // Accept with timeout to allow checking shutdown flag
            let (stream, peer) = match tokio::time::timeout(ACCEPT_POLL, listener.accept()).await {
                Ok(Ok(accepted)) => accepted,
                Ok(Err(e)) => {
                    error!(error = %e, "Accept failed");
                    continue;
                }
                Err(_) => continue,
            };

            if self.connections.len() >= self.config.max_connections {
                warn!(peer = %peer, "Connection limit reached, rejecting new connection");
                drop(stream);
                continue;
            }

            let session = Session::new();
            let session_id = session.id.clone();
            let turn = session.turn().clone();
            info!(
                session_id = %session_id,
                peer = %peer,
                active_connections = self.connections.len() + 1,
                "New connection accepted"
            );

            let task = tokio::spawn(
                handle_connection(
                    session,
                    stream,
                    self.dispatcher.clone(),
                    self.config.clone(),
                    Arc::clone(&self.connections),
                )
                .instrument(tracing::info_span!("connection", session_id = %session_id)),
            );

            self.connections.insert(
                session_id,
                ConnectionState {
                    connected_at: Instant::now(),
                    peer,
                    turn,
                    abort_handle: task.abort_handle(),
                },
            );
        }

        self.shutdown().await;
        Ok(())
    }

    async fn shutdown(&self) {
        info!("Initiating graceful shutdown");

        let session_ids: Vec<SessionId> = self.connections.iter().map(|r| r.key().clone()).collect();
        for session_id in session_ids {
            if let Some((_, state)) = self.connections.remove(&session_id) {
                info!(session_id = %session_id, "Aborting connection");
                state.abort_handle.abort();
            }
        }

        // Give handlers a moment to unwind
        tokio::time::sleep(ACCEPT_POLL).await;
        info!("Shutdown complete");
    }

    /// Number of open connections
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Per-connection statistics
    #[must_use]
    pub fn connection_stats(&self) -> Vec<ConnectionStats> {
        self.connections
            .iter()
            .map(|r| ConnectionStats {
                session_id: r.key().clone(),
                peer: r.value().peer,
                uptime_secs: r.value().connected_at.elapsed().as_secs(),
                turn_in_flight: r.value().turn.is_busy(),
            })
            .collect()
    }
}

/// Stops the writer even when the connection task itself is aborted
struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Serve one client until it disconnects
async fn handle_connection(
    session: Session,
    stream: TcpStream,
    dispatcher: Dispatcher,
    config: ServerConfig,
    connections: Arc<DashMap<SessionId, ConnectionState>>,
) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(error = %e, "WebSocket handshake failed");
            connections.remove(&session.id);
            return;
        }
    };
    info!("Connection handler started");

    let (mut sink, mut source) = ws.split();
    let (mux, mut outbound) = Multiplexer::channel(config.outbound_capacity);

    let writer = AbortOnDrop(tokio::spawn(
        async move {
            while let Some(event) = outbound.recv().await {
                let text = match encode(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, kind = event.kind(), "Failed to encode event");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text)).await {
                    debug!(error = %e, "Write failed, stopping writer");
                    break;
                }
            }
            let _ = sink.close().await;
        }
        .in_current_span(),
    ));

    while let Some(frame) = source.next().await {
        match frame {
            Ok(Message::Text(text)) => match decode_request(&text, config.max_message_size) {
                Ok(request) => {
                    debug!("Received chat request");
                    dispatcher.handle_request(&session, &mux, request).await;
                }
                Err(e) => {
                    warn!(error = %e, "Rejected inbound frame");
                    mux.send(ServerEvent::error(e.to_string())).await;
                }
            },
            Ok(Message::Binary(_)) => {
                mux.send(ServerEvent::error("Binary frames are not supported")).await;
            }
            Ok(Message::Close(_)) => {
                info!("Client closed the connection");
                break;
            }
            // Ping/pong are answered by tungstenite
            Ok(_) => {}
            Err(e) => {
                info!(error = %e, "Connection lost");
                break;
            }
        }
    }

    drop(writer);
    connections.remove(&session.id);
    if session.turn().is_busy() {
        info!("Client left with a turn in flight; it will finish unobserved");
    }
    info!(active_connections = connections.len(), "Connection handler finished");
}
