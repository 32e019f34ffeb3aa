//! Duplex Channel Client
//!
//! Long-lived WebSocket connection to the council server that reconnects on
//! its own.
//!
//! ```text
//!   Disconnected ──► Connecting ──► Open
//!        ▲               │            │
//!        └───────────────┴────────────┘  close / error / failed attempt
//! ```
//!
//! There is no terminal state: every entry into `Disconnected` schedules
//! one reconnect attempt after the configured delay, unless one is already
//! pending. The rule lives in [`ChannelLifecycle`], a plain state machine
//! owned by the channel's supervisor task, so independent channels never
//! share timers.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::protocol::{ClientRequest, ProtocolError, ServerEvent};
use crate::transport::frame::{decode_event, encode};

/// Requests queued per connection before `send_chat` waits
const OUTBOUND_CAPACITY: usize = 16;

/// Errors surfaced to channel users
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The channel is not `Open`; nothing was sent
    #[error("Not connected")]
    NotConnected,

    /// A connection attempt failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The connection closed while the request was queued
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// The request could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] ProtocolError),
}

/// Connection state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    /// No connection; a reconnect may be scheduled
    Disconnected,
    /// Handshake in progress
    Connecting,
    /// Requests can be sent
    Open,
}

/// What the channel reports to its owner, in receipt order
#[derive(Clone, Debug, PartialEq)]
pub enum ChannelEvent {
    /// The connection changed state
    State {
        /// New state
        state: ChannelState,
        /// Connection the transition belongs to. Every successful handshake
        /// starts a new generation; failed attempts report the last one.
        generation: u64,
    },
    /// A server event arrived
    Server(ServerEvent),
}

/// Reconnect bookkeeping, free of I/O
#[derive(Clone, Debug)]
pub struct ChannelLifecycle {
    state: ChannelState,
    generation: u64,
    reconnect_pending: bool,
    reconnect_delay: Duration,
}

impl ChannelLifecycle {
    /// Start disconnected with nothing scheduled
    #[must_use]
    pub fn new(reconnect_delay: Duration) -> Self {
        Self {
            state: ChannelState::Disconnected,
            generation: 0,
            reconnect_pending: false,
            reconnect_delay,
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Generation of the most recent successful handshake (0 before any)
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether a reconnect attempt is scheduled
    #[must_use]
    pub fn reconnect_pending(&self) -> bool {
        self.reconnect_pending
    }

    /// Only an open channel accepts requests
    #[must_use]
    pub fn can_send(&self) -> bool {
        self.state == ChannelState::Open
    }

    /// Start an attempt. Returns false unless currently disconnected.
    pub fn begin_connect(&mut self) -> bool {
        if self.state != ChannelState::Disconnected {
            return false;
        }
        self.state = ChannelState::Connecting;
        self.reconnect_pending = false;
        true
    }

    /// The handshake succeeded. Returns the new connection's generation.
    pub fn opened(&mut self) -> u64 {
        self.state = ChannelState::Open;
        self.generation += 1;
        self.generation
    }

    /// The connection closed or the attempt failed
    ///
    /// Returns the delay before the next attempt, or `None` if one is
    /// already scheduled.
    pub fn closed(&mut self) -> Option<Duration> {
        self.state = ChannelState::Disconnected;
        if self.reconnect_pending {
            return None;
        }
        self.reconnect_pending = true;
        Some(self.reconnect_delay)
    }
}

/// Sender for the open connection, tagged with its generation
type Outbound = Arc<Mutex<Option<(u64, mpsc::Sender<String>)>>>;

/// Client end of the duplex channel
pub struct DuplexChannel {
    url: String,
    lifecycle: Arc<Mutex<ChannelLifecycle>>,
    outbound: Outbound,
    supervisor: JoinHandle<()>,
}

impl DuplexChannel {
    /// Start connecting to `config.url`
    ///
    /// The receiver yields state transitions and server events in the order
    /// they happened. Dropping the channel stops reconnecting.
    #[must_use]
    pub fn open(config: &ClientConfig) -> (Self, mpsc::Receiver<ChannelEvent>) {
        let (events_tx, events_rx) = mpsc::channel(256);
        let lifecycle = Arc::new(Mutex::new(ChannelLifecycle::new(config.reconnect_delay)));
        let outbound = Arc::new(Mutex::new(None));

        let supervisor = tokio::spawn(supervise(
            config.url.clone(),
            Arc::clone(&lifecycle),
            Arc::clone(&outbound),
            events_tx,
        ));

        let channel = Self {
            url: config.url.clone(),
            lifecycle,
            outbound,
            supervisor,
        };
        (channel, events_rx)
    }

    /// Server endpoint
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> ChannelState {
        self.lifecycle.lock().state()
    }

    /// Send a `chat` request
    ///
    /// Returns the generation of the connection that carried it.
    ///
    /// # Errors
    ///
    /// `NotConnected` unless the channel is `Open`; the request never
    /// leaves the process. `SendFailed` if the connection closed meanwhile.
    pub async fn send_chat(&self, request: &ClientRequest) -> Result<u64, ChannelError> {
        if !self.lifecycle.lock().can_send() {
            return Err(ChannelError::NotConnected);
        }
        let (generation, sender) = self.outbound.lock().clone().ok_or(ChannelError::NotConnected)?;
        let text = encode(request)?;
        sender
            .send(text)
            .await
            .map_err(|_| ChannelError::SendFailed("connection closed".to_string()))?;
        Ok(generation)
    }
}

impl Drop for DuplexChannel {
    fn drop(&mut self) {
        self.supervisor.abort();
    }
}

async fn supervise(
    url: String,
    lifecycle: Arc<Mutex<ChannelLifecycle>>,
    outbound: Outbound,
    events: mpsc::Sender<ChannelEvent>,
) {
    loop {
        let generation = {
            let mut lc = lifecycle.lock();
            if !lc.begin_connect() {
                debug!("Attempt already in progress");
                return;
            }
            lc.generation()
        };
        let connecting = ChannelEvent::State {
            state: ChannelState::Connecting,
            generation,
        };
        if events.send(connecting).await.is_err() {
            return;
        }

        let generation = match connect_async(url.as_str()).await {
            Ok((ws, _)) => {
                let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
                let generation = {
                    let mut lc = lifecycle.lock();
                    let generation = lc.opened();
                    *outbound.lock() = Some((generation, tx));
                    generation
                };
                info!(url = %url, generation, "Channel open");
                let open = ChannelEvent::State {
                    state: ChannelState::Open,
                    generation,
                };
                if events.send(open).await.is_err() {
                    return;
                }
                pump(ws, rx, &events).await;
                *outbound.lock() = None;
                generation
            }
            Err(e) => {
                let err = ChannelError::ConnectionFailed(e.to_string());
                warn!(url = %url, error = %err, "Connection attempt failed");
                generation
            }
        };

        let delay = lifecycle.lock().closed();
        let disconnected = ChannelEvent::State {
            state: ChannelState::Disconnected,
            generation,
        };
        if events.send(disconnected).await.is_err() {
            return;
        }
        if let Some(delay) = delay {
            debug!(delay_ms = delay.as_millis() as u64, "Reconnect scheduled");
            tokio::time::sleep(delay).await;
        }
    }
}

/// Move frames both ways until the connection ends
async fn pump(
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut outbound: mpsc::Receiver<String>,
    events: &mpsc::Sender<ChannelEvent>,
) {
    let (mut sink, mut source) = ws.split();
    loop {
        tokio::select! {
            Some(text) = outbound.recv() => {
                if let Err(e) = sink.send(Message::Text(text)).await {
                    warn!(error = %e, "Write failed");
                    break;
                }
            }
            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => match decode_event(&text) {
                    Ok(event) => {
                        if events.send(ChannelEvent::Server(event)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "Ignoring undecodable frame"),
                },
                Some(Ok(Message::Close(_))) | None => {
                    info!("Server closed the channel");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "Channel error");
                    break;
                }
            }
        }
    }
}
