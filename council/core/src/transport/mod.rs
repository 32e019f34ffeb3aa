//! Transport Layer
//!
//! Framing for the duplex channel and, behind the `websocket` feature, the
//! WebSocket server and reconnecting client that carry it.
//!
//! ```text
//!   ChatClient ── DuplexChannel ══ ws ══ CouncilServer ── Dispatcher
//!        ▲              │                     │
//!        └── TurnReconciler ◄── ServerEvent ──┘ (Multiplexer)
//! ```

pub mod frame;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use frame::{decode_event, decode_request, encode, DEFAULT_MAX_FRAME_SIZE};
