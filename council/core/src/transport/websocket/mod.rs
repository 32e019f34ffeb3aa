//! WebSocket Transport
//!
//! Text frames carrying one JSON message each (see [`crate::protocol`]).
//!
//! - [`CouncilServer`]: accepts connections, gives each its own
//!   [`Session`](crate::session::Session) and outbound queue, and routes
//!   `chat` requests to the dispatcher.
//! - [`DuplexChannel`]: client side, reconnecting on its own timer.

mod client;
mod server;

pub use client::{ChannelError, ChannelEvent, ChannelLifecycle, ChannelState, DuplexChannel};
pub use server::{ConnectionStats, CouncilServer};
