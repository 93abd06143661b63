//! Transport abstraction layer for Tablelink.
//!
//! Provides the [`Connection`] trait: an ordered, reliable byte pipe to one
//! remote endpoint. Two very different things sit behind it:
//!
//! - the link to the rendezvous (signaling) service, usually a WebSocket
//!   ([`WebSocketConnection`]),
//! - a negotiated peer data channel, produced by a peer connector.
//!
//! [`MemoryConnection`] is an in-process duplex used by the in-memory
//! rendezvous and peer network (local play, tests, demos).
//!
//! # Feature Flags
//!
//! - `websocket` (default): WebSocket client via `tokio-tungstenite`

mod error;
mod memory;
#[cfg(feature = "websocket")]
mod websocket;

pub use error::TransportError;
pub use memory::{MemoryCloser, MemoryConnection, pair};
#[cfg(feature = "websocket")]
pub use websocket::WebSocketConnection;

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique handle for one connection, used as a key by whoever
/// multiplexes many of them (the in-memory rendezvous, log fields).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link-{}", self.0)
    }
}

/// A single connection that can send and receive whole messages.
///
/// Every method takes `&self` so one task can be blocked in
/// [`recv`](Self::recv) while another sends. The returned futures are
/// `Send` because connections are driven from spawned Tokio tasks.
pub trait Connection: Send + Sync + 'static {
    /// Sends one message to the remote end.
    fn send(
        &self,
        data: &[u8],
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Receives the next message from the remote end.
    ///
    /// Returns `Ok(None)` when the connection is cleanly closed.
    fn recv(
        &self,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, TransportError>> + Send;

    /// Closes the connection. Closing twice is not an error.
    fn close(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Returns the unique identifier for this connection.
    fn id(&self) -> ConnectionId;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_next_is_increasing() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert_ne!(a, b);
        assert!(b > a);
        assert!(b.get() > a.get());
    }

    #[test]
    fn test_connection_id_display_uses_link_prefix() {
        let id = ConnectionId::next();
        assert_eq!(id.to_string(), format!("link-{}", id.get()));
    }
}
