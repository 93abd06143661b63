//! How the signaling client reaches the rendezvous service.

use std::future::Future;

use tablelink_transport::{Connection, TransportError};

/// Opens fresh connections to the rendezvous service.
///
/// The signaling client dials once at start and again after every lost
/// connection, so a dialer must be reusable.
pub trait Dialer: Send + Sync + 'static {
    /// The connection type produced.
    type Connection: Connection;

    /// Opens one new connection.
    fn dial(&self) -> impl Future<Output = Result<Self::Connection, TransportError>> + Send;
}

/// Dials a WebSocket rendezvous at a fixed URL.
///
/// ```no_run
/// use tablelink_signaling::WebSocketDialer;
///
/// let dialer = WebSocketDialer::new("wss://rendezvous.example.com/ws");
/// assert_eq!(dialer.url(), "wss://rendezvous.example.com/ws");
/// ```
#[cfg(feature = "websocket")]
#[derive(Debug, Clone)]
pub struct WebSocketDialer {
    url: String,
}

#[cfg(feature = "websocket")]
impl WebSocketDialer {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[cfg(feature = "websocket")]
impl Dialer for WebSocketDialer {
    type Connection = tablelink_transport::WebSocketConnection;

    async fn dial(&self) -> Result<Self::Connection, TransportError> {
        tablelink_transport::WebSocketConnection::connect(&self.url).await
    }
}

impl<D: Dialer> Dialer for std::sync::Arc<D> {
    type Connection = D::Connection;

    fn dial(&self) -> impl Future<Output = Result<Self::Connection, TransportError>> + Send {
        (**self).dial()
    }
}
