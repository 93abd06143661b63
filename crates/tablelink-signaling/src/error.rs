//! Error types for the signaling layer.

use tablelink_protocol::ProtocolError;
use tablelink_transport::TransportError;

/// Errors surfaced by the [`SignalingClient`](crate::SignalingClient).
///
/// Connectivity problems are not errors at this level: the client retries
/// them internally and reports progress as
/// [`SignalingEvent`](crate::SignalingEvent)s.
#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    /// The background task has stopped (shut down or gave up).
    #[error("signaling client stopped")]
    Stopped,

    /// The outbound queue is full; the rendezvous is not keeping up.
    #[error("signaling queue full")]
    QueueFull,

    /// A message could not be encoded for the wire.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The rendezvous connection failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}
