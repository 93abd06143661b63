//! Error types for the session façade, plus the unified error.

use tablelink_peer::PeerError;
use tablelink_protocol::{GameId, ProtocolError};
use tablelink_signaling::SignalingError;
use tablelink_transport::TransportError;

/// Errors returned by [`Session`](crate::Session) operations.
///
/// Most outcomes of a session are not errors: a wrong password or a lost
/// connection shows up in the status. These are the calls the session
/// refuses outright.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// `join_game` was called with an empty game id.
    #[error("game id must not be empty")]
    InvalidGameId,

    /// The game expired; it can no longer be joined.
    #[error("game {0} has expired")]
    SessionClosed(GameId),

    /// `broadcast` was called with an empty channel name.
    #[error("channel name must not be empty")]
    InvalidChannel,

    /// The operation needs a running session; call `connect()` first.
    #[error("session is not connected")]
    NotConnected,
}

/// Top-level error that wraps all crate-specific errors.
///
/// The `#[from]` attribute on each variant generates a `From` impl, so
/// `?` converts sub-crate errors automatically.
#[derive(Debug, thiserror::Error)]
pub enum TablelinkError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error(transparent)]
    Peer(#[from] PeerError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_transport_error() {
        let err: TablelinkError = TransportError::ConnectionClosed("gone".into()).into();
        assert!(matches!(err, TablelinkError::Transport(_)));
        assert!(err.to_string().contains("gone"));
    }

    #[test]
    fn test_from_session_error() {
        let err: TablelinkError = SessionError::SessionClosed(GameId::from("g1")).into();
        assert!(matches!(err, TablelinkError::Session(_)));
        assert_eq!(err.to_string(), "game g1 has expired");
    }

    #[test]
    fn test_from_peer_error() {
        let err: TablelinkError = PeerError::Unsupported.into();
        assert!(matches!(err, TablelinkError::Peer(_)));
    }

    #[test]
    fn test_from_signaling_error() {
        let err: TablelinkError = SignalingError::Stopped.into();
        assert!(matches!(err, TablelinkError::Signaling(_)));
    }
}
