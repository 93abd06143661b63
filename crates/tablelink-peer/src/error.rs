//! Error types for peer links.

use std::fmt;

use serde::{Deserialize, Serialize};
use tablelink_protocol::{PeerId, ProtocolError};
use tablelink_transport::TransportError;

/// Errors raised while negotiating or using a peer link.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// This platform cannot create peer connections at all.
    #[error("peer connections are not supported on this platform")]
    Unsupported,

    /// The local side could not produce an offer.
    #[error("failed to create offer: {0}")]
    CreateOffer(String),

    /// An offer or answer was malformed or did not match.
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    /// The remote side did not complete negotiation in time.
    #[error("negotiation with {0} timed out")]
    Timeout(PeerId),

    /// The participant is not tracked.
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),

    /// The participant is tracked but its link is not up.
    #[error("no open link to {0}")]
    NotConnected(PeerId),

    /// The underlying channel failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A frame could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Codes reported to the UI through the `peerError` notification.
///
/// They are informational: the session keeps running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerErrorCode {
    #[serde(rename = "ERR_WEBRTC_SUPPORT")]
    WebrtcSupport,
    #[serde(rename = "ERR_CREATE_OFFER")]
    CreateOffer,
}

impl PeerErrorCode {
    /// The wire/UI code string.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WebrtcSupport => "ERR_WEBRTC_SUPPORT",
            Self::CreateOffer => "ERR_CREATE_OFFER",
        }
    }

    /// A short human-readable message for the code.
    pub fn message(self) -> &'static str {
        match self {
            Self::WebrtcSupport => "WebRTC not supported.",
            Self::CreateOffer => "Unable to connect to party.",
        }
    }
}

impl fmt::Display for PeerErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
