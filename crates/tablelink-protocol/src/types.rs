//! Core protocol types: identities, roles, and the application message.
//!
//! Everything here travels on a wire: either the signaling link to the
//! rendezvous service or a peer data channel. So every type derives
//! `Serialize`/`Deserialize`.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ProtocolError;

/// The current protocol version. Sent with every join so the rendezvous
/// can turn away clients that are too old (`NeedsUpdate`).
pub const PROTOCOL_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Identity types
// ---------------------------------------------------------------------------

/// Identifier of one participant within a game, assigned by the
/// rendezvous service.
///
/// `Ord` is the plain lexicographic string order. It is load-bearing: the
/// side with the smaller id is the one that offers when a peer link is
/// negotiated.
///
/// `#[serde(transparent)]` makes `PeerId("a1")` serialize as just `"a1"`.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Wraps a raw identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a game (the rendezvous room all participants join).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GameId(String);

impl GameId {
    /// Wraps a raw game identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` for the empty id, which can never be joined.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for GameId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl fmt::Display for GameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A participant's role in the game.
///
/// The host is the participant that opened the game. It is the hub of the
/// star topology and the only peer that relays for others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Host,
    Guest,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => f.write_str("host"),
            Self::Guest => f.write_str("guest"),
        }
    }
}

// ---------------------------------------------------------------------------
// AppMessage: what flows over peer data channels
// ---------------------------------------------------------------------------

/// One application-level update (map, token, party, fog, dice …).
///
/// ```text
/// ┌──────────────────────────────┐
/// │ channel:   "token"           │  ← logical channel name
/// │ sender:    "7c1e…"           │  ← original author (survives relaying)
/// │ sequence:  42                │  ← monotonic per (sender, channel)
/// │ timestamp: 1700000000123     │  ← author's wall clock, ms
/// │ payload:   [..bytes..]       │  ← opaque to the session layer
/// └──────────────────────────────┘
/// ```
///
/// Sequence numbers start at 1 and only order messages of one sender on
/// one channel; they are never compared across senders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppMessage {
    pub channel: String,
    pub sender: PeerId,
    pub sequence: u64,
    pub payload: Vec<u8>,
    pub timestamp: u64,
}

impl AppMessage {
    /// Checks the structural rules every inbound message must satisfy.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.channel.is_empty() {
            return Err(ProtocolError::InvalidMessage(
                "empty channel name".into(),
            ));
        }
        if self.sequence == 0 {
            return Err(ProtocolError::InvalidMessage(format!(
                "sequence 0 from {} on {}",
                self.sender, self.channel
            )));
        }
        Ok(())
    }
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_serializes_as_plain_string() {
        let json = serde_json::to_string(&PeerId::from("a1")).unwrap();
        assert_eq!(json, "\"a1\"");
    }

    #[test]
    fn test_peer_id_orders_lexicographically() {
        // "10" < "9" as strings; the offerer rule depends on string order,
        // not numeric order.
        assert!(PeerId::from("10") < PeerId::from("9"));
        assert!(PeerId::from("alice") < PeerId::from("bob"));
    }

    #[test]
    fn test_game_id_is_empty() {
        assert!(GameId::from("").is_empty());
        assert!(!GameId::from("abc123").is_empty());
    }

    #[test]
    fn test_role_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&Role::Host).unwrap(), "\"host\"");
        assert_eq!(Role::Guest.to_string(), "guest");
    }

    #[test]
    fn test_app_message_validate_accepts_well_formed() {
        let msg = AppMessage {
            channel: "map".into(),
            sender: PeerId::from("a"),
            sequence: 1,
            payload: vec![],
            timestamp: 0,
        };
        assert!(msg.validate().is_ok());
    }

    #[test]
    fn test_app_message_validate_rejects_zero_sequence() {
        let msg = AppMessage {
            channel: "map".into(),
            sender: PeerId::from("a"),
            sequence: 0,
            payload: vec![],
            timestamp: 0,
        };
        assert!(matches!(
            msg.validate(),
            Err(ProtocolError::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_app_message_validate_rejects_empty_channel() {
        let msg = AppMessage {
            channel: String::new(),
            sender: PeerId::from("a"),
            sequence: 3,
            payload: vec![],
            timestamp: 0,
        };
        assert!(msg.validate().is_err());
    }
}
