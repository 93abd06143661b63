//! Messages exchanged with the rendezvous (signaling) service.
//!
//! The rendezvous service never sees application data. It only:
//! - admits participants into a game (password check, version gate),
//! - tells members who else is in the game,
//! - relays connection-negotiation payloads between two members.
//!
//! Both enums are internally tagged (`{ "type": "Join", ... }`) so they read
//! well in logs and can be produced by a non-Rust rendezvous server.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{GameId, PeerId, Role};

/// Connection-negotiation payload relayed between two peers.
///
/// The session description is opaque text produced by the peer connector
/// (an SDP blob for WebRTC). Network-path candidates are bundled into the
/// description, so there is no separate candidate message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Negotiation {
    Offer { sdp: String },
    Answer { sdp: String },
}

/// A member of a game as reported by the rendezvous.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub peer_id: PeerId,
    pub role: Role,
}

/// Client → rendezvous.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientSignal {
    /// Ask to join `game_id`. An unknown game is opened with `password`
    /// and the caller becomes its host.
    Join {
        version: u32,
        game_id: GameId,
        password: String,
    },

    /// Resume membership after the signaling link dropped, using the token
    /// handed out in [`ServerSignal::Joined`]. Keeps the same peer id.
    Rejoin {
        version: u32,
        game_id: GameId,
        peer_id: PeerId,
        token: String,
    },

    /// Relay a negotiation payload to another member.
    Signal { to: PeerId, payload: Negotiation },

    /// Leave the game for good.
    Leave,
}

/// Passwords and rejoin tokens never reach the logs.
impl fmt::Debug for ClientSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Join {
                version, game_id, ..
            } => f
                .debug_struct("Join")
                .field("version", version)
                .field("game_id", game_id)
                .field("password", &"<redacted>")
                .finish(),
            Self::Rejoin {
                version,
                game_id,
                peer_id,
                ..
            } => f
                .debug_struct("Rejoin")
                .field("version", version)
                .field("game_id", game_id)
                .field("peer_id", peer_id)
                .field("token", &"<redacted>")
                .finish(),
            Self::Signal { to, payload } => f
                .debug_struct("Signal")
                .field("to", to)
                .field("payload", payload)
                .finish(),
            Self::Leave => f.write_str("Leave"),
        }
    }
}

/// Rendezvous → client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerSignal {
    /// Admission granted. `participants` lists everyone else already in
    /// the game. `token` lets the client rejoin after a signaling drop.
    Joined {
        game_id: GameId,
        peer_id: PeerId,
        role: Role,
        token: String,
        participants: Vec<ParticipantInfo>,
    },

    /// The game is protected and no password was supplied.
    AuthRequired { game_id: GameId },

    /// The supplied password was wrong.
    AuthRejected { game_id: GameId },

    /// The rejoin token is unknown or its grace period elapsed.
    RejoinRejected { game_id: GameId },

    /// Someone entered the game.
    ParticipantJoined { participant: ParticipantInfo },

    /// Someone left the game (explicitly or by timing out).
    ParticipantLeft { peer_id: PeerId },

    /// A negotiation payload from another member.
    Signal { from: PeerId, payload: Negotiation },

    /// The client speaks a protocol version the rendezvous no longer
    /// accepts. Terminal for this process.
    NeedsUpdate { min_version: u32 },

    /// The game no longer exists.
    GameExpired { game_id: GameId },

    /// Anything else the rendezvous wants to complain about.
    /// `code` follows HTTP conventions.
    Error { code: u16, message: String },
}
