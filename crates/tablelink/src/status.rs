//! Session status and the notifications a UI subscribes to.

use std::fmt;

use serde::{Deserialize, Serialize};
use tablelink_peer::PeerErrorCode;
use tablelink_protocol::GameId;

/// Where the session stands.
///
/// ```text
/// Ready ──connect()──→ Connecting ──joined──→ Joined
///                         │                    │  ▲
///                  password needed        link or signaling lost
///                         ▼                    ▼  │ restored
///                        Auth             Reconnecting
///                                              │ budget exhausted
///                                              ▼
///                  connect() ←──────────── Offline
///
/// any ──incompatible version──→ NeedsUpdate (terminal)
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Ready,
    Connecting,
    /// The game wants a (different) password.
    Auth,
    Joined,
    Reconnecting,
    Offline,
    /// The rendezvous refuses this protocol version.
    NeedsUpdate,
}

impl SessionStatus {
    /// Whether no internal event can move the status anymore.
    pub fn is_terminal(self) -> bool {
        self == Self::NeedsUpdate
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ready => "ready",
            Self::Connecting => "connecting",
            Self::Auth => "auth",
            Self::Joined => "joined",
            Self::Reconnecting => "reconnecting",
            Self::Offline => "offline",
            Self::NeedsUpdate => "needs_update",
        };
        f.write_str(s)
    }
}

/// An informational peer-link error. The session keeps running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerErrorEvent {
    pub code: PeerErrorCode,
    pub detail: String,
}

/// Something a listener registered with [`Session::on`](crate::Session::on)
/// is told about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Status(SessionStatus),
    PeerError(PeerErrorEvent),
    GameExpired { game_id: GameId },
}

impl Notification {
    pub fn kind(&self) -> NotificationKind {
        match self {
            Self::Status(_) => NotificationKind::Status,
            Self::PeerError(_) => NotificationKind::PeerError,
            Self::GameExpired { .. } => NotificationKind::GameExpired,
        }
    }
}

/// The kinds of [`Notification`] a listener can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    Status,
    PeerError,
    GameExpired,
}
