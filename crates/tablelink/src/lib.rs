//! # Tablelink
//!
//! Peer-to-peer session layer for collaborative virtual tabletops.
//!
//! A game is a small party of participants: one host (who opened it) and
//! any number of guests. A rendezvous service introduces them; after that
//! they exchange map, token, fog and dice updates over direct peer links,
//! with the host relaying for guests in the default star topology.
//!
//! ```text
//!  tablelink-transport   Connection trait, in-memory pair, WebSocket
//!  tablelink-protocol    ids, signaling messages, AppMessage, codecs
//!  tablelink-backoff     retry policy
//!  tablelink-signaling   rendezvous client (+ in-process rendezvous)
//!  tablelink-peer        peer link supervision, topology
//!  tablelink-router      sequencing, dedup, relay, LWW helpers
//!  tablelink             Session: the state machine tying it together
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tablelink::prelude::*;
//!
//! # async fn run() {
//! let rendezvous = MemoryRendezvous::default();
//! let session = SessionBuilder::new().build(rendezvous, MemoryNetwork::new());
//!
//! session.on(NotificationKind::Status, |n| println!("{n:?}"));
//! session.register_consumer("token", |msg: &AppMessage| {
//!     println!("{} moved a token", msg.sender);
//! });
//! session.join_game("table-1", "secret").unwrap();
//! session.connect();
//! // ...
//! session.broadcast("token", b"e4".to_vec()).unwrap();
//! session.disconnect().await;
//! # }
//! ```

mod config;
mod driver;
mod error;
mod identity;
mod notify;
mod participants;
mod session;
mod shared;
mod status;

pub use config::{SessionBuilder, SessionConfig};
pub use error::{SessionError, TablelinkError};
pub use identity::GameIdentity;
pub use notify::SubscriptionToken;
pub use participants::ParticipantSet;
pub use session::Session;
pub use status::{Notification, NotificationKind, PeerErrorEvent, SessionStatus};

pub use tablelink_backoff as backoff;
pub use tablelink_peer as peer;
pub use tablelink_protocol as protocol;
pub use tablelink_router as router;
pub use tablelink_signaling as signaling;
pub use tablelink_transport as transport;

/// Everything an application usually needs.
pub mod prelude {
    pub use crate::{
        GameIdentity, Notification, NotificationKind, PeerErrorEvent, Session, SessionBuilder,
        SessionConfig, SessionError, SessionStatus, SubscriptionToken, TablelinkError,
    };
    pub use tablelink_backoff::BackoffConfig;
    pub use tablelink_peer::{
        ConnectionState, MemoryNetwork, Participant, PeerConnector, PeerErrorCode, Topology,
    };
    pub use tablelink_protocol::{AppMessage, GameId, PeerId, Role};
    pub use tablelink_router::{LwwRegister, MessageConsumer, Stamp};
    #[cfg(feature = "websocket")]
    pub use tablelink_signaling::WebSocketDialer;
    pub use tablelink_signaling::{Dialer, MemoryRendezvous};
}
