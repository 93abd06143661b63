//! Direct peer links for Tablelink.
//!
//! After the rendezvous has introduced the participants of a game, each
//! pair the [`Topology`] selects negotiates a direct link. This crate owns
//! that process:
//!
//! - [`PeerConnector`]: the pluggable peer-connection stack (WebRTC in a
//!   browser, [`MemoryNetwork`] in-process).
//! - [`PeerConnectionManager`]: one supervised link per participant,
//!   with offerer selection ([`is_offerer`]), bounded re-negotiation and
//!   generation tracking.
//! - [`PeerEvent`]: what links report, including the informational
//!   [`PeerErrorCode`]s surfaced to the UI.
//!
//! Each link runs as its own Tokio task; a failing link never affects
//! another.

mod config;
mod connector;
mod error;
mod link;
mod manager;
mod memory;

pub use config::{PeerConfig, Topology};
pub use connector::{PeerConnector, is_offerer, supports_peer_connections};
pub use error::{PeerError, PeerErrorCode};
pub use link::LinkOutcome;
pub use manager::{ConnectionState, Participant, PeerConnectionManager, PeerEvent, Verdict};
pub use memory::{MemoryNetwork, MemoryPending};
