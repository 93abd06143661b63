//! Wire protocol for Tablelink.
//!
//! This crate defines the "language" the session layer speaks:
//!
//! - **Identity types** ([`PeerId`], [`GameId`], [`Role`]).
//! - **Signaling messages** ([`ClientSignal`], [`ServerSignal`],
//!   [`Negotiation`]) exchanged with the rendezvous service.
//! - **Application messages** ([`AppMessage`]) exchanged between peers.
//! - **Codecs** ([`Codec`], [`JsonCodec`], [`BincodeCodec`]) and
//!   [`ProtocolError`].
//!
//! ```text
//! Transport (bytes) → Protocol (ServerSignal / AppMessage) → Session
//! ```

mod codec;
mod error;
mod signal;
mod types;

#[cfg(feature = "binary")]
pub use codec::BincodeCodec;
pub use codec::Codec;
#[cfg(feature = "json")]
pub use codec::JsonCodec;
pub use error::ProtocolError;
pub use signal::{ClientSignal, Negotiation, ParticipantInfo, ServerSignal};
pub use types::{AppMessage, GameId, PROTOCOL_VERSION, PeerId, Role};
