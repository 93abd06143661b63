//! Rendezvous (signaling) for Tablelink.
//!
//! Peers cannot talk directly before they know about each other. The
//! rendezvous service admits them into a game and relays the negotiation
//! payloads that set up direct peer links. This crate provides:
//!
//! - [`SignalingClient`]: a background task holding one self-healing
//!   connection to the rendezvous, with exponential backoff.
//! - [`Dialer`]: how that connection is opened ([`WebSocketDialer`] for a
//!   networked service).
//! - [`MemoryRendezvous`]: a complete in-process rendezvous for local
//!   play and tests.
//!
//! # Feature Flags
//!
//! - `websocket` (default): [`WebSocketDialer`]

mod client;
mod dialer;
mod error;
mod rendezvous;

pub use client::{SignalingClient, SignalingConfig, SignalingEvent};
#[cfg(feature = "websocket")]
pub use dialer::WebSocketDialer;
pub use dialer::Dialer;
pub use error::SignalingError;
pub use rendezvous::{MemoryRendezvous, RendezvousConfig};
