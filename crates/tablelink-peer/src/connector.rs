//! The seam between link supervision and an actual peer-connection stack.
//!
//! A [`PeerConnector`] knows how to turn an offer/answer exchange into an
//! open [`Connection`]. The exchange itself travels over the rendezvous;
//! the connector never talks to it.
//!
//! ```text
//!   offerer                               answerer
//!   create_offer() ──offer sdp──────────→ accept_offer()
//!        │                                    │
//!   complete() ←────────answer sdp───────────┘
//!        │                                    │
//!     Channel ◄══════ negotiated link ══════► Channel
//! ```

use std::any::TypeId;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, OnceLock, PoisonError};

use tablelink_protocol::PeerId;
use tablelink_transport::Connection;

use crate::PeerError;

/// Creates negotiated peer channels.
pub trait PeerConnector: Send + Sync + 'static {
    /// The open channel produced by a successful negotiation.
    type Channel: Connection;

    /// Offerer-side state kept between [`create_offer`](Self::create_offer)
    /// and [`complete`](Self::complete).
    type Pending: Send + 'static;

    /// Whether this platform can create peer connections at all.
    ///
    /// Called at most once per connector type per process; see
    /// [`supports_peer_connections`].
    fn is_supported(&self) -> bool;

    /// Starts a negotiation towards `remote`, returning the offer
    /// description to relay.
    fn create_offer(
        &self,
        local: &PeerId,
        remote: &PeerId,
    ) -> impl Future<Output = Result<(Self::Pending, String), PeerError>> + Send;

    /// Answers an offer from `remote`, returning the answer description to
    /// relay back and the channel (which opens once the offerer completes).
    fn accept_offer(
        &self,
        local: &PeerId,
        remote: &PeerId,
        offer: &str,
    ) -> impl Future<Output = Result<(String, Self::Channel), PeerError>> + Send;

    /// Finishes an offer with the remote answer.
    fn complete(
        &self,
        pending: Self::Pending,
        answer: &str,
    ) -> impl Future<Output = Result<Self::Channel, PeerError>> + Send;
}

/// Process-wide capability probe, evaluated once per connector type.
///
/// The first call for a type asks [`PeerConnector::is_supported`]; every
/// later call returns the cached answer.
pub fn supports_peer_connections<C: PeerConnector>(connector: &C) -> bool {
    static CACHE: OnceLock<Mutex<HashMap<TypeId, bool>>> = OnceLock::new();
    let mut cache = CACHE
        .get_or_init(Default::default)
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    *cache
        .entry(TypeId::of::<C>())
        .or_insert_with(|| connector.is_supported())
}

/// Which side of a pair sends the offer.
///
/// The participant with the lexicographically smaller id offers, so two
/// peers learning about each other at the same time never both offer.
pub fn is_offerer(local: &PeerId, remote: &PeerId) -> bool {
    local < remote
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_offerer_exactly_one_side_offers() {
        let a = PeerId::from("a7");
        let b = PeerId::from("b2");
        assert!(is_offerer(&a, &b));
        assert!(!is_offerer(&b, &a));
    }

    #[test]
    fn test_is_offerer_uses_string_order() {
        assert!(is_offerer(&PeerId::from("10"), &PeerId::from("9")));
    }

    #[test]
    fn test_is_offerer_never_offers_to_self() {
        let a = PeerId::from("a");
        assert!(!is_offerer(&a, &a));
    }
}
