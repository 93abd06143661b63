//! In-process peer network.
//!
//! [`MemoryNetwork`] negotiates links between sessions living in the same
//! process. An offer parks one half of an in-memory pair under a numeric
//! id; the matching answer hands the other half to the answerer. Session
//! descriptions are plain strings (`memory-offer:<id>`,
//! `memory-answer:<id>`).
//!
//! Faults can be injected: failing offer creation, severing the link
//! between two participants, or severing everything.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tablelink_protocol::PeerId;
use tablelink_transport::{MemoryCloser, MemoryConnection};
use tracing::debug;

use crate::{PeerConnector, PeerError};

const OFFER_PREFIX: &str = "memory-offer:";
const ANSWER_PREFIX: &str = "memory-answer:";

struct Parked {
    from: PeerId,
    to: PeerId,
    half: MemoryConnection,
}

struct Established {
    a: PeerId,
    b: PeerId,
    closer: MemoryCloser,
}

#[derive(Default)]
struct NetState {
    next_id: u64,
    offers: HashMap<u64, Parked>,
    links: Vec<Established>,
}

#[derive(Default)]
struct NetInner {
    state: Mutex<NetState>,
    fail_offers: AtomicBool,
}

impl NetInner {
    fn state(&self) -> MutexGuard<'_, NetState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A peer network shared by every session in this process.
///
/// Cheap to clone; clones share the same network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetInner>,
}

/// Offerer-side state of a [`MemoryNetwork`] negotiation.
pub struct MemoryPending {
    id: u64,
    half: Option<MemoryConnection>,
    net: Weak<NetInner>,
}

/// An abandoned offer is withdrawn from the network.
impl Drop for MemoryPending {
    fn drop(&mut self) {
        if let Some(net) = self.net.upgrade() {
            net.state().offers.remove(&self.id);
        }
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent `create_offer` fail (or succeed again).
    pub fn set_fail_offers(&self, fail: bool) {
        self.inner.fail_offers.store(fail, Ordering::SeqCst);
    }

    /// Closes every established link between `a` and `b`.
    pub fn sever(&self, a: &PeerId, b: &PeerId) {
        let mut state = self.inner.state();
        state.links.retain(|link| {
            let matches = (&link.a == a && &link.b == b) || (&link.a == b && &link.b == a);
            if matches {
                debug!(%a, %b, "severing memory link");
                link.closer.close();
            }
            !matches
        });
    }

    /// Closes every established link.
    pub fn sever_all(&self) {
        for link in self.inner.state().links.drain(..) {
            link.closer.close();
        }
    }

    /// Number of links negotiated and not yet severed.
    ///
    /// Links closed by their endpoints are still counted until severed.
    pub fn link_count(&self) -> usize {
        self.inner.state().links.len()
    }
}

fn parse_id(sdp: &str, prefix: &str) -> Result<u64, PeerError> {
    sdp.strip_prefix(prefix)
        .and_then(|id| id.parse().ok())
        .ok_or_else(|| PeerError::Negotiation(format!("unrecognized description {sdp:?}")))
}

impl PeerConnector for MemoryNetwork {
    type Channel = MemoryConnection;
    type Pending = MemoryPending;

    fn is_supported(&self) -> bool {
        true
    }

    async fn create_offer(
        &self,
        local: &PeerId,
        remote: &PeerId,
    ) -> Result<(MemoryPending, String), PeerError> {
        if self.inner.fail_offers.load(Ordering::SeqCst) {
            return Err(PeerError::CreateOffer("offers disabled on this network".into()));
        }
        let (mine, theirs) = tablelink_transport::pair();
        let mut state = self.inner.state();
        state.next_id += 1;
        let id = state.next_id;
        state.offers.insert(
            id,
            Parked {
                from: local.clone(),
                to: remote.clone(),
                half: theirs,
            },
        );
        let pending = MemoryPending {
            id,
            half: Some(mine),
            net: Arc::downgrade(&self.inner),
        };
        Ok((pending, format!("{OFFER_PREFIX}{id}")))
    }

    async fn accept_offer(
        &self,
        local: &PeerId,
        remote: &PeerId,
        offer: &str,
    ) -> Result<(String, MemoryConnection), PeerError> {
        let id = parse_id(offer, OFFER_PREFIX)?;
        let mut state = self.inner.state();
        let parked = state
            .offers
            .remove(&id)
            .ok_or_else(|| PeerError::Negotiation(format!("offer {id} is gone")))?;
        if &parked.to != local || &parked.from != remote {
            return Err(PeerError::Negotiation(format!(
                "offer {id} was meant for {} from {}",
                parked.to, parked.from
            )));
        }
        state.links.push(Established {
            a: remote.clone(),
            b: local.clone(),
            closer: parked.half.closer(),
        });
        Ok((format!("{ANSWER_PREFIX}{id}"), parked.half))
    }

    async fn complete(
        &self,
        mut pending: MemoryPending,
        answer: &str,
    ) -> Result<MemoryConnection, PeerError> {
        let id = parse_id(answer, ANSWER_PREFIX)?;
        if id != pending.id {
            return Err(PeerError::Negotiation(format!(
                "answer {id} does not match offer {}",
                pending.id
            )));
        }
        pending
            .half
            .take()
            .ok_or_else(|| PeerError::Negotiation("offer already completed".into()))
    }
}
