//! The peer connection manager: one supervised link per participant.
//!
//! The manager is plain state owned by the session driver. It spawns link
//! tasks and interprets what they report, but never runs a loop of its
//! own: the driver feeds every [`PeerEvent`] back through
//! [`handle_link_up`](PeerConnectionManager::handle_link_up) /
//! [`handle_link_closed`](PeerConnectionManager::handle_link_closed).
//!
//! ## Participant lifecycle
//!
//! ```text
//! add_participant ─→ [Connecting] ─LinkUp─→ [Connected]
//!                        ▲                      │
//!                        └──── retry ◄── link lost/failed
//!                                         │
//!                             budget exhausted → [Failed], removed
//! ```
//!
//! Generations: every spawned link gets a fresh number. Events from an
//! older generation are ignored, so a replaced link can never clobber the
//! state of its successor.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tablelink_backoff::Backoff;
use tablelink_protocol::{Negotiation, PeerId, Role};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::link::{LinkCommand, LinkHandle, LinkTask, Opening};
use crate::{
    LinkOutcome, PeerConfig, PeerConnector, PeerError, PeerErrorCode, is_offerer,
    supports_peer_connections,
};

/// How long [`PeerConnectionManager::shutdown`] waits for each link.
const LINK_CLOSE_GRACE: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// State of the direct link to one participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Negotiating (first attempt or a retry).
    Connecting,
    Connected,
    /// No direct link: the topology does not link this pair, or the
    /// platform cannot create peer connections.
    Disconnected,
    /// Retry budget exhausted.
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A remote participant as seen by this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub peer_id: PeerId,
    pub role: Role,
    pub connection_state: ConnectionState,
}

/// Everything link tasks report, plus negotiation payloads to relay.
#[derive(Debug)]
pub enum PeerEvent {
    /// Relay this payload to `to` through the rendezvous.
    Signal { to: PeerId, payload: Negotiation },
    LinkUp { peer: PeerId, generation: u64 },
    LinkClosed {
        peer: PeerId,
        generation: u64,
        outcome: LinkOutcome,
    },
    /// A data frame arrived.
    Frame {
        peer: PeerId,
        generation: u64,
        bytes: Vec<u8>,
    },
    /// Informational error for the UI.
    Error { code: PeerErrorCode, detail: String },
}

/// What the manager did about a closed link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Stale generation, local close, or unknown peer: nothing changed.
    Ignored,
    /// A new attempt is under way; the participant is `Connecting`.
    Retrying,
    /// The participant failed for good and was removed. Carries its last
    /// view, in the `Failed` state.
    Failed(Participant),
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

struct Tracked {
    role: Role,
    state: ConnectionState,
    link: Option<LinkHandle>,
    backoff: Backoff,
    /// An offer that arrived while no link could take it.
    stashed_offer: Option<String>,
}

/// Supervises the links of one session run.
pub struct PeerConnectionManager<C: PeerConnector> {
    connector: Arc<C>,
    config: PeerConfig,
    local: Option<(PeerId, Role)>,
    participants: HashMap<PeerId, Tracked>,
    /// Offers from peers not (yet) tracked, applied when they are added.
    orphan_offers: HashMap<PeerId, String>,
    events: mpsc::UnboundedSender<PeerEvent>,
    next_generation: u64,
    support_reported: bool,
}

impl<C: PeerConnector> PeerConnectionManager<C> {
    /// Creates a manager and the event stream its links report on.
    pub fn new(
        connector: Arc<C>,
        config: PeerConfig,
    ) -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = Self {
            connector,
            config,
            local: None,
            participants: HashMap::new(),
            orphan_offers: HashMap::new(),
            events: tx,
            next_generation: 0,
            support_reported: false,
        };
        (manager, rx)
    }

    /// Sets who we are. Links need a local identity for the offerer rule
    /// and the topology.
    pub fn set_local(&mut self, peer_id: PeerId, role: Role) {
        if self.local.as_ref().is_some_and(|(id, r)| id == &peer_id && *r == role) {
            return;
        }
        if self.local.is_some() {
            // New identity: everything negotiated under the old one is void.
            for tracked in self.participants.values_mut() {
                tracked.link = None;
                tracked.state = ConnectionState::Disconnected;
            }
        }
        self.local = Some((peer_id, role));
        let peers: Vec<_> = self.participants.keys().cloned().collect();
        for peer in peers {
            self.ensure_link(&peer);
        }
    }

    pub fn local(&self) -> Option<&PeerId> {
        self.local.as_ref().map(|(id, _)| id)
    }

    /// Whether this process forwards messages between the others.
    pub fn relays(&self) -> bool {
        self.local
            .as_ref()
            .is_some_and(|(_, role)| self.config.topology.relays(*role))
    }

    /// Starts tracking a participant and opens a link if the topology
    /// calls for one. Adding a known participant only updates its role.
    pub fn add_participant(&mut self, peer_id: PeerId, role: Role) {
        if self.local().is_some_and(|me| me == &peer_id) {
            return;
        }
        match self.participants.get_mut(&peer_id) {
            Some(tracked) => tracked.role = role,
            None => {
                debug!(%peer_id, %role, "tracking participant");
                let stashed_offer = self.orphan_offers.remove(&peer_id);
                self.participants.insert(
                    peer_id.clone(),
                    Tracked {
                        role,
                        state: ConnectionState::Disconnected,
                        link: None,
                        backoff: Backoff::new(self.config.retry.clone()),
                        stashed_offer,
                    },
                );
            }
        }
        self.ensure_link(&peer_id);
    }

    /// Stops tracking a participant, closing its link.
    pub fn remove_participant(&mut self, peer_id: &PeerId) -> Option<Participant> {
        self.orphan_offers.remove(peer_id);
        let tracked = self.participants.remove(peer_id)?;
        if let Some(link) = &tracked.link {
            let _ = link.command(LinkCommand::Close);
        }
        info!(%peer_id, "participant removed");
        Some(Participant {
            peer_id: peer_id.clone(),
            role: tracked.role,
            connection_state: tracked.state,
        })
    }

    /// Routes a negotiation payload relayed from `from`.
    pub fn handle_signal(&mut self, from: PeerId, payload: Negotiation) {
        let Some(tracked) = self.participants.get_mut(&from) else {
            if let Negotiation::Offer { sdp } = payload {
                debug!(%from, "offer from untracked peer, holding it");
                self.orphan_offers.insert(from, sdp);
            }
            return;
        };
        let undelivered = match &tracked.link {
            Some(link) => link.command(LinkCommand::Negotiation(payload)).err(),
            None => Some(LinkCommand::Negotiation(payload)),
        };
        match undelivered {
            Some(LinkCommand::Negotiation(Negotiation::Offer { sdp })) => {
                tracked.stashed_offer = Some(sdp);
                if tracked.link.is_none() {
                    self.ensure_link(&from);
                }
            }
            Some(_) => debug!(%from, "dropping negotiation for finished link"),
            None => {}
        }
    }

    /// A link reported up. Returns `true` if the participant's state
    /// changed.
    pub fn handle_link_up(&mut self, peer: &PeerId, generation: u64) -> bool {
        let Some(tracked) = self.current(peer, generation) else {
            return false;
        };
        tracked.backoff.reset();
        let changed = tracked.state != ConnectionState::Connected;
        tracked.state = ConnectionState::Connected;
        changed
    }

    /// A link task ended. Decides whether to retry.
    pub fn handle_link_closed(
        &mut self,
        peer: &PeerId,
        generation: u64,
        outcome: LinkOutcome,
    ) -> Verdict {
        let Some(tracked) = self.current(peer, generation) else {
            return Verdict::Ignored;
        };
        tracked.link = None;

        match outcome {
            LinkOutcome::Closed => {
                tracked.state = ConnectionState::Disconnected;
                Verdict::Ignored
            }
            LinkOutcome::Renegotiate(offer) => {
                tracked.stashed_offer = Some(offer);
                tracked.state = ConnectionState::Connecting;
                self.ensure_link(peer);
                Verdict::Retrying
            }
            LinkOutcome::Lost(_) | LinkOutcome::Failed(_) => {
                if tracked.stashed_offer.is_some() {
                    // The remote already restarted; answer without counting.
                    tracked.state = ConnectionState::Connecting;
                    self.ensure_link(peer);
                    return Verdict::Retrying;
                }
                match tracked.backoff.next_delay() {
                    Some(delay) => {
                        let attempt = tracked.backoff.attempt();
                        warn!(%peer, attempt, ?delay, ?outcome, "peer link down, retrying");
                        tracked.state = ConnectionState::Connecting;
                        self.spawn_link(peer, delay);
                        Verdict::Retrying
                    }
                    None => {
                        warn!(%peer, ?outcome, "peer link retries exhausted");
                        tracked.state = ConnectionState::Failed;
                        let role = tracked.role;
                        self.participants.remove(peer);
                        Verdict::Failed(Participant {
                            peer_id: peer.clone(),
                            role,
                            connection_state: ConnectionState::Failed,
                        })
                    }
                }
            }
        }
    }

    /// Sends a frame over the link to `peer`.
    pub fn send(&self, peer: &PeerId, bytes: Vec<u8>) -> Result<(), PeerError> {
        let tracked = self
            .participants
            .get(peer)
            .ok_or_else(|| PeerError::UnknownPeer(peer.clone()))?;
        match (&tracked.link, tracked.state) {
            (Some(link), ConnectionState::Connected) => link
                .command(LinkCommand::Send(bytes))
                .map_err(|_| PeerError::NotConnected(peer.clone())),
            _ => Err(PeerError::NotConnected(peer.clone())),
        }
    }

    /// Whether a frame from `peer` with `generation` comes from its live link.
    pub fn is_current(&self, peer: &PeerId, generation: u64) -> bool {
        self.participants
            .get(peer)
            .and_then(|t| t.link.as_ref())
            .is_some_and(|l| l.generation == generation)
    }

    /// Participants whose link is up.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<_> = self
            .participants
            .iter()
            .filter(|(_, t)| t.state == ConnectionState::Connected)
            .map(|(id, _)| id.clone())
            .collect();
        peers.sort();
        peers
    }

    pub fn state(&self, peer: &PeerId) -> Option<ConnectionState> {
        self.participants.get(peer).map(|t| t.state)
    }

    /// Snapshot of every tracked participant, sorted by id.
    pub fn participants(&self) -> Vec<Participant> {
        let mut all: Vec<_> = self
            .participants
            .iter()
            .map(|(id, t)| Participant {
                peer_id: id.clone(),
                role: t.role,
                connection_state: t.state,
            })
            .collect();
        all.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        all
    }

    /// Closes every link and waits for the tasks to finish. Participants
    /// are forgotten.
    pub async fn shutdown(&mut self) {
        self.orphan_offers.clear();
        let links: Vec<_> = self
            .participants
            .drain()
            .filter_map(|(_, t)| t.link)
            .collect();
        for link in links {
            link.close(LINK_CLOSE_GRACE).await;
        }
        debug!("peer links shut down");
    }

    // -- Internals --------------------------------------------------------

    fn current(&mut self, peer: &PeerId, generation: u64) -> Option<&mut Tracked> {
        self.participants
            .get_mut(peer)
            .filter(|t| t.link.as_ref().is_some_and(|l| l.generation == generation))
    }

    /// Opens a first link to `peer` if it should have one and has none.
    fn ensure_link(&mut self, peer: &PeerId) {
        let Some((_, local_role)) = &self.local else {
            return;
        };
        let local_role = *local_role;
        let Some(tracked) = self.participants.get(peer) else {
            return;
        };
        if tracked.link.is_some() {
            return;
        }
        if !self.config.topology.should_link(local_role, tracked.role) {
            return;
        }
        if !supports_peer_connections(self.connector.as_ref()) {
            if !self.support_reported {
                self.support_reported = true;
                warn!("peer connections unsupported on this platform");
                let _ = self.events.send(PeerEvent::Error {
                    code: PeerErrorCode::WebrtcSupport,
                    detail: PeerError::Unsupported.to_string(),
                });
            }
            return;
        }
        self.spawn_link(peer, Duration::ZERO);
    }

    /// Spawns the next generation for `peer`. The offering side waits
    /// `delay` first; the answering side just waits for the offer.
    fn spawn_link(&mut self, peer: &PeerId, delay: Duration) {
        let Some((local, _)) = &self.local else {
            return;
        };
        let local = local.clone();
        self.next_generation += 1;
        let generation = self.next_generation;
        let Some(tracked) = self.participants.get_mut(peer) else {
            return;
        };
        let opening = if is_offerer(&local, peer) {
            Opening::Offer { delay }
        } else {
            Opening::Answer {
                offer: tracked.stashed_offer.take(),
            }
        };
        debug!(%peer, generation, ?opening, "spawning peer link");
        let task = LinkTask {
            connector: Arc::clone(&self.connector),
            local,
            remote: peer.clone(),
            generation,
            answer_timeout: self.config.answer_timeout,
            offer_timeout: self.config.offer_timeout(),
            events: self.events.clone(),
        };
        tracked.state = ConnectionState::Connecting;
        tracked.link = Some(task.spawn(opening));
    }
}
