//! Integration tests: two `PeerConnectionManager`s over a `MemoryNetwork`.
//!
//! The harness plays the part of the session driver and the rendezvous:
//! it relays negotiation payloads between the two managers and feeds link
//! events back to their owners.

use std::sync::Arc;
use std::time::Duration;

use tablelink_backoff::BackoffConfig;
use tablelink_protocol::{PeerId, Role};
use tablelink_peer::{
    ConnectionState, LinkOutcome, MemoryNetwork, PeerConfig, PeerConnectionManager,
    PeerConnector, PeerError, PeerErrorCode, PeerEvent, Topology, Verdict,
    supports_peer_connections,
};
use tablelink_transport::MemoryConnection;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

// -- Harness ----------------------------------------------------------------

struct Side {
    id: PeerId,
    mgr: PeerConnectionManager<MemoryNetwork>,
    events: UnboundedReceiver<PeerEvent>,
}

#[derive(Debug, PartialEq)]
enum Seen {
    Relayed,
    Up(PeerId),
    Closed(PeerId, Verdict),
    Frame(PeerId, Vec<u8>),
    Error(PeerId, PeerErrorCode),
}

struct Harness {
    net: MemoryNetwork,
    a: Side,
    b: Side,
}

fn config(max_attempts: u32) -> PeerConfig {
    PeerConfig {
        retry: BackoffConfig::fixed(Duration::from_millis(10), max_attempts),
        answer_timeout: Duration::from_secs(1),
        topology: Topology::Star,
    }
}

impl Harness {
    /// "a" hosts, "b" is a guest; "a" < "b" so "a" offers.
    fn new(config: PeerConfig) -> Self {
        let net = MemoryNetwork::new();
        let side = |id: &str, role| {
            let (mut mgr, events) = PeerConnectionManager::new(Arc::new(net.clone()), config.clone());
            mgr.set_local(PeerId::from(id), role);
            Side {
                id: PeerId::from(id),
                mgr,
                events,
            }
        };
        let a = side("a", Role::Host);
        let b = side("b", Role::Guest);
        Self { net, a, b }
    }

    fn introduce(&mut self) {
        self.a.mgr.add_participant(self.b.id.clone(), Role::Guest);
        self.b.mgr.add_participant(self.a.id.clone(), Role::Host);
    }

    async fn step(&mut self) -> Seen {
        let (from_a, event) = timeout(Duration::from_secs(60), async {
            tokio::select! {
                Some(e) = self.a.events.recv() => (true, e),
                Some(e) = self.b.events.recv() => (false, e),
            }
        })
        .await
        .expect("no peer event within 60s");

        let (me, other) = if from_a {
            (&mut self.a, &mut self.b)
        } else {
            (&mut self.b, &mut self.a)
        };
        match event {
            PeerEvent::Signal { to, payload } => {
                assert_eq!(to, other.id);
                other.mgr.handle_signal(me.id.clone(), payload);
                Seen::Relayed
            }
            PeerEvent::LinkUp { peer, generation } => {
                me.mgr.handle_link_up(&peer, generation);
                Seen::Up(me.id.clone())
            }
            PeerEvent::LinkClosed {
                peer,
                generation,
                outcome,
            } => Seen::Closed(
                me.id.clone(),
                me.mgr.handle_link_closed(&peer, generation, outcome),
            ),
            PeerEvent::Frame { bytes, .. } => Seen::Frame(me.id.clone(), bytes),
            PeerEvent::Error { code, .. } => Seen::Error(me.id.clone(), code),
        }
    }

    fn both_connected(&self) -> bool {
        self.a.mgr.state(&self.b.id) == Some(ConnectionState::Connected)
            && self.b.mgr.state(&self.a.id) == Some(ConnectionState::Connected)
    }

    async fn until_connected(&mut self) {
        while !self.both_connected() {
            self.step().await;
        }
    }
}

// =========================================================================
// Negotiation
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_introduced_peers_negotiate_a_link() {
    let mut h = Harness::new(config(3));
    h.introduce();

    h.until_connected().await;

    assert_eq!(h.a.mgr.connected_peers(), vec![PeerId::from("b")]);
    assert_eq!(h.b.mgr.connected_peers(), vec![PeerId::from("a")]);
    assert_eq!(h.net.link_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_send_delivers_frame_to_remote() {
    let mut h = Harness::new(config(3));
    h.introduce();
    h.until_connected().await;

    h.a.mgr.send(&PeerId::from("b"), b"token moved".to_vec()).unwrap();

    assert_eq!(
        h.step().await,
        Seen::Frame(PeerId::from("b"), b"token moved".to_vec())
    );
}

#[tokio::test(start_paused = true)]
async fn test_send_before_link_up_is_not_connected() {
    let mut h = Harness::new(config(3));
    h.introduce();

    let err = h.a.mgr.send(&PeerId::from("b"), vec![1]).unwrap_err();

    assert!(matches!(err, PeerError::NotConnected(_)));
    assert!(matches!(
        h.a.mgr.send(&PeerId::from("zz"), vec![1]),
        Err(PeerError::UnknownPeer(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_offer_before_participant_known_is_held() {
    let mut h = Harness::new(config(3));
    // Only the offering side learns about the other at first.
    h.a.mgr.add_participant(PeerId::from("b"), Role::Guest);
    assert_eq!(h.step().await, Seen::Relayed);

    h.b.mgr.add_participant(PeerId::from("a"), Role::Host);
    h.until_connected().await;
}

// =========================================================================
// Failure and recovery
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_severed_link_is_renegotiated() {
    let mut h = Harness::new(config(3));
    h.introduce();
    h.until_connected().await;

    h.net.sever(&PeerId::from("a"), &PeerId::from("b"));

    let mut retrying = 0;
    while retrying < 2 {
        if let Seen::Closed(_, verdict) = h.step().await {
            assert_eq!(verdict, Verdict::Retrying);
            retrying += 1;
        }
    }
    h.until_connected().await;
}

#[tokio::test(start_paused = true)]
async fn test_remote_restart_replaces_link() {
    let mut h = Harness::new(config(3));
    h.introduce();
    h.until_connected().await;

    // The host drops and re-adds the guest, as after its own reconnect.
    h.a.mgr.remove_participant(&PeerId::from("b"));
    h.a.mgr.add_participant(PeerId::from("b"), Role::Guest);

    h.until_connected().await;
}

#[tokio::test(start_paused = true)]
async fn test_create_offer_failure_reported_then_participant_fails() {
    let mut h = Harness::new(config(2));
    h.net.set_fail_offers(true);
    h.introduce();

    let mut offer_errors = 0;
    loop {
        match h.step().await {
            Seen::Error(who, PeerErrorCode::CreateOffer) => {
                assert_eq!(who, PeerId::from("a"));
                offer_errors += 1;
            }
            Seen::Closed(who, Verdict::Failed(failed)) if who == PeerId::from("a") => {
                assert_eq!(failed.peer_id, PeerId::from("b"));
                assert_eq!(failed.role, Role::Guest);
                assert_eq!(failed.connection_state, ConnectionState::Failed);
                break;
            }
            _ => {}
        }
    }

    // First attempt plus two retries.
    assert_eq!(offer_errors, 3);
    assert_eq!(h.a.mgr.state(&PeerId::from("b")), None);
}

#[tokio::test(start_paused = true)]
async fn test_stale_generation_is_ignored() {
    let mut h = Harness::new(config(3));
    h.introduce();

    let verdict = h.a.mgr.handle_link_closed(
        &PeerId::from("b"),
        9_999,
        LinkOutcome::Lost("old link".into()),
    );

    assert_eq!(verdict, Verdict::Ignored);
    assert_eq!(
        h.a.mgr.state(&PeerId::from("b")),
        Some(ConnectionState::Connecting)
    );
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_closes_links_and_forgets_participants() {
    let mut h = Harness::new(config(3));
    h.introduce();
    h.until_connected().await;

    h.a.mgr.shutdown().await;

    assert!(h.a.mgr.participants().is_empty());
    // The remote sees its channel drop.
    loop {
        if let Seen::Closed(who, _) = h.step().await {
            if who == PeerId::from("b") {
                break;
            }
        }
    }
}

// =========================================================================
// Topology
// =========================================================================

#[tokio::test]
async fn test_star_guest_does_not_link_other_guests() {
    let net = MemoryNetwork::new();
    let (mut mgr, mut events) = PeerConnectionManager::new(Arc::new(net), PeerConfig::default());
    mgr.set_local(PeerId::from("g1"), Role::Guest);

    mgr.add_participant(PeerId::from("g2"), Role::Guest);
    mgr.add_participant(PeerId::from("h"), Role::Host);

    assert_eq!(
        mgr.state(&PeerId::from("g2")),
        Some(ConnectionState::Disconnected)
    );
    assert_eq!(
        mgr.state(&PeerId::from("h")),
        Some(ConnectionState::Connecting)
    );
    assert!(!mgr.relays());
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_participant_equal_to_local_is_ignored() {
    let (mut mgr, _events) =
        PeerConnectionManager::new(Arc::new(MemoryNetwork::new()), PeerConfig::default());
    mgr.set_local(PeerId::from("me"), Role::Host);

    mgr.add_participant(PeerId::from("me"), Role::Host);

    assert!(mgr.participants().is_empty());
    assert!(mgr.relays());
}

// =========================================================================
// Capability probe
// =========================================================================

/// A platform without peer connections.
struct NoPeerConnections;

impl PeerConnector for NoPeerConnections {
    type Channel = MemoryConnection;
    type Pending = ();

    fn is_supported(&self) -> bool {
        false
    }

    async fn create_offer(&self, _: &PeerId, _: &PeerId) -> Result<((), String), PeerError> {
        Err(PeerError::Unsupported)
    }

    async fn accept_offer(
        &self,
        _: &PeerId,
        _: &PeerId,
        _: &str,
    ) -> Result<(String, MemoryConnection), PeerError> {
        Err(PeerError::Unsupported)
    }

    async fn complete(&self, _: (), _: &str) -> Result<MemoryConnection, PeerError> {
        Err(PeerError::Unsupported)
    }
}

#[tokio::test]
async fn test_unsupported_platform_reported_once() {
    let (mut mgr, mut events) =
        PeerConnectionManager::new(Arc::new(NoPeerConnections), PeerConfig::default());
    mgr.set_local(PeerId::from("h"), Role::Host);

    mgr.add_participant(PeerId::from("g1"), Role::Guest);
    mgr.add_participant(PeerId::from("g2"), Role::Guest);

    match events.try_recv() {
        Ok(PeerEvent::Error { code, .. }) => assert_eq!(code, PeerErrorCode::WebrtcSupport),
        other => panic!("expected a support error, got {other:?}"),
    }
    assert!(events.try_recv().is_err());
    assert!(!supports_peer_connections(&NoPeerConnections));
    assert_eq!(
        mgr.state(&PeerId::from("g1")),
        Some(ConnectionState::Disconnected)
    );
}
