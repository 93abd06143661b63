//! Integration tests: `SignalingClient` against the in-process rendezvous.
//!
//! Time is paused so backoff sleeps complete instantly and deterministically.

use std::sync::Arc;
use std::time::Duration;

use tablelink_backoff::BackoffConfig;
use tablelink_protocol::{ClientSignal, GameId, PROTOCOL_VERSION, Role, ServerSignal};
use tablelink_signaling::{
    MemoryRendezvous, RendezvousConfig, SignalingClient, SignalingConfig, SignalingEvent,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

// -- Helpers ----------------------------------------------------------------

fn config(max_attempts: u32) -> SignalingConfig {
    SignalingConfig {
        retry: BackoffConfig::fixed(Duration::from_millis(100), max_attempts),
        channel_capacity: 16,
    }
}

async fn next(events: &mut UnboundedReceiver<SignalingEvent>) -> SignalingEvent {
    timeout(Duration::from_secs(30), events.recv())
        .await
        .expect("timed out waiting for a signaling event")
        .expect("event stream closed")
}

fn join(game: &str, password: &str) -> ClientSignal {
    ClientSignal::Join {
        version: PROTOCOL_VERSION,
        game_id: GameId::from(game),
        password: password.into(),
    }
}

// =========================================================================
// Happy path
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_start_connects_and_join_is_answered() {
    let rendezvous = Arc::new(MemoryRendezvous::default());
    let (client, mut events) = SignalingClient::start(Arc::clone(&rendezvous), config(3));

    assert_eq!(next(&mut events).await, SignalingEvent::Connected);
    client.send(join("g", "")).unwrap();

    match next(&mut events).await {
        SignalingEvent::Message(ServerSignal::Joined { role, .. }) => {
            assert_eq!(role, Role::Host)
        }
        other => panic!("expected Joined, got {other:?}"),
    }
    assert_eq!(rendezvous.members("g").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_task_and_closes_connection() {
    let rendezvous = Arc::new(MemoryRendezvous::default());
    let (mut client, mut events) = SignalingClient::start(Arc::clone(&rendezvous), config(3));
    assert_eq!(next(&mut events).await, SignalingEvent::Connected);

    client.shutdown().await;

    assert!(!client.is_running());
    assert!(matches!(
        client.send(ClientSignal::Leave),
        Err(tablelink_signaling::SignalingError::Stopped)
    ));
    // Server side notices the close.
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(rendezvous.connection_count(), 0);
}

// =========================================================================
// Reconnection
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_dropped_connection_reconnects_with_backoff() {
    let rendezvous = Arc::new(MemoryRendezvous::default());
    let (_client, mut events) = SignalingClient::start(Arc::clone(&rendezvous), config(3));
    assert_eq!(next(&mut events).await, SignalingEvent::Connected);

    rendezvous.drop_connections();

    assert_eq!(
        next(&mut events).await,
        SignalingEvent::Reconnecting {
            attempt: 1,
            delay: Duration::from_millis(100)
        }
    );
    assert_eq!(next(&mut events).await, SignalingEvent::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_offline_after_retry_budget_exhausted() {
    let rendezvous = Arc::new(MemoryRendezvous::default());
    let (client, mut events) = SignalingClient::start(Arc::clone(&rendezvous), config(2));
    assert_eq!(next(&mut events).await, SignalingEvent::Connected);

    rendezvous.set_online(false);

    for attempt in 1..=2 {
        assert_eq!(
            next(&mut events).await,
            SignalingEvent::Reconnecting {
                attempt,
                delay: Duration::from_millis(100)
            }
        );
    }
    assert_eq!(next(&mut events).await, SignalingEvent::Offline);
    assert!(events.recv().await.is_none(), "task should have stopped");
    assert!(!client.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_successful_reconnect_resets_budget() {
    let rendezvous = Arc::new(MemoryRendezvous::default());
    let (_client, mut events) = SignalingClient::start(Arc::clone(&rendezvous), config(1));
    assert_eq!(next(&mut events).await, SignalingEvent::Connected);

    for _ in 0..3 {
        rendezvous.drop_connections();
        assert!(matches!(
            next(&mut events).await,
            SignalingEvent::Reconnecting { attempt: 1, .. }
        ));
        assert_eq!(next(&mut events).await, SignalingEvent::Connected);
    }
}

// =========================================================================
// Rendezvous behavior seen through the client
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_rejoin_after_drop_keeps_peer_id() {
    let rendezvous = Arc::new(MemoryRendezvous::default());
    let (client, mut events) = SignalingClient::start(Arc::clone(&rendezvous), config(3));
    assert_eq!(next(&mut events).await, SignalingEvent::Connected);
    client.send(join("g", "pw")).unwrap();
    let SignalingEvent::Message(ServerSignal::Joined { peer_id, token, .. }) =
        next(&mut events).await
    else {
        panic!("expected Joined");
    };

    rendezvous.drop_connections();
    assert!(matches!(
        next(&mut events).await,
        SignalingEvent::Reconnecting { .. }
    ));
    assert_eq!(next(&mut events).await, SignalingEvent::Connected);
    client
        .send(ClientSignal::Rejoin {
            version: PROTOCOL_VERSION,
            game_id: GameId::from("g"),
            peer_id: peer_id.clone(),
            token,
        })
        .unwrap();

    match next(&mut events).await {
        SignalingEvent::Message(ServerSignal::Joined {
            peer_id: again, ..
        }) => assert_eq!(again, peer_id),
        other => panic!("expected Joined, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_min_version_gate_reports_needs_update() {
    let rendezvous = Arc::new(MemoryRendezvous::new(RendezvousConfig {
        min_version: PROTOCOL_VERSION + 1,
        ..RendezvousConfig::default()
    }));
    let (client, mut events) = SignalingClient::start(Arc::clone(&rendezvous), config(3));
    assert_eq!(next(&mut events).await, SignalingEvent::Connected);

    client.send(join("g", "")).unwrap();

    assert_eq!(
        next(&mut events).await,
        SignalingEvent::Message(ServerSignal::NeedsUpdate {
            min_version: PROTOCOL_VERSION + 1
        })
    );
}

#[tokio::test(start_paused = true)]
async fn test_expire_game_pushes_game_expired() {
    let rendezvous = Arc::new(MemoryRendezvous::default());
    let (client, mut events) = SignalingClient::start(Arc::clone(&rendezvous), config(3));
    assert_eq!(next(&mut events).await, SignalingEvent::Connected);
    client.send(join("g", "")).unwrap();
    assert!(matches!(
        next(&mut events).await,
        SignalingEvent::Message(ServerSignal::Joined { .. })
    ));

    rendezvous.expire_game("g");

    assert_eq!(
        next(&mut events).await,
        SignalingEvent::Message(ServerSignal::GameExpired {
            game_id: GameId::from("g")
        })
    );
}
