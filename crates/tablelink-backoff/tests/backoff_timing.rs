//! Timing tests for [`Backoff::wait`].
//!
//! Uses `tokio::time::pause()` (via `start_paused`) so sleeps resolve
//! instantly while the virtual clock still advances by exactly the
//! requested amount.

use std::time::Duration;

use tablelink_backoff::{Backoff, BackoffConfig};
use tokio::time::Instant;

fn deterministic() -> BackoffConfig {
    BackoffConfig {
        base_delay: Duration::from_millis(100),
        multiplier: 2.0,
        max_delay: Duration::from_secs(1),
        max_attempts: 3,
        jitter: 0.0,
    }
}

#[tokio::test(start_paused = true)]
async fn test_wait_sleeps_for_each_delay() {
    let mut b = Backoff::new(deterministic());
    let start = Instant::now();

    assert_eq!(b.wait().await, Some(1));
    assert_eq!(start.elapsed(), Duration::from_millis(100));

    assert_eq!(b.wait().await, Some(2));
    assert_eq!(start.elapsed(), Duration::from_millis(300));

    assert_eq!(b.wait().await, Some(3));
    assert_eq!(start.elapsed(), Duration::from_millis(700));
}

#[tokio::test(start_paused = true)]
async fn test_wait_returns_none_without_sleeping_when_exhausted() {
    let mut b = Backoff::new(deterministic());
    while b.wait().await.is_some() {}

    let before = Instant::now();
    assert_eq!(b.wait().await, None);
    assert_eq!(before.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn test_whole_budget_matches_total_budget() {
    let cfg = deterministic();
    let mut b = Backoff::new(cfg.clone());
    let start = Instant::now();

    while b.wait().await.is_some() {}

    assert_eq!(start.elapsed(), cfg.total_budget());
}

#[test]
fn test_config_round_trips_through_json() {
    // Configs are embedded in application settings files.
    let cfg = deterministic();
    let json = serde_json::to_string(&cfg).unwrap();
    let back: BackoffConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(back, cfg);
}
