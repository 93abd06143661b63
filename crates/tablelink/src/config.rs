//! Session configuration and the [`SessionBuilder`].

use serde::{Deserialize, Serialize};
use tablelink_backoff::BackoffConfig;
use tablelink_peer::{PeerConfig, PeerConnector, Topology};
use tablelink_protocol::PROTOCOL_VERSION;
use tablelink_signaling::{Dialer, SignalingConfig};

use crate::Session;

/// Everything a [`Session`] can be tuned with.
///
/// Loads from any serde format, so an application can keep it in its own
/// settings file:
///
/// ```rust
/// let config: tablelink::SessionConfig = serde_json::from_str(r#"{
///     "signaling": { "retry": { "base_delay": { "secs": 1, "nanos": 0 },
///                               "multiplier": 2.0,
///                               "max_delay": { "secs": 8, "nanos": 0 },
///                               "max_attempts": 3, "jitter": 0.0 },
///                    "channel_capacity": 32 },
///     "peer": { "retry": { "base_delay": { "secs": 1, "nanos": 0 },
///                          "multiplier": 2.0,
///                          "max_delay": { "secs": 4, "nanos": 0 },
///                          "max_attempts": 2, "jitter": 0.0 },
///               "answer_timeout": { "secs": 5, "nanos": 0 },
///               "topology": "full_mesh" },
///     "protocol_version": 1
/// }"#).unwrap();
/// assert_eq!(config.signaling.retry.max_attempts, 3);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub signaling: SignalingConfig,
    pub peer: PeerConfig,
    /// Sent with every join; the rendezvous answers `NeedsUpdate` when it
    /// is too old.
    pub protocol_version: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            signaling: SignalingConfig::default(),
            peer: PeerConfig::default(),
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

impl SessionConfig {
    /// Clamps both retry policies into sane ranges.
    pub fn validated(mut self) -> Self {
        self.signaling.retry = self.signaling.retry.validated();
        self.peer.retry = self.peer.retry.validated();
        self.signaling.channel_capacity = self.signaling.channel_capacity.max(1);
        self
    }
}

/// Builder for a [`Session`].
///
/// # Example
///
/// ```rust
/// use tablelink::prelude::*;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let rendezvous = MemoryRendezvous::default();
/// let network = MemoryNetwork::new();
///
/// let session = SessionBuilder::new()
///     .topology(Topology::FullMesh)
///     .build(rendezvous, network);
/// assert_eq!(session.status(), SessionStatus::Ready);
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct SessionBuilder {
    config: SessionConfig,
}

impl SessionBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            config: SessionConfig::default(),
        }
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the rendezvous connection settings.
    pub fn signaling(mut self, config: SignalingConfig) -> Self {
        self.config.signaling = config;
        self
    }

    /// Sets the rendezvous reconnection policy.
    pub fn signaling_retry(mut self, retry: BackoffConfig) -> Self {
        self.config.signaling.retry = retry;
        self
    }

    /// Sets the peer link settings.
    pub fn peer(mut self, config: PeerConfig) -> Self {
        self.config.peer = config;
        self
    }

    /// Sets the peer link re-negotiation policy.
    pub fn peer_retry(mut self, retry: BackoffConfig) -> Self {
        self.config.peer.retry = retry;
        self
    }

    pub fn topology(mut self, topology: Topology) -> Self {
        self.config.peer.topology = topology;
        self
    }

    pub fn protocol_version(mut self, version: u32) -> Self {
        self.config.protocol_version = version;
        self
    }

    /// Builds the session. Nothing connects until [`Session::connect`].
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime.
    pub fn build<D: Dialer, C: PeerConnector>(self, dialer: D, connector: C) -> Session<D, C> {
        Session::new(dialer, connector, self.config)
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}
