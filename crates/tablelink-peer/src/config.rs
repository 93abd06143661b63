//! Peer link configuration and topology policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tablelink_backoff::BackoffConfig;
use tablelink_protocol::Role;

/// Which participant pairs get a direct link, and who relays.
///
/// ```text
///   FullMesh            Star (default)        MeshWithRelay
///   G1───G2              G1    G2              G1───G2
///    \   /                 \  /                 \   /
///     \ /                   H                    \ /
///      H                  /                       H  (relays too)
///                        G3
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    /// Every pair is linked; nobody relays.
    FullMesh,
    /// Only host ↔ guest pairs are linked; the host relays guest traffic.
    #[default]
    Star,
    /// Every pair is linked and the host relays as well, so guests still
    /// hear each other while a direct guest link is down. Duplicates are
    /// dropped by sequence tracking.
    MeshWithRelay,
}

impl Topology {
    /// Whether a participant with `local` role should hold a link to one
    /// with `remote` role.
    pub fn should_link(self, local: Role, remote: Role) -> bool {
        match self {
            Self::FullMesh | Self::MeshWithRelay => true,
            Self::Star => local == Role::Host || remote == Role::Host,
        }
    }

    /// Whether a participant with `local` role forwards messages between
    /// the others.
    pub fn relays(self, local: Role) -> bool {
        match self {
            Self::FullMesh => false,
            Self::Star | Self::MeshWithRelay => local == Role::Host,
        }
    }
}

/// Configuration for the [`PeerConnectionManager`](crate::PeerConnectionManager).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Re-negotiation policy after a link fails. Exhausting it marks the
    /// participant failed.
    pub retry: BackoffConfig,
    /// How long an offerer waits for the answer.
    pub answer_timeout: Duration,
    pub topology: Topology,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            retry: BackoffConfig::default(),
            answer_timeout: Duration::from_secs(10),
            topology: Topology::default(),
        }
    }
}

impl PeerConfig {
    /// How long an answerer waits for an offer: the offerer may first be
    /// sleeping out a full backoff delay.
    pub(crate) fn offer_timeout(&self) -> Duration {
        self.answer_timeout + self.retry.max_delay
    }
}
