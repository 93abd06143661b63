//! Last-writer-wins conflict resolution.
//!
//! Peers apply updates in arrival order, which differs between peers. For
//! entity state (a token's position, the fog mask) consumers resolve
//! concurrent writes by [`Stamp`]: the later timestamp wins, and the
//! sender id breaks exact ties, so every peer converges on the same value.

use serde::{Deserialize, Serialize};
use tablelink_protocol::{AppMessage, PeerId};

/// Total order over writes: timestamp first, then sender id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Stamp {
    pub timestamp: u64,
    pub sender: PeerId,
}

impl Stamp {
    pub fn new(timestamp: u64, sender: PeerId) -> Self {
        Self { timestamp, sender }
    }

    /// The stamp of an application message.
    pub fn of(message: &AppMessage) -> Self {
        Self {
            timestamp: message.timestamp,
            sender: message.sender.clone(),
        }
    }
}

/// A value that only accepts writes newer than the one it holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LwwRegister<T> {
    current: Option<(Stamp, T)>,
}

impl<T> Default for LwwRegister<T> {
    fn default() -> Self {
        Self { current: None }
    }
}

impl<T> LwwRegister<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a write. Returns `true` if it became the current value.
    pub fn apply(&mut self, stamp: Stamp, value: T) -> bool {
        match &self.current {
            Some((held, _)) if *held >= stamp => false,
            _ => {
                self.current = Some((stamp, value));
                true
            }
        }
    }

    pub fn get(&self) -> Option<&T> {
        self.current.as_ref().map(|(_, v)| v)
    }

    pub fn stamp(&self) -> Option<&Stamp> {
        self.current.as_ref().map(|(s, _)| s)
    }
}
