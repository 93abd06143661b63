//! The session's view of who else is in the game.
//!
//! The driver mirrors every membership and link change into this set so
//! queries from other tasks never have to reach into the peer manager.
//!
//! `ParticipantSet` is a plain `BTreeMap` with no locking of its own; the
//! session wraps it together with the status behind one mutex.

use std::collections::BTreeMap;

use tablelink_peer::{ConnectionState, Participant};
use tablelink_protocol::{PeerId, Role};

#[derive(Debug, Default, Clone)]
pub struct ParticipantSet {
    entries: BTreeMap<PeerId, Participant>,
}

impl ParticipantSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking a participant in the `Connecting` state. Returns
    /// `false` if it was already tracked, in which case only its role is
    /// refreshed.
    pub fn insert(&mut self, peer_id: PeerId, role: Role) -> bool {
        if let Some(existing) = self.entries.get_mut(&peer_id) {
            existing.role = role;
            return false;
        }
        self.entries.insert(
            peer_id.clone(),
            Participant {
                peer_id,
                role,
                connection_state: ConnectionState::Connecting,
            },
        );
        true
    }

    /// Updates the link state of a tracked participant and returns the
    /// previous one.
    pub fn set_state(&mut self, peer_id: &PeerId, state: ConnectionState) -> Option<ConnectionState> {
        let entry = self.entries.get_mut(peer_id)?;
        Some(std::mem::replace(&mut entry.connection_state, state))
    }

    pub fn remove(&mut self, peer_id: &PeerId) -> Option<Participant> {
        self.entries.remove(peer_id)
    }

    /// Drops everyone not listed in `keep`. Used after a rejoin, when the
    /// rendezvous hands out the current member list.
    pub fn retain_only(&mut self, keep: &[PeerId]) -> Vec<PeerId> {
        let gone: Vec<PeerId> = self
            .entries
            .keys()
            .filter(|p| !keep.contains(p))
            .cloned()
            .collect();
        for peer_id in &gone {
            self.entries.remove(peer_id);
        }
        gone
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&Participant> {
        self.entries.get(peer_id)
    }

    pub fn host(&self) -> Option<&Participant> {
        self.entries.values().find(|p| p.role == Role::Host)
    }

    /// Whether the host is tracked and its link is up.
    pub fn host_connected(&self) -> bool {
        self.host()
            .is_some_and(|p| p.connection_state == ConnectionState::Connected)
    }

    /// A snapshot ordered by peer id.
    pub fn to_vec(&self) -> Vec<Participant> {
        self.entries.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
