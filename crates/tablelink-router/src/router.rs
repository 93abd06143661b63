//! Sequencing, dedup and relay decisions for application messages.

use std::collections::HashMap;

use tablelink_protocol::{AppMessage, PeerId};
use tracing::{debug, trace, warn};

use crate::MessageConsumer;

/// What happened to an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// New for its `(sender, channel)`; handed to the consumer if any.
    Delivered,
    /// Same sequence as the last delivered one.
    Duplicate,
    /// Older than the last delivered one.
    Stale,
    /// Structurally broken (empty channel, sequence 0).
    Invalid,
}

impl Delivery {
    pub fn is_delivered(self) -> bool {
        self == Self::Delivered
    }
}

/// Stamps outbound messages and filters inbound ones.
///
/// Ordering is per `(sender, channel)` and by arrival: nothing is buffered,
/// so a gap in one sender's stream never holds back anyone else. A message
/// older than what was already delivered is dropped.
pub struct MessageRouter {
    local: PeerId,
    /// Last sequence used per outbound channel.
    outbound: HashMap<String, u64>,
    /// Highest delivered sequence per (sender, channel).
    highest: HashMap<(PeerId, String), u64>,
    consumers: HashMap<String, Box<dyn MessageConsumer>>,
}

impl MessageRouter {
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            outbound: HashMap::new(),
            highest: HashMap::new(),
            consumers: HashMap::new(),
        }
    }

    pub fn local(&self) -> &PeerId {
        &self.local
    }

    /// Changes the local identity (after joining under a new peer id).
    pub fn set_local(&mut self, local: PeerId) {
        self.local = local;
    }

    /// Builds the next outbound message on `channel`.
    pub fn outbound(
        &mut self,
        channel: impl Into<String>,
        payload: Vec<u8>,
        timestamp: u64,
    ) -> AppMessage {
        let channel = channel.into();
        let sequence = self.outbound.entry(channel.clone()).or_insert(0);
        *sequence += 1;
        AppMessage {
            channel,
            sender: self.local.clone(),
            sequence: *sequence,
            payload,
            timestamp,
        }
    }

    /// Filters an inbound message and delivers it if new.
    pub fn inbound(&mut self, message: &AppMessage) -> Delivery {
        if let Err(e) = message.validate() {
            warn!(sender = %message.sender, error = %e, "dropping invalid message");
            return Delivery::Invalid;
        }
        if message.sender == self.local {
            // Our own message relayed back.
            return Delivery::Duplicate;
        }

        let key = (message.sender.clone(), message.channel.clone());
        match self.highest.get(&key) {
            Some(&highest) if message.sequence == highest => {
                trace!(sender = %message.sender, channel = %message.channel, seq = message.sequence, "duplicate");
                return Delivery::Duplicate;
            }
            Some(&highest) if message.sequence < highest => {
                debug!(
                    sender = %message.sender,
                    channel = %message.channel,
                    seq = message.sequence,
                    highest,
                    "stale message dropped"
                );
                return Delivery::Stale;
            }
            _ => {}
        }
        self.highest.insert(key, message.sequence);

        if let Some(consumer) = self.consumers.get_mut(&message.channel) {
            consumer.on_message(message);
        }
        Delivery::Delivered
    }

    /// Where to forward a message freshly delivered from `source`: every
    /// connected peer except the link it came in on and its author.
    pub fn relay_targets(
        &self,
        message: &AppMessage,
        source: &PeerId,
        connected: &[PeerId],
    ) -> Vec<PeerId> {
        connected
            .iter()
            .filter(|p| *p != source && **p != message.sender && **p != self.local)
            .cloned()
            .collect()
    }

    /// Installs the consumer for `channel`, returning the one it replaces.
    pub fn register_consumer(
        &mut self,
        channel: impl Into<String>,
        consumer: impl MessageConsumer,
    ) -> Option<Box<dyn MessageConsumer>> {
        self.consumers.insert(channel.into(), Box::new(consumer))
    }

    pub fn unregister_consumer(&mut self, channel: &str) -> Option<Box<dyn MessageConsumer>> {
        self.consumers.remove(channel)
    }

    /// The highest sequence delivered from `sender` on `channel`.
    pub fn highest_delivered(&self, sender: &PeerId, channel: &str) -> Option<u64> {
        self.highest
            .get(&(sender.clone(), channel.to_owned()))
            .copied()
    }

    /// Drops inbound tracking for a participant that left for good.
    pub fn forget_sender(&mut self, sender: &PeerId) {
        self.highest.retain(|(s, _), _| s != sender);
    }

    /// Forgets all inbound tracking. Outbound counters and consumers stay,
    /// so sequences keep increasing across session runs.
    pub fn reset_inbound(&mut self) {
        self.highest.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(sender: &str, channel: &str, sequence: u64) -> AppMessage {
        AppMessage {
            channel: channel.into(),
            sender: PeerId::from(sender),
            sequence,
            payload: vec![],
            timestamp: 0,
        }
    }

    #[test]
    fn test_outbound_sequences_per_channel_start_at_one() {
        let mut r = MessageRouter::new(PeerId::from("me"));
        assert_eq!(r.outbound("map", vec![], 1).sequence, 1);
        assert_eq!(r.outbound("map", vec![], 2).sequence, 2);
        assert_eq!(r.outbound("fog", vec![], 3).sequence, 1);
    }

    #[test]
    fn test_inbound_new_sequences_delivered() {
        let mut r = MessageRouter::new(PeerId::from("me"));
        assert_eq!(r.inbound(&msg("a", "map", 1)), Delivery::Delivered);
        assert_eq!(r.inbound(&msg("a", "map", 2)), Delivery::Delivered);
        assert_eq!(r.highest_delivered(&PeerId::from("a"), "map"), Some(2));
    }

    #[test]
    fn test_inbound_equal_sequence_is_duplicate() {
        let mut r = MessageRouter::new(PeerId::from("me"));
        r.inbound(&msg("a", "map", 4));
        assert_eq!(r.inbound(&msg("a", "map", 4)), Delivery::Duplicate);
    }

    #[test]
    fn test_inbound_lower_sequence_is_stale() {
        let mut r = MessageRouter::new(PeerId::from("me"));
        r.inbound(&msg("a", "map", 5));
        assert_eq!(r.inbound(&msg("a", "map", 3)), Delivery::Stale);
    }

    #[test]
    fn test_inbound_gap_from_one_sender_does_not_block_others() {
        let mut r = MessageRouter::new(PeerId::from("me"));
        r.inbound(&msg("a", "map", 1));
        assert_eq!(r.inbound(&msg("a", "map", 7)), Delivery::Delivered);
        assert_eq!(r.inbound(&msg("b", "map", 1)), Delivery::Delivered);
        assert_eq!(r.inbound(&msg("a", "token", 1)), Delivery::Delivered);
    }

    #[test]
    fn test_inbound_invalid_and_own_messages_rejected() {
        let mut r = MessageRouter::new(PeerId::from("me"));
        assert_eq!(r.inbound(&msg("a", "map", 0)), Delivery::Invalid);
        assert_eq!(r.inbound(&msg("a", "", 1)), Delivery::Invalid);
        assert_eq!(r.inbound(&msg("me", "map", 1)), Delivery::Duplicate);
    }

    #[test]
    fn test_relay_targets_exclude_source_author_and_self() {
        let r = MessageRouter::new(PeerId::from("host"));
        let connected: Vec<PeerId> = ["g1", "g2", "g3"].map(PeerId::from).to_vec();

        let m = msg("g1", "map", 1);
        let targets = r.relay_targets(&m, &PeerId::from("g1"), &connected);

        assert_eq!(targets, vec![PeerId::from("g2"), PeerId::from("g3")]);
    }

    #[test]
    fn test_forget_sender_allows_fresh_start() {
        let mut r = MessageRouter::new(PeerId::from("me"));
        r.inbound(&msg("a", "map", 9));

        r.forget_sender(&PeerId::from("a"));

        assert_eq!(r.inbound(&msg("a", "map", 1)), Delivery::Delivered);
    }
}
