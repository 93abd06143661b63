//! Where delivered messages go.

use tablelink_protocol::AppMessage;
use tokio::sync::mpsc;

/// Receives the messages of one logical channel, in per-sender order.
///
/// Implemented for closures and for unbounded channel senders, so a
/// consumer can either react inline or hand messages to another task:
///
/// ```rust
/// use tablelink_router::{MessageConsumer, MessageRouter};
/// use tablelink_protocol::PeerId;
///
/// let mut router = MessageRouter::new(PeerId::from("me"));
/// let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
/// router.register_consumer("token", tx);
/// router.register_consumer("dice", |msg: &tablelink_protocol::AppMessage| {
///     println!("{} rolled", msg.sender);
/// });
/// # let _ = rx.try_recv();
/// ```
pub trait MessageConsumer: Send + 'static {
    fn on_message(&mut self, message: &AppMessage);
}

impl<F> MessageConsumer for F
where
    F: FnMut(&AppMessage) + Send + 'static,
{
    fn on_message(&mut self, message: &AppMessage) {
        self(message)
    }
}

impl MessageConsumer for mpsc::UnboundedSender<AppMessage> {
    fn on_message(&mut self, message: &AppMessage) {
        // A dropped receiver just stops listening.
        let _ = self.send(message.clone());
    }
}
