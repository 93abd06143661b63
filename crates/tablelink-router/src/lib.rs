//! Application message routing for Tablelink.
//!
//! External producers hand the session a payload for a named channel
//! (`"map"`, `"token"`, `"fog"`, `"dice"` …). The [`MessageRouter`] turns
//! it into an [`AppMessage`](tablelink_protocol::AppMessage) with the next
//! sequence number, and on the receiving side filters duplicates and stale
//! arrivals before handing each message to the channel's
//! [`MessageConsumer`].
//!
//! [`Stamp`] and [`LwwRegister`] help consumers resolve concurrent writes
//! to the same entity. The router itself never merges state.

mod consumer;
mod lww;
mod router;

pub use consumer::MessageConsumer;
pub use lww::{LwwRegister, Stamp};
pub use router::{Delivery, MessageRouter};
