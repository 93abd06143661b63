//! In-process duplex connections.
//!
//! [`pair`] returns two connected halves backed by unbounded Tokio
//! channels. Closing either half (or any [`MemoryCloser`] taken from it)
//! shuts both directions, so the remote `recv` drains what was already
//! sent and then yields `Ok(None)`, exactly like a clean WebSocket close.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::{Connection, ConnectionId, TransportError};

type Outbox = Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>;

/// Both directions of one pair. Index 0 carries A → B, index 1 B → A.
struct Wires {
    directions: [Outbox; 2],
}

impl Wires {
    fn cut(&self) {
        for direction in &self.directions {
            if let Ok(mut slot) = direction.lock() {
                slot.take();
            }
        }
    }
}

/// One half of an in-memory duplex connection.
pub struct MemoryConnection {
    id: ConnectionId,
    /// Which entry of `wires.directions` this half writes into.
    side: usize,
    wires: Arc<Wires>,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

/// A handle that can close a [`MemoryConnection`] pair from the outside,
/// e.g. to simulate a network partition.
#[derive(Clone)]
pub struct MemoryCloser {
    wires: Arc<Wires>,
}

impl MemoryCloser {
    /// Closes both directions of the pair.
    pub fn close(&self) {
        self.wires.cut();
    }
}

/// Creates a connected pair of in-memory connections.
pub fn pair() -> (MemoryConnection, MemoryConnection) {
    let (a_to_b, b_inbox) = mpsc::unbounded_channel();
    let (b_to_a, a_inbox) = mpsc::unbounded_channel();
    let wires = Arc::new(Wires {
        directions: [Mutex::new(Some(a_to_b)), Mutex::new(Some(b_to_a))],
    });

    let a = MemoryConnection {
        id: ConnectionId::next(),
        side: 0,
        wires: Arc::clone(&wires),
        inbox: tokio::sync::Mutex::new(a_inbox),
    };
    let b = MemoryConnection {
        id: ConnectionId::next(),
        side: 1,
        wires,
        inbox: tokio::sync::Mutex::new(b_inbox),
    };
    (a, b)
}

impl MemoryConnection {
    /// Returns a handle that closes this pair when asked.
    pub fn closer(&self) -> MemoryCloser {
        MemoryCloser {
            wires: Arc::clone(&self.wires),
        }
    }
}

/// A dropped half hangs up, so the remote never waits on a dead pair.
impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.wires.cut();
    }
}

impl Connection for MemoryConnection {
    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        let slot = self.wires.directions[self.side].lock().map_err(|_| {
            TransportError::ConnectionClosed("memory wire poisoned".into())
        })?;
        match slot.as_ref() {
            Some(tx) => tx.send(data.to_vec()).map_err(|_| {
                TransportError::ConnectionClosed(format!("{} peer dropped", self.id))
            }),
            None => Err(TransportError::ConnectionClosed(format!(
                "{} closed",
                self.id
            ))),
        }
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>, TransportError> {
        Ok(self.inbox.lock().await.recv().await)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.wires.cut();
        tracing::trace!(id = %self.id, "memory connection closed");
        Ok(())
    }

    fn id(&self) -> ConnectionId {
        self.id
    }
}
