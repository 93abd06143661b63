//! An in-process rendezvous service.
//!
//! [`MemoryRendezvous`] implements [`Dialer`]: every `dial()` creates an
//! in-memory duplex pair, keeps one half and serves it on a spawned task
//! speaking the same JSON signaling protocol a networked rendezvous would.
//! Used for local play, demos and tests.
//!
//! Operator controls simulate what a real deployment does to clients:
//! expiring games, raising the minimum protocol version, going down.

mod directory;

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tablelink_protocol::{
    ClientSignal, Codec, GameId, JsonCodec, PROTOCOL_VERSION, ParticipantInfo, ServerSignal,
};
use tablelink_transport::{Connection, MemoryConnection, TransportError};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::Dialer;
use directory::Directory;

/// Configuration for [`MemoryRendezvous`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RendezvousConfig {
    /// Oldest protocol version admitted. Older clients get `NeedsUpdate`.
    pub min_version: u32,
    /// How long a member whose signaling dropped may rejoin with its token
    /// before the others are told it left.
    pub rejoin_grace: Duration,
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            min_version: PROTOCOL_VERSION,
            rejoin_grace: Duration::from_secs(30),
        }
    }
}

struct Inner {
    directory: Mutex<Directory>,
    online: AtomicBool,
    sweeper_started: AtomicBool,
    sweep_every: Duration,
}

impl Inner {
    fn directory(&self) -> MutexGuard<'_, Directory> {
        // A panic while holding the lock leaves plain bookkeeping behind;
        // keep serving it.
        self.directory
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A rendezvous service living in this process.
///
/// Cheap to clone; all clones share the same games.
#[derive(Clone)]
pub struct MemoryRendezvous {
    inner: Arc<Inner>,
}

impl Default for MemoryRendezvous {
    fn default() -> Self {
        Self::new(RendezvousConfig::default())
    }
}

impl MemoryRendezvous {
    pub fn new(config: RendezvousConfig) -> Self {
        let sweep_every = (config.rejoin_grace / 2).max(Duration::from_millis(100));
        Self {
            inner: Arc::new(Inner {
                directory: Mutex::new(Directory::new(config)),
                online: AtomicBool::new(true),
                sweeper_started: AtomicBool::new(false),
                sweep_every,
            }),
        }
    }

    // -- Operator controls ------------------------------------------------

    /// Creates (or re-opens) a game ahead of time. An empty password leaves
    /// it unprotected. Pre-opened games outlive their last member.
    pub fn open_game(&self, game_id: impl Into<GameId>, password: impl Into<String>) {
        self.inner
            .directory()
            .open_game(game_id.into(), password.into());
    }

    /// Deletes a game. Connected members receive `GameExpired`; later joins
    /// are refused the same way.
    pub fn expire_game(&self, game_id: impl Into<GameId>) {
        self.inner.directory().expire_game(&game_id.into());
    }

    /// Raises (or lowers) the oldest admitted protocol version.
    pub fn set_min_version(&self, min_version: u32) {
        self.inner.directory().set_min_version(min_version);
    }

    /// Takes the service down (refusing dials and dropping every
    /// connection) or brings it back up.
    pub fn set_online(&self, online: bool) {
        let was = self.inner.online.swap(online, Ordering::SeqCst);
        if was && !online {
            info!("rendezvous going offline");
            self.drop_connections();
        } else if !was && online {
            info!("rendezvous back online");
        }
    }

    /// Severs every connection without going offline, as a network blip
    /// would. Clients are expected to redial and rejoin.
    pub fn drop_connections(&self) {
        self.inner.directory().close_all();
    }

    /// Sweeps members whose rejoin grace elapsed. Runs periodically on its
    /// own once the first client has dialed.
    pub fn expire_stale(&self) {
        self.inner.directory().expire_stale();
    }

    // -- Queries ----------------------------------------------------------

    /// Members of a game, in join order.
    pub fn members(&self, game_id: impl Into<GameId>) -> Vec<ParticipantInfo> {
        self.inner.directory().members(&game_id.into())
    }

    /// Connections currently served.
    pub fn connection_count(&self) -> usize {
        self.inner.directory().connection_count()
    }

    fn ensure_sweeper(&self) {
        if self.inner.sweeper_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let every = self.inner.sweep_every;
        tokio::spawn(sweep(weak, every));
    }
}

impl Dialer for MemoryRendezvous {
    type Connection = MemoryConnection;

    async fn dial(&self) -> Result<MemoryConnection, TransportError> {
        if !self.inner.online.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectFailed {
                endpoint: "memory rendezvous".into(),
                source: io::Error::new(io::ErrorKind::ConnectionRefused, "rendezvous offline"),
            });
        }
        self.ensure_sweeper();

        let (client, server) = tablelink_transport::pair();
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        self.inner
            .directory()
            .attach(server.id(), outbox, server.closer());
        debug!(conn = %server.id(), "rendezvous accepted connection");
        tokio::spawn(serve(Arc::clone(&self.inner), server, outbox_rx));
        Ok(client)
    }
}

/// Serves one connection until either side closes it.
async fn serve(
    inner: Arc<Inner>,
    conn: MemoryConnection,
    mut outbox: mpsc::UnboundedReceiver<ServerSignal>,
) {
    let codec = JsonCodec;
    loop {
        tokio::select! {
            frame = conn.recv() => match frame {
                Ok(Some(bytes)) => match codec.decode::<ClientSignal>(&bytes) {
                    Ok(signal) => {
                        inner.directory().handle(conn.id(), signal);
                    }
                    Err(e) => {
                        warn!(conn = %conn.id(), error = %e, "malformed client signal");
                        let reply = ServerSignal::Error {
                            code: 400,
                            message: e.to_string(),
                        };
                        if let Ok(bytes) = codec.encode(&reply) {
                            let _ = conn.send(&bytes).await;
                        }
                    }
                },
                Ok(None) | Err(_) => break,
            },

            Some(signal) = outbox.recv() => {
                let bytes = match codec.encode(&signal) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(error = %e, "unencodable server signal");
                        continue;
                    }
                };
                if conn.send(&bytes).await.is_err() {
                    break;
                }
            }
        }
    }
    inner.directory().detach(conn.id());
    let _ = conn.close().await;
    debug!(conn = %conn.id(), "rendezvous connection finished");
}

async fn sweep(inner: Weak<Inner>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.directory().expire_stale();
    }
}
