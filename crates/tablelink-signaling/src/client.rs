//! The signaling client: one logical, self-healing link to the rendezvous.
//!
//! # Architecture
//!
//! ```text
//!  SignalingClient (handle)            background task
//! ┌────────────────────────┐        ┌──────────────────────────────┐
//! │ send(ClientSignal) ────┼─mpsc──→│ dial ─→ pump ─→ lost         │
//! │ shutdown() ────────────┼─oneshot│   ↑               │          │
//! └────────────────────────┘        │   └── backoff ←───┘          │
//!          ▲                        │        (exhausted → Offline) │
//!          │ SignalingEvent         └──────────────┬───────────────┘
//!          └───────────────── unbounded mpsc ──────┘
//! ```
//!
//! The handle never blocks. Everything that touches the network happens on
//! the background task, which owns the connection and the retry policy.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tablelink_backoff::{Backoff, BackoffConfig};
use tablelink_protocol::{ClientSignal, Codec, JsonCodec, ServerSignal};
use tablelink_transport::{Connection, TransportError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{Dialer, SignalingError};

/// How long [`SignalingClient::shutdown`] waits for the task before
/// aborting it.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Configuration & events
// ---------------------------------------------------------------------------

/// Signaling client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// Reconnection policy for the rendezvous link.
    pub retry: BackoffConfig,
    /// Capacity of the outbound command queue.
    pub channel_capacity: usize,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            retry: BackoffConfig::default(),
            channel_capacity: 64,
        }
    }
}

/// What the signaling task reports upward.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    /// A rendezvous connection is up. Anything sent before this was dropped.
    Connected,
    /// A message from the rendezvous.
    Message(ServerSignal),
    /// The connection is down (or could not be opened); retry `attempt`
    /// starts after `delay`.
    Reconnecting { attempt: u32, delay: Duration },
    /// The retry budget is exhausted. The task has stopped.
    Offline,
}

// ---------------------------------------------------------------------------
// SignalingClient
// ---------------------------------------------------------------------------

/// Handle to the background signaling task.
///
/// Dropping the handle aborts the task.
pub struct SignalingClient {
    commands: mpsc::Sender<ClientSignal>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SignalingClient {
    /// Spawns the signaling task and returns its handle plus the event
    /// stream. Must be called from within a Tokio runtime.
    pub fn start<D: Dialer>(
        dialer: Arc<D>,
        config: SignalingConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SignalingEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(config.channel_capacity.max(1));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let worker = Worker {
            dialer,
            backoff: Backoff::new(config.retry),
            commands: cmd_rx,
            events: event_tx,
            shutdown: shutdown_rx,
            codec: JsonCodec,
        };
        let task = tokio::spawn(worker.run());

        let client = Self {
            commands: cmd_tx,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        };
        (client, event_rx)
    }

    /// Queues a message for the rendezvous.
    ///
    /// Messages queued while the link is down are dropped by the task; the
    /// caller re-sends whatever it needs after the next
    /// [`SignalingEvent::Connected`].
    pub fn send(&self, signal: ClientSignal) -> Result<(), SignalingError> {
        self.commands.try_send(signal).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SignalingError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SignalingError::Stopped,
        })
    }

    /// Returns `true` while the background task is alive.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stops the task and waits for it to finish (closing any open
    /// connection). Safe to call more than once.
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut task)
                .await
                .is_err()
            {
                warn!("signaling task did not stop in time, aborting");
                task.abort();
                let _ = task.await;
            }
        }
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Background task
// ---------------------------------------------------------------------------

/// Why a pump over one connection ended.
enum PumpExit {
    Shutdown,
    Lost(String),
}

struct Worker<D: Dialer> {
    dialer: Arc<D>,
    backoff: Backoff,
    commands: mpsc::Receiver<ClientSignal>,
    events: mpsc::UnboundedSender<SignalingEvent>,
    shutdown: oneshot::Receiver<()>,
    codec: JsonCodec,
}

impl<D: Dialer> Worker<D> {
    async fn run(mut self) {
        loop {
            let dialed = tokio::select! {
                _ = &mut self.shutdown => return,
                dialed = self.dialer.dial() => dialed,
            };

            match dialed {
                Ok(conn) => {
                    info!(conn = %conn.id(), "rendezvous connected");
                    self.backoff.reset();
                    if !self.emit(SignalingEvent::Connected) {
                        let _ = conn.close().await;
                        return;
                    }
                    match self.pump(&conn).await {
                        PumpExit::Shutdown => {
                            let _ = conn.close().await;
                            debug!("signaling task shut down");
                            return;
                        }
                        PumpExit::Lost(reason) => {
                            warn!(conn = %conn.id(), %reason, "rendezvous connection lost");
                            let _ = conn.close().await;
                        }
                    }
                }
                Err(e) => warn!(error = %e, "rendezvous dial failed"),
            }

            let Some(delay) = self.backoff.next_delay() else {
                info!(
                    attempts = self.backoff.attempt(),
                    "rendezvous retries exhausted, going offline"
                );
                self.emit(SignalingEvent::Offline);
                return;
            };
            let attempt = self.backoff.attempt();
            if !self.emit(SignalingEvent::Reconnecting { attempt, delay }) {
                return;
            }
            if !self.idle(delay).await {
                return;
            }
        }
    }

    /// Relays commands out and messages in until the connection drops or
    /// the client shuts down.
    async fn pump(&mut self, conn: &D::Connection) -> PumpExit {
        loop {
            tokio::select! {
                _ = &mut self.shutdown => {
                    self.flush(conn).await;
                    return PumpExit::Shutdown;
                }

                cmd = self.commands.recv() => {
                    let Some(signal) = cmd else {
                        return PumpExit::Shutdown;
                    };
                    if let Err(e) = self.forward(conn, &signal).await {
                        return PumpExit::Lost(e.to_string());
                    }
                }

                frame = conn.recv() => match frame {
                    Ok(Some(bytes)) => match self.codec.decode::<ServerSignal>(&bytes) {
                        Ok(msg) => {
                            debug!(?msg, "signaling recv");
                            if !self.emit(SignalingEvent::Message(msg)) {
                                return PumpExit::Shutdown;
                            }
                        }
                        Err(e) => warn!(error = %e, "ignoring malformed rendezvous message"),
                    },
                    Ok(None) => return PumpExit::Lost("closed by rendezvous".into()),
                    Err(e) => return PumpExit::Lost(e.to_string()),
                },
            }
        }
    }

    async fn forward(&self, conn: &D::Connection, signal: &ClientSignal) -> Result<(), TransportError> {
        debug!(?signal, "signaling send");
        match self.codec.encode(signal) {
            Ok(bytes) => conn.send(&bytes).await,
            Err(e) => {
                warn!(error = %e, "dropping unencodable signal");
                Ok(())
            }
        }
    }

    /// Sends what was queued before shutdown (a final `Leave`, usually).
    async fn flush(&mut self, conn: &D::Connection) {
        while let Ok(signal) = self.commands.try_recv() {
            if self.forward(conn, &signal).await.is_err() {
                return;
            }
        }
    }

    /// Waits out a backoff delay, discarding commands meanwhile. Returns
    /// `false` if the client shut down.
    async fn idle(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                _ = &mut self.shutdown => return false,
                cmd = self.commands.recv() => match cmd {
                    Some(signal) => debug!(?signal, "rendezvous down, dropping signal"),
                    None => return false,
                },
            }
        }
    }

    /// Returns `false` once nobody listens anymore.
    fn emit(&self, event: SignalingEvent) -> bool {
        self.events.send(event).is_ok()
    }
}
