//! The [`Session`] handle.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tablelink_peer::{Participant, PeerConnectionManager, PeerConnector};
use tablelink_protocol::{GameId, PeerId, Role};
use tablelink_router::{MessageConsumer, MessageRouter};
use tablelink_signaling::Dialer;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::driver::{BoxedConsumer, Command, Driver};
use crate::notify::{self, SubscriptionToken};
use crate::shared::Shared;
use crate::{
    GameIdentity, Notification, NotificationKind, SessionConfig, SessionError, SessionStatus,
};

/// How long `disconnect()` waits for the driver before aborting it.
const DRIVER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

struct DriverHandle {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl DriverHandle {
    fn is_alive(&self) -> bool {
        !self.task.is_finished()
    }

    async fn stop(mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if tokio::time::timeout(DRIVER_SHUTDOWN_TIMEOUT, &mut self.task)
            .await
            .is_err()
        {
            warn!("session driver did not stop in time, aborting");
            self.task.abort();
            let _ = self.task.await;
        }
    }
}

#[derive(Default)]
struct Run {
    driver: Option<DriverHandle>,
    /// A join requested before `connect()`.
    identity: Option<GameIdentity>,
}

/// One participant's membership in a shared game.
///
/// The handle itself never blocks: `connect`, `join_game` and `broadcast`
/// queue work for a background driver task, and outcomes are observed
/// through [`status`](Self::status) and the notifications registered with
/// [`on`](Self::on). Only [`disconnect`](Self::disconnect) is async.
///
/// ```rust
/// use std::time::Duration;
/// use tablelink::prelude::*;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let rendezvous = MemoryRendezvous::default();
/// let network = MemoryNetwork::new();
///
/// let host = Session::new(rendezvous.clone(), network.clone(), SessionConfig::default());
/// host.join_game("table-1", "").unwrap();
/// host.connect();
///
/// tokio::time::sleep(Duration::from_millis(100)).await;
/// assert_eq!(host.status(), SessionStatus::Joined);
/// assert_eq!(host.role(), Some(Role::Host));
///
/// host.disconnect().await;
/// assert_eq!(host.status(), SessionStatus::Ready);
/// # }
/// ```
///
/// Dropping a session aborts its tasks without a goodbye to the others;
/// prefer `disconnect().await`.
pub struct Session<D: Dialer, C: PeerConnector> {
    dialer: Arc<D>,
    connector: Arc<C>,
    config: SessionConfig,
    shared: Arc<Shared>,
    /// Unset local id until the first join. Outlives driver runs, so
    /// consumers and outbound sequences persist across reconnects.
    router: Arc<Mutex<MessageRouter>>,
    run: Mutex<Run>,
    dispatcher: JoinHandle<()>,
}

impl<D: Dialer, C: PeerConnector> Session<D, C> {
    /// Creates an idle session in the `Ready` state.
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(dialer: D, connector: C, config: SessionConfig) -> Self {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::new(notify_tx));
        let dispatcher = tokio::spawn(notify::dispatch(Arc::clone(&shared), notify_rx));
        Self {
            dialer: Arc::new(dialer),
            connector: Arc::new(connector),
            config: config.validated(),
            shared,
            router: Arc::new(Mutex::new(MessageRouter::new(PeerId::new("")))),
            run: Mutex::new(Run::default()),
            dispatcher,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Starts the session: dials the rendezvous and, once a game was
    /// requested, joins it.
    ///
    /// No-op while already running. From `Offline` it restarts signaling.
    /// Ignored once an update is required.
    pub fn connect(&self) {
        let mut run = self.run();
        let status = self.shared.status();
        if status.is_terminal() {
            debug!("connect ignored, update required");
            return;
        }
        let epoch = self.shared.epoch();

        if let Some(driver) = run.driver.as_ref().filter(|d| d.is_alive()) {
            if status == SessionStatus::Offline {
                self.shared.set_status(epoch, SessionStatus::Connecting);
                let _ = driver.commands.send(Command::Reconnect);
            }
            return;
        }

        info!(epoch, "session connecting");
        self.shared.set_status(epoch, SessionStatus::Connecting);
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (peers, peer_events) =
            PeerConnectionManager::new(Arc::clone(&self.connector), self.config.peer.clone());
        let driver = Driver::new(
            epoch,
            Arc::clone(&self.shared),
            Arc::clone(&self.dialer),
            self.config.clone(),
            Arc::clone(&self.router),
            peers,
            run.identity.take(),
        );
        let task = tokio::spawn(driver.run(command_rx, peer_events));
        run.driver = Some(DriverHandle { commands, task });
    }

    /// Stops everything this session runs and waits for it: peer links,
    /// retry timers and the signaling connection. The session is back in
    /// a fresh `Ready` state afterwards, and nothing queued by the old run
    /// reaches a listener. Safe to call at any time.
    pub async fn disconnect(&self) {
        let driver = {
            let mut run = self.run();
            run.identity = None;
            let epoch = self.shared.reset();
            debug!(epoch, "session reset");
            run.driver.take()
        };
        // A listener of the closed run may still be running, possibly
        // calling back into this session; `run` is released by now.
        self.shared.wait_for_delivery();
        if let Some(driver) = driver {
            driver.stop().await;
            info!("session disconnected");
        }
        self.router().reset_inbound();
    }

    /// Asks to join `game_id`. Whether that worked shows in the status:
    /// `Joined`, or `Auth` when the password is missing or wrong.
    ///
    /// Called before [`connect`](Self::connect), the request waits for it.
    ///
    /// # Errors
    ///
    /// - [`SessionError::InvalidGameId`] for an empty id.
    /// - [`SessionError::SessionClosed`] if the game expired.
    pub fn join_game(
        &self,
        game_id: impl Into<GameId>,
        password: impl Into<String>,
    ) -> Result<(), SessionError> {
        let game_id = game_id.into();
        if game_id.is_empty() {
            return Err(SessionError::InvalidGameId);
        }
        if self.shared.read(|s| s.expired.contains(&game_id)) {
            return Err(SessionError::SessionClosed(game_id));
        }

        let identity = GameIdentity::new(game_id, password);
        let mut run = self.run();
        let identity = match run.driver.as_ref().filter(|d| d.is_alive()) {
            Some(driver) => match driver.commands.send(Command::Join(identity)) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(Command::Join(identity))) => identity,
                Err(_) => return Ok(()),
            },
            None => identity,
        };
        run.identity = Some(identity);
        Ok(())
    }

    /// Sends `payload` on `channel` to every participant.
    ///
    /// Messages sent before the game is joined are dropped.
    ///
    /// # Errors
    ///
    /// - [`SessionError::InvalidChannel`] for an empty channel name.
    /// - [`SessionError::NotConnected`] before `connect()`.
    pub fn broadcast(
        &self,
        channel: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Result<(), SessionError> {
        let channel = channel.into();
        if channel.is_empty() {
            return Err(SessionError::InvalidChannel);
        }
        let run = self.run();
        let driver = run
            .driver
            .as_ref()
            .filter(|d| d.is_alive())
            .ok_or(SessionError::NotConnected)?;
        driver
            .commands
            .send(Command::Broadcast {
                channel,
                payload: payload.into(),
            })
            .map_err(|_| SessionError::NotConnected)
    }

    /// Installs the consumer for inbound messages on `channel`, replacing
    /// any previous one. Registrations survive `disconnect()`.
    pub fn register_consumer(&self, channel: impl Into<String>, consumer: impl MessageConsumer) {
        let channel = channel.into();
        let run = self.run();
        if let Some(driver) = run.driver.as_ref().filter(|d| d.is_alive()) {
            // Through the driver: a consumer may register others from
            // inside its own callback, while the router is locked.
            let command = Command::RegisterConsumer {
                channel,
                consumer: Box::new(consumer),
            };
            match driver.commands.send(command) {
                Ok(()) => {}
                Err(mpsc::error::SendError(Command::RegisterConsumer { channel, consumer })) => {
                    self.router()
                        .register_consumer(channel, BoxedConsumer(consumer));
                }
                Err(_) => {}
            }
            return;
        }
        self.router().register_consumer(channel, consumer);
    }

    /// Calls `callback` for every notification of `kind`, in order, on the
    /// notification task.
    pub fn on(
        &self,
        kind: NotificationKind,
        callback: impl Fn(&Notification) + Send + Sync + 'static,
    ) -> SubscriptionToken {
        self.shared.listeners.add(kind, Box::new(callback))
    }

    /// Removes a listener. Returns `false` if it was already gone.
    pub fn off(&self, token: SubscriptionToken) -> bool {
        self.shared.listeners.remove(token)
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.status()
    }

    /// The other members of the game and the state of our link to each.
    pub fn participants(&self) -> Vec<Participant> {
        self.shared.read(|s| s.participants.to_vec())
    }

    /// Our peer id, once admitted to a game.
    pub fn local_peer(&self) -> Option<PeerId> {
        self.shared.read(|s| s.local.as_ref().map(|(id, _)| id.clone()))
    }

    pub fn role(&self) -> Option<Role> {
        self.shared.read(|s| s.local.as_ref().map(|(_, role)| *role))
    }

    fn run(&self) -> MutexGuard<'_, Run> {
        self.run.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn router(&self) -> MutexGuard<'_, MessageRouter> {
        self.router
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<D: Dialer, C: PeerConnector> Drop for Session<D, C> {
    fn drop(&mut self) {
        if let Some(driver) = self.run().driver.take() {
            driver.task.abort();
        }
        self.dispatcher.abort();
    }
}
