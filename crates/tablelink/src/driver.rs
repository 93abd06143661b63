//! The session driver.
//!
//! One task per session run owns the signaling client, the peer links and
//! the game membership. It consumes three queues (commands from the
//! [`Session`](crate::Session) handle, signaling events, peer events) and
//! is the only writer of the session status.
//!
//! ```text
//!  Session ──Command──┐
//!                     ▼
//!  SignalingClient ──→ Driver ──→ Shared (status, participants)
//!                     ▲   │
//!  PeerConnection- ───┘   └──→ MessageRouter ──→ consumers
//!  Manager (PeerEvent)
//! ```

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use tablelink_peer::{Participant, PeerConnectionManager, PeerConnector, PeerEvent, Verdict};
use tablelink_protocol::{
    AppMessage, BincodeCodec, ClientSignal, Codec, GameId, ParticipantInfo, PeerId, Role,
    ServerSignal,
};
use tablelink_router::{MessageConsumer, MessageRouter};
use tablelink_signaling::{Dialer, SignalingClient, SignalingEvent};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::identity::Membership;
use crate::shared::Shared;
use crate::{GameIdentity, Notification, PeerErrorEvent, SessionConfig, SessionStatus};

/// Requests from the session handle.
pub(crate) enum Command {
    Join(GameIdentity),
    Broadcast { channel: String, payload: Vec<u8> },
    RegisterConsumer {
        channel: String,
        consumer: Box<dyn MessageConsumer>,
    },
    /// Restart signaling after going offline.
    Reconnect,
    Shutdown,
}

/// Lets a boxed consumer be handed to the router.
pub(crate) struct BoxedConsumer(pub(crate) Box<dyn MessageConsumer>);

impl MessageConsumer for BoxedConsumer {
    fn on_message(&mut self, message: &AppMessage) {
        self.0.on_message(message);
    }
}

pub(crate) struct Driver<D: Dialer, C: PeerConnector> {
    epoch: u64,
    shared: Arc<Shared>,
    dialer: Arc<D>,
    config: SessionConfig,
    router: Arc<Mutex<MessageRouter>>,
    codec: BincodeCodec,
    signaling: Option<SignalingClient>,
    signaling_events: Option<mpsc::UnboundedReceiver<SignalingEvent>>,
    /// A rendezvous connection is open right now.
    signaling_up: bool,
    peers: PeerConnectionManager<C>,
    identity: Option<GameIdentity>,
    membership: Option<Membership>,
    /// Set once the rendezvous asked for a newer build.
    halted: bool,
}

impl<D: Dialer, C: PeerConnector> Driver<D, C> {
    pub(crate) fn new(
        epoch: u64,
        shared: Arc<Shared>,
        dialer: Arc<D>,
        config: SessionConfig,
        router: Arc<Mutex<MessageRouter>>,
        peers: PeerConnectionManager<C>,
        identity: Option<GameIdentity>,
    ) -> Self {
        Self {
            epoch,
            shared,
            dialer,
            config,
            router,
            codec: BincodeCodec,
            signaling: None,
            signaling_events: None,
            signaling_up: false,
            peers,
            identity,
            membership: None,
            halted: false,
        }
    }

    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    ) {
        info!(epoch = self.epoch, "session driver started");
        self.start_signaling();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.on_command(command).await,
                },
                event = next_event(&mut self.signaling_events) => match event {
                    Some(event) => self.on_signaling(event).await,
                    None => self.signaling_events = None,
                },
                Some(event) = peer_events.recv() => self.on_peer(event).await,
            }
        }

        if self.membership.is_some() {
            self.send_signal(ClientSignal::Leave);
        }
        self.peers.shutdown().await;
        self.stop_signaling().await;
        info!(epoch = self.epoch, "session driver stopped");
    }

    // -- Commands ---------------------------------------------------------

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Join(identity) => self.join(identity).await,
            Command::Broadcast { channel, payload } => self.broadcast(channel, payload),
            Command::RegisterConsumer { channel, consumer } => {
                self.router().register_consumer(channel, BoxedConsumer(consumer));
            }
            Command::Reconnect => {
                if !self.halted && self.signaling.is_none() {
                    info!("restarting signaling");
                    self.start_signaling();
                }
            }
            Command::Shutdown => {}
        }
    }

    async fn join(&mut self, mut identity: GameIdentity) {
        if self.halted {
            debug!(game_id = %identity.game_id(), "join ignored, update required");
            return;
        }
        let member_of = self.membership.as_ref().map(|m| m.game_id.clone());
        match member_of {
            Some(current) if current == *identity.game_id() => {
                debug!(game_id = %current, "already a member");
                identity.forget_password();
                self.identity = Some(identity);
                return;
            }
            Some(current) => {
                info!(from = %current, to = %identity.game_id(), "switching games");
                self.send_signal(ClientSignal::Leave);
                self.leave_game().await;
                self.set_status(SessionStatus::Connecting);
            }
            None => {}
        }
        self.identity = Some(identity);
        self.send_join();
    }

    fn broadcast(&mut self, channel: String, payload: Vec<u8>) {
        if self.membership.is_none() {
            debug!(%channel, "not in a game, dropping outbound message");
            return;
        }
        let message = self.router().outbound(channel, payload, unix_millis());
        let bytes = match self.codec.encode(&message) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "failed to encode outbound message");
                return;
            }
        };
        trace!(channel = %message.channel, seq = message.sequence, "broadcast");
        for peer in self.peers.connected_peers() {
            if let Err(e) = self.peers.send(&peer, bytes.clone()) {
                debug!(%peer, error = %e, "broadcast send failed");
            }
        }
    }

    // -- Signaling --------------------------------------------------------

    async fn on_signaling(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::Connected => {
                self.signaling_up = true;
                self.send_join();
            }
            SignalingEvent::Reconnecting { attempt, delay } => {
                self.signaling_up = false;
                debug!(attempt, ?delay, "rendezvous reconnecting");
                if self.status() == SessionStatus::Joined {
                    self.set_status(SessionStatus::Reconnecting);
                }
            }
            SignalingEvent::Offline => {
                warn!("rendezvous unreachable, going offline");
                self.go_offline().await;
            }
            SignalingEvent::Message(signal) => self.on_server_signal(signal).await,
        }
    }

    async fn on_server_signal(&mut self, signal: ServerSignal) {
        match signal {
            ServerSignal::Joined {
                game_id,
                peer_id,
                role,
                token,
                participants,
            } => self.on_joined(game_id, peer_id, role, token, participants),
            ServerSignal::AuthRequired { game_id } => {
                info!(%game_id, "password required");
                self.on_auth(&game_id);
            }
            ServerSignal::AuthRejected { game_id } => {
                info!(%game_id, "password rejected");
                self.on_auth(&game_id);
            }
            ServerSignal::RejoinRejected { game_id } => {
                info!(%game_id, "rejoin refused, joining again");
                self.membership = None;
                self.leave_game().await;
                self.send_join();
            }
            ServerSignal::ParticipantJoined { participant } => {
                self.track(participant);
                self.refresh_status();
            }
            ServerSignal::ParticipantLeft { peer_id } => {
                info!(%peer_id, "participant left");
                let removed = self.peers.remove_participant(&peer_id);
                self.shared
                    .update(self.epoch, |s| s.participants.remove(&peer_id));
                self.router().forget_sender(&peer_id);
                if self.lost_host(removed.as_ref()) {
                    warn!(%peer_id, "host left the game, going offline");
                    self.go_offline().await;
                } else {
                    self.refresh_status();
                }
            }
            ServerSignal::Signal { from, payload } => self.peers.handle_signal(from, payload),
            ServerSignal::NeedsUpdate { min_version } => self.halt(min_version).await,
            ServerSignal::GameExpired { game_id } => self.on_expired(game_id).await,
            ServerSignal::Error { code, message } => {
                warn!(code, %message, "rendezvous reported an error");
            }
        }
    }

    fn on_joined(
        &mut self,
        game_id: GameId,
        peer_id: PeerId,
        role: Role,
        token: String,
        participants: Vec<ParticipantInfo>,
    ) {
        let rejoined = self.membership.as_ref().is_some_and(|m| m.peer_id == peer_id);
        info!(%game_id, %peer_id, %role, rejoined, "joined game");

        if let Some(identity) = &mut self.identity {
            identity.forget_password();
        }
        {
            let mut router = self.router();
            router.set_local(peer_id.clone());
            if !rejoined {
                router.reset_inbound();
            }
        }
        self.peers.set_local(peer_id.clone(), role);
        self.membership = Some(Membership {
            game_id,
            peer_id: peer_id.clone(),
            role,
            token,
        });

        // Anyone we track that is no longer listed left while we were away.
        let listed: Vec<PeerId> = participants.iter().map(|p| p.peer_id.clone()).collect();
        let gone = self
            .shared
            .update(self.epoch, |s| {
                s.local = Some((peer_id, role));
                s.participants.retain_only(&listed)
            })
            .unwrap_or_default();
        for peer in gone {
            self.peers.remove_participant(&peer);
            self.router().forget_sender(&peer);
        }
        for participant in participants {
            self.track(participant);
        }
        self.refresh_status();
    }

    fn on_auth(&mut self, game_id: &GameId) {
        if !self.is_our_game(game_id) {
            return;
        }
        if let Some(identity) = &mut self.identity {
            identity.forget_password();
        }
        self.shared.reenter_status(self.epoch, SessionStatus::Auth);
    }

    async fn halt(&mut self, min_version: u32) {
        warn!(
            min_version,
            ours = self.config.protocol_version,
            "rendezvous requires a newer protocol version"
        );
        self.halted = true;
        self.set_status(SessionStatus::NeedsUpdate);
        self.leave_game().await;
        self.stop_signaling().await;
    }

    async fn on_expired(&mut self, game_id: GameId) {
        let newly = self
            .shared
            .update(self.epoch, |s| s.expired.insert(game_id.clone()))
            .unwrap_or(false);
        if !self.is_our_game(&game_id) {
            debug!(%game_id, "expiry of a game we are not in");
            return;
        }
        info!(%game_id, "game expired");
        if newly {
            self.shared
                .notify(self.epoch, Notification::GameExpired { game_id });
        }
        self.identity = None;
        self.membership = None;
        self.leave_game().await;
        // Still connected to the rendezvous, but in no game.
        self.set_status(SessionStatus::Connecting);
    }

    // -- Peers ------------------------------------------------------------

    async fn on_peer(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Signal { to, payload } => {
                self.send_signal(ClientSignal::Signal { to, payload });
            }
            PeerEvent::LinkUp { peer, generation } => {
                if self.peers.handle_link_up(&peer, generation) {
                    info!(%peer, generation, "peer link up");
                }
                self.sync(&peer);
                self.refresh_status();
            }
            PeerEvent::LinkClosed {
                peer,
                generation,
                outcome,
            } => match self.peers.handle_link_closed(&peer, generation, outcome) {
                Verdict::Ignored | Verdict::Retrying => {
                    self.sync(&peer);
                    self.refresh_status();
                }
                Verdict::Failed(failed) => {
                    self.shared
                        .update(self.epoch, |s| s.participants.remove(&peer));
                    if self.lost_host(Some(&failed)) {
                        warn!(%peer, "host unreachable, going offline");
                        self.go_offline().await;
                    } else {
                        self.refresh_status();
                    }
                }
            },
            PeerEvent::Frame {
                peer,
                generation,
                bytes,
            } => self.on_frame(peer, generation, bytes),
            PeerEvent::Error { code, detail } => {
                warn!(%code, %detail, "peer error");
                self.shared.notify(
                    self.epoch,
                    Notification::PeerError(PeerErrorEvent { code, detail }),
                );
            }
        }
    }

    fn on_frame(&mut self, peer: PeerId, generation: u64, bytes: Vec<u8>) {
        if !self.peers.is_current(&peer, generation) {
            trace!(%peer, generation, "frame from a replaced link");
            return;
        }
        let message: AppMessage = match self.codec.decode(&bytes) {
            Ok(message) => message,
            Err(e) => {
                warn!(%peer, error = %e, "dropping undecodable frame");
                return;
            }
        };

        let targets = {
            let mut router = self.router();
            if !router.inbound(&message).is_delivered() || !self.peers.relays() {
                return;
            }
            router.relay_targets(&message, &peer, &self.peers.connected_peers())
        };
        for target in targets {
            if let Err(e) = self.peers.send(&target, bytes.clone()) {
                debug!(%target, error = %e, "relay failed");
            }
        }
    }

    // -- Helpers ----------------------------------------------------------

    fn router(&self) -> MutexGuard<'_, MessageRouter> {
        self.router
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn status(&self) -> SessionStatus {
        self.shared.status()
    }

    fn set_status(&self, status: SessionStatus) {
        self.shared.set_status(self.epoch, status);
    }

    fn is_our_game(&self, game_id: &GameId) -> bool {
        self.identity.as_ref().is_some_and(|i| i.game_id() == game_id)
            || self.membership.as_ref().is_some_and(|m| &m.game_id == game_id)
    }

    fn start_signaling(&mut self) {
        let (client, events) =
            SignalingClient::start(Arc::clone(&self.dialer), self.config.signaling.clone());
        self.signaling = Some(client);
        self.signaling_events = Some(events);
        self.signaling_up = false;
    }

    async fn stop_signaling(&mut self) {
        self.signaling_up = false;
        self.signaling_events = None;
        if let Some(mut client) = self.signaling.take() {
            client.shutdown().await;
        }
    }

    fn send_signal(&self, signal: ClientSignal) {
        match &self.signaling {
            Some(client) => {
                if let Err(e) = client.send(signal) {
                    debug!(error = %e, "signal not sent");
                }
            }
            None => debug!(?signal, "signaling stopped, dropping signal"),
        }
    }

    /// Asks for admission: a rejoin if we hold a token, a join otherwise.
    /// Waits for the next connect if the rendezvous is unreachable.
    fn send_join(&self) {
        if !self.signaling_up {
            return;
        }
        let version = self.config.protocol_version;
        if let Some(m) = &self.membership {
            self.send_signal(ClientSignal::Rejoin {
                version,
                game_id: m.game_id.clone(),
                peer_id: m.peer_id.clone(),
                token: m.token.clone(),
            });
        } else if let Some(identity) = &self.identity {
            self.send_signal(ClientSignal::Join {
                version,
                game_id: identity.game_id().clone(),
                password: identity.password().to_owned(),
            });
        }
    }

    fn track(&mut self, participant: ParticipantInfo) {
        if self.peers.local() == Some(&participant.peer_id) {
            return;
        }
        let ParticipantInfo { peer_id, role } = participant;
        self.shared
            .update(self.epoch, |s| s.participants.insert(peer_id.clone(), role));
        self.peers.add_participant(peer_id.clone(), role);
        self.sync(&peer_id);
    }

    /// Mirrors the manager's view of `peer` into the shared set.
    fn sync(&self, peer: &PeerId) {
        let state = self.peers.state(peer);
        self.shared.update(self.epoch, |s| match state {
            Some(state) => {
                s.participants.set_state(peer, state);
            }
            None => {
                s.participants.remove(peer);
            }
        });
    }

    /// Whether `removed` was our host while we are a guest.
    fn lost_host(&self, removed: Option<&Participant>) -> bool {
        removed.is_some_and(|p| p.role == Role::Host)
            && self.membership.as_ref().is_some_and(|m| m.role == Role::Guest)
    }

    /// Derives the status from membership, signaling and the host link.
    /// `Offline` is only left through `connect()`.
    fn refresh_status(&self) {
        let Some(membership) = &self.membership else {
            return;
        };
        let status = self.status();
        if status == SessionStatus::Offline {
            return;
        }
        let host_reachable = membership.role == Role::Host
            || self.shared.read(|s| s.participants.host_connected());
        if self.signaling_up && host_reachable {
            self.set_status(SessionStatus::Joined);
        } else if status == SessionStatus::Joined {
            self.set_status(SessionStatus::Reconnecting);
        } else if status == SessionStatus::Auth {
            self.set_status(SessionStatus::Connecting);
        }
    }

    /// Closes every link and forgets the participants. Membership is
    /// handled by the caller.
    async fn leave_game(&mut self) {
        self.peers.shutdown().await;
        self.shared.update(self.epoch, |s| {
            s.participants.clear();
            if self.membership.is_none() {
                s.local = None;
            }
        });
    }

    /// Tears the run down to `Offline`. Membership is kept so the next
    /// `connect()` can rejoin under the same peer id.
    async fn go_offline(&mut self) {
        self.leave_game().await;
        self.stop_signaling().await;
        self.set_status(SessionStatus::Offline);
    }
}

async fn next_event<T>(events: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
