//! Game directory: who is in which game, and what to tell them.
//!
//! Pure bookkeeping with no I/O of its own. Every connection served by the
//! rendezvous registers an outbox here; handling a [`ClientSignal`] pushes
//! [`ServerSignal`]s into the relevant outboxes.
//!
//! ## Member lifecycle
//!
//! ```text
//! Join ──→ [Connected] ──connection lost──→ [Disconnected]
//!              ▲                                  │
//!              └──────── Rejoin (token) ──────────┤
//!                                                 ▼ (grace elapsed)
//!                                    removed, ParticipantLeft sent
//! ```
//!
//! Only an explicit `Leave` or an elapsed grace period announces
//! `ParticipantLeft`. A brief signaling drop is invisible to the others.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use rand::Rng;
use tablelink_protocol::{ClientSignal, GameId, ParticipantInfo, PeerId, Role, ServerSignal};
use tablelink_transport::{ConnectionId, MemoryCloser};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::RendezvousConfig;

pub(crate) type Outbox = mpsc::UnboundedSender<ServerSignal>;

/// Presence of a member on the signaling side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Presence {
    Connected(ConnectionId),
    Disconnected { since: Instant },
}

#[derive(Debug)]
struct Member {
    peer_id: PeerId,
    role: Role,
    token: String,
    presence: Presence,
}

impl Member {
    fn info(&self) -> ParticipantInfo {
        ParticipantInfo {
            peer_id: self.peer_id.clone(),
            role: self.role,
        }
    }
}

#[derive(Debug)]
struct Game {
    password: String,
    /// Opened by the operator; survives becoming empty.
    persistent: bool,
    /// In join order.
    members: Vec<Member>,
}

impl Game {
    fn has_host(&self) -> bool {
        self.members.iter().any(|m| m.role == Role::Host)
    }
}

/// One connection currently served by the rendezvous.
struct Client {
    outbox: Outbox,
    closer: MemoryCloser,
    membership: Option<(GameId, PeerId)>,
}

/// All games and connections of one rendezvous.
pub(crate) struct Directory {
    config: RendezvousConfig,
    games: HashMap<GameId, Game>,
    expired: HashSet<GameId>,
    clients: HashMap<ConnectionId, Client>,
}

impl Directory {
    pub(crate) fn new(config: RendezvousConfig) -> Self {
        Self {
            config,
            games: HashMap::new(),
            expired: HashSet::new(),
            clients: HashMap::new(),
        }
    }

    // -- Connections ------------------------------------------------------

    pub(crate) fn attach(&mut self, conn: ConnectionId, outbox: Outbox, closer: MemoryCloser) {
        self.clients.insert(
            conn,
            Client {
                outbox,
                closer,
                membership: None,
            },
        );
    }

    /// The connection is gone. Its member (if any) enters the grace period.
    pub(crate) fn detach(&mut self, conn: ConnectionId) {
        let Some(client) = self.clients.remove(&conn) else {
            return;
        };
        let Some((game_id, peer_id)) = client.membership else {
            return;
        };
        if let Some(member) = self
            .games
            .get_mut(&game_id)
            .and_then(|g| g.members.iter_mut().find(|m| m.peer_id == peer_id))
        {
            if member.presence == Presence::Connected(conn) {
                member.presence = Presence::Disconnected {
                    since: Instant::now(),
                };
                info!(%game_id, %peer_id, "member lost signaling, grace period started");
            }
        }
    }

    /// Closes every served connection from the rendezvous side.
    pub(crate) fn close_all(&mut self) {
        for client in self.clients.values() {
            client.closer.close();
        }
    }

    pub(crate) fn connection_count(&self) -> usize {
        self.clients.len()
    }

    // -- Operator controls ------------------------------------------------

    pub(crate) fn open_game(&mut self, game_id: GameId, password: String) {
        self.expired.remove(&game_id);
        let game = self.games.entry(game_id).or_insert_with(|| Game {
            password: String::new(),
            persistent: true,
            members: Vec::new(),
        });
        game.password = password;
        game.persistent = true;
    }

    pub(crate) fn expire_game(&mut self, game_id: &GameId) {
        let Some(game) = self.games.remove(game_id) else {
            self.expired.insert(game_id.clone());
            return;
        };
        self.expired.insert(game_id.clone());
        info!(%game_id, members = game.members.len(), "game expired");
        for member in &game.members {
            if let Presence::Connected(conn) = member.presence {
                if let Some(client) = self.clients.get_mut(&conn) {
                    client.membership = None;
                    let _ = client.outbox.send(ServerSignal::GameExpired {
                        game_id: game_id.clone(),
                    });
                }
            }
        }
    }

    pub(crate) fn set_min_version(&mut self, min_version: u32) {
        self.config.min_version = min_version;
    }

    pub(crate) fn members(&self, game_id: &GameId) -> Vec<ParticipantInfo> {
        self.games
            .get(game_id)
            .map(|g| g.members.iter().map(Member::info).collect())
            .unwrap_or_default()
    }

    /// Removes members whose grace period elapsed and tells the others.
    pub(crate) fn expire_stale(&mut self) -> Vec<PeerId> {
        let grace = self.config.rejoin_grace;
        let mut gone = Vec::new();
        for (game_id, game) in &mut self.games {
            let mut left = Vec::new();
            game.members.retain(|m| match m.presence {
                Presence::Disconnected { since } if since.elapsed() >= grace => {
                    info!(%game_id, peer_id = %m.peer_id, "member grace period elapsed");
                    left.push(m.peer_id.clone());
                    false
                }
                _ => true,
            });
            for peer_id in &left {
                broadcast(
                    &self.clients,
                    game,
                    ServerSignal::ParticipantLeft {
                        peer_id: peer_id.clone(),
                    },
                );
            }
            gone.extend(left);
        }
        self.games
            .retain(|_, g| g.persistent || !g.members.is_empty());
        gone
    }

    // -- Client messages --------------------------------------------------

    pub(crate) fn handle(&mut self, conn: ConnectionId, signal: ClientSignal) {
        match signal {
            ClientSignal::Join {
                version,
                game_id,
                password,
            } => self.join(conn, version, game_id, password),
            ClientSignal::Rejoin {
                version,
                game_id,
                peer_id,
                token,
            } => self.rejoin(conn, version, game_id, peer_id, token),
            ClientSignal::Signal { to, payload } => {
                let Some((game_id, from)) = self.membership(conn) else {
                    self.reply(conn, not_joined());
                    return;
                };
                let target = self.games.get(&game_id).and_then(|g| {
                    g.members.iter().find_map(|m| match m.presence {
                        Presence::Connected(c) if m.peer_id == to => Some(c),
                        _ => None,
                    })
                });
                match target {
                    Some(target) => {
                        debug!(%game_id, %from, %to, "relaying negotiation");
                        self.reply(target, ServerSignal::Signal { from, payload });
                    }
                    None => self.reply(
                        conn,
                        ServerSignal::Error {
                            code: 404,
                            message: format!("peer {to} is not reachable"),
                        },
                    ),
                }
            }
            ClientSignal::Leave => self.leave(conn),
        }
    }

    fn join(&mut self, conn: ConnectionId, version: u32, game_id: GameId, password: String) {
        if !self.admit(conn, version, &game_id) {
            return;
        }
        if let Some(game) = self.games.get(&game_id) {
            if !game.password.is_empty() {
                if password.is_empty() {
                    self.reply(conn, ServerSignal::AuthRequired { game_id });
                    return;
                }
                if password != game.password {
                    warn!(%game_id, %conn, "wrong game password");
                    self.reply(conn, ServerSignal::AuthRejected { game_id });
                    return;
                }
            }
        }
        // A connection belongs to at most one game.
        self.leave(conn);

        let game = self.games.entry(game_id.clone()).or_insert_with(|| {
            info!(%game_id, "game opened");
            Game {
                password,
                persistent: false,
                members: Vec::new(),
            }
        });
        let role = if game.has_host() { Role::Guest } else { Role::Host };
        let member = Member {
            peer_id: PeerId::new(generate_hex(8)),
            role,
            token: generate_hex(16),
            presence: Presence::Connected(conn),
        };
        let joined = ServerSignal::Joined {
            game_id: game_id.clone(),
            peer_id: member.peer_id.clone(),
            role,
            token: member.token.clone(),
            participants: game.members.iter().map(Member::info).collect(),
        };
        broadcast(
            &self.clients,
            game,
            ServerSignal::ParticipantJoined {
                participant: member.info(),
            },
        );
        info!(%game_id, peer_id = %member.peer_id, %role, "member joined");
        let peer_id = member.peer_id.clone();
        game.members.push(member);

        if let Some(client) = self.clients.get_mut(&conn) {
            client.membership = Some((game_id, peer_id));
            let _ = client.outbox.send(joined);
        }
    }

    fn rejoin(
        &mut self,
        conn: ConnectionId,
        version: u32,
        game_id: GameId,
        peer_id: PeerId,
        token: String,
    ) {
        if !self.admit(conn, version, &game_id) {
            return;
        }
        let grace = self.config.rejoin_grace;
        let position = self.games.get(&game_id).and_then(|game| {
            game.members.iter().position(|m| {
                m.peer_id == peer_id
                    && m.token == token
                    && match m.presence {
                        Presence::Disconnected { since } => since.elapsed() < grace,
                        // The old connection has not been noticed as dead yet.
                        Presence::Connected(old) => old != conn,
                    }
            })
        });
        let (Some(index), Some(game)) = (position, self.games.get_mut(&game_id)) else {
            warn!(%game_id, %peer_id, "rejoin rejected");
            self.reply(conn, ServerSignal::RejoinRejected { game_id });
            return;
        };

        let previous = std::mem::replace(
            &mut game.members[index].presence,
            Presence::Connected(conn),
        );
        let joined = ServerSignal::Joined {
            game_id: game_id.clone(),
            peer_id: peer_id.clone(),
            role: game.members[index].role,
            token: game.members[index].token.clone(),
            participants: game
                .members
                .iter()
                .filter(|m| m.peer_id != peer_id)
                .map(Member::info)
                .collect(),
        };
        if let Presence::Connected(old) = previous {
            if let Some(stale) = self.clients.get_mut(&old) {
                stale.membership = None;
                stale.closer.close();
            }
        }
        info!(%game_id, %peer_id, "member rejoined");
        if let Some(client) = self.clients.get_mut(&conn) {
            client.membership = Some((game_id, peer_id));
            let _ = client.outbox.send(joined);
        }
    }

    /// Removes the connection's membership and announces it.
    fn leave(&mut self, conn: ConnectionId) {
        let Some((game_id, peer_id)) = self
            .clients
            .get_mut(&conn)
            .and_then(|c| c.membership.take())
        else {
            return;
        };
        let Some(game) = self.games.get_mut(&game_id) else {
            return;
        };
        game.members.retain(|m| m.peer_id != peer_id);
        info!(%game_id, %peer_id, "member left");
        broadcast(
            &self.clients,
            game,
            ServerSignal::ParticipantLeft { peer_id },
        );
        if !game.persistent && game.members.is_empty() {
            self.games.remove(&game_id);
            debug!(%game_id, "empty game closed");
        }
    }

    /// Version gate and expiry check shared by join and rejoin.
    fn admit(&self, conn: ConnectionId, version: u32, game_id: &GameId) -> bool {
        if version < self.config.min_version {
            warn!(%conn, version, min = self.config.min_version, "client too old");
            self.reply(
                conn,
                ServerSignal::NeedsUpdate {
                    min_version: self.config.min_version,
                },
            );
            return false;
        }
        if game_id.is_empty() {
            self.reply(
                conn,
                ServerSignal::Error {
                    code: 400,
                    message: "empty game id".into(),
                },
            );
            return false;
        }
        if self.expired.contains(game_id) {
            self.reply(
                conn,
                ServerSignal::GameExpired {
                    game_id: game_id.clone(),
                },
            );
            return false;
        }
        true
    }

    fn membership(&self, conn: ConnectionId) -> Option<(GameId, PeerId)> {
        self.clients.get(&conn).and_then(|c| c.membership.clone())
    }

    fn reply(&self, conn: ConnectionId, signal: ServerSignal) {
        if let Some(client) = self.clients.get(&conn) {
            let _ = client.outbox.send(signal);
        }
    }
}

/// Sends `signal` to every connected member of `game`.
fn broadcast(
    clients: &HashMap<ConnectionId, Client>,
    game: &Game,
    signal: ServerSignal,
) {
    for member in &game.members {
        if let Presence::Connected(conn) = member.presence {
            if let Some(client) = clients.get(&conn) {
                let _ = client.outbox.send(signal.clone());
            }
        }
    }
}

fn not_joined() -> ServerSignal {
    ServerSignal::Error {
        code: 409,
        message: "not a member of any game".into(),
    }
}

/// `len` random bytes as lowercase hex.
fn generate_hex(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| format!("{:02x}", rng.random::<u8>()))
        .collect()
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tablelink_protocol::Negotiation;

    struct Probe {
        conn: ConnectionId,
        rx: mpsc::UnboundedReceiver<ServerSignal>,
        // Keeps the pair's wires alive.
        _halves: (tablelink_transport::MemoryConnection, tablelink_transport::MemoryConnection),
    }

    impl Probe {
        fn next(&mut self) -> ServerSignal {
            self.rx.try_recv().expect("expected a signal")
        }

        fn is_quiet(&mut self) -> bool {
            self.rx.try_recv().is_err()
        }
    }

    fn directory() -> Directory {
        Directory::new(RendezvousConfig {
            min_version: 1,
            rejoin_grace: Duration::from_secs(30),
        })
    }

    fn attach(dir: &mut Directory) -> Probe {
        let (a, b) = tablelink_transport::pair();
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = ConnectionId::next();
        dir.attach(conn, tx, a.closer());
        Probe {
            conn,
            rx,
            _halves: (a, b),
        }
    }

    fn join(dir: &mut Directory, probe: &Probe, game: &str, password: &str) {
        dir.handle(
            probe.conn,
            ClientSignal::Join {
                version: 1,
                game_id: GameId::from(game),
                password: password.into(),
            },
        );
    }

    fn joined_peer(signal: ServerSignal) -> (PeerId, Role, String) {
        match signal {
            ServerSignal::Joined {
                peer_id,
                role,
                token,
                ..
            } => (peer_id, role, token),
            other => panic!("expected Joined, got {other:?}"),
        }
    }

    // =====================================================================
    // join
    // =====================================================================

    #[tokio::test]
    async fn test_join_first_member_becomes_host() {
        let mut dir = directory();
        let mut a = attach(&mut dir);

        join(&mut dir, &a, "g", "");

        let (peer, role, token) = joined_peer(a.next());
        assert_eq!(role, Role::Host);
        assert_eq!(peer.as_str().len(), 16);
        assert_eq!(token.len(), 32);
    }

    #[tokio::test]
    async fn test_join_second_member_is_guest_and_announced() {
        let mut dir = directory();
        let mut a = attach(&mut dir);
        let mut b = attach(&mut dir);
        join(&mut dir, &a, "g", "");
        let (host, _, _) = joined_peer(a.next());

        join(&mut dir, &b, "g", "");

        let ServerSignal::ParticipantJoined { participant } = a.next() else {
            panic!("host should hear about the guest");
        };
        assert_eq!(participant.role, Role::Guest);
        match b.next() {
            ServerSignal::Joined {
                role, participants, ..
            } => {
                assert_eq!(role, Role::Guest);
                assert_eq!(participants.len(), 1);
                assert_eq!(participants[0].peer_id, host);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_join_protected_game_without_password_requires_auth() {
        let mut dir = directory();
        dir.open_game(GameId::from("g"), "pw".into());
        let mut a = attach(&mut dir);

        join(&mut dir, &a, "g", "");

        assert!(matches!(a.next(), ServerSignal::AuthRequired { .. }));
        assert!(dir.members(&GameId::from("g")).is_empty());
    }

    #[tokio::test]
    async fn test_join_wrong_password_rejected() {
        let mut dir = directory();
        dir.open_game(GameId::from("g"), "pw".into());
        let mut a = attach(&mut dir);

        join(&mut dir, &a, "g", "nope");
        join(&mut dir, &a, "g", "pw");

        assert!(matches!(a.next(), ServerSignal::AuthRejected { .. }));
        assert!(matches!(a.next(), ServerSignal::Joined { .. }));
    }

    #[tokio::test]
    async fn test_join_old_version_needs_update() {
        let mut dir = directory();
        dir.set_min_version(2);
        let mut a = attach(&mut dir);

        join(&mut dir, &a, "g", "");

        assert_eq!(a.next(), ServerSignal::NeedsUpdate { min_version: 2 });
    }

    #[tokio::test]
    async fn test_join_expired_game_reports_expiry() {
        let mut dir = directory();
        dir.expire_game(&GameId::from("g"));
        let mut a = attach(&mut dir);

        join(&mut dir, &a, "g", "");

        assert!(matches!(a.next(), ServerSignal::GameExpired { .. }));
    }

    // =====================================================================
    // signal relay & leave
    // =====================================================================

    #[tokio::test]
    async fn test_signal_relayed_to_target_only() {
        let mut dir = directory();
        let mut a = attach(&mut dir);
        let mut b = attach(&mut dir);
        join(&mut dir, &a, "g", "");
        let (host, _, _) = joined_peer(a.next());
        join(&mut dir, &b, "g", "");
        let _ = a.next();
        let (guest, _, _) = joined_peer(b.next());

        dir.handle(
            b.conn,
            ClientSignal::Signal {
                to: host.clone(),
                payload: Negotiation::Offer { sdp: "x".into() },
            },
        );

        assert_eq!(
            a.next(),
            ServerSignal::Signal {
                from: guest,
                payload: Negotiation::Offer { sdp: "x".into() },
            }
        );
        assert!(b.is_quiet());
    }

    #[tokio::test]
    async fn test_leave_announces_and_closes_empty_game() {
        let mut dir = directory();
        let mut a = attach(&mut dir);
        let mut b = attach(&mut dir);
        join(&mut dir, &a, "g", "");
        let _ = a.next();
        join(&mut dir, &b, "g", "");
        let _ = a.next();
        let (guest, _, _) = joined_peer(b.next());

        dir.handle(b.conn, ClientSignal::Leave);
        assert_eq!(a.next(), ServerSignal::ParticipantLeft { peer_id: guest });

        dir.handle(a.conn, ClientSignal::Leave);
        assert!(dir.games.is_empty());
    }

    // =====================================================================
    // rejoin & grace
    // =====================================================================

    #[tokio::test]
    async fn test_rejoin_within_grace_keeps_peer_id() {
        let mut dir = directory();
        let mut a = attach(&mut dir);
        join(&mut dir, &a, "g", "");
        let (peer, role, token) = joined_peer(a.next());
        dir.detach(a.conn);

        let mut again = attach(&mut dir);
        dir.handle(
            again.conn,
            ClientSignal::Rejoin {
                version: 1,
                game_id: GameId::from("g"),
                peer_id: peer.clone(),
                token,
            },
        );

        let (rejoined, rejoined_role, _) = joined_peer(again.next());
        assert_eq!(rejoined, peer);
        assert_eq!(rejoined_role, role);
    }

    #[tokio::test]
    async fn test_rejoin_bad_token_rejected() {
        let mut dir = directory();
        let mut a = attach(&mut dir);
        join(&mut dir, &a, "g", "");
        let (peer, _, _) = joined_peer(a.next());
        dir.detach(a.conn);

        let mut again = attach(&mut dir);
        dir.handle(
            again.conn,
            ClientSignal::Rejoin {
                version: 1,
                game_id: GameId::from("g"),
                peer_id: peer,
                token: "forged".into(),
            },
        );

        assert!(matches!(again.next(), ServerSignal::RejoinRejected { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_stale_removes_after_grace_and_announces() {
        let mut dir = directory();
        let mut a = attach(&mut dir);
        let mut b = attach(&mut dir);
        join(&mut dir, &a, "g", "");
        let _ = a.next();
        join(&mut dir, &b, "g", "");
        let _ = a.next();
        let (guest, _, _) = joined_peer(b.next());
        dir.detach(b.conn);

        assert!(dir.expire_stale().is_empty());
        assert!(a.is_quiet());

        tokio::time::advance(Duration::from_secs(31)).await;

        assert_eq!(dir.expire_stale(), vec![guest.clone()]);
        assert_eq!(a.next(), ServerSignal::ParticipantLeft { peer_id: guest });
    }

    #[tokio::test]
    async fn test_expire_game_notifies_connected_members() {
        let mut dir = directory();
        let mut a = attach(&mut dir);
        join(&mut dir, &a, "g", "");
        let _ = a.next();

        dir.expire_game(&GameId::from("g"));

        assert_eq!(
            a.next(),
            ServerSignal::GameExpired {
                game_id: GameId::from("g")
            }
        );
        assert!(dir.members(&GameId::from("g")).is_empty());
    }
}
