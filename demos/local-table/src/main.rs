use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tablelink::prelude::*;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const GAME: &str = "demo-table";
const PASSWORD: &str = "dragons";

// ---------------------------------------------------------------------------
// Board state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TokenMove {
    token: String,
    col: u8,
    row: u8,
}

/// Token positions; concurrent moves of one token resolve last-writer-wins.
#[derive(Default)]
struct Board {
    tokens: HashMap<String, LwwRegister<(u8, u8)>>,
}

impl Board {
    fn apply(&mut self, stamp: Stamp, mv: &TokenMove) -> bool {
        self.tokens
            .entry(mv.token.clone())
            .or_default()
            .apply(stamp, (mv.col, mv.row))
    }

    fn position(&self, token: &str) -> Option<(u8, u8)> {
        self.tokens.get(token).and_then(|r| r.get().copied())
    }
}

// ---------------------------------------------------------------------------
// A player at the table
// ---------------------------------------------------------------------------

type LocalSession = Session<MemoryRendezvous, MemoryNetwork>;

struct Player {
    name: &'static str,
    session: LocalSession,
    board: Arc<Mutex<Board>>,
}

impl Player {
    fn new(name: &'static str, rendezvous: &MemoryRendezvous, network: &MemoryNetwork) -> Self {
        let session = SessionBuilder::new().build(rendezvous.clone(), network.clone());
        let board = Arc::new(Mutex::new(Board::default()));

        let sink = Arc::clone(&board);
        session.register_consumer("token", move |msg: &AppMessage| {
            match serde_json::from_slice::<TokenMove>(&msg.payload) {
                Ok(mv) => {
                    if let Ok(mut board) = sink.lock() {
                        board.apply(Stamp::of(msg), &mv);
                    }
                }
                Err(e) => warn!(player = name, error = %e, "bad token move"),
            }
        });
        session.on(NotificationKind::Status, move |n| info!(player = name, ?n, "status"));
        session.on(NotificationKind::PeerError, move |n| warn!(player = name, ?n, "peer error"));

        Self {
            name,
            session,
            board,
        }
    }

    fn move_token(&self, token: &str, col: u8, row: u8) -> Result<(), Box<dyn std::error::Error>> {
        let mv = TokenMove {
            token: token.into(),
            col,
            row,
        };
        let me = self.session.local_peer().ok_or("not in a game")?;
        if let Ok(mut board) = self.board.lock() {
            board.apply(Stamp::new(unix_millis(), me), &mv);
        }
        self.session.broadcast("token", serde_json::to_vec(&mv)?)?;
        Ok(())
    }

    fn position(&self, token: &str) -> Option<(u8, u8)> {
        self.board.lock().ok().and_then(|b| b.position(token))
    }

    async fn wait_for(&self, status: SessionStatus) -> Result<(), Box<dyn std::error::Error>> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while self.session.status() != status {
            if tokio::time::Instant::now() > deadline {
                return Err(format!("{} stuck in {}", self.name, self.session.status()).into());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(())
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Demo
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("local_table=info,tablelink=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    let rendezvous = MemoryRendezvous::default();
    let network = MemoryNetwork::new();
    rendezvous.open_game(GAME, PASSWORD);

    let gm = Player::new("gm", &rendezvous, &network);
    gm.session.join_game(GAME, PASSWORD)?;
    gm.session.connect();
    gm.wait_for(SessionStatus::Joined).await?;

    let player = Player::new("player", &rendezvous, &network);
    player.session.join_game(GAME, "goblins")?;
    player.session.connect();
    player.wait_for(SessionStatus::Auth).await?;
    info!("wrong password, trying again");
    player.session.join_game(GAME, PASSWORD)?;
    player.wait_for(SessionStatus::Joined).await?;

    gm.move_token("dragon", 4, 2)?;
    player.move_token("rogue", 1, 1)?;
    player.move_token("dragon", 5, 2)?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    for p in [&gm, &player] {
        println!(
            "{:>6} sees dragon at {:?}, rogue at {:?}",
            p.name,
            p.position("dragon"),
            p.position("rogue")
        );
    }

    player.session.disconnect().await;
    gm.session.disconnect().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stamp(ts: u64, who: &str) -> Stamp {
        Stamp::new(ts, PeerId::from(who))
    }

    #[test]
    fn test_board_later_move_wins() {
        let mut board = Board::default();
        let early = TokenMove { token: "dragon".into(), col: 1, row: 1 };
        let late = TokenMove { token: "dragon".into(), col: 7, row: 7 };

        assert!(board.apply(stamp(105, "b"), &late));
        assert!(!board.apply(stamp(100, "a"), &early));

        assert_eq!(board.position("dragon"), Some((7, 7)));
        assert_eq!(board.position("rogue"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_moves_reach_the_other_player() {
        let rendezvous = MemoryRendezvous::default();
        let network = MemoryNetwork::new();
        let gm = Player::new("gm", &rendezvous, &network);
        let player = Player::new("player", &rendezvous, &network);
        for p in [&gm, &player] {
            p.session.join_game("t", "").unwrap();
            p.session.connect();
            p.wait_for(SessionStatus::Joined).await.unwrap();
        }

        gm.move_token("dragon", 3, 4).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(player.position("dragon"), Some((3, 4)));
        assert_eq!(gm.position("dragon"), Some((3, 4)));
    }
}
