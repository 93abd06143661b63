use std::fmt;

use tablelink_protocol::{GameId, PeerId, Role};

/// What a participant supplies to join a game.
///
/// The password lives only until the rendezvous has answered; after that
/// the session rejoins with a token instead.
#[derive(Clone, PartialEq, Eq)]
pub struct GameIdentity {
    game_id: GameId,
    password: Option<String>,
}

impl GameIdentity {
    pub fn new(game_id: impl Into<GameId>, password: impl Into<String>) -> Self {
        Self {
            game_id: game_id.into(),
            password: Some(password.into()),
        }
    }

    pub fn game_id(&self) -> &GameId {
        &self.game_id
    }

    /// The password to send, or an empty one once it was used.
    pub(crate) fn password(&self) -> &str {
        self.password.as_deref().unwrap_or_default()
    }

    pub(crate) fn forget_password(&mut self) {
        self.password = None;
    }
}

impl fmt::Debug for GameIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GameIdentity")
            .field("game_id", &self.game_id)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Admission granted by the rendezvous.
#[derive(Clone)]
pub(crate) struct Membership {
    pub(crate) game_id: GameId,
    pub(crate) peer_id: PeerId,
    pub(crate) role: Role,
    pub(crate) token: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forget_password_sends_empty() {
        let mut identity = GameIdentity::new("g", "secret");
        assert_eq!(identity.password(), "secret");

        identity.forget_password();

        assert_eq!(identity.password(), "");
    }

    #[test]
    fn test_debug_redacts_password() {
        let identity = GameIdentity::new("g", "hunter2");
        assert!(!format!("{identity:?}").contains("hunter2"));
    }
}
