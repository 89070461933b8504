use rand::Rng;
use serde::{Deserialize, Serialize};

/// Session codes are exactly 6 uppercase alphanumeric characters,
/// human-enterable on a phone keyboard.
pub const SESSION_CODE_LEN: usize = 6;

const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Lifecycle phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionPhase {
    Lobby,
    Countdown,
    Racing,
    GameOver,
}

impl SessionPhase {
    /// Whether moving from `self` to `to` is a legal phase transition.
    ///
    /// Countdown → Lobby and Racing → Lobby are abort paths taken when the
    /// roster empties mid-game.
    pub fn valid_transition(self, to: SessionPhase) -> bool {
        matches!(
            (self, to),
            (SessionPhase::Lobby, SessionPhase::Countdown)
                | (SessionPhase::Countdown, SessionPhase::Racing)
                | (SessionPhase::Countdown, SessionPhase::Lobby)
                | (SessionPhase::Racing, SessionPhase::GameOver)
                | (SessionPhase::Racing, SessionPhase::Lobby)
                | (SessionPhase::GameOver, SessionPhase::Lobby)
        )
    }
}

/// Generate a random session code. Uniqueness against live sessions is the
/// store's responsibility (it redraws on collision).
pub fn generate_session_code() -> String {
    let mut rng = rand::rng();
    (0..SESSION_CODE_LEN)
        .map(|_| CODE_ALPHABET[rng.random_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

/// Normalize a client-entered code. Some controller revisions uppercase the
/// code before sending and some do not, so the server owns the canonical
/// form: uppercase, surrounding whitespace removed.
pub fn normalize_session_code(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

/// Check a (normalized) code against the expected format.
pub fn is_valid_session_code(code: &str) -> bool {
    code.len() == SESSION_CODE_LEN
        && code
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
}
