//! Session identifiers and the server-info exchange shared by both tunnel ends.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Maximum length of a session id. It is used as a directory name and SSH user.
pub const MAX_SESSION_ID_LENGTH: usize = 64;

/// Length of generated session ids.
pub const GENERATED_SESSION_ID_LENGTH: usize = 20;

/// Exec command a host runs on the tunnel endpoint to learn its node address.
pub const SERVER_INFO_COMMAND: &str = "server-info";

const SESSION_ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuv";

/// Session id validation result
#[derive(Debug, Clone, PartialEq)]
pub enum SessionIdValidation {
    Valid,
    TooLong,
    Empty,
    InvalidCharacters,
    StartsWithHyphen,
    EndsWithHyphen,
}

/// Validate a session id.
///
/// Rules:
/// - Length: 1-64 characters
/// - Characters: lowercase letters, digits, hyphens only
/// - Cannot start or end with a hyphen
pub fn validate_session_id(session_id: &str) -> SessionIdValidation {
    if session_id.is_empty() {
        return SessionIdValidation::Empty;
    }

    if session_id.len() > MAX_SESSION_ID_LENGTH {
        return SessionIdValidation::TooLong;
    }

    if session_id.starts_with('-') {
        return SessionIdValidation::StartsWithHyphen;
    }

    if session_id.ends_with('-') {
        return SessionIdValidation::EndsWithHyphen;
    }

    if !session_id
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return SessionIdValidation::InvalidCharacters;
    }

    SessionIdValidation::Valid
}

pub fn is_valid_session_id(session_id: &str) -> bool {
    validate_session_id(session_id) == SessionIdValidation::Valid
}

/// Generate a random session id: 20 base32hex characters (100 bits).
pub fn generate_session_id() -> String {
    let mut rng = rand::rngs::OsRng;
    (0..GENERATED_SESSION_ID_LENGTH)
        .map(|_| SESSION_ID_ALPHABET[rng.gen_range(0..SESSION_ID_ALPHABET.len())] as char)
        .collect()
}

/// Reply to [`SERVER_INFO_COMMAND`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Address clients should dial to reach the session.
    pub node_addr: String,
}
