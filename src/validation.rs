use rand::{rngs::OsRng, Rng, RngCore};

use crate::error::{CoordinatorError, Result};

pub const ROOM_ID_MIN_LEN: usize = 3;
pub const ROOM_ID_MAX_LEN: usize = 50;
pub const USERNAME_MAX_LEN: usize = 30;
pub const MAX_PARTICIPANTS_LIMIT: usize = 100;
pub const ROOM_TIMEOUT_MIN_MS: u64 = 60_000;
pub const ROOM_TIMEOUT_MAX_MS: u64 = 86_400_000;
pub const TOKEN_LEN: usize = 64;

/// Room ids match `^[A-Za-z0-9_-]{3,50}$`.
pub fn is_valid_room_id(id: &str) -> bool {
    (ROOM_ID_MIN_LEN..=ROOM_ID_MAX_LEN).contains(&id.len())
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

pub fn validate_room_id(id: &str) -> Result<()> {
    if is_valid_room_id(id) {
        Ok(())
    } else {
        Err(CoordinatorError::InvalidRoomId)
    }
}

/// Returns the trimmed username, rejecting empty or over-long names.
pub fn validate_username(name: &str) -> Result<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed.chars().count() > USERNAME_MAX_LEN {
        return Err(CoordinatorError::InvalidUsername);
    }
    Ok(trimmed.to_string())
}

/// Reconnection tokens are 64 lowercase hex chars (32 random bytes).
pub fn is_valid_token_format(token: &str) -> bool {
    token.len() == TOKEN_LEN
        && token
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

pub fn validate_max_participants(max: usize) -> Result<()> {
    if (1..=MAX_PARTICIPANTS_LIMIT).contains(&max) {
        Ok(())
    } else {
        Err(CoordinatorError::InvalidConfig(format!(
            "max_participants must be 1-{MAX_PARTICIPANTS_LIMIT}, got {max}"
        )))
    }
}

pub fn validate_timeout_ms(timeout_ms: u64) -> Result<()> {
    if (ROOM_TIMEOUT_MIN_MS..=ROOM_TIMEOUT_MAX_MS).contains(&timeout_ms) {
        Ok(())
    } else {
        Err(CoordinatorError::InvalidConfig(format!(
            "timeout_ms must be {ROOM_TIMEOUT_MIN_MS}-{ROOM_TIMEOUT_MAX_MS}, got {timeout_ms}"
        )))
    }
}

/// Generate a random room id of the form `room-<12 alphanumerics>`.
pub fn generate_room_id() -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = OsRng;
    let suffix: String = (0..12)
        .map(|_| {
            let idx = rng.gen_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect();
    format!("room-{suffix}")
}

/// Generate a reconnection token: 32 random bytes, lowercase hex.
pub fn generate_reconnection_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_id_charset_and_length() {
        assert!(is_valid_room_id("team-standup"));
        assert!(is_valid_room_id("abc"));
        assert!(is_valid_room_id("A_1-b"));
        assert!(!is_valid_room_id("ab"));
        assert!(!is_valid_room_id(&"x".repeat(51)));
        assert!(!is_valid_room_id("has space"));
        assert!(!is_valid_room_id("emoji🎉"));
    }

    #[test]
    fn username_is_trimmed() {
        assert_eq!(validate_username("  Alice  ").unwrap(), "Alice");
        assert!(validate_username("   ").is_err());
        assert!(validate_username(&"n".repeat(31)).is_err());
        assert_eq!(validate_username(&"n".repeat(30)).unwrap().len(), 30);
    }

    #[test]
    fn generated_room_id_is_valid() {
        for _ in 0..50 {
            let id = generate_room_id();
            assert!(is_valid_room_id(&id), "invalid generated id: {id}");
        }
    }

    #[test]
    fn generated_token_is_64_lowercase_hex() {
        let token = generate_reconnection_token();
        assert!(is_valid_token_format(&token), "bad token: {token}");
        assert!(!is_valid_token_format("deadbeef"));
        assert!(!is_valid_token_format(&"G".repeat(64)));
    }

    #[test]
    fn config_bounds() {
        assert!(validate_max_participants(1).is_ok());
        assert!(validate_max_participants(100).is_ok());
        assert!(validate_max_participants(0).is_err());
        assert!(validate_max_participants(101).is_err());
        assert!(validate_timeout_ms(60_000).is_ok());
        assert!(validate_timeout_ms(86_400_000).is_ok());
        assert!(validate_timeout_ms(59_999).is_err());
        assert!(validate_timeout_ms(86_400_001).is_err());
    }
}
