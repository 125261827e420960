use std::time::Duration;

use crate::error::Result;
use crate::validation;

/// Server-wide settings. Room-level values here are the defaults applied
/// when a create-room request does not override them.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub default_max_participants: usize,
    pub default_room_timeout: Duration,
    pub max_message_len: usize,
    /// 5-minute client-side validity window for reconnection tokens.
    pub token_ttl: Duration,
    pub sweep_interval: Duration,
    /// Upper bound on stale-room candidates examined per sweep pass.
    pub sweep_batch_size: usize,
    /// Timeout applied to every repository call; expiry fails closed.
    pub repository_timeout: Duration,
    /// When true the last leave removes the room synchronously; when false
    /// the room is flagged inactive and reclaimed by the sweeper, keeping a
    /// grace window for reconnection by token.
    pub immediate_empty_room_eviction: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            port: 2052,
            default_max_participants: 16,
            default_room_timeout: Duration::from_millis(1_800_000),
            max_message_len: 2000,
            token_ttl: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(60),
            sweep_batch_size: 50,
            repository_timeout: Duration::from_secs(2),
            immediate_empty_room_eviction: false,
        }
    }
}

impl ServerConfig {
    /// Build a config from environment variables, falling back to defaults
    /// for anything unset or unparseable.
    pub fn from_env() -> Self {
        let mut config = ServerConfig::default();
        if let Some(port) = env_parse("ROOMCAST_PORT") {
            config.port = port;
        }
        if let Some(max) = env_parse("ROOMCAST_MAX_PARTICIPANTS") {
            config.default_max_participants = max;
        }
        if let Some(ms) = env_parse::<u64>("ROOMCAST_ROOM_TIMEOUT_MS") {
            config.default_room_timeout = Duration::from_millis(ms);
        }
        if let Some(len) = env_parse("ROOMCAST_MAX_MESSAGE_LEN") {
            config.max_message_len = len;
        }
        if let Some(secs) = env_parse::<u64>("ROOMCAST_SWEEP_INTERVAL_SECS") {
            config.sweep_interval = Duration::from_secs(secs);
        }
        if let Some(flag) = env_parse("ROOMCAST_IMMEDIATE_EMPTY_ROOM_EVICTION") {
            config.immediate_empty_room_eviction = flag;
        }
        config
    }

    /// Reject configs outside the documented bounds before any state exists.
    pub fn validate(&self) -> Result<()> {
        validation::validate_max_participants(self.default_max_participants)?;
        validation::validate_timeout_ms(self.default_room_timeout.as_millis() as u64)?;
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(ServerConfig::default().validate().is_ok());
    }

    #[test]
    fn out_of_bounds_timeout_rejected() {
        let config = ServerConfig {
            default_room_timeout: Duration::from_millis(1_000),
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
