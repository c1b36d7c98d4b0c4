//! Runtime configuration
//!
//! Defaults match the protocol's timing constants. Each value can be
//! overridden through a `CHAT_HUB_*` environment variable.

use std::time::Duration;

use crate::error::ConfigError;

/// Default server address
pub const DEFAULT_ADDR: &str = "127.0.0.1:8080";

/// Outbound mailbox capacity per session
pub const MAILBOX_CAPACITY: usize = 256;

/// Hub event queue capacity
pub const HUB_QUEUE_CAPACITY: usize = 256;

/// Expiry of recipient cache entries
pub const CACHE_TTL: Duration = Duration::from_secs(15 * 60);

/// Per-session timing and size limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Read deadline, reset on every received frame (including pongs)
    pub pong_wait: Duration,
    /// Heartbeat period, always 9/10 of `pong_wait`
    pub ping_period: Duration,
    /// Deadline for a single outbound flush
    pub write_wait: Duration,
    /// Maximum inbound message size in bytes
    pub max_message_size: usize,
    /// Outbound mailbox capacity
    pub mailbox_capacity: usize,
}

impl SessionConfig {
    /// Build a session config for the given read deadline
    pub fn with_pong_wait(pong_wait: Duration) -> Self {
        Self {
            pong_wait,
            ping_period: pong_wait * 9 / 10,
            ..Self::default()
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        let pong_wait = Duration::from_secs(60);
        Self {
            pong_wait,
            ping_period: pong_wait * 9 / 10,
            write_wait: Duration::from_secs(10),
            max_message_size: 1024,
            mailbox_capacity: MAILBOX_CAPACITY,
        }
    }
}

/// Top-level server configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Listen address
    pub addr: String,
    /// Session timing
    pub session: SessionConfig,
    /// Hub event queue capacity
    pub hub_queue_capacity: usize,
    /// Recipient cache expiry
    pub cache_ttl: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            session: SessionConfig::default(),
            hub_queue_capacity: HUB_QUEUE_CAPACITY,
            cache_ttl: CACHE_TTL,
        }
    }
}

impl Config {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup("CHAT_HUB_ADDR") {
            config.addr = addr;
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "CHAT_HUB_PONG_WAIT_SECS")? {
            let write_wait = config.session.write_wait;
            let max_message_size = config.session.max_message_size;
            config.session = SessionConfig {
                write_wait,
                max_message_size,
                ..SessionConfig::with_pong_wait(Duration::from_secs(secs))
            };
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "CHAT_HUB_WRITE_WAIT_SECS")? {
            config.session.write_wait = Duration::from_secs(secs);
        }
        if let Some(size) = parse_var::<usize, _>(&lookup, "CHAT_HUB_MAX_MESSAGE_SIZE")? {
            config.session.max_message_size = size;
        }

        Ok(config)
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value,
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.addr, DEFAULT_ADDR);
        assert_eq!(config.session.pong_wait, Duration::from_secs(60));
        assert_eq!(config.session.ping_period, Duration::from_secs(54));
        assert_eq!(config.session.write_wait, Duration::from_secs(10));
        assert_eq!(config.session.max_message_size, 1024);
        assert_eq!(config.session.mailbox_capacity, 256);
        assert_eq!(config.cache_ttl, Duration::from_secs(900));
    }

    #[test]
    fn test_pong_wait_override_rescales_ping_period() {
        let config = Config::from_lookup(lookup_from(&[
            ("CHAT_HUB_PONG_WAIT_SECS", "10"),
            ("CHAT_HUB_WRITE_WAIT_SECS", "3"),
        ]))
        .unwrap();
        assert_eq!(config.session.pong_wait, Duration::from_secs(10));
        assert_eq!(config.session.ping_period, Duration::from_secs(9));
        assert_eq!(config.session.write_wait, Duration::from_secs(3));
    }

    #[test]
    fn test_invalid_override_is_rejected() {
        let err = Config::from_lookup(lookup_from(&[("CHAT_HUB_MAX_MESSAGE_SIZE", "big")]))
            .unwrap_err();
        assert!(err.to_string().contains("CHAT_HUB_MAX_MESSAGE_SIZE"));
    }
}
