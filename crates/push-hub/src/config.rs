//! Hub configuration.

use std::env;
use std::time::Duration;

use thiserror::Error;

use crate::pending::DEFAULT_PENDING_CAPACITY;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubConfig {
    /// Buffered payloads kept per disconnected entity.
    pub pending_capacity: usize,

    /// Largest inbound WebSocket frame accepted before the socket is dropped.
    pub max_message_size: usize,

    /// Drop a socket that has been silent this long.
    pub idle_timeout: Duration,

    /// Discard the buffer of an entity that is not connected and has had
    /// nothing buffered for this long.
    pub pending_ttl: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            pending_capacity: DEFAULT_PENDING_CAPACITY,
            max_message_size: 64 * 1024,
            idle_timeout: Duration::from_secs(300),
            pending_ttl: Duration::from_secs(3600),
        }
    }
}

impl HubConfig {
    /// - `RIDE_HUB_PENDING_CAPACITY`
    /// - `RIDE_HUB_IDLE_TIMEOUT_SECS`
    /// - `RIDE_HUB_PENDING_TTL_SECS`
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(value) = env::var("RIDE_HUB_PENDING_CAPACITY") {
            config.pending_capacity = value.trim().parse().map_err(|_| ConfigError::Invalid {
                name: "RIDE_HUB_PENDING_CAPACITY",
                value,
            })?;
        }
        if let Ok(value) = env::var("RIDE_HUB_IDLE_TIMEOUT_SECS") {
            let secs: u64 = value.trim().parse().map_err(|_| ConfigError::Invalid {
                name: "RIDE_HUB_IDLE_TIMEOUT_SECS",
                value,
            })?;
            config.idle_timeout = Duration::from_secs(secs);
        }
        if let Ok(value) = env::var("RIDE_HUB_PENDING_TTL_SECS") {
            let secs: u64 = value.trim().parse().map_err(|_| ConfigError::Invalid {
                name: "RIDE_HUB_PENDING_TTL_SECS",
                value,
            })?;
            config.pending_ttl = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pending_capacity == 0 {
            return Err(ConfigError::Zero("pending_capacity"));
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::Zero("max_message_size"));
        }
        if self.pending_ttl.is_zero() {
            return Err(ConfigError::Zero("pending_ttl"));
        }
        Ok(())
    }
}
