//! Link and synchronization settings.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::codec::MAX_FRAME_LEN;
use crate::errors::ConfigError;

/// Settings for one vehicle connection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    /// Our address on the link
    pub ground_id: u16,
    /// Address of the flight controller
    pub vehicle_id: u16,
    /// Wait for one acknowledgment before retrying
    pub ack_timeout_ms: u64,
    /// Retries of the same request before the transaction aborts
    pub max_retries: u32,
    /// Watchdog for a whole transaction (async driver only)
    pub transaction_timeout_ms: u64,
    pub receive_buffer_capacity: usize,
    /// Frames between two loss-statistics reports
    pub stats_window: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            ground_id: crate::DEFAULT_GROUND_ID,
            vehicle_id: crate::DEFAULT_VEHICLE_ID,
            ack_timeout_ms: crate::ACK_TIMEOUT_MS,
            max_retries: crate::MAX_RETRIES,
            transaction_timeout_ms: 120_000,
            receive_buffer_capacity: crate::RECEIVE_BUFFER_CAPACITY,
            stats_window: crate::STATS_WINDOW,
        }
    }
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ids(mut self, ground_id: u16, vehicle_id: u16) -> Self {
        self.ground_id = ground_id;
        self.vehicle_id = vehicle_id;
        self
    }

    pub fn with_ack_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.ack_timeout_ms = timeout_ms;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_transaction_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.transaction_timeout_ms = timeout_ms;
        self
    }

    pub fn with_receive_buffer_capacity(mut self, capacity: usize) -> Self {
        self.receive_buffer_capacity = capacity;
        self
    }

    pub fn with_stats_window(mut self, window: u32) -> Self {
        self.stats_window = window;
        self
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ack_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "ack_timeout_ms",
                reason: "must be non-zero".to_string(),
            });
        }
        if self.transaction_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "transaction_timeout_ms",
                reason: "must be non-zero".to_string(),
            });
        }
        if self.stats_window == 0 {
            return Err(ConfigError::Invalid {
                field: "stats_window",
                reason: "must be non-zero".to_string(),
            });
        }
        if self.receive_buffer_capacity < MAX_FRAME_LEN {
            return Err(ConfigError::Invalid {
                field: "receive_buffer_capacity",
                reason: format!("must hold at least one {MAX_FRAME_LEN}-byte frame"),
            });
        }
        Ok(())
    }
}
