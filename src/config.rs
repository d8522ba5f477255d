// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Configuration file types and parsing for the trident adapter.
//!
//! JSON5 configuration format supporting comments and trailing commas.
//! Every field has a deployable default; a file only needs the values it
//! wants to change.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::adapter::LISTEN_PORT;
use crate::logging::Severity;

/// Startup configuration (JSON5 file format)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// UDP port to receive trident traffic on. 0 lets the OS pick, which
    /// only makes sense for tests.
    pub listen_port: u16,

    /// Socket receive buffer (SO_RCVBUF) in bytes.
    pub listen_buffer_size: usize,

    /// Reordering window size per (sender, dispatcher); rounded up to the
    /// next power of two, capped at 2^30.
    pub cache_size: u32,

    /// Number of downstream queues; must be a power of two in 1..=256.
    pub queue_count: usize,

    /// Depth of each slave hand-off queue.
    pub queue_depth: usize,

    /// Seconds between counter reports.
    pub reporting_interval: u64,

    /// Minimum severity that reaches the log sink.
    pub log_level: Severity,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: LISTEN_PORT,
            listen_buffer_size: 32 << 20,
            cache_size: 64,
            queue_count: 4,
            queue_depth: 4096,
            reporting_interval: 10,
            log_level: Severity::Info,
        }
    }
}

impl Config {
    /// Load configuration from a JSON5 file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e.to_string()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a JSON5 string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            json5::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_count == 0 || !self.queue_count.is_power_of_two() || self.queue_count > 256
        {
            return Err(ConfigError::InvalidQueueCount(self.queue_count));
        }
        if self.queue_depth == 0 {
            return Err(ConfigError::InvalidQueueDepth(self.queue_depth));
        }
        if self.cache_size == 0 {
            return Err(ConfigError::InvalidCacheSize(self.cache_size));
        }
        if self.listen_buffer_size < 64 << 10 {
            return Err(ConfigError::ListenBufferTooSmall(self.listen_buffer_size));
        }
        if self.reporting_interval == 0 {
            return Err(ConfigError::InvalidReportingInterval);
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("failed to read config file '{0}': {1}")]
    Io(std::path::PathBuf, String),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("queue_count {0} must be a power of two in 1..=256")]
    InvalidQueueCount(usize),

    #[error("queue_depth {0} must be nonzero")]
    InvalidQueueDepth(usize),

    #[error("cache_size {0} must be nonzero")]
    InvalidCacheSize(u32),

    #[error("listen_buffer_size {0} is below the 64 KiB minimum")]
    ListenBufferTooSmall(usize),

    #[error("reporting_interval must be nonzero")]
    InvalidReportingInterval,
}
