//! Pipeline configuration

use rowsync_common::{Result, RowsyncError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ============================================================================
// Pipeline Configuration Constants
// ============================================================================

/// Default number of rows per bulk write, parser chunk and apply transaction.
pub const DEFAULT_CHUNK_SIZE: usize = 100;

/// Default wall-clock budget for one stage run, in seconds.
pub const DEFAULT_STAGE_TIMEOUT_SECS: u64 = 60;

/// Whether registering a new file immediately runs collect then parse.
pub const DEFAULT_AUTO_START: bool = true;

/// Tunables shared by the collect, parse and apply stages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub chunk_size: usize,
    pub stage_timeout_secs: u64,
    pub auto_start_on_file_create: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            stage_timeout_secs: DEFAULT_STAGE_TIMEOUT_SECS,
            auto_start_on_file_create: DEFAULT_AUTO_START,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from environment and defaults
    ///
    /// Reads `ROWSYNC_CHUNK_SIZE`, `ROWSYNC_STAGE_TIMEOUT` and
    /// `ROWSYNC_AUTO_START` after loading a `.env` file when one exists.
    /// Unparseable values fall back to the defaults.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            chunk_size: std::env::var("ROWSYNC_CHUNK_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_CHUNK_SIZE),
            stage_timeout_secs: std::env::var("ROWSYNC_STAGE_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_STAGE_TIMEOUT_SECS),
            auto_start_on_file_create: std::env::var("ROWSYNC_AUTO_START")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_AUTO_START),
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(RowsyncError::config("chunk_size must be greater than 0"));
        }

        if self.stage_timeout_secs == 0 {
            return Err(RowsyncError::config("stage_timeout_secs must be greater than 0"));
        }

        Ok(())
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_stage_timeout_secs(mut self, secs: u64) -> Self {
        self.stage_timeout_secs = secs;
        self
    }

    pub fn with_auto_start(mut self, enabled: bool) -> Self {
        self.auto_start_on_file_create = enabled;
        self
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }
}
