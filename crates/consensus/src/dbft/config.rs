//! dBFT engine configuration.

use crate::{Error, Result};
use dbft_config::{
    ProtocolSettings, MAX_BLOCK_SIZE, MAX_TRANSACTIONS_PER_BLOCK, MAX_VIEW_TIMEOUT_MS,
    MILLISECONDS_PER_BLOCK,
};
use serde::{Deserialize, Serialize};

/// dBFT configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbftConfig {
    /// Network magic mixed into every signing domain.
    pub network_magic: u32,
    /// Base round timeout; also the primary timestamp floor spacing.
    pub block_time_ms: u64,
    /// Cap on the exponential view-timeout backoff.
    pub max_view_timeout_ms: u64,
    /// Maximum transactions a proposal may name.
    pub max_transactions_per_block: usize,
    /// Maximum serialized block size in bytes.
    pub max_block_size: usize,
    /// Idle time after which a node solicits recovery from its peers.
    pub recovery_idle_ms: u64,
}

impl Default for DbftConfig {
    fn default() -> Self {
        Self {
            network_magic: 0,
            block_time_ms: MILLISECONDS_PER_BLOCK,
            max_view_timeout_ms: MAX_VIEW_TIMEOUT_MS,
            max_transactions_per_block: MAX_TRANSACTIONS_PER_BLOCK,
            max_block_size: MAX_BLOCK_SIZE,
            recovery_idle_ms: MILLISECONDS_PER_BLOCK + MILLISECONDS_PER_BLOCK / 2,
        }
    }
}

impl DbftConfig {
    /// Builds an engine configuration from protocol settings.
    pub fn from_settings(settings: &ProtocolSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            network_magic: settings.network_magic,
            block_time_ms: settings.block_time_ms,
            max_view_timeout_ms: settings.max_view_timeout_ms,
            max_transactions_per_block: settings.max_transactions_per_block,
            max_block_size: settings.max_block_size,
            recovery_idle_ms: settings.block_time_ms + settings.block_time_ms / 2,
        })
    }

    /// Configuration with short timings for tests.
    pub fn for_testing() -> Self {
        Self {
            network_magic: 0x746E6574, // private test network
            block_time_ms: 200,
            max_view_timeout_ms: 2_000,
            max_transactions_per_block: 64,
            max_block_size: 65_536,
            recovery_idle_ms: 300,
        }
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.block_time_ms == 0 {
            return Err(Error::InvalidConfig(
                "block_time_ms must be greater than 0".to_string(),
            ));
        }

        if self.max_view_timeout_ms < self.block_time_ms {
            return Err(Error::InvalidConfig(
                "max_view_timeout_ms must be at least block_time_ms".to_string(),
            ));
        }

        if self.max_transactions_per_block == 0 {
            return Err(Error::InvalidConfig(
                "max_transactions_per_block must be greater than 0".to_string(),
            ));
        }

        if self.max_block_size == 0 {
            return Err(Error::InvalidConfig(
                "max_block_size must be greater than 0".to_string(),
            ));
        }

        if self.recovery_idle_ms == 0 {
            return Err(Error::InvalidConfig(
                "recovery_idle_ms must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
