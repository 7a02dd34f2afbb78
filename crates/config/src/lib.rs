//! Protocol constants and settings.
//!
//! Every limit and timing value the consensus core recognizes lives here,
//! along with the network identities used for signing-domain separation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Blockchain timing constants
pub const SECONDS_PER_BLOCK: u64 = 15;
pub const MILLISECONDS_PER_BLOCK: u64 = SECONDS_PER_BLOCK * 1000;

/// Upper bound on the exponential view-timeout backoff.
pub const MAX_VIEW_TIMEOUT_MS: u64 = 60_000;

/// Network limits constants
pub const MAX_BLOCK_SIZE: usize = 1_048_576; // 1MB
pub const MAX_TRANSACTION_SIZE: usize = 102_400; // 100KB
pub const MAX_TRANSACTIONS_PER_BLOCK: usize = 512;

/// Size of a hash (UInt256) in bytes
pub const HASH_SIZE: usize = 32;
/// Size of a script hash (UInt160) in bytes
pub const ADDRESS_SIZE: usize = 20;

/// Errors raised while validating configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A settings field holds an unusable value.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Network type for the Neo blockchain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum NetworkType {
    MainNet,
    #[default]
    TestNet,
    Private,
}

impl NetworkType {
    /// Gets the network magic number mixed into every signing domain.
    pub fn magic(&self) -> u32 {
        match self {
            NetworkType::MainNet => 0x334f454e, // "NEO3" in little endian
            NetworkType::TestNet => 0x3254334e, // "N3T2" in little endian
            NetworkType::Private => 0x00000000,
        }
    }
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkType::MainNet => write!(f, "mainnet"),
            NetworkType::TestNet => write!(f, "testnet"),
            NetworkType::Private => write!(f, "private"),
        }
    }
}

impl FromStr for NetworkType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mainnet" | "main" => Ok(NetworkType::MainNet),
            "testnet" | "test" => Ok(NetworkType::TestNet),
            "private" | "privnet" => Ok(NetworkType::Private),
            _ => Err(ConfigError::Invalid(format!("unknown network type: {s}"))),
        }
    }
}

/// Settings recognized by the consensus core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolSettings {
    /// Network magic, mixed into the signing domain of every payload.
    pub network_magic: u32,
    /// Base round timeout and the floor spacing of primary timestamps.
    pub block_time_ms: u64,
    /// Upper bound on the exponential view-timeout backoff.
    pub max_view_timeout_ms: u64,
    /// Maximum number of transactions a PrepareRequest may name.
    pub max_transactions_per_block: usize,
    /// Maximum serialized block size in bytes.
    pub max_block_size: usize,
    /// Hex-encoded validator private key. Absent means the node runs as an
    /// observer and never signs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validator_private_key: Option<String>,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            network_magic: NetworkType::TestNet.magic(),
            block_time_ms: MILLISECONDS_PER_BLOCK,
            max_view_timeout_ms: MAX_VIEW_TIMEOUT_MS,
            max_transactions_per_block: MAX_TRANSACTIONS_PER_BLOCK,
            max_block_size: MAX_BLOCK_SIZE,
            validator_private_key: None,
        }
    }
}

impl ProtocolSettings {
    /// Creates settings for a given named network.
    pub fn for_network(network: NetworkType) -> Self {
        Self {
            network_magic: network.magic(),
            ..Default::default()
        }
    }

    /// Validates the settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.block_time_ms == 0 {
            return Err(ConfigError::Invalid(
                "block_time_ms must be greater than 0".to_string(),
            ));
        }

        if self.max_view_timeout_ms < self.block_time_ms {
            return Err(ConfigError::Invalid(
                "max_view_timeout_ms must be at least block_time_ms".to_string(),
            ));
        }

        if self.max_transactions_per_block == 0 {
            return Err(ConfigError::Invalid(
                "max_transactions_per_block must be greater than 0".to_string(),
            ));
        }

        if self.max_block_size == 0 {
            return Err(ConfigError::Invalid(
                "max_block_size must be greater than 0".to_string(),
            ));
        }

        if let Some(key) = &self.validator_private_key {
            if key.len() != 64 || key.chars().any(|c| !c.is_ascii_hexdigit()) {
                return Err(ConfigError::Invalid(
                    "validator_private_key must be 32 bytes of hex".to_string(),
                ));
            }
        }

        Ok(())
    }
}
