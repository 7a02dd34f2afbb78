//! Core data types shared across the Neo dBFT node.
//!
//! Fixed-width identifiers ([`UInt160`], [`UInt256`]), transactions, block
//! headers and witnesses, with their canonical wire encodings.

pub mod block;
pub mod transaction;
pub mod uint160;
pub mod uint256;
pub mod witness;

pub use block::{Block, BlockHeader};
pub use transaction::Transaction;
pub use uint160::UInt160;
pub use uint256::UInt256;
pub use witness::Witness;

use thiserror::Error;

/// Errors produced by core type construction and parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A byte slice had the wrong length for the target type.
    #[error("invalid length: expected {expected} bytes, got {actual}")]
    InvalidLength {
        /// Expected byte count.
        expected: usize,
        /// Actual byte count.
        actual: usize,
    },

    /// A textual encoding could not be parsed.
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    /// An underlying serialization error.
    #[error("io error: {0}")]
    Io(#[from] dbft_io::IoError),
}
