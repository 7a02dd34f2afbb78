//! Error types for serialization and deserialization.

use thiserror::Error;

/// Result type for I/O operations.
pub type IoResult<T> = std::result::Result<T, IoError>;

/// Errors produced while encoding or decoding binary data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IoError {
    /// The reader ran out of bytes.
    #[error("end of stream: requested {requested} bytes, {available} available")]
    EndOfStream {
        /// Number of bytes the caller asked for.
        requested: usize,
        /// Number of bytes left in the stream.
        available: usize,
    },

    /// The data does not match the expected format.
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    /// A length prefix or numeric field exceeded its permitted maximum.
    #[error("value out of range: {0}")]
    ValueOutOfRange(String),
}

impl IoError {
    /// Shorthand for an [`IoError::InvalidFormat`] with a formatted message.
    pub fn invalid_format(msg: impl Into<String>) -> Self {
        IoError::InvalidFormat(msg.into())
    }
}
