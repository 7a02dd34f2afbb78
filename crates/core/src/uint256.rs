//! Implementation of UInt256, a 256-bit identifier.

use crate::CoreError;
use dbft_io::{BinaryWriter, IoResult, MemoryReader, Serializable};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// The length of UInt256 values in bytes.
pub const UINT256_SIZE: usize = 32;

/// A 256-bit identifier, stored little-endian as on the wire.
///
/// Used for block hashes, transaction hashes and payload hashes. Displayed
/// big-endian with a `0x` prefix, matching the Neo convention.
#[derive(Clone, Copy, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct UInt256([u8; UINT256_SIZE]);

impl UInt256 {
    /// Returns the zero value.
    pub fn zero() -> Self {
        Self::default()
    }

    /// Checks whether this value is zero.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// Creates a value from a byte slice of exactly 32 bytes.
    pub fn from_bytes(value: &[u8]) -> Result<Self, CoreError> {
        let bytes: [u8; UINT256_SIZE] =
            value.try_into().map_err(|_| CoreError::InvalidLength {
                expected: UINT256_SIZE,
                actual: value.len(),
            })?;
        Ok(Self(bytes))
    }

    /// Returns the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; UINT256_SIZE] {
        &self.0
    }

    /// Returns a copy of the underlying bytes.
    pub fn to_array(&self) -> [u8; UINT256_SIZE] {
        self.0
    }

    /// Parses a big-endian hex string, with or without a `0x` prefix.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let trimmed = s.strip_prefix("0x").unwrap_or(s);
        let decoded = hex::decode(trimmed)
            .map_err(|e| CoreError::InvalidFormat(format!("invalid hex: {e}")))?;
        let mut bytes: [u8; UINT256_SIZE] =
            decoded.as_slice().try_into().map_err(|_| CoreError::InvalidLength {
                expected: UINT256_SIZE,
                actual: decoded.len(),
            })?;
        bytes.reverse();
        Ok(Self(bytes))
    }
}

impl From<[u8; UINT256_SIZE]> for UInt256 {
    fn from(bytes: [u8; UINT256_SIZE]) -> Self {
        Self(bytes)
    }
}

impl Ord for UInt256 {
    fn cmp(&self, other: &Self) -> Ordering {
        // Numeric comparison: most significant byte is last in storage.
        self.0.iter().rev().cmp(other.0.iter().rev())
    }
}

impl PartialOrd for UInt256 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Serializable for UInt256 {
    fn size(&self) -> usize {
        UINT256_SIZE
    }

    fn serialize(&self, writer: &mut BinaryWriter) -> IoResult<()> {
        writer.write_bytes(&self.0)
    }

    fn deserialize(reader: &mut MemoryReader) -> IoResult<Self> {
        let bytes = reader.read_bytes(UINT256_SIZE)?;
        let mut out = [0u8; UINT256_SIZE];
        out.copy_from_slice(bytes);
        Ok(Self(out))
    }
}

impl fmt::Display for UInt256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut reversed = self.0;
        reversed.reverse();
        write!(f, "0x{}", hex::encode(reversed))
    }
}

impl fmt::Debug for UInt256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UInt256({self})")
    }
}

impl FromStr for UInt256 {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
