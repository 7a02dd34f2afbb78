//! Implementation of UInt160, a 160-bit script hash.

use crate::CoreError;
use dbft_io::{BinaryWriter, IoResult, MemoryReader, Serializable};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// The length of UInt160 values in bytes.
pub const UINT160_SIZE: usize = 20;

/// A 160-bit script hash, stored little-endian as on the wire.
///
/// Used for payload senders and the `NextConsensus` field of block headers.
#[derive(Clone, Copy, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct UInt160([u8; UINT160_SIZE]);

impl UInt160 {
    /// Returns the zero value.
    pub fn zero() -> Self {
        Self::default()
    }

    /// Checks whether this value is zero.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// Creates a value from a byte slice of exactly 20 bytes.
    pub fn from_bytes(value: &[u8]) -> Result<Self, CoreError> {
        let bytes: [u8; UINT160_SIZE] =
            value.try_into().map_err(|_| CoreError::InvalidLength {
                expected: UINT160_SIZE,
                actual: value.len(),
            })?;
        Ok(Self(bytes))
    }

    /// Returns the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; UINT160_SIZE] {
        &self.0
    }

    /// Returns a copy of the underlying bytes.
    pub fn to_array(&self) -> [u8; UINT160_SIZE] {
        self.0
    }

    /// Parses a big-endian hex string, with or without a `0x` prefix.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let trimmed = s.strip_prefix("0x").unwrap_or(s);
        let decoded = hex::decode(trimmed)
            .map_err(|e| CoreError::InvalidFormat(format!("invalid hex: {e}")))?;
        let mut bytes: [u8; UINT160_SIZE] =
            decoded.as_slice().try_into().map_err(|_| CoreError::InvalidLength {
                expected: UINT160_SIZE,
                actual: decoded.len(),
            })?;
        bytes.reverse();
        Ok(Self(bytes))
    }
}

impl From<[u8; UINT160_SIZE]> for UInt160 {
    fn from(bytes: [u8; UINT160_SIZE]) -> Self {
        Self(bytes)
    }
}

impl Ord for UInt160 {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.iter().rev().cmp(other.0.iter().rev())
    }
}

impl PartialOrd for UInt160 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Serializable for UInt160 {
    fn size(&self) -> usize {
        UINT160_SIZE
    }

    fn serialize(&self, writer: &mut BinaryWriter) -> IoResult<()> {
        writer.write_bytes(&self.0)
    }

    fn deserialize(reader: &mut MemoryReader) -> IoResult<Self> {
        let bytes = reader.read_bytes(UINT160_SIZE)?;
        let mut out = [0u8; UINT160_SIZE];
        out.copy_from_slice(bytes);
        Ok(Self(out))
    }
}

impl fmt::Display for UInt160 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut reversed = self.0;
        reversed.reverse();
        write!(f, "0x{}", hex::encode(reversed))
    }
}

impl fmt::Debug for UInt160 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UInt160({self})")
    }
}

impl FromStr for UInt160 {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero() {
        assert!(UInt160::zero().is_zero());
    }

    #[test]
    fn test_length_check() {
        assert!(UInt160::from_bytes(&[0u8; 20]).is_ok());
        assert!(UInt160::from_bytes(&[0u8; 32]).is_err());
    }

    #[test]
    fn test_display_parse_roundtrip() {
        let value = UInt160::from([0x5Au8; 20]);
        assert_eq!(UInt160::parse(&value.to_string()).unwrap(), value);
    }
}
