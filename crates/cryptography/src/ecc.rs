//! Validated curve points and key pairs.

use crate::{CryptoError, ECDsa, Result, COMPRESSED_POINT_SIZE, PRIVATE_KEY_SIZE, SIGNATURE_SIZE};
use std::cmp::Ordering;
use std::fmt;

/// A validated, compressed secp256r1 public key.
///
/// The committee is an ordered sequence of these points; ordering is
/// byte-lexicographic over the compressed encoding so that every node derives
/// the same canonical order.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ECPoint {
    bytes: [u8; COMPRESSED_POINT_SIZE],
}

impl ECPoint {
    /// Creates a point from a compressed SEC1 encoding, validating that it
    /// lies on the curve.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != COMPRESSED_POINT_SIZE {
            return Err(CryptoError::InvalidPoint(format!(
                "expected {COMPRESSED_POINT_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        if !ECDsa::validate_public_key(bytes) {
            return Err(CryptoError::InvalidPoint(
                "encoding is not a point on secp256r1".to_string(),
            ));
        }

        let mut out = [0u8; COMPRESSED_POINT_SIZE];
        out.copy_from_slice(bytes);
        Ok(Self { bytes: out })
    }

    /// Parses a point from its hex encoding.
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| CryptoError::InvalidPoint(format!("invalid hex: {e}")))?;
        Self::from_bytes(&bytes)
    }

    /// Returns the compressed encoding.
    pub fn as_bytes(&self) -> &[u8; COMPRESSED_POINT_SIZE] {
        &self.bytes
    }

    /// Returns the compressed encoding as a vector.
    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.to_vec()
    }

    /// Verifies a raw `r || s` signature made by this key.
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        ECDsa::verify(data, signature, &self.bytes).unwrap_or(false)
    }
}

impl Ord for ECPoint {
    fn cmp(&self, other: &Self) -> Ordering {
        self.bytes.cmp(&other.bytes)
    }
}

impl PartialOrd for ECPoint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for ECPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ECPoint({})", hex::encode(self.bytes))
    }
}

impl fmt::Display for ECPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.bytes))
    }
}

/// A secp256r1 key pair held by the local validator.
#[derive(Clone)]
pub struct KeyPair {
    private_key: [u8; PRIVATE_KEY_SIZE],
    public_key: ECPoint,
}

impl KeyPair {
    /// Generates a new random key pair.
    pub fn generate() -> Self {
        let private_key = ECDsa::generate_private_key();
        // A freshly generated scalar always yields a valid point.
        Self::from_private_key(&private_key).expect("generated key is valid")
    }

    /// Creates a key pair from an existing private key.
    pub fn from_private_key(private_key: &[u8; PRIVATE_KEY_SIZE]) -> Result<Self> {
        let compressed = ECDsa::derive_compressed_public_key(private_key)?;
        let public_key = ECPoint::from_bytes(&compressed)?;
        Ok(Self {
            private_key: *private_key,
            public_key,
        })
    }

    /// Creates a key pair from a hex-encoded private key.
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| CryptoError::InvalidKey(format!("invalid hex: {e}")))?;
        let key: [u8; PRIVATE_KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("private key must be 32 bytes".to_string()))?;
        Self::from_private_key(&key)
    }

    /// Returns the public key.
    pub fn public_key(&self) -> &ECPoint {
        &self.public_key
    }

    /// Signs data, returning a raw `r || s` signature.
    pub fn sign(&self, data: &[u8]) -> Result<[u8; SIGNATURE_SIZE]> {
        ECDsa::sign(data, &self.private_key)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print the private key.
        write!(f, "KeyPair({})", self.public_key)
    }
}
