//! Cryptographic primitives for the Neo dBFT core.
//!
//! Hashing (SHA-256, double SHA-256, RIPEMD-160), ECDSA over secp256r1
//! (Neo's curve), compressed public-key points, and the Merkle tree used
//! for block transaction roots.

pub mod ecc;
pub mod ecdsa;
pub mod hash;
pub mod merkle_tree;

pub use ecc::{ECPoint, KeyPair};
pub use ecdsa::ECDsa;
pub use merkle_tree::MerkleTree;

use thiserror::Error;

/// Result type for cryptographic operations.
pub type Result<T> = std::result::Result<T, CryptoError>;

/// Errors produced by cryptographic operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// A private or public key was malformed.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// A signature was malformed or had the wrong length.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// An encoded curve point was not on secp256r1.
    #[error("invalid point: {0}")]
    InvalidPoint(String),
}

/// Length of a compressed secp256r1 public key in bytes.
pub const COMPRESSED_POINT_SIZE: usize = 33;

/// Length of a raw `r || s` ECDSA signature in bytes.
pub const SIGNATURE_SIZE: usize = 64;

/// Length of a raw private key scalar in bytes.
pub const PRIVATE_KEY_SIZE: usize = 32;
