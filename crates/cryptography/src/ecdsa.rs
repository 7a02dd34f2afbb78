//! ECDSA signing and verification over secp256r1.
//!
//! Signatures are exchanged in the fixed 64-byte `r || s` form the
//! consensus wire format carries; signing is deterministic (RFC 6979).

use crate::{CryptoError, Result, PRIVATE_KEY_SIZE, SIGNATURE_SIZE};
use p256::{
    ecdsa::{
        signature::{Signer, Verifier},
        Signature, SigningKey, VerifyingKey,
    },
    elliptic_curve::sec1::ToEncodedPoint,
    SecretKey,
};
use rand::rngs::OsRng;

/// ECDSA operations over secp256r1.
pub struct ECDsa;

impl ECDsa {
    /// Signs data with the given private key, returning a raw `r || s`
    /// signature.
    pub fn sign(data: &[u8], private_key: &[u8; PRIVATE_KEY_SIZE]) -> Result<[u8; SIGNATURE_SIZE]> {
        let secret_key = SecretKey::from_slice(private_key)
            .map_err(|e| CryptoError::InvalidKey(format!("invalid private key: {e}")))?;
        let signing_key = SigningKey::from(secret_key);

        let signature: Signature = signing_key.sign(data);

        let mut out = [0u8; SIGNATURE_SIZE];
        out.copy_from_slice(&signature.to_bytes());
        Ok(out)
    }

    /// Verifies a raw `r || s` signature against data and a SEC1-encoded
    /// public key.
    ///
    /// Returns `Ok(false)` for a well-formed signature that does not match;
    /// malformed keys or signatures are errors.
    pub fn verify(data: &[u8], signature: &[u8], public_key: &[u8]) -> Result<bool> {
        if signature.len() != SIGNATURE_SIZE {
            return Err(CryptoError::InvalidSignature(format!(
                "expected {SIGNATURE_SIZE} bytes, got {}",
                signature.len()
            )));
        }

        let signature = Signature::from_slice(signature)
            .map_err(|e| CryptoError::InvalidSignature(format!("invalid signature: {e}")))?;
        let verifying_key = VerifyingKey::from_sec1_bytes(public_key)
            .map_err(|e| CryptoError::InvalidKey(format!("invalid public key: {e}")))?;

        Ok(verifying_key.verify(data, &signature).is_ok())
    }

    /// Generates a new random private key.
    pub fn generate_private_key() -> [u8; PRIVATE_KEY_SIZE] {
        let secret_key = SecretKey::random(&mut OsRng);
        secret_key.to_bytes().into()
    }

    /// Derives the compressed public key from a private key.
    pub fn derive_compressed_public_key(
        private_key: &[u8; PRIVATE_KEY_SIZE],
    ) -> Result<[u8; 33]> {
        let secret_key = SecretKey::from_slice(private_key)
            .map_err(|e| CryptoError::InvalidKey(format!("invalid private key: {e}")))?;
        let encoded = secret_key.public_key().to_encoded_point(true);

        let mut out = [0u8; 33];
        out.copy_from_slice(encoded.as_bytes());
        Ok(out)
    }

    /// Validates a SEC1-encoded public key.
    pub fn validate_public_key(public_key: &[u8]) -> bool {
        VerifyingKey::from_sec1_bytes(public_key).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let private_key = ECDsa::generate_private_key();
        let public_key = ECDsa::derive_compressed_public_key(&private_key).unwrap();

        let message = b"dBFT commit";
        let signature = ECDsa::sign(message, &private_key).unwrap();

        assert!(ECDsa::verify(message, &signature, &public_key).unwrap());
        assert!(!ECDsa::verify(b"other message", &signature, &public_key).unwrap());
    }

    #[test]
    fn test_signing_is_deterministic() {
        let private_key = ECDsa::generate_private_key();
        let message = b"same input, same signature";

        let first = ECDsa::sign(message, &private_key).unwrap();
        let second = ECDsa::sign(message, &private_key).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_wrong_key_rejected() {
        let private_key = ECDsa::generate_private_key();
        let other_public = {
            let other = ECDsa::generate_private_key();
            ECDsa::derive_compressed_public_key(&other).unwrap()
        };

        let signature = ECDsa::sign(b"message", &private_key).unwrap();
        assert!(!ECDsa::verify(b"message", &signature, &other_public).unwrap());
    }

    #[test]
    fn test_malformed_signature_is_error() {
        let private_key = ECDsa::generate_private_key();
        let public_key = ECDsa::derive_compressed_public_key(&private_key).unwrap();

        assert!(ECDsa::verify(b"message", &[0u8; 12], &public_key).is_err());
    }
}
