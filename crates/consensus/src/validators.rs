//! Validator set management and committee scripts.
//!
//! The committee for a height is an ordered sequence of secp256r1 public
//! keys resolved from a ledger snapshot. The ordering is part of consensus:
//! payloads are indexed by position and the block witness is laid out in
//! ascending index order, so the registry must be deterministic for a given
//! snapshot.

use crate::{service::LedgerSnapshot, Error, Result, ViewNumber};
use dbft_core::UInt160;
use dbft_crypto::{hash::hash160, hash::sha256, ECPoint};

/// Neo VM opcodes used by the witness scripts built here.
pub(crate) mod opcode {
    pub const PUSHINT8: u8 = 0x00;
    pub const PUSHDATA1: u8 = 0x0C;
    pub const PUSH0: u8 = 0x10;
    pub const SYSCALL: u8 = 0x41;
}

const CHECKSIG_INTEROP: &str = "System.Crypto.CheckSig";
const CHECKMULTISIG_INTEROP: &str = "System.Crypto.CheckMultisig";

/// The ordered committee for one block height.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorSet {
    keys: Vec<ECPoint>,
}

impl ValidatorSet {
    /// Creates a validator set from an ordered key sequence.
    pub fn new(keys: Vec<ECPoint>) -> Self {
        Self { keys }
    }

    /// Gets the number of validators.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Checks if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Gets a validator key by index.
    pub fn get(&self, index: u16) -> Option<&ECPoint> {
        self.keys.get(index as usize)
    }

    /// Gets the index of a validator key, if present.
    pub fn index_of(&self, key: &ECPoint) -> Option<u16> {
        self.keys.iter().position(|k| k == key).map(|i| i as u16)
    }

    /// Returns the ordered keys.
    pub fn keys(&self) -> &[ECPoint] {
        &self.keys
    }

    /// Maximum tolerated Byzantine count `f = (n-1)/3`.
    pub fn byzantine_threshold(&self) -> usize {
        crate::byzantine_threshold(self.keys.len())
    }

    /// Quorum `M = n - f`.
    pub fn quorum(&self) -> usize {
        crate::required_signatures(self.keys.len())
    }

    /// Index of the primary for `(height, view)`: `(height + view) mod n`.
    pub fn primary_index(&self, height: u32, view: ViewNumber) -> u16 {
        if self.keys.is_empty() {
            return 0;
        }
        ((height as u64 + view.value() as u64) % self.keys.len() as u64) as u16
    }
}

fn interop_token(name: &str) -> [u8; 4] {
    let digest = sha256(name.as_bytes());
    [digest[0], digest[1], digest[2], digest[3]]
}

fn emit_push_int(script: &mut Vec<u8>, value: usize) {
    debug_assert!(value <= u8::MAX as usize);
    if value <= 16 {
        script.push(opcode::PUSH0 + value as u8);
    } else {
        script.push(opcode::PUSHINT8);
        script.push(value as u8);
    }
}

fn emit_push_key(script: &mut Vec<u8>, key: &ECPoint) {
    script.push(opcode::PUSHDATA1);
    script.push(33);
    script.extend_from_slice(key.as_bytes());
}

fn emit_syscall(script: &mut Vec<u8>, name: &str) {
    script.push(opcode::SYSCALL);
    script.extend_from_slice(&interop_token(name));
}

/// Builds the single-signature verification script for a key.
pub fn signature_redeem_script(key: &ECPoint) -> Vec<u8> {
    let mut script = Vec::with_capacity(40);
    emit_push_key(&mut script, key);
    emit_syscall(&mut script, CHECKSIG_INTEROP);
    script
}

/// Builds the M-of-N multisig verification script: push `m`, push each key
/// in order, push `n`, CheckMultisig.
pub fn multisig_redeem_script(m: usize, keys: &[ECPoint]) -> Result<Vec<u8>> {
    if keys.is_empty() || m == 0 || m > keys.len() || keys.len() > u8::MAX as usize {
        return Err(Error::InvalidConfig(format!(
            "invalid multisig parameters: m={m}, n={}",
            keys.len()
        )));
    }

    let mut script = Vec::with_capacity(2 + keys.len() * 35 + 7);
    emit_push_int(&mut script, m);
    for key in keys {
        emit_push_key(&mut script, key);
    }
    emit_push_int(&mut script, keys.len());
    emit_syscall(&mut script, CHECKMULTISIG_INTEROP);
    Ok(script)
}

/// Computes the `NextConsensus` script hash for a committee: the Hash160 of
/// its M-of-N multisig script, with `M = n - (n-1)/3`.
pub fn next_consensus_hash(keys: &[ECPoint]) -> Result<UInt160> {
    let m = crate::required_signatures(keys.len());
    let script = multisig_redeem_script(m, keys)?;
    Ok(UInt160::from(hash160(&script)))
}

/// Resolves the ordered validator set for upcoming blocks.
///
/// Implementations adapt the native NEO contract's committee query; they
/// MUST be deterministic for a given snapshot — any non-determinism is a
/// consensus-splitting bug.
pub trait ValidatorRegistry: Send + Sync {
    /// Returns the ordered validator keys for the given height.
    fn validators_for(&self, snapshot: &LedgerSnapshot, height: u32) -> Result<Vec<ECPoint>>;

    /// Returns the `NextConsensus` script hash for the given height.
    fn next_consensus_hash(&self, snapshot: &LedgerSnapshot, height: u32) -> Result<UInt160> {
        let validators = self.validators_for(snapshot, height)?;
        next_consensus_hash(&validators)
    }
}

/// Registry for a committee that does not rotate between blocks: every
/// height uses the validator keys recorded in the snapshot.
#[derive(Debug, Default)]
pub struct StandingCommittee;

impl ValidatorRegistry for StandingCommittee {
    fn validators_for(&self, snapshot: &LedgerSnapshot, _height: u32) -> Result<Vec<ECPoint>> {
        if snapshot.validators.is_empty() {
            return Err(Error::InvalidConfig(
                "snapshot carries no validators".to_string(),
            ));
        }
        Ok(snapshot.validators.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbft_crypto::KeyPair;

    fn committee(n: usize) -> Vec<ECPoint> {
        let mut keys: Vec<ECPoint> = (0..n).map(|_| *KeyPair::generate().public_key()).collect();
        keys.sort();
        keys
    }

    #[test]
    fn test_primary_rotation() {
        let set = ValidatorSet::new(committee(4));

        // primary(h, v) = (h + v) mod n
        assert_eq!(set.primary_index(1, ViewNumber::new(0)), 1);
        assert_eq!(set.primary_index(1, ViewNumber::new(1)), 2);
        assert_eq!(set.primary_index(1, ViewNumber::new(3)), 0);
        assert_eq!(set.primary_index(8, ViewNumber::new(0)), 0);
    }

    #[test]
    fn test_quorum_sizes() {
        let set = ValidatorSet::new(committee(7));
        assert_eq!(set.byzantine_threshold(), 2);
        assert_eq!(set.quorum(), 5);
    }

    #[test]
    fn test_index_lookup() {
        let keys = committee(4);
        let set = ValidatorSet::new(keys.clone());

        for (i, key) in keys.iter().enumerate() {
            assert_eq!(set.index_of(key), Some(i as u16));
        }
        assert_eq!(set.index_of(KeyPair::generate().public_key()), None);
    }

    #[test]
    fn test_signature_redeem_script_shape() {
        let key = *KeyPair::generate().public_key();
        let script = signature_redeem_script(&key);

        assert_eq!(script[0], 0x0C); // PUSHDATA1
        assert_eq!(script[1], 33);
        assert_eq!(&script[2..35], key.as_bytes());
        assert_eq!(script[35], 0x41); // SYSCALL
        assert_eq!(script.len(), 40);
    }

    #[test]
    fn test_multisig_script_shape() {
        let keys = committee(4);
        let script = multisig_redeem_script(3, &keys).unwrap();

        assert_eq!(script[0], 0x10 + 3); // push M = 3
        assert_eq!(script[script.len() - 6], 0x10 + 4); // push N = 4
        assert_eq!(script[script.len() - 5], 0x41); // SYSCALL
    }

    #[test]
    fn test_multisig_parameter_validation() {
        let keys = committee(4);
        assert!(multisig_redeem_script(0, &keys).is_err());
        assert!(multisig_redeem_script(5, &keys).is_err());
        assert!(multisig_redeem_script(1, &[]).is_err());
    }

    #[test]
    fn test_next_consensus_is_deterministic() {
        let keys = committee(4);
        let a = next_consensus_hash(&keys).unwrap();
        let b = next_consensus_hash(&keys).unwrap();
        assert_eq!(a, b);

        // A different committee hashes elsewhere.
        let other = committee(4);
        assert_ne!(a, next_consensus_hash(&other).unwrap());
    }
}
