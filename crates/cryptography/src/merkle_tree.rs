//! Merkle tree over transaction hashes.

use crate::hash::hash256;

/// Merkle tree with Neo semantics: an empty list yields the zero hash, a
/// single element is used directly, odd tails duplicate the last hash, and
/// parents are `hash256(left || right)`.
pub struct MerkleTree;

impl MerkleTree {
    /// Computes the Merkle root of an ordered list of 32-byte hashes.
    pub fn compute_root(hashes: &[[u8; 32]]) -> [u8; 32] {
        match hashes.len() {
            0 => [0u8; 32],
            1 => hashes[0],
            _ => {
                let mut level: Vec<[u8; 32]> = hashes.to_vec();
                while level.len() > 1 {
                    let mut next = Vec::with_capacity((level.len() + 1) / 2);
                    for pair in level.chunks(2) {
                        let left = pair[0];
                        let right = if pair.len() == 2 { pair[1] } else { pair[0] };

                        let mut combined = [0u8; 64];
                        combined[..32].copy_from_slice(&left);
                        combined[32..].copy_from_slice(&right);
                        next.push(hash256(&combined));
                    }
                    level = next;
                }
                level[0]
            }
        }
    }
}
