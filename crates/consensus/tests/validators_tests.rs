//! Validator registry and committee script tests.

use dbft_consensus::{
    byzantine_threshold, required_signatures,
    validators::{multisig_redeem_script, next_consensus_hash, signature_redeem_script},
    LedgerSnapshot, StandingCommittee, ValidatorRegistry, ValidatorSet, ViewNumber,
};
use dbft_core::UInt256;
use dbft_crypto::{hash::hash160, ECPoint, KeyPair};
use proptest::prelude::*;

fn committee(n: usize) -> Vec<ECPoint> {
    let mut keys: Vec<ECPoint> = (0..n).map(|_| *KeyPair::generate().public_key()).collect();
    keys.sort();
    keys
}

fn snapshot(validators: Vec<ECPoint>) -> LedgerSnapshot {
    LedgerSnapshot {
        height: 0,
        current_hash: UInt256::from([7u8; 32]),
        timestamp_ms: 0,
        validators,
    }
}

#[test]
fn standing_committee_is_deterministic() {
    let keys = committee(7);
    let snapshot = snapshot(keys.clone());
    let registry = StandingCommittee;

    let first = registry.validators_for(&snapshot, 1).unwrap();
    let second = registry.validators_for(&snapshot, 1).unwrap();
    assert_eq!(first, second);
    assert_eq!(first, keys);

    // The standing committee is the same at every height.
    assert_eq!(registry.validators_for(&snapshot, 500).unwrap(), keys);
    assert_eq!(
        registry.next_consensus_hash(&snapshot, 1).unwrap(),
        registry.next_consensus_hash(&snapshot, 2).unwrap()
    );
}

#[test]
fn empty_snapshot_is_rejected() {
    let registry = StandingCommittee;
    assert!(registry.validators_for(&snapshot(Vec::new()), 1).is_err());
}

#[test]
fn primary_rotates_across_heights_and_views() {
    let set = ValidatorSet::new(committee(7));

    for height in 0..20u32 {
        for view in 0..10u8 {
            let expected = ((height as u64 + view as u64) % 7) as u16;
            assert_eq!(set.primary_index(height, ViewNumber::new(view)), expected);
        }
    }
}

#[test]
fn next_consensus_matches_multisig_script_hash() {
    let keys = committee(4);
    // M = n - f = 3 for a four-validator committee.
    let script = multisig_redeem_script(3, &keys).unwrap();
    let expected = hash160(&script);

    assert_eq!(
        next_consensus_hash(&keys).unwrap().as_bytes(),
        &expected
    );
}

#[test]
fn multisig_script_orders_keys_canonically() {
    let keys = committee(4);
    let script = multisig_redeem_script(3, &keys).unwrap();

    // Keys appear in committee order inside the script.
    let mut offset = 1; // past the M push
    for key in &keys {
        assert_eq!(script[offset], 0x0C);
        assert_eq!(script[offset + 1], 33);
        assert_eq!(&script[offset + 2..offset + 35], key.as_bytes());
        offset += 35;
    }
}

#[test]
fn single_signature_script_hash_identifies_the_key() {
    let a = *KeyPair::generate().public_key();
    let b = *KeyPair::generate().public_key();

    assert_eq!(
        hash160(&signature_redeem_script(&a)),
        hash160(&signature_redeem_script(&a))
    );
    assert_ne!(
        hash160(&signature_redeem_script(&a)),
        hash160(&signature_redeem_script(&b))
    );
}

proptest! {
    // Quorum counting must tolerate f Byzantine validators at every
    // committee size the wire format can index.
    #[test]
    fn prop_quorum_tolerates_byzantine_bound(n in 1usize..=255) {
        let f = byzantine_threshold(n);
        let m = required_signatures(n);

        // The two constants partition the committee.
        prop_assert_eq!(m + f, n);
        // Strictly fewer than a third of the committee may be Byzantine.
        prop_assert!(3 * f < n);
        // A quorum survives f abstentions and still outnumbers 2f.
        prop_assert!(m >= 2 * f + 1);
        // Any two quorums overlap in at least f + 1 validators, so at most
        // one block per (height, view) can gather M commits.
        prop_assert!(2 * m >= n + f + 1);
    }

    // The primary slot is always a valid committee index.
    #[test]
    fn prop_primary_index_in_bounds(
        n in 1usize..=16,
        height in any::<u32>(),
        view in any::<u8>(),
    ) {
        let set = ValidatorSet::new(committee(n));
        let primary = set.primary_index(height, ViewNumber::new(view));
        prop_assert!((primary as usize) < n);
        prop_assert_eq!(
            primary as u64,
            (height as u64 + view as u64) % n as u64
        );
    }
}
