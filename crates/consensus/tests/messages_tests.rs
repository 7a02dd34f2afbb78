//! Wire codec tests: fixed vectors and randomized round-trips.

use dbft_consensus::{
    ChangeView, ChangeViewReason, Commit, ConsensusMessage, ConsensusMessageBody,
    PrepareRequest, PrepareResponse, RecoveryRequest, ViewNumber,
};
use dbft_core::UInt256;
use proptest::prelude::*;

#[test]
fn change_view_wire_vector() {
    let mut message = ConsensusMessage::new(
        0x01020304,
        5,
        ViewNumber::new(6),
        ConsensusMessageBody::ChangeView(ChangeView {
            new_view_number: ViewNumber::new(7),
            timestamp: 0x1122334455667788,
            reason: ChangeViewReason::TxNotFound,
        }),
    );
    message.invocation_script = vec![0xAA, 0xBB];

    let bytes = message.to_bytes().unwrap();
    assert_eq!(
        bytes,
        vec![
            0x00, // ChangeView
            0x04, 0x03, 0x02, 0x01, // block index, little-endian
            0x05, // validator index
            0x06, // view number
            0x07, // new view number
            0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11, // timestamp
            0x02, // reason: TxNotFound
            0x02, 0xAA, 0xBB, // invocation script
        ]
    );
}

#[test]
fn recovery_request_wire_vector() {
    let mut message = ConsensusMessage::new(
        1,
        0,
        ViewNumber::new(0),
        ConsensusMessageBody::RecoveryRequest(RecoveryRequest { timestamp: 2 }),
    );
    message.invocation_script = vec![0xFF];

    let bytes = message.to_bytes().unwrap();
    assert_eq!(bytes[0], 0x40);
    assert_eq!(bytes.len(), 1 + 4 + 1 + 1 + 8 + 2);
}

fn uint256_strategy() -> impl Strategy<Value = UInt256> {
    any::<[u8; 32]>().prop_map(UInt256::from)
}

fn script_strategy() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(any::<u8>(), 1..=128)
}

fn header_strategy() -> impl Strategy<Value = (u32, u8, u8)> {
    (any::<u32>(), any::<u8>(), any::<u8>())
}

fn roundtrip(message: &ConsensusMessage) {
    let bytes = message.to_bytes().unwrap();
    let decoded = ConsensusMessage::from_bytes(&bytes).unwrap();
    assert_eq!(&decoded, message);
    assert_eq!(decoded.to_bytes().unwrap(), bytes);
}

proptest! {
    #[test]
    fn prop_prepare_request_roundtrip(
        (block_index, validator_index, view) in header_strategy(),
        version in any::<u32>(),
        prev_hash in uint256_strategy(),
        timestamp in any::<u64>(),
        nonce in any::<u64>(),
        hashes in proptest::collection::vec(uint256_strategy(), 0..16),
        script in script_strategy(),
    ) {
        let mut message = ConsensusMessage::new(
            block_index,
            validator_index,
            ViewNumber::new(view),
            ConsensusMessageBody::PrepareRequest(PrepareRequest {
                version,
                prev_hash,
                timestamp,
                nonce,
                transaction_hashes: hashes,
            }),
        );
        message.invocation_script = script;
        roundtrip(&message);
    }

    #[test]
    fn prop_prepare_response_roundtrip(
        (block_index, validator_index, view) in header_strategy(),
        preparation_hash in uint256_strategy(),
        script in script_strategy(),
    ) {
        let mut message = ConsensusMessage::new(
            block_index,
            validator_index,
            ViewNumber::new(view),
            ConsensusMessageBody::PrepareResponse(PrepareResponse { preparation_hash }),
        );
        message.invocation_script = script;
        roundtrip(&message);
    }

    #[test]
    fn prop_commit_roundtrip(
        (block_index, validator_index, view) in header_strategy(),
        signature in any::<[u8; 32]>(),
        script in script_strategy(),
    ) {
        // Stretch 32 random bytes over the 64-byte signature field.
        let mut raw = [0u8; 64];
        raw[..32].copy_from_slice(&signature);
        raw[32..].copy_from_slice(&signature);

        let mut message = ConsensusMessage::new(
            block_index,
            validator_index,
            ViewNumber::new(view),
            ConsensusMessageBody::Commit(Commit::new(raw)),
        );
        message.invocation_script = script;
        roundtrip(&message);
    }

    #[test]
    fn prop_change_view_roundtrip(
        (block_index, validator_index, view) in header_strategy(),
        new_view in any::<u8>(),
        timestamp in any::<u64>(),
        reason_byte in 0u8..6,
        script in script_strategy(),
    ) {
        let mut message = ConsensusMessage::new(
            block_index,
            validator_index,
            ViewNumber::new(view),
            ConsensusMessageBody::ChangeView(ChangeView {
                new_view_number: ViewNumber::new(new_view),
                timestamp,
                reason: ChangeViewReason::from_byte(reason_byte).unwrap(),
            }),
        );
        message.invocation_script = script;
        roundtrip(&message);
    }

    #[test]
    fn prop_recovery_request_roundtrip(
        (block_index, validator_index, view) in header_strategy(),
        timestamp in any::<u64>(),
        script in script_strategy(),
    ) {
        let mut message = ConsensusMessage::new(
            block_index,
            validator_index,
            ViewNumber::new(view),
            ConsensusMessageBody::RecoveryRequest(RecoveryRequest { timestamp }),
        );
        message.invocation_script = script;
        roundtrip(&message);
    }

    #[test]
    fn prop_garbage_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
        // Decoding arbitrary bytes must return an error or a message,
        // never panic.
        let _ = ConsensusMessage::from_bytes(&bytes);
    }
}
