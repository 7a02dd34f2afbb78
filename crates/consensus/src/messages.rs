//! Consensus message types and their wire codec.
//!
//! The six dBFT payload variants share a common header followed by a
//! variant body and the sender's invocation script. The invocation script
//! holds the validator's signature over everything preceding it and is
//! stripped before signing, so `hash()` of a message covers exactly the
//! signed region.

use crate::{recovery::RecoveryMessage, Error, Result, ViewNumber};
use dbft_config::MAX_TRANSACTIONS_PER_BLOCK;
use dbft_core::UInt256;
use dbft_crypto::{hash::hash256, ECPoint, KeyPair, SIGNATURE_SIZE};
use dbft_io::{helper, BinaryWriter, IoResult, MemoryReader, Serializable, SerializableExt};

/// Maximum accepted invocation script length.
const MAX_INVOCATION_SCRIPT: usize = 1024;

/// Consensus message types, matching the on-wire discriminants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsensusMessageType {
    /// Change view message (view change request)
    ChangeView = 0x00,
    /// Prepare request message (from primary)
    PrepareRequest = 0x20,
    /// Prepare response message (from backups)
    PrepareResponse = 0x21,
    /// Commit message (from all validators)
    Commit = 0x30,
    /// Recovery request message
    RecoveryRequest = 0x40,
    /// Recovery message carrying a compacted round state
    RecoveryMessage = 0x41,
}

impl ConsensusMessageType {
    /// Converts from the wire byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::ChangeView),
            0x20 => Some(Self::PrepareRequest),
            0x21 => Some(Self::PrepareResponse),
            0x30 => Some(Self::Commit),
            0x40 => Some(Self::RecoveryRequest),
            0x41 => Some(Self::RecoveryMessage),
            _ => None,
        }
    }

    /// Converts to the wire byte.
    pub fn to_byte(&self) -> u8 {
        *self as u8
    }
}

/// Reason attached to a change view request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChangeViewReason {
    Timeout = 0x00,
    ChangeAgreement = 0x01,
    TxNotFound = 0x02,
    TxRejectedByPolicy = 0x03,
    TxInvalid = 0x04,
    BlockRejectedByPolicy = 0x05,
}

impl ChangeViewReason {
    /// Converts from the wire byte.
    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Timeout),
            0x01 => Some(Self::ChangeAgreement),
            0x02 => Some(Self::TxNotFound),
            0x03 => Some(Self::TxRejectedByPolicy),
            0x04 => Some(Self::TxInvalid),
            0x05 => Some(Self::BlockRejectedByPolicy),
            _ => None,
        }
    }
}

/// Prepare request body (sent by the primary).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareRequest {
    /// Proposed block version.
    pub version: u32,
    /// Hash of the current chain tip.
    pub prev_hash: UInt256,
    /// Proposed block timestamp in milliseconds.
    pub timestamp: u64,
    /// Random nonce for the proposed block.
    pub nonce: u64,
    /// Hashes of the transactions selected for the block, in block order.
    pub transaction_hashes: Vec<UInt256>,
}

impl Serializable for PrepareRequest {
    fn size(&self) -> usize {
        4 + 32 + 8 + 8 + helper::get_array_size(&self.transaction_hashes)
    }

    fn serialize(&self, writer: &mut BinaryWriter) -> IoResult<()> {
        writer.write_u32(self.version)?;
        writer.write_serializable(&self.prev_hash)?;
        writer.write_u64(self.timestamp)?;
        writer.write_u64(self.nonce)?;
        helper::serialize_array(&self.transaction_hashes, writer)
    }

    fn deserialize(reader: &mut MemoryReader) -> IoResult<Self> {
        Ok(Self {
            version: reader.read_u32()?,
            prev_hash: UInt256::deserialize(reader)?,
            timestamp: reader.read_u64()?,
            nonce: reader.read_u64()?,
            transaction_hashes: helper::deserialize_array(reader, MAX_TRANSACTIONS_PER_BLOCK)?,
        })
    }
}

/// Prepare response body (sent by backups).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareResponse {
    /// Hash of the primary's prepare request, computed over the bytes the
    /// primary signed (everything before its invocation script).
    pub preparation_hash: UInt256,
}

impl Serializable for PrepareResponse {
    fn size(&self) -> usize {
        32
    }

    fn serialize(&self, writer: &mut BinaryWriter) -> IoResult<()> {
        writer.write_serializable(&self.preparation_hash)
    }

    fn deserialize(reader: &mut MemoryReader) -> IoResult<Self> {
        Ok(Self {
            preparation_hash: UInt256::deserialize(reader)?,
        })
    }
}

/// Commit body: a signature over the final block hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    /// Raw `r || s` secp256r1 signature over the block signing data.
    pub signature: Vec<u8>,
}

impl Commit {
    /// Creates a commit from a raw signature.
    pub fn new(signature: [u8; SIGNATURE_SIZE]) -> Self {
        Self {
            signature: signature.to_vec(),
        }
    }
}

impl Serializable for Commit {
    fn size(&self) -> usize {
        SIGNATURE_SIZE
    }

    fn serialize(&self, writer: &mut BinaryWriter) -> IoResult<()> {
        writer.write_bytes(&self.signature)
    }

    fn deserialize(reader: &mut MemoryReader) -> IoResult<Self> {
        Ok(Self {
            signature: reader.read_bytes(SIGNATURE_SIZE)?.to_vec(),
        })
    }
}

/// Change view body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeView {
    /// View the sender wants to move to.
    pub new_view_number: ViewNumber,
    /// Sender's clock in milliseconds when the request was made.
    pub timestamp: u64,
    /// Why the sender gave up on the current view.
    pub reason: ChangeViewReason,
}

impl Serializable for ChangeView {
    fn size(&self) -> usize {
        1 + 8 + 1
    }

    fn serialize(&self, writer: &mut BinaryWriter) -> IoResult<()> {
        writer.write_u8(self.new_view_number.value())?;
        writer.write_u64(self.timestamp)?;
        writer.write_u8(self.reason as u8)
    }

    fn deserialize(reader: &mut MemoryReader) -> IoResult<Self> {
        let new_view_number = ViewNumber::new(reader.read_u8()?);
        let timestamp = reader.read_u64()?;
        let reason = ChangeViewReason::from_byte(reader.read_u8()?).ok_or_else(|| {
            dbft_io::IoError::invalid_format("unknown change view reason")
        })?;
        Ok(Self {
            new_view_number,
            timestamp,
            reason,
        })
    }
}

/// Recovery request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryRequest {
    /// Sender's clock in milliseconds when the request was made.
    pub timestamp: u64,
}

impl Serializable for RecoveryRequest {
    fn size(&self) -> usize {
        8
    }

    fn serialize(&self, writer: &mut BinaryWriter) -> IoResult<()> {
        writer.write_u64(self.timestamp)
    }

    fn deserialize(reader: &mut MemoryReader) -> IoResult<Self> {
        Ok(Self {
            timestamp: reader.read_u64()?,
        })
    }
}

/// Message-specific body, tagged by the wire type byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsensusMessageBody {
    /// Change view data
    ChangeView(ChangeView),
    /// Prepare request data
    PrepareRequest(PrepareRequest),
    /// Prepare response data
    PrepareResponse(PrepareResponse),
    /// Commit data
    Commit(Commit),
    /// Recovery request data
    RecoveryRequest(RecoveryRequest),
    /// Recovery message data
    RecoveryMessage(RecoveryMessage),
}

impl ConsensusMessageBody {
    /// Gets the wire type of this body.
    pub fn message_type(&self) -> ConsensusMessageType {
        match self {
            Self::ChangeView(_) => ConsensusMessageType::ChangeView,
            Self::PrepareRequest(_) => ConsensusMessageType::PrepareRequest,
            Self::PrepareResponse(_) => ConsensusMessageType::PrepareResponse,
            Self::Commit(_) => ConsensusMessageType::Commit,
            Self::RecoveryRequest(_) => ConsensusMessageType::RecoveryRequest,
            Self::RecoveryMessage(_) => ConsensusMessageType::RecoveryMessage,
        }
    }

    /// Gets the serialized size of the body.
    pub fn size(&self) -> usize {
        match self {
            Self::ChangeView(data) => data.size(),
            Self::PrepareRequest(data) => data.size(),
            Self::PrepareResponse(data) => data.size(),
            Self::Commit(data) => data.size(),
            Self::RecoveryRequest(data) => data.size(),
            Self::RecoveryMessage(data) => data.size(),
        }
    }

    fn serialize(&self, writer: &mut BinaryWriter) -> IoResult<()> {
        match self {
            Self::ChangeView(data) => data.serialize(writer),
            Self::PrepareRequest(data) => data.serialize(writer),
            Self::PrepareResponse(data) => data.serialize(writer),
            Self::Commit(data) => data.serialize(writer),
            Self::RecoveryRequest(data) => data.serialize(writer),
            Self::RecoveryMessage(data) => data.serialize(writer),
        }
    }

    fn deserialize_with_type(
        reader: &mut MemoryReader,
        message_type: ConsensusMessageType,
    ) -> IoResult<Self> {
        match message_type {
            ConsensusMessageType::ChangeView => {
                Ok(Self::ChangeView(ChangeView::deserialize(reader)?))
            }
            ConsensusMessageType::PrepareRequest => {
                Ok(Self::PrepareRequest(PrepareRequest::deserialize(reader)?))
            }
            ConsensusMessageType::PrepareResponse => {
                Ok(Self::PrepareResponse(PrepareResponse::deserialize(reader)?))
            }
            ConsensusMessageType::Commit => Ok(Self::Commit(Commit::deserialize(reader)?)),
            ConsensusMessageType::RecoveryRequest => {
                Ok(Self::RecoveryRequest(RecoveryRequest::deserialize(reader)?))
            }
            ConsensusMessageType::RecoveryMessage => Ok(Self::RecoveryMessage(
                RecoveryMessage::deserialize(reader)?,
            )),
        }
    }
}

/// A consensus message: common header, variant body, invocation script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusMessage {
    /// Height of the block being agreed on.
    pub block_index: u32,
    /// Index of the sending validator in the committee.
    pub validator_index: u8,
    /// View the sender was in when the message was created.
    pub view_number: ViewNumber,
    /// Variant body.
    pub body: ConsensusMessageBody,
    /// The sender's signature over everything preceding it.
    pub invocation_script: Vec<u8>,
}

impl ConsensusMessage {
    /// Creates a new, unsigned consensus message.
    pub fn new(
        block_index: u32,
        validator_index: u8,
        view_number: ViewNumber,
        body: ConsensusMessageBody,
    ) -> Self {
        Self {
            block_index,
            validator_index,
            view_number,
            body,
            invocation_script: Vec::new(),
        }
    }

    /// Gets the wire type of this message.
    pub fn message_type(&self) -> ConsensusMessageType {
        self.body.message_type()
    }

    fn serialize_unsigned(&self, writer: &mut BinaryWriter) -> IoResult<()> {
        writer.write_u8(self.message_type().to_byte())?;
        writer.write_u32(self.block_index)?;
        writer.write_u8(self.validator_index)?;
        writer.write_u8(self.view_number.value())?;
        self.body.serialize(writer)
    }

    /// Returns the signed region: everything before the invocation script.
    pub fn unsigned_bytes(&self) -> Vec<u8> {
        let mut writer = BinaryWriter::with_capacity(self.size());
        let _ = self.serialize_unsigned(&mut writer);
        writer.to_bytes()
    }

    /// Hash of the signed region. For a PrepareRequest this is the
    /// `preparation_hash` backups reference in their responses.
    pub fn hash(&self) -> UInt256 {
        UInt256::from(hash256(&self.unsigned_bytes()))
    }

    /// Returns the bytes actually signed for this message under the given
    /// network magic.
    pub fn signing_data(&self, network_magic: u32) -> Vec<u8> {
        let mut data = Vec::with_capacity(4 + 32);
        data.extend_from_slice(&network_magic.to_le_bytes());
        data.extend_from_slice(self.hash().as_bytes());
        data
    }

    /// Signs the message, filling in its invocation script.
    pub fn sign_with(&mut self, key: &KeyPair, network_magic: u32) -> Result<()> {
        let signature = key.sign(&self.signing_data(network_magic))?;
        self.invocation_script = signature.to_vec();
        Ok(())
    }

    /// Verifies the invocation script against the given validator key.
    pub fn verify_signature(&self, key: &ECPoint, network_magic: u32) -> bool {
        if self.invocation_script.len() != SIGNATURE_SIZE {
            return false;
        }
        key.verify(&self.signing_data(network_magic), &self.invocation_script)
    }

    /// Serializes the full message, invocation script included.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.to_array()?)
    }

    /// Decodes a full message, enforcing a well-formed, fully-consumed
    /// encoding with a present invocation script.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = MemoryReader::new(bytes);

        let type_byte = reader
            .read_u8()
            .map_err(|e| Error::Malformed(e.to_string()))?;
        let message_type =
            ConsensusMessageType::from_byte(type_byte).ok_or(Error::UnknownVariant(type_byte))?;

        let message = Self::deserialize_with_known_type(&mut reader, message_type)
            .map_err(|e| Error::Malformed(e.to_string()))?;

        if !reader.is_exhausted() {
            return Err(Error::Malformed(format!(
                "{} trailing bytes after message",
                reader.remaining()
            )));
        }
        if message.invocation_script.is_empty() {
            return Err(Error::InvocationScriptMissing);
        }

        Ok(message)
    }

    fn deserialize_with_known_type(
        reader: &mut MemoryReader,
        message_type: ConsensusMessageType,
    ) -> IoResult<Self> {
        let block_index = reader.read_u32()?;
        let validator_index = reader.read_u8()?;
        let view_number = ViewNumber::new(reader.read_u8()?);
        let body = ConsensusMessageBody::deserialize_with_type(reader, message_type)?;
        let invocation_script = reader.read_var_bytes(MAX_INVOCATION_SCRIPT)?;

        Ok(Self {
            block_index,
            validator_index,
            view_number,
            body,
            invocation_script,
        })
    }
}

impl Serializable for ConsensusMessage {
    fn size(&self) -> usize {
        1 + 4 + 1 + 1 + self.body.size() + helper::get_var_bytes_size(&self.invocation_script)
    }

    fn serialize(&self, writer: &mut BinaryWriter) -> IoResult<()> {
        self.serialize_unsigned(writer)?;
        writer.write_var_bytes(&self.invocation_script)
    }

    fn deserialize(reader: &mut MemoryReader) -> IoResult<Self> {
        let type_byte = reader.read_u8()?;
        let message_type = ConsensusMessageType::from_byte(type_byte)
            .ok_or_else(|| dbft_io::IoError::invalid_format("unknown message type"))?;
        Self::deserialize_with_known_type(reader, message_type)
    }
}

/// Returns the bytes every validator signs when committing to a block:
/// the network magic followed by the block hash.
pub fn block_signing_data(network_magic: u32, block_hash: &UInt256) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + 32);
    data.extend_from_slice(&network_magic.to_le_bytes());
    data.extend_from_slice(block_hash.as_bytes());
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_bytes() {
        assert_eq!(ConsensusMessageType::ChangeView.to_byte(), 0x00);
        assert_eq!(ConsensusMessageType::PrepareRequest.to_byte(), 0x20);
        assert_eq!(ConsensusMessageType::PrepareResponse.to_byte(), 0x21);
        assert_eq!(ConsensusMessageType::Commit.to_byte(), 0x30);
        assert_eq!(ConsensusMessageType::RecoveryRequest.to_byte(), 0x40);
        assert_eq!(ConsensusMessageType::RecoveryMessage.to_byte(), 0x41);

        assert_eq!(
            ConsensusMessageType::from_byte(0x20),
            Some(ConsensusMessageType::PrepareRequest)
        );
        assert_eq!(ConsensusMessageType::from_byte(0x13), None);
    }

    #[test]
    fn test_change_view_reason_bytes() {
        for byte in 0x00..=0x05u8 {
            let reason = ChangeViewReason::from_byte(byte).unwrap();
            assert_eq!(reason as u8, byte);
        }
        assert_eq!(ChangeViewReason::from_byte(0x06), None);
    }

    fn sample_request() -> ConsensusMessage {
        ConsensusMessage::new(
            7,
            2,
            ViewNumber::new(0),
            ConsensusMessageBody::PrepareRequest(PrepareRequest {
                version: 0,
                prev_hash: UInt256::from([3u8; 32]),
                timestamp: 1_700_000_000_123,
                nonce: 0xDEAD_BEEF_CAFE_F00D,
                transaction_hashes: vec![UInt256::from([1u8; 32]), UInt256::from([2u8; 32])],
            }),
        )
    }

    #[test]
    fn test_sign_and_verify() {
        let key = KeyPair::generate();
        let mut message = sample_request();

        message.sign_with(&key, 0x4F454E).unwrap();
        assert!(message.verify_signature(key.public_key(), 0x4F454E));

        // Cross-network replay must fail.
        assert!(!message.verify_signature(key.public_key(), 0x12345678));

        // A different key must fail.
        let other = KeyPair::generate();
        assert!(!message.verify_signature(other.public_key(), 0x4F454E));
    }

    #[test]
    fn test_hash_excludes_invocation_script() {
        let key = KeyPair::generate();
        let unsigned = sample_request();
        let mut signed = unsigned.clone();
        signed.sign_with(&key, 0).unwrap();

        assert_eq!(unsigned.hash(), signed.hash());
    }

    #[test]
    fn test_roundtrip_bit_for_bit() {
        let key = KeyPair::generate();
        let mut message = sample_request();
        message.sign_with(&key, 0).unwrap();

        let bytes = message.to_bytes().unwrap();
        assert_eq!(bytes.len(), message.size());

        let decoded = ConsensusMessage::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn test_unknown_variant_rejected() {
        let key = KeyPair::generate();
        let mut message = sample_request();
        message.sign_with(&key, 0).unwrap();

        let mut bytes = message.to_bytes().unwrap();
        bytes[0] = 0x7F;
        assert!(matches!(
            ConsensusMessage::from_bytes(&bytes),
            Err(Error::UnknownVariant(0x7F))
        ));
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let key = KeyPair::generate();
        let mut message = sample_request();
        message.sign_with(&key, 0).unwrap();

        let bytes = message.to_bytes().unwrap();
        assert!(matches!(
            ConsensusMessage::from_bytes(&bytes[..bytes.len() - 3]),
            Err(Error::Malformed(_))
        ));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let key = KeyPair::generate();
        let mut message = sample_request();
        message.sign_with(&key, 0).unwrap();

        let mut bytes = message.to_bytes().unwrap();
        bytes.push(0);
        assert!(matches!(
            ConsensusMessage::from_bytes(&bytes),
            Err(Error::Malformed(_))
        ));
    }

    #[test]
    fn test_missing_invocation_script_rejected() {
        let message = sample_request();
        let bytes = message.to_bytes().unwrap();
        assert!(matches!(
            ConsensusMessage::from_bytes(&bytes),
            Err(Error::InvocationScriptMissing)
        ));
    }

    #[test]
    fn test_commit_signature_is_fixed_width() {
        let commit = Commit::new([9u8; 64]);
        let mut message =
            ConsensusMessage::new(1, 0, ViewNumber::new(0), ConsensusMessageBody::Commit(commit));
        message.invocation_script = vec![1u8; 64];

        let bytes = message.to_bytes().unwrap();
        let decoded = ConsensusMessage::from_bytes(&bytes).unwrap();
        match decoded.body {
            ConsensusMessageBody::Commit(c) => assert_eq!(c.signature, vec![9u8; 64]),
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn test_block_signing_data_layout() {
        let hash = UInt256::from([0xAAu8; 32]);
        let data = block_signing_data(0x01020304, &hash);
        assert_eq!(&data[..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&data[4..], hash.as_bytes());
    }
}
