//! ExtensiblePayload envelope for consensus messages.
//!
//! On the wire a consensus message travels inside an extensible payload
//! categorized `"dBFT"`, with a block-validity window, the sender's script
//! hash, and a witness. The signing domain mixes in the network magic so a
//! payload signed for one network never verifies on another.

use crate::{validators::signature_redeem_script, ConsensusMessage, Error, Result};
use dbft_core::{UInt160, UInt256, Witness};
use dbft_crypto::{hash::hash256, ECPoint, KeyPair, SIGNATURE_SIZE};
use dbft_io::{helper, BinaryWriter, IoResult, MemoryReader, Serializable, SerializableExt};

/// Category tag identifying consensus payloads.
pub const CONSENSUS_CATEGORY: &str = "dBFT";

/// Maximum accepted category length.
const MAX_CATEGORY_LENGTH: usize = 32;

/// Maximum accepted inner data length.
const MAX_DATA_LENGTH: usize = 1_048_576;

/// How many blocks a consensus payload stays relayable for.
const VALIDITY_WINDOW: u32 = 100;

/// A network envelope carrying an opaque, signed byte string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensiblePayload {
    /// Category tag; consensus payloads use [`CONSENSUS_CATEGORY`].
    pub category: String,
    /// First height at which the payload is valid.
    pub valid_block_start: u32,
    /// Last height at which the payload is valid.
    pub valid_block_end: u32,
    /// Script hash of the sender.
    pub sender: UInt160,
    /// The serialized inner message.
    pub data: Vec<u8>,
    /// Witness over the unsigned region.
    pub witness: Witness,
}

impl ExtensiblePayload {
    /// Creates a consensus payload valid from `height` for the standard
    /// relay window. The witness is attached by [`Self::sign`].
    pub fn consensus(height: u32, sender: UInt160, data: Vec<u8>) -> Self {
        Self {
            category: CONSENSUS_CATEGORY.to_string(),
            valid_block_start: height,
            valid_block_end: height.saturating_add(VALIDITY_WINDOW),
            sender,
            data,
            witness: Witness::empty(),
        }
    }

    /// Returns whether this payload carries a consensus message.
    pub fn is_consensus(&self) -> bool {
        self.category == CONSENSUS_CATEGORY
    }

    fn serialize_unsigned(&self, writer: &mut BinaryWriter) -> IoResult<()> {
        writer.write_var_string(&self.category)?;
        writer.write_u32(self.valid_block_start)?;
        writer.write_u32(self.valid_block_end)?;
        writer.write_serializable(&self.sender)?;
        writer.write_var_bytes(&self.data)
    }

    /// Returns the witness-covered region.
    pub fn unsigned_bytes(&self) -> Vec<u8> {
        let mut writer = BinaryWriter::with_capacity(self.size());
        let _ = self.serialize_unsigned(&mut writer);
        writer.to_bytes()
    }

    /// Hash of the unsigned region, used for relay deduplication.
    pub fn hash(&self) -> UInt256 {
        UInt256::from(hash256(&self.unsigned_bytes()))
    }

    /// Returns the bytes the witness signature covers under the given
    /// network magic.
    pub fn signing_data(&self, network_magic: u32) -> Vec<u8> {
        let mut data = Vec::with_capacity(4 + 32);
        data.extend_from_slice(&network_magic.to_le_bytes());
        data.extend_from_slice(self.hash().as_bytes());
        data
    }

    /// Signs the payload, attaching a single-signature witness and fixing
    /// the sender to the signer's script hash.
    pub fn sign(&mut self, key: &KeyPair, network_magic: u32) -> Result<()> {
        let verification_script = signature_redeem_script(key.public_key());
        let signature = key.sign(&self.signing_data(network_magic))?;
        self.witness = Witness::new(signature.to_vec(), verification_script);
        self.sender = self.witness.script_hash();
        Ok(())
    }

    /// Verifies the witness against the expected signer key.
    pub fn verify(&self, key: &ECPoint, network_magic: u32) -> bool {
        if self.witness.invocation_script.len() != SIGNATURE_SIZE {
            return false;
        }
        if self.witness.verification_script != signature_redeem_script(key) {
            return false;
        }
        if self.sender != self.witness.script_hash() {
            return false;
        }
        key.verify(&self.signing_data(network_magic), &self.witness.invocation_script)
    }

    /// Decodes an envelope from bytes, rejecting trailing data.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = MemoryReader::new(bytes);
        let payload =
            Self::deserialize(&mut reader).map_err(|e| Error::Malformed(e.to_string()))?;
        if !reader.is_exhausted() {
            return Err(Error::Malformed(format!(
                "{} trailing bytes after payload",
                reader.remaining()
            )));
        }
        Ok(payload)
    }

    /// Serializes the envelope to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.to_array()?)
    }
}

impl Serializable for ExtensiblePayload {
    fn size(&self) -> usize {
        helper::get_var_bytes_size(self.category.as_bytes())
            + 4
            + 4
            + 20
            + helper::get_var_bytes_size(&self.data)
            + self.witness.size()
    }

    fn serialize(&self, writer: &mut BinaryWriter) -> IoResult<()> {
        self.serialize_unsigned(writer)?;
        writer.write_serializable(&self.witness)
    }

    fn deserialize(reader: &mut MemoryReader) -> IoResult<Self> {
        Ok(Self {
            category: reader.read_var_string(MAX_CATEGORY_LENGTH)?,
            valid_block_start: reader.read_u32()?,
            valid_block_end: reader.read_u32()?,
            sender: UInt160::deserialize(reader)?,
            data: reader.read_var_bytes(MAX_DATA_LENGTH)?,
            witness: Witness::deserialize(reader)?,
        })
    }
}

/// Wraps a signed consensus message in an envelope and witnesses it.
pub fn wrap_message(
    message: &ConsensusMessage,
    key: &KeyPair,
    network_magic: u32,
) -> Result<ExtensiblePayload> {
    let data = message.to_bytes()?;
    let mut payload = ExtensiblePayload::consensus(message.block_index, UInt160::zero(), data);
    payload.sign(key, network_magic)?;
    Ok(payload)
}

/// Unwraps a consensus message from an envelope.
///
/// Only the category and codec are checked here; signature verification
/// happens in the engine once the sender's validator key is known.
pub fn unwrap_message(payload: &ExtensiblePayload) -> Result<ConsensusMessage> {
    if !payload.is_consensus() {
        return Err(Error::Malformed(format!(
            "not a consensus payload, category: {}",
            payload.category
        )));
    }
    ConsensusMessage::from_bytes(&payload.data)
}
