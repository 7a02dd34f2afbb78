//! Neo N3 transaction, trimmed to the surface the consensus core reads.

use crate::{UInt256, Witness};
use dbft_crypto::hash::hash256;
use dbft_io::{helper, BinaryWriter, IoResult, MemoryReader, Serializable};
use serde::{Deserialize, Serialize};

/// Maximum number of witnesses a transaction may carry.
const MAX_WITNESSES: usize = 16;

/// A transaction selected into blocks by the consensus engine.
///
/// The hash covers the unsigned region (everything except the witnesses),
/// so attaching or replacing witnesses never changes a transaction's
/// identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Transaction format version.
    pub version: u8,
    /// Random value making otherwise-identical transactions distinct.
    pub nonce: u32,
    /// Fee paid for execution, in datoshi.
    pub system_fee: i64,
    /// Fee paid for inclusion and relaying, in datoshi.
    pub network_fee: i64,
    /// Height after which this transaction can no longer be included.
    pub valid_until_block: u32,
    /// The execution script.
    pub script: Vec<u8>,
    /// Witnesses authorizing the transaction.
    pub witnesses: Vec<Witness>,
}

impl Transaction {
    /// Creates a new transaction.
    pub fn new(nonce: u32, script: Vec<u8>, valid_until_block: u32) -> Self {
        Self {
            version: 0,
            nonce,
            system_fee: 0,
            network_fee: 0,
            valid_until_block,
            script,
            witnesses: Vec::new(),
        }
    }

    fn serialize_unsigned(&self, writer: &mut BinaryWriter) -> IoResult<()> {
        writer.write_u8(self.version)?;
        writer.write_u32(self.nonce)?;
        writer.write_i64(self.system_fee)?;
        writer.write_i64(self.network_fee)?;
        writer.write_u32(self.valid_until_block)?;
        writer.write_var_bytes(&self.script)
    }

    /// Returns the bytes covered by the transaction hash and signatures.
    pub fn unsigned_bytes(&self) -> Vec<u8> {
        let mut writer = BinaryWriter::new();
        // Writing into a memory buffer cannot fail.
        let _ = self.serialize_unsigned(&mut writer);
        writer.to_bytes()
    }

    /// Computes the transaction hash.
    pub fn hash(&self) -> UInt256 {
        UInt256::from(hash256(&self.unsigned_bytes()))
    }

    /// Network fee per serialized byte, used for block selection ordering.
    pub fn fee_per_byte(&self) -> i64 {
        let size = self.size() as i64;
        if size == 0 {
            0
        } else {
            self.network_fee / size
        }
    }
}

impl Serializable for Transaction {
    fn size(&self) -> usize {
        1 + 4 + 8 + 8 + 4
            + helper::get_var_bytes_size(&self.script)
            + helper::get_array_size(&self.witnesses)
    }

    fn serialize(&self, writer: &mut BinaryWriter) -> IoResult<()> {
        self.serialize_unsigned(writer)?;
        writer.write_serializable_list(&self.witnesses)
    }

    fn deserialize(reader: &mut MemoryReader) -> IoResult<Self> {
        let version = reader.read_u8()?;
        let nonce = reader.read_u32()?;
        let system_fee = reader.read_i64()?;
        let network_fee = reader.read_i64()?;
        let valid_until_block = reader.read_u32()?;
        let script = reader.read_var_bytes(MAX_TX_SCRIPT_SIZE)?;
        let witnesses = helper::deserialize_array(reader, MAX_WITNESSES)?;

        Ok(Self {
            version,
            nonce,
            system_fee,
            network_fee,
            valid_until_block,
            script,
            witnesses,
        })
    }
}

/// Maximum size of a transaction script.
pub const MAX_TX_SCRIPT_SIZE: usize = 65_536;

#[cfg(test)]
mod tests {
    use super::*;
    use dbft_io::SerializableExt;

    fn sample() -> Transaction {
        let mut tx = Transaction::new(42, vec![0x40], 1000);
        tx.network_fee = 1_000_000;
        tx.witnesses.push(Witness::new(vec![1], vec![2]));
        tx
    }

    #[test]
    fn test_roundtrip() {
        let tx = sample();
        let bytes = tx.to_array().unwrap();
        assert_eq!(bytes.len(), tx.size());
        assert_eq!(Transaction::from_array(&bytes).unwrap(), tx);
    }

    #[test]
    fn test_hash_ignores_witnesses() {
        let mut a = sample();
        let mut b = sample();
        a.witnesses.clear();
        b.witnesses = vec![Witness::new(vec![9, 9, 9], vec![8])];

        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn test_hash_covers_unsigned_fields() {
        let a = sample();
        let mut b = sample();
        b.nonce += 1;

        assert_ne!(a.hash(), b.hash());
    }
}
