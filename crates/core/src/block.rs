//! Block and block header types.

use crate::{Transaction, UInt160, UInt256, Witness};
use dbft_crypto::{hash::hash256, MerkleTree};
use dbft_io::{helper, BinaryWriter, IoResult, MemoryReader, Serializable};
use serde::{Deserialize, Serialize};

/// Maximum number of transactions accepted when deserializing a block.
const MAX_BLOCK_TRANSACTIONS: usize = 65_536;

/// A block header.
///
/// The hash covers the unsigned region (everything except the witness), so
/// the value the committee commits to is fixed before the multisig witness
/// is assembled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Block format version.
    pub version: u32,
    /// Hash of the previous block.
    pub prev_hash: UInt256,
    /// Merkle root of the transaction hashes.
    pub merkle_root: UInt256,
    /// Milliseconds since the Unix epoch; strictly increasing per chain.
    pub timestamp: u64,
    /// Random value chosen by the proposing primary.
    pub nonce: u64,
    /// Block height.
    pub index: u32,
    /// Validator index of the primary that proposed this block.
    pub primary_index: u8,
    /// Script hash of the committee multisig for the following block.
    pub next_consensus: UInt160,
    /// The committee multisig witness.
    pub witness: Witness,
}

impl BlockHeader {
    #[allow(clippy::too_many_arguments)]
    /// Creates a new header with an empty witness.
    pub fn new(
        version: u32,
        prev_hash: UInt256,
        merkle_root: UInt256,
        timestamp: u64,
        nonce: u64,
        index: u32,
        primary_index: u8,
        next_consensus: UInt160,
    ) -> Self {
        Self {
            version,
            prev_hash,
            merkle_root,
            timestamp,
            nonce,
            index,
            primary_index,
            next_consensus,
            witness: Witness::empty(),
        }
    }

    fn serialize_unsigned(&self, writer: &mut BinaryWriter) -> IoResult<()> {
        writer.write_u32(self.version)?;
        writer.write_serializable(&self.prev_hash)?;
        writer.write_serializable(&self.merkle_root)?;
        writer.write_u64(self.timestamp)?;
        writer.write_u64(self.nonce)?;
        writer.write_u32(self.index)?;
        writer.write_u8(self.primary_index)?;
        writer.write_serializable(&self.next_consensus)
    }

    /// Returns the bytes covered by the block hash and commit signatures.
    pub fn unsigned_bytes(&self) -> Vec<u8> {
        let mut writer = BinaryWriter::new();
        let _ = self.serialize_unsigned(&mut writer);
        writer.to_bytes()
    }

    /// Computes the block hash.
    pub fn hash(&self) -> UInt256 {
        UInt256::from(hash256(&self.unsigned_bytes()))
    }
}

impl Serializable for BlockHeader {
    fn size(&self) -> usize {
        4 + 32 + 32 + 8 + 8 + 4 + 1 + 20 + self.witness.size()
    }

    fn serialize(&self, writer: &mut BinaryWriter) -> IoResult<()> {
        self.serialize_unsigned(writer)?;
        writer.write_serializable(&self.witness)
    }

    fn deserialize(reader: &mut MemoryReader) -> IoResult<Self> {
        Ok(Self {
            version: reader.read_u32()?,
            prev_hash: <UInt256 as dbft_io::Serializable>::deserialize(reader)?,
            merkle_root: <UInt256 as dbft_io::Serializable>::deserialize(reader)?,
            timestamp: reader.read_u64()?,
            nonce: reader.read_u64()?,
            index: reader.read_u32()?,
            primary_index: reader.read_u8()?,
            next_consensus: <UInt160 as dbft_io::Serializable>::deserialize(reader)?,
            witness: <Witness as dbft_io::Serializable>::deserialize(reader)?,
        })
    }
}

/// A block: header plus transactions in consensus order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// The block header.
    pub header: BlockHeader,
    /// Transactions in the order the primary proposed them.
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Creates a new block.
    pub fn new(header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        Self {
            header,
            transactions,
        }
    }

    /// Returns the block hash.
    pub fn hash(&self) -> UInt256 {
        self.header.hash()
    }

    /// Returns the block height.
    pub fn index(&self) -> u32 {
        self.header.index
    }

    /// Computes the Merkle root from the attached transactions.
    pub fn compute_merkle_root(&self) -> UInt256 {
        let hashes: Vec<[u8; 32]> = self
            .transactions
            .iter()
            .map(|tx| tx.hash().to_array())
            .collect();
        UInt256::from(MerkleTree::compute_root(&hashes))
    }

    /// Checks that the header's Merkle root matches the attached
    /// transactions.
    pub fn verify_merkle_root(&self) -> bool {
        self.compute_merkle_root() == self.header.merkle_root
    }
}

impl Serializable for Block {
    fn size(&self) -> usize {
        self.header.size() + helper::get_array_size(&self.transactions)
    }

    fn serialize(&self, writer: &mut BinaryWriter) -> IoResult<()> {
        writer.write_serializable(&self.header)?;
        writer.write_serializable_list(&self.transactions)
    }

    fn deserialize(reader: &mut MemoryReader) -> IoResult<Self> {
        Ok(Self {
            header: <BlockHeader as dbft_io::Serializable>::deserialize(reader)?,
            transactions: helper::deserialize_array(reader, MAX_BLOCK_TRANSACTIONS)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbft_io::SerializableExt;

    fn sample_header() -> BlockHeader {
        BlockHeader::new(
            0,
            UInt256::from([1u8; 32]),
            UInt256::zero(),
            1_700_000_000_000,
            0xDEADBEEF,
            7,
            2,
            UInt160::from([9u8; 20]),
        )
    }

    #[test]
    fn test_header_roundtrip() {
        let mut header = sample_header();
        header.witness = Witness::new(vec![1, 2], vec![3]);

        let bytes = header.to_array().unwrap();
        assert_eq!(bytes.len(), header.size());
        assert_eq!(BlockHeader::from_array(&bytes).unwrap(), header);
    }

    #[test]
    fn test_hash_excludes_witness() {
        let mut a = sample_header();
        let mut b = sample_header();
        a.witness = Witness::empty();
        b.witness = Witness::new(vec![5; 64], vec![6; 40]);

        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn test_hash_covers_header_fields() {
        let a = sample_header();
        let mut b = sample_header();
        b.timestamp += 1;

        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn test_merkle_root_verification() {
        let tx_a = Transaction::new(1, vec![0x01], 100);
        let tx_b = Transaction::new(2, vec![0x02], 100);

        let mut block = Block::new(sample_header(), vec![tx_a, tx_b]);
        assert!(!block.verify_merkle_root());

        block.header.merkle_root = block.compute_merkle_root();
        assert!(block.verify_merkle_root());
    }

    #[test]
    fn test_block_roundtrip() {
        let tx = Transaction::new(1, vec![0x01], 100);
        let block = Block::new(sample_header(), vec![tx]);

        let bytes = block.to_array().unwrap();
        assert_eq!(Block::from_array(&bytes).unwrap(), block);
    }
}
