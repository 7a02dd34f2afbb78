//! Script witness attached to transactions, blocks and payloads.

use crate::UInt160;
use dbft_crypto::hash::hash160;
use dbft_io::{helper, BinaryWriter, IoResult, MemoryReader, Serializable};
use serde::{Deserialize, Serialize};

/// Upper bound on either witness script, shared with the network layer.
pub const MAX_WITNESS_SCRIPT_SIZE: usize = 65_536;

/// A witness: the invocation script that supplies signatures and the
/// verification script they satisfy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Witness {
    /// Pushes the signatures consumed by the verification script.
    pub invocation_script: Vec<u8>,
    /// The script whose hash identifies the signer.
    pub verification_script: Vec<u8>,
}

impl Witness {
    /// Creates a new witness.
    pub fn new(invocation_script: Vec<u8>, verification_script: Vec<u8>) -> Self {
        Self {
            invocation_script,
            verification_script,
        }
    }

    /// Creates an empty witness.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns whether both scripts are empty.
    pub fn is_empty(&self) -> bool {
        self.invocation_script.is_empty() && self.verification_script.is_empty()
    }

    /// Returns the script hash of the verification script, which identifies
    /// the account that produced this witness.
    pub fn script_hash(&self) -> UInt160 {
        UInt160::from(hash160(&self.verification_script))
    }
}

impl Serializable for Witness {
    fn size(&self) -> usize {
        helper::get_var_bytes_size(&self.invocation_script)
            + helper::get_var_bytes_size(&self.verification_script)
    }

    fn serialize(&self, writer: &mut BinaryWriter) -> IoResult<()> {
        writer.write_var_bytes(&self.invocation_script)?;
        writer.write_var_bytes(&self.verification_script)
    }

    fn deserialize(reader: &mut MemoryReader) -> IoResult<Self> {
        Ok(Self {
            invocation_script: reader.read_var_bytes(MAX_WITNESS_SCRIPT_SIZE)?,
            verification_script: reader.read_var_bytes(MAX_WITNESS_SCRIPT_SIZE)?,
        })
    }
}
