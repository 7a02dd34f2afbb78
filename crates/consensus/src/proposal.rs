//! Transaction selection and block assembly.

use crate::{
    context::ConsensusContext,
    messages::ConsensusMessageBody,
    validators::{multisig_redeem_script, opcode},
    Error, Result,
};
use dbft_core::{Block, Transaction, Witness};
use dbft_crypto::SIGNATURE_SIZE;
use dbft_io::Serializable;

/// Serialized bytes reserved for the header and witness when filling a
/// block with transactions.
const BLOCK_OVERHEAD: usize = 1024;

/// Selects transactions for a proposal under the count and size limits.
///
/// Candidates are expected in mempool policy order (highest priority
/// first); selection preserves that order and stops at the first
/// transaction that would overflow the block.
pub fn select_transactions(
    candidates: Vec<Transaction>,
    max_count: usize,
    max_block_size: usize,
) -> Vec<Transaction> {
    let budget = max_block_size.saturating_sub(BLOCK_OVERHEAD);
    let mut selected = Vec::new();
    let mut total_size = 0usize;

    for tx in candidates.into_iter().take(max_count) {
        let tx_size = tx.size();
        if total_size + tx_size > budget {
            break;
        }
        total_size += tx_size;
        selected.push(tx);
    }

    selected
}

/// Assembles the finalized block from a context holding the prepare
/// request, every named transaction, and `M` verified commits.
///
/// The witness invocation script concatenates the commit signatures in
/// ascending validator-index order, exactly `M` of them; the verification
/// script is the committee's M-of-N multisig script. The resulting block
/// hash is the value the commits signed, and the Merkle root is recomputed
/// from the actual transactions.
pub fn assemble_block(context: &ConsensusContext) -> Result<Block> {
    let mut header = context
        .make_header()
        .ok_or_else(|| Error::InvalidState("no prepare request for this round".to_string()))?;

    let transactions = context.ordered_transactions().ok_or_else(|| {
        Error::MissingTransactions(context.missing_transactions().len())
    })?;

    let m = context.quorum();
    if context.commits().len() < m {
        return Err(Error::InvalidState(format!(
            "only {} of {} required commits",
            context.commits().len(),
            m
        )));
    }

    let mut indices: Vec<u16> = context.commits().keys().copied().collect();
    indices.sort_unstable();

    let mut invocation = Vec::with_capacity(m * (SIGNATURE_SIZE + 2));
    for index in indices.into_iter().take(m) {
        let commit = &context.commits()[&index];
        let signature = match &commit.body {
            ConsensusMessageBody::Commit(c) => &c.signature,
            _ => {
                return Err(Error::InvalidState(
                    "non-commit payload in commit collection".to_string(),
                ))
            }
        };
        invocation.push(opcode::PUSHDATA1);
        invocation.push(SIGNATURE_SIZE as u8);
        invocation.extend_from_slice(signature);
    }

    let verification = multisig_redeem_script(m, context.validators().keys())?;
    header.witness = Witness::new(invocation, verification);

    let block = Block::new(header, transactions);
    debug_assert!(block.verify_merkle_root());
    Ok(block)
}
