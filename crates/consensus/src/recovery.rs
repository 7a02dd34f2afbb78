//! Recovery protocol: catching lagging nodes up within a height.
//!
//! A responder compacts its round state into a [`RecoveryMessage`]; the
//! receiver reconstructs the original signed payloads and replays them
//! through the exact validation and accept paths used for live traffic, so
//! recovery can never smuggle in state that normal processing would refuse.

use crate::{
    context::ConsensusContext,
    messages::{
        ChangeView, ChangeViewReason, Commit, ConsensusMessage, ConsensusMessageBody,
        PrepareResponse,
    },
    ViewNumber,
};
use dbft_config::MAX_TRANSACTIONS_PER_BLOCK;
use dbft_core::{Transaction, UInt256};
use dbft_crypto::SIGNATURE_SIZE;
use dbft_io::{helper, BinaryWriter, IoResult, MemoryReader, Serializable};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Maximum entries in a compact payload list (one per validator).
const MAX_COMPACT_ENTRIES: usize = 255;

/// Maximum accepted invocation script length inside compact payloads.
const MAX_INVOCATION_SCRIPT: usize = 1024;

/// A change view request, compacted to what reconstruction needs.
///
/// The reconstructed message requests `original_view + 1`; the reason and
/// timestamp are carried so the rebuilt bytes match what the sender signed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeViewPayloadCompact {
    pub validator_index: u8,
    pub original_view: ViewNumber,
    pub timestamp: u64,
    pub reason: ChangeViewReason,
    pub invocation_script: Vec<u8>,
}

impl Serializable for ChangeViewPayloadCompact {
    fn size(&self) -> usize {
        1 + 1 + 8 + 1 + helper::get_var_bytes_size(&self.invocation_script)
    }

    fn serialize(&self, writer: &mut BinaryWriter) -> IoResult<()> {
        writer.write_u8(self.validator_index)?;
        writer.write_u8(self.original_view.value())?;
        writer.write_u64(self.timestamp)?;
        writer.write_u8(self.reason as u8)?;
        writer.write_var_bytes(&self.invocation_script)
    }

    fn deserialize(reader: &mut MemoryReader) -> IoResult<Self> {
        Ok(Self {
            validator_index: reader.read_u8()?,
            original_view: ViewNumber::new(reader.read_u8()?),
            timestamp: reader.read_u64()?,
            reason: ChangeViewReason::from_byte(reader.read_u8()?).ok_or_else(|| {
                dbft_io::IoError::invalid_format("unknown change view reason")
            })?,
            invocation_script: reader.read_var_bytes(MAX_INVOCATION_SCRIPT)?,
        })
    }
}

/// A prepare response, compacted to the sender's index and signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparationPayloadCompact {
    pub validator_index: u8,
    pub invocation_script: Vec<u8>,
}

impl Serializable for PreparationPayloadCompact {
    fn size(&self) -> usize {
        1 + helper::get_var_bytes_size(&self.invocation_script)
    }

    fn serialize(&self, writer: &mut BinaryWriter) -> IoResult<()> {
        writer.write_u8(self.validator_index)?;
        writer.write_var_bytes(&self.invocation_script)
    }

    fn deserialize(reader: &mut MemoryReader) -> IoResult<Self> {
        Ok(Self {
            validator_index: reader.read_u8()?,
            invocation_script: reader.read_var_bytes(MAX_INVOCATION_SCRIPT)?,
        })
    }
}

/// A commit, compacted to its view, index, block signature and payload
/// signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitPayloadCompact {
    pub view_number: ViewNumber,
    pub validator_index: u8,
    pub signature: Vec<u8>,
    pub invocation_script: Vec<u8>,
}

impl Serializable for CommitPayloadCompact {
    fn size(&self) -> usize {
        1 + 1 + SIGNATURE_SIZE + helper::get_var_bytes_size(&self.invocation_script)
    }

    fn serialize(&self, writer: &mut BinaryWriter) -> IoResult<()> {
        writer.write_u8(self.view_number.value())?;
        writer.write_u8(self.validator_index)?;
        writer.write_bytes(&self.signature)?;
        writer.write_var_bytes(&self.invocation_script)
    }

    fn deserialize(reader: &mut MemoryReader) -> IoResult<Self> {
        Ok(Self {
            view_number: ViewNumber::new(reader.read_u8()?),
            validator_index: reader.read_u8()?,
            signature: reader.read_bytes(SIGNATURE_SIZE)?.to_vec(),
            invocation_script: reader.read_var_bytes(MAX_INVOCATION_SCRIPT)?,
        })
    }
}

/// The compacted round state a responder sends to a lagging node.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RecoveryMessage {
    /// Change view requests seen this round.
    pub change_view_payloads: Vec<ChangeViewPayloadCompact>,
    /// The primary's signed prepare request, if seen.
    pub prepare_request: Option<Box<ConsensusMessage>>,
    /// The preparation hash responses point at, carried when the request
    /// itself is absent.
    pub preparation_hash: Option<UInt256>,
    /// Prepare responses at the responder's view.
    pub preparation_payloads: Vec<PreparationPayloadCompact>,
    /// Commits at the responder's view.
    pub commit_payloads: Vec<CommitPayloadCompact>,
    /// Transactions named by the prepare request, as far as resolved.
    /// Optional: the receiver falls back to its mempool and getdata.
    pub transactions: Vec<Transaction>,
}

impl RecoveryMessage {
    /// Compacts the given context into a recovery message.
    pub fn from_context(context: &ConsensusContext) -> Self {
        let mut message = RecoveryMessage::default();

        let mut change_views: Vec<_> = context.change_views().iter().collect();
        change_views.sort_by_key(|(index, _)| **index);
        for (index, stored) in change_views {
            if let ConsensusMessageBody::ChangeView(cv) = &stored.body {
                message.change_view_payloads.push(ChangeViewPayloadCompact {
                    validator_index: *index as u8,
                    original_view: stored.view_number,
                    timestamp: cv.timestamp,
                    reason: cv.reason,
                    invocation_script: stored.invocation_script.clone(),
                });
            }
        }

        message.prepare_request = context.prepare_request().cloned().map(Box::new);
        if message.prepare_request.is_none() {
            // Responses still carry the hash they point at.
            message.preparation_hash = context.preparations().values().find_map(|m| {
                match &m.body {
                    ConsensusMessageBody::PrepareResponse(r) => Some(r.preparation_hash),
                    _ => None,
                }
            });
        }

        let mut preparations: Vec<_> = context.preparations().iter().collect();
        preparations.sort_by_key(|(index, _)| **index);
        for (index, stored) in preparations {
            if matches!(stored.body, ConsensusMessageBody::PrepareResponse(_)) {
                message.preparation_payloads.push(PreparationPayloadCompact {
                    validator_index: *index as u8,
                    invocation_script: stored.invocation_script.clone(),
                });
            }
        }

        let mut commits: Vec<_> = context.commits().iter().collect();
        commits.sort_by_key(|(index, _)| **index);
        for (index, stored) in commits {
            if let ConsensusMessageBody::Commit(commit) = &stored.body {
                message.commit_payloads.push(CommitPayloadCompact {
                    view_number: stored.view_number,
                    validator_index: *index as u8,
                    signature: commit.signature.clone(),
                    invocation_script: stored.invocation_script.clone(),
                });
            }
        }

        for hash in context.tx_hashes() {
            if let Some(tx) = context.get_transaction(hash) {
                message.transactions.push(tx.clone());
            }
        }

        message
    }

    /// The hash responses point at: explicit, or derived from the carried
    /// prepare request.
    pub fn preparation_hash(&self) -> Option<UInt256> {
        self.preparation_hash
            .or_else(|| self.prepare_request.as_ref().map(|m| m.hash()))
    }

    /// Rebuilds the change view messages exactly as their senders signed
    /// them.
    pub fn change_view_messages(&self, block_index: u32) -> Vec<ConsensusMessage> {
        self.change_view_payloads
            .iter()
            .map(|compact| {
                let mut message = ConsensusMessage::new(
                    block_index,
                    compact.validator_index,
                    compact.original_view,
                    ConsensusMessageBody::ChangeView(ChangeView {
                        new_view_number: compact.original_view.next(),
                        timestamp: compact.timestamp,
                        reason: compact.reason,
                    }),
                );
                message.invocation_script = compact.invocation_script.clone();
                message
            })
            .collect()
    }

    /// Rebuilds the prepare response messages at the responder's view.
    pub fn prepare_response_messages(
        &self,
        block_index: u32,
        view: ViewNumber,
    ) -> Vec<ConsensusMessage> {
        let Some(preparation_hash) = self.preparation_hash() else {
            return Vec::new();
        };

        self.preparation_payloads
            .iter()
            .map(|compact| {
                let mut message = ConsensusMessage::new(
                    block_index,
                    compact.validator_index,
                    view,
                    ConsensusMessageBody::PrepareResponse(PrepareResponse { preparation_hash }),
                );
                message.invocation_script = compact.invocation_script.clone();
                message
            })
            .collect()
    }

    /// Rebuilds the commit messages.
    pub fn commit_messages(&self, block_index: u32) -> Vec<ConsensusMessage> {
        self.commit_payloads
            .iter()
            .filter(|compact| compact.signature.len() == SIGNATURE_SIZE)
            .map(|compact| {
                let mut signature = [0u8; SIGNATURE_SIZE];
                signature.copy_from_slice(&compact.signature);
                let mut message = ConsensusMessage::new(
                    block_index,
                    compact.validator_index,
                    compact.view_number,
                    ConsensusMessageBody::Commit(Commit::new(signature)),
                );
                message.invocation_script = compact.invocation_script.clone();
                message
            })
            .collect()
    }
}

impl Serializable for RecoveryMessage {
    fn size(&self) -> usize {
        helper::get_array_size(&self.change_view_payloads)
            + 1
            + self.prepare_request.as_ref().map_or(0, |m| m.size())
            + 1
            + self.preparation_hash.map_or(0, |_| 32)
            + helper::get_array_size(&self.preparation_payloads)
            + helper::get_array_size(&self.commit_payloads)
            + helper::get_array_size(&self.transactions)
    }

    fn serialize(&self, writer: &mut BinaryWriter) -> IoResult<()> {
        helper::serialize_array(&self.change_view_payloads, writer)?;

        match &self.prepare_request {
            Some(request) => {
                writer.write_u8(1)?;
                request.serialize(writer)?;
            }
            None => writer.write_u8(0)?,
        }

        match &self.preparation_hash {
            Some(hash) => {
                writer.write_u8(1)?;
                writer.write_serializable(hash)?;
            }
            None => writer.write_u8(0)?,
        }

        helper::serialize_array(&self.preparation_payloads, writer)?;
        helper::serialize_array(&self.commit_payloads, writer)?;
        helper::serialize_array(&self.transactions, writer)
    }

    fn deserialize(reader: &mut MemoryReader) -> IoResult<Self> {
        let change_view_payloads = helper::deserialize_array(reader, MAX_COMPACT_ENTRIES)?;

        let prepare_request = if reader.read_u8()? != 0 {
            Some(Box::new(ConsensusMessage::deserialize(reader)?))
        } else {
            None
        };

        let preparation_hash = if reader.read_u8()? != 0 {
            Some(UInt256::deserialize(reader)?)
        } else {
            None
        };

        Ok(Self {
            change_view_payloads,
            prepare_request,
            preparation_hash,
            preparation_payloads: helper::deserialize_array(reader, MAX_COMPACT_ENTRIES)?,
            commit_payloads: helper::deserialize_array(reader, MAX_COMPACT_ENTRIES)?,
            transactions: helper::deserialize_array(reader, MAX_TRANSACTIONS_PER_BLOCK)?,
        })
    }
}

/// Rate limiter for recovery replies: at most one per `(requester, height)`
/// per window.
#[derive(Debug)]
pub struct RecoveryReplyLimiter {
    window: Duration,
    last_reply: HashMap<(u8, u32), Instant>,
}

impl RecoveryReplyLimiter {
    /// Creates a limiter with the given window.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_reply: HashMap::new(),
        }
    }

    /// Returns whether a reply to `requester` at `height` is allowed now,
    /// recording it if so.
    pub fn allow(&mut self, requester: u8, height: u32) -> bool {
        let now = Instant::now();
        self.prune(now);

        match self.last_reply.get(&(requester, height)) {
            Some(last) if now.duration_since(*last) < self.window => false,
            _ => {
                self.last_reply.insert((requester, height), now);
                true
            }
        }
    }

    fn prune(&mut self, now: Instant) {
        if self.last_reply.len() > 1024 {
            let window = self.window;
            self.last_reply
                .retain(|_, last| now.duration_since(*last) < window);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbft_io::SerializableExt;

    fn sample() -> RecoveryMessage {
        let mut message = RecoveryMessage::default();
        message.change_view_payloads.push(ChangeViewPayloadCompact {
            validator_index: 3,
            original_view: ViewNumber::new(0),
            timestamp: 1_700_000_000_000,
            reason: ChangeViewReason::Timeout,
            invocation_script: vec![0xAB; 64],
        });
        message.preparation_hash = Some(UInt256::from([5u8; 32]));
        message.preparation_payloads.push(PreparationPayloadCompact {
            validator_index: 1,
            invocation_script: vec![0xCD; 64],
        });
        message.commit_payloads.push(CommitPayloadCompact {
            view_number: ViewNumber::new(1),
            validator_index: 2,
            signature: vec![0xEF; 64],
            invocation_script: vec![0x12; 64],
        });
        message.transactions.push(Transaction::new(9, vec![0x01], 50));
        message
    }

    #[test]
    fn test_roundtrip() {
        let message = sample();
        let bytes = message.to_array().unwrap();
        assert_eq!(bytes.len(), message.size());
        assert_eq!(RecoveryMessage::from_array(&bytes).unwrap(), message);
    }

    #[test]
    fn test_empty_roundtrip() {
        let message = RecoveryMessage::default();
        let bytes = message.to_array().unwrap();
        assert_eq!(RecoveryMessage::from_array(&bytes).unwrap(), message);
    }

    #[test]
    fn test_change_view_reconstruction() {
        let message = sample();
        let rebuilt = message.change_view_messages(42);
        assert_eq!(rebuilt.len(), 1);

        let cv = &rebuilt[0];
        assert_eq!(cv.block_index, 42);
        assert_eq!(cv.validator_index, 3);
        assert_eq!(cv.view_number, ViewNumber::new(0));
        match &cv.body {
            ConsensusMessageBody::ChangeView(body) => {
                assert_eq!(body.new_view_number, ViewNumber::new(1));
                assert_eq!(body.reason, ChangeViewReason::Timeout);
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn test_response_reconstruction_needs_preparation_hash() {
        let mut message = sample();
        let rebuilt = message.prepare_response_messages(42, ViewNumber::new(0));
        assert_eq!(rebuilt.len(), 1);

        message.preparation_hash = None;
        assert!(message
            .prepare_response_messages(42, ViewNumber::new(0))
            .is_empty());
    }

    #[test]
    fn test_commit_reconstruction() {
        let message = sample();
        let rebuilt = message.commit_messages(42);
        assert_eq!(rebuilt.len(), 1);
        assert_eq!(rebuilt[0].view_number, ViewNumber::new(1));
        match &rebuilt[0].body {
            ConsensusMessageBody::Commit(commit) => {
                assert_eq!(commit.signature, vec![0xEF; 64]);
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn test_reply_limiter() {
        let mut limiter = RecoveryReplyLimiter::new(Duration::from_secs(60));

        assert!(limiter.allow(1, 100));
        assert!(!limiter.allow(1, 100));

        // Different requester or height is a separate budget.
        assert!(limiter.allow(2, 100));
        assert!(limiter.allow(1, 101));
    }

    #[test]
    fn test_reply_limiter_zero_window() {
        let mut limiter = RecoveryReplyLimiter::new(Duration::from_millis(0));
        assert!(limiter.allow(1, 1));
        assert!(limiter.allow(1, 1));
    }
}
