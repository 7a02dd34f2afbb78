//! Consensus round state.
//!
//! One [`ConsensusContext`] holds everything collected for the current
//! `(height, view)` round. It is a pure state container owned exclusively
//! by the engine: mutations only happen through the `accept_*` operations,
//! and the context itself never performs I/O. Keeping it single-owner (no
//! interior locks) rules out partial-update races during view changes.

use crate::{
    dbft::ConsensusPhase,
    messages::{block_signing_data, ConsensusMessageBody},
    ConsensusMessage, Error, Result, ValidatorSet, ViewNumber,
};
use dbft_core::{BlockHeader, Transaction, UInt160, UInt256};
use dbft_crypto::{ECPoint, MerkleTree};
use std::collections::{HashMap, HashSet};

/// Outcome of feeding a payload into the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acceptance {
    /// The payload was stored; `quorum` reports whether its collection now
    /// meets the `M` threshold.
    Accepted { quorum: bool },
    /// An identical payload was already stored; nothing changed.
    AlreadyKnown,
    /// The payload was dropped without state change.
    Ignored,
}

impl Acceptance {
    /// Whether the payload was newly stored.
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }

    /// Whether the payload completed a quorum.
    pub fn reached_quorum(&self) -> bool {
        matches!(self, Self::Accepted { quorum: true })
    }
}

/// The header fields fixed by a prepare request, before the Merkle root
/// and witness are known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderDraft {
    pub version: u32,
    pub prev_hash: UInt256,
    pub timestamp: u64,
    pub nonce: u64,
    pub index: u32,
    pub primary_index: u8,
    pub next_consensus: UInt160,
}

impl HeaderDraft {
    /// Completes the draft into a header with the given Merkle root.
    pub fn to_header(&self, merkle_root: UInt256) -> BlockHeader {
        BlockHeader::new(
            self.version,
            self.prev_hash,
            merkle_root,
            self.timestamp,
            self.nonce,
            self.index,
            self.primary_index,
            self.next_consensus,
        )
    }
}

/// In-memory state of the current consensus round.
pub struct ConsensusContext {
    network_magic: u32,
    height: u32,
    view: ViewNumber,
    validators: ValidatorSet,
    my_index: Option<u16>,
    prev_hash: UInt256,
    prev_timestamp: u64,
    next_consensus: UInt160,
    phase: ConsensusPhase,
    header_draft: Option<HeaderDraft>,
    tx_hashes: Vec<UInt256>,
    transactions: HashMap<UInt256, Transaction>,
    preparations: HashMap<u16, ConsensusMessage>,
    commits: HashMap<u16, ConsensusMessage>,
    change_views: HashMap<u16, ConsensusMessage>,
    last_seen: HashMap<u16, (u32, ViewNumber)>,
    faulty: HashSet<u16>,
}

impl ConsensusContext {
    /// Creates an empty context bound to a network.
    pub fn new(network_magic: u32) -> Self {
        Self {
            network_magic,
            height: 0,
            view: ViewNumber::default(),
            validators: ValidatorSet::new(Vec::new()),
            my_index: None,
            prev_hash: UInt256::zero(),
            prev_timestamp: 0,
            next_consensus: UInt160::zero(),
            phase: ConsensusPhase::Initial,
            header_draft: None,
            tx_hashes: Vec::new(),
            transactions: HashMap::new(),
            preparations: HashMap::new(),
            commits: HashMap::new(),
            change_views: HashMap::new(),
            last_seen: HashMap::new(),
            faulty: HashSet::new(),
        }
    }

    /// Resets the context for a new height at view 0.
    pub fn reset(
        &mut self,
        height: u32,
        prev_hash: UInt256,
        prev_timestamp: u64,
        validators: ValidatorSet,
        my_key: Option<&ECPoint>,
        next_consensus: UInt160,
    ) {
        self.height = height;
        self.view = ViewNumber::new(0);
        self.my_index = my_key.and_then(|key| validators.index_of(key));
        self.validators = validators;
        self.prev_hash = prev_hash;
        self.prev_timestamp = prev_timestamp;
        self.next_consensus = next_consensus;
        self.phase = ConsensusPhase::Initial;
        self.header_draft = None;
        self.tx_hashes.clear();
        self.transactions.clear();
        self.preparations.clear();
        self.commits.clear();
        self.change_views.clear();
        self.faulty.clear();
    }

    /// Resets the per-view collections for a committed view change. The
    /// height, committee and resolved transactions are preserved.
    pub fn reset_for_view(&mut self, new_view: ViewNumber) {
        self.view = new_view;
        self.phase = ConsensusPhase::Initial;
        self.header_draft = None;
        self.tx_hashes.clear();
        self.preparations.clear();
        self.commits.clear();
        self.change_views.clear();
        self.faulty.clear();
    }

    // --- plain accessors ---

    pub fn network_magic(&self) -> u32 {
        self.network_magic
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn view(&self) -> ViewNumber {
        self.view
    }

    pub fn validators(&self) -> &ValidatorSet {
        &self.validators
    }

    pub fn my_index(&self) -> Option<u16> {
        self.my_index
    }

    pub fn prev_hash(&self) -> UInt256 {
        self.prev_hash
    }

    pub fn prev_timestamp(&self) -> u64 {
        self.prev_timestamp
    }

    pub fn phase(&self) -> ConsensusPhase {
        self.phase
    }

    pub fn set_phase(&mut self, phase: ConsensusPhase) {
        self.phase = phase;
    }

    /// Index of the primary for the current view.
    pub fn primary_index(&self) -> u16 {
        self.validators.primary_index(self.height, self.view)
    }

    /// Whether the local node is the current primary.
    pub fn is_primary(&self) -> bool {
        self.my_index == Some(self.primary_index())
    }

    /// Whether the local node sits in the committee.
    pub fn is_validator(&self) -> bool {
        self.my_index.is_some()
    }

    /// Quorum `M` for the current committee.
    pub fn quorum(&self) -> usize {
        self.validators.quorum()
    }

    /// Byzantine bound `f` for the current committee.
    pub fn byzantine_threshold(&self) -> usize {
        self.validators.byzantine_threshold()
    }

    /// Whether the given validator has been marked faulty this round.
    pub fn is_faulty(&self, index: u16) -> bool {
        self.faulty.contains(&index)
    }

    // --- payload acceptance ---

    /// Stores a preparation (the primary's request or a backup's response).
    ///
    /// A second, different preparation from the same validator is
    /// equivocation: the offender is marked faulty for the round, its prior
    /// valid contribution remains counted, and `Error::Equivocation` is
    /// returned.
    pub fn accept_preparation(
        &mut self,
        index: u16,
        message: ConsensusMessage,
    ) -> Result<Acceptance> {
        if self.faulty.contains(&index) {
            return Ok(Acceptance::Ignored);
        }

        if let Some(existing) = self.preparations.get(&index) {
            if existing.hash() == message.hash() {
                return Ok(Acceptance::AlreadyKnown);
            }
            self.faulty.insert(index);
            return Err(Error::Equivocation(index));
        }

        let is_primary_slot = index == self.primary_index();
        match &message.body {
            ConsensusMessageBody::PrepareRequest(request) => {
                if !is_primary_slot {
                    return Err(Error::UnexpectedPrimary(index));
                }

                self.tx_hashes = request.transaction_hashes.clone();
                self.header_draft = Some(HeaderDraft {
                    version: request.version,
                    prev_hash: request.prev_hash,
                    timestamp: request.timestamp,
                    nonce: request.nonce,
                    index: self.height,
                    primary_index: index as u8,
                    next_consensus: self.next_consensus,
                });

                // Responses collected before the request are only valid if
                // they point at this request.
                let request_hash = message.hash();
                self.preparations.retain(|_, existing| {
                    match &existing.body {
                        ConsensusMessageBody::PrepareResponse(response) => {
                            response.preparation_hash == request_hash
                        }
                        _ => true,
                    }
                });
            }
            ConsensusMessageBody::PrepareResponse(response) => {
                if is_primary_slot {
                    return Err(Error::Malformed(
                        "prepare response from the primary slot".to_string(),
                    ));
                }
                if let Some(request) = self.prepare_request() {
                    if response.preparation_hash != request.hash() {
                        return Ok(Acceptance::Ignored);
                    }
                }
            }
            _ => {
                return Err(Error::Malformed(
                    "not a preparation payload".to_string(),
                ));
            }
        }

        self.preparations.insert(index, message);
        Ok(Acceptance::Accepted {
            quorum: self.preparation_quorum(),
        })
    }

    /// Whether `M` consistent preparations (request included) are present.
    pub fn preparation_quorum(&self) -> bool {
        self.prepare_request().is_some() && self.preparations.len() >= self.quorum()
    }

    /// The primary's prepare request for this view, if known.
    pub fn prepare_request(&self) -> Option<&ConsensusMessage> {
        self.preparations
            .get(&self.primary_index())
            .filter(|m| matches!(m.body, ConsensusMessageBody::PrepareRequest(_)))
    }

    /// Stores a commit after verifying its signature over the block hash.
    ///
    /// Commits are only acceptable once the prepare request fixed the block
    /// contents; before that the block hash does not exist.
    pub fn accept_commit(&mut self, index: u16, message: ConsensusMessage) -> Result<Acceptance> {
        if self.faulty.contains(&index) {
            return Ok(Acceptance::Ignored);
        }

        if let Some(existing) = self.commits.get(&index) {
            if existing.hash() == message.hash() {
                return Ok(Acceptance::AlreadyKnown);
            }
            self.faulty.insert(index);
            return Err(Error::Equivocation(index));
        }

        let signature = match &message.body {
            ConsensusMessageBody::Commit(commit) => commit.signature.clone(),
            _ => return Err(Error::Malformed("not a commit payload".to_string())),
        };

        let block_hash = self.block_hash().ok_or_else(|| {
            Error::InvalidState("commit received before prepare request".to_string())
        })?;

        let key = self
            .validators
            .get(index)
            .ok_or(Error::WrongHeightOrView)?;
        let signing_data = block_signing_data(self.network_magic, &block_hash);
        if !key.verify(&signing_data, &signature) {
            return Err(Error::BadSignature(index));
        }

        self.commits.insert(index, message);
        Ok(Acceptance::Accepted {
            quorum: self.commit_quorum(),
        })
    }

    /// Whether `M` verified commits are present.
    pub fn commit_quorum(&self) -> bool {
        self.commits.len() >= self.quorum()
    }

    /// Stores a change view request, keeping the highest `new_view` seen
    /// per validator. Returns the smallest view above the current one that
    /// now has a committed quorum, if any.
    pub fn accept_change_view(
        &mut self,
        index: u16,
        message: ConsensusMessage,
    ) -> Result<Option<ViewNumber>> {
        if self.faulty.contains(&index) {
            return Ok(None);
        }

        let new_view = match &message.body {
            ConsensusMessageBody::ChangeView(cv) => cv.new_view_number,
            _ => return Err(Error::Malformed("not a change view payload".to_string())),
        };

        let keep = match self.change_views.get(&index) {
            Some(existing) => match &existing.body {
                ConsensusMessageBody::ChangeView(cv) => new_view > cv.new_view_number,
                _ => true,
            },
            None => true,
        };
        if keep {
            self.change_views.insert(index, message);
        }

        Ok(self.committed_view_change())
    }

    /// The smallest `v' > view` for which at least `M` validators request a
    /// view of at least `v'`.
    pub fn committed_view_change(&self) -> Option<ViewNumber> {
        let mut candidates: Vec<ViewNumber> = self
            .change_views
            .values()
            .filter_map(|m| match &m.body {
                ConsensusMessageBody::ChangeView(cv) => Some(cv.new_view_number),
                _ => None,
            })
            .filter(|v| *v > self.view)
            .collect();
        candidates.sort();
        candidates.dedup();

        candidates
            .into_iter()
            .find(|candidate| self.count_change_views_at_least(*candidate) >= self.quorum())
    }

    /// Number of validators whose highest change view request is `>= view`.
    pub fn count_change_views_at_least(&self, view: ViewNumber) -> usize {
        self.change_views
            .values()
            .filter(|m| match &m.body {
                ConsensusMessageBody::ChangeView(cv) => cv.new_view_number >= view,
                _ => false,
            })
            .count()
    }

    // --- block construction ---

    /// The block hash commits sign, defined once the prepare request fixed
    /// the header draft and transaction list.
    pub fn block_hash(&self) -> Option<UInt256> {
        self.make_header().map(|header| header.hash())
    }

    /// Builds the unsigned header from the draft and the Merkle root of the
    /// proposed transaction hashes.
    pub fn make_header(&self) -> Option<BlockHeader> {
        let draft = self.header_draft.as_ref()?;
        let leaves: Vec<[u8; 32]> = self.tx_hashes.iter().map(|h| h.to_array()).collect();
        let merkle_root = UInt256::from(MerkleTree::compute_root(&leaves));
        Some(draft.to_header(merkle_root))
    }

    /// The header draft fixed by the prepare request.
    pub fn header_draft(&self) -> Option<&HeaderDraft> {
        self.header_draft.as_ref()
    }

    /// Hashes of the transactions proposed for this block, in block order.
    pub fn tx_hashes(&self) -> &[UInt256] {
        &self.tx_hashes
    }

    // --- transaction tracking ---

    /// Records a resolved transaction. Returns whether the proposal names
    /// this transaction.
    pub fn register_transaction(&mut self, transaction: Transaction) -> bool {
        let hash = transaction.hash();
        let wanted = self.tx_hashes.contains(&hash);
        if wanted {
            self.transactions.entry(hash).or_insert(transaction);
        }
        wanted
    }

    /// Hashes named by the proposal and not yet resolved.
    pub fn missing_transactions(&self) -> Vec<UInt256> {
        self.tx_hashes
            .iter()
            .filter(|hash| !self.transactions.contains_key(hash))
            .copied()
            .collect()
    }

    /// Whether every named transaction has been resolved.
    pub fn has_all_transactions(&self) -> bool {
        self.tx_hashes
            .iter()
            .all(|hash| self.transactions.contains_key(hash))
    }

    /// The resolved transactions in proposal order, once complete.
    pub fn ordered_transactions(&self) -> Option<Vec<Transaction>> {
        self.tx_hashes
            .iter()
            .map(|hash| self.transactions.get(hash).cloned())
            .collect()
    }

    /// A resolved transaction by hash.
    pub fn get_transaction(&self, hash: &UInt256) -> Option<&Transaction> {
        self.transactions.get(hash)
    }

    // --- collections exposed for recovery ---

    pub fn preparations(&self) -> &HashMap<u16, ConsensusMessage> {
        &self.preparations
    }

    pub fn commits(&self) -> &HashMap<u16, ConsensusMessage> {
        &self.commits
    }

    pub fn change_views(&self) -> &HashMap<u16, ConsensusMessage> {
        &self.change_views
    }

    // --- peer watermarks ---

    /// Records the highest `(height, view)` seen from a validator, used to
    /// throttle recovery replies.
    pub fn note_seen(&mut self, index: u16, height: u32, view: ViewNumber) {
        let entry = self.last_seen.entry(index).or_insert((height, view));
        if (height, view) > *entry {
            *entry = (height, view);
        }
    }

    /// The highest `(height, view)` seen from a validator.
    pub fn last_seen(&self, index: u16) -> Option<(u32, ViewNumber)> {
        self.last_seen.get(&index).copied()
    }
}
