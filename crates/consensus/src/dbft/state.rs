//! Phase definitions, statistics, and events for the dBFT engine.

use crate::{messages::ChangeViewReason, ViewNumber};
use dbft_core::UInt256;
use serde::{Deserialize, Serialize};

/// Phase of the current `(height, view)` round.
///
/// Within a round the phase only moves forward, except for the orthogonal
/// transition into `ViewChanging`. A node in `CommitSent` is locked: it can
/// leave only by the block persisting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusPhase {
    /// Round created, role not yet taken.
    Initial,
    /// This node is the primary and is building its proposal.
    Primary,
    /// This node is a backup waiting for the primary's proposal.
    Backup,
    /// Primary: proposal signed and broadcast.
    RequestSent,
    /// Backup: proposal received, transactions still resolving.
    RequestReceived,
    /// Backup: proposal validated and response broadcast.
    ResponseSent,
    /// Commit signed and broadcast; locked on this block.
    CommitSent,
    /// Block assembled and handed to the ledger.
    BlockSent,
    /// Change view requested, waiting for the quorum to agree.
    ViewChanging,
}

impl ConsensusPhase {
    /// Whether this node is locked on a commit and must not change view.
    pub fn is_locked(&self) -> bool {
        matches!(self, Self::CommitSent | Self::BlockSent)
    }

    /// Whether a prepare request is still acceptable in this phase.
    pub fn awaiting_request(&self) -> bool {
        matches!(self, Self::Initial | Self::Backup | Self::ViewChanging)
    }

    /// Whether this node has already broadcast its own preparation.
    pub fn preparation_sent(&self) -> bool {
        matches!(
            self,
            Self::RequestSent | Self::ResponseSent | Self::CommitSent | Self::BlockSent
        )
    }
}

impl std::fmt::Display for ConsensusPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsensusPhase::Initial => write!(f, "Initial"),
            ConsensusPhase::Primary => write!(f, "Primary"),
            ConsensusPhase::Backup => write!(f, "Backup"),
            ConsensusPhase::RequestSent => write!(f, "RequestSent"),
            ConsensusPhase::RequestReceived => write!(f, "RequestReceived"),
            ConsensusPhase::ResponseSent => write!(f, "ResponseSent"),
            ConsensusPhase::CommitSent => write!(f, "CommitSent"),
            ConsensusPhase::BlockSent => write!(f, "BlockSent"),
            ConsensusPhase::ViewChanging => write!(f, "ViewChanging"),
        }
    }
}

/// Engine statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbftStats {
    /// Total consensus rounds started.
    pub consensus_rounds: u64,
    /// Total blocks this node handed to the ledger.
    pub blocks_produced: u64,
    /// Total committed view changes.
    pub view_changes: u64,
    /// Total round timer expiries.
    pub timeouts: u64,
    /// Validators marked faulty for equivocation.
    pub equivocations: u64,
    /// Total payloads received.
    pub messages_received: u64,
    /// Payloads dropped before reaching the state machine.
    pub messages_dropped: u64,
    /// Recovery requests broadcast by this node.
    pub recovery_requests_sent: u64,
    /// Recovery replies broadcast by this node.
    pub recovery_replies_sent: u64,
    /// Recovery replies suppressed by the rate limiter.
    pub recovery_replies_throttled: u64,
    /// Observed safety violations (never acted on).
    pub safety_violations: u64,
    /// Exponential moving average of consensus time per block.
    pub avg_consensus_time_ms: f64,
    /// Height currently being agreed on.
    pub current_height: u32,
    /// View currently active.
    pub current_view: u8,
}

impl Default for DbftStats {
    fn default() -> Self {
        Self {
            consensus_rounds: 0,
            blocks_produced: 0,
            view_changes: 0,
            timeouts: 0,
            equivocations: 0,
            messages_received: 0,
            messages_dropped: 0,
            recovery_requests_sent: 0,
            recovery_replies_sent: 0,
            recovery_replies_throttled: 0,
            safety_violations: 0,
            avg_consensus_time_ms: 0.0,
            current_height: 0,
            current_view: 0,
        }
    }
}

impl DbftStats {
    /// Records a block handed to the ledger, folding the round duration
    /// into the moving average.
    pub fn record_block_produced(&mut self, consensus_time_ms: u64) {
        self.blocks_produced += 1;

        let alpha = 0.1;
        if self.avg_consensus_time_ms == 0.0 {
            self.avg_consensus_time_ms = consensus_time_ms as f64;
        } else {
            self.avg_consensus_time_ms =
                alpha * (consensus_time_ms as f64) + (1.0 - alpha) * self.avg_consensus_time_ms;
        }
    }

    /// Fraction of received payloads that survived validation.
    pub fn message_validity_rate(&self) -> f64 {
        if self.messages_received == 0 {
            return 100.0;
        }
        ((self.messages_received - self.messages_dropped) as f64 / self.messages_received as f64)
            * 100.0
    }
}

/// Events emitted by the engine for observers.
#[derive(Debug, Clone)]
pub enum DbftEvent {
    /// This node proposed a block as primary.
    BlockProposed {
        block_index: u32,
        block_hash: UInt256,
        transaction_count: usize,
    },
    /// A finalized block was handed to the ledger.
    BlockCommitted {
        block_index: u32,
        block_hash: UInt256,
        consensus_time_ms: u64,
    },
    /// A view change committed.
    ViewChanged {
        block_index: u32,
        old_view: ViewNumber,
        new_view: ViewNumber,
        reason: ChangeViewReason,
    },
    /// The round timer expired.
    TimeoutFired {
        block_index: u32,
        view: ViewNumber,
        phase: ConsensusPhase,
    },
    /// This node solicited round state from its peers.
    RecoveryRequested { block_index: u32, view: ViewNumber },
    /// This node answered a recovery request.
    RecoveryReplied { block_index: u32, to: u8 },
    /// `f + 1` commits were observed that do not match this node's block.
    SafetyViolation {
        block_index: u32,
        divergent_commits: usize,
    },
}

impl DbftEvent {
    /// Gets the event type as a string.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::BlockProposed { .. } => "BlockProposed",
            Self::BlockCommitted { .. } => "BlockCommitted",
            Self::ViewChanged { .. } => "ViewChanged",
            Self::TimeoutFired { .. } => "TimeoutFired",
            Self::RecoveryRequested { .. } => "RecoveryRequested",
            Self::RecoveryReplied { .. } => "RecoveryReplied",
            Self::SafetyViolation { .. } => "SafetyViolation",
        }
    }
}
