//! Neo dBFT Consensus Module
//!
//! This crate implements the delegated Byzantine Fault Tolerance (dBFT)
//! consensus engine: a state machine driving a fixed committee of
//! validators to agree on successive blocks in the presence of up to
//! `f = (n-1)/3` Byzantine participants.
//!
//! ## Components
//!
//! - **Messages**: the six consensus payload variants and their wire codec
//! - **Extensible**: the network envelope consensus payloads travel in
//! - **Context**: in-memory state of the current `(height, view)` round
//! - **Validators**: committee ordering, primary selection, multisig scripts
//! - **Timer**: per-round deadline with exponential view backoff
//! - **dBFT**: the engine processing events and enforcing transitions
//! - **Recovery**: catch-up protocol for lagging or restarted nodes
//! - **Proposal**: transaction selection and block assembly
//! - **Service**: the long-running actor wiring the engine to collaborators

pub mod context;
pub mod dbft;
pub mod extensible;
pub mod messages;
pub mod proposal;
pub mod recovery;
pub mod service;
pub mod timer;
pub mod validators;

// Re-export main types
pub use context::{Acceptance, ConsensusContext, HeaderDraft};
pub use dbft::{ConsensusPhase, DbftConfig, DbftEngine, DbftEvent, DbftStats};
pub use extensible::{unwrap_message, wrap_message, ExtensiblePayload, CONSENSUS_CATEGORY};
pub use messages::{
    block_signing_data, ChangeView, ChangeViewReason, Commit, ConsensusMessage,
    ConsensusMessageBody, ConsensusMessageType, PrepareRequest, PrepareResponse, RecoveryRequest,
};
pub use recovery::{RecoveryMessage, RecoveryReplyLimiter};
pub use service::{
    ConsensusHandle, ConsensusInput, ConsensusService, LedgerService, LedgerSnapshot,
    MempoolService, NetworkService,
};
pub use timer::{RecoveryTimer, RoundTimer};
pub use validators::{StandingCommittee, ValidatorRegistry, ValidatorSet};

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type for consensus operations
pub type Result<T> = std::result::Result<T, Error>;

/// Consensus-specific error types
#[derive(Error, Debug)]
pub enum Error {
    /// A payload had an unexpected length or field value
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// A payload carried an unknown message type byte
    #[error("unknown message variant: {0:#04x}")]
    UnknownVariant(u8),

    /// A payload arrived without its invocation script
    #[error("invocation script missing")]
    InvocationScriptMissing,

    /// An invocation script or commit signature failed verification
    #[error("bad signature from validator {0}")]
    BadSignature(u16),

    /// A payload referenced a height or view this node is not at
    #[error("wrong height or view")]
    WrongHeightOrView,

    /// A validator sent two different payloads for the same slot
    #[error("equivocation by validator {0}")]
    Equivocation(u16),

    /// A prepare request arrived from a validator that is not the primary
    #[error("prepare request from non-primary validator {0}")]
    UnexpectedPrimary(u16),

    /// Transactions named by a prepare request could not be resolved
    #[error("{0} transactions missing")]
    MissingTransactions(usize),

    /// A transaction violated local policy
    #[error("transaction rejected by policy: {0}")]
    PolicyReject(String),

    /// The ledger refused a finalized block
    #[error("block rejected: {0}")]
    BlockRejected(String),

    /// A recovery reply was suppressed by the rate limiter
    #[error("recovery reply throttled")]
    RecoveryThrottled,

    /// The configured validator key could not be loaded
    #[error("missing validator key: {0}")]
    MissingValidatorKey(String),

    /// Configuration error
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// An operation was attempted in a phase that does not permit it
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The local node is not part of the current committee
    #[error("not a validator")]
    NotValidator,

    /// Ledger error
    #[error("ledger error: {0}")]
    Ledger(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] dbft_io::IoError),

    /// Cryptography error
    #[error("cryptography error: {0}")]
    Crypto(#[from] dbft_crypto::CryptoError),

    /// Core error
    #[error("core error: {0}")]
    Core(#[from] dbft_core::CoreError),

    /// Configuration error from the settings layer
    #[error("config error: {0}")]
    Config(#[from] dbft_config::ConfigError),
}

/// Consensus node role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeRole {
    /// Primary node (block proposer)
    Primary,
    /// Backup node (validator)
    Backup,
    /// Observer node (non-validator)
    Observer,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Primary => write!(f, "Primary"),
            NodeRole::Backup => write!(f, "Backup"),
            NodeRole::Observer => write!(f, "Observer"),
        }
    }
}

/// Consensus view number
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ViewNumber(pub u8);

impl ViewNumber {
    /// Creates a new view number
    pub fn new(view: u8) -> Self {
        Self(view)
    }

    /// Gets the view number value
    pub fn value(&self) -> u8 {
        self.0
    }

    /// Gets the next view number
    pub fn next(&self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for ViewNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Returns the maximum tolerated Byzantine count for a committee of `n`.
pub fn byzantine_threshold(n: usize) -> usize {
    n.saturating_sub(1) / 3
}

/// Returns the quorum `M = n - f` for a committee of `n`.
pub fn required_signatures(n: usize) -> usize {
    n - byzantine_threshold(n)
}
