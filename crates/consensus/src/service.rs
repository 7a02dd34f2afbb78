//! Main consensus service: the long-running actor.
//!
//! The service owns the [`DbftEngine`] exclusively and drives it from a
//! single event queue: inbound payloads, mempool arrivals and persisted
//! blocks merge into one channel, and the round and recovery deadlines are
//! multiplexed in with `select!`. Handlers run to completion; all outbound
//! effects are produced synchronously inside them.

use crate::{
    dbft::{DbftConfig, DbftEngine, DbftEvent, DbftStats},
    extensible::ExtensiblePayload,
    Error, Result,
};
use async_trait::async_trait;
use dbft_core::{Block, BlockHeader, Transaction, UInt256};
use dbft_crypto::{ECPoint, KeyPair};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

/// An immutable view of ledger state, used by the validator registry.
///
/// Two calls against the same snapshot must observe identical data; the
/// registry's determinism depends on it.
#[derive(Debug, Clone)]
pub struct LedgerSnapshot {
    /// Height of the chain tip.
    pub height: u32,
    /// Hash of the chain tip.
    pub current_hash: UInt256,
    /// Timestamp of the chain tip, in milliseconds.
    pub timestamp_ms: u64,
    /// The committee registered in ledger state as of this snapshot.
    pub validators: Vec<ECPoint>,
}

/// Ledger interface consumed by the consensus core.
#[async_trait]
pub trait LedgerService: Send + Sync {
    /// Height of the chain tip.
    async fn current_height(&self) -> u32;

    /// Hash of the chain tip.
    async fn current_hash(&self) -> UInt256;

    /// A header by height, if present.
    async fn header(&self, height: u32) -> Option<BlockHeader>;

    /// Hands a finalized block to the ledger. The ledger answers with a
    /// separate persisted-block event once the block is durable.
    async fn submit_block(&self, block: Block) -> Result<()>;

    /// Verifies a transaction under the persisting snapshot and policy.
    async fn validate_transaction(&self, transaction: &Transaction) -> bool;

    /// Takes an immutable snapshot for the validator registry.
    async fn take_snapshot(&self) -> LedgerSnapshot;
}

/// Mempool interface consumed by the consensus core.
#[async_trait]
pub trait MempoolService: Send + Sync {
    /// Verified transactions in policy order, bounded by count and total
    /// size.
    async fn get_sorted_for_block(&self, max_count: usize, max_size: usize) -> Vec<Transaction>;

    /// Looks a transaction up by hash.
    async fn try_get(&self, hash: &UInt256) -> Option<Transaction>;

    /// Whether the pool holds the given transaction.
    async fn contains(&self, hash: &UInt256) -> bool;
}

/// P2P interface consumed by the consensus core. Sends are non-blocking
/// hand-offs; the network layer owns flow control and retries.
#[async_trait]
pub trait NetworkService: Send + Sync {
    /// Broadcasts a signed payload to all peers.
    async fn broadcast(&self, payload: ExtensiblePayload) -> Result<()>;

    /// Requests transactions by hash from peers (`getdata`).
    async fn request_transactions(&self, hashes: Vec<UInt256>) -> Result<()>;
}

/// Events delivered into the consensus queue.
#[derive(Debug)]
pub enum ConsensusInput {
    /// A consensus payload arrived from the network.
    Payload(ExtensiblePayload),
    /// A transaction arrived in the mempool.
    TransactionAdded(Transaction),
    /// A block persisted at the given height.
    BlockPersisted(u32),
    /// Stop the service.
    Shutdown,
}

/// Cloneable handle for feeding events into a running service.
#[derive(Clone)]
pub struct ConsensusHandle {
    input_tx: mpsc::UnboundedSender<ConsensusInput>,
}

impl ConsensusHandle {
    /// Delivers a network payload.
    pub fn submit_payload(&self, payload: ExtensiblePayload) {
        let _ = self.input_tx.send(ConsensusInput::Payload(payload));
    }

    /// Notifies the service of a mempool arrival.
    pub fn notify_transaction(&self, transaction: Transaction) {
        let _ = self
            .input_tx
            .send(ConsensusInput::TransactionAdded(transaction));
    }

    /// Notifies the service that a block persisted.
    pub fn notify_block_persisted(&self, height: u32) {
        let _ = self.input_tx.send(ConsensusInput::BlockPersisted(height));
    }

    /// Requests a graceful stop at the next event boundary.
    pub fn shutdown(&self) {
        let _ = self.input_tx.send(ConsensusInput::Shutdown);
    }
}

/// The consensus actor bound to a single validator identity.
pub struct ConsensusService {
    engine: DbftEngine,
    input_tx: mpsc::UnboundedSender<ConsensusInput>,
    input_rx: mpsc::UnboundedReceiver<ConsensusInput>,
}

impl ConsensusService {
    /// Creates a new consensus service.
    ///
    /// `key_pair` of `None` runs the node as an observer: it tracks rounds
    /// and can adopt finalized blocks, but never signs or broadcasts.
    pub fn new(
        config: DbftConfig,
        key_pair: Option<KeyPair>,
        ledger: Arc<dyn LedgerService>,
        mempool: Arc<dyn MempoolService>,
        network: Arc<dyn NetworkService>,
        registry: Arc<dyn crate::validators::ValidatorRegistry>,
    ) -> Result<Self> {
        let engine = DbftEngine::new(config, key_pair, ledger, mempool, network, registry)?;
        let (input_tx, input_rx) = mpsc::unbounded_channel();

        Ok(Self {
            engine,
            input_tx,
            input_rx,
        })
    }

    /// Creates a service whose signing key comes from the settings layer.
    ///
    /// A configured key that cannot be parsed is a fatal configuration
    /// error, never silently downgraded to observer mode.
    pub fn from_settings(
        settings: &dbft_config::ProtocolSettings,
        ledger: Arc<dyn LedgerService>,
        mempool: Arc<dyn MempoolService>,
        network: Arc<dyn NetworkService>,
        registry: Arc<dyn crate::validators::ValidatorRegistry>,
    ) -> Result<Self> {
        let config = DbftConfig::from_settings(settings)?;
        let key_pair = match &settings.validator_private_key {
            Some(hex_key) => Some(
                KeyPair::from_hex(hex_key)
                    .map_err(|e| Error::MissingValidatorKey(e.to_string()))?,
            ),
            None => None,
        };
        Self::new(config, key_pair, ledger, mempool, network, registry)
    }

    /// A handle for feeding events into the running service.
    pub fn handle(&self) -> ConsensusHandle {
        ConsensusHandle {
            input_tx: self.input_tx.clone(),
        }
    }

    /// Subscribes to engine events.
    pub fn event_receiver(&self) -> broadcast::Receiver<DbftEvent> {
        self.engine.event_receiver()
    }

    /// A shared view of engine statistics.
    pub fn stats(&self) -> Arc<RwLock<DbftStats>> {
        self.engine.stats_handle()
    }

    /// Runs the service until shutdown. Cancelling the future discards any
    /// in-flight round; no partial block is ever handed to the ledger.
    pub async fn run(mut self) -> Result<()> {
        info!("starting consensus service");
        self.engine.initialize().await?;

        enum Wake {
            Input(Option<ConsensusInput>),
            RoundDeadline,
            RecoveryDeadline,
        }

        loop {
            let round_deadline = self.engine.round_deadline();
            let recovery_deadline = self.engine.recovery_deadline();
            let far = Instant::now() + Duration::from_secs(86_400);

            let wake = tokio::select! {
                input = self.input_rx.recv() => Wake::Input(input),
                _ = sleep_until(round_deadline.unwrap_or(far)), if round_deadline.is_some() => {
                    Wake::RoundDeadline
                }
                _ = sleep_until(recovery_deadline.unwrap_or(far)), if recovery_deadline.is_some() => {
                    Wake::RecoveryDeadline
                }
            };

            match wake {
                Wake::Input(None) | Wake::Input(Some(ConsensusInput::Shutdown)) => break,
                Wake::Input(Some(ConsensusInput::Payload(payload))) => {
                    if let Err(e) = self.engine.on_payload(payload).await {
                        debug!(error = %e, "payload handler failed");
                    }
                }
                Wake::Input(Some(ConsensusInput::TransactionAdded(tx))) => {
                    if let Err(e) = self.engine.on_transaction(tx).await {
                        debug!(error = %e, "transaction handler failed");
                    }
                }
                Wake::Input(Some(ConsensusInput::BlockPersisted(height))) => {
                    if let Err(e) = self.engine.on_block_persisted(height).await {
                        warn!(height, error = %e, "persisted-block handler failed");
                    }
                }
                Wake::RoundDeadline => {
                    if let Err(e) = self.engine.on_timer().await {
                        warn!(error = %e, "round timer handler failed");
                    }
                }
                Wake::RecoveryDeadline => {
                    if let Err(e) = self.engine.on_recovery_timer().await {
                        debug!(error = %e, "recovery timer handler failed");
                    }
                }
            }
        }

        info!("consensus service stopped");
        Ok(())
    }
}
