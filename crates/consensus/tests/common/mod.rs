//! In-memory collaborators and a multi-node harness for driving engines
//! deterministically, without timers or a real network.

#![allow(dead_code)]

use async_trait::async_trait;
use dbft_consensus::{
    wrap_message, ConsensusMessage, ConsensusMessageBody, DbftConfig, DbftEngine,
    ExtensiblePayload, LedgerService, LedgerSnapshot, MempoolService, NetworkService, Result,
    StandingCommittee, ViewNumber,
};
use dbft_core::{Block, BlockHeader, Transaction, UInt256};
use dbft_crypto::{ECPoint, KeyPair};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Once};

/// Installs a tracing subscriber once per test binary, so failing runs
/// print the engine's view transitions and drop reasons. Filter with
/// `RUST_LOG`, e.g. `RUST_LOG=dbft_consensus=debug`.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A ledger held entirely in memory, one instance per node.
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
}

struct LedgerState {
    height: u32,
    hash: UInt256,
    timestamp_ms: u64,
    validators: Vec<ECPoint>,
    blocks: HashMap<u32, Block>,
}

impl MemoryLedger {
    pub fn new(validators: Vec<ECPoint>) -> Self {
        Self {
            state: Mutex::new(LedgerState {
                height: 0,
                hash: UInt256::from([7u8; 32]),
                timestamp_ms: 0,
                validators,
                blocks: HashMap::new(),
            }),
        }
    }

    pub fn height(&self) -> u32 {
        self.state.lock().height
    }

    pub fn tip_hash(&self) -> UInt256 {
        self.state.lock().hash
    }

    pub fn block(&self, height: u32) -> Option<Block> {
        self.state.lock().blocks.get(&height).cloned()
    }
}

#[async_trait]
impl LedgerService for MemoryLedger {
    async fn current_height(&self) -> u32 {
        self.state.lock().height
    }

    async fn current_hash(&self) -> UInt256 {
        self.state.lock().hash
    }

    async fn header(&self, height: u32) -> Option<BlockHeader> {
        self.state.lock().blocks.get(&height).map(|b| b.header.clone())
    }

    async fn submit_block(&self, block: Block) -> Result<()> {
        let mut state = self.state.lock();
        assert_eq!(block.index(), state.height + 1, "blocks must be sequential");
        assert!(block.verify_merkle_root(), "merkle root must match");
        state.height = block.index();
        state.hash = block.hash();
        state.timestamp_ms = block.header.timestamp;
        state.blocks.insert(block.index(), block);
        Ok(())
    }

    async fn validate_transaction(&self, _transaction: &Transaction) -> bool {
        true
    }

    async fn take_snapshot(&self) -> LedgerSnapshot {
        let state = self.state.lock();
        LedgerSnapshot {
            height: state.height,
            current_hash: state.hash,
            timestamp_ms: state.timestamp_ms,
            validators: state.validators.clone(),
        }
    }
}

/// A mempool held in memory, one instance per node.
#[derive(Default)]
pub struct MemoryMempool {
    transactions: Mutex<Vec<Transaction>>,
}

impl MemoryMempool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, transaction: Transaction) {
        self.transactions.lock().push(transaction);
    }
}

#[async_trait]
impl MempoolService for MemoryMempool {
    async fn get_sorted_for_block(&self, max_count: usize, _max_size: usize) -> Vec<Transaction> {
        let mut transactions = self.transactions.lock().clone();
        transactions.sort_by_key(|tx| std::cmp::Reverse(tx.fee_per_byte()));
        transactions.truncate(max_count);
        transactions
    }

    async fn try_get(&self, hash: &UInt256) -> Option<Transaction> {
        self.transactions
            .lock()
            .iter()
            .find(|tx| tx.hash() == *hash)
            .cloned()
    }

    async fn contains(&self, hash: &UInt256) -> bool {
        self.transactions.lock().iter().any(|tx| tx.hash() == *hash)
    }
}

/// A network that records everything a node broadcasts.
#[derive(Default)]
pub struct CollectingNetwork {
    sent: Mutex<Vec<ExtensiblePayload>>,
    requested: Mutex<Vec<UInt256>>,
}

impl CollectingNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes everything broadcast since the last drain.
    pub fn drain(&self) -> Vec<ExtensiblePayload> {
        std::mem::take(&mut *self.sent.lock())
    }

    /// Transaction hashes requested via getdata.
    pub fn requested_hashes(&self) -> Vec<UInt256> {
        self.requested.lock().clone()
    }
}

#[async_trait]
impl NetworkService for CollectingNetwork {
    async fn broadcast(&self, payload: ExtensiblePayload) -> Result<()> {
        self.sent.lock().push(payload);
        Ok(())
    }

    async fn request_transactions(&self, hashes: Vec<UInt256>) -> Result<()> {
        self.requested.lock().extend(hashes);
        Ok(())
    }
}

/// One node of the simulated committee.
pub struct TestNode {
    pub engine: DbftEngine,
    pub ledger: Arc<MemoryLedger>,
    pub mempool: Arc<MemoryMempool>,
    pub network: Arc<CollectingNetwork>,
}

/// A committee of engines sharing nothing but their key ordering.
pub struct Cluster {
    pub config: DbftConfig,
    pub keys: Vec<KeyPair>,
    pub nodes: Vec<TestNode>,
}

impl Cluster {
    /// Builds `n` nodes over a sorted committee. Engines are not yet
    /// initialized.
    pub fn new(n: usize) -> Self {
        init_tracing();

        let config = DbftConfig::for_testing();
        let mut keys: Vec<KeyPair> = (0..n).map(|_| KeyPair::generate()).collect();
        keys.sort_by(|a, b| a.public_key().cmp(b.public_key()));
        let committee: Vec<ECPoint> = keys.iter().map(|k| *k.public_key()).collect();

        let nodes = keys
            .iter()
            .map(|key| {
                let ledger = Arc::new(MemoryLedger::new(committee.clone()));
                let mempool = Arc::new(MemoryMempool::new());
                let network = Arc::new(CollectingNetwork::new());
                let engine = DbftEngine::new(
                    config.clone(),
                    Some(key.clone()),
                    ledger.clone(),
                    mempool.clone(),
                    network.clone(),
                    Arc::new(StandingCommittee),
                )
                .expect("engine construction");
                TestNode {
                    engine,
                    ledger,
                    mempool,
                    network,
                }
            })
            .collect();

        Self {
            config,
            keys,
            nodes,
        }
    }

    /// Initializes the given nodes, entering round `height + 1`.
    pub async fn init(&mut self, online: &[usize]) {
        for &i in online {
            self.nodes[i].engine.initialize().await.expect("initialize");
        }
    }

    /// Adds a transaction to the mempools of the given nodes.
    pub fn add_transaction(&self, transaction: &Transaction, nodes: &[usize]) {
        for &i in nodes {
            self.nodes[i].mempool.add(transaction.clone());
        }
    }

    /// The validator index of height-1 view-0's primary.
    pub fn primary_of(&self, height: u32, view: u8) -> usize {
        ((height as u64 + view as u64) % self.nodes.len() as u64) as usize
    }

    /// Delivers every pending broadcast to every other online node, until
    /// the network is quiet. Returns the number of deliveries made.
    pub async fn pump(&mut self, online: &[usize]) -> usize {
        let mut deliveries = 0;
        loop {
            let mut batch: Vec<(usize, ExtensiblePayload)> = Vec::new();
            for &i in online {
                for payload in self.nodes[i].network.drain() {
                    batch.push((i, payload));
                }
            }
            if batch.is_empty() {
                break;
            }

            for (origin, payload) in batch {
                for &target in online {
                    if target == origin {
                        continue;
                    }
                    self.nodes[target]
                        .engine
                        .on_payload(payload.clone())
                        .await
                        .expect("payload delivery");
                    deliveries += 1;
                }
            }
        }
        deliveries
    }
}

/// Builds a fully signed consensus payload on behalf of any validator,
/// used to simulate Byzantine or offline senders.
pub fn build_signed_payload(
    config: &DbftConfig,
    key: &KeyPair,
    validator_index: u8,
    block_index: u32,
    view: u8,
    body: ConsensusMessageBody,
) -> ExtensiblePayload {
    let mut message =
        ConsensusMessage::new(block_index, validator_index, ViewNumber::new(view), body);
    message
        .sign_with(key, config.network_magic)
        .expect("signing");
    wrap_message(&message, key, config.network_magic).expect("wrapping")
}

/// Unwraps the inner message of a collected payload.
pub fn inner_message(payload: &ExtensiblePayload) -> ConsensusMessage {
    dbft_consensus::unwrap_message(payload).expect("decodable payload")
}
