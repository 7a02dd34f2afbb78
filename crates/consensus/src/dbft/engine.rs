//! The dBFT state machine.
//!
//! One engine instance owns the round [`ConsensusContext`] exclusively and
//! processes one event at a time: decoded payloads, timer expiries,
//! transaction arrivals and persisted blocks. Every outbound payload is
//! signed, wrapped and handed to the network synchronously from the
//! handler that produced it.

use super::{
    config::DbftConfig,
    state::{ConsensusPhase, DbftEvent, DbftStats},
};
use crate::{
    context::ConsensusContext,
    extensible::{unwrap_message, wrap_message, ExtensiblePayload},
    messages::{
        block_signing_data, ChangeView, ChangeViewReason, Commit, ConsensusMessage,
        ConsensusMessageBody, PrepareRequest, PrepareResponse, RecoveryRequest,
    },
    proposal,
    recovery::{RecoveryMessage, RecoveryReplyLimiter},
    service::{LedgerService, MempoolService, NetworkService},
    timer::{RecoveryTimer, RoundTimer},
    validators::{ValidatorRegistry, ValidatorSet},
    Error, Result, ViewNumber,
};
use dbft_config::MAX_TRANSACTION_SIZE;
use dbft_core::{Transaction, UInt160, UInt256};
use dbft_crypto::KeyPair;
use dbft_io::Serializable;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant as StdInstant, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// The dBFT consensus engine.
pub struct DbftEngine {
    config: DbftConfig,
    context: ConsensusContext,
    key_pair: Option<KeyPair>,
    ledger: Arc<dyn LedgerService>,
    mempool: Arc<dyn MempoolService>,
    network: Arc<dyn NetworkService>,
    registry: Arc<dyn ValidatorRegistry>,
    round_timer: RoundTimer,
    recovery_timer: RecoveryTimer,
    reply_limiter: RecoveryReplyLimiter,
    known_hashes: HashSet<UInt256>,
    divergent_commits: HashSet<u16>,
    drop_counts: HashMap<UInt160, u64>,
    ingesting_recovery: bool,
    stats: Arc<RwLock<DbftStats>>,
    event_tx: broadcast::Sender<DbftEvent>,
    round_started_at: StdInstant,
}

impl DbftEngine {
    /// Creates a new engine. `key_pair` of `None` runs in observer mode.
    pub fn new(
        config: DbftConfig,
        key_pair: Option<KeyPair>,
        ledger: Arc<dyn LedgerService>,
        mempool: Arc<dyn MempoolService>,
        network: Arc<dyn NetworkService>,
        registry: Arc<dyn ValidatorRegistry>,
    ) -> Result<Self> {
        config.validate()?;

        let (event_tx, _) = broadcast::channel(1024);
        let context = ConsensusContext::new(config.network_magic);
        let round_timer = RoundTimer::new(config.block_time_ms, config.max_view_timeout_ms);
        let recovery_timer = RecoveryTimer::new(config.recovery_idle_ms);
        let reply_limiter =
            RecoveryReplyLimiter::new(Duration::from_millis(config.block_time_ms));

        Ok(Self {
            config,
            context,
            key_pair,
            ledger,
            mempool,
            network,
            registry,
            round_timer,
            recovery_timer,
            reply_limiter,
            known_hashes: HashSet::new(),
            divergent_commits: HashSet::new(),
            drop_counts: HashMap::new(),
            ingesting_recovery: false,
            stats: Arc::new(RwLock::new(DbftStats::default())),
            event_tx,
            round_started_at: StdInstant::now(),
        })
    }

    /// Subscribes to engine events.
    pub fn event_receiver(&self) -> broadcast::Receiver<DbftEvent> {
        self.event_tx.subscribe()
    }

    /// A shared view of the engine statistics.
    pub fn stats_handle(&self) -> Arc<RwLock<DbftStats>> {
        self.stats.clone()
    }

    /// The round context (read-only).
    pub fn context(&self) -> &ConsensusContext {
        &self.context
    }

    /// The armed round deadline, if any.
    pub fn round_deadline(&self) -> Option<tokio::time::Instant> {
        self.round_timer.deadline()
    }

    /// The armed recovery-idle deadline, if any.
    pub fn recovery_deadline(&self) -> Option<tokio::time::Instant> {
        self.recovery_timer.deadline()
    }

    /// Per-peer counts of payloads dropped as malformed or unverifiable,
    /// exposed for banning policy upstream.
    pub fn drop_counts(&self) -> &HashMap<UInt160, u64> {
        &self.drop_counts
    }

    fn emit(&self, event: DbftEvent) {
        let _ = self.event_tx.send(event);
    }

    fn can_sign(&self) -> bool {
        self.key_pair.is_some() && self.context.is_validator()
    }

    fn new_message(&self, body: ConsensusMessageBody) -> Result<ConsensusMessage> {
        let my_index = self.context.my_index().ok_or(Error::NotValidator)?;
        Ok(ConsensusMessage::new(
            self.context.height(),
            my_index as u8,
            self.context.view(),
            body,
        ))
    }

    fn sign_message(&self, message: &mut ConsensusMessage) -> Result<()> {
        let key = self.key_pair.as_ref().ok_or(Error::NotValidator)?;
        message.sign_with(key, self.config.network_magic)
    }

    async fn broadcast(&mut self, message: ConsensusMessage) -> Result<()> {
        let key = self.key_pair.as_ref().ok_or(Error::NotValidator)?;
        let payload = wrap_message(&message, key, self.config.network_magic)?;
        // Remember our own payload so an echo from a peer is not reprocessed.
        self.known_hashes.insert(payload.hash());
        self.network.broadcast(payload).await
    }

    // --- round lifecycle ---

    /// Binds the engine to the ledger tip and enters the first round.
    pub async fn initialize(&mut self) -> Result<()> {
        let height = self.ledger.current_height().await;
        self.start_round(height + 1).await
    }

    async fn start_round(&mut self, height: u32) -> Result<()> {
        let snapshot = self.ledger.take_snapshot().await;
        let validators = ValidatorSet::new(self.registry.validators_for(&snapshot, height)?);
        let next_consensus = self.registry.next_consensus_hash(&snapshot, height + 1)?;

        let my_key = self.key_pair.as_ref().map(|k| *k.public_key());
        self.context.reset(
            height,
            snapshot.current_hash,
            snapshot.timestamp_ms,
            validators,
            my_key.as_ref(),
            next_consensus,
        );

        self.known_hashes.clear();
        self.divergent_commits.clear();
        self.round_timer.start(ViewNumber::new(0));
        self.recovery_timer.reset();
        self.round_started_at = StdInstant::now();

        {
            let mut stats = self.stats.write();
            stats.consensus_rounds += 1;
            stats.current_height = height;
            stats.current_view = 0;
        }

        info!(
            height,
            validators = self.context.validators().len(),
            my_index = ?self.context.my_index(),
            "starting consensus round"
        );

        self.begin_view().await
    }

    /// Role entry for the current view: the primary proposes, everyone
    /// else waits for the proposal.
    async fn begin_view(&mut self) -> Result<()> {
        if self.context.is_primary() && self.can_sign() {
            self.send_prepare_request().await
        } else {
            self.context.set_phase(ConsensusPhase::Backup);
            Ok(())
        }
    }

    // --- primary path ---

    async fn send_prepare_request(&mut self) -> Result<()> {
        self.context.set_phase(ConsensusPhase::Primary);

        let candidates = self
            .mempool
            .get_sorted_for_block(
                self.config.max_transactions_per_block,
                self.config.max_block_size,
            )
            .await;
        let selected = proposal::select_transactions(
            candidates,
            self.config.max_transactions_per_block,
            self.config.max_block_size,
        );
        let tx_hashes: Vec<UInt256> = selected.iter().map(|tx| tx.hash()).collect();

        // Block timestamps are strictly increasing along the chain.
        let timestamp = now_ms().max(self.context.prev_timestamp() + 1);
        let nonce: u64 = rand::random();

        let mut message = self.new_message(ConsensusMessageBody::PrepareRequest(PrepareRequest {
            version: 0,
            prev_hash: self.context.prev_hash(),
            timestamp,
            nonce,
            transaction_hashes: tx_hashes,
        }))?;
        self.sign_message(&mut message)?;

        let my_index = self.context.my_index().ok_or(Error::NotValidator)?;
        self.context.accept_preparation(my_index, message.clone())?;
        for tx in selected.iter().cloned() {
            self.context.register_transaction(tx);
        }
        self.context.set_phase(ConsensusPhase::RequestSent);

        let block_hash = self.context.block_hash().unwrap_or_else(UInt256::zero);
        info!(
            height = self.context.height(),
            view = %self.context.view(),
            transactions = selected.len(),
            "proposing block"
        );
        self.emit(DbftEvent::BlockProposed {
            block_index: self.context.height(),
            block_hash,
            transaction_count: selected.len(),
        });

        self.broadcast(message).await?;
        // A degenerate single-validator committee reaches quorum alone.
        self.check_preparations().await
    }

    // --- inbound payloads ---

    /// Handles a consensus payload delivered by the network.
    pub async fn on_payload(&mut self, payload: ExtensiblePayload) -> Result<()> {
        self.stats.write().messages_received += 1;

        if !payload.is_consensus() {
            self.drop_payload(&payload, "wrong category");
            return Ok(());
        }

        let payload_hash = payload.hash();
        if !self.known_hashes.insert(payload_hash) {
            return Ok(()); // duplicate
        }

        if payload.valid_block_end < self.context.height() {
            self.drop_payload(&payload, "expired validity window");
            return Ok(());
        }

        let message = match unwrap_message(&payload) {
            Ok(message) => message,
            Err(e) => {
                self.drop_payload(&payload, "undecodable");
                debug!(sender = %payload.sender, error = %e, "malformed consensus payload");
                return Ok(());
            }
        };

        if message.block_index != self.context.height() {
            // Stale rounds are dropped silently; if we are the one behind,
            // the recovery timer will solicit a catch-up.
            self.stats.write().messages_dropped += 1;
            return Ok(());
        }

        if self.process_message(message, Some(payload.sender)).await? {
            self.recovery_timer.reset();
        }
        Ok(())
    }

    fn drop_payload(&mut self, payload: &ExtensiblePayload, reason: &str) {
        let mut stats = self.stats.write();
        stats.messages_dropped += 1;
        drop(stats);
        *self.drop_counts.entry(payload.sender).or_insert(0) += 1;
        debug!(sender = %payload.sender, reason, "dropping payload");
    }

    /// Validates and dispatches a decoded message. Returns whether the
    /// message was processed (signature valid, not stale).
    async fn process_message(
        &mut self,
        message: ConsensusMessage,
        sender: Option<UInt160>,
    ) -> Result<bool> {
        let index = message.validator_index as u16;

        let Some(key) = self.context.validators().get(index).copied() else {
            self.stats.write().messages_dropped += 1;
            return Ok(false);
        };

        if !message.verify_signature(&key, self.config.network_magic) {
            self.stats.write().messages_dropped += 1;
            if let Some(sender) = sender {
                *self.drop_counts.entry(sender).or_insert(0) += 1;
            }
            debug!(index, "invocation script verification failed");
            return Ok(false);
        }

        self.context
            .note_seen(index, message.block_index, message.view_number);

        match &message.body {
            ConsensusMessageBody::ChangeView(_) => self.on_change_view(index, message).await?,
            ConsensusMessageBody::PrepareRequest(_) => {
                if message.view_number == self.context.view() {
                    self.on_prepare_request(index, message).await?;
                } else {
                    self.stats.write().messages_dropped += 1;
                }
            }
            ConsensusMessageBody::PrepareResponse(_) => {
                if message.view_number == self.context.view() {
                    self.on_prepare_response(index, message).await?;
                } else {
                    self.stats.write().messages_dropped += 1;
                }
            }
            ConsensusMessageBody::Commit(_) => {
                if message.view_number == self.context.view() {
                    self.on_commit(index, message).await?;
                } else {
                    self.stats.write().messages_dropped += 1;
                }
            }
            ConsensusMessageBody::RecoveryRequest(_) => {
                self.on_recovery_request(index, &message).await?;
            }
            ConsensusMessageBody::RecoveryMessage(_) => {
                if !self.ingesting_recovery {
                    self.on_recovery_message(message).await?;
                }
            }
        }

        Ok(true)
    }

    // --- prepare request (backup path) ---

    async fn on_prepare_request(&mut self, index: u16, message: ConsensusMessage) -> Result<()> {
        let expected_primary = self.context.primary_index();
        if index != expected_primary {
            warn!(
                index,
                expected = expected_primary,
                "prepare request from non-primary"
            );
            self.stats.write().messages_dropped += 1;
            return Ok(());
        }

        let request = match &message.body {
            ConsensusMessageBody::PrepareRequest(request) => request,
            _ => return Ok(()),
        };

        // Body validation before any state change.
        if request.prev_hash != self.context.prev_hash() {
            debug!(index, "prepare request built on a different chain tip");
            self.stats.write().messages_dropped += 1;
            return Ok(());
        }
        let horizon = now_ms() + 8 * self.config.block_time_ms;
        let timestamp_ok =
            request.timestamp > self.context.prev_timestamp() && request.timestamp <= horizon;
        let count_ok = request.transaction_hashes.len() <= self.config.max_transactions_per_block;
        let unique: HashSet<&UInt256> = request.transaction_hashes.iter().collect();
        let no_duplicates = unique.len() == request.transaction_hashes.len();

        if !timestamp_ok || !count_ok || !no_duplicates {
            warn!(
                index,
                timestamp_ok, count_ok, no_duplicates, "invalid prepare request"
            );
            self.stats.write().messages_dropped += 1;
            self.request_change_view(ChangeViewReason::TxInvalid).await?;
            return Ok(());
        }

        let tx_hashes = request.transaction_hashes.clone();
        match self.context.accept_preparation(index, message) {
            Ok(acceptance) if acceptance.is_accepted() => {}
            Ok(_) => return Ok(()), // duplicate or ignored
            Err(Error::Equivocation(offender)) => {
                warn!(offender, "equivocating preparation dropped");
                self.stats.write().equivocations += 1;
                return Ok(());
            }
            Err(e) => {
                debug!(error = %e, "preparation rejected");
                self.stats.write().messages_dropped += 1;
                return Ok(());
            }
        }

        debug!(
            height = self.context.height(),
            view = %self.context.view(),
            transactions = tx_hashes.len(),
            "prepare request accepted"
        );

        // Resolve the named transactions from the mempool.
        for hash in &tx_hashes {
            if self.context.get_transaction(hash).is_some() {
                continue;
            }
            if let Some(tx) = self.mempool.try_get(hash).await {
                self.context.register_transaction(tx);
            }
        }

        let missing = self.context.missing_transactions();
        if !missing.is_empty() {
            debug!(missing = missing.len(), "requesting missing transactions");
            self.context.set_phase(ConsensusPhase::RequestReceived);
            self.network.request_transactions(missing).await?;
            return Ok(());
        }

        self.verify_transactions_and_respond().await
    }

    /// Verifies every resolved transaction and broadcasts this node's
    /// preparation response.
    async fn verify_transactions_and_respond(&mut self) -> Result<()> {
        let transactions = match self.context.ordered_transactions() {
            Some(transactions) => transactions,
            None => return Ok(()),
        };

        for tx in &transactions {
            if tx.size() > MAX_TRANSACTION_SIZE || tx.network_fee < 0 || tx.system_fee < 0 {
                warn!(hash = %tx.hash(), "transaction rejected by policy");
                return self
                    .request_change_view(ChangeViewReason::TxRejectedByPolicy)
                    .await;
            }
            if !self.ledger.validate_transaction(tx).await {
                warn!(hash = %tx.hash(), "transaction failed verification");
                return self.request_change_view(ChangeViewReason::TxInvalid).await;
            }
        }

        let phase = self.context.phase();
        let respond = self.can_sign()
            && !self.context.is_primary()
            && !phase.preparation_sent()
            && !phase.is_locked();

        if respond {
            let request_hash = match self.context.prepare_request() {
                Some(request) => request.hash(),
                None => return Ok(()),
            };
            let mut message = self.new_message(ConsensusMessageBody::PrepareResponse(
                PrepareResponse {
                    preparation_hash: request_hash,
                },
            ))?;
            self.sign_message(&mut message)?;

            let my_index = self.context.my_index().ok_or(Error::NotValidator)?;
            self.context.accept_preparation(my_index, message.clone())?;
            self.context.set_phase(ConsensusPhase::ResponseSent);
            self.broadcast(message).await?;
        } else if !phase.preparation_sent() && !phase.is_locked() {
            self.context.set_phase(ConsensusPhase::Backup);
        }

        self.check_preparations().await
    }

    async fn on_prepare_response(&mut self, index: u16, message: ConsensusMessage) -> Result<()> {
        match self.context.accept_preparation(index, message) {
            Ok(acceptance) if acceptance.is_accepted() => self.check_preparations().await,
            Ok(_) => Ok(()),
            Err(Error::Equivocation(offender)) => {
                warn!(offender, "equivocating preparation dropped");
                self.stats.write().equivocations += 1;
                Ok(())
            }
            Err(e) => {
                debug!(error = %e, "prepare response rejected");
                self.stats.write().messages_dropped += 1;
                Ok(())
            }
        }
    }

    /// Sends this node's commit once `M` consistent preparations and every
    /// named transaction are present.
    async fn check_preparations(&mut self) -> Result<()> {
        let phase = self.context.phase();
        if phase.is_locked()
            || !phase.preparation_sent()
            || !self.context.preparation_quorum()
            || !self.context.has_all_transactions()
            || !self.can_sign()
        {
            return Ok(());
        }

        let block_hash = match self.context.block_hash() {
            Some(hash) => hash,
            None => return Ok(()),
        };

        let key = self.key_pair.as_ref().ok_or(Error::NotValidator)?;
        let signature = key.sign(&block_signing_data(self.config.network_magic, &block_hash))?;

        let mut message =
            self.new_message(ConsensusMessageBody::Commit(Commit::new(signature)))?;
        self.sign_message(&mut message)?;

        let my_index = self.context.my_index().ok_or(Error::NotValidator)?;
        let acceptance = self.context.accept_commit(my_index, message.clone())?;
        self.context.set_phase(ConsensusPhase::CommitSent);

        info!(
            height = self.context.height(),
            view = %self.context.view(),
            block_hash = %block_hash,
            "commit sent; locked on this block"
        );

        self.broadcast(message).await?;

        if acceptance.reached_quorum() {
            self.try_finalize().await?;
        }
        Ok(())
    }

    // --- commits ---

    async fn on_commit(&mut self, index: u16, message: ConsensusMessage) -> Result<()> {
        match self.context.accept_commit(index, message) {
            Ok(acceptance) => {
                if acceptance.reached_quorum() {
                    self.try_finalize().await?;
                }
                Ok(())
            }
            Err(Error::Equivocation(offender)) => {
                warn!(offender, "equivocating commit dropped");
                self.stats.write().equivocations += 1;
                Ok(())
            }
            Err(Error::BadSignature(offender)) => {
                // A well-formed commit that does not sign our block: either
                // garbage or a commit for a different block at this height.
                self.stats.write().messages_dropped += 1;
                if self.context.phase().is_locked() {
                    self.divergent_commits.insert(offender);
                    let threshold = self.context.byzantine_threshold() + 1;
                    if self.divergent_commits.len() >= threshold {
                        error!(
                            height = self.context.height(),
                            divergent = self.divergent_commits.len(),
                            "safety violation: f+1 commits for a different block"
                        );
                        self.stats.write().safety_violations += 1;
                        self.emit(DbftEvent::SafetyViolation {
                            block_index: self.context.height(),
                            divergent_commits: self.divergent_commits.len(),
                        });
                    }
                }
                Ok(())
            }
            Err(e) => {
                debug!(error = %e, "commit rejected");
                self.stats.write().messages_dropped += 1;
                Ok(())
            }
        }
    }

    /// Assembles and submits the block once `M` verified commits and every
    /// named transaction are present.
    async fn try_finalize(&mut self) -> Result<()> {
        if self.context.phase() == ConsensusPhase::BlockSent {
            return Ok(());
        }
        if !self.context.commit_quorum() || !self.context.has_all_transactions() {
            return Ok(());
        }

        let block = proposal::assemble_block(&self.context)?;
        let block_hash = block.hash();
        let consensus_time_ms = self.round_started_at.elapsed().as_millis() as u64;

        match self.ledger.submit_block(block).await {
            Ok(()) => {
                self.context.set_phase(ConsensusPhase::BlockSent);
                self.round_timer.disarm();
                info!(
                    height = self.context.height(),
                    block_hash = %block_hash,
                    consensus_time_ms,
                    "block handed to ledger"
                );
                self.emit(DbftEvent::BlockCommitted {
                    block_index: self.context.height(),
                    block_hash,
                    consensus_time_ms,
                });
                Ok(())
            }
            Err(e) => {
                // Locked on our commit, so no view change is permitted; the
                // failure is surfaced and the node stalls until recovery or
                // a persisted block moves it on.
                error!(height = self.context.height(), error = %e, "ledger rejected block");
                Err(Error::BlockRejected(e.to_string()))
            }
        }
    }

    // --- view changes ---

    async fn on_change_view(&mut self, index: u16, message: ConsensusMessage) -> Result<()> {
        let requested = match &message.body {
            ConsensusMessageBody::ChangeView(cv) => cv.new_view_number,
            _ => return Ok(()),
        };
        if requested <= self.context.view() {
            return Ok(()); // stale request
        }

        let committed = match self.context.accept_change_view(index, message) {
            Ok(committed) => committed,
            Err(e) => {
                debug!(error = %e, "change view rejected");
                self.stats.write().messages_dropped += 1;
                return Ok(());
            }
        };

        if let Some(new_view) = committed {
            if !self.context.phase().is_locked() {
                return self
                    .perform_view_change(new_view, ChangeViewReason::ChangeAgreement)
                    .await;
            }
            // Locked nodes never follow a view change; the commits they
            // hold are the round's only exit.
            debug!(
                new_view = %new_view,
                "view change quorum observed while locked; staying on commit"
            );
            return Ok(());
        }

        // Join an emerging view change once f+1 validators ask for one:
        // waiting for the full quorum would only add a timeout.
        let phase = self.context.phase();
        if self.can_sign() && !phase.is_locked() && phase != ConsensusPhase::ViewChanging {
            let target = self.context.view().next();
            let agreeing = self.context.count_change_views_at_least(target);
            if agreeing > self.context.byzantine_threshold() {
                return self
                    .request_change_view(ChangeViewReason::ChangeAgreement)
                    .await;
            }
        }
        Ok(())
    }

    /// Broadcasts this node's change view request for `view + 1`.
    async fn request_change_view(&mut self, reason: ChangeViewReason) -> Result<()> {
        if self.context.phase().is_locked() {
            // Locked on a commit: solicit other commits instead.
            return self.send_recovery_request().await;
        }
        if !self.can_sign() {
            return Ok(());
        }

        let new_view = self.context.view().next();
        let mut message = self.new_message(ConsensusMessageBody::ChangeView(ChangeView {
            new_view_number: new_view,
            timestamp: now_ms(),
            reason,
        }))?;
        self.sign_message(&mut message)?;

        let my_index = self.context.my_index().ok_or(Error::NotValidator)?;
        let committed = self.context.accept_change_view(my_index, message.clone())?;
        self.context.set_phase(ConsensusPhase::ViewChanging);

        info!(
            height = self.context.height(),
            view = %self.context.view(),
            new_view = %new_view,
            ?reason,
            "requesting view change"
        );
        self.broadcast(message).await?;

        if let Some(view) = committed {
            self.perform_view_change(view, reason).await?;
        }
        Ok(())
    }

    async fn perform_view_change(
        &mut self,
        new_view: ViewNumber,
        reason: ChangeViewReason,
    ) -> Result<()> {
        let old_view = self.context.view();
        self.context.reset_for_view(new_view);
        self.divergent_commits.clear();
        self.round_timer.start(new_view);
        self.recovery_timer.reset();

        {
            let mut stats = self.stats.write();
            stats.view_changes += 1;
            stats.current_view = new_view.value();
        }

        info!(
            height = self.context.height(),
            old_view = %old_view,
            new_view = %new_view,
            ?reason,
            "view change committed"
        );
        self.emit(DbftEvent::ViewChanged {
            block_index: self.context.height(),
            old_view,
            new_view,
            reason,
        });

        self.begin_view().await
    }

    // --- timers ---

    /// Handles the round deadline. Fires at most once per arm.
    pub async fn on_timer(&mut self) -> Result<()> {
        self.round_timer.disarm();
        let phase = self.context.phase();

        self.stats.write().timeouts += 1;
        warn!(
            height = self.context.height(),
            view = %self.context.view(),
            %phase,
            "round timer expired"
        );
        self.emit(DbftEvent::TimeoutFired {
            block_index: self.context.height(),
            view: self.context.view(),
            phase,
        });

        if phase.is_locked() {
            // Locked on our commit: solicit the missing commits instead of
            // abandoning the view.
            self.send_recovery_request().await?;
        } else {
            // A round that stalled on unresolvable transactions names the
            // real culprit.
            let reason = if phase == ConsensusPhase::RequestReceived
                && !self.context.missing_transactions().is_empty()
            {
                ChangeViewReason::TxNotFound
            } else {
                ChangeViewReason::Timeout
            };
            self.request_change_view(reason).await?;
        }

        // Re-arm with the next view's backoff unless a committed view
        // change already did.
        if self.round_timer.deadline().is_none() {
            self.round_timer.start(self.context.view().next());
        }
        Ok(())
    }

    /// Handles the recovery-idle deadline.
    pub async fn on_recovery_timer(&mut self) -> Result<()> {
        self.recovery_timer.reset();
        if self.context.phase() == ConsensusPhase::BlockSent {
            return Ok(());
        }
        self.send_recovery_request().await
    }

    async fn send_recovery_request(&mut self) -> Result<()> {
        if !self.can_sign() {
            return Ok(());
        }

        let mut message = self.new_message(ConsensusMessageBody::RecoveryRequest(
            RecoveryRequest { timestamp: now_ms() },
        ))?;
        self.sign_message(&mut message)?;

        self.stats.write().recovery_requests_sent += 1;
        debug!(
            height = self.context.height(),
            view = %self.context.view(),
            "soliciting recovery"
        );
        self.emit(DbftEvent::RecoveryRequested {
            block_index: self.context.height(),
            view: self.context.view(),
        });
        self.broadcast(message).await
    }

    // --- recovery ---

    async fn on_recovery_request(
        &mut self,
        index: u16,
        message: &ConsensusMessage,
    ) -> Result<()> {
        if !self.can_sign() {
            return Ok(());
        }
        if !self
            .reply_limiter
            .allow(message.validator_index, self.context.height())
        {
            self.stats.write().recovery_replies_throttled += 1;
            debug!(requester = index, "recovery reply throttled");
            return Ok(());
        }

        let recovery = RecoveryMessage::from_context(&self.context);
        let mut reply =
            self.new_message(ConsensusMessageBody::RecoveryMessage(recovery))?;
        self.sign_message(&mut reply)?;

        self.stats.write().recovery_replies_sent += 1;
        debug!(requester = index, "sending recovery reply");
        self.emit(DbftEvent::RecoveryReplied {
            block_index: self.context.height(),
            to: message.validator_index,
        });
        self.broadcast(reply).await
    }

    /// Ingests a recovery reply by replaying the reconstructed payloads
    /// through the normal validation and accept paths. Replaying known
    /// state is a no-op, and this node still performs its own preparation
    /// step before it can ever commit.
    ///
    /// Returns a boxed future: ingestion re-enters `process_message` for
    /// the reconstructed payloads, and the indirection keeps that async
    /// call graph finite.
    fn on_recovery_message(
        &mut self,
        message: ConsensusMessage,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let responder_view = message.view_number;
            let recovery = match message.body {
                ConsensusMessageBody::RecoveryMessage(recovery) => recovery,
                _ => return Ok(()),
            };
            let height = self.context.height();

            self.ingesting_recovery = true;
            let result = self
                .ingest_recovery(recovery, height, responder_view)
                .await;
            self.ingesting_recovery = false;
            result
        })
    }

    async fn ingest_recovery(
        &mut self,
        recovery: RecoveryMessage,
        height: u32,
        responder_view: ViewNumber,
    ) -> Result<()> {
        // Change views first: they may advance our view to the responder's.
        for cv in recovery.change_view_messages(height) {
            let _ = self.process_message(cv, None).await?;
        }

        // Round state is per-view; only ingest state for the view we are in.
        if responder_view != self.context.view() {
            return Ok(());
        }

        if let Some(request) = recovery.prepare_request.clone() {
            let valid_slot = matches!(request.body, ConsensusMessageBody::PrepareRequest(_))
                && request.block_index == height
                && request.view_number == responder_view;
            if valid_slot {
                let _ = self.process_message(*request, None).await?;
            }
        }

        for tx in recovery.transactions.clone() {
            self.context.register_transaction(tx);
        }

        for response in recovery.prepare_response_messages(height, responder_view) {
            let _ = self.process_message(response, None).await?;
        }

        for commit in recovery.commit_messages(height) {
            let _ = self.process_message(commit, None).await?;
        }

        // Transactions may have completed the proposal after the request
        // was ingested.
        if self.context.phase() == ConsensusPhase::RequestReceived
            && self.context.has_all_transactions()
        {
            self.verify_transactions_and_respond().await?;
        }
        self.try_finalize().await
    }

    // --- external events ---

    /// Handles a transaction arriving in the mempool.
    pub async fn on_transaction(&mut self, transaction: Transaction) -> Result<()> {
        if self.context.missing_transactions().is_empty() {
            return Ok(());
        }
        if !self.context.register_transaction(transaction) {
            return Ok(());
        }
        if !self.context.has_all_transactions() {
            return Ok(());
        }

        if self.context.phase() == ConsensusPhase::RequestReceived {
            self.verify_transactions_and_respond().await?;
        }
        self.try_finalize().await
    }

    /// Handles a block persisted by the ledger.
    pub async fn on_block_persisted(&mut self, height: u32) -> Result<()> {
        if height < self.context.height() {
            return Ok(()); // already past it
        }

        if height == self.context.height()
            && self.context.phase() == ConsensusPhase::BlockSent
        {
            let consensus_time_ms = self.round_started_at.elapsed().as_millis() as u64;
            self.stats.write().record_block_produced(consensus_time_ms);
        }

        self.start_round(height + 1).await
    }
}
