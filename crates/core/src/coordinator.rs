//! Execution Coordinator.
//!
//! One task owns every piece of execution state and is the only submitter
//! for the signer, so nonces go out strictly in order. Other components talk
//! to it through [`CoordinatorCommand`]s.
//!
//! Per position: `Idle -> Planned -> Submitted -> {Confirmed | Reverted |
//! Superseded} -> Idle`. A reverted position stays `Idle` but cools down for
//! `cooldown_blocks` before it is planned again.

use crate::alert::{raise, AlertSender, OperatorAlert};
use crate::config::ExecutionConfig;
use crate::error::EngineError;
use crate::journal::{Journal, JournalEntry, JournalState};
use crate::planner::LiquidationPlan;
use crate::settlement::SettlementReporter;
use crate::u256_math::{amount_for_usd, mul_bps, wad_to_f64};
use alloy::primitives::{Address, B256, U256};
use blueberry_chain::{
    with_retry, BankReader, ChainError, GasParams, LiquidationSubmitter, PositionId, RetryPolicy,
    TxStatus,
};
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Pending,
    Confirmed,
    Reverted,
    /// Replaced by a same-nonce transaction with a higher bid.
    Superseded,
}

/// One broadcast `liquidate` transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionAttempt {
    pub position_id: PositionId,
    pub debt_token: Address,
    pub tx_hash: B256,
    pub nonce: u64,
    pub gas: GasParams,
    pub submitted_at_block: u64,
    /// Replacements so far for this nonce.
    pub bumps: u32,
    pub status: AttemptStatus,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Planned,
    Submitted,
}

/// Positions with a liquidation in flight.
///
/// Cloned handles share one set. Only the coordinator acquires entries;
/// everyone else may read.
#[derive(Debug, Clone, Default)]
pub struct InFlightSet {
    inner: Arc<DashSet<PositionId>>,
}

impl InFlightSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, position_id: PositionId) -> bool {
        self.inner.contains(&position_id)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Lock `position_id`; `None` if it already is.
    pub(crate) fn try_acquire(&self, position_id: PositionId) -> Option<InFlightGuard> {
        self.inner.insert(position_id).then(|| InFlightGuard {
            set: self.inner.clone(),
            position_id,
        })
    }
}

/// Releases its position when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    set: Arc<DashSet<PositionId>>,
    position_id: PositionId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.remove(&self.position_id);
    }
}

#[derive(Debug)]
pub enum CoordinatorCommand {
    /// Risk results for a fresh snapshot.
    Evaluated {
        block: u64,
        watchlist: HashSet<PositionId>,
        liquidatable: HashSet<PositionId>,
    },
    Plan(LiquidationPlan),
    /// Poll attempts, then submit whatever is ready.
    Tick { block: u64 },
    /// Clear a funding halt.
    Resume,
    /// Positions that must not be planned at `block`.
    Busy {
        block: u64,
        reply: oneshot::Sender<HashSet<PositionId>>,
    },
    /// Withdraw proceeds to the treasury if a sweep is due.
    Sweep,
}

struct ActiveAttempt {
    attempt: ExecutionAttempt,
    /// Highest gas price a replacement may bid.
    gas_ceiling: u128,
    /// Earlier hashes for the same nonce; any of them may still be mined.
    superseded: Vec<B256>,
    _guard: InFlightGuard,
}

pub struct Coordinator {
    submitter: Arc<dyn LiquidationSubmitter>,
    bank: Arc<dyn BankReader>,
    retry: RetryPolicy,
    config: ExecutionConfig,
    in_flight: InFlightSet,
    planned: HashMap<PositionId, LiquidationPlan>,
    liquidatable: HashSet<PositionId>,
    active: HashMap<PositionId, ActiveAttempt>,
    cooldowns: HashMap<PositionId, u64>,
    /// Confirmed attempts whose settlement read failed.
    unsettled: Vec<(ExecutionAttempt, u64)>,
    halted: Option<String>,
    current_block: u64,
    journal: Arc<Journal>,
    settlement: Arc<SettlementReporter>,
    alerts: AlertSender,
}

impl Coordinator {
    pub fn new(
        submitter: Arc<dyn LiquidationSubmitter>,
        bank: Arc<dyn BankReader>,
        retry: RetryPolicy,
        config: ExecutionConfig,
        journal: Arc<Journal>,
        settlement: Arc<SettlementReporter>,
        alerts: AlertSender,
    ) -> Self {
        Self {
            submitter,
            bank,
            retry,
            config,
            in_flight: InFlightSet::new(),
            planned: HashMap::new(),
            liquidatable: HashSet::new(),
            active: HashMap::new(),
            cooldowns: HashMap::new(),
            unsettled: Vec::new(),
            halted: None,
            current_block: 0,
            journal,
            settlement,
            alerts,
        }
    }

    pub fn in_flight(&self) -> InFlightSet {
        self.in_flight.clone()
    }

    pub fn phase(&self, position_id: PositionId) -> Phase {
        if self.active.contains_key(&position_id) {
            Phase::Submitted
        } else if self.planned.contains_key(&position_id) {
            Phase::Planned
        } else {
            Phase::Idle
        }
    }

    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    pub fn cooldown_until(&self, position_id: PositionId) -> Option<u64> {
        self.cooldowns.get(&position_id).copied()
    }

    fn is_cooling(&self, position_id: PositionId, block: u64) -> bool {
        self.cooldowns
            .get(&position_id)
            .is_some_and(|until| block < *until)
    }

    /// In flight or cooling down at `block`.
    pub fn busy(&self, block: u64) -> HashSet<PositionId> {
        self.active
            .keys()
            .copied()
            .chain(
                self.cooldowns
                    .iter()
                    .filter(|(_, until)| block < **until)
                    .map(|(id, _)| *id),
            )
            .collect()
    }

    /// Rebuild in-flight attempts from a journal replay so they are polled
    /// again.
    pub fn restore(&mut self, state: &JournalState) {
        let mut latest: HashMap<PositionId, ExecutionAttempt> = HashMap::new();
        let mut hashes: HashMap<PositionId, Vec<B256>> = HashMap::new();

        let unsettled_confirmed = state.attempts.values().filter(|a| {
            a.status == AttemptStatus::Confirmed && !self.settlement.is_settled(&a.tx_hash)
        });
        for attempt in state.pending_attempts().iter().chain(unsettled_confirmed) {
            hashes
                .entry(attempt.position_id)
                .or_default()
                .push(attempt.tx_hash);
            let keep = latest
                .get(&attempt.position_id)
                .map_or(true, |current| attempt.bumps > current.bumps);
            if keep {
                latest.insert(attempt.position_id, attempt.clone());
            }
        }

        for (position_id, mut attempt) in latest {
            let Some(guard) = self.in_flight.try_acquire(position_id) else {
                continue;
            };
            let superseded = hashes
                .remove(&position_id)
                .unwrap_or_default()
                .into_iter()
                .filter(|h| *h != attempt.tx_hash)
                .collect();
            attempt.status = AttemptStatus::Pending;
            info!(
                position_id,
                tx_hash = %attempt.tx_hash,
                nonce = attempt.nonce,
                "Resuming attempt from journal"
            );
            self.active.insert(
                position_id,
                ActiveAttempt {
                    attempt,
                    gas_ceiling: self.config.max_gas_price_wei(),
                    superseded,
                    _guard: guard,
                },
            );
        }
    }

    /// Queue a plan. Returns whether it was accepted.
    pub fn accept_plan(&mut self, plan: LiquidationPlan) -> bool {
        let id = plan.position_id;
        if self.in_flight.contains(id) || self.active.contains_key(&id) {
            debug!(position_id = id, "Plan ignored, liquidation in flight");
            return false;
        }
        if self.is_cooling(id, self.current_block.max(plan.planned_at_block)) {
            debug!(position_id = id, "Plan ignored, position cooling down");
            return false;
        }
        if let Some(old) = self.planned.insert(id, plan) {
            debug!(
                position_id = id,
                replaced_block = old.planned_at_block,
                "Replaced older plan"
            );
        }
        true
    }

    /// Drop plans whose positions left the watchlist and remember which are
    /// liquidatable now.
    pub fn on_evaluation(
        &mut self,
        block: u64,
        watchlist: &HashSet<PositionId>,
        liquidatable: HashSet<PositionId>,
    ) {
        self.current_block = self.current_block.max(block);
        self.planned.retain(|id, _| {
            let keep = watchlist.contains(id);
            if !keep {
                debug!(position_id = *id, "Position recovered, plan cancelled");
            }
            keep
        });
        self.liquidatable = liquidatable;
    }

    /// Most a bid may pay per gas: the configured ceiling, and the share of
    /// expected proceeds gas may consume.
    fn gas_ceiling(&self, plan: &LiquidationPlan) -> u128 {
        let max_wei = self.config.max_gas_price_wei();
        if plan.native_price_usd.is_zero() || plan.gas_limit == 0 {
            return max_wei;
        }
        let budget_usd = mul_bps(plan.expected_proceeds_usd, self.config.max_gas_share_bps);
        let budget_wei = amount_for_usd(budget_usd, plan.native_price_usd, 18);
        let per_gas: u128 = (budget_wei / U256::from(plan.gas_limit)).saturating_to();
        per_gas.min(max_wei)
    }

    fn gas_bid(&self, market: GasParams, ceiling: u128) -> GasParams {
        market.scaled_bps(self.config.multiplier_bps(), ceiling)
    }

    fn journal_attempt(&self, attempt: &ExecutionAttempt) {
        if let Err(e) = self.journal.append(&JournalEntry::Attempt(attempt.clone())) {
            error!(position_id = attempt.position_id, error = %e, "Failed to journal attempt");
        }
    }

    /// Chain head, never below `floor`. Quoting takes time, so the block a
    /// tick was issued at can be behind by the time a plan is submitted.
    async fn chain_head(&self, floor: u64) -> Result<u64, ChainError> {
        let bank = &self.bank;
        let head = with_retry(&self.retry, "eth_blockNumber", || bank.block_number()).await?;
        Ok(head.max(floor))
    }

    /// Submit every ready plan whose position is liquidatable, most
    /// profitable first. Returns the number submitted.
    ///
    /// Expiry is checked against the head read just before each submission.
    #[instrument(skip(self), fields(planned = self.planned.len()))]
    pub async fn submit_ready(&mut self, current_block: u64) -> usize {
        self.current_block = self.current_block.max(current_block);
        if let Some(reason) = &self.halted {
            debug!(reason = %reason, "Submission halted");
            return 0;
        }

        let mut ready: Vec<(PositionId, U256)> = self
            .planned
            .iter()
            .filter(|(id, _)| self.liquidatable.contains(id))
            .map(|(id, plan)| (*id, plan.expected_net_usd))
            .collect();
        ready.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        let mut submitted = 0;
        for (id, _) in ready {
            let Some(plan) = self.planned.remove(&id) else {
                continue;
            };

            let head = match self.chain_head(self.current_block).await {
                Ok(head) => head,
                Err(e) => {
                    warn!(position_id = id, error = %e, "Head unavailable, submission deferred");
                    self.planned.insert(id, plan);
                    break;
                }
            };
            self.current_block = head;

            if plan.is_expired(head) {
                let stale = EngineError::StaleQuote {
                    position_id: id,
                    expires_at_block: plan.expires_at_block,
                    current_block: head,
                };
                warn!(position_id = id, "{stale}, discarding plan");
                continue;
            }

            let Some(guard) = self.in_flight.try_acquire(id) else {
                continue;
            };

            if self.config.confirm_on_chain {
                match self.bank.is_liquidatable(id).await {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(position_id = id, "Bank reports position healthy, skipping");
                        continue;
                    }
                    Err(e) => {
                        warn!(position_id = id, error = %e, "Liquidatable check failed, plan kept");
                        self.planned.insert(id, plan);
                        continue;
                    }
                }
            }

            let market = match self.submitter.gas_params().await {
                Ok(params) => params,
                Err(e) => {
                    warn!(position_id = id, error = %e, "Gas price unavailable, plan kept");
                    self.planned.insert(id, plan);
                    continue;
                }
            };
            let gas_ceiling = self.gas_ceiling(&plan);
            let bid = self.gas_bid(market, gas_ceiling);

            match self.submitter.submit_liquidation(id, bid, None).await {
                Ok(tx) => {
                    let attempt = ExecutionAttempt {
                        position_id: id,
                        debt_token: plan.debt_token,
                        tx_hash: tx.tx_hash,
                        nonce: tx.nonce,
                        gas: tx.gas,
                        submitted_at_block: head,
                        bumps: 0,
                        status: AttemptStatus::Pending,
                        updated_at: Utc::now(),
                    };
                    self.journal_attempt(&attempt);
                    info!(
                        position_id = id,
                        tx_hash = %tx.tx_hash,
                        nonce = tx.nonce,
                        gas_price = tx.gas.effective_gas_price(),
                        expected_net_usd = format!("${:.2}", wad_to_f64(plan.expected_net_usd)),
                        "Liquidation submitted"
                    );
                    self.active.insert(
                        id,
                        ActiveAttempt {
                            attempt,
                            gas_ceiling,
                            superseded: Vec::new(),
                            _guard: guard,
                        },
                    );
                    submitted += 1;
                }
                Err(e) => {
                    let requeue = self.on_submit_error(id, e);
                    if requeue {
                        self.planned.insert(id, plan);
                    }
                    if self.halted.is_some() {
                        break;
                    }
                }
            }
        }
        submitted
    }

    /// Returns whether the plan should stay queued.
    fn on_submit_error(&mut self, position_id: PositionId, e: ChainError) -> bool {
        match e {
            ChainError::InsufficientFunds { signer } => {
                let signer = if signer.is_zero() {
                    self.submitter.signer()
                } else {
                    signer
                };
                error!(position_id, signer = %signer, "Signer out of funds, halting submission");
                self.halted = Some(format!("insufficient funds for {signer}"));
                raise(&self.alerts, OperatorAlert::InsufficientFunds { signer });
                true
            }
            ChainError::OwnershipRejected { reason } => {
                error!(position_id, reason = %reason, "Liquidation rejected by ownership check");
                raise(
                    &self.alerts,
                    OperatorAlert::OwnershipRejected {
                        operation: "liquidate".into(),
                        reason,
                    },
                );
                false
            }
            ChainError::TransactionReverted { reason, .. } => {
                warn!(position_id, reason = %reason, "Liquidation would revert, cooling down");
                self.cooldowns
                    .insert(position_id, self.current_block + self.config.cooldown_blocks);
                false
            }
            e @ (ChainError::ChainUnavailable { .. } | ChainError::Rpc(_)) => {
                warn!(position_id, error = %e, "Submission failed, plan kept");
                true
            }
        }
    }

    /// Status of the current hash, falling back to superseded ones.
    async fn resolve(&self, active: &ActiveAttempt) -> Result<(B256, TxStatus), ChainError> {
        let hashes = std::iter::once(active.attempt.tx_hash).chain(active.superseded.iter().copied());
        for hash in hashes {
            let status = self.submitter.transaction_status(hash).await?;
            if status != TxStatus::Pending {
                return Ok((hash, status));
            }
        }
        Ok((active.attempt.tx_hash, TxStatus::Pending))
    }

    /// Resolve confirmations and reverts; bump stuck transactions.
    #[instrument(skip(self), fields(active = self.active.len()))]
    pub async fn poll_attempts(&mut self, current_block: u64) {
        self.current_block = self.current_block.max(current_block);
        let ids: Vec<PositionId> = self.active.keys().copied().collect();

        for id in ids {
            let Some(active) = self.active.get(&id) else {
                continue;
            };
            let (hash, status) = match self.resolve(active).await {
                Ok(resolved) => resolved,
                Err(e) => {
                    warn!(position_id = id, error = %e, "Receipt lookup failed");
                    continue;
                }
            };

            match status {
                TxStatus::Confirmed { block, gas_used } => {
                    let Some(active) = self.active.remove(&id) else {
                        continue;
                    };
                    let mut attempt = active.attempt;
                    attempt.tx_hash = hash;
                    attempt.status = AttemptStatus::Confirmed;
                    attempt.updated_at = Utc::now();
                    self.journal_attempt(&attempt);
                    info!(position_id = id, tx_hash = %hash, block, gas_used, "Liquidation confirmed");
                    if self.position_cleared(id, block).await == Some(false) {
                        warn!(position_id = id, block, "Position still holds collateral after liquidation");
                    }
                    self.settle(attempt, block).await;
                }
                TxStatus::Reverted { block } => {
                    let Some(active) = self.active.remove(&id) else {
                        continue;
                    };
                    let mut attempt = active.attempt;
                    attempt.tx_hash = hash;
                    attempt.status = AttemptStatus::Reverted;
                    attempt.updated_at = Utc::now();
                    self.journal_attempt(&attempt);
                    let until = block.max(current_block) + self.config.cooldown_blocks;
                    self.cooldowns.insert(id, until);
                    warn!(position_id = id, tx_hash = %hash, block, cooldown_until = until, "Liquidation reverted");
                    raise(
                        &self.alerts,
                        OperatorAlert::LiquidationReverted {
                            position_id: id,
                            tx_hash: hash.to_string(),
                        },
                    );
                }
                TxStatus::Pending => self.maybe_bump(id, current_block).await,
            }
        }
    }

    /// Whether the bank shows the position emptied at `block`; `None` when
    /// the read fails.
    async fn position_cleared(&self, id: PositionId, block: u64) -> Option<bool> {
        match self.bank.position_info(id, block).await {
            Ok(info) => Some(info.is_liquidated()),
            Err(e) => {
                debug!(position_id = id, error = %e, "Post-liquidation read failed");
                None
            }
        }
    }

    async fn maybe_bump(&mut self, id: PositionId, current_block: u64) {
        let Some(active) = self.active.get(&id) else {
            return;
        };
        let attempt = &active.attempt;
        if current_block.saturating_sub(attempt.submitted_at_block) < self.config.stuck_after_blocks {
            return;
        }
        if self.halted.is_some() {
            return;
        }
        if attempt.bumps >= self.config.max_gas_bumps {
            debug!(position_id = id, bumps = attempt.bumps, "Max gas bumps reached, waiting");
            return;
        }
        let bumped = attempt.gas.bumped(self.config.gas_bump_bps, active.gas_ceiling);
        if !bumped.replaces(&attempt.gas) {
            debug!(
                position_id = id,
                bump_bps = self.config.gas_bump_bps,
                "No room for a replacement bid under the ceiling, waiting"
            );
            return;
        }
        let nonce = attempt.nonce;

        match self.submitter.submit_liquidation(id, bumped, Some(nonce)).await {
            Ok(tx) => {
                let Some(active) = self.active.get_mut(&id) else {
                    return;
                };
                let mut old = active.attempt.clone();
                old.status = AttemptStatus::Superseded;
                old.updated_at = Utc::now();

                active.superseded.push(old.tx_hash);
                active.attempt.tx_hash = tx.tx_hash;
                active.attempt.gas = tx.gas;
                active.attempt.bumps += 1;
                active.attempt.submitted_at_block = current_block;
                active.attempt.updated_at = Utc::now();
                let new = active.attempt.clone();

                self.journal_attempt(&old);
                self.journal_attempt(&new);
                info!(
                    position_id = id,
                    nonce,
                    old_tx = %old.tx_hash,
                    tx_hash = %new.tx_hash,
                    gas_price = new.gas.effective_gas_price(),
                    bumps = new.bumps,
                    "Stuck liquidation replaced with higher gas"
                );
            }
            // The original transaction is still pending; nothing to requeue.
            Err(e) if e.is_permanent() => {
                let _ = self.on_submit_error(id, e);
            }
            Err(e) => {
                warn!(position_id = id, nonce, error = %e, "Replacement rejected, original still pending");
            }
        }
    }

    async fn settle(&mut self, attempt: ExecutionAttempt, block: u64) {
        if let Err(e) = self.settlement.record_confirmed(&attempt, block).await {
            warn!(position_id = attempt.position_id, error = %e, "Settlement failed, will retry");
            self.unsettled.push((attempt, block));
        }
    }

    async fn retry_settlements(&mut self) {
        for (attempt, block) in std::mem::take(&mut self.unsettled) {
            self.settle(attempt, block).await;
        }
    }

    pub fn resume(&mut self) {
        if let Some(reason) = self.halted.take() {
            info!(reason = %reason, "Submission resumed");
        }
    }

    /// Runs here so the withdrawal takes its nonce in line with liquidations.
    async fn sweep(&self) {
        if self.halted.is_some() {
            debug!("Submission halted, sweep skipped");
            return;
        }
        match self.settlement.maybe_sweep(Utc::now()).await {
            Ok(Some(sweep)) => debug!(tx_hash = %sweep.tx_hash, "Sweep sent"),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Sweep failed"),
        }
    }

    /// One coordinator cycle at `block`.
    pub async fn tick(&mut self, block: u64) {
        self.current_block = self.current_block.max(block);
        self.poll_attempts(block).await;
        self.retry_settlements().await;
        self.submit_ready(block).await;
        self.cooldowns.retain(|_, until| block < *until);
    }

    pub async fn handle(&mut self, command: CoordinatorCommand) {
        match command {
            CoordinatorCommand::Evaluated {
                block,
                watchlist,
                liquidatable,
            } => self.on_evaluation(block, &watchlist, liquidatable),
            CoordinatorCommand::Plan(plan) => {
                self.accept_plan(plan);
            }
            CoordinatorCommand::Tick { block } => self.tick(block).await,
            CoordinatorCommand::Resume => self.resume(),
            CoordinatorCommand::Busy { block, reply } => {
                let _ = reply.send(self.busy(block));
            }
            CoordinatorCommand::Sweep => self.sweep().await,
        }
    }

    /// Consume commands until every sender is gone.
    pub async fn run(mut self, mut commands: mpsc::Receiver<CoordinatorCommand>) {
        info!("Execution coordinator started");
        while let Some(command) = commands.recv().await {
            self.handle(command).await;
        }
        info!(
            in_flight = self.active.len(),
            planned = self.planned.len(),
            "Execution coordinator stopped"
        );
    }
}
