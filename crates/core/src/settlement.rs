//! Settlement Reporter: realized proceeds and treasury sweeps.
//!
//! Proceeds of a confirmed liquidation are measured as the liquidator
//! contract's debt-token balance change across the confirming block. They
//! accumulate as unswept balance until `withdraw(tokens)` moves them to the
//! treasury.

use crate::alert::{raise, AlertSender, OperatorAlert};
use crate::config::SettlementConfig;
use crate::coordinator::ExecutionAttempt;
use crate::error::{EngineError, EngineResult};
use crate::journal::{Journal, JournalEntry, JournalState};
use crate::u256_math::{usd_value, wad_to_f64};
use alloy::primitives::{Address, B256, U256};
use blueberry_chain::{
    with_retry, BankReader, ChainError, ChainSnapshot, LiquidationSubmitter, PositionId,
    RetryPolicy,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementRecord {
    pub position_id: PositionId,
    pub tx_hash: B256,
    pub token: Address,
    pub realized_amount: U256,
    pub realized_usd: U256,
    pub block_number: u64,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepRecord {
    pub tokens: Vec<Address>,
    pub tx_hash: B256,
    pub swept_usd: U256,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SettlementTotals {
    pub realized_usd: U256,
    pub settlements: usize,
    pub swept_usd: U256,
}

struct ReporterState {
    settled: HashSet<B256>,
    /// Raw token amounts not yet withdrawn.
    unswept: BTreeMap<Address, U256>,
    /// `token -> (price, decimals)` from the latest snapshot.
    prices: HashMap<Address, (U256, u8)>,
    totals: SettlementTotals,
    last_sweep: DateTime<Utc>,
    sweeping_disabled: bool,
}

impl ReporterState {
    fn value_of(&self, token: &Address, amount: U256) -> U256 {
        self.prices
            .get(token)
            .map(|(price, decimals)| usd_value(amount, *price, *decimals))
            .unwrap_or_default()
    }

    fn unswept_usd(&self) -> U256 {
        self.unswept
            .iter()
            .fold(U256::ZERO, |acc, (token, amount)| {
                acc.saturating_add(self.value_of(token, *amount))
            })
    }
}

pub struct SettlementReporter {
    bank: Arc<dyn BankReader>,
    submitter: Arc<dyn LiquidationSubmitter>,
    retry: RetryPolicy,
    config: SettlementConfig,
    journal: Arc<Journal>,
    alerts: AlertSender,
    state: Mutex<ReporterState>,
}

impl SettlementReporter {
    pub fn new(
        bank: Arc<dyn BankReader>,
        submitter: Arc<dyn LiquidationSubmitter>,
        retry: RetryPolicy,
        config: SettlementConfig,
        journal: Arc<Journal>,
        alerts: AlertSender,
    ) -> Self {
        Self {
            bank,
            submitter,
            retry,
            config,
            journal,
            alerts,
            state: Mutex::new(ReporterState {
                settled: HashSet::new(),
                unswept: BTreeMap::new(),
                prices: HashMap::new(),
                totals: SettlementTotals::default(),
                last_sweep: Utc::now(),
                sweeping_disabled: false,
            }),
        }
    }

    /// Rebuild totals and unswept balances from a journal replay.
    pub fn restore(&self, journal: &JournalState) {
        let mut state = self.state.lock();
        for record in &journal.settlements {
            if !state.settled.insert(record.tx_hash) {
                continue;
            }
            state.totals.settlements += 1;
            state.totals.realized_usd = state.totals.realized_usd.saturating_add(record.realized_usd);
            let swept_later = journal
                .sweeps
                .iter()
                .any(|s| s.recorded_at >= record.recorded_at && s.tokens.contains(&record.token));
            if !swept_later {
                let entry = state.unswept.entry(record.token).or_default();
                *entry = entry.saturating_add(record.realized_amount);
            }
        }
        for sweep in &journal.sweeps {
            state.totals.swept_usd = state.totals.swept_usd.saturating_add(sweep.swept_usd);
        }
        if let Some(last) = journal.sweeps.iter().map(|s| s.recorded_at).max() {
            state.last_sweep = last;
        }
        info!(
            settlements = state.totals.settlements,
            realized_usd = wad_to_f64(state.totals.realized_usd),
            unswept_tokens = state.unswept.len(),
            "Settlement state restored"
        );
    }

    /// Latest oracle prices for valuing proceeds.
    pub fn update_prices(&self, snapshot: &ChainSnapshot) {
        let mut state = self.state.lock();
        for (token, quote) in &snapshot.prices {
            state
                .prices
                .insert(*token, (quote.price, snapshot.decimals_of(token)));
        }
    }

    pub fn is_settled(&self, tx_hash: &B256) -> bool {
        self.state.lock().settled.contains(tx_hash)
    }

    /// Record the proceeds of a liquidation confirmed in `block`.
    ///
    /// Returns `None` when this transaction was already recorded.
    #[instrument(skip(self, attempt), fields(position_id = attempt.position_id, tx_hash = %attempt.tx_hash))]
    pub async fn record_confirmed(
        &self,
        attempt: &ExecutionAttempt,
        block: u64,
    ) -> EngineResult<Option<SettlementRecord>> {
        if self.is_settled(&attempt.tx_hash) {
            debug!("Settlement already recorded");
            return Ok(None);
        }

        let token = attempt.debt_token;
        let holder = self.submitter.liquidator_address();
        let bank = &self.bank;
        let (after, before) = tokio::try_join!(
            with_retry(&self.retry, "balanceOf", || bank.balance_of(token, holder, Some(block))),
            with_retry(&self.retry, "balanceOf", || {
                bank.balance_of(token, holder, Some(block.saturating_sub(1)))
            }),
        )?;
        let realized_amount = after.saturating_sub(before);

        let record = {
            let mut state = self.state.lock();
            if !state.settled.insert(attempt.tx_hash) {
                return Ok(None);
            }
            if !state.prices.contains_key(&token) {
                warn!(token = %token, "No price for proceeds token, recording zero USD");
            }
            let realized_usd = state.value_of(&token, realized_amount);
            state.totals.settlements += 1;
            state.totals.realized_usd = state.totals.realized_usd.saturating_add(realized_usd);
            let entry = state.unswept.entry(token).or_default();
            *entry = entry.saturating_add(realized_amount);

            SettlementRecord {
                position_id: attempt.position_id,
                tx_hash: attempt.tx_hash,
                token,
                realized_amount,
                realized_usd,
                block_number: block,
                recorded_at: Utc::now(),
            }
        };

        self.journal.append(&JournalEntry::Settlement(record.clone()))?;
        info!(
            block,
            realized_amount = %record.realized_amount,
            realized_usd = format!("${:.2}", wad_to_f64(record.realized_usd)),
            "Liquidation settled"
        );
        Ok(Some(record))
    }

    /// Tokens to withdraw and their USD value, when a sweep is due at `now`.
    fn due_sweep(&self, now: DateTime<Utc>) -> Option<(Vec<Address>, U256)> {
        let state = self.state.lock();
        if !self.config.sweep_enabled || state.sweeping_disabled {
            return None;
        }
        let tokens: Vec<Address> = state
            .unswept
            .iter()
            .filter(|(_, amount)| !amount.is_zero())
            .map(|(token, _)| *token)
            .collect();
        if tokens.is_empty() {
            return None;
        }
        let unswept_usd = state.unswept_usd();
        let elapsed = (now - state.last_sweep).to_std().unwrap_or_default();
        let due = unswept_usd >= self.config.sweep_threshold_wad()
            || elapsed >= self.config.sweep_interval();
        if !due {
            debug!(unswept_usd = wad_to_f64(unswept_usd), "Sweep not due");
            return None;
        }
        Some((tokens, unswept_usd))
    }

    /// Unswept proceeds are over the threshold or overdue.
    pub fn sweep_due(&self, now: DateTime<Utc>) -> bool {
        self.due_sweep(now).is_some()
    }

    /// Withdraw unswept proceeds when over the threshold or overdue.
    ///
    /// Sends a transaction from the signer, so only the execution
    /// coordinator calls this.
    #[instrument(skip(self))]
    pub async fn maybe_sweep(&self, now: DateTime<Utc>) -> EngineResult<Option<SweepRecord>> {
        let Some((tokens, swept_usd)) = self.due_sweep(now) else {
            return Ok(None);
        };

        let tx_hash = match self.submitter.withdraw(&tokens).await {
            Ok(hash) => hash,
            Err(ChainError::OwnershipRejected { reason }) => {
                self.state.lock().sweeping_disabled = true;
                error!(reason = %reason, "Sweep rejected by ownership check, sweeping disabled");
                raise(
                    &self.alerts,
                    OperatorAlert::OwnershipRejected {
                        operation: "withdraw".into(),
                        reason: reason.clone(),
                    },
                );
                return Err(ChainError::OwnershipRejected { reason }.into());
            }
            Err(e) => {
                warn!(error = %e, "Sweep failed, will retry");
                return Err(EngineError::Chain(e));
            }
        };

        {
            let mut state = self.state.lock();
            for token in &tokens {
                state.unswept.remove(token);
            }
            state.totals.swept_usd = state.totals.swept_usd.saturating_add(swept_usd);
            state.last_sweep = now;
        }

        let record = SweepRecord {
            tokens,
            tx_hash,
            swept_usd,
            recorded_at: now,
        };
        self.journal.append(&JournalEntry::Sweep(record.clone()))?;
        info!(
            tx_hash = %tx_hash,
            tokens = record.tokens.len(),
            swept_usd = format!("${:.2}", wad_to_f64(swept_usd)),
            "Proceeds swept to treasury"
        );
        Ok(Some(record))
    }

    pub fn totals(&self) -> SettlementTotals {
        self.state.lock().totals
    }

    pub fn unswept(&self) -> BTreeMap<Address, U256> {
        self.state.lock().unswept.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::alert_channel;
    use crate::coordinator::AttemptStatus;
    use crate::test_support::*;
    use crate::u256_math::WAD;
    use blueberry_chain::{GasParams, GWEI};
    use std::sync::atomic::Ordering;

    fn confirmed(n: u8) -> ExecutionAttempt {
        ExecutionAttempt {
            position_id: n as u64,
            debt_token: DAI,
            tx_hash: B256::with_last_byte(n),
            nonce: n as u64,
            gas: GasParams::Legacy { gas_price: GWEI },
            submitted_at_block: 99,
            bumps: 0,
            status: AttemptStatus::Confirmed,
            updated_at: Utc::now(),
        }
    }

    fn reporter(
        bank: Arc<MockBank>,
        submitter: Arc<MockSubmitter>,
        config: SettlementConfig,
    ) -> (SettlementReporter, crate::alert::AlertReceiver) {
        let (alerts, rx) = alert_channel();
        let retry = RetryPolicy {
            max_attempts: 2,
            base_delay_ms: 1,
            max_delay_ms: 1,
        };
        let reporter = SettlementReporter::new(
            bank,
            submitter,
            retry,
            config,
            Arc::new(Journal::disabled()),
            alerts,
        );
        reporter.update_prices(&snapshot_with(WAD * U256::from(2u64), &[]));
        (reporter, rx)
    }

    fn bank_with_proceeds() -> Arc<MockBank> {
        let bank = Arc::new(MockBank::at(101));
        bank.set_balance(DAI, 0, dai(10));
        bank.set_balance(DAI, 101, dai(400));
        bank
    }

    #[tokio::test]
    async fn test_realized_amount_is_balance_delta() {
        let (reporter, _rx) = reporter(
            bank_with_proceeds(),
            Arc::new(MockSubmitter::new()),
            SettlementConfig::default(),
        );

        let record = reporter
            .record_confirmed(&confirmed(1), 101)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.realized_amount, dai(390));
        // DAI at $2
        assert_eq!(record.realized_usd, usd(780));
        assert_eq!(reporter.unswept()[&DAI], dai(390));
    }

    #[tokio::test]
    async fn test_replayed_confirmation_is_idempotent() {
        let bank = bank_with_proceeds();
        let (reporter, _rx) = reporter(
            bank.clone(),
            Arc::new(MockSubmitter::new()),
            SettlementConfig::default(),
        );

        reporter.record_confirmed(&confirmed(1), 101).await.unwrap();
        let reads = bank.balance_reads.load(Ordering::SeqCst);
        let again = reporter.record_confirmed(&confirmed(1), 101).await.unwrap();

        assert!(again.is_none());
        assert_eq!(bank.balance_reads.load(Ordering::SeqCst), reads);
        let totals = reporter.totals();
        assert_eq!(totals.settlements, 1);
        assert_eq!(totals.realized_usd, usd(780));
    }

    #[tokio::test]
    async fn test_sweep_on_threshold() {
        let submitter = Arc::new(MockSubmitter::new());
        let config = SettlementConfig {
            sweep_threshold_usd: 500.0,
            ..Default::default()
        };
        let (reporter, _rx) = reporter(bank_with_proceeds(), submitter.clone(), config);

        // Nothing to sweep yet.
        assert!(reporter.maybe_sweep(Utc::now()).await.unwrap().is_none());

        reporter.record_confirmed(&confirmed(1), 101).await.unwrap();
        let sweep = reporter.maybe_sweep(Utc::now()).await.unwrap().unwrap();

        assert_eq!(sweep.tokens, vec![DAI]);
        assert_eq!(sweep.swept_usd, usd(780));
        assert_eq!(submitter.withdrawals.lock().len(), 1);
        assert!(reporter.unswept().is_empty());
        assert_eq!(reporter.totals().swept_usd, usd(780));
    }

    #[tokio::test]
    async fn test_sweep_waits_for_threshold_or_interval() {
        let submitter = Arc::new(MockSubmitter::new());
        let config = SettlementConfig {
            sweep_threshold_usd: 10_000.0,
            sweep_interval_secs: 3_600,
            ..Default::default()
        };
        let (reporter, _rx) = reporter(bank_with_proceeds(), submitter.clone(), config);
        reporter.record_confirmed(&confirmed(1), 101).await.unwrap();

        assert!(reporter.maybe_sweep(Utc::now()).await.unwrap().is_none());
        assert!(submitter.withdrawals.lock().is_empty());

        let later = Utc::now() + chrono::Duration::seconds(3_601);
        assert!(!reporter.sweep_due(Utc::now()));
        assert!(reporter.sweep_due(later));
        assert!(reporter.maybe_sweep(later).await.unwrap().is_some());
        assert!(!reporter.sweep_due(later));
    }

    #[tokio::test]
    async fn test_sweep_ownership_rejected_disables_sweeping() {
        let submitter = Arc::new(MockSubmitter::not_owner());
        let config = SettlementConfig {
            sweep_threshold_usd: 1.0,
            ..Default::default()
        };
        let (reporter, mut rx) = reporter(bank_with_proceeds(), submitter.clone(), config);
        reporter.record_confirmed(&confirmed(1), 101).await.unwrap();

        let err = reporter.maybe_sweep(Utc::now()).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Chain(ChainError::OwnershipRejected { .. })
        ));
        // Still over the threshold, but no longer due.
        assert!(!reporter.sweep_due(Utc::now()));
        assert_eq!(reporter.unswept()[&DAI], dai(390));
        assert!(matches!(
            rx.try_recv().unwrap(),
            OperatorAlert::OwnershipRejected { .. }
        ));

        // Not retried.
        assert!(reporter.maybe_sweep(Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_restore_from_journal() {
        let (reporter, _rx) = reporter(
            bank_with_proceeds(),
            Arc::new(MockSubmitter::new()),
            SettlementConfig::default(),
        );
        let t0 = Utc::now();
        let settlement = |n: u8, at: DateTime<Utc>| SettlementRecord {
            position_id: n as u64,
            tx_hash: B256::with_last_byte(n),
            token: DAI,
            realized_amount: dai(100),
            realized_usd: usd(200),
            block_number: 100 + n as u64,
            recorded_at: at,
        };
        let state = JournalState {
            settlements: vec![
                settlement(1, t0),
                settlement(2, t0 + chrono::Duration::seconds(20)),
            ],
            sweeps: vec![SweepRecord {
                tokens: vec![DAI],
                tx_hash: B256::repeat_byte(0xee),
                swept_usd: usd(200),
                recorded_at: t0 + chrono::Duration::seconds(10),
            }],
            ..Default::default()
        };

        reporter.restore(&state);

        let totals = reporter.totals();
        assert_eq!(totals.settlements, 2);
        assert_eq!(totals.realized_usd, usd(400));
        assert_eq!(totals.swept_usd, usd(200));
        // Only the settlement after the sweep is still unswept.
        assert_eq!(reporter.unswept()[&DAI], dai(100));
        assert!(reporter.is_settled(&B256::with_last_byte(1)));
        assert!(reporter
            .record_confirmed(&confirmed(1), 101)
            .await
            .unwrap()
            .is_none());
    }
}
