//! Wires the reader, risk evaluation, planner, coordinator and settlement
//! into background tasks.
//!
//! Data flows one way: the reader publishes snapshots on a `watch` channel,
//! the evaluator turns each fresh snapshot into coordinator commands, and the
//! coordinator is the only task that submits transactions.

use crate::alert::{raise, AlertSender, OperatorAlert};
use crate::config::EngineConfig;
use crate::coordinator::{Coordinator, CoordinatorCommand, InFlightSet};
use crate::error::EngineResult;
use crate::journal::{Journal, JournalState};
use crate::planner::{PlanOutcome, Planner};
use crate::risk;
use crate::settlement::{SettlementReporter, SettlementTotals};
use alloy::primitives::Address;
use blueberry_api::QuoteProvider;
use blueberry_chain::{BankReader, ChainError, ChainReader, ChainSnapshot, LiquidationSubmitter};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::SendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const COMMAND_BUFFER: usize = 256;

type SnapshotTx = watch::Sender<Option<Arc<ChainSnapshot>>>;
type SnapshotRx = watch::Receiver<Option<Arc<ChainSnapshot>>>;

/// Fully wired engine, not yet running.
pub struct Engine {
    config: EngineConfig,
    reader: Arc<ChainReader>,
    planner: Arc<Planner>,
    coordinator: Coordinator,
    settlement: Arc<SettlementReporter>,
    alerts: AlertSender,
}

impl Engine {
    /// Build every component and replay the journal.
    ///
    /// Settlement is restored before the coordinator so confirmed attempts
    /// already settled are not settled again.
    pub fn new(
        config: EngineConfig,
        bank: Arc<dyn BankReader>,
        submitter: Arc<dyn LiquidationSubmitter>,
        quotes: Arc<dyn QuoteProvider>,
        native_token: Address,
        alerts: AlertSender,
    ) -> EngineResult<Self> {
        let (journal, state) = if config.journal.enabled {
            Journal::open(&config.journal.path)?
        } else {
            info!("Journal disabled");
            (Journal::disabled(), JournalState::default())
        };
        let journal = Arc::new(journal);

        let retry = config.reader.retry_policy();
        let reader = Arc::new(ChainReader::new(
            bank.clone(),
            retry,
            config.reader.fetch_concurrency,
            native_token,
        ));
        let planner = Arc::new(Planner::new(quotes, submitter.clone(), &config));
        let settlement = Arc::new(SettlementReporter::new(
            bank.clone(),
            submitter.clone(),
            retry,
            config.settlement.clone(),
            journal.clone(),
            alerts.clone(),
        ));
        settlement.restore(&state);

        let mut coordinator = Coordinator::new(
            submitter,
            bank,
            retry,
            config.execution.clone(),
            journal,
            settlement.clone(),
            alerts.clone(),
        );
        coordinator.restore(&state);

        Ok(Self {
            config,
            reader,
            planner,
            coordinator,
            settlement,
            alerts,
        })
    }

    /// Spawn the background tasks.
    pub fn start(self) -> EngineHandle {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (snapshot_tx, snapshot_rx) = watch::channel(None);
        let (head_tx, head_rx) = watch::channel(0u64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let in_flight = self.coordinator.in_flight();

        let coordinator = tokio::spawn(self.coordinator.run(commands_rx));

        let reader = tokio::spawn(reader_loop(
            self.reader.clone(),
            self.config.reader.poll_interval(),
            head_tx,
            snapshot_tx,
            self.alerts.clone(),
            shutdown_rx.clone(),
        ));

        let evaluator = Evaluator {
            config: self.config.clone(),
            planner: self.planner.clone(),
            settlement: self.settlement.clone(),
            commands: commands_tx.clone(),
        };
        let evaluation = tokio::spawn(evaluator.run(snapshot_rx.clone(), head_rx, shutdown_rx.clone()));

        let sweeper = tokio::spawn(settlement_loop(
            self.settlement.clone(),
            commands_tx.clone(),
            self.config.settlement.settlement_interval(),
            shutdown_rx,
        ));

        info!(
            profile = %self.config.profile,
            poll_ms = self.config.reader.poll_interval_ms,
            "Engine started"
        );

        EngineHandle {
            commands: commands_tx,
            snapshots: snapshot_rx,
            in_flight,
            settlement: self.settlement,
            shutdown: shutdown_tx,
            workers: vec![reader, evaluation, sweeper],
            coordinator,
        }
    }
}

/// Running engine.
pub struct EngineHandle {
    commands: mpsc::Sender<CoordinatorCommand>,
    snapshots: SnapshotRx,
    in_flight: InFlightSet,
    settlement: Arc<SettlementReporter>,
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    coordinator: JoinHandle<()>,
}

impl EngineHandle {
    pub fn latest_snapshot(&self) -> Option<Arc<ChainSnapshot>> {
        self.snapshots.borrow().clone()
    }

    pub fn in_flight(&self) -> &InFlightSet {
        &self.in_flight
    }

    pub fn totals(&self) -> SettlementTotals {
        self.settlement.totals()
    }

    /// Clear a funding halt. `false` once the coordinator has stopped.
    pub async fn resume(&self) -> bool {
        self.commands.send(CoordinatorCommand::Resume).await.is_ok()
    }

    /// Stop the loops, then let the coordinator drain its queue.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Engine task panicked");
            }
        }
        drop(self.commands);
        if let Err(e) = self.coordinator.await {
            error!(error = %e, "Coordinator task panicked");
        }
        info!("Engine stopped");
    }
}

/// Poll the head and publish a snapshot for every new block.
///
/// A failed read keeps the previous snapshot published; the evaluator's
/// staleness check decides whether it is still usable.
async fn reader_loop(
    reader: Arc<ChainReader>,
    poll_interval: Duration,
    head_tx: watch::Sender<u64>,
    snapshot_tx: SnapshotTx,
    alerts: AlertSender,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_block: Option<u64> = None;
    let mut outage = false;
    let mut unpriced: HashSet<Address> = HashSet::new();

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }

        let head = match reader.block_number().await {
            Ok(head) => head,
            Err(e) => {
                note_failure(&e, &mut outage, &alerts);
                continue;
            }
        };
        head_tx.send_replace(head);
        if last_block.is_some_and(|b| b >= head) {
            continue;
        }

        match reader.fetch_snapshot().await {
            Ok(snapshot) => {
                if outage {
                    info!(block = snapshot.block_number, "Chain reads recovered");
                    outage = false;
                }
                note_unpriced(&snapshot, &mut unpriced, &alerts);
                last_block = Some(snapshot.block_number);
                head_tx.send_replace(head.max(snapshot.block_number));
                snapshot_tx.send_replace(Some(snapshot));
            }
            Err(e) => note_failure(&e, &mut outage, &alerts),
        }
    }
    debug!("Reader loop stopped");
}

/// Log a failed read and alert once per outage.
fn note_failure(e: &ChainError, outage: &mut bool, alerts: &AlertSender) {
    warn!(error = %e, "Chain read failed, keeping previous snapshot");
    if matches!(e, ChainError::ChainUnavailable { .. }) && !*outage {
        *outage = true;
        raise(
            alerts,
            OperatorAlert::ChainUnavailable {
                reason: e.to_string(),
            },
        );
    }
}

/// Alert once for each token that became unreadable; log recoveries.
fn note_unpriced(snapshot: &ChainSnapshot, unpriced: &mut HashSet<Address>, alerts: &AlertSender) {
    unpriced.retain(|token| {
        let still_failing = snapshot.unpriced.contains_key(token);
        if !still_failing {
            info!(token = %token, block = snapshot.block_number, "Token price recovered");
        }
        still_failing
    });
    for (token, reason) in &snapshot.unpriced {
        if unpriced.insert(*token) {
            let affected = snapshot
                .positions
                .values()
                .filter(|p| p.debt_token == *token || p.underlying_token == *token)
                .count();
            warn!(token = %token, affected, reason = %reason, "Positions left unevaluated");
            raise(
                alerts,
                OperatorAlert::PriceUnavailable {
                    token: *token,
                    reason: reason.clone(),
                },
            );
        }
    }
}

/// Periodic sweep check. The withdrawal itself is sent by the coordinator.
async fn settlement_loop(
    settlement: Arc<SettlementReporter>,
    commands: mpsc::Sender<CoordinatorCommand>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        if !settlement.sweep_due(Utc::now()) {
            continue;
        }
        if commands.send(CoordinatorCommand::Sweep).await.is_err() {
            warn!("Coordinator gone, stopping sweeps");
            break;
        }
    }
    debug!("Settlement loop stopped");
}

/// Turns snapshots into coordinator commands.
pub(crate) struct Evaluator {
    config: EngineConfig,
    planner: Arc<Planner>,
    settlement: Arc<SettlementReporter>,
    commands: mpsc::Sender<CoordinatorCommand>,
}

impl Evaluator {
    async fn run(
        self,
        mut snapshots: SnapshotRx,
        head: watch::Receiver<u64>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                changed = snapshots.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = shutdown.changed() => break,
            }
            let Some(snapshot) = snapshots.borrow_and_update().clone() else {
                continue;
            };
            let current = (*head.borrow()).max(snapshot.block_number);
            if self.process(snapshot, current).await.is_err() {
                warn!("Coordinator gone, stopping evaluation");
                break;
            }
        }
        debug!("Evaluation loop stopped");
    }

    /// One evaluation cycle for `snapshot` with the chain at `head`.
    ///
    /// A stale snapshot clears every plan instead of feeding decisions; the
    /// tick still runs so pending transactions keep being polled.
    pub(crate) async fn process(
        &self,
        snapshot: Arc<ChainSnapshot>,
        head: u64,
    ) -> Result<(), SendError<CoordinatorCommand>> {
        if snapshot.is_stale(head, self.config.reader.max_snapshot_lag_blocks) {
            warn!(
                snapshot_block = snapshot.block_number,
                head,
                max_lag = self.config.reader.max_snapshot_lag_blocks,
                "Snapshot stale, skipping evaluation"
            );
            self.send(CoordinatorCommand::Evaluated {
                block: head,
                watchlist: HashSet::new(),
                liquidatable: HashSet::new(),
            })
            .await?;
            return self.send(CoordinatorCommand::Tick { block: head }).await;
        }

        let watchlist = risk::evaluate(&snapshot, &self.config.risk);
        self.settlement.update_prices(&snapshot);

        self.send(CoordinatorCommand::Evaluated {
            block: snapshot.block_number,
            watchlist: watchlist.iter().map(|r| r.position_id).collect(),
            liquidatable: watchlist
                .iter()
                .filter(|r| r.liquidatable)
                .map(|r| r.position_id)
                .collect(),
        })
        .await?;

        let (reply, busy) = oneshot::channel();
        self.send(CoordinatorCommand::Busy { block: head, reply })
            .await?;
        let busy = busy.await.unwrap_or_default();

        let candidates: Vec<_> = watchlist
            .into_iter()
            .filter(|r| !busy.contains(&r.position_id))
            .collect();

        match self.planner.plan_batch(&snapshot, candidates).await {
            Ok(results) => {
                for (position_id, result) in results {
                    match result {
                        Ok(PlanOutcome::Ready(plan)) => {
                            self.send(CoordinatorCommand::Plan(plan)).await?
                        }
                        Ok(PlanOutcome::Unprofitable { .. }) => {}
                        Err(e) if e.is_transient() => {
                            debug!(position_id, error = %e, "Planning deferred")
                        }
                        Err(e) => warn!(position_id, error = %e, "Planning failed"),
                    }
                }
            }
            Err(e) => warn!(block = snapshot.block_number, error = %e, "Planning skipped"),
        }

        self.send(CoordinatorCommand::Tick { block: head }).await
    }

    async fn send(&self, command: CoordinatorCommand) -> Result<(), SendError<CoordinatorCommand>> {
        self.commands.send(command).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::alert_channel;
    use crate::settlement::SettlementRecord;
    use crate::test_support::*;
    use crate::u256_math::WAD;
    use alloy::primitives::{B256, U256};
    use async_trait::async_trait;
    use blueberry_api::{QuoteRequest, SwapQuote};
    use blueberry_chain::TxStatus;
    use std::future::Future;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Instant;

    fn test_config() -> EngineConfig {
        let mut config = EngineConfig::testing();
        config.reader.poll_interval_ms = 10;
        config.reader.retry_max_attempts = 1;
        config.reader.retry_base_delay_ms = 1;
        config.reader.retry_max_delay_ms = 1;
        config.settlement.settlement_interval_secs = 3_600;
        config.journal.enabled = false;
        config
    }

    async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn stressed_bank() -> Arc<MockBank> {
        let bank = Arc::new(MockBank::at(100));
        bank.set_price(WETH, usd(2_000));
        bank.set_price(DAI, WAD);
        bank.positions
            .lock()
            .insert(1, MockPosition::stressed_dai(usd(5_000), usd(5_000)));
        bank
    }

    #[tokio::test]
    async fn test_debt_price_spike_is_liquidated_and_settled() {
        let bank = stressed_bank();
        let submitter = Arc::new(MockSubmitter::new());
        let quotes = Arc::new(MockQuotes::with_returns(&[
            (USDC, dai(2_500)),
            (FARMED, dai(2_750)),
        ]));
        let (alerts, _alerts_rx) = alert_channel();

        let engine = Engine::new(
            test_config(),
            bank.clone(),
            submitter.clone(),
            quotes,
            WETH,
            alerts,
        )
        .unwrap();
        let handle = engine.start();

        // DAI at $1: debt 5000, position worth 5000, nothing to do.
        wait_for("first snapshot", || {
            handle
                .latest_snapshot()
                .is_some_and(|s| s.block_number == 100)
        })
        .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(submitter.submission_count(), 0);

        // DAI doubles: risk 10000 bps against an 8500 threshold.
        bank.set_price(DAI, usd(2));
        bank.set_head(101);
        wait_for("submission", || submitter.submission_count() == 1).await;
        assert_eq!(submitter.submissions.lock()[0].0, 1);
        assert!(handle.in_flight().contains(1));

        // Mined at 102 with 390 DAI left on the liquidator.
        bank.set_balance(DAI, 0, U256::ZERO);
        bank.set_balance(DAI, 102, dai(390));
        submitter.set_status(
            MockSubmitter::hash_of(1),
            TxStatus::Confirmed {
                block: 102,
                gas_used: 2_000_000,
            },
        );
        bank.set_head(102);

        wait_for("settlement", || handle.totals().settlements == 1).await;
        assert_eq!(handle.totals().realized_usd, usd(780));
        wait_for("release", || handle.in_flight().is_empty()).await;
        assert_eq!(submitter.submission_count(), 1);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_unprofitable_position_is_never_submitted() {
        let bank = stressed_bank();
        let submitter = Arc::new(MockSubmitter::new());
        let quotes = Arc::new(MockQuotes::with_returns(&[
            (USDC, dai(2_400)),
            (FARMED, dai(2_600)),
        ]));
        let (alerts, _alerts_rx) = alert_channel();
        let handle = Engine::new(test_config(), bank.clone(), submitter.clone(), quotes, WETH, alerts)
            .unwrap()
            .start();

        bank.set_price(DAI, usd(2));
        bank.set_head(101);
        wait_for("snapshot at 101", || {
            handle
                .latest_snapshot()
                .is_some_and(|s| s.block_number == 101)
        })
        .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(submitter.submission_count(), 0);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_outdated_price_skips_only_dependent_positions() {
        let bank = stressed_bank();
        let mut frax_debt = MockPosition::stressed_dai(usd(5_000), usd(5_000));
        frax_debt.info.debt_token = FRAX;
        bank.positions.lock().insert(2, frax_debt);
        bank.outdated_prices.lock().insert(FRAX);
        let submitter = Arc::new(MockSubmitter::new());
        let quotes = Arc::new(MockQuotes::with_returns(&[
            (USDC, dai(2_500)),
            (FARMED, dai(2_750)),
        ]));
        let (alerts, mut alerts_rx) = alert_channel();
        let handle = Engine::new(test_config(), bank.clone(), submitter.clone(), quotes, WETH, alerts)
            .unwrap()
            .start();

        let alert = tokio::time::timeout(Duration::from_secs(3), alerts_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match alert {
            OperatorAlert::PriceUnavailable { token, reason } => {
                assert_eq!(token, FRAX);
                assert!(reason.contains("PRICE_OUTDATED"));
            }
            other => panic!("unexpected {other:?}"),
        }

        // Position 1 is still evaluated and liquidated.
        bank.set_price(DAI, usd(2));
        bank.set_head(101);
        wait_for("submission", || submitter.submission_count() == 1).await;
        assert_eq!(submitter.submissions.lock()[0].0, 1);
        let snapshot = handle.latest_snapshot().unwrap();
        assert!(snapshot.position(2).is_some());
        assert!(snapshot.unpriced.contains_key(&FRAX));

        // One alert per outage, not per snapshot.
        assert!(alerts_rx.try_recv().is_err());

        handle.shutdown().await;
    }

    /// Moves the chain forward and calms the market while the first quote
    /// is in flight.
    struct SlowQuotes {
        inner: MockQuotes,
        bank: Arc<MockBank>,
        moved: AtomicBool,
    }

    impl std::fmt::Debug for SlowQuotes {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("SlowQuotes").finish_non_exhaustive()
        }
    }

    #[async_trait]
    impl QuoteProvider for SlowQuotes {
        fn provider_id(&self) -> &str {
            "slow"
        }

        async fn quote(&self, request: &QuoteRequest) -> anyhow::Result<SwapQuote> {
            if !self.moved.swap(true, Ordering::SeqCst) {
                self.bank.set_price(DAI, WAD);
                self.bank.set_head(106);
            }
            self.inner.quote(request).await
        }
    }

    #[tokio::test]
    async fn test_plan_expiring_while_quoting_is_not_submitted() {
        let bank = stressed_bank();
        let submitter = Arc::new(MockSubmitter::new());
        let quotes = Arc::new(SlowQuotes {
            inner: MockQuotes::with_returns(&[(USDC, dai(2_500)), (FARMED, dai(2_750))]),
            bank: bank.clone(),
            moved: AtomicBool::new(false),
        });
        let mut config = test_config();
        config.planner.quote_validity_blocks = 2;
        let (alerts, _alerts_rx) = alert_channel();
        let handle = Engine::new(config, bank.clone(), submitter.clone(), quotes, WETH, alerts)
            .unwrap()
            .start();

        wait_for("first snapshot", || handle.latest_snapshot().is_some()).await;
        // Planned at 101, valid through 103; the head is 106 once quoted.
        bank.set_price(DAI, usd(2));
        bank.set_head(101);
        wait_for("snapshot at 106", || {
            handle
                .latest_snapshot()
                .is_some_and(|s| s.block_number == 106)
        })
        .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(submitter.submission_count(), 0);
        assert!(handle.in_flight().is_empty());

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_settlement_loop_requests_sweeps_without_sending() {
        let bank = Arc::new(MockBank::at(100));
        let submitter = Arc::new(MockSubmitter::new());
        let (alerts, _alerts_rx) = alert_channel();
        let reporter = Arc::new(SettlementReporter::new(
            bank,
            submitter.clone(),
            test_config().reader.retry_policy(),
            Default::default(),
            Arc::new(Journal::disabled()),
            alerts,
        ));
        reporter.restore(&JournalState {
            settlements: vec![SettlementRecord {
                position_id: 1,
                tx_hash: B256::with_last_byte(1),
                token: DAI,
                realized_amount: dai(600),
                realized_usd: usd(1_200),
                block_number: 100,
                recorded_at: Utc::now(),
            }],
            ..Default::default()
        });
        reporter.update_prices(&snapshot_with(usd(2), &[]));

        let (commands_tx, mut commands) = mpsc::channel(COMMAND_BUFFER);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(settlement_loop(
            reporter,
            commands_tx,
            Duration::from_millis(10),
            shutdown_rx,
        ));

        let command = tokio::time::timeout(Duration::from_secs(3), commands.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(command, CoordinatorCommand::Sweep));
        assert!(submitter.withdrawals.lock().is_empty());

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }

    struct EvalHarness {
        evaluator: Arc<Evaluator>,
        commands: mpsc::Receiver<CoordinatorCommand>,
    }

    fn eval_harness(quotes: MockQuotes) -> EvalHarness {
        let config = test_config();
        let bank = Arc::new(MockBank::at(100));
        let submitter = Arc::new(MockSubmitter::new());
        let (alerts, _) = alert_channel();
        let settlement = Arc::new(SettlementReporter::new(
            bank,
            submitter.clone(),
            config.reader.retry_policy(),
            config.settlement.clone(),
            Arc::new(Journal::disabled()),
            alerts,
        ));
        let (commands_tx, commands) = mpsc::channel(COMMAND_BUFFER);
        EvalHarness {
            evaluator: Arc::new(Evaluator {
                planner: Arc::new(Planner::new(Arc::new(quotes), submitter, &config)),
                config,
                settlement,
                commands: commands_tx,
            }),
            commands,
        }
    }

    /// Run `process` while answering `Busy` with `busy`; returns every other
    /// command in order.
    async fn drive(
        h: &mut EvalHarness,
        busy: HashSet<u64>,
        process: impl Future<Output = Result<(), SendError<CoordinatorCommand>>> + Send + 'static,
    ) -> Vec<CoordinatorCommand> {
        let task = tokio::spawn(process);
        let mut seen = Vec::new();
        while let Some(command) = h.commands.recv().await {
            match command {
                CoordinatorCommand::Busy { reply, .. } => {
                    let _ = reply.send(busy.clone());
                }
                CoordinatorCommand::Tick { block } => {
                    seen.push(CoordinatorCommand::Tick { block });
                    break;
                }
                other => seen.push(other),
            }
        }
        task.await.unwrap().unwrap();
        seen
    }

    #[tokio::test]
    async fn test_stale_snapshot_clears_plans_and_still_ticks() {
        let mut h = eval_harness(MockQuotes::default());
        let snapshot = Arc::new(snapshot_with(usd(2), &[(1, usd(5_000), usd(5_000))]));
        let evaluator = h.evaluator.clone();
        // Testing profile tolerates 5 blocks of lag.
        let seen = drive(&mut h, HashSet::new(), async move {
            evaluator.process(snapshot, SNAPSHOT_BLOCK + 6).await
        })
        .await;

        assert_eq!(seen.len(), 2);
        match &seen[0] {
            CoordinatorCommand::Evaluated {
                block,
                watchlist,
                liquidatable,
            } => {
                assert_eq!(*block, SNAPSHOT_BLOCK + 6);
                assert!(watchlist.is_empty() && liquidatable.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(seen[1], CoordinatorCommand::Tick { block } if block == SNAPSHOT_BLOCK + 6));
    }

    #[tokio::test]
    async fn test_fresh_snapshot_plans_only_idle_positions() {
        let mut h = eval_harness(MockQuotes::with_returns(&[
            (USDC, dai(2_500)),
            (FARMED, dai(2_750)),
        ]));
        let snapshot = Arc::new(snapshot_with(
            usd(2),
            &[(1, usd(5_000), usd(5_000)), (2, usd(5_000), usd(5_000)), (3, usd(5_000), usd(20_000))],
        ));
        let evaluator = h.evaluator.clone();
        let seen = drive(&mut h, [2].into(), async move {
            evaluator.process(snapshot, SNAPSHOT_BLOCK).await
        })
        .await;

        match &seen[0] {
            CoordinatorCommand::Evaluated { liquidatable, .. } => {
                assert_eq!(liquidatable, &HashSet::from([1, 2]));
            }
            other => panic!("unexpected {other:?}"),
        }
        let planned: Vec<u64> = seen
            .iter()
            .filter_map(|c| match c {
                CoordinatorCommand::Plan(plan) => Some(plan.position_id),
                _ => None,
            })
            .collect();
        assert_eq!(planned, vec![1]);
        assert!(matches!(seen.last(), Some(CoordinatorCommand::Tick { block: SNAPSHOT_BLOCK })));
    }

    #[tokio::test]
    async fn test_evaluator_stops_when_coordinator_is_gone() {
        let h = eval_harness(MockQuotes::default());
        let EvalHarness { evaluator, commands } = h;
        drop(commands);
        let snapshot = Arc::new(snapshot_with(WAD, &[]));
        assert!(evaluator.process(snapshot, SNAPSHOT_BLOCK).await.is_err());
    }
}
