//! Chain Reader: builds one immutable, block-pinned snapshot of every open
//! bank position and the oracle data needed to value it.

use crate::bank::{BankReader, PositionId, PositionInfo};
use crate::error::{ChainError, ChainResult};
use crate::retry::{with_retry, RetryPolicy};
use alloy::primitives::{Address, U256};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Where a price came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriceSource {
    /// `CoreOracle.getPrice`
    CoreOracle,
    /// Injected by tests or operators.
    Manual,
}

/// Oracle price observed at one block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub token: Address,
    /// USD price with 18 decimals.
    pub price: U256,
    pub block_number: u64,
    pub fetched_at: DateTime<Utc>,
    pub source: PriceSource,
}

/// Read-only mirror of one open position with its bank valuations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub id: PositionId,
    pub owner: Address,
    pub coll_token: Address,
    pub coll_id: U256,
    pub collateral_size: U256,
    /// Isolated collateral token.
    pub underlying_token: Address,
    pub underlying_vault_share: U256,
    /// Isolated collateral in token units, derived from its value and price.
    pub collateral_amount: U256,
    pub debt_token: Address,
    pub debt_share: U256,
    pub debt_amount: U256,
    /// `getPositionValue`, USD WAD.
    pub position_value_usd: U256,
    /// `getIsolatedCollateralValue`, USD WAD.
    pub collateral_value_usd: U256,
}

impl PositionSnapshot {
    /// Farmed token of the wrapped strategy position.
    pub fn farmed_token(&self) -> Address {
        let word = self.coll_id.to_be_bytes::<32>();
        Address::from_slice(&word[12..])
    }
}

/// Everything the evaluator needs, read at a single block.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChainSnapshot {
    pub block_number: u64,
    pub fetched_at: DateTime<Utc>,
    pub positions: BTreeMap<PositionId, PositionSnapshot>,
    pub prices: HashMap<Address, PriceQuote>,
    /// Liquidation threshold in bps, keyed by isolated collateral token.
    pub liq_thresholds: HashMap<Address, u32>,
    pub decimals: HashMap<Address, u8>,
    /// Tokens whose oracle reads failed at this block, with the error.
    /// Positions that need them are left unvalued.
    pub unpriced: BTreeMap<Address, String>,
    /// Wrapped gas token.
    pub native_token: Address,
}

impl ChainSnapshot {
    /// A snapshot more than `max_lag_blocks` behind the head must not drive
    /// liquidation decisions.
    pub fn is_stale(&self, current_block: u64, max_lag_blocks: u64) -> bool {
        current_block.saturating_sub(self.block_number) > max_lag_blocks
    }

    pub fn price(&self, token: &Address) -> Option<U256> {
        self.prices.get(token).map(|q| q.price)
    }

    /// Token decimals; 18 when unknown.
    pub fn decimals_of(&self, token: &Address) -> u8 {
        self.decimals.get(token).copied().unwrap_or(18)
    }

    pub fn liq_threshold(&self, token: &Address) -> Option<u32> {
        self.liq_thresholds.get(token).copied()
    }

    pub fn position(&self, id: PositionId) -> Option<&PositionSnapshot> {
        self.positions.get(&id)
    }
}

/// `10^decimals` as U256.
pub fn pow10(decimals: u8) -> U256 {
    U256::from(10u64).pow(U256::from(decimals))
}

/// Raw per-position reads before token metadata is known.
struct RawPosition {
    id: PositionId,
    info: PositionInfo,
    debt: U256,
    value: U256,
    collateral_value: U256,
}

/// Snapshot builder over a [`BankReader`].
pub struct ChainReader {
    bank: Arc<dyn BankReader>,
    retry: RetryPolicy,
    concurrency: usize,
    native_token: Address,
    decimals_cache: DashMap<Address, u8>,
}

impl ChainReader {
    /// * `native_token` - wrapped gas token, always priced for gas costing
    /// * `concurrency` - positions fetched in parallel
    pub fn new(
        bank: Arc<dyn BankReader>,
        retry: RetryPolicy,
        concurrency: usize,
        native_token: Address,
    ) -> Self {
        Self {
            bank,
            retry,
            concurrency: concurrency.max(1),
            native_token,
            decimals_cache: DashMap::new(),
        }
    }

    pub fn bank(&self) -> &Arc<dyn BankReader> {
        &self.bank
    }

    pub fn native_token(&self) -> Address {
        self.native_token
    }

    /// Current head, with retries.
    pub async fn block_number(&self) -> ChainResult<u64> {
        let bank = &self.bank;
        with_retry(&self.retry, "eth_blockNumber", || bank.block_number()).await
    }

    /// Read every open position and its token data at the current head.
    ///
    /// A failed position read drops that position only, and a failed price,
    /// decimals or threshold read leaves that token out of the snapshot (see
    /// [`ChainSnapshot::unpriced`]). Failing to read the head or the
    /// position count fails the snapshot.
    #[instrument(skip(self))]
    pub async fn fetch_snapshot(&self) -> ChainResult<Arc<ChainSnapshot>> {
        let start = Instant::now();
        let bank = &self.bank;
        let retry = &self.retry;

        let block = self.block_number().await?;
        let next_id = with_retry(retry, "getNextPositionId", || bank.next_position_id(block)).await?;

        let results: Vec<(PositionId, ChainResult<Option<RawPosition>>)> =
            stream::iter(1..next_id)
                .map(|id| async move { (id, self.fetch_position(id, block).await) })
                .buffer_unordered(self.concurrency)
                .collect()
                .await;

        let mut raw = Vec::with_capacity(results.len());
        let mut dropped = 0usize;
        for (id, result) in results {
            match result {
                Ok(Some(p)) => raw.push(p),
                Ok(None) => {}
                Err(e) => {
                    dropped += 1;
                    warn!(position_id = id, block, error = %e, "Position read failed, skipping");
                }
            }
        }

        let mut tokens: BTreeSet<Address> = BTreeSet::new();
        tokens.insert(self.native_token);
        let mut collateral_tokens: BTreeSet<Address> = BTreeSet::new();
        for p in &raw {
            tokens.insert(p.info.debt_token);
            tokens.insert(p.info.underlying_token);
            collateral_tokens.insert(p.info.underlying_token);
        }

        let fetched_at = Utc::now();
        let mut prices = HashMap::with_capacity(tokens.len());
        let mut decimals = HashMap::with_capacity(tokens.len());
        let mut unpriced = BTreeMap::new();
        for token in &tokens {
            let token = *token;
            let read = async {
                let price = with_retry(retry, "getPrice", || bank.price(token, block)).await?;
                let dec = self.decimals(token).await?;
                Ok::<_, ChainError>((price, dec))
            };
            match read.await {
                Ok((price, dec)) => {
                    prices.insert(
                        token,
                        PriceQuote {
                            token,
                            price,
                            block_number: block,
                            fetched_at,
                            source: PriceSource::CoreOracle,
                        },
                    );
                    decimals.insert(token, dec);
                }
                Err(e) => {
                    warn!(token = %token, block, error = %e, "Token price unavailable, dependent positions skipped");
                    unpriced.insert(token, e.to_string());
                }
            }
        }

        // Farmed tokens are only needed for quote requests; unknown ones fall back to 18.
        let farmed: BTreeSet<Address> = raw
            .iter()
            .map(|p| p.info.farmed_token())
            .filter(|t| !t.is_zero() && !decimals.contains_key(t))
            .collect();
        for token in farmed {
            match self.decimals(token).await {
                Ok(d) => {
                    decimals.insert(token, d);
                }
                Err(e) => debug!(token = %token, error = %e, "Farmed token decimals unavailable"),
            }
        }

        let mut liq_thresholds = HashMap::with_capacity(collateral_tokens.len());
        for token in collateral_tokens {
            match with_retry(retry, "getLiqThreshold", || {
                bank.liquidation_threshold(token, block)
            })
            .await
            {
                Ok(lt) => {
                    liq_thresholds.insert(token, lt);
                }
                Err(e) => {
                    warn!(token = %token, block, error = %e, "Liquidation threshold unavailable");
                    unpriced
                        .entry(token)
                        .or_insert_with(|| format!("liquidation threshold: {e}"));
                }
            }
        }

        let positions = raw
            .into_iter()
            .map(|p| {
                let price = prices
                    .get(&p.info.underlying_token)
                    .map(|q| q.price)
                    .unwrap_or_default();
                let dec = decimals.get(&p.info.underlying_token).copied().unwrap_or(18);
                let collateral_amount = if price.is_zero() {
                    U256::ZERO
                } else {
                    p.collateral_value * pow10(dec) / price
                };
                (
                    p.id,
                    PositionSnapshot {
                        id: p.id,
                        owner: p.info.owner,
                        coll_token: p.info.coll_token,
                        coll_id: p.info.coll_id,
                        collateral_size: p.info.collateral_size,
                        underlying_token: p.info.underlying_token,
                        underlying_vault_share: p.info.underlying_vault_share,
                        collateral_amount,
                        debt_token: p.info.debt_token,
                        debt_share: p.info.debt_share,
                        debt_amount: p.debt,
                        position_value_usd: p.value,
                        collateral_value_usd: p.collateral_value,
                    },
                )
            })
            .collect::<BTreeMap<_, _>>();

        info!(
            block,
            positions = positions.len(),
            dropped,
            tokens = prices.len(),
            unpriced = unpriced.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Snapshot fetched"
        );

        Ok(Arc::new(ChainSnapshot {
            block_number: block,
            fetched_at,
            positions,
            prices,
            liq_thresholds,
            decimals,
            unpriced,
            native_token: self.native_token,
        }))
    }

    /// Reads for one position; `None` when closed.
    async fn fetch_position(&self, id: PositionId, block: u64) -> ChainResult<Option<RawPosition>> {
        let bank = &self.bank;
        let retry = &self.retry;

        let info = with_retry(retry, "getPositionInfo", || bank.position_info(id, block)).await?;
        if info.is_closed() {
            debug!(position_id = id, "Position closed, skipping");
            return Ok(None);
        }

        let (debt, value, collateral_value) = tokio::try_join!(
            with_retry(retry, "getPositionDebt", || bank.position_debt(id, block)),
            with_retry(retry, "getPositionValue", || bank.position_value(id, block)),
            with_retry(retry, "getIsolatedCollateralValue", || {
                bank.isolated_collateral_value(id, block)
            }),
        )?;

        Ok(Some(RawPosition {
            id,
            info,
            debt,
            value,
            collateral_value,
        }))
    }

    async fn decimals(&self, token: Address) -> ChainResult<u8> {
        if let Some(d) = self.decimals_cache.get(&token) {
            return Ok(*d);
        }
        let bank = &self.bank;
        let d = with_retry(&self.retry, "decimals", || bank.decimals(token)).await?;
        self.decimals_cache.insert(token, d);
        Ok(d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};

    const WAD: u128 = 1_000_000_000_000_000_000;

    fn usdc() -> Address {
        Address::repeat_byte(0x01)
    }
    fn dai() -> Address {
        Address::repeat_byte(0x02)
    }
    fn weth() -> Address {
        Address::repeat_byte(0x03)
    }

    #[derive(Default)]
    struct MockBank {
        positions: Mutex<BTreeMap<PositionId, PositionInfo>>,
        failing_positions: Mutex<HashSet<PositionId>>,
        price_failures: AtomicU32,
        reverting_prices: Mutex<HashSet<Address>>,
        reverting_thresholds: Mutex<HashSet<Address>>,
        decimals_calls: AtomicU32,
        head_down: Mutex<bool>,
    }

    #[async_trait]
    impl BankReader for MockBank {
        async fn block_number(&self) -> ChainResult<u64> {
            if *self.head_down.lock() {
                return Err(ChainError::Rpc("connection refused".into()));
            }
            Ok(100)
        }
        async fn next_position_id(&self, _at: u64) -> ChainResult<PositionId> {
            Ok(self.positions.lock().len() as u64 + 1)
        }
        async fn position_info(&self, id: PositionId, _at: u64) -> ChainResult<PositionInfo> {
            if self.failing_positions.lock().contains(&id) {
                return Err(ChainError::Rpc("timeout".into()));
            }
            Ok(self.positions.lock().get(&id).cloned().unwrap_or_default())
        }
        async fn position_debt(&self, _id: PositionId, _at: u64) -> ChainResult<U256> {
            Ok(U256::from(5_000u64) * U256::from(WAD))
        }
        async fn position_value(&self, _id: PositionId, _at: u64) -> ChainResult<U256> {
            Ok(U256::from(4_000u64) * U256::from(WAD))
        }
        async fn isolated_collateral_value(&self, _id: PositionId, _at: u64) -> ChainResult<U256> {
            Ok(U256::from(5_000u64) * U256::from(WAD))
        }
        async fn is_liquidatable(&self, _id: PositionId) -> ChainResult<bool> {
            Ok(false)
        }
        async fn price(&self, token: Address, _at: u64) -> ChainResult<U256> {
            if self.reverting_prices.lock().contains(&token) {
                return Err(ChainError::TransactionReverted {
                    tx_hash: None,
                    reason: "execution reverted: PRICE_OUTDATED".into(),
                });
            }
            if self.price_failures.load(Ordering::SeqCst) > 0 {
                self.price_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(ChainError::Rpc("rate limited".into()));
            }
            Ok(U256::from(WAD))
        }
        async fn liquidation_threshold(&self, token: Address, _at: u64) -> ChainResult<u32> {
            if self.reverting_thresholds.lock().contains(&token) {
                return Err(ChainError::TransactionReverted {
                    tx_hash: None,
                    reason: "execution reverted".into(),
                });
            }
            Ok(8_500)
        }
        async fn decimals(&self, token: Address) -> ChainResult<u8> {
            self.decimals_calls.fetch_add(1, Ordering::SeqCst);
            Ok(if token == usdc() { 6 } else { 18 })
        }
        async fn balance_of(&self, _t: Address, _h: Address, _b: Option<u64>) -> ChainResult<U256> {
            Ok(U256::ZERO)
        }
    }

    fn open_position() -> PositionInfo {
        PositionInfo {
            owner: Address::repeat_byte(0xaa),
            coll_token: Address::repeat_byte(0xcc),
            underlying_token: usdc(),
            debt_token: dai(),
            underlying_vault_share: U256::from(5_000_000_000u64),
            debt_share: U256::from(1u64),
            coll_id: U256::from(1u64),
            collateral_size: U256::from(1u64),
        }
    }

    fn reader(bank: Arc<MockBank>) -> ChainReader {
        let retry = RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 2,
        };
        ChainReader::new(bank, retry, 4, weth())
    }

    #[tokio::test]
    async fn test_snapshot_skips_closed_and_prices_tokens() {
        let bank = Arc::new(MockBank::default());
        bank.positions.lock().insert(1, open_position());
        bank.positions.lock().insert(2, PositionInfo::default());

        let snapshot = reader(bank.clone()).fetch_snapshot().await.unwrap();

        assert_eq!(snapshot.block_number, 100);
        assert_eq!(snapshot.positions.len(), 1);
        let p = snapshot.position(1).unwrap();
        // 5000 USD of a 6-decimal $1 token
        assert_eq!(p.collateral_amount, U256::from(5_000_000_000u64));
        assert_eq!(p.debt_amount, U256::from(5_000u64) * U256::from(WAD));

        for token in [usdc(), dai(), weth()] {
            assert!(snapshot.price(&token).is_some());
        }
        assert_eq!(snapshot.liq_threshold(&usdc()), Some(8_500));
        assert_eq!(snapshot.decimals_of(&usdc()), 6);
    }

    #[tokio::test]
    async fn test_failed_position_is_dropped_not_fatal() {
        let bank = Arc::new(MockBank::default());
        bank.positions.lock().insert(1, open_position());
        bank.positions.lock().insert(2, open_position());
        bank.failing_positions.lock().insert(2);

        let snapshot = reader(bank).fetch_snapshot().await.unwrap();
        assert!(snapshot.position(1).is_some());
        assert!(snapshot.position(2).is_none());
    }

    #[tokio::test]
    async fn test_transient_price_errors_are_retried() {
        let bank = Arc::new(MockBank::default());
        bank.positions.lock().insert(1, open_position());
        bank.price_failures.store(2, Ordering::SeqCst);

        let snapshot = reader(bank).fetch_snapshot().await.unwrap();
        assert_eq!(snapshot.prices.len(), 3);
    }

    #[tokio::test]
    async fn test_outdated_debt_price_leaves_other_positions_valued() {
        let frax = Address::repeat_byte(0x04);
        let bank = Arc::new(MockBank::default());
        bank.positions.lock().insert(1, open_position());
        bank.positions.lock().insert(
            2,
            PositionInfo {
                debt_token: frax,
                ..open_position()
            },
        );
        bank.reverting_prices.lock().insert(frax);

        let snapshot = reader(bank).fetch_snapshot().await.unwrap();

        assert_eq!(snapshot.positions.len(), 2);
        assert!(snapshot.price(&dai()).is_some());
        assert!(snapshot.price(&frax).is_none());
        assert!(snapshot.unpriced[&frax].contains("PRICE_OUTDATED"));
        assert_eq!(snapshot.unpriced.len(), 1);
        assert_eq!(snapshot.liq_threshold(&usdc()), Some(8_500));
    }

    #[tokio::test]
    async fn test_failed_threshold_read_is_recorded() {
        let bank = Arc::new(MockBank::default());
        bank.positions.lock().insert(1, open_position());
        bank.reverting_thresholds.lock().insert(usdc());

        let snapshot = reader(bank).fetch_snapshot().await.unwrap();

        assert!(snapshot.position(1).is_some());
        assert_eq!(snapshot.liq_threshold(&usdc()), None);
        assert!(snapshot.unpriced[&usdc()].starts_with("liquidation threshold"));
        // The price itself was fine.
        assert!(snapshot.price(&usdc()).is_some());
    }

    #[tokio::test]
    async fn test_head_unavailable_surfaces_error() {
        let bank = Arc::new(MockBank::default());
        *bank.head_down.lock() = true;

        let err = reader(bank).fetch_snapshot().await.unwrap_err();
        assert!(matches!(err, ChainError::ChainUnavailable { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_decimals_are_cached() {
        let bank = Arc::new(MockBank::default());
        bank.positions.lock().insert(1, open_position());
        let reader = reader(bank.clone());

        reader.fetch_snapshot().await.unwrap();
        let first = bank.decimals_calls.load(Ordering::SeqCst);
        reader.fetch_snapshot().await.unwrap();
        assert_eq!(bank.decimals_calls.load(Ordering::SeqCst), first);
    }

    #[test]
    fn test_staleness() {
        let snapshot = ChainSnapshot {
            block_number: 100,
            ..Default::default()
        };
        assert!(!snapshot.is_stale(100, 2));
        assert!(!snapshot.is_stale(102, 2));
        assert!(snapshot.is_stale(103, 2));
        // Head behind the snapshot (reorg / lagging node) is not stale.
        assert!(!snapshot.is_stale(90, 2));
    }
}
