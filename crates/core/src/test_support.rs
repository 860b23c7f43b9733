//! In-memory bank, submitter and quote source for engine tests.

use crate::planner::LiquidationPlan;
use crate::u256_math::WAD;
use alloy::primitives::{Address, B256, U256};
use anyhow::anyhow;
use async_trait::async_trait;
use blueberry_api::{min_return, QuoteProvider, QuoteRequest, SwapQuote};
use blueberry_chain::{
    BankReader, ChainError, ChainResult, ChainSnapshot, GasParams, LiquidationSubmitter,
    PositionId, PositionInfo, PositionSnapshot, PriceQuote, PriceSource, SubmittedTx, TxStatus,
    GWEI, OWNABLE_REVERT,
};
use chrono::Utc;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

pub const USDC: Address = Address::new([0x01; 20]);
pub const DAI: Address = Address::new([0x02; 20]);
pub const WETH: Address = Address::new([0x03; 20]);
pub const FARMED: Address = Address::new([0x04; 20]);
pub const WRAPPER: Address = Address::new([0x05; 20]);
pub const FRAX: Address = Address::new([0x06; 20]);
pub const LIQUIDATOR: Address = Address::new([0x0a; 20]);
pub const SIGNER: Address = Address::new([0x0b; 20]);
pub const STRANGER: Address = Address::new([0x0c; 20]);

pub const SNAPSHOT_BLOCK: u64 = 100;
pub const LIQ_THRESHOLD: u32 = 8_500;

/// `n` whole USD (or whole 18-decimal tokens).
pub fn usd(n: u64) -> U256 {
    U256::from(n) * WAD
}

pub fn dai(n: u64) -> U256 {
    usd(n)
}

/// 5000 DAI of debt against a farmed strategy position and USDC collateral.
pub fn position(id: PositionId, collateral_value: U256, position_value: U256) -> PositionSnapshot {
    PositionSnapshot {
        id,
        owner: Address::new([0xaa; 20]),
        coll_token: WRAPPER,
        coll_id: U256::from_be_slice(FARMED.as_slice()),
        collateral_size: usd(1_000),
        underlying_token: USDC,
        underlying_vault_share: U256::from(1u64),
        // USDC at $1 with 6 decimals.
        collateral_amount: collateral_value * U256::from(1_000_000u64) / WAD,
        debt_token: DAI,
        debt_share: U256::from(1u64),
        debt_amount: dai(5_000),
        position_value_usd: position_value,
        collateral_value_usd: collateral_value,
    }
}

fn quote(token: Address, price: U256, block: u64) -> PriceQuote {
    PriceQuote {
        token,
        price,
        block_number: block,
        fetched_at: Utc::now(),
        source: PriceSource::Manual,
    }
}

/// Snapshot at [`SNAPSHOT_BLOCK`] with the given DAI price. Entries are
/// `(id, collateral_value, position_value)`.
pub fn snapshot_with(dai_price: U256, positions: &[(PositionId, U256, U256)]) -> ChainSnapshot {
    snapshot_at(SNAPSHOT_BLOCK, dai_price, positions)
}

pub fn snapshot_at(
    block: u64,
    dai_price: U256,
    positions: &[(PositionId, U256, U256)],
) -> ChainSnapshot {
    let prices = [
        (USDC, WAD),
        (DAI, dai_price),
        (WETH, usd(2_000)),
    ]
    .into_iter()
    .map(|(t, p)| (t, quote(t, p, block)))
    .collect();

    ChainSnapshot {
        block_number: block,
        fetched_at: Utc::now(),
        positions: positions
            .iter()
            .map(|&(id, cv, pv)| (id, position(id, cv, pv)))
            .collect(),
        prices,
        liq_thresholds: [(USDC, LIQ_THRESHOLD)].into(),
        decimals: [(USDC, 6), (DAI, 18), (WETH, 18), (FARMED, 18)].into(),
        unpriced: BTreeMap::new(),
        native_token: WETH,
    }
}

/// Ready plan for the stressed DAI position: $390 net, valid for 3 blocks.
pub fn plan(position_id: PositionId, block: u64) -> LiquidationPlan {
    LiquidationPlan {
        position_id,
        debt_token: DAI,
        repay_amount: dai(5_000),
        swap_route: SmallVec::new(),
        expected_proceeds_usd: usd(10_500),
        expected_gas_cost_usd: usd(5),
        protocol_fee_usd: usd(105),
        expected_net_usd: usd(390),
        gas_limit: 2_500_000,
        gas_price_wei: GWEI,
        native_price_usd: usd(2_000),
        planned_at_block: block,
        expires_at_block: block + 3,
    }
}

/// On-chain state of one mock position.
#[derive(Debug, Clone, Default)]
pub struct MockPosition {
    pub info: PositionInfo,
    pub debt: U256,
    pub value: U256,
    pub collateral_value: U256,
}

impl MockPosition {
    /// Same shape as [`position`]: 5000 DAI of debt, farmed position plus
    /// USDC collateral.
    pub fn stressed_dai(collateral_value: U256, position_value: U256) -> Self {
        Self {
            info: PositionInfo {
                owner: Address::new([0xaa; 20]),
                coll_token: WRAPPER,
                underlying_token: USDC,
                debt_token: DAI,
                underlying_vault_share: U256::from(1u64),
                debt_share: U256::from(1u64),
                coll_id: U256::from_be_slice(FARMED.as_slice()),
                collateral_size: usd(1_000),
            },
            debt: dai(5_000),
            value: position_value,
            collateral_value,
        }
    }
}

/// Bank view with a movable head, settable prices, per-position
/// liquidatable flags and block-indexed token balances.
#[derive(Default)]
pub struct MockBank {
    pub head: AtomicU64,
    pub positions: Mutex<BTreeMap<PositionId, MockPosition>>,
    /// Oracle prices; unknown tokens are $1.
    pub prices: Mutex<HashMap<Address, U256>>,
    /// Tokens whose oracle price reverts as outdated.
    pub outdated_prices: Mutex<HashSet<Address>>,
    pub healthy: Mutex<HashSet<PositionId>>,
    /// `(token, from_block) -> balance`, a step function per token.
    pub balances: Mutex<BTreeMap<(Address, u64), U256>>,
    pub balance_reads: AtomicU32,
}

impl MockBank {
    pub fn at(head: u64) -> Self {
        let bank = Self::default();
        bank.head.store(head, Ordering::SeqCst);
        bank
    }

    pub fn set_head(&self, head: u64) {
        self.head.store(head, Ordering::SeqCst);
    }

    pub fn set_price(&self, token: Address, price: U256) {
        self.prices.lock().insert(token, price);
    }

    pub fn set_balance(&self, token: Address, from_block: u64, amount: U256) {
        self.balances.lock().insert((token, from_block), amount);
    }
}

#[async_trait]
impl BankReader for MockBank {
    async fn block_number(&self) -> ChainResult<u64> {
        Ok(self.head.load(Ordering::SeqCst))
    }
    async fn next_position_id(&self, _at: u64) -> ChainResult<PositionId> {
        Ok(self
            .positions
            .lock()
            .keys()
            .next_back()
            .map_or(1, |id| id + 1))
    }
    async fn position_info(&self, id: PositionId, _at: u64) -> ChainResult<PositionInfo> {
        Ok(self
            .positions
            .lock()
            .get(&id)
            .map(|p| p.info.clone())
            .unwrap_or_default())
    }
    async fn position_debt(&self, id: PositionId, _at: u64) -> ChainResult<U256> {
        Ok(self.positions.lock().get(&id).map(|p| p.debt).unwrap_or_default())
    }
    async fn position_value(&self, id: PositionId, _at: u64) -> ChainResult<U256> {
        Ok(self.positions.lock().get(&id).map(|p| p.value).unwrap_or_default())
    }
    async fn isolated_collateral_value(&self, id: PositionId, _at: u64) -> ChainResult<U256> {
        Ok(self
            .positions
            .lock()
            .get(&id)
            .map(|p| p.collateral_value)
            .unwrap_or_default())
    }
    async fn is_liquidatable(&self, id: PositionId) -> ChainResult<bool> {
        Ok(!self.healthy.lock().contains(&id))
    }
    async fn price(&self, token: Address, _at: u64) -> ChainResult<U256> {
        if self.outdated_prices.lock().contains(&token) {
            return Err(ChainError::TransactionReverted {
                tx_hash: None,
                reason: "execution reverted: PRICE_OUTDATED".into(),
            });
        }
        Ok(self.prices.lock().get(&token).copied().unwrap_or(WAD))
    }
    async fn liquidation_threshold(&self, _token: Address, _at: u64) -> ChainResult<u32> {
        Ok(LIQ_THRESHOLD)
    }
    async fn decimals(&self, token: Address) -> ChainResult<u8> {
        Ok(if token == USDC { 6 } else { 18 })
    }
    async fn balance_of(
        &self,
        token: Address,
        _holder: Address,
        block: Option<u64>,
    ) -> ChainResult<U256> {
        self.balance_reads.fetch_add(1, Ordering::SeqCst);
        let block = block.unwrap_or(u64::MAX);
        Ok(self
            .balances
            .lock()
            .range((token, 0)..=(token, block))
            .next_back()
            .map(|(_, amount)| *amount)
            .unwrap_or_default())
    }
}

/// Records submissions; transaction outcomes are set by the test.
pub struct MockSubmitter {
    pub signer: Address,
    pub owner: Address,
    pub gas: Mutex<GasParams>,
    pub submissions: Mutex<Vec<(PositionId, GasParams, u64)>>,
    pub statuses: Mutex<HashMap<B256, TxStatus>>,
    pub next_nonce: AtomicU64,
    pub submit_error: Mutex<Option<ChainError>>,
    pub withdrawals: Mutex<Vec<Vec<Address>>>,
}

impl MockSubmitter {
    pub fn new() -> Self {
        Self::owned_by(SIGNER)
    }

    /// Signer that does not own the liquidator contract.
    pub fn not_owner() -> Self {
        Self::owned_by(STRANGER)
    }

    fn owned_by(owner: Address) -> Self {
        Self {
            signer: SIGNER,
            owner,
            gas: Mutex::new(GasParams::Legacy { gas_price: GWEI }),
            submissions: Mutex::new(Vec::new()),
            statuses: Mutex::new(HashMap::new()),
            next_nonce: AtomicU64::new(7),
            submit_error: Mutex::new(None),
            withdrawals: Mutex::new(Vec::new()),
        }
    }

    pub fn set_status(&self, tx_hash: B256, status: TxStatus) {
        self.statuses.lock().insert(tx_hash, status);
    }

    pub fn submission_count(&self) -> usize {
        self.submissions.lock().len()
    }

    /// Hash of the n-th submission (1-based).
    pub fn hash_of(n: usize) -> B256 {
        B256::with_last_byte(n as u8)
    }
}

#[async_trait]
impl LiquidationSubmitter for MockSubmitter {
    fn signer(&self) -> Address {
        self.signer
    }

    fn liquidator_address(&self) -> Address {
        LIQUIDATOR
    }

    fn gas_limit(&self) -> u64 {
        2_500_000
    }

    async fn gas_params(&self) -> ChainResult<GasParams> {
        Ok(*self.gas.lock())
    }

    async fn submit_liquidation(
        &self,
        position_id: PositionId,
        gas: GasParams,
        nonce: Option<u64>,
    ) -> ChainResult<SubmittedTx> {
        if let Some(e) = self.submit_error.lock().take() {
            return Err(e);
        }
        let nonce = nonce.unwrap_or_else(|| self.next_nonce.fetch_add(1, Ordering::SeqCst));
        let mut submissions = self.submissions.lock();
        submissions.push((position_id, gas, nonce));
        let tx_hash = Self::hash_of(submissions.len());
        self.statuses.lock().insert(tx_hash, TxStatus::Pending);
        Ok(SubmittedTx {
            tx_hash,
            nonce,
            gas,
        })
    }

    async fn transaction_status(&self, tx_hash: B256) -> ChainResult<TxStatus> {
        Ok(self
            .statuses
            .lock()
            .get(&tx_hash)
            .cloned()
            .unwrap_or(TxStatus::Pending))
    }

    async fn withdraw(&self, tokens: &[Address]) -> ChainResult<B256> {
        if self.signer != self.owner {
            return Err(ChainError::OwnershipRejected {
                reason: OWNABLE_REVERT.into(),
            });
        }
        self.withdrawals.lock().push(tokens.to_vec());
        Ok(B256::repeat_byte(0xee))
    }
}

/// Fixed expected returns per sold token; unknown tokens have no route.
#[derive(Debug, Default)]
pub struct MockQuotes {
    pub returns: Mutex<HashMap<Address, U256>>,
    pub calls: AtomicU32,
}

impl MockQuotes {
    pub fn with_returns(returns: &[(Address, U256)]) -> Self {
        Self {
            returns: Mutex::new(returns.iter().copied().collect()),
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl QuoteProvider for MockQuotes {
    fn provider_id(&self) -> &str {
        "mock"
    }

    async fn quote(&self, request: &QuoteRequest) -> anyhow::Result<SwapQuote> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let expected = self
            .returns
            .lock()
            .get(&request.sell_token)
            .copied()
            .ok_or_else(|| anyhow!("no route for {}", request.sell_token))?;
        Ok(SwapQuote {
            sell_token: request.sell_token,
            buy_token: request.buy_token,
            sell_amount: request.amount,
            to: Address::new([0xde; 20]),
            call_data: Default::default(),
            expected_return: expected,
            min_return: min_return(expected, request.slippage_bps),
        })
    }
}
