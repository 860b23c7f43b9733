//! Liquidation Planner: turns a flagged position into an executable,
//! costed plan.
//!
//! The liquidator contract flash-borrows the full debt, closes the position,
//! and swaps every seized asset back into the debt token. A plan prices each
//! of those swaps with the aggregator and subtracts repayment, gas and the
//! protocol fee.

use crate::config::{EngineConfig, ExecutionConfig, PlannerConfig};
use crate::error::{EngineError, EngineResult};
use crate::risk::RiskSnapshot;
use crate::u256_math::{mul_bps, signed_diff_f64, usd_value, wad_to_f64};
use alloy::primitives::{Address, U256};
use blueberry_api::{QuoteProvider, QuoteRequest, SwapQuote};
use blueberry_chain::{ChainSnapshot, GasParams, LiquidationSubmitter, PositionId};
use futures::future::try_join_all;
use futures::stream::{self, StreamExt};
use smallvec::SmallVec;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Native gas token decimals.
const NATIVE_DECIMALS: u8 = 18;

/// One seized asset and how it becomes debt token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuoteLeg {
    pub token: Address,
    pub amount: U256,
    /// `None` when the asset already is the debt token.
    pub quote: Option<SwapQuote>,
}

impl QuoteLeg {
    /// Debt-token units this leg is expected to yield.
    pub fn expected_out(&self) -> U256 {
        self.quote
            .as_ref()
            .map(|q| q.expected_return)
            .unwrap_or(self.amount)
    }
}

/// Executable liquidation. Consumed once by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiquidationPlan {
    pub position_id: PositionId,
    pub debt_token: Address,
    /// Full close: the whole debt.
    pub repay_amount: U256,
    pub swap_route: SmallVec<[QuoteLeg; 2]>,
    pub expected_proceeds_usd: U256,
    pub expected_gas_cost_usd: U256,
    pub protocol_fee_usd: U256,
    pub expected_net_usd: U256,
    pub gas_limit: u64,
    /// Gas price the cost estimate assumed.
    pub gas_price_wei: u128,
    pub native_price_usd: U256,
    pub planned_at_block: u64,
    pub expires_at_block: u64,
}

impl LiquidationPlan {
    pub fn is_expired(&self, current_block: u64) -> bool {
        current_block > self.expires_at_block
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlanOutcome {
    Ready(LiquidationPlan),
    /// Costs meet or exceed proceeds plus the profit floor.
    Unprofitable {
        position_id: PositionId,
        net_usd: f64,
    },
}

impl PlanOutcome {
    pub fn position_id(&self) -> PositionId {
        match self {
            Self::Ready(plan) => plan.position_id,
            Self::Unprofitable { position_id, .. } => *position_id,
        }
    }
}

/// Builds plans for watchlist entries.
pub struct Planner {
    quotes: Arc<dyn QuoteProvider>,
    submitter: Arc<dyn LiquidationSubmitter>,
    config: PlannerConfig,
    execution: ExecutionConfig,
    liquidation_fee_bps: u32,
}

impl Planner {
    pub fn new(
        quotes: Arc<dyn QuoteProvider>,
        submitter: Arc<dyn LiquidationSubmitter>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            quotes,
            submitter,
            config: config.planner.clone(),
            execution: config.execution.clone(),
            liquidation_fee_bps: config.risk.liquidation_fee_bps,
        }
    }

    /// Gas price the estimate assumes: market price scaled by the
    /// multiplier, capped at the configured ceiling.
    fn estimate_gas(&self, market: GasParams) -> GasParams {
        market.scaled_bps(
            self.execution.multiplier_bps(),
            self.execution.max_gas_price_wei(),
        )
    }

    /// Plan every candidate with at most `planner_workers` in flight.
    ///
    /// Gas is read once for the batch; per-position failures are returned
    /// alongside the successes.
    #[instrument(skip(self, snapshot, candidates), fields(block = snapshot.block_number, candidates = candidates.len()))]
    pub async fn plan_batch(
        &self,
        snapshot: &Arc<ChainSnapshot>,
        candidates: Vec<RiskSnapshot>,
    ) -> EngineResult<Vec<(PositionId, EngineResult<PlanOutcome>)>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let gas = self.estimate_gas(self.submitter.gas_params().await?);

        let results = stream::iter(candidates)
            .map(|risk| async move {
                let id = risk.position_id;
                (id, self.plan(snapshot, &risk, gas).await)
            })
            .buffer_unordered(self.config.planner_workers.max(1))
            .collect::<Vec<_>>()
            .await;

        Ok(results)
    }

    /// Plan one position against `snapshot` with the given gas estimate.
    pub async fn plan(
        &self,
        snapshot: &ChainSnapshot,
        risk: &RiskSnapshot,
        gas: GasParams,
    ) -> EngineResult<PlanOutcome> {
        let position_id = risk.position_id;
        let position = snapshot
            .position(position_id)
            .ok_or_else(|| EngineError::QuoteUnavailable {
                position_id,
                reason: "position missing from snapshot".into(),
            })?;

        let debt_token = position.debt_token;
        let debt_price = snapshot
            .price(&debt_token)
            .ok_or(EngineError::MissingPrice { token: debt_token })?;
        let native_token = snapshot.native_token;
        let native_price = snapshot
            .price(&native_token)
            .ok_or(EngineError::MissingPrice { token: native_token })?;
        let debt_decimals = snapshot.decimals_of(&debt_token);

        let seized = [
            (position.farmed_token(), position.collateral_size),
            (position.underlying_token, position.collateral_amount),
        ];
        let recipient = self.submitter.liquidator_address();
        let legs = try_join_all(
            seized
                .into_iter()
                .filter(|(token, amount)| !token.is_zero() && !amount.is_zero())
                .map(|(token, amount)| {
                    let request = QuoteRequest::new(token, debt_token, amount, recipient)
                        .with_decimals(snapshot.decimals_of(&token), debt_decimals)
                        .with_slippage_bps(self.config.slippage_bps);
                    self.quote_leg(position_id, debt_token, request)
                }),
        )
        .await?;
        let swap_route: SmallVec<[QuoteLeg; 2]> = legs.into_iter().collect();

        let proceeds_out = swap_route
            .iter()
            .fold(U256::ZERO, |acc, leg| acc.saturating_add(leg.expected_out()));
        let proceeds_usd = usd_value(proceeds_out, debt_price, debt_decimals);
        let repay_usd = usd_value(position.debt_amount, debt_price, debt_decimals);
        let fee_usd = mul_bps(proceeds_usd, self.liquidation_fee_bps);
        let gas_limit = self.submitter.gas_limit();
        let gas_usd = usd_value(gas.cost_wei(gas_limit), native_price, NATIVE_DECIMALS);

        let costs = repay_usd.saturating_add(fee_usd).saturating_add(gas_usd);
        let floor = costs.saturating_add(self.config.min_profit_wad());
        if proceeds_usd <= floor {
            let net_usd = signed_diff_f64(proceeds_usd, costs);
            debug!(
                position_id,
                net_usd,
                min_profit_usd = self.config.min_profit_usd,
                proceeds_usd = wad_to_f64(proceeds_usd),
                repay_usd = wad_to_f64(repay_usd),
                gas_usd = wad_to_f64(gas_usd),
                "Liquidation unprofitable"
            );
            return Ok(PlanOutcome::Unprofitable {
                position_id,
                net_usd,
            });
        }

        let plan = LiquidationPlan {
            position_id,
            debt_token,
            repay_amount: position.debt_amount,
            swap_route,
            expected_proceeds_usd: proceeds_usd,
            expected_gas_cost_usd: gas_usd,
            protocol_fee_usd: fee_usd,
            expected_net_usd: proceeds_usd - costs,
            gas_limit,
            gas_price_wei: gas.effective_gas_price(),
            native_price_usd: native_price,
            planned_at_block: snapshot.block_number,
            expires_at_block: snapshot.block_number + self.config.quote_validity_blocks,
        };

        info!(
            position_id,
            block = snapshot.block_number,
            expires_at_block = plan.expires_at_block,
            legs = plan.swap_route.len(),
            net_usd = format!("${:.2}", wad_to_f64(plan.expected_net_usd)),
            "Liquidation planned"
        );
        Ok(PlanOutcome::Ready(plan))
    }

    async fn quote_leg(
        &self,
        position_id: PositionId,
        debt_token: Address,
        request: QuoteRequest,
    ) -> EngineResult<QuoteLeg> {
        if request.sell_token == debt_token {
            return Ok(QuoteLeg {
                token: request.sell_token,
                amount: request.amount,
                quote: None,
            });
        }
        let quote = self
            .quotes
            .quote(&request)
            .await
            .map_err(|e| EngineError::QuoteUnavailable {
                position_id,
                reason: format!("{}: {e:#}", self.quotes.provider_id()),
            })?;
        Ok(QuoteLeg {
            token: request.sell_token,
            amount: request.amount,
            quote: Some(quote),
        })
    }
}
