//! Swap quote abstraction used by the liquidation planner.
//!
//! A quote turns seized collateral into the debt token. The calldata
//! returned by the aggregator is executed by the liquidator contract, so the
//! quote's recipient is always that contract.

use alloy::primitives::{Address, Bytes, U256};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Basis points denominator.
const BPS: u64 = 10_000;

/// Parameters for requesting a swap quote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuoteRequest {
    pub sell_token: Address,
    pub buy_token: Address,
    /// Raw amount of `sell_token`.
    pub amount: U256,
    pub sell_decimals: u8,
    pub buy_decimals: u8,
    /// Address that executes the swap and receives the output.
    pub recipient: Address,
    /// Slippage tolerance in basis points (e.g., 100 = 1%).
    pub slippage_bps: u16,
}

impl QuoteRequest {
    /// New request with 18 decimals on both sides and 1% slippage.
    pub fn new(sell_token: Address, buy_token: Address, amount: U256, recipient: Address) -> Self {
        Self {
            sell_token,
            buy_token,
            amount,
            sell_decimals: 18,
            buy_decimals: 18,
            recipient,
            slippage_bps: 100,
        }
    }

    pub fn with_decimals(mut self, sell_decimals: u8, buy_decimals: u8) -> Self {
        self.sell_decimals = sell_decimals;
        self.buy_decimals = buy_decimals;
        self
    }

    pub fn with_slippage_bps(mut self, slippage_bps: u16) -> Self {
        self.slippage_bps = slippage_bps;
        self
    }
}

/// Executable swap quote.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapQuote {
    pub sell_token: Address,
    pub buy_token: Address,
    pub sell_amount: U256,
    /// Aggregator contract to call.
    pub to: Address,
    pub call_data: Bytes,
    /// Quoted output in raw `buy_token` units.
    pub expected_return: U256,
    /// Output floor after slippage.
    pub min_return: U256,
}

/// Apply a slippage tolerance to a quoted amount.
pub fn min_return(expected: U256, slippage_bps: u16) -> U256 {
    let keep = BPS.saturating_sub(slippage_bps as u64);
    expected * U256::from(keep) / U256::from(BPS)
}

/// Trait for swap quote providers.
#[async_trait]
pub trait QuoteProvider: Send + Sync + Debug {
    /// Provider identifier for logging.
    fn provider_id(&self) -> &str;

    /// Quote selling `request.amount` of `sell_token` for `buy_token`.
    async fn quote(&self, request: &QuoteRequest) -> Result<SwapQuote>;
}
