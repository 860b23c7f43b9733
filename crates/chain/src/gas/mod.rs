//! Gas pricing strategies.
//!
//! A trait-based abstraction over Legacy and EIP-1559 pricing. The
//! coordinator asks the strategy for current parameters, scales them into a
//! bid, and bumps the bid when a submitted liquidation sits in the mempool
//! past its deadline.
//!
//! ```rust,ignore
//! use blueberry_chain::gas::{GasStrategy, LegacyGasStrategy, Eip1559GasStrategy};
//!
//! let legacy = LegacyGasStrategy::new(1_000_000_000, 10_000_000_000);
//! let eip1559 = Eip1559GasStrategy::new(2_000_000_000, 1.5);
//! ```

mod eip1559;
mod legacy;

pub use eip1559::Eip1559GasStrategy;
pub use legacy::LegacyGasStrategy;

use alloy::primitives::U256;
use alloy::rpc::types::TransactionRequest;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Wei per gwei.
pub const GWEI: u128 = 1_000_000_000;

/// Basis points denominator.
const BPS: u128 = 10_000;

/// Smallest fee increase nodes accept for a replacement transaction.
const MIN_REPLACEMENT_BUMP_BPS: u128 = 1_000;

/// Gas parameters fetched from the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GasParams {
    /// Legacy gas pricing (pre-EIP-1559).
    Legacy {
        /// Gas price in wei.
        gas_price: u128,
    },
    /// EIP-1559 gas pricing.
    Eip1559 {
        /// Maximum fee per gas in wei.
        max_fee_per_gas: u128,
        /// Maximum priority fee per gas in wei.
        max_priority_fee_per_gas: u128,
        /// Base fee at fetch time (for reference).
        base_fee: u128,
    },
}

impl GasParams {
    /// Effective gas price used for cost estimation.
    pub fn effective_gas_price(&self) -> u128 {
        match self {
            GasParams::Legacy { gas_price } => *gas_price,
            GasParams::Eip1559 {
                max_fee_per_gas, ..
            } => *max_fee_per_gas,
        }
    }

    /// Worst-case cost in wei for `gas_limit` units.
    pub fn cost_wei(&self, gas_limit: u64) -> U256 {
        U256::from(self.effective_gas_price()) * U256::from(gas_limit)
    }

    /// Multiply every price component by `bps / 10000`, capping the result
    /// at `cap` wei.
    pub fn scaled_bps(&self, bps: u32, cap: u128) -> Self {
        let scale = |v: u128| (v.saturating_mul(bps as u128) / BPS).min(cap);
        match *self {
            GasParams::Legacy { gas_price } => GasParams::Legacy {
                gas_price: scale(gas_price),
            },
            GasParams::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
                base_fee,
            } => {
                let max_fee = scale(max_fee_per_gas);
                GasParams::Eip1559 {
                    max_fee_per_gas: max_fee,
                    max_priority_fee_per_gas: scale(max_priority_fee_per_gas).min(max_fee),
                    base_fee,
                }
            }
        }
    }

    /// Replacement bid: every component raised by `bump_bps`.
    ///
    /// Nodes reject a same-nonce replacement unless both fees rise by at
    /// least 10%, so callers should use `bump_bps >= 1000`.
    pub fn bumped(&self, bump_bps: u32, cap: u128) -> Self {
        self.scaled_bps(10_000 + bump_bps, cap)
    }

    /// Whether a node accepts `self` as a same-nonce replacement for
    /// `previous`: every fee component must rise by at least 10%.
    pub fn replaces(&self, previous: &GasParams) -> bool {
        let raised = |new: u128, old: u128| {
            new.saturating_mul(BPS) >= old.saturating_mul(BPS + MIN_REPLACEMENT_BUMP_BPS)
        };
        match (*self, *previous) {
            (
                GasParams::Eip1559 {
                    max_fee_per_gas,
                    max_priority_fee_per_gas,
                    ..
                },
                GasParams::Eip1559 {
                    max_fee_per_gas: old_fee,
                    max_priority_fee_per_gas: old_tip,
                    ..
                },
            ) => raised(max_fee_per_gas, old_fee) && raised(max_priority_fee_per_gas, old_tip),
            _ => raised(self.effective_gas_price(), previous.effective_gas_price()),
        }
    }

    /// Lower every component so the effective price is at most `ceiling` wei.
    pub fn capped(&self, ceiling: u128) -> Self {
        match *self {
            GasParams::Legacy { gas_price } => GasParams::Legacy {
                gas_price: gas_price.min(ceiling),
            },
            GasParams::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
                base_fee,
            } => {
                let max_fee = max_fee_per_gas.min(ceiling);
                GasParams::Eip1559 {
                    max_fee_per_gas: max_fee,
                    max_priority_fee_per_gas: max_priority_fee_per_gas.min(max_fee),
                    base_fee,
                }
            }
        }
    }
}

/// Trait for gas pricing strategies.
#[async_trait]
pub trait GasStrategy: Send + Sync + Debug {
    /// Fetch current gas parameters from the given RPC URL.
    async fn fetch_params(&self, rpc_url: &str) -> Result<GasParams>;

    /// Apply gas parameters to a transaction request.
    fn apply_gas(&self, tx: &mut TransactionRequest, params: &GasParams);

    /// Strategy name for logging.
    fn strategy_name(&self) -> &'static str;
}

/// Create a gas strategy from deployment configuration.
///
/// * `pricing_model` - "legacy" or "eip1559"
/// * `default_gas_price_gwei` - fallback gas price (Legacy)
/// * `max_gas_price_gwei` - hard ceiling
/// * `priority_fee_gwei` - tip (EIP-1559)
pub fn create_gas_strategy(
    pricing_model: &str,
    default_gas_price_gwei: f64,
    max_gas_price_gwei: f64,
    priority_fee_gwei: Option<f64>,
) -> Box<dyn GasStrategy> {
    match pricing_model.to_lowercase().as_str() {
        "eip1559" | "eip-1559" => {
            let priority_fee = priority_fee_gwei.unwrap_or(2.0);
            Box::new(
                Eip1559GasStrategy::new((priority_fee * 1e9) as u128, 2.0)
                    .with_max_fee_cap((max_gas_price_gwei * 1e9) as u128),
            )
        }
        _ => Box::new(LegacyGasStrategy::new(
            (default_gas_price_gwei * 1e9) as u128,
            (max_gas_price_gwei * 1e9) as u128,
        )),
    }
}
