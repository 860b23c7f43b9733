//! Legacy (single `gasPrice`) pricing, used on chains and local forks that
//! do not accept EIP-1559 transactions.

use super::{GasParams, GasStrategy};
use alloy::network::TransactionBuilder;
use alloy::rpc::types::TransactionRequest;
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;

/// Legacy gas pricing strategy.
///
/// Reads `eth_gasPrice`, caps it at `max_gas_price`, and remembers the
/// last observed value.
#[derive(Debug)]
pub struct LegacyGasStrategy {
    default_gas_price: u128,
    max_gas_price: u128,
    last_observed: Mutex<u128>,
}

impl LegacyGasStrategy {
    /// * `default_gas_price` - used when the node does not answer, in wei
    /// * `max_gas_price` - ceiling, in wei
    pub fn new(default_gas_price: u128, max_gas_price: u128) -> Self {
        Self {
            default_gas_price,
            max_gas_price,
            last_observed: Mutex::new(default_gas_price.min(max_gas_price)),
        }
    }

    /// Last gas price seen (capped).
    pub fn last_observed(&self) -> u128 {
        *self.last_observed.lock()
    }

    fn observe(&self, gas_price: u128) -> u128 {
        let capped = gas_price.min(self.max_gas_price);
        *self.last_observed.lock() = capped;
        capped
    }
}

#[async_trait]
impl GasStrategy for LegacyGasStrategy {
    async fn fetch_params(&self, rpc_url: &str) -> Result<GasParams> {
        use alloy::providers::{Provider, ProviderBuilder};

        let provider = ProviderBuilder::new().on_http(rpc_url.parse()?);
        let gas_price = provider
            .get_gas_price()
            .await
            .unwrap_or(self.default_gas_price);

        Ok(GasParams::Legacy {
            gas_price: self.observe(gas_price),
        })
    }

    fn apply_gas(&self, tx: &mut TransactionRequest, params: &GasParams) {
        // An EIP-1559 bid degrades to its max fee.
        tx.set_gas_price(params.effective_gas_price());
    }

    fn strategy_name(&self) -> &'static str {
        "Legacy"
    }
}
