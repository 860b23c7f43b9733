//! Deployment settings read from the process environment.

use alloy::primitives::Address;
use anyhow::{anyhow, Context, Result};
use std::str::FromStr;

/// Where the engine runs and which contracts it talks to.
#[derive(Clone)]
pub struct DeploymentEnv {
    pub rpc_url: String,
    pub chain_id: u64,
    pub bank: Address,
    pub oracle: Address,
    pub liquidator: Address,
    /// Wrapped native token, priced for gas cost estimates.
    pub native_token: Address,
    pub private_key: String,
    pub paraswap_url: Option<String>,
    /// "legacy" or "eip1559"
    pub gas_pricing: String,
    pub default_gas_price_gwei: f64,
    pub max_gas_price_gwei: f64,
    pub priority_fee_gwei: Option<f64>,
    pub liquidation_gas_limit: Option<u64>,
}

impl DeploymentEnv {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &str| -> Result<String> {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| anyhow!("{key} must be set"))
        };
        let address = |key: &str| -> Result<Address> {
            let raw = required(key)?;
            Address::from_str(raw.trim()).with_context(|| format!("{key} is not an address: {raw}"))
        };
        let optional = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let optional_f64 = |key: &str| -> Result<Option<f64>> {
            optional(key)
                .map(|v| v.trim().parse::<f64>().with_context(|| format!("{key} is not a number")))
                .transpose()
        };

        let chain_id = required("CHAIN_ID")?
            .trim()
            .parse()
            .context("CHAIN_ID is not an integer")?;
        let liquidation_gas_limit = optional("LIQUIDATION_GAS_LIMIT")
            .map(|v| v.trim().parse().context("LIQUIDATION_GAS_LIMIT is not an integer"))
            .transpose()?;

        Ok(Self {
            rpc_url: required("RPC_URL")?,
            chain_id,
            bank: address("BANK")?,
            oracle: address("ORACLE")?,
            liquidator: address("LIQUIDATOR")?,
            native_token: address("NATIVE_TOKEN")?,
            private_key: required("PRIVATE_KEY")?,
            paraswap_url: optional("PARASWAP_URL"),
            gas_pricing: optional("GAS_PRICING").unwrap_or_else(|| "legacy".to_string()),
            default_gas_price_gwei: optional_f64("DEFAULT_GAS_PRICE_GWEI")?.unwrap_or(1.0),
            max_gas_price_gwei: optional_f64("MAX_GAS_PRICE_GWEI")?.unwrap_or(200.0),
            priority_fee_gwei: optional_f64("PRIORITY_FEE_GWEI")?,
            liquidation_gas_limit,
        })
    }
}

impl std::fmt::Debug for DeploymentEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentEnv")
            .field("rpc_url", &self.rpc_url)
            .field("chain_id", &self.chain_id)
            .field("bank", &self.bank)
            .field("oracle", &self.oracle)
            .field("liquidator", &self.liquidator)
            .field("native_token", &self.native_token)
            .field("gas_pricing", &self.gas_pricing)
            .finish_non_exhaustive()
    }
}
