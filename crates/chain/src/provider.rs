//! HTTP provider for the bank, oracle and token reads.
//! Uses Alloy providers for type-safe RPC interactions.

use crate::bank::{BankReader, PositionId, PositionInfo};
use crate::contracts::bindings::{IBlueberryBank, ICoreOracle, IERC20};
use crate::error::{ChainError, ChainResult};
use alloy::eips::BlockId;
use alloy::primitives::{Address, U256};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::transports::http::reqwest::Url;
use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info};

/// Provider manager bound to one bank deployment.
#[derive(Debug, Clone)]
pub struct ProviderManager {
    rpc_url: Url,
    bank: Address,
    oracle: Address,
}

fn rpc_error(e: impl std::fmt::Display) -> ChainError {
    ChainError::classify(e.to_string(), None)
}

impl ProviderManager {
    /// Create a provider manager and verify the endpoint answers.
    pub async fn new(rpc_url: &str, bank: Address, oracle: Address) -> Result<Self> {
        let manager = Self::connect_lazy(rpc_url, bank, oracle)?;

        info!(rpc = rpc_url, bank = %bank, oracle = %oracle, "Initializing provider manager");
        let block = manager.provider().get_block_number().await?;
        info!(block, "Provider connection verified");

        Ok(manager)
    }

    /// Create without touching the network.
    pub fn connect_lazy(rpc_url: &str, bank: Address, oracle: Address) -> Result<Self> {
        Ok(Self {
            rpc_url: rpc_url.parse()?,
            bank,
            oracle,
        })
    }

    pub fn rpc_url(&self) -> &str {
        self.rpc_url.as_str()
    }

    pub fn bank_address(&self) -> Address {
        self.bank
    }

    pub fn oracle_address(&self) -> Address {
        self.oracle
    }

    fn provider(&self) -> impl Provider {
        ProviderBuilder::new().on_http(self.rpc_url.clone())
    }

    /// Check if provider is healthy.
    pub async fn health_check(&self) -> ChainResult<bool> {
        let block = self.block_number().await?;
        debug!(block, "Provider health check passed");
        Ok(block > 0)
    }
}

#[async_trait]
impl BankReader for ProviderManager {
    async fn block_number(&self) -> ChainResult<u64> {
        self.provider().get_block_number().await.map_err(rpc_error)
    }

    async fn next_position_id(&self, at: u64) -> ChainResult<PositionId> {
        let provider = self.provider();
        let bank = IBlueberryBank::new(self.bank, &provider);
        let next = bank
            .getNextPositionId()
            .block(BlockId::number(at))
            .call()
            .await
            .map_err(rpc_error)?
            ._0;
        Ok(next.saturating_to::<u64>())
    }

    async fn position_info(&self, id: PositionId, at: u64) -> ChainResult<PositionInfo> {
        let provider = self.provider();
        let bank = IBlueberryBank::new(self.bank, &provider);
        let position = bank
            .getPositionInfo(U256::from(id))
            .block(BlockId::number(at))
            .call()
            .await
            .map_err(rpc_error)?
            ._0;
        Ok(position.into())
    }

    async fn position_debt(&self, id: PositionId, at: u64) -> ChainResult<U256> {
        let provider = self.provider();
        let bank = IBlueberryBank::new(self.bank, &provider);
        Ok(bank
            .getPositionDebt(U256::from(id))
            .block(BlockId::number(at))
            .call()
            .await
            .map_err(rpc_error)?
            ._0)
    }

    async fn position_value(&self, id: PositionId, at: u64) -> ChainResult<U256> {
        let provider = self.provider();
        let bank = IBlueberryBank::new(self.bank, &provider);
        Ok(bank
            .getPositionValue(U256::from(id))
            .block(BlockId::number(at))
            .call()
            .await
            .map_err(rpc_error)?
            ._0)
    }

    async fn isolated_collateral_value(&self, id: PositionId, at: u64) -> ChainResult<U256> {
        let provider = self.provider();
        let bank = IBlueberryBank::new(self.bank, &provider);
        Ok(bank
            .getIsolatedCollateralValue(U256::from(id))
            .block(BlockId::number(at))
            .call()
            .await
            .map_err(rpc_error)?
            ._0)
    }

    async fn is_liquidatable(&self, id: PositionId) -> ChainResult<bool> {
        let provider = self.provider();
        let bank = IBlueberryBank::new(self.bank, &provider);
        Ok(bank
            .isLiquidatable(U256::from(id))
            .call()
            .await
            .map_err(rpc_error)?
            ._0)
    }

    async fn price(&self, token: Address, at: u64) -> ChainResult<U256> {
        let provider = self.provider();
        let oracle = ICoreOracle::new(self.oracle, &provider);
        Ok(oracle
            .getPrice(token)
            .block(BlockId::number(at))
            .call()
            .await
            .map_err(rpc_error)?
            ._0)
    }

    async fn liquidation_threshold(&self, token: Address, at: u64) -> ChainResult<u32> {
        let provider = self.provider();
        let oracle = ICoreOracle::new(self.oracle, &provider);
        let lt = oracle
            .getLiqThreshold(token)
            .block(BlockId::number(at))
            .call()
            .await
            .map_err(rpc_error)?
            ._0;
        Ok(lt.saturating_to::<u32>())
    }

    async fn decimals(&self, token: Address) -> ChainResult<u8> {
        let provider = self.provider();
        let erc20 = IERC20::new(token, &provider);
        Ok(erc20.decimals().call().await.map_err(rpc_error)?._0)
    }

    async fn balance_of(
        &self,
        token: Address,
        holder: Address,
        block: Option<u64>,
    ) -> ChainResult<U256> {
        let provider = self.provider();
        let erc20 = IERC20::new(token, &provider);
        let call = erc20.balanceOf(holder);
        let call = match block {
            Some(n) => call.block(BlockId::number(n)),
            None => call,
        };
        Ok(call.call().await.map_err(rpc_error)?._0)
    }
}
