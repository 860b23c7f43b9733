//! Contract bindings and the liquidator contract wrapper.
//!
//! The liquidator contract takes a flash loan in the debt token, calls
//! `bank.liquidate`, swaps the seized collateral back through Paraswap and
//! repays the loan. Proceeds stay in the contract until the owner calls
//! `withdraw(tokens)`, which forwards them to the treasury.

pub mod bindings;

pub use bindings::{IBlueberryBank, IBlueberryLiquidator, ICoreOracle, IERC20, Position};

use crate::bank::PositionId;
use crate::error::{ChainError, ChainResult};
use crate::gas::GasParams;
use crate::signer::{TransactionSender, TxStatus};
use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::providers::ProviderBuilder;
use alloy::sol_types::SolCall;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// A broadcast liquidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmittedTx {
    pub tx_hash: B256,
    pub nonce: u64,
    pub gas: GasParams,
}

/// Write side of the engine: everything that spends the signer's nonce.
#[async_trait]
pub trait LiquidationSubmitter: Send + Sync {
    /// Signing account.
    fn signer(&self) -> Address;

    /// Liquidator contract holding proceeds.
    fn liquidator_address(&self) -> Address;

    /// Gas limit used for `liquidate`.
    fn gas_limit(&self) -> u64;

    /// Current market gas parameters.
    async fn gas_params(&self) -> ChainResult<GasParams>;

    /// Broadcast `liquidate(positionId)`. With `nonce` set the call replaces
    /// the earlier transaction using that nonce.
    async fn submit_liquidation(
        &self,
        position_id: PositionId,
        gas: GasParams,
        nonce: Option<u64>,
    ) -> ChainResult<SubmittedTx>;

    async fn transaction_status(&self, tx_hash: B256) -> ChainResult<TxStatus>;

    /// Owner-only sweep of `tokens` to the treasury. Waits for inclusion.
    async fn withdraw(&self, tokens: &[Address]) -> ChainResult<B256>;
}

/// Encode `liquidate(positionId)`.
pub fn encode_liquidate(position_id: PositionId) -> Bytes {
    IBlueberryLiquidator::liquidateCall {
        positionId: U256::from(position_id),
    }
    .abi_encode()
    .into()
}

/// Encode `withdraw(tokens)`.
pub fn encode_withdraw(tokens: &[Address]) -> Bytes {
    IBlueberryLiquidator::withdrawCall {
        tokens: tokens.to_vec(),
    }
    .abi_encode()
    .into()
}

/// Liquidator contract wrapper with transaction sending capability.
pub struct LiquidatorContract {
    pub address: Address,
    sender: Arc<TransactionSender>,
}

impl LiquidatorContract {
    pub fn new(address: Address, sender: Arc<TransactionSender>) -> Self {
        Self { address, sender }
    }

    pub fn sender(&self) -> &Arc<TransactionSender> {
        &self.sender
    }

    /// Dry-run `withdraw` from the signer so ownership failures surface
    /// before a nonce is spent.
    async fn simulate_withdraw(&self, tokens: &[Address]) -> ChainResult<()> {
        let provider = ProviderBuilder::new().on_http(
            self.sender
                .rpc_url()
                .parse()
                .map_err(|e| ChainError::Rpc(format!("invalid rpc url: {e}")))?,
        );
        let contract = IBlueberryLiquidator::new(self.address, &provider);
        contract
            .withdraw(tokens.to_vec())
            .from(self.sender.address)
            .call()
            .await
            .map(|_| ())
            .map_err(|e| ChainError::classify(e.to_string(), Some(self.sender.address)))
    }
}

#[async_trait]
impl LiquidationSubmitter for LiquidatorContract {
    fn signer(&self) -> Address {
        self.sender.address
    }

    fn liquidator_address(&self) -> Address {
        self.address
    }

    fn gas_limit(&self) -> u64 {
        self.sender.gas_limit()
    }

    async fn gas_params(&self) -> ChainResult<GasParams> {
        self.sender.gas_params().await
    }

    #[instrument(skip(self, gas), fields(contract = %self.address))]
    async fn submit_liquidation(
        &self,
        position_id: PositionId,
        gas: GasParams,
        nonce: Option<u64>,
    ) -> ChainResult<SubmittedTx> {
        let calldata = encode_liquidate(position_id);
        let (tx_hash, nonce) = self
            .sender
            .submit(self.address, calldata, gas, nonce, None)
            .await?;

        info!(position_id, tx_hash = %tx_hash, nonce, "Liquidation submitted");
        Ok(SubmittedTx {
            tx_hash,
            nonce,
            gas,
        })
    }

    async fn transaction_status(&self, tx_hash: B256) -> ChainResult<TxStatus> {
        self.sender.receipt_status(tx_hash).await
    }

    #[instrument(skip(self), fields(contract = %self.address, tokens = tokens.len()))]
    async fn withdraw(&self, tokens: &[Address]) -> ChainResult<B256> {
        if let Err(e) = self.simulate_withdraw(tokens).await {
            warn!(error = %e, "Withdraw simulation failed");
            return Err(e);
        }

        let tx_hash = self
            .sender
            .send_and_confirm(self.address, encode_withdraw(tokens))
            .await?;
        info!(tx_hash = %tx_hash, "Proceeds withdrawn to treasury");
        Ok(tx_hash)
    }
}
