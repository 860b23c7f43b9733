//! Transaction signer and sender for liquidations and sweeps.
//! Uses Alloy providers for type-safe RPC interactions.
//!
//! - Cached nonce: atomic counter, resynced from chain after failures
//! - Explicit gas bids so the coordinator can replace a stuck transaction
//!   under the same nonce
//! - Supports both Legacy and EIP-1559 gas pricing

use crate::error::{ChainError, ChainResult};
use crate::gas::{create_gas_strategy, GasParams, GasStrategy, LegacyGasStrategy};
use alloy::network::{EthereumWallet, TransactionBuilder};
use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;
use alloy::transports::http::reqwest::Url;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default gas limit for `liquidate(positionId)`.
///
/// Covers a flash loan, the bank liquidation, two aggregator swaps and the
/// repayment.
pub const DEFAULT_LIQUIDATION_GAS_LIMIT: u64 = 2_500_000;

/// Gas limit for `withdraw(tokens)`.
const WITHDRAW_GAS_LIMIT: u64 = 300_000;

const CONFIRM_TIMEOUT: Duration = Duration::from_secs(120);
const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Receipt-derived status of a submitted transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxStatus {
    /// No receipt yet.
    Pending,
    Confirmed { block: u64, gas_used: u64 },
    Reverted { block: u64 },
}

/// Local nonce counter for strictly ordered submission.
pub struct NonceManager {
    current: AtomicU64,
    last_synced: AtomicU64,
}

impl NonceManager {
    pub fn new(initial_nonce: u64) -> Self {
        Self {
            current: AtomicU64::new(initial_nonce),
            last_synced: AtomicU64::new(initial_nonce),
        }
    }

    /// Take the next nonce.
    #[inline]
    pub fn next(&self) -> u64 {
        self.current.fetch_add(1, Ordering::SeqCst)
    }

    #[inline]
    pub fn current(&self) -> u64 {
        self.current.load(Ordering::SeqCst)
    }

    /// Last value read from chain.
    pub fn last_synced(&self) -> u64 {
        self.last_synced.load(Ordering::SeqCst)
    }

    /// Move forward to the chain's pending count; never moves backwards.
    pub fn sync(&self, chain_nonce: u64) {
        self.current.fetch_max(chain_nonce, Ordering::SeqCst);
        self.last_synced.store(chain_nonce, Ordering::SeqCst);
    }

    /// Force the counter to the chain value (after a rejected submission).
    pub fn reset(&self, chain_nonce: u64) {
        self.current.store(chain_nonce, Ordering::SeqCst);
        self.last_synced.store(chain_nonce, Ordering::SeqCst);
    }
}

/// Transaction sender with configurable gas strategy.
pub struct TransactionSender {
    rpc_url: Url,
    wallet: EthereumWallet,
    pub address: Address,
    chain_id: u64,
    nonce_manager: NonceManager,
    gas_limit: u64,
    gas_strategy: Box<dyn GasStrategy>,
    cached_gas_params: parking_lot::RwLock<Option<GasParams>>,
}

/// Builder for TransactionSender.
pub struct TransactionSenderBuilder {
    rpc_url: String,
    chain_id: u64,
    gas_strategy: Option<Box<dyn GasStrategy>>,
    gas_limit: Option<u64>,
}

impl TransactionSenderBuilder {
    pub fn new(rpc_url: impl Into<String>, chain_id: u64) -> Self {
        Self {
            rpc_url: rpc_url.into(),
            chain_id,
            gas_strategy: None,
            gas_limit: None,
        }
    }

    pub fn gas_strategy(mut self, strategy: Box<dyn GasStrategy>) -> Self {
        self.gas_strategy = Some(strategy);
        self
    }

    /// Gas limit for liquidation transactions.
    pub fn gas_limit(mut self, limit: u64) -> Self {
        self.gas_limit = Some(limit);
        self
    }

    /// Set gas strategy from deployment parameters.
    pub fn gas_from_config(
        mut self,
        pricing_model: &str,
        default_gas_price_gwei: f64,
        max_gas_price_gwei: f64,
        priority_fee_gwei: Option<f64>,
    ) -> Self {
        self.gas_strategy = Some(create_gas_strategy(
            pricing_model,
            default_gas_price_gwei,
            max_gas_price_gwei,
            priority_fee_gwei,
        ));
        self
    }

    /// Parse the key, read the starting nonce and prime the gas cache.
    pub async fn build(self, private_key: &str) -> Result<TransactionSender> {
        let signer: PrivateKeySigner = private_key.trim_start_matches("0x").parse()?;
        let address = signer.address();
        let wallet = EthereumWallet::from(signer);
        let rpc_url: Url = self.rpc_url.parse()?;

        let provider = ProviderBuilder::new().on_http(rpc_url.clone());
        let initial_nonce = provider.get_transaction_count(address).await?;

        let gas_strategy = self.gas_strategy.unwrap_or_else(|| {
            Box::new(LegacyGasStrategy::new(
                1_000_000_000,   // 1 gwei default
                100_000_000_000, // 100 gwei max
            ))
        });
        let initial_gas_params = gas_strategy.fetch_params(&self.rpc_url).await.ok();

        info!(
            address = %address,
            chain_id = self.chain_id,
            initial_nonce,
            gas_strategy = gas_strategy.strategy_name(),
            "Transaction sender initialized"
        );

        Ok(TransactionSender {
            rpc_url,
            wallet,
            address,
            chain_id: self.chain_id,
            nonce_manager: NonceManager::new(initial_nonce),
            gas_limit: self.gas_limit.unwrap_or(DEFAULT_LIQUIDATION_GAS_LIMIT),
            gas_strategy,
            cached_gas_params: parking_lot::RwLock::new(initial_gas_params),
        })
    }
}

impl TransactionSender {
    pub fn gas_strategy_name(&self) -> &'static str {
        self.gas_strategy.strategy_name()
    }

    pub fn gas_limit(&self) -> u64 {
        self.gas_limit
    }

    pub fn current_nonce(&self) -> u64 {
        self.nonce_manager.current()
    }

    /// Current gas parameters; falls back to the last cached value when the
    /// node cannot be reached.
    pub async fn gas_params(&self) -> ChainResult<GasParams> {
        match self.update_gas_params().await {
            Ok(params) => Ok(params),
            Err(e) => {
                let cached = *self.cached_gas_params.read();
                cached.ok_or(e)
            }
        }
    }

    /// Refresh cached gas parameters from the strategy.
    pub async fn update_gas_params(&self) -> ChainResult<GasParams> {
        let params = self
            .gas_strategy
            .fetch_params(self.rpc_url.as_str())
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))?;
        debug!(
            gas_price_gwei = params.effective_gas_price() / 1_000_000_000,
            strategy = self.gas_strategy.strategy_name(),
            "Gas params updated"
        );
        *self.cached_gas_params.write() = Some(params);
        Ok(params)
    }

    fn classify(&self, e: impl std::fmt::Display) -> ChainError {
        ChainError::classify(e.to_string(), Some(self.address))
    }

    /// Broadcast without waiting for inclusion.
    ///
    /// `nonce` replaces an earlier transaction when given; otherwise the
    /// next local nonce is taken. Returns the hash and the nonce used.
    pub async fn submit(
        &self,
        to: Address,
        calldata: Bytes,
        gas: GasParams,
        nonce: Option<u64>,
        gas_limit: Option<u64>,
    ) -> ChainResult<(B256, u64)> {
        let start = Instant::now();
        let replacing = nonce.is_some();
        let nonce = nonce.unwrap_or_else(|| self.nonce_manager.next());
        let gas_limit = gas_limit.unwrap_or(self.gas_limit);

        let mut tx = TransactionRequest::default()
            .with_from(self.address)
            .with_to(to)
            .with_input(calldata)
            .with_value(U256::ZERO)
            .with_nonce(nonce)
            .with_gas_limit(gas_limit)
            .with_chain_id(self.chain_id);
        self.gas_strategy.apply_gas(&mut tx, &gas);

        let provider = ProviderBuilder::new()
            .wallet(self.wallet.clone())
            .on_http(self.rpc_url.clone());

        match provider.send_transaction(tx).await {
            Ok(pending) => {
                let tx_hash = *pending.tx_hash();
                info!(
                    to = %to,
                    tx_hash = %tx_hash,
                    nonce,
                    replacing,
                    gas_limit,
                    gas_price_gwei = gas.effective_gas_price() / 1_000_000_000,
                    submit_ms = start.elapsed().as_millis() as u64,
                    "Transaction submitted"
                );
                Ok((tx_hash, nonce))
            }
            Err(e) => {
                let err = self.classify(&e);
                warn!(to = %to, nonce, error = %e, "Submission rejected, syncing nonce");
                if !replacing {
                    self.sync_nonce().await;
                }
                Err(err)
            }
        }
    }

    /// Receipt lookup for a submitted transaction.
    pub async fn receipt_status(&self, tx_hash: B256) -> ChainResult<TxStatus> {
        let provider = ProviderBuilder::new().on_http(self.rpc_url.clone());
        let receipt = provider
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| self.classify(e))?;

        Ok(match receipt {
            None => TxStatus::Pending,
            Some(r) => {
                let block = r.block_number.unwrap_or_default();
                if r.status() {
                    TxStatus::Confirmed {
                        block,
                        gas_used: r.gas_used,
                    }
                } else {
                    TxStatus::Reverted { block }
                }
            }
        })
    }

    /// Send a low-volume administrative transaction and wait for its receipt.
    pub async fn send_and_confirm(&self, to: Address, calldata: Bytes) -> ChainResult<B256> {
        let gas = self.gas_params().await?;
        let (tx_hash, _) = self
            .submit(to, calldata, gas, None, Some(WITHDRAW_GAS_LIMIT))
            .await?;

        let deadline = Instant::now() + CONFIRM_TIMEOUT;
        loop {
            match self.receipt_status(tx_hash).await? {
                TxStatus::Pending if Instant::now() < deadline => {
                    tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
                }
                TxStatus::Pending => {
                    return Err(ChainError::Rpc(format!(
                        "{tx_hash} not mined within {}s",
                        CONFIRM_TIMEOUT.as_secs()
                    )));
                }
                TxStatus::Confirmed { block, gas_used } => {
                    info!(tx_hash = %tx_hash, block, gas_used, "Transaction confirmed");
                    return Ok(tx_hash);
                }
                TxStatus::Reverted { block } => {
                    warn!(tx_hash = %tx_hash, block, "Transaction reverted, syncing nonce");
                    self.sync_nonce().await;
                    return Err(ChainError::TransactionReverted {
                        tx_hash: Some(tx_hash),
                        reason: format!("status 0 in block {block}"),
                    });
                }
            }
        }
    }

    /// Resync the nonce counter from chain (pending count).
    pub async fn sync_nonce(&self) {
        let provider = ProviderBuilder::new().on_http(self.rpc_url.clone());
        match provider.get_transaction_count(self.address).pending().await {
            Ok(chain_nonce) => {
                self.nonce_manager.reset(chain_nonce);
                debug!(nonce = chain_nonce, "Nonce synced from chain");
            }
            Err(e) => warn!(error = %e, "Failed to sync nonce from chain"),
        }
    }

    /// Native balance of the signer.
    pub async fn get_balance(&self) -> ChainResult<U256> {
        let provider = ProviderBuilder::new().on_http(self.rpc_url.clone());
        provider
            .get_balance(self.address)
            .await
            .map_err(|e| self.classify(e))
    }

    pub fn rpc_url(&self) -> &str {
        self.rpc_url.as_str()
    }
}

impl std::fmt::Debug for TransactionSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionSender")
            .field("address", &self.address)
            .field("chain_id", &self.chain_id)
            .field("rpc_url", &self.rpc_url.as_str())
            .field("gas_strategy", &self.gas_strategy.strategy_name())
            .finish_non_exhaustive()
    }
}
