//! Blueberry chain interaction layer.
//!
//! This crate provides:
//! - Contract bindings for the bank, core oracle, liquidator and ERC20
//! - `BankReader`, the read ABI, implemented over HTTP by `ProviderManager`
//! - `ChainReader`, which builds block-pinned position snapshots with retries
//! - Transaction signing and sending with a local nonce counter
//! - Gas strategy abstraction (Legacy + EIP-1559)
//! - The chain error taxonomy

mod bank;
pub mod contracts;
mod error;
pub mod gas;
mod provider;
mod reader;
mod retry;
mod signer;

pub use bank::{BankReader, PositionId, PositionInfo};
pub use contracts::{
    encode_liquidate, encode_withdraw, LiquidationSubmitter, LiquidatorContract, SubmittedTx,
};
pub use error::{ChainError, ChainResult, OWNABLE_REVERT};
pub use gas::{GasParams, GasStrategy, GWEI};
pub use provider::ProviderManager;
pub use reader::{pow10, ChainReader, ChainSnapshot, PositionSnapshot, PriceQuote, PriceSource};
pub use retry::{with_retry, RetryPolicy};
pub use signer::{
    NonceManager, TransactionSender, TransactionSenderBuilder, TxStatus,
    DEFAULT_LIQUIDATION_GAS_LIMIT,
};
