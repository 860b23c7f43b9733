//! Error taxonomy for chain reads and transaction submission.

use alloy::primitives::{Address, B256};
use thiserror::Error;

/// Revert reason emitted by OpenZeppelin `Ownable` guards.
pub const OWNABLE_REVERT: &str = "Ownable: caller is not the owner";

/// Errors surfaced by the chain layer.
#[derive(Debug, Clone, Error)]
pub enum ChainError {
    /// RPC endpoint unreachable after exhausting retries.
    #[error("chain unavailable: {operation} failed after {attempts} attempts: {last_error}")]
    ChainUnavailable {
        operation: String,
        attempts: u32,
        last_error: String,
    },

    /// Transaction mined but reverted (or rejected at estimation with a revert).
    #[error("transaction reverted{}: {reason}", tx_hash.map(|h| format!(" ({h})")).unwrap_or_default())]
    TransactionReverted {
        tx_hash: Option<B256>,
        reason: String,
    },

    /// Caller lacks ownership of the contract. Never retried.
    #[error("ownership rejected: {reason}")]
    OwnershipRejected { reason: String },

    /// Signer cannot pay for gas. Permanent until the account is funded.
    #[error("insufficient funds for signer {signer}")]
    InsufficientFunds { signer: Address },

    /// Any other RPC / decoding failure.
    #[error("rpc error: {0}")]
    Rpc(String),
}

impl ChainError {
    /// Map a raw node / contract error message into the taxonomy.
    ///
    /// `signer` is attached to funding errors so the coordinator can halt
    /// only the affected account.
    pub fn classify(message: impl Into<String>, signer: Option<Address>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();

        if message.contains(OWNABLE_REVERT) || lower.contains("caller is not the owner") {
            return Self::OwnershipRejected { reason: message };
        }
        if lower.contains("insufficient funds") {
            return Self::InsufficientFunds {
                signer: signer.unwrap_or_default(),
            };
        }
        if lower.contains("execution reverted") || lower.contains("revert") {
            return Self::TransactionReverted {
                tx_hash: None,
                reason: message,
            };
        }
        Self::Rpc(message)
    }

    /// Whether a retry with backoff can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ChainUnavailable { .. } | Self::Rpc(_))
    }

    /// Whether the error needs operator action before anything changes.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::OwnershipRejected { .. } | Self::InsufficientFunds { .. }
        )
    }
}

pub type ChainResult<T> = std::result::Result<T, ChainError>;
