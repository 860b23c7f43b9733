//! Engine error taxonomy.

use alloy::primitives::Address;
use blueberry_chain::{ChainError, PositionId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Chain(#[from] ChainError),

    /// The plan's quote expired before submission; replan next cycle.
    #[error("stale quote for position {position_id}: expired at block {expires_at_block}, head is {current_block}")]
    StaleQuote {
        position_id: PositionId,
        expires_at_block: u64,
        current_block: u64,
    },

    /// Aggregator could not quote a seized asset. Transient.
    #[error("quote unavailable for position {position_id}: {reason}")]
    QuoteUnavailable {
        position_id: PositionId,
        reason: String,
    },

    /// The snapshot has no oracle price for a token the plan needs.
    #[error("no oracle price for {token}")]
    MissingPrice { token: Address },

    #[error("position {0} already has a liquidation in flight")]
    PositionLocked(PositionId),

    /// Submission is stopped for this signer until an operator resumes it.
    #[error("submission halted for signer {signer}: {reason}")]
    SignerHalted { signer: Address, reason: String },

    #[error("journal error: {0}")]
    Journal(String),
}

impl EngineError {
    /// Errors that clear up on their own by the next cycle.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Chain(e) => e.is_transient(),
            Self::StaleQuote { .. } | Self::QuoteUnavailable { .. } | Self::PositionLocked(_) => {
                true
            }
            Self::MissingPrice { .. } | Self::SignerHalted { .. } | Self::Journal(_) => false,
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        Self::Journal(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        Self::Journal(e.to_string())
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
