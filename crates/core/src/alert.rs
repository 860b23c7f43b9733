//! Operator-facing alerts for conditions the engine cannot fix itself.

use alloy::primitives::Address;
use blueberry_chain::PositionId;
use serde::Serialize;
use std::fmt;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum OperatorAlert {
    /// Signer ran out of gas money; submission stopped until resumed.
    InsufficientFunds { signer: Address },
    /// A call was rejected by an `Ownable` guard. Never retried.
    OwnershipRejected { operation: String, reason: String },
    /// A liquidation reverted on-chain.
    LiquidationReverted { position_id: PositionId, tx_hash: String },
    /// Chain reads keep failing.
    ChainUnavailable { reason: String },
    /// Oracle data for a token cannot be read; positions using it are not
    /// evaluated until it recovers.
    PriceUnavailable { token: Address, reason: String },
}

impl fmt::Display for OperatorAlert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientFunds { signer } => {
                write!(f, "signer {signer} has insufficient funds; submission halted")
            }
            Self::OwnershipRejected { operation, reason } => {
                write!(f, "{operation} rejected by ownership check: {reason}")
            }
            Self::LiquidationReverted {
                position_id,
                tx_hash,
            } => write!(f, "liquidation of position {position_id} reverted ({tx_hash})"),
            Self::ChainUnavailable { reason } => write!(f, "chain unavailable: {reason}"),
            Self::PriceUnavailable { token, reason } => {
                write!(f, "price of {token} unavailable: {reason}")
            }
        }
    }
}

pub type AlertSender = mpsc::UnboundedSender<OperatorAlert>;
pub type AlertReceiver = mpsc::UnboundedReceiver<OperatorAlert>;

/// Channel for operator alerts.
pub fn alert_channel() -> (AlertSender, AlertReceiver) {
    mpsc::unbounded_channel()
}

/// Send without caring whether anyone still listens.
pub(crate) fn raise(alerts: &AlertSender, alert: OperatorAlert) {
    if alerts.send(alert).is_err() {
        tracing::debug!("Alert receiver dropped");
    }
}
