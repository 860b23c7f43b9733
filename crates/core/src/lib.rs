//! Liquidation engine core.
//!
//! - Risk evaluation against the bank's liquidation thresholds
//! - Quote-backed liquidation planning with gas and fee costing
//! - Single-writer execution coordinator with stuck-transaction bumping
//! - Settlement accounting and periodic proceeds sweeps
//! - Append-only journal for restart recovery

pub mod alert;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod journal;
pub mod planner;
pub mod risk;
pub mod settlement;
pub mod u256_math;

#[cfg(test)]
mod test_support;

pub use alert::{alert_channel, AlertReceiver, AlertSender, OperatorAlert};
pub use config::{
    config, init_config, load_engine_config, DeploymentEnv, EngineConfig, ExecutionConfig,
    JournalConfig, PlannerConfig, ReaderConfig, RiskConfig, SettlementConfig,
};
pub use coordinator::{
    AttemptStatus, Coordinator, CoordinatorCommand, ExecutionAttempt, InFlightSet, Phase,
};
pub use engine::{Engine, EngineHandle};
pub use error::{EngineError, EngineResult};
pub use journal::{Journal, JournalEntry, JournalState};
pub use planner::{LiquidationPlan, PlanOutcome, Planner, QuoteLeg};
pub use risk::RiskSnapshot;
pub use settlement::{SettlementRecord, SettlementReporter, SettlementTotals, SweepRecord};
