//! Configuration for the liquidation engine.
//!
//! - Engine runtime configuration (profiles, thresholds, timing)
//! - TOML loading with `${ENV_VAR}` expansion
//! - Deployment settings (RPC, contract addresses, signer) from the environment

mod deployment;
mod engine;
mod loader;

pub use deployment::DeploymentEnv;
pub use engine::{
    config, init_config, EngineConfig, ExecutionConfig, JournalConfig, PlannerConfig, ReaderConfig,
    RiskConfig, SettlementConfig,
};
pub use loader::load_engine_config;
