//! Engine configuration with profile support.
//!
//! Provides centralized configuration for all engine parameters with
//! support for different profiles (testing, production, aggressive).

use crate::u256_math::f64_to_wad;
use alloy::primitives::U256;
use blueberry_chain::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure containing all engine parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Profile name (for logging/identification)
    #[serde(default = "default_profile_name")]
    pub profile: String,

    #[serde(default)]
    pub reader: ReaderConfig,

    #[serde(default)]
    pub risk: RiskConfig,

    #[serde(default)]
    pub planner: PlannerConfig,

    #[serde(default)]
    pub execution: ExecutionConfig,

    #[serde(default)]
    pub settlement: SettlementConfig,

    #[serde(default)]
    pub journal: JournalConfig,
}

fn default_profile_name() -> String {
    "default".to_string()
}

/// Chain Reader polling and retry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReaderConfig {
    /// Block height poll interval (milliseconds)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Snapshots older than this many blocks are not acted on
    #[serde(default = "default_max_snapshot_lag")]
    pub max_snapshot_lag_blocks: u64,

    /// Positions fetched in parallel
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,

    #[serde(default = "default_retry_attempts")]
    pub retry_max_attempts: u32,

    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_ms: u64,
}

fn default_poll_interval() -> u64 {
    2_000
}
fn default_max_snapshot_lag() -> u64 {
    2
}
fn default_fetch_concurrency() -> usize {
    16
}
fn default_retry_attempts() -> u32 {
    4
}
fn default_retry_base_delay() -> u64 {
    250
}
fn default_retry_max_delay() -> u64 {
    4_000
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            max_snapshot_lag_blocks: default_max_snapshot_lag(),
            fetch_concurrency: default_fetch_concurrency(),
            retry_max_attempts: default_retry_attempts(),
            retry_base_delay_ms: default_retry_base_delay(),
            retry_max_delay_ms: default_retry_max_delay(),
        }
    }
}

impl ReaderConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            base_delay_ms: self.retry_base_delay_ms,
            max_delay_ms: self.retry_max_delay_ms,
        }
    }
}

/// Risk Evaluator thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Watch positions whose risk is within this margin of the threshold
    #[serde(default = "default_safety_margin")]
    pub safety_margin_bps: u32,

    /// Protocol liquidation fee taken from seized value
    #[serde(default = "default_liquidation_fee")]
    pub liquidation_fee_bps: u32,
}

fn default_safety_margin() -> u32 {
    200
}
fn default_liquidation_fee() -> u32 {
    100
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            safety_margin_bps: default_safety_margin(),
            liquidation_fee_bps: default_liquidation_fee(),
        }
    }
}

/// Liquidation Planner parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// Minimum expected net USD to execute a liquidation
    #[serde(default = "default_min_profit")]
    pub min_profit_usd: f64,

    /// Slippage tolerance passed to the aggregator
    #[serde(default = "default_slippage")]
    pub slippage_bps: u16,

    /// Blocks a quote stays valid after the snapshot it was planned on
    #[serde(default = "default_quote_validity")]
    pub quote_validity_blocks: u64,

    /// Plans computed concurrently
    #[serde(default = "default_planner_workers")]
    pub planner_workers: usize,
}

fn default_min_profit() -> f64 {
    0.0
}
fn default_slippage() -> u16 {
    100
}
fn default_quote_validity() -> u64 {
    3
}
fn default_planner_workers() -> usize {
    4
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            min_profit_usd: default_min_profit(),
            slippage_bps: default_slippage(),
            quote_validity_blocks: default_quote_validity(),
            planner_workers: default_planner_workers(),
        }
    }
}

impl PlannerConfig {
    pub fn min_profit_wad(&self) -> U256 {
        f64_to_wad(self.min_profit_usd)
    }
}

/// Execution Coordinator parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Gas price multiplier for priority
    #[serde(default = "default_gas_multiplier")]
    pub gas_price_multiplier: f64,

    /// Hard ceiling on any bid (gwei)
    #[serde(default = "default_max_gas_price")]
    pub max_gas_price_gwei: f64,

    /// Gas may cost at most this share of expected proceeds
    #[serde(default = "default_max_gas_share")]
    pub max_gas_share_bps: u32,

    /// Blocks a position is left alone after a revert
    #[serde(default = "default_cooldown")]
    pub cooldown_blocks: u64,

    /// Pending this many blocks counts as stuck
    #[serde(default = "default_stuck_after")]
    pub stuck_after_blocks: u64,

    /// Replacement bump; nodes need at least 1000 (10%)
    #[serde(default = "default_gas_bump")]
    pub gas_bump_bps: u32,

    #[serde(default = "default_max_gas_bumps")]
    pub max_gas_bumps: u32,

    /// Ask `bank.isLiquidatable` right before submitting
    #[serde(default = "default_confirm_on_chain")]
    pub confirm_on_chain: bool,
}

fn default_gas_multiplier() -> f64 {
    1.0
}
fn default_max_gas_price() -> f64 {
    200.0
}
fn default_max_gas_share() -> u32 {
    5_000
}
fn default_cooldown() -> u64 {
    10
}
fn default_stuck_after() -> u64 {
    3
}
fn default_gas_bump() -> u32 {
    1_250
}
fn default_max_gas_bumps() -> u32 {
    3
}
fn default_confirm_on_chain() -> bool {
    true
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            gas_price_multiplier: default_gas_multiplier(),
            max_gas_price_gwei: default_max_gas_price(),
            max_gas_share_bps: default_max_gas_share(),
            cooldown_blocks: default_cooldown(),
            stuck_after_blocks: default_stuck_after(),
            gas_bump_bps: default_gas_bump(),
            max_gas_bumps: default_max_gas_bumps(),
            confirm_on_chain: default_confirm_on_chain(),
        }
    }
}

impl ExecutionConfig {
    /// `gas_price_multiplier` in basis points.
    pub fn multiplier_bps(&self) -> u32 {
        (self.gas_price_multiplier.max(0.0) * 10_000.0).round() as u32
    }

    pub fn max_gas_price_wei(&self) -> u128 {
        (self.max_gas_price_gwei.max(0.0) * 1e9) as u128
    }
}

/// Settlement Reporter parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementConfig {
    /// Sweep once unswept proceeds reach this value
    #[serde(default = "default_sweep_threshold")]
    pub sweep_threshold_usd: f64,

    /// Sweep any non-zero balance after this long
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// How often the settlement loop checks
    #[serde(default = "default_settlement_interval")]
    pub settlement_interval_secs: u64,

    #[serde(default = "default_sweep_enabled")]
    pub sweep_enabled: bool,
}

fn default_sweep_threshold() -> f64 {
    1_000.0
}
fn default_sweep_interval() -> u64 {
    86_400
}
fn default_settlement_interval() -> u64 {
    60
}
fn default_sweep_enabled() -> bool {
    true
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            sweep_threshold_usd: default_sweep_threshold(),
            sweep_interval_secs: default_sweep_interval(),
            settlement_interval_secs: default_settlement_interval(),
            sweep_enabled: default_sweep_enabled(),
        }
    }
}

impl SettlementConfig {
    pub fn sweep_threshold_wad(&self) -> U256 {
        f64_to_wad(self.sweep_threshold_usd)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn settlement_interval(&self) -> Duration {
        Duration::from_secs(self.settlement_interval_secs)
    }
}

/// Attempt / settlement journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalConfig {
    #[serde(default = "default_journal_path")]
    pub path: String,

    #[serde(default = "default_journal_enabled")]
    pub enabled: bool,
}

fn default_journal_path() -> String {
    "data/journal.jsonl".to_string()
}
fn default_journal_enabled() -> bool {
    true
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            path: default_journal_path(),
            enabled: default_journal_enabled(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            profile: default_profile_name(),
            reader: ReaderConfig::default(),
            risk: RiskConfig::default(),
            planner: PlannerConfig::default(),
            execution: ExecutionConfig::default(),
            settlement: SettlementConfig::default(),
            journal: JournalConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Local fork profile: fast polling, no profit floor, tiny sweeps.
    pub fn testing() -> Self {
        Self {
            profile: "testing".to_string(),
            reader: ReaderConfig {
                poll_interval_ms: 500,
                max_snapshot_lag_blocks: 5,
                fetch_concurrency: 4,
                retry_max_attempts: 3,
                retry_base_delay_ms: 50,
                retry_max_delay_ms: 500,
            },
            risk: RiskConfig {
                safety_margin_bps: 500,
                liquidation_fee_bps: 100,
            },
            planner: PlannerConfig {
                min_profit_usd: 0.0, // No minimum profit for testing
                slippage_bps: 300,
                quote_validity_blocks: 10,
                planner_workers: 2,
            },
            execution: ExecutionConfig {
                gas_price_multiplier: 1.0,
                max_gas_price_gwei: 1_000.0,
                max_gas_share_bps: 10_000,
                cooldown_blocks: 2,
                stuck_after_blocks: 2,
                gas_bump_bps: 1_250,
                max_gas_bumps: 2,
                confirm_on_chain: true,
            },
            settlement: SettlementConfig {
                sweep_threshold_usd: 1.0,
                sweep_interval_secs: 300,
                settlement_interval_secs: 10,
                sweep_enabled: true,
            },
            journal: JournalConfig {
                path: "data/journal-testing.jsonl".to_string(),
                enabled: true,
            },
        }
    }

    /// Create a production profile with conservative settings.
    pub fn production() -> Self {
        Self {
            profile: "production".to_string(),
            reader: ReaderConfig::default(),
            risk: RiskConfig {
                safety_margin_bps: 150,
                liquidation_fee_bps: 100,
            },
            planner: PlannerConfig {
                min_profit_usd: 25.0,
                slippage_bps: 50,
                quote_validity_blocks: 2,
                planner_workers: 4,
            },
            execution: ExecutionConfig {
                gas_price_multiplier: 1.1,
                max_gas_price_gwei: 150.0,
                max_gas_share_bps: 3_000,
                cooldown_blocks: 20,
                ..Default::default()
            },
            settlement: SettlementConfig {
                sweep_threshold_usd: 5_000.0,
                ..Default::default()
            },
            journal: JournalConfig::default(),
        }
    }

    /// Create an aggressive profile for maximum speed.
    pub fn aggressive() -> Self {
        Self {
            profile: "aggressive".to_string(),
            reader: ReaderConfig {
                poll_interval_ms: 1_000,
                fetch_concurrency: 32,
                ..Default::default()
            },
            risk: RiskConfig {
                safety_margin_bps: 300,
                liquidation_fee_bps: 100,
            },
            planner: PlannerConfig {
                min_profit_usd: 5.0,
                slippage_bps: 100,
                quote_validity_blocks: 2,
                planner_workers: 8,
            },
            execution: ExecutionConfig {
                gas_price_multiplier: 1.3, // Higher gas for priority
                max_gas_price_gwei: 300.0,
                max_gas_share_bps: 6_000,
                cooldown_blocks: 5,
                stuck_after_blocks: 2,
                gas_bump_bps: 2_000,
                max_gas_bumps: 4,
                confirm_on_chain: false,
            },
            settlement: SettlementConfig::default(),
            journal: JournalConfig::default(),
        }
    }

    /// Profile from ENGINE_PROFILE, or default.
    /// Supported values: testing, production, aggressive
    pub fn from_env() -> Self {
        let profile = std::env::var("ENGINE_PROFILE").unwrap_or_else(|_| "default".to_string());
        Self::from_profile(&profile)
    }

    pub fn from_profile(profile: &str) -> Self {
        match profile.to_lowercase().as_str() {
            "testing" | "test" => Self::testing(),
            "production" | "prod" => Self::production(),
            "aggressive" | "aggro" => Self::aggressive(),
            _ => Self::default(),
        }
    }

    /// Log the current configuration.
    pub fn log_config(&self) {
        tracing::info!(profile = %self.profile, "Engine configuration loaded");
        tracing::info!(
            poll_ms = self.reader.poll_interval_ms,
            max_lag_blocks = self.reader.max_snapshot_lag_blocks,
            concurrency = self.reader.fetch_concurrency,
            "Reader settings"
        );
        tracing::info!(
            safety_margin_bps = self.risk.safety_margin_bps,
            liquidation_fee_bps = self.risk.liquidation_fee_bps,
            min_profit_usd = self.planner.min_profit_usd,
            quote_validity_blocks = self.planner.quote_validity_blocks,
            "Risk and planning thresholds"
        );
        tracing::info!(
            gas_multiplier = self.execution.gas_price_multiplier,
            max_gas_gwei = self.execution.max_gas_price_gwei,
            cooldown_blocks = self.execution.cooldown_blocks,
            stuck_after_blocks = self.execution.stuck_after_blocks,
            "Execution parameters"
        );
        tracing::info!(
            sweep_threshold_usd = self.settlement.sweep_threshold_usd,
            sweep_interval_secs = self.settlement.sweep_interval_secs,
            journal = %self.journal.path,
            "Settlement parameters"
        );
    }
}

/// Global configuration holder using lazy initialization.
use std::sync::OnceLock;

static GLOBAL_CONFIG: OnceLock<EngineConfig> = OnceLock::new();

/// Initialize global configuration. Later calls are ignored.
pub fn init_config(config: EngineConfig) {
    let _ = GLOBAL_CONFIG.set(config);
}

/// Get the global configuration, initializing from environment if needed.
pub fn config() -> &'static EngineConfig {
    GLOBAL_CONFIG.get_or_init(EngineConfig::from_env)
}
