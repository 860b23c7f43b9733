//! Risk Evaluator.
//!
//! Pure functions over a [`ChainSnapshot`]. The arithmetic mirrors the
//! bank's `getPositionRisk` / `isLiquidatable` in integer math, so a
//! position is flagged here exactly when the bank would accept its
//! liquidation at the snapshot block.

use crate::config::RiskConfig;
use crate::u256_math::{mul_bps, usd_value, BPS_DENOMINATOR, WAD};
use alloy::primitives::U256;
use blueberry_chain::{ChainSnapshot, PositionId, PositionSnapshot};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::{debug, warn};

/// Risk of one position at one snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskSnapshot {
    pub position_id: PositionId,
    pub block_number: u64,
    pub collateral_value_usd: U256,
    pub position_value_usd: U256,
    pub debt_value_usd: U256,
    pub liquidation_threshold_bps: u32,
    pub risk_bps: U256,
    /// `LT / risk` in WAD; below `WAD` means liquidatable.
    pub health_ratio: U256,
    pub liquidatable: bool,
    pub estimated_profit_usd: U256,
}

/// Bank risk in basis points.
///
/// `pv` position value, `ov` debt value, `cv` isolated collateral value.
pub fn risk_bps(pv: U256, ov: U256, cv: U256) -> U256 {
    if (cv.is_zero() && pv.is_zero() && ov.is_zero()) || pv >= ov {
        U256::ZERO
    } else if cv.is_zero() {
        BPS_DENOMINATOR
    } else {
        (ov - pv).saturating_mul(BPS_DENOMINATOR) / cv
    }
}

#[inline]
pub fn is_liquidatable(risk: U256, liq_threshold_bps: u32) -> bool {
    risk >= U256::from(liq_threshold_bps)
}

/// `LT · WAD / risk`; `U256::MAX` for a riskless position.
pub fn health_ratio(risk: U256, liq_threshold_bps: u32) -> U256 {
    if risk.is_zero() {
        return U256::MAX;
    }
    U256::from(liq_threshold_bps).saturating_mul(WAD) / risk
}

/// Within `safety_margin_bps` of the threshold, or past it.
fn on_watchlist(risk: U256, liq_threshold_bps: u32, safety_margin_bps: u32) -> bool {
    risk.saturating_mul(U256::from(10_000u64 + safety_margin_bps as u64))
        >= U256::from(liq_threshold_bps).saturating_mul(BPS_DENOMINATOR)
}

/// Evaluate one position. `None` when the snapshot lacks the debt price or
/// the collateral threshold.
pub fn assess(
    snapshot: &ChainSnapshot,
    position: &PositionSnapshot,
    config: &RiskConfig,
) -> Option<RiskSnapshot> {
    let Some(debt_price) = snapshot.price(&position.debt_token) else {
        warn!(position_id = position.id, token = %position.debt_token, "No debt token price");
        return None;
    };
    let Some(lt) = snapshot.liq_threshold(&position.underlying_token) else {
        warn!(position_id = position.id, token = %position.underlying_token, "No liquidation threshold");
        return None;
    };

    let ov = usd_value(
        position.debt_amount,
        debt_price,
        snapshot.decimals_of(&position.debt_token),
    );
    let pv = position.position_value_usd;
    let cv = position.collateral_value_usd;

    let risk = risk_bps(pv, ov, cv);
    let seized = cv.saturating_add(pv);
    let fee = mul_bps(seized, config.liquidation_fee_bps);

    Some(RiskSnapshot {
        position_id: position.id,
        block_number: snapshot.block_number,
        collateral_value_usd: cv,
        position_value_usd: pv,
        debt_value_usd: ov,
        liquidation_threshold_bps: lt,
        risk_bps: risk,
        health_ratio: health_ratio(risk, lt),
        liquidatable: is_liquidatable(risk, lt),
        estimated_profit_usd: seized.saturating_sub(ov).saturating_sub(fee),
    })
}

/// Watchlist for a snapshot, most profitable first.
///
/// Each entry carries the exact `liquidatable` flag; entries that are only
/// near the threshold are included so they can be planned early.
pub fn evaluate(snapshot: &ChainSnapshot, config: &RiskConfig) -> Vec<RiskSnapshot> {
    let mut watchlist: Vec<RiskSnapshot> = snapshot
        .positions
        .values()
        .filter_map(|p| assess(snapshot, p, config))
        .filter(|r| on_watchlist(r.risk_bps, r.liquidation_threshold_bps, config.safety_margin_bps))
        .collect();

    watchlist.sort_by(|a, b| match b.estimated_profit_usd.cmp(&a.estimated_profit_usd) {
        Ordering::Equal => a.position_id.cmp(&b.position_id),
        other => other,
    });

    debug!(
        block = snapshot.block_number,
        positions = snapshot.positions.len(),
        watchlist = watchlist.len(),
        liquidatable = watchlist.iter().filter(|r| r.liquidatable).count(),
        "Risk evaluated"
    );
    watchlist
}
