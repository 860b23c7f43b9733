//! U256 fixed-point helpers for risk and profit calculations.
//!
//! All USD values are WAD (18 decimals), matching the core oracle's price
//! format, so valuations here agree bit-for-bit with the bank's own.

use alloy::primitives::U256;

/// WAD constant: 1e18 for 18-decimal fixed-point arithmetic
pub const WAD: U256 = U256::from_limbs([1_000_000_000_000_000_000u64, 0, 0, 0]);

/// Basis points denominator (10000 = 100%)
pub const BPS_DENOMINATOR: U256 = U256::from_limbs([10_000u64, 0, 0, 0]);

/// Oracle price decimals (18)
pub const PRICE_DECIMALS: u8 = 18;

/// Pre-computed powers of 10 for fast decimal conversion
const POW10: [u128; 39] = {
    let mut table = [1u128; 39];
    let mut i = 1;
    while i < 39 {
        table[i] = table[i - 1] * 10;
        i += 1;
    }
    table
};

/// Power of 10 lookup (table up to 10^38)
#[inline(always)]
pub fn pow10(exp: u8) -> U256 {
    if exp < 39 {
        U256::from(POW10[exp as usize])
    } else {
        U256::from(10u64).pow(U256::from(exp))
    }
}

/// `value * bps / 10000`, rounded down.
#[inline(always)]
pub fn mul_bps(value: U256, bps: u32) -> U256 {
    value.saturating_mul(U256::from(bps)) / BPS_DENOMINATOR
}

/// USD value (WAD) of `amount` raw units at an 18-decimal oracle price.
///
/// `amount * price / 10^decimals`, the bank's own valuation.
#[inline(always)]
pub fn usd_value(amount: U256, price: U256, decimals: u8) -> U256 {
    if amount.is_zero() || price.is_zero() {
        return U256::ZERO;
    }
    amount.saturating_mul(price) / pow10(decimals)
}

/// Raw token amount worth `usd` (WAD) at `price`. Zero when unpriced.
#[inline(always)]
pub fn amount_for_usd(usd: U256, price: U256, decimals: u8) -> U256 {
    if price.is_zero() {
        return U256::ZERO;
    }
    usd.saturating_mul(pow10(decimals)) / price
}

/// Convert WAD (18 decimals) to f64.
/// Use only for display/logging, not for computation.
#[inline(always)]
pub fn wad_to_f64(wad: U256) -> f64 {
    if wad <= U256::from(u128::MAX) {
        let value: u128 = wad.to();
        value as f64 / 1e18
    } else {
        let limbs = wad.as_limbs();
        let high = limbs[1] as f64 * (u64::MAX as f64 + 1.0);
        let low = limbs[0] as f64;
        (high + low) / 1e18
    }
}

/// Convert f64 to WAD (18 decimals). Used for config thresholds.
#[inline(always)]
pub fn f64_to_wad(value: f64) -> U256 {
    if value <= 0.0 || !value.is_finite() {
        return U256::ZERO;
    }
    // Split to keep 9 decimals of precision without overflowing u128.
    let whole = value.trunc();
    let frac = ((value - whole) * 1e9).round() as u128;
    U256::from(whole as u128) * WAD + U256::from(frac) * U256::from(1_000_000_000u64)
}

/// `a - b` as a signed f64 WAD for logging.
pub fn signed_diff_f64(a: U256, b: U256) -> f64 {
    if a >= b {
        wad_to_f64(a - b)
    } else {
        -wad_to_f64(b - a)
    }
}
