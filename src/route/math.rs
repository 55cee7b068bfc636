//! Fixed-point mint/redeem math.
//!
//! Amounts stay in token units (collateral decimals on one side, 18 on the
//! dollar side). Prices, ratio and fees use `PRICE_PRECISION` (1e6 == 1.0).

use crate::error::{Result, SdkError};
use crate::types::conversions::i256_to_f64;
use crate::types::{OraclePrices, ProtocolState, PRICE_PRECISION};
use ethers::types::{I256, U256};

/// Dollar token decimals.
pub const DOLLAR_DECIMALS: u8 = 18;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MintQuote {
    pub dollar_out: U256,
    /// Governance tokens the caller must supply alongside the collateral.
    pub governance_in: U256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedeemQuote {
    pub collateral_out: U256,
    /// Governance tokens paid out for the uncollateralized share.
    pub governance_out: U256,
}

/// Signed difference between the selected route and the alternative.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Savings {
    pub amount: I256,
    /// `(selected - other) / other * 100`.
    pub percentage: f64,
}

impl Savings {
    pub fn none() -> Self {
        Self {
            amount: I256::zero(),
            percentage: 0.0,
        }
    }
}

fn precision() -> U256 {
    U256::from(PRICE_PRECISION)
}

pub fn is_fully_collateralized(state: &ProtocolState) -> bool {
    state.collateral_ratio >= precision()
}

fn too_large() -> SdkError {
    SdkError::PolicyViolation("amount too large".to_string())
}

/// `a * b / d`, failing instead of overflowing.
fn mul_div(a: U256, b: U256, d: U256) -> Result<U256> {
    a.checked_mul(b)
        .and_then(|v| v.checked_div(d))
        .ok_or_else(too_large)
}

/// `amount` net of a fee expressed in `PRICE_PRECISION`.
pub fn apply_fee(amount: U256, fee: U256) -> Result<U256> {
    mul_div(amount, precision().saturating_sub(fee), precision())
}

fn missing_decimals_factor(collateral_decimals: u8) -> U256 {
    U256::exp10(usize::from(DOLLAR_DECIMALS.saturating_sub(collateral_decimals)))
}

fn nonzero(value: U256, what: &str) -> Result<U256> {
    if value.is_zero() {
        return Err(SdkError::UpstreamStaleness(format!(
            "{} price feed returned zero",
            what
        )));
    }
    Ok(value)
}

/// Dollar tokens minted for `collateral_in`.
///
/// With `use_governance` and a ratio below 100%, the collateral only covers
/// `ratio` of the minted value and the rest is paid in governance tokens.
/// Otherwise the mint is one-to-one against the collateral's USD value.
pub fn mint_output(
    collateral_in: U256,
    state: &ProtocolState,
    prices: &OraclePrices,
    use_governance: bool,
) -> Result<MintQuote> {
    let collateral_price = nonzero(prices.collateral_price, "collateral")?;
    let scaled = collateral_in
        .checked_mul(missing_decimals_factor(state.collateral_decimals))
        .ok_or_else(too_large)?;
    let collateral_value = mul_div(scaled, collateral_price, precision())?;

    if !use_governance || is_fully_collateralized(state) || state.collateral_ratio.is_zero() {
        return Ok(MintQuote {
            dollar_out: apply_fee(collateral_value, state.minting_fee)?,
            governance_in: U256::zero(),
        });
    }

    let governance_price = nonzero(prices.governance_price, "governance")?;
    let gross = mul_div(collateral_value, precision(), state.collateral_ratio)?;
    let governance_value = gross.saturating_sub(collateral_value);
    Ok(MintQuote {
        dollar_out: apply_fee(gross, state.minting_fee)?,
        governance_in: mul_div(governance_value, precision(), governance_price)?,
    })
}

/// Collateral and governance tokens returned for redeeming `dollar_in`.
pub fn redeem_output(
    dollar_in: U256,
    state: &ProtocolState,
    prices: &OraclePrices,
) -> Result<RedeemQuote> {
    let collateral_price = nonzero(prices.collateral_price, "collateral")?;
    let after_fee = apply_fee(dollar_in, state.redemption_fee)?;
    let collateral_divisor = missing_decimals_factor(state.collateral_decimals)
        .checked_mul(collateral_price)
        .ok_or_else(too_large)?;

    if is_fully_collateralized(state) {
        return Ok(RedeemQuote {
            collateral_out: mul_div(after_fee, precision(), collateral_divisor)?,
            governance_out: U256::zero(),
        });
    }

    let governance_price = nonzero(prices.governance_price, "governance")?;
    let collateral_share = mul_div(after_fee, state.collateral_ratio, precision())?;
    let governance_share = after_fee.saturating_sub(collateral_share);
    Ok(RedeemQuote {
        collateral_out: mul_div(collateral_share, precision(), collateral_divisor)?,
        governance_out: mul_div(governance_share, precision(), governance_price)?,
    })
}

/// Savings of `selected` relative to `other`. Zero when there is no alternative.
pub fn savings(selected: U256, other: U256) -> Savings {
    if other.is_zero() {
        return Savings::none();
    }
    let (diff, negative) = if selected >= other {
        (selected - other, false)
    } else {
        (other - selected, true)
    };
    // ratio scaled by 1e18, so percent == ratio / 1e16
    let ratio = match diff.checked_mul(U256::exp10(18)) {
        Some(scaled) => scaled / other,
        None => diff / (other / U256::exp10(18)).max(U256::one()),
    };
    let to_signed = |v: U256| {
        let v = I256::from_raw(v);
        if negative {
            -v
        } else {
            v
        }
    };
    Savings {
        amount: to_signed(diff),
        percentage: i256_to_f64(to_signed(ratio), 16),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(ratio: u64, decimals: u8) -> ProtocolState {
        ProtocolState {
            collateral_ratio: U256::from(ratio),
            minting_fee: U256::from(2_000u64),
            redemption_fee: U256::from(2_000u64),
            mint_paused: false,
            redeem_paused: false,
            mint_price_threshold: U256::zero(),
            redeem_price_threshold: U256::zero(),
            collateral_decimals: decimals,
        }
    }

    fn prices() -> OraclePrices {
        OraclePrices {
            collateral_price: U256::from(1_000_000u64),
            dollar_price: U256::from(1_000_000u64),
            governance_price: U256::from(500_000u64),
        }
    }

    fn tokens(n: u64, decimals: usize) -> U256 {
        U256::from(n) * U256::exp10(decimals)
    }

    #[test]
    fn full_backing_mint_charges_fee() {
        let q = mint_output(tokens(1000, 18), &state(1_000_000, 18), &prices(), true).unwrap();
        assert_eq!(q.dollar_out, tokens(998, 18));
        assert!(q.governance_in.is_zero());
    }

    #[test]
    fn mint_scales_low_decimal_collateral() {
        let q = mint_output(tokens(1000, 6), &state(1_000_000, 6), &prices(), false).unwrap();
        assert_eq!(q.dollar_out, tokens(998, 18));
    }

    #[test]
    fn fractional_mint_uses_governance() {
        // 95% ratio: 1000 collateral backs 1052.63 dollars, the rest comes from governance at $0.50
        let q = mint_output(tokens(950, 18), &state(950_000, 18), &prices(), true).unwrap();
        assert_eq!(q.dollar_out, apply_fee(tokens(1000, 18), U256::from(2_000u64)).unwrap());
        assert_eq!(q.governance_in, tokens(100, 18));

        let one_to_one =
            mint_output(tokens(950, 18), &state(950_000, 18), &prices(), false).unwrap();
        assert_eq!(one_to_one.dollar_out, apply_fee(tokens(950, 18), U256::from(2_000u64)).unwrap());
        assert!(one_to_one.governance_in.is_zero());
    }

    #[test]
    fn redeem_full_and_fractional() {
        let full = redeem_output(tokens(1000, 18), &state(1_000_000, 6), &prices()).unwrap();
        assert_eq!(full.collateral_out, tokens(998, 6));
        assert!(full.governance_out.is_zero());

        let frac = redeem_output(tokens(1000, 18), &state(900_000, 18), &prices()).unwrap();
        assert_eq!(frac.collateral_out, U256::from(8982u64) * U256::exp10(17));
        // 10% of 998 dollars at $0.50
        assert_eq!(frac.governance_out, U256::from(1996u64) * U256::exp10(17));
    }

    #[test]
    fn zero_price_is_an_upstream_failure() {
        let mut p = prices();
        p.collateral_price = U256::zero();
        let err = mint_output(tokens(1, 18), &state(1_000_000, 18), &p, false).unwrap_err();
        assert!(err.is_upstream_staleness());
    }

    #[test]
    fn oversized_amounts_fail_instead_of_overflowing() {
        let huge = U256::exp10(60);
        let err = mint_output(huge, &state(1_000_000, 6), &prices(), false).unwrap_err();
        assert_eq!(err, SdkError::PolicyViolation("amount too large".to_string()));

        let err = mint_output(huge, &state(950_000, 6), &prices(), true).unwrap_err();
        assert!(matches!(err, SdkError::PolicyViolation(_)));

        let err = redeem_output(U256::MAX, &state(900_000, 18), &prices()).unwrap_err();
        assert!(matches!(err, SdkError::PolicyViolation(_)));
        assert!(apply_fee(U256::MAX, U256::from(2_000u64)).is_err());
    }

    #[test]
    fn savings_are_signed() {
        let up = savings(tokens(1005, 18), tokens(998, 18));
        assert_eq!(up.amount, I256::from_raw(tokens(7, 18)));
        assert!((up.percentage - 7.0 / 998.0 * 100.0).abs() < 1e-9);

        let down = savings(tokens(998, 18), tokens(1005, 18));
        assert!(down.amount.is_negative());
        assert!((down.percentage + 7.0 / 1005.0 * 100.0).abs() < 1e-9);

        assert_eq!(savings(tokens(1, 18), U256::zero()), Savings::none());
    }
}
