use ethers::types::{Address, I256, U256};
use rust_decimal::Decimal;
use std::str::FromStr;

// Amounts stay U256 through all route math; these helpers only exist for
// display strings and percentages.

pub fn u256_to_decimal(value: U256, decimals: u8) -> Result<Decimal, ConversionError> {
    let decimal_value =
        Decimal::from_str(&value.to_string()).map_err(|_| ConversionError::Overflow)?;
    let scale = u32::from(decimals);
    if scale > 28 {
        return Err(ConversionError::Overflow);
    }
    let divisor = Decimal::from_i128_with_scale(10i128.pow(scale), 0);
    decimal_value
        .checked_div(divisor)
        .ok_or(ConversionError::Overflow)
}

/// Divide by 10^decimals without going through u128. Values that do not fit a
/// `Decimal` fall back to string formatting.
pub fn u256_to_f64(value: U256, decimals: u8) -> f64 {
    if value.is_zero() {
        return 0.0;
    }
    let s = value.to_string();
    let len = s.len();
    let d = decimals as usize;
    let dec_str = if d == 0 {
        s
    } else if len <= d {
        format!("0.{}{}", "0".repeat(d - len), s)
    } else {
        format!("{}.{}", &s[..len - d], &s[len - d..])
    };
    dec_str.parse::<f64>().unwrap_or(0.0)
}

pub fn i256_to_f64(value: I256, decimals: u8) -> f64 {
    let magnitude = u256_to_f64(value.unsigned_abs(), decimals);
    if value.is_negative() {
        -magnitude
    } else {
        magnitude
    }
}

/// Human-readable amount with `places` fractional digits.
pub fn format_amount(value: U256, decimals: u8, places: u32) -> String {
    match u256_to_decimal(value, decimals) {
        Ok(d) => d.round_dp(places).to_string(),
        Err(_) => format!("{:.*}", places as usize, u256_to_f64(value, decimals)),
    }
}

pub fn address_to_string(addr: Address) -> String {
    format!("{:?}", addr).to_lowercase()
}

pub fn string_to_address(s: &str) -> Result<Address, ConversionError> {
    Address::from_str(s.trim()).map_err(|e| ConversionError::InvalidAddress(e.to_string()))
}

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("Overflow in conversion")]
    Overflow,
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}
