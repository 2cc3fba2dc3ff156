use anchor_lang::prelude::{borsh, AnchorDeserialize, AnchorSerialize};
use serde::{Deserialize, Serialize};

use crate::constants::{MAX_PRICE_USD, MIN_PRICE_USD, PRICE_SCALE};
use crate::error::{ForgeError, ForgeResult};

/// `a * b / denominator`, floored, with a u128 intermediate.
pub fn mul_div(a: u64, b: u64, denominator: u64) -> ForgeResult<u64> {
    if denominator == 0 {
        return Err(ForgeError::ArithmeticOverflow);
    }
    let value = (a as u128)
        .checked_mul(b as u128)
        .and_then(|v| v.checked_div(denominator as u128))
        .ok_or(ForgeError::ArithmeticOverflow)?;
    u64::try_from(value).map_err(|_| ForgeError::ArithmeticOverflow)
}

/// `a * b / denominator`, rounded up.
pub fn mul_div_up(a: u64, b: u64, denominator: u64) -> ForgeResult<u64> {
    if denominator == 0 {
        return Err(ForgeError::ArithmeticOverflow);
    }
    let denominator = denominator as u128;
    let value = (a as u128)
        .checked_mul(b as u128)
        .and_then(|v| v.checked_add(denominator - 1))
        .and_then(|v| v.checked_div(denominator))
        .ok_or(ForgeError::ArithmeticOverflow)?;
    u64::try_from(value).map_err(|_| ForgeError::ArithmeticOverflow)
}

/// Integer square root (floor) by Newton iteration.
pub fn isqrt(value: u128) -> u128 {
    if value < 2 {
        return value;
    }
    let mut x = value;
    let mut y = x / 2 + x % 2;
    while y < x {
        x = y;
        y = (x + value / x) / 2;
    }
    x
}

pub fn pow10(decimals: u8) -> ForgeResult<u64> {
    10u64
        .checked_pow(decimals as u32)
        .ok_or(ForgeError::ArithmeticOverflow)
}

/// Rescales an integer amount between two decimal precisions (floored).
pub fn rescale(amount: u64, from_decimals: u8, to_decimals: u8) -> ForgeResult<u64> {
    if from_decimals == to_decimals {
        return Ok(amount);
    }
    if to_decimals > from_decimals {
        amount
            .checked_mul(pow10(to_decimals - from_decimals)?)
            .ok_or(ForgeError::ArithmeticOverflow)
    } else {
        Ok(amount / pow10(from_decimals - to_decimals)?)
    }
}

pub fn to_display_units(amount: u64, decimals: u8) -> f64 {
    amount as f64 / 10f64.powi(decimals as i32)
}

/// Price of one whole token in USDC, fixed-point at `PRICE_SCALE`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    AnchorSerialize,
    AnchorDeserialize,
)]
pub struct Price(u64);

impl Price {
    pub const fn from_raw(raw: u64) -> Self {
        Price(raw)
    }

    /// Validates a feed quote and converts it to fixed point.
    pub fn from_quote(token: &str, quote: f64) -> ForgeResult<Self> {
        if !quote.is_finite() || !(MIN_PRICE_USD..=MAX_PRICE_USD).contains(&quote) {
            return Err(ForgeError::PriceUnavailable {
                token: token.to_string(),
            });
        }
        let raw = (quote * PRICE_SCALE as f64).round() as u64;
        if raw == 0 {
            return Err(ForgeError::PriceUnavailable {
                token: token.to_string(),
            });
        }
        Ok(Price(raw))
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub fn as_f64(self) -> f64 {
        self.0 as f64 / PRICE_SCALE as f64
    }

    /// USDC value (6 decimals) of `amount` base units with `decimals` precision.
    pub fn value_of(self, amount: u64, decimals: u8) -> ForgeResult<u64> {
        mul_div(amount, self.0, pow10(decimals)?)
    }

    /// Base units worth `usdc` at this price, floored.
    pub fn amount_for(self, usdc: u64, decimals: u8) -> ForgeResult<u64> {
        mul_div(usdc, pow10(decimals)?, self.0)
    }

    /// Base units worth `usdc` at this price, rounded up so the USDC value is always covered.
    pub fn amount_for_up(self, usdc: u64, decimals: u8) -> ForgeResult<u64> {
        mul_div_up(usdc, pow10(decimals)?, self.0)
    }
}
