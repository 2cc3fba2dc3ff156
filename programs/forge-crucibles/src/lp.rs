use anchor_lang::prelude::Pubkey;
use forge_core::constants::{BPS_SCALE, MAX_BASE_LEG, MAX_USDC_LEG, MIN_LP_LEG, USDC_DECIMALS};
use forge_core::math::{isqrt, rescale};
use forge_core::{FeeSchedule, ForgeError, ForgeResult, Price};
use serde::Serialize;

use crate::ctoken::{base_for, distribute_base_fee, distribute_usdc_fee};
use crate::state::{CloseSummary, Crucible, LpPosition};

/// `sqrt(receipt_leg * usdc_leg)`, both legs in the same precision.
pub fn lp_tokens_for_legs(receipt_leg: u64, usdc_leg: u64) -> ForgeResult<u64> {
    if receipt_leg == 0 || usdc_leg == 0 {
        return Err(ForgeError::InvalidLegAmount {
            base: receipt_leg,
            usdc: usdc_leg,
        });
    }
    let product = (receipt_leg as u128)
        .checked_mul(usdc_leg as u128)
        .ok_or(ForgeError::ArithmeticOverflow)?;
    u64::try_from(isqrt(product)).map_err(|_| ForgeError::ArithmeticOverflow)
}

/// Deviation between the two leg values in basis points of the larger one.
pub fn leg_deviation_bps(base_value: u64, usdc_value: u64) -> ForgeResult<u64> {
    let larger = base_value.max(usdc_value);
    if larger == 0 {
        return Ok(0);
    }
    forge_core::math::mul_div(base_value.abs_diff(usdc_value), BPS_SCALE, larger)
}

pub fn check_leg_bounds(base_amount: u64, usdc_amount: u64) -> ForgeResult<()> {
    if base_amount == 0 || usdc_amount == 0 {
        return Err(ForgeError::InvalidLegAmount {
            base: base_amount,
            usdc: usdc_amount,
        });
    }
    if base_amount < MIN_LP_LEG || usdc_amount < MIN_LP_LEG {
        return Err(ForgeError::InvalidAmount(format!(
            "LP legs must be at least {} units (base {}, usdc {})",
            MIN_LP_LEG, base_amount, usdc_amount
        )));
    }
    if base_amount > MAX_BASE_LEG || usdc_amount > MAX_USDC_LEG {
        return Err(ForgeError::InvalidAmount(format!(
            "LP legs exceed maximum (base {}, usdc {})",
            base_amount, usdc_amount
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LpOpenQuote {
    pub base_fee: u64,
    pub usdc_fee: u64,
    pub receipts_minted: u64,
    pub usdc_net: u64,
    pub lp_tokens: u64,
    pub deviation_bps: u64,
}

/// Validates an equal-value pair, charges the open fee on each leg, mints
/// receipts for the base leg and issues LP tokens. `crucible` is only
/// mutated once every check has passed.
#[allow(clippy::too_many_arguments)]
pub fn open(
    crucible: &mut Crucible,
    fees: &FeeSchedule,
    owner: Pubkey,
    nonce: u64,
    base_amount: u64,
    usdc_amount: u64,
    price: Price,
    tolerance_bps: u64,
    now: i64,
) -> ForgeResult<(LpPosition, LpOpenQuote)> {
    check_leg_bounds(base_amount, usdc_amount)?;
    let base_value = price.value_of(base_amount, crucible.base_decimals)?;
    let deviation_bps = leg_deviation_bps(base_value, usdc_amount)?;
    if deviation_bps > tolerance_bps {
        return Err(ForgeError::ToleranceExceeded {
            deviation_bps,
            max_bps: tolerance_bps,
        });
    }

    let base_fee = fees.lp_open_fee(base_amount)?;
    let usdc_fee = fees.lp_open_fee(usdc_amount)?;
    let entry_rate = crucible.ledger.rate;

    let mut next = crucible.clone();
    let receipts_minted = next.ledger.mint(base_fee.net_amount)?;
    let receipt_equivalent = base_for(receipts_minted, entry_rate)?;
    let usdc_in_base_units = rescale(usdc_fee.net_amount, USDC_DECIMALS, next.base_decimals)?;
    let lp_tokens = lp_tokens_for_legs(receipt_equivalent, usdc_in_base_units)?;

    distribute_base_fee(&mut next, fees, base_fee.fee_amount)?;
    distribute_usdc_fee(&mut next, fees, usdc_fee.fee_amount)?;
    next.total_lp_token_supply = next
        .total_lp_token_supply
        .checked_add(lp_tokens)
        .ok_or(ForgeError::ArithmeticOverflow)?;
    next.total_lp_positions += 1;
    *crucible = next;

    let position = LpPosition {
        owner,
        crucible_id: crucible.id,
        base_token: crucible.base_token.clone(),
        nonce,
        base_amount,
        usdc_amount,
        receipt_amount: receipts_minted,
        usdc_net: usdc_fee.net_amount,
        entry_price: price.raw(),
        entry_exchange_rate: entry_rate,
        lp_token_amount: lp_tokens,
        opened_at: now,
        closed_at: None,
        is_open: true,
    };
    let quote = LpOpenQuote {
        base_fee: base_fee.fee_amount,
        usdc_fee: usdc_fee.fee_amount,
        receipts_minted,
        usdc_net: usdc_fee.net_amount,
        lp_tokens,
        deviation_bps,
    };
    Ok((position, quote))
}

/// Base units of exchange-rate growth on `receipts` since `entry_rate`.
pub fn receipt_yield(receipts: u64, entry_rate: u64, current_rate: u64) -> ForgeResult<u64> {
    base_for(receipts, current_rate.saturating_sub(entry_rate))
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LpCloseQuote {
    pub summary: CloseSummary,
    pub lp_tokens_burned: u64,
    /// Mark-to-market change of the base leg in USDC. Reported, not taxed.
    pub price_delta_usdc: i64,
}

/// Burns the position's receipts and LP tokens and returns both legs.
/// Principal and yield are fee-taxed independently.
pub fn close(
    crucible: &mut Crucible,
    fees: &FeeSchedule,
    position: &LpPosition,
    price: Price,
) -> ForgeResult<LpCloseQuote> {
    let mut next = crucible.clone();
    let current_rate = next.ledger.rate;
    let base_total = next
        .ledger
        .burn(position.receipt_amount, position.receipt_amount)?;
    let yield_component = receipt_yield(position.receipt_amount, position.entry_exchange_rate, current_rate)?
        .min(base_total);
    let principal = base_total - yield_component;

    let base_fee = fees.close_fee(principal, yield_component)?;
    let usdc_fee = fees.lp_close_principal.apply(position.usdc_net)?;
    let base_fees_charged = base_fee.total_fee()?;

    distribute_base_fee(&mut next, fees, base_fees_charged)?;
    distribute_usdc_fee(&mut next, fees, usdc_fee.fee_amount)?;
    next.total_lp_token_supply = next
        .total_lp_token_supply
        .saturating_sub(position.lp_token_amount);
    next.total_lp_positions = next.total_lp_positions.saturating_sub(1);

    let entry_value = Price::from_raw(position.entry_price).value_of(base_total, next.base_decimals)?;
    let current_value = price.value_of(base_total, next.base_decimals)?;
    let price_delta_usdc = (current_value as i128 - entry_value as i128)
        .clamp(i64::MIN as i128, i64::MAX as i128) as i64;

    *crucible = next;
    Ok(LpCloseQuote {
        summary: CloseSummary {
            base_amount_returned: base_fee.total_net()?,
            usdc_amount_returned: usdc_fee.net_amount,
            yield_component,
            fees_charged: base_fees_charged,
            usdc_fees_charged: usdc_fee.fee_amount,
        },
        lp_tokens_burned: position.lp_token_amount,
        price_delta_usdc,
    })
}
