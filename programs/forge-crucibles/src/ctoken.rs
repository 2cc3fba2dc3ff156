use anchor_lang::prelude::{borsh, AnchorDeserialize, AnchorSerialize};
use forge_core::constants::{INITIAL_EXCHANGE_RATE, RATE_SCALE};
use forge_core::{FeeSchedule, FeeSplit, ForgeError, ForgeResult, ShareSplit};
use serde::Serialize;
use tracing::debug;

use crate::state::Crucible;

/// Receipt-to-base exchange rate of one crucible.
///
/// The rate starts at `INITIAL_EXCHANGE_RATE` and only moves up, through
/// `accrue`. Mint and burn convert at the current rate and never move it.
#[derive(Debug, Clone, PartialEq, Eq, AnchorSerialize, AnchorDeserialize)]
pub struct ExchangeRateLedger {
    /// Base units per receipt, at `RATE_SCALE`.
    pub rate: u64,
    pub total_receipt_supply: u64,
    /// Base units accrued to holders so far.
    pub total_fees_accrued: u64,
    /// Accrued value not yet large enough to move the rate, at `RATE_SCALE`.
    accrual_remainder: u64,
}

impl Default for ExchangeRateLedger {
    fn default() -> Self {
        Self::new()
    }
}

/// Receipts worth `base` at `rate`, floored.
pub fn receipts_for(base: u64, rate: u64) -> ForgeResult<u64> {
    forge_core::math::mul_div(base, RATE_SCALE, rate)
}

/// Base units redeemable for `receipts` at `rate`, floored.
pub fn base_for(receipts: u64, rate: u64) -> ForgeResult<u64> {
    forge_core::math::mul_div(receipts, rate, RATE_SCALE)
}

impl ExchangeRateLedger {
    pub fn new() -> Self {
        Self::with_rate(INITIAL_EXCHANGE_RATE)
    }

    pub fn with_rate(rate: u64) -> Self {
        Self {
            rate,
            total_receipt_supply: 0,
            total_fees_accrued: 0,
            accrual_remainder: 0,
        }
    }

    /// Spreads `fee` base units over current holders. Returns `false`
    /// without touching the rate when there are no holders.
    pub fn accrue(&mut self, fee: u64) -> ForgeResult<bool> {
        if fee == 0 || self.total_receipt_supply == 0 {
            return Ok(false);
        }
        let numerator = (fee as u128)
            .checked_mul(RATE_SCALE as u128)
            .and_then(|v| v.checked_add(self.accrual_remainder as u128))
            .ok_or(ForgeError::ArithmeticOverflow)?;
        let supply = self.total_receipt_supply as u128;
        let increment = u64::try_from(numerator / supply).map_err(|_| ForgeError::ArithmeticOverflow)?;
        let remainder = u64::try_from(numerator % supply).map_err(|_| ForgeError::ArithmeticOverflow)?;

        self.rate = self
            .rate
            .checked_add(increment)
            .ok_or(ForgeError::ArithmeticOverflow)?;
        self.accrual_remainder = remainder;
        self.total_fees_accrued = self
            .total_fees_accrued
            .checked_add(fee)
            .ok_or(ForgeError::ArithmeticOverflow)?;
        debug!(fee, rate = self.rate, supply = self.total_receipt_supply, "fee accrued to exchange rate");
        Ok(true)
    }

    /// Mints receipts for `net_base` at the current rate.
    pub fn mint(&mut self, net_base: u64) -> ForgeResult<u64> {
        let minted = receipts_for(net_base, self.rate)?;
        if minted == 0 {
            return Err(ForgeError::InvalidAmount(format!(
                "{} base units mint no receipts at rate {}",
                net_base, self.rate
            )));
        }
        self.total_receipt_supply = self
            .total_receipt_supply
            .checked_add(minted)
            .ok_or(ForgeError::ArithmeticOverflow)?;
        Ok(minted)
    }

    /// Burns `receipts` from a holder with `holder_balance` and returns
    /// the base units they redeem for.
    pub fn burn(&mut self, receipts: u64, holder_balance: u64) -> ForgeResult<u64> {
        if receipts > holder_balance {
            return Err(ForgeError::InsufficientBalance {
                required: receipts,
                available: holder_balance,
            });
        }
        if receipts > self.total_receipt_supply {
            return Err(ForgeError::InsufficientBalance {
                required: receipts,
                available: self.total_receipt_supply,
            });
        }
        let base = base_for(receipts, self.rate)?;
        self.total_receipt_supply -= receipts;
        // An emptied ledger keeps its rate; later depositors mint at it.
        Ok(base)
    }

    pub fn rate_as_f64(&self) -> f64 {
        self.rate as f64 / RATE_SCALE as f64
    }
}

/// Routes the vault share of a base fee into the rate; with no holders
/// left it falls through to the treasury.
pub fn distribute_base_fee(crucible: &mut Crucible, fees: &FeeSchedule, fee: u64) -> ForgeResult<ShareSplit> {
    let split = fees.split_fee(fee)?;
    let accrued = crucible.ledger.accrue(split.vault_share)?;
    let treasury = if accrued {
        split.protocol_share
    } else {
        fee
    };
    crucible.protocol_fees_base = crucible
        .protocol_fees_base
        .checked_add(treasury)
        .ok_or(ForgeError::ArithmeticOverflow)?;
    Ok(split)
}

pub fn distribute_usdc_fee(crucible: &mut Crucible, fees: &FeeSchedule, fee: u64) -> ForgeResult<ShareSplit> {
    let split = fees.split_fee(fee)?;
    crucible.vault_fees_usdc = crucible
        .vault_fees_usdc
        .checked_add(split.vault_share)
        .ok_or(ForgeError::ArithmeticOverflow)?;
    crucible.protocol_fees_usdc = crucible
        .protocol_fees_usdc
        .checked_add(split.protocol_share)
        .ok_or(ForgeError::ArithmeticOverflow)?;
    Ok(split)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WrapOutcome {
    pub gross_amount: u64,
    pub fee: FeeSplit,
    pub shares: ShareSplit,
    pub receipts_minted: u64,
    pub rate_at_mint: u64,
    pub rate_after: u64,
}

/// Takes the wrap fee, mints receipts for the net deposit, then accrues
/// the vault share of the fee.
pub fn wrap(crucible: &mut Crucible, fees: &FeeSchedule, gross_amount: u64) -> ForgeResult<WrapOutcome> {
    if gross_amount == 0 {
        return Err(ForgeError::InvalidAmount("wrap amount must be greater than zero".into()));
    }
    let fee = fees.wrap_fee(gross_amount)?;
    let rate_at_mint = crucible.ledger.rate;
    let receipts_minted = crucible.ledger.mint(fee.net_amount)?;
    let shares = distribute_base_fee(crucible, fees, fee.fee_amount)?;
    Ok(WrapOutcome {
        gross_amount,
        fee,
        shares,
        receipts_minted,
        rate_at_mint,
        rate_after: crucible.ledger.rate,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UnwrapOutcome {
    pub receipts_burned: u64,
    pub base_before_fee: u64,
    pub fee: FeeSplit,
    pub shares: ShareSplit,
    pub base_returned: u64,
    pub rate_at_burn: u64,
}

/// Burns receipts at the current rate and charges the unwrap fee, which is
/// reduced once the holding is past its cooldown.
pub fn unwrap(
    crucible: &mut Crucible,
    fees: &FeeSchedule,
    receipts: u64,
    holder_balance: u64,
    deposited_at: i64,
    now: i64,
) -> ForgeResult<UnwrapOutcome> {
    if receipts == 0 {
        return Err(ForgeError::InvalidAmount("unwrap amount must be greater than zero".into()));
    }
    let rate_at_burn = crucible.ledger.rate;
    let base_before_fee = crucible.ledger.burn(receipts, holder_balance)?;
    let fee = fees.unwrap_fee(base_before_fee, deposited_at, now)?;
    let shares = distribute_base_fee(crucible, fees, fee.fee_amount)?;
    Ok(UnwrapOutcome {
        receipts_burned: receipts,
        base_before_fee,
        fee,
        shares,
        base_returned: fee.net_amount,
        rate_at_burn,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ArbitrageOutcome {
    pub amount: u64,
    pub vault_share: u64,
    pub protocol_share: u64,
    pub reward_receipts: u64,
}

/// Routes arbitrage profit to holders. The depositor is paid a receipt
/// reward out of the vault share when there are holders to share with.
pub fn deposit_arbitrage_profit(
    crucible: &mut Crucible,
    fees: &FeeSchedule,
    reward_rate: forge_core::FeeRate,
    amount: u64,
) -> ForgeResult<ArbitrageOutcome> {
    if amount == 0 {
        return Err(ForgeError::InvalidAmount("arbitrage deposit must be greater than zero".into()));
    }
    let split = fees.split_fee(amount)?;
    let mut vault_share = split.vault_share;

    let mut reward_receipts = 0;
    if crucible.ledger.total_receipt_supply > 0 {
        let reward_base = reward_rate.apply(amount)?.fee_amount.min(vault_share);
        if receipts_for(reward_base, crucible.ledger.rate)? > 0 {
            reward_receipts = crucible.ledger.mint(reward_base)?;
            vault_share -= reward_base;
        }
    }

    let accrued = crucible.ledger.accrue(vault_share)?;
    let protocol_share = if accrued {
        split.protocol_share
    } else {
        split.protocol_share + vault_share
    };
    crucible.protocol_fees_base = crucible
        .protocol_fees_base
        .checked_add(protocol_share)
        .ok_or(ForgeError::ArithmeticOverflow)?;

    Ok(ArbitrageOutcome {
        amount,
        vault_share: if accrued { vault_share } else { 0 },
        protocol_share,
        reward_receipts,
    })
}
