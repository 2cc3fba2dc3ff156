use anchor_lang::prelude::{borsh, AnchorDeserialize, AnchorSerialize};
use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::error::{ForgeError, ForgeResult};

/// A fee rate in basis points.
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
pub struct FeeRate(u64);

impl FeeRate {
    pub const ZERO: FeeRate = FeeRate(0);

    pub const fn from_bps(bps: u64) -> Self {
        FeeRate(bps)
    }

    /// Checked constructor for rates coming from outside the crate.
    pub fn new(bps: u64) -> ForgeResult<Self> {
        if bps > BPS_SCALE {
            return Err(ForgeError::InvalidConfig(format!(
                "fee rate {} bps exceeds {} bps",
                bps, BPS_SCALE
            )));
        }
        Ok(FeeRate(bps))
    }

    pub const fn bps(self) -> u64 {
        self.0
    }

    pub fn as_fraction(self) -> f64 {
        self.0 as f64 / BPS_SCALE as f64
    }

    /// Splits `gross` into net and fee. The fee is floored, the net takes
    /// the remainder, so `net + fee == gross` always holds.
    pub fn apply(self, gross: u64) -> ForgeResult<FeeSplit> {
        let fee_amount = (gross as u128)
            .checked_mul(self.0 as u128)
            .and_then(|v| v.checked_div(BPS_SCALE as u128))
            .ok_or(ForgeError::ArithmeticOverflow)?;
        let fee_amount = u64::try_from(fee_amount).map_err(|_| ForgeError::ArithmeticOverflow)?;
        let net_amount = gross
            .checked_sub(fee_amount)
            .ok_or(ForgeError::ArithmeticOverflow)?;
        Ok(FeeSplit {
            net_amount,
            fee_amount,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct FeeSplit {
    pub net_amount: u64,
    pub fee_amount: u64,
}

impl FeeSplit {
    pub fn gross_amount(&self) -> u64 {
        self.net_amount.saturating_add(self.fee_amount)
    }
}

/// Vault and treasury portions of a collected fee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ShareSplit {
    pub vault_share: u64,
    pub protocol_share: u64,
}

/// Close fee with principal and yield taxed independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CloseFee {
    pub principal: FeeSplit,
    pub yield_component: FeeSplit,
}

impl CloseFee {
    pub fn total_fee(&self) -> ForgeResult<u64> {
        self.principal
            .fee_amount
            .checked_add(self.yield_component.fee_amount)
            .ok_or(ForgeError::ArithmeticOverflow)
    }

    pub fn total_net(&self) -> ForgeResult<u64> {
        self.principal
            .net_amount
            .checked_add(self.yield_component.net_amount)
            .ok_or(ForgeError::ArithmeticOverflow)
    }
}

/// The protocol's fee table. Rates are fixed at build time; the struct
/// exists so callers pass one value around instead of reaching for globals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeSchedule {
    pub wrap: FeeRate,
    pub unwrap: FeeRate,
    pub unwrap_after_cooldown: FeeRate,
    pub unwrap_cooldown_secs: i64,
    pub lp_open: FeeRate,
    pub lp_close_principal: FeeRate,
    pub lp_close_yield: FeeRate,
    pub liquidation: FeeRate,
    pub lending_yield: FeeRate,
    pub borrow_rate: FeeRate,
    pub vault_share: FeeRate,
}

impl FeeSchedule {
    pub const STANDARD: FeeSchedule = FeeSchedule {
        wrap: WRAP_FEE_RATE,
        unwrap: UNWRAP_FEE_RATE,
        unwrap_after_cooldown: UNWRAP_FEE_RATE_AFTER_COOLDOWN,
        unwrap_cooldown_secs: UNWRAP_COOLDOWN_SECS,
        lp_open: INFERNO_OPEN_FEE_RATE,
        lp_close_principal: INFERNO_CLOSE_FEE_RATE,
        lp_close_yield: INFERNO_YIELD_FEE_RATE,
        liquidation: LIQUIDATION_FEE_RATE,
        lending_yield: LENDING_YIELD_FEE_RATE,
        borrow_rate: BORROW_RATE,
        vault_share: VAULT_FEE_SHARE,
    };

    pub fn wrap_fee(&self, gross: u64) -> ForgeResult<FeeSplit> {
        self.wrap.apply(gross)
    }

    /// Unwrap rate drops once the holding has aged past the cooldown.
    pub fn unwrap_rate(&self, deposited_at: i64, now: i64) -> FeeRate {
        if now.saturating_sub(deposited_at) >= self.unwrap_cooldown_secs {
            self.unwrap_after_cooldown
        } else {
            self.unwrap
        }
    }

    pub fn unwrap_fee(&self, gross: u64, deposited_at: i64, now: i64) -> ForgeResult<FeeSplit> {
        self.unwrap_rate(deposited_at, now).apply(gross)
    }

    pub fn lp_open_fee(&self, gross: u64) -> ForgeResult<FeeSplit> {
        self.lp_open.apply(gross)
    }

    pub fn close_fee(&self, principal: u64, yield_component: u64) -> ForgeResult<CloseFee> {
        Ok(CloseFee {
            principal: self.lp_close_principal.apply(principal)?,
            yield_component: self.lp_close_yield.apply(yield_component)?,
        })
    }

    pub fn liquidation_fee(&self, remaining_value: u64) -> ForgeResult<FeeSplit> {
        self.liquidation.apply(remaining_value)
    }

    /// Skim taken from interest before it reaches lenders.
    pub fn lending_yield_fee(&self, interest: u64) -> ForgeResult<FeeSplit> {
        self.lending_yield.apply(interest)
    }

    pub fn split_fee(&self, fee: u64) -> ForgeResult<ShareSplit> {
        let split = self.vault_share.apply(fee)?;
        Ok(ShareSplit {
            vault_share: split.fee_amount,
            protocol_share: split.net_amount,
        })
    }
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self::STANDARD
    }
}
