//! Leveraged (Inferno) positions: borrow sizing, effective APY, health
//! and liquidation.
//!
//! Health is `position value / debt`, where the position value is the
//! base leg at the current exchange rate and price plus the borrowed USDC
//! leg, and the debt is the borrowed principal plus accrued interest.

use anchor_lang::prelude::Pubkey;
use forge_core::constants::{ALLOWED_LEVERAGE, BORROW_RATE, INFINITE_HEALTH, LEVERAGE_SCALE};
use forge_core::{EngineConfig, FeeRate, FeeSchedule, ForgeError, ForgeResult, Price};
use lending_pool_usdc::accrued_interest;
use serde::Serialize;

use crate::ctoken::{base_for, distribute_base_fee};
use crate::lp::receipt_yield;
use crate::state::{CloseSummary, Crucible, LeveragedPosition};

/// Leverage multiple scaled by 100. Only 1x, 1.5x and 2x exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct LeverageFactor(u64);

impl LeverageFactor {
    pub const ONE: LeverageFactor = LeverageFactor(100);

    pub fn new(scaled: u64) -> ForgeResult<Self> {
        if !ALLOWED_LEVERAGE.contains(&scaled) {
            return Err(ForgeError::InvalidLeverage(scaled));
        }
        Ok(LeverageFactor(scaled))
    }

    pub fn scaled(self) -> u64 {
        self.0
    }

    pub fn as_f64(self) -> f64 {
        self.0 as f64 / LEVERAGE_SCALE as f64
    }
}

/// `collateral_value * (leverage - 1)`.
pub fn borrowed_usdc(collateral_value: u64, leverage: LeverageFactor) -> ForgeResult<u64> {
    forge_core::math::mul_div(collateral_value, leverage.0 - LEVERAGE_SCALE, LEVERAGE_SCALE)
}

/// USDC to borrow against `collateral` base units at `price`.
pub fn borrowed_usdc_for(
    collateral: u64,
    decimals: u8,
    price: Price,
    leverage: LeverageFactor,
) -> ForgeResult<u64> {
    borrowed_usdc(price.value_of(collateral, decimals)?, leverage)
}

/// `base_apy * leverage - borrow_rate * (leverage - 1)`. Every leveraged
/// yield figure goes through here.
pub fn effective_apy(base_apy: f64, leverage: f64) -> f64 {
    effective_apy_with_rate(base_apy, leverage, BORROW_RATE)
}

pub fn effective_apy_with_rate(base_apy: f64, leverage: f64, borrow_rate: FeeRate) -> f64 {
    base_apy * leverage - borrow_rate.as_fraction() * (leverage - 1.0)
}

/// `collateral_value / borrowed_value`; debt-free positions report `INFINITE_HEALTH`.
pub fn health_factor(collateral_value: u64, borrowed_value: u64) -> f64 {
    if borrowed_value == 0 {
        return INFINITE_HEALTH;
    }
    collateral_value as f64 / borrowed_value as f64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HealthStatus {
    Healthy,
    Warning,
    Liquidatable,
}

impl HealthStatus {
    pub fn classify(health: f64, config: &EngineConfig) -> Self {
        if health < config.liquidation_health {
            HealthStatus::Liquidatable
        } else if health < config.warning_health {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PositionHealth {
    /// Base leg value plus the USDC leg, in USDC units.
    pub collateral_value: u64,
    pub base_leg_value: u64,
    pub principal: u64,
    pub interest: u64,
    pub health_factor: f64,
    pub status: HealthStatus,
}

impl PositionHealth {
    pub fn debt(&self) -> u64 {
        self.principal.saturating_add(self.interest)
    }
}

pub fn assess(
    crucible: &Crucible,
    position: &LeveragedPosition,
    price: Price,
    borrow_rate: FeeRate,
    config: &EngineConfig,
    now: i64,
) -> ForgeResult<PositionHealth> {
    let base_leg = base_for(position.receipt_amount, crucible.ledger.rate)?;
    let base_leg_value = price.value_of(base_leg, crucible.base_decimals)?;
    let collateral_value = base_leg_value
        .checked_add(position.borrowed_usdc)
        .ok_or(ForgeError::ArithmeticOverflow)?;
    let elapsed = now.saturating_sub(position.opened_at).max(0) as u64;
    let interest = accrued_interest(position.borrowed_usdc, borrow_rate, elapsed)?;
    let debt = position
        .borrowed_usdc
        .checked_add(interest)
        .ok_or(ForgeError::ArithmeticOverflow)?;
    let health = health_factor(collateral_value, debt);
    Ok(PositionHealth {
        collateral_value,
        base_leg_value,
        principal: position.borrowed_usdc,
        interest,
        health_factor: health,
        status: HealthStatus::classify(health, config),
    })
}

/// Open-time checks, in order: amount, pool liquidity, resulting health.
pub fn validate_open(
    collateral: u64,
    borrowed: u64,
    available_liquidity: u64,
    projected_health: f64,
    min_open_health: f64,
) -> ForgeResult<()> {
    if collateral == 0 {
        return Err(ForgeError::InvalidAmount("collateral must be greater than zero".into()));
    }
    if borrowed > available_liquidity {
        return Err(ForgeError::InsufficientLiquidity {
            required: borrowed,
            available: available_liquidity,
        });
    }
    if projected_health < min_open_health {
        return Err(ForgeError::HealthTooLow {
            health: projected_health,
            minimum: min_open_health,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LeveragedOpenQuote {
    pub collateral_value: u64,
    pub borrowed_usdc: u64,
    pub open_fee: u64,
    pub receipts_minted: u64,
    pub projected_health: f64,
    pub effective_apy: f64,
}

/// Sizes the borrow, validates, then charges the open fee and mints
/// receipts for the net collateral. `crucible` is untouched on error.
#[allow(clippy::too_many_arguments)]
pub fn open(
    crucible: &mut Crucible,
    fees: &FeeSchedule,
    owner: Pubkey,
    nonce: u64,
    collateral: u64,
    leverage: LeverageFactor,
    price: Price,
    available_liquidity: u64,
    min_open_health: f64,
    now: i64,
) -> ForgeResult<(LeveragedPosition, LeveragedOpenQuote)> {
    if collateral == 0 {
        return Err(ForgeError::InvalidAmount("collateral must be greater than zero".into()));
    }
    let collateral_value = price.value_of(collateral, crucible.base_decimals)?;
    let borrowed = borrowed_usdc(collateral_value, leverage)?;
    let fee = fees.lp_open_fee(collateral)?;

    let mut next = crucible.clone();
    let entry_rate = next.ledger.rate;
    let receipts_minted = next.ledger.mint(fee.net_amount)?;
    let base_leg_value = price.value_of(base_for(receipts_minted, entry_rate)?, next.base_decimals)?;
    let projected_health = health_factor(base_leg_value.saturating_add(borrowed), borrowed);
    validate_open(collateral, borrowed, available_liquidity, projected_health, min_open_health)?;

    distribute_base_fee(&mut next, fees, fee.fee_amount)?;
    next.total_leveraged_positions += 1;
    *crucible = next;

    let position = LeveragedPosition {
        owner,
        crucible_id: crucible.id,
        base_token: crucible.base_token.clone(),
        nonce,
        collateral,
        receipt_amount: receipts_minted,
        leverage_factor: leverage.scaled(),
        borrowed_usdc: borrowed,
        entry_price: price.raw(),
        entry_exchange_rate: entry_rate,
        opened_at: now,
        closed_at: None,
        is_open: true,
    };
    let quote = LeveragedOpenQuote {
        collateral_value,
        borrowed_usdc: borrowed,
        open_fee: fee.fee_amount,
        receipts_minted,
        projected_health,
        effective_apy: effective_apy_with_rate(crucible.base_apy, leverage.as_f64(), fees.borrow_rate),
    };
    Ok((position, quote))
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LeveragedCloseQuote {
    pub summary: CloseSummary,
    pub principal_repaid: u64,
    pub interest_paid: u64,
    /// Base units sold to cover interest.
    pub base_sold_for_interest: u64,
}

/// Repays principal from the USDC leg and interest from the base leg, then
/// charges the close fee on what remains.
pub fn close(
    crucible: &mut Crucible,
    fees: &FeeSchedule,
    position: &LeveragedPosition,
    price: Price,
    borrow_rate: FeeRate,
    now: i64,
) -> ForgeResult<LeveragedCloseQuote> {
    let mut next = crucible.clone();
    let current_rate = next.ledger.rate;
    let base_total = next
        .ledger
        .burn(position.receipt_amount, position.receipt_amount)?;

    let elapsed = now.saturating_sub(position.opened_at).max(0) as u64;
    let interest = accrued_interest(position.borrowed_usdc, borrow_rate, elapsed)?;
    let base_sold = price.amount_for_up(interest, next.base_decimals)?;
    if base_sold > base_total {
        return Err(ForgeError::InsufficientBalance {
            required: base_sold,
            available: base_total,
        });
    }

    let remaining = base_total - base_sold;
    let yield_component = receipt_yield(position.receipt_amount, position.entry_exchange_rate, current_rate)?
        .min(remaining);
    let principal = remaining - yield_component;
    let fee = fees.close_fee(principal, yield_component)?;
    let fees_charged = fee.total_fee()?;
    distribute_base_fee(&mut next, fees, fees_charged)?;
    next.total_leveraged_positions = next.total_leveraged_positions.saturating_sub(1);
    *crucible = next;

    Ok(LeveragedCloseQuote {
        summary: CloseSummary {
            base_amount_returned: fee.total_net()?,
            usdc_amount_returned: 0,
            yield_component,
            fees_charged,
            usdc_fees_charged: 0,
        },
        principal_repaid: position.borrowed_usdc,
        interest_paid: interest,
        base_sold_for_interest: base_sold,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LiquidationQuote {
    pub health: PositionHealth,
    /// USDC that reaches the pool, capped at the debt.
    pub recovered_usdc: u64,
    pub shortfall: u64,
    pub liquidation_fee: u64,
    pub base_returned_to_owner: u64,
}

/// Unwinds an unhealthy position. The pool is repaid first from the USDC
/// leg and then from the base leg; the liquidation fee is charged on the
/// remaining base and the rest goes back to the owner.
pub fn liquidate(
    crucible: &mut Crucible,
    fees: &FeeSchedule,
    position: &LeveragedPosition,
    price: Price,
    borrow_rate: FeeRate,
    config: &EngineConfig,
    now: i64,
) -> ForgeResult<LiquidationQuote> {
    let health = assess(crucible, position, price, borrow_rate, config, now)?;
    if health.status != HealthStatus::Liquidatable {
        return Err(ForgeError::PositionNotLiquidatable {
            health: health.health_factor,
        });
    }

    let mut next = crucible.clone();
    let base_total = next
        .ledger
        .burn(position.receipt_amount, position.receipt_amount)?;
    let debt = health.debt();
    let still_owed = debt.saturating_sub(position.borrowed_usdc);
    let base_needed = price.amount_for_up(still_owed, next.base_decimals)?;

    let (recovered_usdc, remaining_base) = if base_needed <= base_total {
        (debt, base_total - base_needed)
    } else {
        let base_value = price.value_of(base_total, next.base_decimals)?;
        (position.borrowed_usdc.saturating_add(base_value), 0)
    };
    let shortfall = debt.saturating_sub(recovered_usdc);

    let fee = fees.liquidation_fee(remaining_base)?;
    distribute_base_fee(&mut next, fees, fee.fee_amount)?;
    next.total_leveraged_positions = next.total_leveraged_positions.saturating_sub(1);
    *crucible = next;

    Ok(LiquidationQuote {
        health,
        recovered_usdc,
        shortfall,
        liquidation_fee: fee.fee_amount,
        base_returned_to_owner: fee.net_amount,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctoken::wrap;
    use forge_core::constants::SECONDS_PER_YEAR;
    use proptest::prelude::*;

    const SOL: u64 = 1_000_000_000;
    const USDC: u64 = 1_000_000;

    fn crucible() -> Crucible {
        let mut c = Crucible::new(Pubkey::new_unique(), "SOL", "cSOL", 9, 0.08, 0);
        wrap(&mut c, &FeeSchedule::STANDARD, 1_000 * SOL).unwrap();
        c
    }

    fn price(p: f64) -> Price {
        Price::from_quote("SOL", p).unwrap()
    }

    fn lev(scaled: u64) -> LeverageFactor {
        LeverageFactor::new(scaled).unwrap()
    }

    #[test]
    fn two_x_on_ten_sol_borrows_two_thousand() {
        let borrowed = borrowed_usdc_for(10 * SOL, 9, price(200.0), lev(200)).unwrap();
        assert_eq!(borrowed, 2_000 * USDC);
        assert_eq!(borrowed_usdc(2_000 * USDC, lev(150)).unwrap(), 1_000 * USDC);
        assert_eq!(borrowed_usdc(2_000 * USDC, LeverageFactor::ONE).unwrap(), 0);
    }

    #[test]
    fn only_listed_leverage_factors_exist() {
        assert!(LeverageFactor::new(100).is_ok());
        assert!(LeverageFactor::new(150).is_ok());
        assert!(LeverageFactor::new(200).is_ok());
        assert_eq!(LeverageFactor::new(250), Err(ForgeError::InvalidLeverage(250)));
        assert_eq!(LeverageFactor::new(120), Err(ForgeError::InvalidLeverage(120)));
        assert_eq!(LeverageFactor::new(0), Err(ForgeError::InvalidLeverage(0)));
    }

    #[test]
    fn effective_apy_examples() {
        assert!((effective_apy(0.08, 2.0) - 0.06).abs() < 1e-12);
        assert!((effective_apy(0.08, 1.5) - 0.07).abs() < 1e-12);
    }

    #[test]
    fn health_sentinel_for_debt_free_positions() {
        assert_eq!(health_factor(1_000, 0), INFINITE_HEALTH);
        assert_eq!(health_factor(1_500, 1_000), 1.5);
    }

    #[test]
    fn status_bands() {
        let config = EngineConfig::default();
        assert_eq!(HealthStatus::classify(2.0, &config), HealthStatus::Healthy);
        assert_eq!(HealthStatus::classify(1.5, &config), HealthStatus::Healthy);
        assert_eq!(HealthStatus::classify(1.49, &config), HealthStatus::Warning);
        assert_eq!(HealthStatus::classify(1.0, &config), HealthStatus::Warning);
        assert_eq!(HealthStatus::classify(0.99, &config), HealthStatus::Liquidatable);
    }

    #[test]
    fn validation_order_is_amount_liquidity_health() {
        assert!(matches!(
            validate_open(0, 5_000, 0, 0.5, 1.2),
            Err(ForgeError::InvalidAmount(_))
        ));
        assert_eq!(
            validate_open(1, 5_000, 100, 0.5, 1.2),
            Err(ForgeError::InsufficientLiquidity {
                required: 5_000,
                available: 100
            })
        );
        assert!(matches!(
            validate_open(1, 50, 100, 0.5, 1.2),
            Err(ForgeError::HealthTooLow { .. })
        ));
        assert!(validate_open(1, 50, 100, 1.3, 1.2).is_ok());
    }

    #[test]
    fn open_two_x_position() {
        let mut c = crucible();
        let (position, quote) = open(
            &mut c,
            &FeeSchedule::STANDARD,
            Pubkey::new_unique(),
            0,
            10 * SOL,
            lev(200),
            price(200.0),
            1_000_000 * USDC,
            1.2,
            0,
        )
        .unwrap();
        assert_eq!(quote.collateral_value, 2_000 * USDC);
        assert_eq!(position.borrowed_usdc, 2_000 * USDC);
        assert_eq!(quote.open_fee, SOL / 10);
        assert!(quote.projected_health > 1.98 && quote.projected_health < 2.0);
        assert!((quote.effective_apy - 0.06).abs() < 1e-12);
        assert_eq!(c.total_leveraged_positions, 1);
    }

    #[test]
    fn open_rejects_thin_pool_without_mutation() {
        let mut c = crucible();
        let before = c.clone();
        let err = open(
            &mut c,
            &FeeSchedule::STANDARD,
            Pubkey::new_unique(),
            0,
            10 * SOL,
            lev(200),
            price(200.0),
            1_000 * USDC,
            1.2,
            0,
        )
        .unwrap_err();
        assert!(matches!(err, ForgeError::InsufficientLiquidity { .. }));
        assert_eq!(c, before);
    }

    #[test]
    fn one_x_position_has_no_debt() {
        let mut c = crucible();
        let (position, quote) = open(
            &mut c,
            &FeeSchedule::STANDARD,
            Pubkey::new_unique(),
            0,
            SOL,
            LeverageFactor::ONE,
            price(200.0),
            0,
            1.2,
            0,
        )
        .unwrap();
        assert_eq!(position.borrowed_usdc, 0);
        assert_eq!(quote.projected_health, INFINITE_HEALTH);
        let health = assess(
            &c,
            &position,
            price(1.0),
            BORROW_RATE,
            &EngineConfig::default(),
            SECONDS_PER_YEAR as i64,
        )
        .unwrap();
        assert_eq!(health.status, HealthStatus::Healthy);
    }

    #[test]
    fn close_pays_interest_from_base_leg() {
        let mut c = crucible();
        let (position, _) = open(
            &mut c,
            &FeeSchedule::STANDARD,
            Pubkey::new_unique(),
            0,
            10 * SOL,
            lev(200),
            price(200.0),
            1_000_000 * USDC,
            1.2,
            0,
        )
        .unwrap();
        let quote = close(
            &mut c,
            &FeeSchedule::STANDARD,
            &position,
            price(200.0),
            BORROW_RATE,
            SECONDS_PER_YEAR as i64,
        )
        .unwrap();
        assert_eq!(quote.interest_paid, 200 * USDC);
        assert_eq!(quote.base_sold_for_interest, SOL);
        assert_eq!(quote.principal_repaid, 2_000 * USDC);
        assert!(quote.summary.base_amount_returned > 0);
        assert_eq!(c.total_leveraged_positions, 0);
    }

    #[test]
    fn healthy_position_cannot_be_liquidated() {
        let mut c = crucible();
        let (position, _) = open(
            &mut c,
            &FeeSchedule::STANDARD,
            Pubkey::new_unique(),
            0,
            10 * SOL,
            lev(200),
            price(200.0),
            1_000_000 * USDC,
            1.2,
            0,
        )
        .unwrap();
        let err = liquidate(
            &mut c,
            &FeeSchedule::STANDARD,
            &position,
            price(200.0),
            BORROW_RATE,
            &EngineConfig::default(),
            0,
        )
        .unwrap_err();
        assert!(matches!(err, ForgeError::PositionNotLiquidatable { .. }));
    }

    #[test]
    fn liquidation_repays_pool_then_charges_fee() {
        let mut c = crucible();
        let (position, _) = open(
            &mut c,
            &FeeSchedule::STANDARD,
            Pubkey::new_unique(),
            0,
            10 * SOL,
            lev(200),
            price(200.0),
            1_000_000 * USDC,
            1.2,
            0,
        )
        .unwrap();
        // One year of interest (200 USDC) against a base leg now worth ~99 USDC.
        let crashed = price(10.0);
        let quote = liquidate(
            &mut c,
            &FeeSchedule::STANDARD,
            &position,
            crashed,
            BORROW_RATE,
            &EngineConfig::default(),
            SECONDS_PER_YEAR as i64,
        )
        .unwrap();
        assert_eq!(quote.health.status, HealthStatus::Liquidatable);
        assert_eq!(quote.health.interest, 200 * USDC);
        assert_eq!(quote.base_returned_to_owner, 0);
        assert_eq!(quote.liquidation_fee, 0);
        assert!(quote.shortfall > 0);
        assert_eq!(quote.recovered_usdc + quote.shortfall, quote.health.debt());
        assert_eq!(c.total_leveraged_positions, 0);
    }

    proptest! {
        #[test]
        fn unit_leverage_has_no_borrow_cost(apy in -1.0f64..1.0) {
            prop_assert_eq!(effective_apy(apy, 1.0), apy);
        }

        #[test]
        fn health_moves_with_inputs(collateral in 1u64..1_000_000_000, borrowed in 1u64..1_000_000_000, bump in 1u64..1_000_000) {
            let base = health_factor(collateral, borrowed);
            prop_assert!(health_factor(collateral, borrowed + bump) < base);
            prop_assert!(health_factor(collateral + bump, borrowed) > base);
        }
    }
}
