//! The shared USDC pool that leveraged positions borrow from.
//!
//! `LendingPool` is plain state; callers serialize access to it (the engine
//! keeps it behind one mutex) so every borrow/repay is a single
//! read-modify-write.

use std::collections::BTreeMap;

use anchor_lang::prelude::{borsh, AnchorDeserialize, AnchorSerialize, Pubkey};
use forge_core::constants::{BPS_SCALE, SECONDS_PER_YEAR};
use forge_core::{FeeRate, FeeSchedule, ForgeError, ForgeResult};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, AnchorSerialize, AnchorDeserialize)]
pub struct LenderAccount {
    pub shares: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, AnchorSerialize, AnchorDeserialize)]
pub struct BorrowerAccount {
    pub amount_borrowed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RepayReceipt {
    pub principal: u64,
    pub interest_to_lenders: u64,
    pub protocol_fee: u64,
    /// Principal plus interest that went unpaid and was written off.
    pub written_off: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PoolStats {
    pub total_liquidity: u64,
    pub total_borrowed: u64,
    pub available_liquidity: u64,
    pub utilization_bps: u64,
    pub borrow_rate_bps: u64,
    pub supply_apy: f64,
    pub protocol_fees: u64,
    pub bad_debt: u64,
}

#[derive(Debug, Clone, AnchorSerialize, AnchorDeserialize)]
pub struct LendingPool {
    pub total_liquidity: u64,
    pub total_borrowed: u64,
    pub borrow_rate: FeeRate,
    pub minimum_reserve: u64,
    pub total_shares: u64,
    pub protocol_fees: u64,
    pub bad_debt: u64,
    lenders: BTreeMap<Pubkey, LenderAccount>,
    borrowers: BTreeMap<Pubkey, BorrowerAccount>,
    /// Skim taken from interest before it reaches lenders.
    pub lending_yield_fee: FeeRate,
}

/// Simple interest on `principal` after `elapsed_secs` at an annual `rate`.
pub fn accrued_interest(principal: u64, rate: FeeRate, elapsed_secs: u64) -> ForgeResult<u64> {
    let interest = (principal as u128)
        .checked_mul(rate.bps() as u128)
        .and_then(|v| v.checked_mul(elapsed_secs as u128))
        .and_then(|v| v.checked_div(BPS_SCALE as u128 * SECONDS_PER_YEAR as u128))
        .ok_or(ForgeError::ArithmeticOverflow)?;
    u64::try_from(interest).map_err(|_| ForgeError::ArithmeticOverflow)
}

impl LendingPool {
    pub fn new(fees: &FeeSchedule, minimum_reserve: u64) -> Self {
        Self {
            total_liquidity: 0,
            total_borrowed: 0,
            borrow_rate: fees.borrow_rate,
            minimum_reserve,
            total_shares: 0,
            protocol_fees: 0,
            bad_debt: 0,
            lenders: BTreeMap::new(),
            borrowers: BTreeMap::new(),
            lending_yield_fee: fees.lending_yield,
        }
    }

    /// Liquidity that can still be lent without touching the reserve.
    pub fn available_liquidity(&self) -> u64 {
        self.total_liquidity
            .saturating_sub(self.total_borrowed)
            .saturating_sub(self.minimum_reserve)
    }

    pub fn debt_of(&self, borrower: &Pubkey) -> u64 {
        self.borrowers
            .get(borrower)
            .map(|b| b.amount_borrowed)
            .unwrap_or(0)
    }

    pub fn shares_of(&self, lender: &Pubkey) -> u64 {
        self.lenders.get(lender).map(|l| l.shares).unwrap_or(0)
    }

    /// USDC a lender's shares are currently worth.
    pub fn lender_balance(&self, lender: &Pubkey) -> ForgeResult<u64> {
        self.shares_to_amount(self.shares_of(lender))
    }

    fn shares_to_amount(&self, shares: u64) -> ForgeResult<u64> {
        if self.total_shares == 0 {
            return Ok(0);
        }
        forge_core::math::mul_div(shares, self.total_liquidity, self.total_shares)
    }

    /// Adds lender liquidity and returns the shares issued.
    pub fn deposit(&mut self, lender: Pubkey, amount: u64) -> ForgeResult<u64> {
        if amount == 0 {
            return Err(ForgeError::InvalidAmount("deposit must be greater than zero".into()));
        }
        let shares = if self.total_shares == 0 || self.total_liquidity == 0 {
            amount
        } else {
            forge_core::math::mul_div(amount, self.total_shares, self.total_liquidity)?
        };
        if shares == 0 {
            return Err(ForgeError::InvalidAmount(format!(
                "deposit of {} is below one pool share",
                amount
            )));
        }

        self.total_liquidity = self
            .total_liquidity
            .checked_add(amount)
            .ok_or(ForgeError::ArithmeticOverflow)?;
        self.total_shares = self
            .total_shares
            .checked_add(shares)
            .ok_or(ForgeError::ArithmeticOverflow)?;
        let account = self.lenders.entry(lender).or_default();
        account.shares = account
            .shares
            .checked_add(shares)
            .ok_or(ForgeError::ArithmeticOverflow)?;

        info!(%lender, amount, shares, total_liquidity = self.total_liquidity, "usdc deposited");
        Ok(shares)
    }

    /// Redeems `shares` and returns the USDC paid out.
    pub fn withdraw(&mut self, lender: Pubkey, shares: u64) -> ForgeResult<u64> {
        if shares == 0 {
            return Err(ForgeError::InvalidAmount("withdrawal must be greater than zero".into()));
        }
        let held = self.shares_of(&lender);
        if shares > held {
            return Err(ForgeError::InsufficientBalance {
                required: shares,
                available: held,
            });
        }
        let amount = self.shares_to_amount(shares)?;
        let available = self.available_liquidity();
        if amount > available {
            return Err(ForgeError::InsufficientLiquidity {
                required: amount,
                available,
            });
        }

        self.total_liquidity -= amount;
        self.total_shares -= shares;
        if let Some(account) = self.lenders.get_mut(&lender) {
            account.shares -= shares;
            if account.shares == 0 {
                self.lenders.remove(&lender);
            }
        }

        info!(%lender, amount, shares, total_liquidity = self.total_liquidity, "usdc withdrawn");
        Ok(amount)
    }

    pub fn borrow(&mut self, borrower: Pubkey, amount: u64) -> ForgeResult<()> {
        if amount == 0 {
            return Err(ForgeError::InvalidAmount("borrow must be greater than zero".into()));
        }
        let available = self.available_liquidity();
        if amount > available {
            return Err(ForgeError::InsufficientLiquidity {
                required: amount,
                available,
            });
        }

        self.total_borrowed = self
            .total_borrowed
            .checked_add(amount)
            .ok_or(ForgeError::ArithmeticOverflow)?;
        let account = self.borrowers.entry(borrower).or_default();
        account.amount_borrowed = account
            .amount_borrowed
            .checked_add(amount)
            .ok_or(ForgeError::ArithmeticOverflow)?;

        info!(%borrower, amount, total_borrowed = self.total_borrowed, "usdc borrowed");
        Ok(())
    }

    /// Reverses a borrow whose settlement never landed. No interest is due.
    pub fn cancel_borrow(&mut self, borrower: Pubkey, amount: u64) -> ForgeResult<()> {
        self.reduce_debt(borrower, amount)?;
        warn!(%borrower, amount, "borrow reservation released");
        Ok(())
    }

    /// Repays `principal` plus `interest`. Interest, net of the lending
    /// skim, becomes lender liquidity.
    pub fn repay(&mut self, borrower: Pubkey, principal: u64, interest: u64) -> ForgeResult<RepayReceipt> {
        self.reduce_debt(borrower, principal)?;
        let receipt = self.book_interest(principal, interest, 0)?;
        info!(
            %borrower,
            principal,
            interest,
            remaining_debt = self.debt_of(&borrower),
            "usdc repaid"
        );
        Ok(receipt)
    }

    /// Closes a debt of `principal` plus `interest` from `recovered` USDC.
    /// Recovery pays principal first, then interest. Interest that was paid
    /// is skimmed like a normal repay; principal that was not is taken out of
    /// lender liquidity. Everything unpaid is recorded as bad debt.
    pub fn settle_with_shortfall(
        &mut self,
        borrower: Pubkey,
        principal: u64,
        interest: u64,
        recovered: u64,
    ) -> ForgeResult<RepayReceipt> {
        self.reduce_debt(borrower, principal)?;

        let principal_paid = recovered.min(principal);
        let interest_paid = recovered.saturating_sub(principal).min(interest);
        let principal_lost = principal - principal_paid;
        let written_off = principal_lost
            .checked_add(interest - interest_paid)
            .ok_or(ForgeError::ArithmeticOverflow)?;

        self.total_liquidity = self.total_liquidity.saturating_sub(principal_lost);
        self.bad_debt = self
            .bad_debt
            .checked_add(written_off)
            .ok_or(ForgeError::ArithmeticOverflow)?;
        let receipt = self.book_interest(principal_paid, interest_paid, written_off)?;
        if written_off > 0 {
            warn!(%borrower, principal, interest, recovered, written_off, "debt written off");
        }
        Ok(receipt)
    }

    fn book_interest(&mut self, principal: u64, interest: u64, written_off: u64) -> ForgeResult<RepayReceipt> {
        let skim = self.lending_yield_fee.apply(interest)?;
        self.total_liquidity = self
            .total_liquidity
            .checked_add(skim.net_amount)
            .ok_or(ForgeError::ArithmeticOverflow)?;
        self.protocol_fees = self
            .protocol_fees
            .checked_add(skim.fee_amount)
            .ok_or(ForgeError::ArithmeticOverflow)?;
        Ok(RepayReceipt {
            principal,
            interest_to_lenders: skim.net_amount,
            protocol_fee: skim.fee_amount,
            written_off,
        })
    }

    fn reduce_debt(&mut self, borrower: Pubkey, amount: u64) -> ForgeResult<()> {
        let debt = self.debt_of(&borrower);
        if amount > debt {
            return Err(ForgeError::InvalidAmount(format!(
                "repay amount {} exceeds debt {}",
                amount, debt
            )));
        }
        self.total_borrowed = self.total_borrowed.saturating_sub(amount);
        if let Some(account) = self.borrowers.get_mut(&borrower) {
            account.amount_borrowed -= amount;
            if account.amount_borrowed == 0 {
                self.borrowers.remove(&borrower);
            }
        }
        Ok(())
    }

    pub fn utilization_bps(&self) -> u64 {
        if self.total_liquidity == 0 {
            return 0;
        }
        forge_core::math::mul_div(self.total_borrowed, BPS_SCALE, self.total_liquidity)
            .unwrap_or(BPS_SCALE)
    }

    pub fn stats(&self) -> PoolStats {
        let utilization_bps = self.utilization_bps();
        let supply_apy = self.borrow_rate.as_fraction()
            * (utilization_bps as f64 / BPS_SCALE as f64)
            * (1.0 - self.lending_yield_fee.as_fraction());
        PoolStats {
            total_liquidity: self.total_liquidity,
            total_borrowed: self.total_borrowed,
            available_liquidity: self.available_liquidity(),
            utilization_bps,
            borrow_rate_bps: self.borrow_rate.bps(),
            supply_apy,
            protocol_fees: self.protocol_fees,
            bad_debt: self.bad_debt,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const USDC: u64 = 1_000_000;

    fn pool_with(liquidity: u64, reserve: u64) -> (LendingPool, Pubkey) {
        let mut pool = LendingPool::new(&FeeSchedule::STANDARD, reserve);
        let lender = Pubkey::new_unique();
        pool.deposit(lender, liquidity).unwrap();
        (pool, lender)
    }

    #[test]
    fn borrow_respects_minimum_reserve() {
        let (mut pool, _) = pool_with(10_000 * USDC, 1_000 * USDC);
        let borrower = Pubkey::new_unique();
        assert_eq!(pool.available_liquidity(), 9_000 * USDC);

        let err = pool.borrow(borrower, 9_001 * USDC).unwrap_err();
        assert_eq!(
            err,
            ForgeError::InsufficientLiquidity {
                required: 9_001 * USDC,
                available: 9_000 * USDC
            }
        );
        pool.borrow(borrower, 9_000 * USDC).unwrap();
        assert_eq!(pool.available_liquidity(), 0);
        assert!(pool.total_borrowed <= pool.total_liquidity - pool.minimum_reserve);
    }

    #[test]
    fn interest_is_split_between_lenders_and_protocol() {
        let (mut pool, lender) = pool_with(10_000 * USDC, 0);
        let borrower = Pubkey::new_unique();
        pool.borrow(borrower, 2_000 * USDC).unwrap();

        let interest = accrued_interest(2_000 * USDC, pool.borrow_rate, SECONDS_PER_YEAR).unwrap();
        assert_eq!(interest, 200 * USDC);

        let receipt = pool.repay(borrower, 2_000 * USDC, interest).unwrap();
        assert_eq!(receipt.interest_to_lenders, 180 * USDC);
        assert_eq!(receipt.protocol_fee, 20 * USDC);
        assert_eq!(pool.total_borrowed, 0);
        assert_eq!(pool.debt_of(&borrower), 0);
        assert_eq!(pool.lender_balance(&lender).unwrap(), 10_180 * USDC);
    }

    #[test]
    fn repay_beyond_debt_is_rejected() {
        let (mut pool, _) = pool_with(1_000 * USDC, 0);
        let borrower = Pubkey::new_unique();
        pool.borrow(borrower, 100 * USDC).unwrap();
        assert!(matches!(
            pool.repay(borrower, 101 * USDC, 0),
            Err(ForgeError::InvalidAmount(_))
        ));
        assert_eq!(pool.total_borrowed, 100 * USDC);
    }

    #[test]
    fn cancelled_borrow_restores_pool() {
        let (mut pool, _) = pool_with(1_000 * USDC, 0);
        let borrower = Pubkey::new_unique();
        pool.borrow(borrower, 400 * USDC).unwrap();
        pool.cancel_borrow(borrower, 400 * USDC).unwrap();
        assert_eq!(pool.total_borrowed, 0);
        assert_eq!(pool.available_liquidity(), 1_000 * USDC);
    }

    #[test]
    fn withdrawal_bounded_by_available_liquidity() {
        let (mut pool, lender) = pool_with(1_000 * USDC, 0);
        pool.borrow(Pubkey::new_unique(), 700 * USDC).unwrap();
        let shares = pool.shares_of(&lender);
        assert!(matches!(
            pool.withdraw(lender, shares),
            Err(ForgeError::InsufficientLiquidity { .. })
        ));
        assert_eq!(pool.withdraw(lender, 300 * USDC).unwrap(), 300 * USDC);
        assert!(matches!(
            pool.withdraw(Pubkey::new_unique(), 1),
            Err(ForgeError::InsufficientBalance { .. })
        ));
    }

    #[test]
    fn principal_shortfall_is_written_off() {
        let (mut pool, _) = pool_with(1_000 * USDC, 0);
        let borrower = Pubkey::new_unique();
        pool.borrow(borrower, 500 * USDC).unwrap();
        let receipt = pool
            .settle_with_shortfall(borrower, 500 * USDC, 30 * USDC, 450 * USDC)
            .unwrap();
        assert_eq!(receipt.principal, 450 * USDC);
        assert_eq!(receipt.interest_to_lenders, 0);
        assert_eq!(receipt.written_off, 80 * USDC);
        assert_eq!(pool.total_borrowed, 0);
        assert_eq!(pool.total_liquidity, 950 * USDC);
        assert_eq!(pool.bad_debt, 80 * USDC);
        assert_eq!(pool.protocol_fees, 0);
    }

    #[test]
    fn partial_interest_is_skimmed_and_the_rest_written_off() {
        let (mut pool, lender) = pool_with(10_000 * USDC, 0);
        let borrower = Pubkey::new_unique();
        pool.borrow(borrower, 2_000 * USDC).unwrap();
        let receipt = pool
            .settle_with_shortfall(borrower, 2_000 * USDC, 200 * USDC, 2_100 * USDC)
            .unwrap();
        assert_eq!(receipt.principal, 2_000 * USDC);
        assert_eq!(receipt.interest_to_lenders, 90 * USDC);
        assert_eq!(receipt.protocol_fee, 10 * USDC);
        assert_eq!(receipt.written_off, 100 * USDC);
        assert_eq!(pool.bad_debt, 100 * USDC);
        assert_eq!(pool.protocol_fees, 10 * USDC);
        assert_eq!(pool.total_liquidity, 10_090 * USDC);
        assert_eq!(pool.lender_balance(&lender).unwrap(), 10_090 * USDC);
    }

    #[test]
    fn full_recovery_matches_repay() {
        let (mut settled, _) = pool_with(10_000 * USDC, 0);
        let (mut repaid, _) = pool_with(10_000 * USDC, 0);
        let borrower = Pubkey::new_unique();
        settled.borrow(borrower, 2_000 * USDC).unwrap();
        repaid.borrow(borrower, 2_000 * USDC).unwrap();

        let a = settled
            .settle_with_shortfall(borrower, 2_000 * USDC, 200 * USDC, 2_200 * USDC)
            .unwrap();
        let b = repaid.repay(borrower, 2_000 * USDC, 200 * USDC).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.written_off, 0);
        assert_eq!(settled.bad_debt, 0);
        assert_eq!(settled.total_liquidity, repaid.total_liquidity);
        assert_eq!(settled.protocol_fees, repaid.protocol_fees);
    }

    #[test]
    fn stats_report_utilization() {
        let (mut pool, _) = pool_with(1_000 * USDC, 0);
        pool.borrow(Pubkey::new_unique(), 500 * USDC).unwrap();
        let stats = pool.stats();
        assert_eq!(stats.utilization_bps, 5_000);
        assert!((stats.supply_apy - 0.045).abs() < 1e-12);
    }

    proptest! {
        #[test]
        fn borrowed_never_exceeds_lendable(
            reserve in 0u64..1_000,
            ops in proptest::collection::vec((0u8..2, 1u64..5_000), 1..40)
        ) {
            let (mut pool, _) = pool_with(10_000, reserve);
            let borrower = Pubkey::new_unique();
            for (op, amount) in ops {
                match op {
                    0 => { let _ = pool.borrow(borrower, amount); }
                    _ => {
                        let principal = amount.min(pool.debt_of(&borrower));
                        if principal > 0 {
                            pool.repay(borrower, principal, 0).unwrap();
                        }
                    }
                }
                prop_assert!(pool.total_borrowed <= pool.total_liquidity - pool.minimum_reserve);
            }
        }
    }
}
