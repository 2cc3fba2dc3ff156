use std::fmt;

use anchor_lang::prelude::{borsh, AnchorDeserialize, AnchorSerialize, Pubkey};
use forge_core::{EventKey, ForgeError, ForgeResult, PositionKind};
use serde::Serialize;

use crate::ctoken::ExchangeRateLedger;

/// Vault for one base asset.
#[derive(Debug, Clone, PartialEq, AnchorSerialize, AnchorDeserialize)]
pub struct Crucible {
    pub id: Pubkey,
    pub base_token: String,
    pub receipt_symbol: String,
    pub base_decimals: u8,
    /// Annualized fraction, e.g. 0.08.
    pub base_apy: f64,
    pub ledger: ExchangeRateLedger,
    /// Treasury share of base-denominated fees.
    pub protocol_fees_base: u64,
    pub vault_fees_usdc: u64,
    pub protocol_fees_usdc: u64,
    pub total_lp_token_supply: u64,
    pub total_lp_positions: u64,
    pub total_leveraged_positions: u64,
    pub created_at: i64,
}

impl Crucible {
    pub fn new(
        id: Pubkey,
        base_token: impl Into<String>,
        receipt_symbol: impl Into<String>,
        base_decimals: u8,
        base_apy: f64,
        created_at: i64,
    ) -> Self {
        Self {
            id,
            base_token: base_token.into(),
            receipt_symbol: receipt_symbol.into(),
            base_decimals,
            base_apy,
            ledger: ExchangeRateLedger::new(),
            protocol_fees_base: 0,
            vault_fees_usdc: 0,
            protocol_fees_usdc: 0,
            total_lp_token_supply: 0,
            total_lp_positions: 0,
            total_leveraged_positions: 0,
            created_at,
        }
    }

    pub fn event_key(&self, owner: Pubkey) -> EventKey {
        EventKey {
            owner,
            crucible_id: self.id,
            base_token_symbol: self.base_token.clone(),
        }
    }
}

/// Receipt tokens held by one owner in one crucible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AnchorSerialize, AnchorDeserialize)]
pub struct WrapHolding {
    pub receipt_balance: u64,
    /// Balance-weighted deposit time; drives the unwrap cooldown.
    pub deposited_at: i64,
}

impl WrapHolding {
    /// Adds `minted` receipts at `now`. The deposit time moves toward `now`
    /// in proportion to the new receipts' share of the balance, so a small
    /// top-up barely delays the cooldown on what was already held.
    pub fn top_up(current: Option<WrapHolding>, minted: u64, now: i64) -> ForgeResult<WrapHolding> {
        let Some(current) = current.filter(|h| h.receipt_balance > 0) else {
            return Ok(WrapHolding {
                receipt_balance: minted,
                deposited_at: now,
            });
        };
        let receipt_balance = current
            .receipt_balance
            .checked_add(minted)
            .ok_or(ForgeError::ArithmeticOverflow)?;
        let elapsed = now.saturating_sub(current.deposited_at).max(0) as u128;
        let shift = elapsed
            .checked_mul(minted as u128)
            .ok_or(ForgeError::ArithmeticOverflow)?
            / receipt_balance as u128;
        Ok(WrapHolding {
            receipt_balance,
            deposited_at: current.deposited_at + shift as i64,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, AnchorSerialize, AnchorDeserialize)]
pub struct PositionKey {
    pub kind: PositionKind,
    pub owner: Pubkey,
    pub crucible: Pubkey,
    pub nonce: u64,
}

impl PositionKey {
    pub fn new(kind: PositionKind, owner: Pubkey, crucible: Pubkey, nonce: u64) -> Self {
        Self {
            kind,
            owner,
            crucible,
            nonce,
        }
    }
}

impl fmt::Display for PositionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}:{}", self.kind.as_str(), self.owner, self.crucible, self.nonce)
    }
}

#[derive(Debug, Clone, PartialEq, AnchorSerialize, AnchorDeserialize)]
pub struct LpPosition {
    pub owner: Pubkey,
    pub crucible_id: Pubkey,
    pub base_token: String,
    pub nonce: u64,
    /// Gross base leg deposited.
    pub base_amount: u64,
    /// Gross USDC leg deposited.
    pub usdc_amount: u64,
    /// Receipts minted for the base leg after the open fee.
    pub receipt_amount: u64,
    /// USDC leg after the open fee.
    pub usdc_net: u64,
    pub entry_price: u64,
    pub entry_exchange_rate: u64,
    pub lp_token_amount: u64,
    pub opened_at: i64,
    pub closed_at: Option<i64>,
    pub is_open: bool,
}

impl LpPosition {
    pub fn key(&self) -> PositionKey {
        PositionKey::new(PositionKind::Lp, self.owner, self.crucible_id, self.nonce)
    }
}

#[derive(Debug, Clone, PartialEq, AnchorSerialize, AnchorDeserialize)]
pub struct LeveragedPosition {
    pub owner: Pubkey,
    pub crucible_id: Pubkey,
    pub base_token: String,
    pub nonce: u64,
    /// Base units supplied by the owner, before the open fee.
    pub collateral: u64,
    /// Receipts minted for the collateral after the open fee.
    pub receipt_amount: u64,
    /// Scaled by 100 (150 = 1.5x).
    pub leverage_factor: u64,
    pub borrowed_usdc: u64,
    pub entry_price: u64,
    pub entry_exchange_rate: u64,
    pub opened_at: i64,
    pub closed_at: Option<i64>,
    pub is_open: bool,
}

impl LeveragedPosition {
    pub fn key(&self) -> PositionKey {
        PositionKey::new(PositionKind::Leveraged, self.owner, self.crucible_id, self.nonce)
    }
}

#[derive(Debug, Clone, PartialEq, AnchorSerialize, AnchorDeserialize)]
pub enum Position {
    Lp(LpPosition),
    Leveraged(LeveragedPosition),
}

impl Position {
    pub fn key(&self) -> PositionKey {
        match self {
            Position::Lp(p) => p.key(),
            Position::Leveraged(p) => p.key(),
        }
    }

    pub fn owner(&self) -> Pubkey {
        match self {
            Position::Lp(p) => p.owner,
            Position::Leveraged(p) => p.owner,
        }
    }

    pub fn is_open(&self) -> bool {
        match self {
            Position::Lp(p) => p.is_open,
            Position::Leveraged(p) => p.is_open,
        }
    }

    pub fn mark_closed(&mut self, at: i64) {
        match self {
            Position::Lp(p) => {
                p.is_open = false;
                p.closed_at = Some(at);
            }
            Position::Leveraged(p) => {
                p.is_open = false;
                p.closed_at = Some(at);
            }
        }
    }
}

/// What a close hands back to the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CloseSummary {
    pub base_amount_returned: u64,
    pub usdc_amount_returned: u64,
    /// Exchange-rate growth on the base leg, in base units, before fees.
    pub yield_component: u64,
    /// Base-denominated fees.
    pub fees_charged: u64,
    pub usdc_fees_charged: u64,
}
