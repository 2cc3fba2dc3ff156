//! Boundary to the external settlement layer. Every engine mutation is
//! submitted as one opaque action; the layer answers with a receipt or an
//! error and can be queried for the authoritative state of an owner.

use anchor_lang::prelude::Pubkey;
use async_trait::async_trait;
use forge_core::ForgeError;
use serde::Serialize;
use thiserror::Error;

use crate::state::{Position, WrapHolding};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SettlementAction {
    Wrap {
        amount: u64,
        receipts_minted: u64,
    },
    Unwrap {
        receipts_burned: u64,
        base_returned: u64,
    },
    OpenLp {
        nonce: u64,
        base_amount: u64,
        usdc_amount: u64,
        lp_tokens: u64,
    },
    CloseLp {
        nonce: u64,
        base_returned: u64,
        usdc_returned: u64,
    },
    OpenLeveraged {
        nonce: u64,
        collateral: u64,
        leverage: u64,
        borrowed_usdc: u64,
    },
    CloseLeveraged {
        nonce: u64,
        base_returned: u64,
        repaid_usdc: u64,
    },
    Liquidate {
        nonce: u64,
        recovered_usdc: u64,
        base_returned: u64,
    },
    SupplyLiquidity {
        amount: u64,
    },
    WithdrawLiquidity {
        shares: u64,
        amount: u64,
    },
    DepositArbitrage {
        amount: u64,
        reward_receipts: u64,
    },
}

impl SettlementAction {
    pub fn name(&self) -> &'static str {
        match self {
            SettlementAction::Wrap { .. } => "wrap",
            SettlementAction::Unwrap { .. } => "unwrap",
            SettlementAction::OpenLp { .. } => "open_lp",
            SettlementAction::CloseLp { .. } => "close_lp",
            SettlementAction::OpenLeveraged { .. } => "open_leveraged",
            SettlementAction::CloseLeveraged { .. } => "close_leveraged",
            SettlementAction::Liquidate { .. } => "liquidate",
            SettlementAction::SupplyLiquidity { .. } => "supply_liquidity",
            SettlementAction::WithdrawLiquidity { .. } => "withdraw_liquidity",
            SettlementAction::DepositArbitrage { .. } => "deposit_arbitrage",
        }
    }
}

/// One submission to the settlement layer.
#[derive(Debug, Clone, PartialEq)]
pub struct SettlementRequest {
    pub op_id: u64,
    pub signer: Pubkey,
    pub crucible: Pubkey,
    pub action: SettlementAction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementReceipt {
    pub signature: String,
    pub slot: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettlementError {
    #[error("settlement rejected: {0}")]
    Rejected(String),
    #[error("settlement timed out")]
    Timeout,
    #[error("settlement layer unavailable: {0}")]
    Unavailable(String),
}

impl From<SettlementError> for ForgeError {
    fn from(err: SettlementError) -> Self {
        ForgeError::SettlementFailed(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrucibleSnapshot {
    pub exchange_rate: u64,
    pub total_receipt_supply: u64,
}

/// Authoritative state for one `(owner, crucible)` pair.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExternalState {
    pub crucible: Option<CrucibleSnapshot>,
    pub holding: Option<WrapHolding>,
    pub positions: Vec<Position>,
}

#[async_trait]
pub trait SettlementLayer: Send + Sync {
    async fn submit(&self, request: SettlementRequest) -> Result<SettlementReceipt, SettlementError>;

    async fn fetch_state(&self, owner: Pubkey, crucible: Pubkey) -> Result<ExternalState, SettlementError>;
}
