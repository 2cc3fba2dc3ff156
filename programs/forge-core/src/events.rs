use anchor_lang::prelude::{borsh, AnchorDeserialize, AnchorSerialize, Pubkey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, AnchorSerialize, AnchorDeserialize)]
pub enum PositionKind {
    Lp,
    Leveraged,
}

impl PositionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionKind::Lp => "lp",
            PositionKind::Leveraged => "leveraged",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, AnchorSerialize, AnchorDeserialize)]
pub struct EventKey {
    pub owner: Pubkey,
    pub crucible_id: Pubkey,
    pub base_token_symbol: String,
}

#[derive(Debug, Clone, PartialEq, AnchorSerialize, AnchorDeserialize)]
pub enum DomainEvent {
    PositionOpened {
        key: EventKey,
        kind: PositionKind,
        nonce: u64,
        base_amount: u64,
        usdc_amount: u64,
        borrowed_usdc: u64,
    },
    PositionClosed {
        key: EventKey,
        kind: PositionKind,
        nonce: u64,
        base_returned: u64,
        usdc_returned: u64,
        yield_component: u64,
        fees_charged: u64,
        liquidated: bool,
    },
    BalanceChanged {
        key: EventKey,
        receipt_balance: u64,
        exchange_rate: u64,
    },
}

impl DomainEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::PositionOpened { .. } => "positionOpened",
            DomainEvent::PositionClosed { .. } => "positionClosed",
            DomainEvent::BalanceChanged { .. } => "balanceChanged",
        }
    }

    pub fn key(&self) -> &EventKey {
        match self {
            DomainEvent::PositionOpened { key, .. }
            | DomainEvent::PositionClosed { key, .. }
            | DomainEvent::BalanceChanged { key, .. } => key,
        }
    }
}
