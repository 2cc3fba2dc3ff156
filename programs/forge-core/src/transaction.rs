use std::collections::VecDeque;

use anchor_lang::prelude::{borsh, AnchorDeserialize, AnchorSerialize, Pubkey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, AnchorSerialize, AnchorDeserialize)]
pub enum TransactionKind {
    Deposit,
    Withdraw,
    Wrap,
    Unwrap,
}

impl TransactionKind {
    /// Deposits and wraps add value to the portfolio.
    pub fn is_inflow(&self) -> bool {
        matches!(self, TransactionKind::Deposit | TransactionKind::Wrap)
    }
}

/// Immutable activity record. Amounts are display units of `token`.
#[derive(Debug, Clone, PartialEq, AnchorSerialize, AnchorDeserialize)]
pub struct Transaction {
    pub kind: TransactionKind,
    pub amount: f64,
    pub token: String,
    pub crucible_id: Pubkey,
    pub timestamp: i64,
    pub borrowed_amount: Option<f64>,
    pub leverage: Option<f64>,
    pub usdc_deposited: Option<f64>,
    pub fee: Option<f64>,
    pub usd_value: Option<f64>,
    pub yield_amount: Option<f64>,
}

impl Transaction {
    pub fn new(
        kind: TransactionKind,
        amount: f64,
        token: impl Into<String>,
        crucible_id: Pubkey,
        timestamp: i64,
    ) -> Self {
        Self {
            kind,
            amount,
            token: token.into(),
            crucible_id,
            timestamp,
            borrowed_amount: None,
            leverage: None,
            usdc_deposited: None,
            fee: None,
            usd_value: None,
            yield_amount: None,
        }
    }

    pub fn with_fee(mut self, fee: f64) -> Self {
        self.fee = Some(fee);
        self
    }

    pub fn with_usd_value(mut self, usd_value: f64) -> Self {
        self.usd_value = Some(usd_value);
        self
    }

    pub fn with_leverage(mut self, leverage: f64, borrowed_amount: f64) -> Self {
        self.leverage = Some(leverage);
        self.borrowed_amount = Some(borrowed_amount);
        self
    }

    pub fn with_usdc_deposited(mut self, usdc: f64) -> Self {
        self.usdc_deposited = Some(usdc);
        self
    }

    pub fn with_yield(mut self, yield_amount: f64) -> Self {
        self.yield_amount = Some(yield_amount);
        self
    }
}

/// Append-only log that keeps the most recent `capacity` records.
#[derive(Debug, Clone)]
pub struct TransactionLog {
    capacity: usize,
    records: VecDeque<Transaction>,
}

impl TransactionLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            records: VecDeque::with_capacity(capacity),
        }
    }

    pub fn from_records(capacity: usize, records: Vec<Transaction>) -> Self {
        let mut log = Self::new(capacity);
        for record in records {
            log.push(record);
        }
        log
    }

    pub fn push(&mut self, record: Transaction) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Transaction> {
        self.records.iter()
    }

    pub fn to_vec(&self) -> Vec<Transaction> {
        self.records.iter().cloned().collect()
    }
}
