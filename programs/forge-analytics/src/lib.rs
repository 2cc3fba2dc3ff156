//! Portfolio analytics folded from an owner's transaction log.
//!
//! Analytics are best effort: a missing price or a malformed record
//! degrades that record's contribution to zero instead of failing.

pub mod units;

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, NaiveDate};
use forge_core::{PriceFeed, Transaction, TransactionKind};
use serde::Serialize;
use tracing::warn;

pub use units::{TokenUnit, UnitTable};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TokenFlow {
    pub deposited: f64,
    pub withdrawn: f64,
    pub net: f64,
    pub net_usd: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PortfolioAnalytics {
    pub total_deposits_usd: f64,
    pub total_withdrawals_usd: f64,
    pub deposit_count: usize,
    pub withdrawal_count: usize,
    pub average_deposit_usd: f64,
    pub average_withdrawal_usd: f64,
    pub net_volume_usd: f64,
    /// Signed USD volume per UTC day: inflows positive, outflows negative.
    pub daily_volume: BTreeMap<NaiveDate, f64>,
    pub token_flows: BTreeMap<String, TokenFlow>,
    pub total_yield_usd: f64,
    pub withdrawn_yield_usd: f64,
    pub total_fees_usd: f64,
    /// Yield relative to deposited value.
    pub apy_earned: f64,
}

impl PortfolioAnalytics {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[derive(Debug, Clone, Default)]
pub struct AnalyticsAggregator {
    units: UnitTable,
}

impl AnalyticsAggregator {
    pub fn new(units: UnitTable) -> Self {
        Self { units }
    }

    /// Fetches one quote per distinct token, then folds the log.
    pub async fn aggregate_with_feed(
        &self,
        feed: &dyn PriceFeed,
        transactions: &[Transaction],
    ) -> PortfolioAnalytics {
        let tokens: HashSet<&str> = transactions.iter().map(|t| t.token.as_str()).collect();
        let mut prices = HashMap::new();
        for token in tokens {
            match feed.price_of(token).await {
                Ok(price) if price.is_finite() && price >= 0.0 => {
                    prices.insert(token.to_string(), price);
                }
                Ok(price) => warn!(token, price, "ignoring invalid price for analytics"),
                Err(err) => warn!(token, error = %err, "price unavailable for analytics"),
            }
        }
        self.aggregate(transactions, &prices)
    }

    pub fn aggregate(
        &self,
        transactions: &[Transaction],
        prices: &HashMap<String, f64>,
    ) -> PortfolioAnalytics {
        let mut report = PortfolioAnalytics::default();

        for tx in transactions {
            let price = prices.get(&tx.token).copied().unwrap_or(0.0);
            let amount = self.clean(&tx.token, tx.amount);
            let value = self.usd_value(tx, amount, price);
            let inflow = tx.kind.is_inflow();

            if inflow {
                report.total_deposits_usd += value;
                report.deposit_count += 1;
            } else {
                report.total_withdrawals_usd += value;
                report.withdrawal_count += 1;
            }

            let signed = if inflow { value } else { -value };
            match day_of(tx.timestamp) {
                Some(day) => *report.daily_volume.entry(day).or_insert(0.0) += signed,
                None => warn!(timestamp = tx.timestamp, "transaction timestamp out of range"),
            }

            let flow = report.token_flows.entry(tx.token.clone()).or_default();
            if inflow {
                flow.deposited += amount;
                flow.net += amount;
            } else {
                flow.withdrawn += amount;
                flow.net -= amount;
            }
            flow.net_usd += signed;

            if let Some(yield_amount) = tx.yield_amount {
                let yield_usd = self.clean(&tx.token, yield_amount) * price;
                report.total_yield_usd += yield_usd;
                if !inflow {
                    report.withdrawn_yield_usd += yield_usd;
                }
            }
            if let Some(fee) = tx.fee {
                report.total_fees_usd += self.clean(&tx.token, fee) * price;
            }
        }

        report.net_volume_usd = report.total_deposits_usd - report.total_withdrawals_usd;
        report.average_deposit_usd = average(report.total_deposits_usd, report.deposit_count);
        report.average_withdrawal_usd = average(report.total_withdrawals_usd, report.withdrawal_count);
        if report.total_deposits_usd > 0.0 {
            report.apy_earned = report.total_yield_usd / report.total_deposits_usd;
        }
        report
    }

    fn clean(&self, token: &str, amount: f64) -> f64 {
        if !amount.is_finite() {
            warn!(token, "non-finite amount in transaction log");
            return 0.0;
        }
        self.units.normalize(token, amount)
    }

    /// An explicit USD value on the record wins over `amount * price`.
    fn usd_value(&self, tx: &Transaction, amount: f64, price: f64) -> f64 {
        match tx.usd_value {
            Some(value) if value.is_finite() => value,
            _ => amount * price,
        }
    }
}

fn average(total: f64, count: usize) -> f64 {
    if count == 0 {
        0.0
    } else {
        total / count as f64
    }
}

fn day_of(timestamp: i64) -> Option<NaiveDate> {
    DateTime::from_timestamp(timestamp, 0).map(|dt| dt.date_naive())
}
