use std::collections::HashMap;

/// Natural precision of a token and the largest display amount we
/// believe is real. Anything above the threshold was recorded in sub-units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenUnit {
    pub decimals: u8,
    pub sanity_threshold: f64,
}

impl TokenUnit {
    pub const fn new(decimals: u8, sanity_threshold: f64) -> Self {
        Self {
            decimals,
            sanity_threshold,
        }
    }
}

const BASE_TOKEN_UNIT: TokenUnit = TokenUnit::new(9, 1_000_000.0);
const USDC_UNIT: TokenUnit = TokenUnit::new(6, 1_000_000_000.0);

#[derive(Debug, Clone)]
pub struct UnitTable {
    units: HashMap<String, TokenUnit>,
    fallback: TokenUnit,
}

impl Default for UnitTable {
    fn default() -> Self {
        let units = [
            ("SOL", BASE_TOKEN_UNIT),
            ("cSOL", BASE_TOKEN_UNIT),
            ("FORGE", BASE_TOKEN_UNIT),
            ("cFORGE", BASE_TOKEN_UNIT),
            ("USDC", USDC_UNIT),
        ]
        .into_iter()
        .map(|(symbol, unit)| (symbol.to_string(), unit))
        .collect();
        Self {
            units,
            fallback: BASE_TOKEN_UNIT,
        }
    }
}

impl UnitTable {
    pub fn with(mut self, symbol: impl Into<String>, unit: TokenUnit) -> Self {
        self.units.insert(symbol.into(), unit);
        self
    }

    pub fn unit(&self, symbol: &str) -> TokenUnit {
        self.units.get(symbol).copied().unwrap_or(self.fallback)
    }

    /// Brings a recorded amount back to display units before it is priced.
    pub fn normalize(&self, symbol: &str, amount: f64) -> f64 {
        let unit = self.unit(symbol);
        if amount.abs() > unit.sanity_threshold {
            tracing::debug!(token = symbol, amount, decimals = unit.decimals, "rescaling sub-unit amount");
            amount / 10f64.powi(unit.decimals as i32)
        } else {
            amount
        }
    }
}
