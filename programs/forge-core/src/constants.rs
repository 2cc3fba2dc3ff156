use crate::fees::FeeRate;

/// Fixed-point scale of the receipt exchange rate (1.0 = 1_000_000).
pub const RATE_SCALE: u64 = 1_000_000;
/// Fixed-point scale of prices, quoted in USDC (1.0 = 1_000_000).
pub const PRICE_SCALE: u64 = 1_000_000;
pub const BPS_SCALE: u64 = 10_000;
/// Leverage factors are scaled by 100 (150 = 1.5x).
pub const LEVERAGE_SCALE: u64 = 100;

pub const USDC_DECIMALS: u8 = 6;
pub const SECONDS_PER_YEAR: u64 = 31_536_000;

pub const WRAP_FEE_RATE: FeeRate = FeeRate::from_bps(50);
pub const UNWRAP_FEE_RATE: FeeRate = FeeRate::from_bps(75);
pub const UNWRAP_FEE_RATE_AFTER_COOLDOWN: FeeRate = FeeRate::from_bps(30);
pub const UNWRAP_COOLDOWN_SECS: i64 = 5 * 24 * 60 * 60;

pub const INFERNO_OPEN_FEE_RATE: FeeRate = FeeRate::from_bps(100);
pub const INFERNO_CLOSE_FEE_RATE: FeeRate = FeeRate::from_bps(200);
pub const INFERNO_YIELD_FEE_RATE: FeeRate = FeeRate::from_bps(1_000);
pub const LIQUIDATION_FEE_RATE: FeeRate = FeeRate::from_bps(1_000);
pub const LENDING_YIELD_FEE_RATE: FeeRate = FeeRate::from_bps(1_000);
pub const BORROW_RATE: FeeRate = FeeRate::from_bps(1_000);

/// Share of every fee that stays in the vault; the remainder goes to the treasury.
pub const VAULT_FEE_SHARE: FeeRate = FeeRate::from_bps(8_000);
/// Receipt reward paid to whoever deposits arbitrage profit.
pub const ARBITRAGE_REWARD_RATE: FeeRate = FeeRate::from_bps(100);

/// 1.045 at `RATE_SCALE`.
pub const INITIAL_EXCHANGE_RATE: u64 = 1_045_000;
/// 2.0x at `LEVERAGE_SCALE`.
pub const MAX_LEVERAGE: u64 = 200;
pub const ALLOWED_LEVERAGE: [u64; 3] = [100, 150, 200];
pub const MAX_POSITIONS_PER_OWNER: u64 = 50;

/// Reported for positions with no debt.
pub const INFINITE_HEALTH: f64 = 999.0;

pub const MIN_PRICE_USD: f64 = 0.000001;
pub const MAX_PRICE_USD: f64 = 1_000_000.0;

pub const MIN_LP_LEG: u64 = 1_000;
pub const MAX_BASE_LEG: u64 = 1_000_000_000_000_000_000;
pub const MAX_USDC_LEG: u64 = 1_000_000_000_000_000;
