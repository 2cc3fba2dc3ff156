use thiserror::Error;

pub type ForgeResult<T> = std::result::Result<T, ForgeError>;

/// Every failure the engine can surface to a caller.
///
/// Validation variants are produced before any state is touched. Any error
/// raised after an optimistic local update is returned only once that
/// update has been rolled back.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ForgeError {
    #[error("Insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: u64, available: u64 },

    #[error("Insufficient liquidity: required {required}, available {available}")]
    InsufficientLiquidity { required: u64, available: u64 },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("Position not found: {0}")]
    PositionNotFound(String),

    #[error("Position already closed: {0}")]
    AlreadyClosed(String),

    #[error("Position {position} is not owned by {caller}")]
    NotOwner { position: String, caller: String },

    #[error("No free position slot: all {cap} nonces are in use")]
    NoFreeSlot { cap: u64 },

    #[error("Price unavailable for {token}")]
    PriceUnavailable { token: String },

    #[error("Settlement failed: {0}")]
    SettlementFailed(String),

    #[error("LP legs differ by {deviation_bps} bps, tolerance is {max_bps} bps")]
    ToleranceExceeded { deviation_bps: u64, max_bps: u64 },

    #[error("Invalid LP leg amount: base {base}, usdc {usdc}")]
    InvalidLegAmount { base: u64, usdc: u64 },

    #[error("Invalid leverage factor {0} (scaled by 100)")]
    InvalidLeverage(u64),

    #[error("Health factor {health:.4} is below the required {minimum:.4}")]
    HealthTooLow { health: f64, minimum: f64 },

    #[error("Position is not liquidatable: health factor {health:.4}")]
    PositionNotLiquidatable { health: f64 },

    #[error("Crucible not found: {0}")]
    CrucibleNotFound(String),

    #[error("Arithmetic overflow")]
    ArithmeticOverflow,

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<std::io::Error> for ForgeError {
    fn from(err: std::io::Error) -> Self {
        ForgeError::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for ForgeError {
    fn from(err: serde_json::Error) -> Self {
        ForgeError::InvalidConfig(err.to_string())
    }
}
