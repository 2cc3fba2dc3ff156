//! Forge crucibles: receipt-token vaults, LP and leveraged positions, and
//! the engine that drives them against an external settlement layer.

pub mod ctoken;
pub mod engine;
pub mod lp;
pub mod lvf;
pub mod reconcile;
pub mod registry;
pub mod settlement;
pub mod state;

pub use ctoken::{ArbitrageOutcome, ExchangeRateLedger, UnwrapOutcome, WrapOutcome};
pub use engine::{EngineBuilder, ForgeEngine};
pub use lp::{LpCloseQuote, LpOpenQuote};
pub use lvf::{
    effective_apy, health_factor, HealthStatus, LeverageFactor, LeveragedCloseQuote,
    LeveragedOpenQuote, LiquidationQuote, PositionHealth,
};
pub use reconcile::{ReconcileHandle, ReconcileRequest, Reconciler};
pub use registry::{PositionRegistry, SyncState, Tracked};
pub use settlement::{
    CrucibleSnapshot, ExternalState, SettlementAction, SettlementError, SettlementLayer,
    SettlementReceipt, SettlementRequest,
};
pub use state::{CloseSummary, Crucible, LeveragedPosition, LpPosition, Position, PositionKey, WrapHolding};
