//! Shared building blocks for the Forge accounting engine.
//!
//! Everything in this crate is either pure arithmetic (fees, fixed-point
//! conversions) or a capability boundary the engine is handed at
//! construction time (prices, persistence, events, time).

pub mod capabilities;
pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod fees;
pub mod identity;
pub mod math;
pub mod transaction;

pub use capabilities::{
    load_records, save_records, BroadcastEventBus, Clock, EventBus, ManualClock, MemoryStore,
    PersistentStore, PriceFeed, RecordKind, StaticPriceFeed, StoreKey, SystemClock,
};
pub use config::EngineConfig;
pub use error::{ForgeError, ForgeResult};
pub use events::{DomainEvent, EventKey, PositionKind};
pub use fees::{CloseFee, FeeRate, FeeSchedule, FeeSplit, ShareSplit};
pub use identity::{FixedIdentity, Identity, IdentityChain, IdentityProvider};
pub use math::Price;
pub use transaction::{Transaction, TransactionKind, TransactionLog};
