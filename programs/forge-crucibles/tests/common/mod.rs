#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anchor_lang::prelude::Pubkey;
use async_trait::async_trait;
use forge_core::{
    BroadcastEventBus, EngineConfig, Identity, ManualClock, MemoryStore, StaticPriceFeed,
};
use forge_crucibles::{
    Crucible, ExternalState, ForgeEngine, SettlementError, SettlementLayer, SettlementReceipt,
    SettlementRequest,
};

pub const SOL: u64 = 1_000_000_000;
pub const USDC: u64 = 1_000_000;
pub const GENESIS: i64 = 1_700_000_000;

/// Settlement double: accepts by default, fails or hangs on request and
/// serves whatever external state the test sets.
#[derive(Default)]
pub struct ScriptedSettlement {
    failures: Mutex<VecDeque<SettlementError>>,
    hang: AtomicBool,
    submitted: Mutex<Vec<SettlementRequest>>,
    states: Mutex<HashMap<(Pubkey, Pubkey), ExternalState>>,
    fetch_failures: AtomicU32,
    fetches: AtomicU32,
    slot: AtomicU64,
}

impl ScriptedSettlement {
    pub fn fail_next(&self, err: SettlementError) {
        self.failures.lock().unwrap().push_back(err);
    }

    pub fn hang(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    pub fn submitted(&self) -> Vec<SettlementRequest> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn set_state(&self, owner: Pubkey, crucible: Pubkey, state: ExternalState) {
        self.states.lock().unwrap().insert((owner, crucible), state);
    }

    pub fn fail_fetches(&self, count: u32) {
        self.fetch_failures.store(count, Ordering::SeqCst);
    }

    pub fn fetches(&self) -> u32 {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SettlementLayer for ScriptedSettlement {
    async fn submit(&self, request: SettlementRequest) -> Result<SettlementReceipt, SettlementError> {
        self.submitted.lock().unwrap().push(request.clone());
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        let slot = self.slot.fetch_add(1, Ordering::SeqCst);
        Ok(SettlementReceipt {
            signature: format!("sig-{}", request.op_id),
            slot,
        })
    }

    async fn fetch_state(&self, owner: Pubkey, crucible: Pubkey) -> Result<ExternalState, SettlementError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let remaining = self.fetch_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fetch_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(SettlementError::Unavailable("rpc node offline".into()));
        }
        Ok(self
            .states
            .lock()
            .unwrap()
            .get(&(owner, crucible))
            .cloned()
            .unwrap_or_default())
    }
}

pub struct Harness {
    pub engine: Arc<ForgeEngine>,
    pub settlement: Arc<ScriptedSettlement>,
    pub prices: Arc<StaticPriceFeed>,
    pub store: Arc<MemoryStore>,
    pub events: Arc<BroadcastEventBus>,
    pub clock: Arc<ManualClock>,
    pub crucible: Pubkey,
}

pub fn identity() -> Identity {
    Identity::new(Pubkey::new_unique())
}

pub fn sol_crucible(id: Pubkey) -> Crucible {
    Crucible::new(id, "SOL", "cSOL", 9, 0.08, GENESIS)
}

pub async fn harness() -> Harness {
    harness_with(EngineConfig::default(), Arc::new(MemoryStore::new())).await
}

pub async fn harness_with(config: EngineConfig, store: Arc<MemoryStore>) -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let settlement = Arc::new(ScriptedSettlement::default());
    let prices = Arc::new(StaticPriceFeed::new([
        ("SOL".to_string(), 200.0),
        ("USDC".to_string(), 1.0),
    ]));
    let events = Arc::new(BroadcastEventBus::new(64));
    let clock = Arc::new(ManualClock::new(GENESIS));
    let engine = ForgeEngine::builder(settlement.clone(), prices.clone())
        .store(store.clone())
        .events(events.clone())
        .clock(clock.clone())
        .config(config)
        .build()
        .expect("valid engine config");

    let crucible = Pubkey::new_unique();
    assert!(engine.register_crucible(sol_crucible(crucible)).await);

    Harness {
        engine: Arc::new(engine),
        settlement,
        prices,
        store,
        events,
        clock,
        crucible,
    }
}

impl Harness {
    /// Seeds the pool with a lender so leveraged positions can borrow.
    pub async fn fund_pool(&self, amount: u64) -> Identity {
        let lender = identity();
        self.engine.supply_liquidity(&lender, amount).await.unwrap();
        lender
    }
}
