//! Capabilities handed to the engine at construction. The engine never
//! performs I/O itself; prices, storage, events and time all come through
//! these traits.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};

use anchor_lang::prelude::{AnchorDeserialize, AnchorSerialize, Pubkey};
use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};

use crate::error::{ForgeError, ForgeResult};
use crate::events::DomainEvent;

#[async_trait]
pub trait PriceFeed: Send + Sync {
    /// Current reference price of one whole `token` in USDC.
    async fn price_of(&self, token: &str) -> ForgeResult<f64>;
}

/// Price feed over a fixed table. Quotes can be replaced at runtime.
#[derive(Default)]
pub struct StaticPriceFeed {
    prices: RwLock<HashMap<String, f64>>,
}

impl StaticPriceFeed {
    pub fn new(prices: impl IntoIterator<Item = (String, f64)>) -> Self {
        Self {
            prices: RwLock::new(prices.into_iter().collect()),
        }
    }

    pub async fn set_price(&self, token: &str, price: f64) {
        self.prices.write().await.insert(token.to_string(), price);
    }

    pub async fn remove(&self, token: &str) {
        self.prices.write().await.remove(token);
    }
}

#[async_trait]
impl PriceFeed for StaticPriceFeed {
    async fn price_of(&self, token: &str) -> ForgeResult<f64> {
        self.prices
            .read()
            .await
            .get(token)
            .copied()
            .ok_or_else(|| ForgeError::PriceUnavailable {
                token: token.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RecordKind {
    Holding,
    LpPosition,
    LeveragedPosition,
    Transactions,
}

/// Store key: `(kind, owner, crucible, nonce)`. Holdings and transaction
/// logs have no nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StoreKey {
    pub kind: RecordKind,
    pub owner: Pubkey,
    pub crucible: Pubkey,
    pub nonce: Option<u64>,
}

impl StoreKey {
    pub fn new(kind: RecordKind, owner: Pubkey, crucible: Pubkey, nonce: Option<u64>) -> Self {
        Self {
            kind,
            owner,
            crucible,
            nonce,
        }
    }

    /// Bounds covering every key of `kind` that belongs to `owner`.
    fn owner_range(kind: RecordKind, owner: Pubkey) -> (StoreKey, StoreKey) {
        (
            StoreKey::new(kind, owner, Pubkey::new_from_array([0u8; 32]), None),
            StoreKey::new(kind, owner, Pubkey::new_from_array([u8::MAX; 32]), Some(u64::MAX)),
        )
    }
}

#[async_trait]
pub trait PersistentStore: Send + Sync {
    async fn load(&self, key: &StoreKey) -> ForgeResult<Option<Vec<u8>>>;
    async fn save(&self, key: &StoreKey, value: Vec<u8>) -> ForgeResult<()>;
    async fn remove(&self, key: &StoreKey) -> ForgeResult<()>;
    /// All entries of `kind` owned by `owner`, in key order.
    async fn scan(&self, kind: RecordKind, owner: Pubkey) -> ForgeResult<Vec<(StoreKey, Vec<u8>)>>;
}

/// Decodes the record array stored under `key`; a missing key is an empty array.
pub async fn load_records<T: AnchorDeserialize + Send>(
    store: &dyn PersistentStore,
    key: &StoreKey,
) -> ForgeResult<Vec<T>> {
    match store.load(key).await? {
        Some(bytes) => Ok(Vec::<T>::try_from_slice(&bytes)?),
        None => Ok(Vec::new()),
    }
}

pub async fn save_records<T: AnchorSerialize + Sync>(
    store: &dyn PersistentStore,
    key: &StoreKey,
    records: &[T],
) -> ForgeResult<()> {
    let mut bytes = Vec::new();
    records.serialize(&mut bytes)?;
    store.save(key, bytes).await
}

#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<StoreKey, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl PersistentStore for MemoryStore {
    async fn load(&self, key: &StoreKey) -> ForgeResult<Option<Vec<u8>>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn save(&self, key: &StoreKey, value: Vec<u8>) -> ForgeResult<()> {
        self.entries.write().await.insert(*key, value);
        Ok(())
    }

    async fn remove(&self, key: &StoreKey) -> ForgeResult<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn scan(&self, kind: RecordKind, owner: Pubkey) -> ForgeResult<Vec<(StoreKey, Vec<u8>)>> {
        let (start, end) = StoreKey::owner_range(kind, owner);
        Ok(self
            .entries
            .read()
            .await
            .range(start..=end)
            .map(|(key, value)| (*key, value.clone()))
            .collect())
    }
}

pub trait EventBus: Send + Sync {
    fn emit(&self, event: DomainEvent);
}

/// Fan-out bus over a tokio broadcast channel. Events emitted with no
/// subscriber are dropped.
pub struct BroadcastEventBus {
    sender: broadcast::Sender<DomainEvent>,
}

impl BroadcastEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus for BroadcastEventBus {
    fn emit(&self, event: DomainEvent) {
        let name = event.name();
        if self.sender.send(event).is_err() {
            tracing::trace!(event = name, "no subscribers for domain event");
        }
    }
}

pub trait Clock: Send + Sync {
    /// Unix timestamp in seconds.
    fn now(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start: i64) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    pub fn advance(&self, secs: i64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKey;

    #[tokio::test]
    async fn scan_returns_only_matching_owner_and_kind() {
        let store = MemoryStore::new();
        let alice = Pubkey::new_unique();
        let bob = Pubkey::new_unique();
        let crucible = Pubkey::new_unique();

        for nonce in 0..3 {
            let key = StoreKey::new(RecordKind::LpPosition, alice, crucible, Some(nonce));
            store.save(&key, vec![nonce as u8]).await.unwrap();
        }
        let other = StoreKey::new(RecordKind::LpPosition, bob, crucible, Some(0));
        store.save(&other, vec![9]).await.unwrap();
        let holding = StoreKey::new(RecordKind::Holding, alice, crucible, None);
        store.save(&holding, vec![8]).await.unwrap();

        let found = store.scan(RecordKind::LpPosition, alice).await.unwrap();
        let nonces: Vec<Option<u64>> = found.iter().map(|(k, _)| k.nonce).collect();
        assert_eq!(nonces, vec![Some(0), Some(1), Some(2)]);
    }

    #[tokio::test]
    async fn record_arrays_round_trip_through_store() {
        let store = MemoryStore::new();
        let key = StoreKey::new(RecordKind::Transactions, Pubkey::new_unique(), Pubkey::new_unique(), None);

        assert!(load_records::<u64>(&store, &key).await.unwrap().is_empty());
        save_records(&store, &key, &[1u64, 2, 3]).await.unwrap();
        assert_eq!(load_records::<u64>(&store, &key).await.unwrap(), vec![1, 2, 3]);

        store.save(&key, vec![0xff]).await.unwrap();
        assert!(matches!(
            load_records::<u64>(&store, &key).await,
            Err(ForgeError::Persistence(_))
        ));
    }

    #[tokio::test]
    async fn static_feed_reports_missing_tokens() {
        let feed = StaticPriceFeed::new([("SOL".to_string(), 200.0)]);
        assert_eq!(feed.price_of("SOL").await.unwrap(), 200.0);
        assert!(matches!(
            feed.price_of("ETH").await,
            Err(ForgeError::PriceUnavailable { .. })
        ));
        feed.set_price("ETH", 3_000.0).await;
        assert_eq!(feed.price_of("ETH").await.unwrap(), 3_000.0);
    }

    #[tokio::test]
    async fn broadcast_bus_delivers_to_subscribers() {
        let bus = BroadcastEventBus::new(8);
        let mut rx = bus.subscribe();
        let event = DomainEvent::BalanceChanged {
            key: EventKey {
                owner: Pubkey::new_unique(),
                crucible_id: Pubkey::new_unique(),
                base_token_symbol: "SOL".into(),
            },
            receipt_balance: 10,
            exchange_rate: 1_045_000,
        };
        bus.emit(event.clone());
        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[test]
    fn manual_clock_moves_on_demand() {
        let clock = ManualClock::new(100);
        clock.advance(50);
        assert_eq!(clock.now(), 150);
        clock.set(10);
        assert_eq!(clock.now(), 10);
    }
}
