//! The command side of the engine.
//!
//! Every mutation runs against a clone of the crucible, stages the
//! resulting registry entry as provisional, submits to the settlement
//! layer and only then commits. A failed or timed-out submission puts the
//! registry back the way it was.
//!
//! Lock order: crucible, registry, pool, logs.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anchor_lang::prelude::{AnchorDeserialize, Pubkey};
use forge_analytics::{AnalyticsAggregator, PortfolioAnalytics};
use forge_core::constants::{ARBITRAGE_REWARD_RATE, LEVERAGE_SCALE, USDC_DECIMALS};
use forge_core::math::to_display_units;
use forge_core::{
    load_records, save_records, BroadcastEventBus, Clock, DomainEvent, EngineConfig, EventBus,
    FeeSchedule, ForgeError, ForgeResult, Identity, MemoryStore, PersistentStore, PositionKind,
    Price, PriceFeed, RecordKind, StoreKey, SystemClock, Transaction, TransactionKind,
    TransactionLog,
};
use lending_pool_usdc::{LendingPool, PoolStats};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::ctoken::{self, ArbitrageOutcome, UnwrapOutcome, WrapOutcome};
use crate::lp::{self, LpCloseQuote, LpOpenQuote};
use crate::lvf::{
    self, LeverageFactor, LeveragedCloseQuote, LeveragedOpenQuote, LiquidationQuote, PositionHealth,
};
use crate::registry::{PositionRegistry, Tracked};
use crate::settlement::{
    ExternalState, SettlementAction, SettlementError, SettlementLayer, SettlementReceipt,
    SettlementRequest,
};
use crate::state::{Crucible, LeveragedPosition, LpPosition, Position, PositionKey, WrapHolding};

pub struct EngineBuilder {
    settlement: Arc<dyn SettlementLayer>,
    prices: Arc<dyn PriceFeed>,
    store: Arc<dyn PersistentStore>,
    events: Arc<dyn EventBus>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    fees: FeeSchedule,
}

impl EngineBuilder {
    pub fn store(mut self, store: Arc<dyn PersistentStore>) -> Self {
        self.store = store;
        self
    }

    pub fn events(mut self, events: Arc<dyn EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn fees(mut self, fees: FeeSchedule) -> Self {
        self.fees = fees;
        self
    }

    pub fn build(self) -> ForgeResult<ForgeEngine> {
        self.config.validate()?;
        let pool = LendingPool::new(&self.fees, self.config.minimum_reserve);
        info!(
            min_open_health = self.config.min_open_health,
            max_positions = self.config.max_positions_per_owner,
            "forge engine built"
        );
        Ok(ForgeEngine {
            registry: Mutex::new(PositionRegistry::new(self.config.max_positions_per_owner)),
            pool: Mutex::new(pool),
            crucibles: RwLock::new(HashMap::new()),
            logs: Mutex::new(HashMap::new()),
            analytics: AnalyticsAggregator::default(),
            next_op_id: AtomicU64::new(1),
            settlement: self.settlement,
            prices: self.prices,
            store: self.store,
            events: self.events,
            clock: self.clock,
            config: self.config,
            fees: self.fees,
        })
    }
}

pub struct ForgeEngine {
    settlement: Arc<dyn SettlementLayer>,
    prices: Arc<dyn PriceFeed>,
    store: Arc<dyn PersistentStore>,
    events: Arc<dyn EventBus>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    fees: FeeSchedule,
    crucibles: RwLock<HashMap<Pubkey, Arc<Mutex<Crucible>>>>,
    registry: Mutex<PositionRegistry>,
    pool: Mutex<LendingPool>,
    logs: Mutex<HashMap<Pubkey, TransactionLog>>,
    analytics: AnalyticsAggregator,
    next_op_id: AtomicU64,
}

impl ForgeEngine {
    /// Defaults: in-memory store, broadcast event bus, system clock,
    /// default config and the standard fee schedule.
    pub fn builder(settlement: Arc<dyn SettlementLayer>, prices: Arc<dyn PriceFeed>) -> EngineBuilder {
        EngineBuilder {
            settlement,
            prices,
            store: Arc::new(MemoryStore::new()),
            events: Arc::new(BroadcastEventBus::default()),
            clock: Arc::new(SystemClock),
            config: EngineConfig::default(),
            fees: FeeSchedule::STANDARD,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn fees(&self) -> &FeeSchedule {
        &self.fees
    }

    /// Adds a crucible. Registering an id twice keeps the first one.
    pub async fn register_crucible(&self, crucible: Crucible) -> bool {
        let mut crucibles = self.crucibles.write().await;
        if crucibles.contains_key(&crucible.id) {
            warn!(crucible = %crucible.id, "crucible already registered");
            return false;
        }
        info!(
            crucible = %crucible.id,
            base = %crucible.base_token,
            receipt = %crucible.receipt_symbol,
            rate = crucible.ledger.rate,
            "crucible registered"
        );
        crucibles.insert(crucible.id, Arc::new(Mutex::new(crucible)));
        true
    }

    pub async fn crucible(&self, id: &Pubkey) -> ForgeResult<Crucible> {
        let handle = self.crucible_handle(id).await?;
        let crucible = handle.lock().await;
        Ok(crucible.clone())
    }

    pub async fn holding(&self, owner: &Pubkey, crucible: &Pubkey) -> Option<WrapHolding> {
        self.registry.lock().await.holding(owner, crucible).copied()
    }

    pub async fn positions_of(&self, owner: &Pubkey) -> Vec<Tracked<Position>> {
        self.registry
            .lock()
            .await
            .positions_of(owner)
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn position(&self, key: &PositionKey) -> Option<Tracked<Position>> {
        self.registry.lock().await.get(key).cloned()
    }

    pub async fn tracked_pairs(&self) -> BTreeSet<(Pubkey, Pubkey)> {
        self.registry.lock().await.tracked_pairs()
    }

    pub async fn pool_stats(&self) -> PoolStats {
        self.pool.lock().await.stats()
    }

    pub async fn lender_balance(&self, lender: &Pubkey) -> ForgeResult<u64> {
        self.pool.lock().await.lender_balance(lender)
    }

    pub async fn transactions(&self, owner: &Pubkey) -> Vec<Transaction> {
        self.logs
            .lock()
            .await
            .get(owner)
            .map(TransactionLog::to_vec)
            .unwrap_or_default()
    }

    // ---------------------------------------------------------------- wrap

    pub async fn wrap(&self, identity: &Identity, crucible_id: Pubkey, amount: u64) -> ForgeResult<WrapOutcome> {
        let owner = identity.pubkey();
        let handle = self.crucible_handle(&crucible_id).await?;
        let mut crucible = handle.lock().await;
        let now = self.clock.now();

        let mut next = crucible.clone();
        let outcome = ctoken::wrap(&mut next, &self.fees, amount)?;

        let op_id = self.next_op_id();
        let (holding, staged) = {
            let mut registry = self.registry.lock().await;
            let current = registry.holding(&owner, &crucible_id).copied();
            let holding = WrapHolding::top_up(current, outcome.receipts_minted, now)?;
            (holding, registry.stage_holding(owner, crucible_id, holding, op_id))
        };

        let action = SettlementAction::Wrap {
            amount,
            receipts_minted: outcome.receipts_minted,
        };
        if let Err(err) = self.settle(op_id, owner, crucible_id, action).await {
            self.registry.lock().await.revert_holding(owner, crucible_id, staged);
            return Err(err);
        }

        *crucible = next;
        self.registry.lock().await.confirm_holding(owner, crucible_id, op_id);
        info!(
            %owner,
            crucible = %crucible_id,
            amount,
            fee = outcome.fee.fee_amount,
            receipts = outcome.receipts_minted,
            rate = outcome.rate_after,
            "wrapped"
        );

        let display = to_display_units(amount, crucible.base_decimals);
        let mut tx = Transaction::new(TransactionKind::Wrap, display, &crucible.base_token, crucible_id, now)
            .with_fee(to_display_units(outcome.fee.fee_amount, crucible.base_decimals));
        if let Some(usd) = self.usd_value(&crucible.base_token, display).await {
            tx = tx.with_usd_value(usd);
        }
        self.record(owner, tx).await;
        self.events.emit(DomainEvent::BalanceChanged {
            key: crucible.event_key(owner),
            receipt_balance: holding.receipt_balance,
            exchange_rate: crucible.ledger.rate,
        });
        self.persist_holding(owner, crucible_id, Some(holding)).await;
        Ok(outcome)
    }

    pub async fn unwrap(&self, identity: &Identity, crucible_id: Pubkey, receipts: u64) -> ForgeResult<UnwrapOutcome> {
        let owner = identity.pubkey();
        let handle = self.crucible_handle(&crucible_id).await?;
        let mut crucible = handle.lock().await;
        let now = self.clock.now();

        let op_id = self.next_op_id();
        let mut next = crucible.clone();
        let (outcome, holding, staged) = {
            let mut registry = self.registry.lock().await;
            let current = registry.holding(&owner, &crucible_id).copied().unwrap_or(WrapHolding {
                receipt_balance: 0,
                deposited_at: now,
            });
            let outcome = ctoken::unwrap(
                &mut next,
                &self.fees,
                receipts,
                current.receipt_balance,
                current.deposited_at,
                now,
            )?;
            let holding = WrapHolding {
                receipt_balance: current.receipt_balance - receipts,
                deposited_at: current.deposited_at,
            };
            let staged = registry.stage_holding(owner, crucible_id, holding, op_id);
            (outcome, holding, staged)
        };

        let action = SettlementAction::Unwrap {
            receipts_burned: receipts,
            base_returned: outcome.base_returned,
        };
        if let Err(err) = self.settle(op_id, owner, crucible_id, action).await {
            self.registry.lock().await.revert_holding(owner, crucible_id, staged);
            return Err(err);
        }

        *crucible = next;
        self.registry.lock().await.confirm_holding(owner, crucible_id, op_id);
        info!(
            %owner,
            crucible = %crucible_id,
            receipts,
            base_returned = outcome.base_returned,
            fee = outcome.fee.fee_amount,
            "unwrapped"
        );

        let display = to_display_units(outcome.base_returned, crucible.base_decimals);
        let mut tx = Transaction::new(TransactionKind::Unwrap, display, &crucible.base_token, crucible_id, now)
            .with_fee(to_display_units(outcome.fee.fee_amount, crucible.base_decimals));
        if let Some(usd) = self.usd_value(&crucible.base_token, display).await {
            tx = tx.with_usd_value(usd);
        }
        self.record(owner, tx).await;
        self.events.emit(DomainEvent::BalanceChanged {
            key: crucible.event_key(owner),
            receipt_balance: holding.receipt_balance,
            exchange_rate: crucible.ledger.rate,
        });
        let remaining = (holding.receipt_balance > 0).then_some(holding);
        self.persist_holding(owner, crucible_id, remaining).await;
        Ok(outcome)
    }

    // ------------------------------------------------------------------ lp

    pub async fn open_lp_position(
        &self,
        identity: &Identity,
        crucible_id: Pubkey,
        base_amount: u64,
        usdc_amount: u64,
    ) -> ForgeResult<(LpPosition, LpOpenQuote)> {
        let owner = identity.pubkey();
        let handle = self.crucible_handle(&crucible_id).await?;
        let mut crucible = handle.lock().await;
        let price = self.price(&crucible.base_token).await?;
        let now = self.clock.now();

        let op_id = self.next_op_id();
        let mut next = crucible.clone();
        let (position, quote, staged) = {
            let mut registry = self.registry.lock().await;
            let nonce = registry.allocate_nonce(PositionKind::Lp, owner, crucible_id)?;
            let (position, quote) = lp::open(
                &mut next,
                &self.fees,
                owner,
                nonce,
                base_amount,
                usdc_amount,
                price,
                self.config.lp_tolerance_bps,
                now,
            )?;
            let staged = registry.stage_position(Position::Lp(position.clone()), op_id);
            (position, quote, staged)
        };

        let key = position.key();
        let action = SettlementAction::OpenLp {
            nonce: position.nonce,
            base_amount,
            usdc_amount,
            lp_tokens: quote.lp_tokens,
        };
        if let Err(err) = self.settle(op_id, owner, crucible_id, action).await {
            self.registry.lock().await.revert_position(&key, staged);
            return Err(err);
        }

        *crucible = next;
        self.registry.lock().await.confirm_position(&key, op_id);
        info!(
            position = %key,
            base_amount,
            usdc_amount,
            lp_tokens = quote.lp_tokens,
            deviation_bps = quote.deviation_bps,
            "lp position opened"
        );

        let base_display = to_display_units(base_amount, crucible.base_decimals);
        let usdc_display = to_display_units(usdc_amount, USDC_DECIMALS);
        let tx = Transaction::new(TransactionKind::Deposit, base_display, &crucible.base_token, crucible_id, now)
            .with_usdc_deposited(usdc_display)
            .with_fee(to_display_units(quote.base_fee, crucible.base_decimals))
            .with_usd_value(base_display * price.as_f64() + usdc_display);
        self.record(owner, tx).await;
        self.events.emit(DomainEvent::PositionOpened {
            key: crucible.event_key(owner),
            kind: PositionKind::Lp,
            nonce: position.nonce,
            base_amount,
            usdc_amount,
            borrowed_usdc: 0,
        });
        self.persist_position(&Position::Lp(position.clone())).await;
        Ok((position, quote))
    }

    pub async fn close_lp_position(&self, identity: &Identity, key: PositionKey) -> ForgeResult<LpCloseQuote> {
        if key.kind != PositionKind::Lp {
            return Err(ForgeError::PositionNotFound(key.to_string()));
        }
        let owner = identity.pubkey();
        let handle = self.crucible_handle(&key.crucible).await?;
        let mut crucible = handle.lock().await;
        let price = self.price(&crucible.base_token).await?;
        let now = self.clock.now();

        let op_id = self.next_op_id();
        let mut next = crucible.clone();
        let (closed, quote, staged) = {
            let mut registry = self.registry.lock().await;
            registry.ensure_closable(&key, identity)?;
            let position = registry.lp(&key)?.clone();
            let quote = lp::close(&mut next, &self.fees, &position, price)?;
            let mut closed = Position::Lp(position);
            closed.mark_closed(now);
            let staged = registry.stage_position(closed.clone(), op_id);
            (closed, quote, staged)
        };

        let action = SettlementAction::CloseLp {
            nonce: key.nonce,
            base_returned: quote.summary.base_amount_returned,
            usdc_returned: quote.summary.usdc_amount_returned,
        };
        if let Err(err) = self.settle(op_id, owner, key.crucible, action).await {
            self.registry.lock().await.revert_position(&key, staged);
            return Err(err);
        }

        *crucible = next;
        self.registry.lock().await.confirm_position(&key, op_id);
        let summary = quote.summary;
        info!(
            position = %key,
            base_returned = summary.base_amount_returned,
            usdc_returned = summary.usdc_amount_returned,
            yield_component = summary.yield_component,
            fees = summary.fees_charged,
            price_delta_usdc = quote.price_delta_usdc,
            "lp position closed"
        );

        let base_display = to_display_units(summary.base_amount_returned, crucible.base_decimals);
        let usdc_display = to_display_units(summary.usdc_amount_returned, USDC_DECIMALS);
        let tx = Transaction::new(TransactionKind::Withdraw, base_display, &crucible.base_token, key.crucible, now)
            .with_usdc_deposited(usdc_display)
            .with_fee(to_display_units(summary.fees_charged, crucible.base_decimals))
            .with_yield(to_display_units(summary.yield_component, crucible.base_decimals))
            .with_usd_value(base_display * price.as_f64() + usdc_display);
        self.record(owner, tx).await;
        self.events.emit(DomainEvent::PositionClosed {
            key: crucible.event_key(owner),
            kind: PositionKind::Lp,
            nonce: key.nonce,
            base_returned: summary.base_amount_returned,
            usdc_returned: summary.usdc_amount_returned,
            yield_component: summary.yield_component,
            fees_charged: summary.fees_charged,
            liquidated: false,
        });
        self.persist_position(&closed).await;
        Ok(quote)
    }

    // ------------------------------------------------------------ leverage

    pub async fn open_leveraged_position(
        &self,
        identity: &Identity,
        crucible_id: Pubkey,
        collateral: u64,
        leverage: u64,
    ) -> ForgeResult<(LeveragedPosition, LeveragedOpenQuote)> {
        let leverage = LeverageFactor::new(leverage)?;
        let owner = identity.pubkey();
        let handle = self.crucible_handle(&crucible_id).await?;
        let mut crucible = handle.lock().await;
        let price = self.price(&crucible.base_token).await?;
        let now = self.clock.now();

        let op_id = self.next_op_id();
        let mut next = crucible.clone();
        let (position, quote, staged) = {
            let mut registry = self.registry.lock().await;
            let nonce = registry.allocate_nonce(PositionKind::Leveraged, owner, crucible_id)?;
            let mut pool = self.pool.lock().await;
            let (position, quote) = lvf::open(
                &mut next,
                &self.fees,
                owner,
                nonce,
                collateral,
                leverage,
                price,
                pool.available_liquidity(),
                self.config.min_open_health,
                now,
            )?;
            if quote.borrowed_usdc > 0 {
                pool.borrow(owner, quote.borrowed_usdc)?;
            }
            let staged = registry.stage_position(Position::Leveraged(position.clone()), op_id);
            (position, quote, staged)
        };

        let key = position.key();
        let action = SettlementAction::OpenLeveraged {
            nonce: position.nonce,
            collateral,
            leverage: leverage.scaled(),
            borrowed_usdc: quote.borrowed_usdc,
        };
        if let Err(err) = self.settle(op_id, owner, crucible_id, action).await {
            let mut registry = self.registry.lock().await;
            registry.revert_position(&key, staged);
            if quote.borrowed_usdc > 0 {
                if let Err(cancel) = self.pool.lock().await.cancel_borrow(owner, quote.borrowed_usdc) {
                    error!(position = %key, error = %cancel, "failed to release borrow reservation");
                }
            }
            return Err(err);
        }

        *crucible = next;
        self.registry.lock().await.confirm_position(&key, op_id);
        info!(
            position = %key,
            collateral,
            leverage = leverage.scaled(),
            borrowed_usdc = quote.borrowed_usdc,
            health = quote.projected_health,
            "leveraged position opened"
        );

        let display = to_display_units(collateral, crucible.base_decimals);
        let tx = Transaction::new(TransactionKind::Deposit, display, &crucible.base_token, crucible_id, now)
            .with_leverage(
                leverage.as_f64(),
                to_display_units(quote.borrowed_usdc, USDC_DECIMALS),
            )
            .with_fee(to_display_units(quote.open_fee, crucible.base_decimals))
            .with_usd_value(to_display_units(quote.collateral_value, USDC_DECIMALS));
        self.record(owner, tx).await;
        self.events.emit(DomainEvent::PositionOpened {
            key: crucible.event_key(owner),
            kind: PositionKind::Leveraged,
            nonce: position.nonce,
            base_amount: collateral,
            usdc_amount: 0,
            borrowed_usdc: quote.borrowed_usdc,
        });
        self.persist_position(&Position::Leveraged(position.clone())).await;
        Ok((position, quote))
    }

    pub async fn close_leveraged_position(
        &self,
        identity: &Identity,
        key: PositionKey,
    ) -> ForgeResult<LeveragedCloseQuote> {
        if key.kind != PositionKind::Leveraged {
            return Err(ForgeError::PositionNotFound(key.to_string()));
        }
        let owner = identity.pubkey();
        let handle = self.crucible_handle(&key.crucible).await?;
        let mut crucible = handle.lock().await;
        let price = self.price(&crucible.base_token).await?;
        let now = self.clock.now();

        let op_id = self.next_op_id();
        let mut next = crucible.clone();
        let (position, closed, quote, staged) = {
            let mut registry = self.registry.lock().await;
            registry.ensure_closable(&key, identity)?;
            let position = registry.leveraged(&key)?.clone();
            let quote = lvf::close(&mut next, &self.fees, &position, price, self.fees.borrow_rate, now)?;
            let mut closed = Position::Leveraged(position.clone());
            closed.mark_closed(now);
            let staged = registry.stage_position(closed.clone(), op_id);
            (position, closed, quote, staged)
        };

        let action = SettlementAction::CloseLeveraged {
            nonce: key.nonce,
            base_returned: quote.summary.base_amount_returned,
            repaid_usdc: quote.principal_repaid.saturating_add(quote.interest_paid),
        };
        if let Err(err) = self.ensure_pool_debt(&key, position.owner, position.borrowed_usdc).await {
            self.registry.lock().await.revert_position(&key, staged);
            return Err(err);
        }
        if let Err(err) = self.settle(op_id, owner, key.crucible, action).await {
            self.registry.lock().await.revert_position(&key, staged);
            return Err(err);
        }

        if position.borrowed_usdc > 0 {
            let repaid = self
                .pool
                .lock()
                .await
                .repay(owner, position.borrowed_usdc, quote.interest_paid);
            if let Err(err) = repaid {
                error!(position = %key, error = %err, "repay after settled close failed");
                self.registry.lock().await.revert_position(&key, staged);
                return Err(err);
            }
        }
        *crucible = next;
        self.registry.lock().await.confirm_position(&key, op_id);
        let summary = quote.summary;
        info!(
            position = %key,
            base_returned = summary.base_amount_returned,
            yield_component = summary.yield_component,
            fees = summary.fees_charged,
            interest = quote.interest_paid,
            "leveraged position closed"
        );

        let display = to_display_units(summary.base_amount_returned, crucible.base_decimals);
        let tx = Transaction::new(TransactionKind::Withdraw, display, &crucible.base_token, key.crucible, now)
            .with_leverage(
                position.leverage_factor as f64 / LEVERAGE_SCALE as f64,
                to_display_units(position.borrowed_usdc, USDC_DECIMALS),
            )
            .with_fee(to_display_units(summary.fees_charged, crucible.base_decimals))
            .with_yield(to_display_units(summary.yield_component, crucible.base_decimals))
            .with_usd_value(display * price.as_f64());
        self.record(owner, tx).await;
        self.events.emit(DomainEvent::PositionClosed {
            key: crucible.event_key(owner),
            kind: PositionKind::Leveraged,
            nonce: key.nonce,
            base_returned: summary.base_amount_returned,
            usdc_returned: 0,
            yield_component: summary.yield_component,
            fees_charged: summary.fees_charged,
            liquidated: false,
        });
        self.persist_position(&closed).await;
        Ok(quote)
    }

    /// Liquidates an unhealthy leveraged position. Any identity may call this.
    pub async fn liquidate_position(&self, liquidator: &Identity, key: PositionKey) -> ForgeResult<LiquidationQuote> {
        if key.kind != PositionKind::Leveraged {
            return Err(ForgeError::PositionNotFound(key.to_string()));
        }
        let handle = self.crucible_handle(&key.crucible).await?;
        let mut crucible = handle.lock().await;
        let price = self.price(&crucible.base_token).await?;
        let now = self.clock.now();

        let op_id = self.next_op_id();
        let mut next = crucible.clone();
        let (position, closed, quote, staged) = {
            let mut registry = self.registry.lock().await;
            registry.ensure_open(&key)?;
            let position = registry.leveraged(&key)?.clone();
            let quote = lvf::liquidate(
                &mut next,
                &self.fees,
                &position,
                price,
                self.fees.borrow_rate,
                &self.config,
                now,
            )?;
            let mut closed = Position::Leveraged(position.clone());
            closed.mark_closed(now);
            let staged = registry.stage_position(closed.clone(), op_id);
            (position, closed, quote, staged)
        };

        let action = SettlementAction::Liquidate {
            nonce: key.nonce,
            recovered_usdc: quote.recovered_usdc,
            base_returned: quote.base_returned_to_owner,
        };
        if let Err(err) = self.ensure_pool_debt(&key, position.owner, position.borrowed_usdc).await {
            self.registry.lock().await.revert_position(&key, staged);
            return Err(err);
        }
        if let Err(err) = self.settle(op_id, liquidator.pubkey(), key.crucible, action).await {
            self.registry.lock().await.revert_position(&key, staged);
            return Err(err);
        }

        if position.borrowed_usdc > 0 {
            let mut pool = self.pool.lock().await;
            let settled = if quote.shortfall == 0 {
                pool.repay(position.owner, position.borrowed_usdc, quote.health.interest)
            } else {
                pool.settle_with_shortfall(
                    position.owner,
                    position.borrowed_usdc,
                    quote.health.interest,
                    quote.recovered_usdc,
                )
            };
            if let Err(err) = settled {
                drop(pool);
                error!(position = %key, error = %err, "pool settlement after liquidation failed");
                self.registry.lock().await.revert_position(&key, staged);
                return Err(err);
            }
        }
        *crucible = next;
        self.registry.lock().await.confirm_position(&key, op_id);
        warn!(
            position = %key,
            liquidator = %liquidator,
            health = quote.health.health_factor,
            recovered_usdc = quote.recovered_usdc,
            shortfall = quote.shortfall,
            fee = quote.liquidation_fee,
            "position liquidated"
        );

        let display = to_display_units(quote.base_returned_to_owner, crucible.base_decimals);
        let tx = Transaction::new(TransactionKind::Withdraw, display, &crucible.base_token, key.crucible, now)
            .with_fee(to_display_units(quote.liquidation_fee, crucible.base_decimals))
            .with_usd_value(display * price.as_f64());
        self.record(position.owner, tx).await;
        self.events.emit(DomainEvent::PositionClosed {
            key: crucible.event_key(position.owner),
            kind: PositionKind::Leveraged,
            nonce: key.nonce,
            base_returned: quote.base_returned_to_owner,
            usdc_returned: 0,
            yield_component: 0,
            fees_charged: quote.liquidation_fee,
            liquidated: true,
        });
        self.persist_position(&closed).await;
        Ok(quote)
    }

    pub async fn position_health(&self, key: &PositionKey) -> ForgeResult<PositionHealth> {
        let crucible = self.crucible(&key.crucible).await?;
        let position = {
            let registry = self.registry.lock().await;
            registry.ensure_open(key)?;
            registry.leveraged(key)?.clone()
        };
        let price = self.price(&crucible.base_token).await?;
        lvf::assess(
            &crucible,
            &position,
            price,
            self.fees.borrow_rate,
            &self.config,
            self.clock.now(),
        )
    }

    /// Open leveraged positions that are currently below the liquidation line.
    pub async fn liquidatable_positions(&self) -> Vec<PositionKey> {
        let keys = self.registry.lock().await.open_leveraged_keys();
        let mut found = Vec::new();
        for key in keys {
            match self.position_health(&key).await {
                Ok(health) if health.status == lvf::HealthStatus::Liquidatable => found.push(key),
                Ok(_) => {}
                Err(err) => debug!(position = %key, error = %err, "health check skipped"),
            }
        }
        found
    }

    pub async fn preview_leveraged_apy(&self, crucible_id: &Pubkey, leverage: u64) -> ForgeResult<f64> {
        let leverage = LeverageFactor::new(leverage)?;
        let crucible = self.crucible(crucible_id).await?;
        Ok(lvf::effective_apy_with_rate(
            crucible.base_apy,
            leverage.as_f64(),
            self.fees.borrow_rate,
        ))
    }

    // ------------------------------------------------------------- lending

    /// Supplies USDC to the pool and returns the shares issued.
    pub async fn supply_liquidity(&self, identity: &Identity, amount: u64) -> ForgeResult<u64> {
        let lender = identity.pubkey();
        let now = self.clock.now();
        let mut pool = self.pool.lock().await;
        let mut next = pool.clone();
        let shares = next.deposit(lender, amount)?;

        let op_id = self.next_op_id();
        self.settle(op_id, lender, Pubkey::default(), SettlementAction::SupplyLiquidity { amount })
            .await?;
        *pool = next;
        drop(pool);

        let tx = Transaction::new(
            TransactionKind::Deposit,
            to_display_units(amount, USDC_DECIMALS),
            "USDC",
            Pubkey::default(),
            now,
        )
        .with_usd_value(to_display_units(amount, USDC_DECIMALS));
        self.record(lender, tx).await;
        Ok(shares)
    }

    /// Redeems pool shares and returns the USDC paid out.
    pub async fn withdraw_liquidity(&self, identity: &Identity, shares: u64) -> ForgeResult<u64> {
        let lender = identity.pubkey();
        let now = self.clock.now();
        let mut pool = self.pool.lock().await;
        let mut next = pool.clone();
        let amount = next.withdraw(lender, shares)?;

        let op_id = self.next_op_id();
        self.settle(
            op_id,
            lender,
            Pubkey::default(),
            SettlementAction::WithdrawLiquidity { shares, amount },
        )
        .await?;
        *pool = next;
        drop(pool);

        let tx = Transaction::new(
            TransactionKind::Withdraw,
            to_display_units(amount, USDC_DECIMALS),
            "USDC",
            Pubkey::default(),
            now,
        )
        .with_usd_value(to_display_units(amount, USDC_DECIMALS));
        self.record(lender, tx).await;
        Ok(amount)
    }

    // ----------------------------------------------------------- arbitrage

    pub async fn deposit_arbitrage_profit(
        &self,
        identity: &Identity,
        crucible_id: Pubkey,
        amount: u64,
    ) -> ForgeResult<ArbitrageOutcome> {
        let depositor = identity.pubkey();
        let handle = self.crucible_handle(&crucible_id).await?;
        let mut crucible = handle.lock().await;
        let now = self.clock.now();

        let mut next = crucible.clone();
        let outcome = ctoken::deposit_arbitrage_profit(&mut next, &self.fees, ARBITRAGE_REWARD_RATE, amount)?;

        let op_id = self.next_op_id();
        let rewarded = if outcome.reward_receipts > 0 {
            let mut registry = self.registry.lock().await;
            let current = registry.holding(&depositor, &crucible_id).copied();
            let holding = WrapHolding::top_up(current, outcome.reward_receipts, now)?;
            Some((holding, registry.stage_holding(depositor, crucible_id, holding, op_id)))
        } else {
            None
        };

        let action = SettlementAction::DepositArbitrage {
            amount,
            reward_receipts: outcome.reward_receipts,
        };
        if let Err(err) = self.settle(op_id, depositor, crucible_id, action).await {
            if let Some((_, staged)) = rewarded {
                self.registry.lock().await.revert_holding(depositor, crucible_id, staged);
            }
            return Err(err);
        }

        *crucible = next;
        info!(
            %depositor,
            crucible = %crucible_id,
            amount,
            vault_share = outcome.vault_share,
            reward_receipts = outcome.reward_receipts,
            rate = crucible.ledger.rate,
            "arbitrage profit deposited"
        );
        let display = to_display_units(amount, crucible.base_decimals);
        let tx = Transaction::new(TransactionKind::Deposit, display, &crucible.base_token, crucible_id, now);
        self.record(depositor, tx).await;
        if let Some((holding, _)) = rewarded {
            self.registry.lock().await.confirm_holding(depositor, crucible_id, op_id);
            self.events.emit(DomainEvent::BalanceChanged {
                key: crucible.event_key(depositor),
                receipt_balance: holding.receipt_balance,
                exchange_rate: crucible.ledger.rate,
            });
            self.persist_holding(depositor, crucible_id, Some(holding)).await;
        }
        Ok(outcome)
    }

    // ----------------------------------------------------------- analytics

    /// Folds the owner's transaction window. Price failures degrade to zero.
    pub async fn portfolio_analytics(&self, owner: &Pubkey) -> PortfolioAnalytics {
        let transactions = self.transactions(owner).await;
        self.analytics
            .aggregate_with_feed(self.prices.as_ref(), &transactions)
            .await
    }

    // ------------------------------------------------------ sync & storage

    /// Loads an owner's cached holdings, positions and transaction window.
    /// Records already tracked in memory win over the cache.
    pub async fn hydrate(&self, owner: Pubkey) -> ForgeResult<usize> {
        let mut holdings = Vec::new();
        for (key, bytes) in self.store.scan(RecordKind::Holding, owner).await? {
            match Vec::<WrapHolding>::try_from_slice(&bytes) {
                Ok(records) => holdings.extend(records.into_iter().map(|h| (owner, key.crucible, h))),
                Err(err) => warn!(%owner, crucible = %key.crucible, error = %err, "skipping unreadable holding"),
            }
        }

        let mut positions = Vec::new();
        for kind in [RecordKind::LpPosition, RecordKind::LeveragedPosition] {
            for (key, bytes) in self.store.scan(kind, owner).await? {
                match Vec::<Position>::try_from_slice(&bytes) {
                    Ok(records) => positions.extend(records),
                    Err(err) => warn!(%owner, nonce = ?key.nonce, error = %err, "skipping unreadable position"),
                }
            }
        }

        let transactions: Vec<Transaction> = load_records(self.store.as_ref(), &Self::log_key(owner)).await?;
        if !transactions.is_empty() {
            let mut logs = self.logs.lock().await;
            logs.entry(owner)
                .or_insert_with(|| TransactionLog::from_records(self.config.transaction_window, transactions));
        }

        let loaded = self.registry.lock().await.hydrate(holdings, positions);
        info!(%owner, loaded, "hydrated from store");
        Ok(loaded)
    }

    /// One reconciliation pass: external state overwrites the crucible
    /// snapshot and every local record for `(owner, crucible)`.
    pub async fn reconcile(&self, owner: Pubkey, crucible_id: Pubkey) -> ForgeResult<usize> {
        let external = self.fetch_with_retry(owner, crucible_id).await?;
        let handle = self.crucible_handle(&crucible_id).await?;
        let mut crucible = handle.lock().await;

        if let Some(snapshot) = external.crucible {
            if snapshot.exchange_rate < crucible.ledger.rate {
                warn!(
                    crucible = %crucible_id,
                    local = crucible.ledger.rate,
                    external = snapshot.exchange_rate,
                    "external exchange rate is below local"
                );
            }
            crucible.ledger.rate = snapshot.exchange_rate;
            crucible.ledger.total_receipt_supply = snapshot.total_receipt_supply;
        }

        let ExternalState { holding, positions, .. } = external;
        let changed = self
            .registry
            .lock()
            .await
            .reconcile(owner, crucible_id, holding, positions.clone());
        if changed == 0 {
            debug!(%owner, crucible = %crucible_id, "reconciled, no changes");
            return Ok(0);
        }
        info!(%owner, crucible = %crucible_id, changed, "reconciled against external state");

        let holding = holding.filter(|h| h.receipt_balance > 0);
        self.events.emit(DomainEvent::BalanceChanged {
            key: crucible.event_key(owner),
            receipt_balance: holding.map(|h| h.receipt_balance).unwrap_or(0),
            exchange_rate: crucible.ledger.rate,
        });
        drop(crucible);

        self.persist_holding(owner, crucible_id, holding).await;
        for position in positions
            .iter()
            .filter(|p| p.owner() == owner && p.key().crucible == crucible_id)
        {
            self.persist_position(position).await;
        }
        Ok(changed)
    }

    async fn fetch_with_retry(&self, owner: Pubkey, crucible_id: Pubkey) -> ForgeResult<ExternalState> {
        let retries = self.config.reconcile_retries;
        let mut attempt = 0u32;
        loop {
            let result = tokio::time::timeout(
                self.config.settlement_timeout(),
                self.settlement.fetch_state(owner, crucible_id),
            )
            .await
            .unwrap_or(Err(SettlementError::Timeout));
            match result {
                Ok(state) => return Ok(state),
                Err(err) if attempt < retries => {
                    attempt += 1;
                    debug!(%owner, crucible = %crucible_id, attempt, error = %err, "state fetch failed, retrying");
                    tokio::time::sleep(Duration::from_millis(100 << attempt.min(6))).await;
                }
                Err(err) => {
                    warn!(%owner, crucible = %crucible_id, attempts = attempt + 1, error = %err, "state fetch gave up");
                    return Err(err.into());
                }
            }
        }
    }

    // ------------------------------------------------------------- helpers

    async fn crucible_handle(&self, id: &Pubkey) -> ForgeResult<Arc<Mutex<Crucible>>> {
        self.crucibles
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ForgeError::CrucibleNotFound(id.to_string()))
    }

    async fn price(&self, token: &str) -> ForgeResult<Price> {
        let quote = self.prices.price_of(token).await?;
        Price::from_quote(token, quote)
    }

    async fn usd_value(&self, token: &str, display_amount: f64) -> Option<f64> {
        match self.price(token).await {
            Ok(price) => Some(display_amount * price.as_f64()),
            Err(err) => {
                debug!(token, error = %err, "no usd value for transaction");
                None
            }
        }
    }

    /// The pool must still carry the debt a close or liquidation will repay.
    async fn ensure_pool_debt(&self, key: &PositionKey, owner: Pubkey, borrowed: u64) -> ForgeResult<()> {
        if borrowed == 0 {
            return Ok(());
        }
        let debt = self.pool.lock().await.debt_of(&owner);
        if debt < borrowed {
            error!(position = %key, borrowed, debt, "pool debt does not cover position");
            return Err(ForgeError::InsufficientBalance {
                required: borrowed,
                available: debt,
            });
        }
        Ok(())
    }

    fn next_op_id(&self) -> u64 {
        self.next_op_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn settle(
        &self,
        op_id: u64,
        signer: Pubkey,
        crucible: Pubkey,
        action: SettlementAction,
    ) -> ForgeResult<SettlementReceipt> {
        let name = action.name();
        let request = SettlementRequest {
            op_id,
            signer,
            crucible,
            action,
        };
        let result = tokio::time::timeout(self.config.settlement_timeout(), self.settlement.submit(request))
            .await
            .unwrap_or(Err(SettlementError::Timeout));
        match result {
            Ok(receipt) => {
                debug!(op_id, action = name, signature = %receipt.signature, slot = receipt.slot, "settled");
                Ok(receipt)
            }
            Err(err) => {
                warn!(op_id, action = name, %signer, error = %err, "settlement failed, rolling back");
                Err(err.into())
            }
        }
    }

    async fn record(&self, owner: Pubkey, tx: Transaction) {
        let snapshot = {
            let mut logs = self.logs.lock().await;
            let log = logs
                .entry(owner)
                .or_insert_with(|| TransactionLog::new(self.config.transaction_window));
            log.push(tx);
            log.to_vec()
        };
        if let Err(err) = save_records(self.store.as_ref(), &Self::log_key(owner), &snapshot).await {
            error!(%owner, error = %err, "failed to persist transaction log");
        }
    }

    async fn persist_holding(&self, owner: Pubkey, crucible: Pubkey, holding: Option<WrapHolding>) {
        let key = StoreKey::new(RecordKind::Holding, owner, crucible, None);
        let result = match holding {
            Some(holding) => save_records(self.store.as_ref(), &key, &[holding]).await,
            None => self.store.remove(&key).await,
        };
        if let Err(err) = result {
            error!(%owner, %crucible, error = %err, "failed to persist holding");
        }
    }

    async fn persist_position(&self, position: &Position) {
        let key = position.key();
        let kind = match key.kind {
            PositionKind::Lp => RecordKind::LpPosition,
            PositionKind::Leveraged => RecordKind::LeveragedPosition,
        };
        let store_key = StoreKey::new(kind, key.owner, key.crucible, Some(key.nonce));
        if let Err(err) = save_records(self.store.as_ref(), &store_key, std::slice::from_ref(position)).await {
            error!(position = %key, error = %err, "failed to persist position");
        }
    }

    fn log_key(owner: Pubkey) -> StoreKey {
        StoreKey::new(RecordKind::Transactions, owner, Pubkey::default(), None)
    }
}
