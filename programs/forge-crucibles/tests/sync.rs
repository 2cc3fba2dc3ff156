mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use forge_core::{DomainEvent, EngineConfig, ForgeError, MemoryStore};
use forge_crucibles::{CrucibleSnapshot, ExternalState, Position, Reconciler, SyncState, WrapHolding};

#[tokio::test]
async fn hydrate_restores_cached_records() {
    let store = Arc::new(MemoryStore::new());
    let first = harness_with(EngineConfig::default(), store.clone()).await;
    let alice = identity();
    first.engine.wrap(&alice, first.crucible, 10 * SOL).await.unwrap();
    let (lp, _) = first
        .engine
        .open_lp_position(&alice, first.crucible, 10 * SOL, 2_000 * USDC)
        .await
        .unwrap();

    let second = harness_with(EngineConfig::default(), store).await;
    second
        .engine
        .register_crucible(sol_crucible(first.crucible))
        .await;
    let loaded = second.engine.hydrate(alice.pubkey()).await.unwrap();
    assert_eq!(loaded, 2);

    assert_eq!(
        second.engine.holding(&alice.pubkey(), &first.crucible).await,
        first.engine.holding(&alice.pubkey(), &first.crucible).await
    );
    let positions = second.engine.positions_of(&alice.pubkey()).await;
    assert_eq!(positions.len(), 1);
    assert_eq!(positions[0].record, Position::Lp(lp));
    assert_eq!(positions[0].sync, SyncState::Confirmed);
    assert_eq!(second.engine.transactions(&alice.pubkey()).await.len(), 2);

    let (next, _) = second
        .engine
        .open_lp_position(&alice, first.crucible, 10 * SOL, 2_000 * USDC)
        .await
        .unwrap();
    assert_eq!(next.nonce, 1);

    // Hydrating again does not duplicate anything.
    assert_eq!(second.engine.hydrate(alice.pubkey()).await.unwrap(), 0);
}

#[tokio::test]
async fn external_state_wins_on_reconcile() {
    let h = harness().await;
    let alice = identity();
    h.engine.wrap(&alice, h.crucible, 10 * SOL).await.unwrap();
    h.engine
        .open_lp_position(&alice, h.crucible, 10 * SOL, 2_000 * USDC)
        .await
        .unwrap();

    let truth = WrapHolding {
        receipt_balance: 7 * SOL,
        deposited_at: GENESIS - 100,
    };
    h.settlement.set_state(
        alice.pubkey(),
        h.crucible,
        ExternalState {
            crucible: Some(CrucibleSnapshot {
                exchange_rate: 1_100_000,
                total_receipt_supply: 7 * SOL,
            }),
            holding: Some(truth),
            positions: Vec::new(),
        },
    );

    let mut events = h.events.subscribe();
    let changed = h.engine.reconcile(alice.pubkey(), h.crucible).await.unwrap();
    assert_eq!(changed, 2, "holding replaced and the unknown position dropped");

    assert_eq!(h.engine.holding(&alice.pubkey(), &h.crucible).await, Some(truth));
    assert!(h.engine.positions_of(&alice.pubkey()).await.is_empty());
    let crucible = h.engine.crucible(&h.crucible).await.unwrap();
    assert_eq!(crucible.ledger.rate, 1_100_000);
    assert_eq!(crucible.ledger.total_receipt_supply, 7 * SOL);

    match events.try_recv().unwrap() {
        DomainEvent::BalanceChanged { receipt_balance, exchange_rate, .. } => {
            assert_eq!(receipt_balance, 7 * SOL);
            assert_eq!(exchange_rate, 1_100_000);
        }
        other => panic!("unexpected event {:?}", other),
    }

    // A second pass against the same truth is a no-op.
    assert_eq!(h.engine.reconcile(alice.pubkey(), h.crucible).await.unwrap(), 0);
}

#[tokio::test]
async fn close_without_pool_debt_is_refused_before_settling() {
    let first = harness().await;
    let alice = identity();
    first.fund_pool(10_000 * USDC).await;
    let (position, _) = first
        .engine
        .open_leveraged_position(&alice, first.crucible, 10 * SOL, 200)
        .await
        .unwrap();
    let tracked = first.engine.crucible(&first.crucible).await.unwrap();

    // A second engine learns about the position but its pool never lent.
    let second = harness().await;
    second
        .engine
        .register_crucible(sol_crucible(first.crucible))
        .await;
    second.settlement.set_state(
        alice.pubkey(),
        first.crucible,
        ExternalState {
            crucible: Some(CrucibleSnapshot {
                exchange_rate: tracked.ledger.rate,
                total_receipt_supply: tracked.ledger.total_receipt_supply,
            }),
            holding: None,
            positions: vec![Position::Leveraged(position.clone())],
        },
    );
    second.engine.reconcile(alice.pubkey(), first.crucible).await.unwrap();

    let err = second
        .engine
        .close_leveraged_position(&alice, position.key())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        ForgeError::InsufficientBalance {
            required: 2_000 * USDC,
            available: 0
        }
    );
    assert!(second.settlement.submitted().is_empty());
    let kept = second.engine.position(&position.key()).await.unwrap();
    assert_eq!(kept.sync, SyncState::Confirmed);
    assert!(kept.record.is_open());
    let crucible = second.engine.crucible(&first.crucible).await.unwrap();
    assert_eq!(crucible.ledger.total_receipt_supply, tracked.ledger.total_receipt_supply);
}

#[tokio::test(start_paused = true)]
async fn state_fetch_retries_quietly() {
    let h = harness().await;
    let alice = identity();
    h.settlement.fail_fetches(2);
    assert_eq!(h.engine.reconcile(alice.pubkey(), h.crucible).await.unwrap(), 0);
    assert_eq!(h.settlement.fetches(), 3);

    h.settlement.fail_fetches(10);
    let err = h.engine.reconcile(alice.pubkey(), h.crucible).await.unwrap_err();
    assert!(matches!(err, ForgeError::SettlementFailed(_)));
    assert_eq!(h.settlement.fetches(), 3 + 4);
}

#[tokio::test(start_paused = true)]
async fn reconciler_serves_requests_and_stops() {
    let h = harness().await;
    let alice = identity();
    let (position, _) = h
        .engine
        .open_lp_position(&alice, h.crucible, 10 * SOL, 2_000 * USDC)
        .await
        .unwrap();

    let mut closed = Position::Lp(position.clone());
    closed.mark_closed(GENESIS + 5);
    h.settlement.set_state(
        alice.pubkey(),
        h.crucible,
        ExternalState {
            crucible: None,
            holding: None,
            positions: vec![closed.clone()],
        },
    );

    let (handle, task) = Reconciler::spawn(h.engine.clone());
    assert!(handle.request(alice.pubkey(), h.crucible).await);

    let mut reconciled = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if let Some(tracked) = h.engine.position(&position.key()).await {
            if tracked.record == closed {
                reconciled = true;
                break;
            }
        }
    }
    assert!(reconciled, "requested pass should overwrite the open position");

    handle.shutdown();
    task.await.unwrap();
    assert!(!handle.request(alice.pubkey(), h.crucible).await);
}

#[tokio::test(start_paused = true)]
async fn scheduled_sweep_covers_tracked_pairs() {
    let h = harness().await;
    let alice = identity();
    h.engine.wrap(&alice, h.crucible, 10 * SOL).await.unwrap();
    h.settlement.set_state(alice.pubkey(), h.crucible, ExternalState::default());

    let (handle, task) = Reconciler::spawn(h.engine.clone());
    tokio::time::sleep(h.engine.config().reconcile_interval() + Duration::from_secs(1)).await;

    assert!(h.engine.holding(&alice.pubkey(), &h.crucible).await.is_none());
    assert!(h.settlement.fetches() >= 1);

    drop(handle);
    task.await.unwrap();
}
