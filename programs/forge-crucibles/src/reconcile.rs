//! Background loop that overwrites optimistic local state with what the
//! settlement layer reports.

use std::sync::Arc;

use anchor_lang::prelude::Pubkey;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::engine::ForgeEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileRequest {
    pub owner: Pubkey,
    pub crucible: Pubkey,
}

/// Handle for a running reconciler. Dropping it stops the loop.
#[derive(Clone)]
pub struct ReconcileHandle {
    requests: mpsc::Sender<ReconcileRequest>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl ReconcileHandle {
    /// Asks for an out-of-schedule pass, e.g. after a domain event from
    /// another component. Returns `false` once the loop has stopped.
    pub async fn request(&self, owner: Pubkey, crucible: Pubkey) -> bool {
        self.requests
            .send(ReconcileRequest { owner, crucible })
            .await
            .is_ok()
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

pub struct Reconciler {
    engine: Arc<ForgeEngine>,
    requests: mpsc::Receiver<ReconcileRequest>,
    shutdown: watch::Receiver<bool>,
}

impl Reconciler {
    pub fn new(engine: Arc<ForgeEngine>) -> (Self, ReconcileHandle) {
        let (request_tx, request_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let reconciler = Self {
            engine,
            requests: request_rx,
            shutdown: shutdown_rx,
        };
        let handle = ReconcileHandle {
            requests: request_tx,
            shutdown: Arc::new(shutdown_tx),
        };
        (reconciler, handle)
    }

    pub fn spawn(engine: Arc<ForgeEngine>) -> (ReconcileHandle, JoinHandle<()>) {
        let (reconciler, handle) = Self::new(engine);
        (handle, tokio::spawn(reconciler.run()))
    }

    /// Runs until shutdown is signalled or every handle is dropped.
    pub async fn run(mut self) {
        let period = self.engine.config().reconcile_interval();
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        info!(interval_secs = period.as_secs(), "reconciler started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep().await;
                }
                request = self.requests.recv() => match request {
                    Some(ReconcileRequest { owner, crucible }) => {
                        self.pass(owner, crucible).await;
                    }
                    None => break,
                },
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("reconciler stopped");
    }

    async fn sweep(&self) {
        let pairs = self.engine.tracked_pairs().await;
        debug!(pairs = pairs.len(), "scheduled reconciliation");
        for (owner, crucible) in pairs {
            self.pass(owner, crucible).await;
        }
    }

    async fn pass(&self, owner: Pubkey, crucible: Pubkey) {
        if let Err(err) = self.engine.reconcile(owner, crucible).await {
            warn!(%owner, %crucible, error = %err, "reconciliation pass failed");
        }
    }
}
