//! Owns every holding and position the engine knows about.
//!
//! Local records are optimistic: a mutation is staged as `Provisional`
//! before settlement confirms it, and reconciliation against external
//! state overwrites whatever is here.

use std::collections::{BTreeMap, BTreeSet};

use anchor_lang::prelude::Pubkey;
use forge_core::{ForgeError, ForgeResult, Identity, PositionKind};

use crate::state::{LeveragedPosition, LpPosition, Position, PositionKey, WrapHolding};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Provisional { op_id: u64 },
    Confirmed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tracked<T> {
    pub record: T,
    pub sync: SyncState,
}

impl<T> Tracked<T> {
    pub fn confirmed(record: T) -> Self {
        Self {
            record,
            sync: SyncState::Confirmed,
        }
    }

    pub fn provisional(record: T, op_id: u64) -> Self {
        Self {
            record,
            sync: SyncState::Provisional { op_id },
        }
    }

    pub fn is_provisional(&self) -> bool {
        matches!(self.sync, SyncState::Provisional { .. })
    }
}

/// Prior state of a staged entry, kept so a failed settlement can put it back.
#[derive(Debug, Clone)]
pub struct Staged<T> {
    op_id: u64,
    previous: Option<Tracked<T>>,
}

#[derive(Debug)]
pub struct PositionRegistry {
    cap: u64,
    positions: BTreeMap<PositionKey, Tracked<Position>>,
    holdings: BTreeMap<(Pubkey, Pubkey), Tracked<WrapHolding>>,
}

impl PositionRegistry {
    pub fn new(cap: u64) -> Self {
        Self {
            cap,
            positions: BTreeMap::new(),
            holdings: BTreeMap::new(),
        }
    }

    pub fn cap(&self) -> u64 {
        self.cap
    }

    /// First nonce with no record for `(kind, owner, crucible)`. Closed
    /// positions keep their record, so their nonce is never handed out again.
    pub fn allocate_nonce(&self, kind: PositionKind, owner: Pubkey, crucible: Pubkey) -> ForgeResult<u64> {
        (0..self.cap)
            .find(|nonce| {
                !self
                    .positions
                    .contains_key(&PositionKey::new(kind, owner, crucible, *nonce))
            })
            .ok_or(ForgeError::NoFreeSlot { cap: self.cap })
    }

    pub fn get(&self, key: &PositionKey) -> Option<&Tracked<Position>> {
        self.positions.get(key)
    }

    pub fn lp(&self, key: &PositionKey) -> ForgeResult<&LpPosition> {
        match self.positions.get(key).map(|t| &t.record) {
            Some(Position::Lp(p)) => Ok(p),
            _ => Err(ForgeError::PositionNotFound(key.to_string())),
        }
    }

    pub fn leveraged(&self, key: &PositionKey) -> ForgeResult<&LeveragedPosition> {
        match self.positions.get(key).map(|t| &t.record) {
            Some(Position::Leveraged(p)) => Ok(p),
            _ => Err(ForgeError::PositionNotFound(key.to_string())),
        }
    }

    /// Checks that `caller` may close `key`: it must exist, belong to the
    /// caller and still be open.
    pub fn ensure_closable(&self, key: &PositionKey, caller: &Identity) -> ForgeResult<&Position> {
        let tracked = self
            .positions
            .get(key)
            .ok_or_else(|| ForgeError::PositionNotFound(key.to_string()))?;
        let position = &tracked.record;
        if position.owner() != caller.pubkey() {
            return Err(ForgeError::NotOwner {
                position: key.to_string(),
                caller: caller.to_string(),
            });
        }
        if !position.is_open() {
            return Err(ForgeError::AlreadyClosed(key.to_string()));
        }
        Ok(position)
    }

    /// Open position that anyone may act on, e.g. a liquidator.
    pub fn ensure_open(&self, key: &PositionKey) -> ForgeResult<&Position> {
        let tracked = self
            .positions
            .get(key)
            .ok_or_else(|| ForgeError::PositionNotFound(key.to_string()))?;
        if !tracked.record.is_open() {
            return Err(ForgeError::AlreadyClosed(key.to_string()));
        }
        Ok(&tracked.record)
    }

    pub fn stage_position(&mut self, position: Position, op_id: u64) -> Staged<Position> {
        let key = position.key();
        let previous = self.positions.insert(key, Tracked::provisional(position, op_id));
        Staged { op_id, previous }
    }

    /// Undoes a staged write unless something else has replaced it since.
    pub fn revert_position(&mut self, key: &PositionKey, staged: Staged<Position>) -> bool {
        let ours = matches!(
            self.positions.get(key).map(|t| t.sync),
            Some(SyncState::Provisional { op_id }) if op_id == staged.op_id
        );
        if !ours {
            return false;
        }
        match staged.previous {
            Some(previous) => {
                self.positions.insert(*key, previous);
            }
            None => {
                self.positions.remove(key);
            }
        }
        true
    }

    pub fn confirm_position(&mut self, key: &PositionKey, op_id: u64) -> bool {
        match self.positions.get_mut(key) {
            Some(tracked) if tracked.sync == (SyncState::Provisional { op_id }) => {
                tracked.sync = SyncState::Confirmed;
                true
            }
            _ => false,
        }
    }

    pub fn holding(&self, owner: &Pubkey, crucible: &Pubkey) -> Option<&WrapHolding> {
        self.holdings.get(&(*owner, *crucible)).map(|t| &t.record)
    }

    pub fn holding_balance(&self, owner: &Pubkey, crucible: &Pubkey) -> u64 {
        self.holding(owner, crucible)
            .map(|h| h.receipt_balance)
            .unwrap_or(0)
    }

    /// Stages a new holding. A zero balance removes the entry.
    pub fn stage_holding(
        &mut self,
        owner: Pubkey,
        crucible: Pubkey,
        holding: WrapHolding,
        op_id: u64,
    ) -> Staged<WrapHolding> {
        let previous = self
            .holdings
            .insert((owner, crucible), Tracked::provisional(holding, op_id));
        Staged { op_id, previous }
    }

    pub fn revert_holding(&mut self, owner: Pubkey, crucible: Pubkey, staged: Staged<WrapHolding>) -> bool {
        let key = (owner, crucible);
        let ours = matches!(
            self.holdings.get(&key).map(|t| t.sync),
            Some(SyncState::Provisional { op_id }) if op_id == staged.op_id
        );
        if !ours {
            return false;
        }
        match staged.previous {
            Some(previous) => {
                self.holdings.insert(key, previous);
            }
            None => {
                self.holdings.remove(&key);
            }
        }
        true
    }

    pub fn confirm_holding(&mut self, owner: Pubkey, crucible: Pubkey, op_id: u64) -> bool {
        let key = (owner, crucible);
        let confirmed = match self.holdings.get_mut(&key) {
            Some(tracked) if tracked.sync == (SyncState::Provisional { op_id }) => {
                tracked.sync = SyncState::Confirmed;
                true
            }
            _ => false,
        };
        if confirmed && self.holding_balance(&owner, &crucible) == 0 {
            self.holdings.remove(&key);
        }
        confirmed
    }

    /// Loads cached records as confirmed state without replacing anything
    /// already tracked.
    pub fn hydrate(&mut self, holdings: Vec<(Pubkey, Pubkey, WrapHolding)>, positions: Vec<Position>) -> usize {
        let mut loaded = 0;
        for (owner, crucible, holding) in holdings {
            if holding.receipt_balance > 0 && !self.holdings.contains_key(&(owner, crucible)) {
                self.holdings.insert((owner, crucible), Tracked::confirmed(holding));
                loaded += 1;
            }
        }
        for position in positions {
            let key = position.key();
            if !self.positions.contains_key(&key) {
                self.positions.insert(key, Tracked::confirmed(position));
                loaded += 1;
            }
        }
        loaded
    }

    /// Replaces everything held for `(owner, crucible)` with external truth.
    /// Returns how many entries changed.
    pub fn reconcile(
        &mut self,
        owner: Pubkey,
        crucible: Pubkey,
        holding: Option<WrapHolding>,
        positions: Vec<Position>,
    ) -> usize {
        let mut changed = 0;

        let local_holding = self.holdings.get(&(owner, crucible)).cloned();
        let external_holding = holding
            .filter(|h| h.receipt_balance > 0)
            .map(Tracked::confirmed);
        if local_holding != external_holding {
            changed += 1;
            match external_holding {
                Some(tracked) => {
                    self.holdings.insert((owner, crucible), tracked);
                }
                None => {
                    self.holdings.remove(&(owner, crucible));
                }
            }
        }

        let external: BTreeMap<PositionKey, Tracked<Position>> = positions
            .into_iter()
            .filter(|p| p.owner() == owner && p.key().crucible == crucible)
            .map(|p| (p.key(), Tracked::confirmed(p)))
            .collect();
        let local_keys: Vec<PositionKey> = self
            .positions
            .keys()
            .filter(|k| k.owner == owner && k.crucible == crucible)
            .copied()
            .collect();
        for key in local_keys {
            if !external.contains_key(&key) {
                self.positions.remove(&key);
                changed += 1;
            }
        }
        for (key, tracked) in external {
            if self.positions.get(&key) != Some(&tracked) {
                self.positions.insert(key, tracked);
                changed += 1;
            }
        }
        changed
    }

    /// Every `(owner, crucible)` pair with at least one record.
    pub fn tracked_pairs(&self) -> BTreeSet<(Pubkey, Pubkey)> {
        self.holdings
            .keys()
            .copied()
            .chain(self.positions.keys().map(|k| (k.owner, k.crucible)))
            .collect()
    }

    pub fn positions_of(&self, owner: &Pubkey) -> Vec<&Tracked<Position>> {
        self.positions
            .iter()
            .filter(|(k, _)| k.owner == *owner)
            .map(|(_, t)| t)
            .collect()
    }

    pub fn holdings_of(&self, owner: &Pubkey) -> Vec<(Pubkey, WrapHolding)> {
        self.holdings
            .iter()
            .filter(|((o, _), _)| o == owner)
            .map(|((_, crucible), t)| (*crucible, t.record))
            .collect()
    }

    pub fn open_leveraged_keys(&self) -> Vec<PositionKey> {
        self.positions
            .iter()
            .filter(|(k, t)| k.kind == PositionKind::Leveraged && t.record.is_open())
            .map(|(k, _)| *k)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lp(owner: Pubkey, crucible: Pubkey, nonce: u64) -> Position {
        Position::Lp(LpPosition {
            owner,
            crucible_id: crucible,
            base_token: "SOL".into(),
            nonce,
            base_amount: 1_000,
            usdc_amount: 1_000,
            receipt_amount: 900,
            usdc_net: 990,
            entry_price: 1_000_000,
            entry_exchange_rate: 1_045_000,
            lp_token_amount: 950,
            opened_at: 0,
            closed_at: None,
            is_open: true,
        })
    }

    fn open(registry: &mut PositionRegistry, owner: Pubkey, crucible: Pubkey, op_id: u64) -> PositionKey {
        let nonce = registry.allocate_nonce(PositionKind::Lp, owner, crucible).unwrap();
        let position = lp(owner, crucible, nonce);
        let key = position.key();
        registry.stage_position(position, op_id);
        registry.confirm_position(&key, op_id);
        key
    }

    fn close(registry: &mut PositionRegistry, key: &PositionKey, op_id: u64) {
        let mut position = registry.get(key).unwrap().record.clone();
        position.mark_closed(10);
        registry.stage_position(position, op_id);
        registry.confirm_position(key, op_id);
    }

    #[test]
    fn closed_nonces_are_not_reused() {
        let mut registry = PositionRegistry::new(50);
        let owner = Pubkey::new_unique();
        let crucible = Pubkey::new_unique();
        let keys: Vec<PositionKey> = (0..3).map(|i| open(&mut registry, owner, crucible, i)).collect();
        assert_eq!(keys.iter().map(|k| k.nonce).collect::<Vec<_>>(), vec![0, 1, 2]);

        close(&mut registry, &keys[1], 10);
        let next = open(&mut registry, owner, crucible, 11);
        assert_eq!(next.nonce, 3);
    }

    #[test]
    fn nonces_are_scoped_per_owner_and_kind() {
        let mut registry = PositionRegistry::new(50);
        let crucible = Pubkey::new_unique();
        let alice = Pubkey::new_unique();
        open(&mut registry, alice, crucible, 1);
        assert_eq!(
            registry
                .allocate_nonce(PositionKind::Lp, Pubkey::new_unique(), crucible)
                .unwrap(),
            0
        );
        assert_eq!(
            registry
                .allocate_nonce(PositionKind::Leveraged, alice, crucible)
                .unwrap(),
            0
        );
    }

    #[test]
    fn exhausted_slots_fail() {
        let mut registry = PositionRegistry::new(2);
        let owner = Pubkey::new_unique();
        let crucible = Pubkey::new_unique();
        open(&mut registry, owner, crucible, 1);
        open(&mut registry, owner, crucible, 2);
        assert_eq!(
            registry.allocate_nonce(PositionKind::Lp, owner, crucible),
            Err(ForgeError::NoFreeSlot { cap: 2 })
        );
    }

    #[test]
    fn close_checks_run_in_order() {
        let mut registry = PositionRegistry::new(50);
        let owner = Pubkey::new_unique();
        let crucible = Pubkey::new_unique();
        let key = open(&mut registry, owner, crucible, 1);
        let stranger = Identity::new(Pubkey::new_unique());
        let me = Identity::new(owner);

        let missing = PositionKey::new(PositionKind::Lp, owner, crucible, 7);
        assert!(matches!(
            registry.ensure_closable(&missing, &me),
            Err(ForgeError::PositionNotFound(_))
        ));
        assert!(matches!(
            registry.ensure_closable(&key, &stranger),
            Err(ForgeError::NotOwner { .. })
        ));
        assert!(registry.ensure_closable(&key, &me).is_ok());

        close(&mut registry, &key, 2);
        assert!(matches!(
            registry.ensure_closable(&key, &me),
            Err(ForgeError::AlreadyClosed(_))
        ));
        // A closed position belonging to someone else still reports NotOwner first.
        assert!(matches!(
            registry.ensure_closable(&key, &stranger),
            Err(ForgeError::NotOwner { .. })
        ));
    }

    #[test]
    fn revert_restores_previous_state() {
        let mut registry = PositionRegistry::new(50);
        let owner = Pubkey::new_unique();
        let crucible = Pubkey::new_unique();
        let position = lp(owner, crucible, 0);
        let key = position.key();

        let staged = registry.stage_position(position, 5);
        assert!(registry.get(&key).unwrap().is_provisional());
        assert!(registry.revert_position(&key, staged));
        assert!(registry.get(&key).is_none());
        assert_eq!(registry.allocate_nonce(PositionKind::Lp, owner, crucible).unwrap(), 0);
    }

    #[test]
    fn revert_does_not_clobber_reconciled_state() {
        let mut registry = PositionRegistry::new(50);
        let owner = Pubkey::new_unique();
        let crucible = Pubkey::new_unique();
        let position = lp(owner, crucible, 0);
        let key = position.key();

        let staged = registry.stage_position(position.clone(), 5);
        registry.reconcile(owner, crucible, None, vec![position]);
        assert!(!registry.revert_position(&key, staged));
        assert_eq!(registry.get(&key).unwrap().sync, SyncState::Confirmed);
    }

    #[test]
    fn reconcile_overwrites_with_external_truth() {
        let mut registry = PositionRegistry::new(50);
        let owner = Pubkey::new_unique();
        let crucible = Pubkey::new_unique();
        let local = open(&mut registry, owner, crucible, 1);
        registry.stage_holding(
            owner,
            crucible,
            WrapHolding {
                receipt_balance: 500,
                deposited_at: 0,
            },
            2,
        );

        let external = lp(owner, crucible, 4);
        let external_holding = WrapHolding {
            receipt_balance: 700,
            deposited_at: 3,
        };
        let changed = registry.reconcile(owner, crucible, Some(external_holding), vec![external.clone()]);
        assert_eq!(changed, 3);
        assert!(registry.get(&local).is_none());
        assert_eq!(registry.get(&external.key()).unwrap().sync, SyncState::Confirmed);
        assert_eq!(registry.holding_balance(&owner, &crucible), 700);

        assert_eq!(
            registry.reconcile(owner, crucible, Some(external_holding), vec![external]),
            0
        );
    }

    #[test]
    fn zero_balance_holding_is_dropped_on_confirm() {
        let mut registry = PositionRegistry::new(50);
        let owner = Pubkey::new_unique();
        let crucible = Pubkey::new_unique();
        registry.stage_holding(
            owner,
            crucible,
            WrapHolding {
                receipt_balance: 0,
                deposited_at: 0,
            },
            1,
        );
        assert!(registry.confirm_holding(owner, crucible, 1));
        assert!(registry.holding(&owner, &crucible).is_none());
        assert!(registry.tracked_pairs().is_empty());
    }
}
