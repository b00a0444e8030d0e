//! Transaction handles and lifecycle management.

use crate::access::Rid;
use crate::catalog::TableOid;
use crate::concurrency::lock::{LockManager, LockMode, RowLockMode};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;

use super::id::{TransactionId, TransactionIdGenerator};
use super::state::{IsolationLevel, TransactionState};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransactionError {
    #[error("transaction {0} not found")]
    NotFound(TransactionId),
    #[error("transaction {0} is already {1}")]
    AlreadyFinished(TransactionId, TransactionState),
}

#[derive(Default)]
struct LockSets {
    shared_tables: HashSet<TableOid>,
    exclusive_tables: HashSet<TableOid>,
    intention_shared_tables: HashSet<TableOid>,
    intention_exclusive_tables: HashSet<TableOid>,
    shared_intention_exclusive_tables: HashSet<TableOid>,
    shared_rows: HashMap<TableOid, HashSet<Rid>>,
    exclusive_rows: HashMap<TableOid, HashSet<Rid>>,
}

impl LockSets {
    fn table_set(&mut self, mode: LockMode) -> &mut HashSet<TableOid> {
        match mode {
            LockMode::Shared => &mut self.shared_tables,
            LockMode::Exclusive => &mut self.exclusive_tables,
            LockMode::IntentionShared => &mut self.intention_shared_tables,
            LockMode::IntentionExclusive => &mut self.intention_exclusive_tables,
            LockMode::SharedIntentionExclusive => &mut self.shared_intention_exclusive_tables,
        }
    }

    fn row_map(&mut self, mode: RowLockMode) -> &mut HashMap<TableOid, HashSet<Rid>> {
        match mode {
            RowLockMode::Shared => &mut self.shared_rows,
            RowLockMode::Exclusive => &mut self.exclusive_rows,
        }
    }
}

struct TransactionInner {
    state: TransactionState,
    locks: LockSets,
}

/// A transaction: an id, an isolation level, a 2PL state, and the sets of
/// locks it holds at each granularity. Shared freely across threads; the
/// lock manager updates the lock sets as requests are granted and released.
pub struct Transaction {
    id: TransactionId,
    isolation_level: IsolationLevel,
    inner: Mutex<TransactionInner>,
}

impl Transaction {
    fn new(id: TransactionId, isolation_level: IsolationLevel) -> Self {
        Self {
            id,
            isolation_level,
            inner: Mutex::new(TransactionInner {
                state: TransactionState::Growing,
                locks: LockSets::default(),
            }),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn state(&self) -> TransactionState {
        self.inner.lock().unwrap().state
    }

    pub fn set_state(&self, state: TransactionState) {
        self.inner.lock().unwrap().state = state;
    }

    /// Moves a growing transaction to shrinking; no-op otherwise.
    pub(crate) fn begin_shrinking(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == TransactionState::Growing {
            inner.state = TransactionState::Shrinking;
        }
    }

    pub(crate) fn insert_table_lock(&self, mode: LockMode, oid: TableOid) {
        self.inner.lock().unwrap().locks.table_set(mode).insert(oid);
    }

    pub(crate) fn remove_table_lock(&self, mode: LockMode, oid: TableOid) {
        self.inner.lock().unwrap().locks.table_set(mode).remove(&oid);
    }

    pub(crate) fn insert_row_lock(&self, mode: RowLockMode, oid: TableOid, rid: Rid) {
        self.inner
            .lock()
            .unwrap()
            .locks
            .row_map(mode)
            .entry(oid)
            .or_default()
            .insert(rid);
    }

    pub(crate) fn remove_row_lock(&self, mode: RowLockMode, oid: TableOid, rid: Rid) {
        let mut inner = self.inner.lock().unwrap();
        let map = inner.locks.row_map(mode);
        if let Some(rids) = map.get_mut(&oid) {
            rids.remove(&rid);
            if rids.is_empty() {
                map.remove(&oid);
            }
        }
    }

    /// The table-lock mode held on `oid`, if any. A transaction holds at
    /// most one mode per object.
    pub fn held_table_lock(&self, oid: TableOid) -> Option<LockMode> {
        let inner = self.inner.lock().unwrap();
        let locks = &inner.locks;
        for (set, mode) in [
            (&locks.shared_tables, LockMode::Shared),
            (&locks.exclusive_tables, LockMode::Exclusive),
            (&locks.intention_shared_tables, LockMode::IntentionShared),
            (&locks.intention_exclusive_tables, LockMode::IntentionExclusive),
            (
                &locks.shared_intention_exclusive_tables,
                LockMode::SharedIntentionExclusive,
            ),
        ] {
            if set.contains(&oid) {
                return Some(mode);
            }
        }
        None
    }

    pub fn held_row_lock(&self, oid: TableOid, rid: Rid) -> Option<RowLockMode> {
        let inner = self.inner.lock().unwrap();
        if inner
            .locks
            .shared_rows
            .get(&oid)
            .is_some_and(|s| s.contains(&rid))
        {
            return Some(RowLockMode::Shared);
        }
        if inner
            .locks
            .exclusive_rows
            .get(&oid)
            .is_some_and(|s| s.contains(&rid))
        {
            return Some(RowLockMode::Exclusive);
        }
        None
    }

    /// True when any row under `oid` is still locked by this transaction.
    pub fn holds_row_locks_on(&self, oid: TableOid) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .locks
            .shared_rows
            .get(&oid)
            .is_some_and(|s| !s.is_empty())
            || inner
                .locks
                .exclusive_rows
                .get(&oid)
                .is_some_and(|s| !s.is_empty())
    }

    /// Snapshot of every held lock, rows first, for terminal release.
    pub(crate) fn held_locks(&self) -> (Vec<(RowLockMode, TableOid, Rid)>, Vec<(LockMode, TableOid)>) {
        let inner = self.inner.lock().unwrap();
        let locks = &inner.locks;
        let mut rows = Vec::new();
        for (&oid, rids) in &locks.shared_rows {
            rows.extend(rids.iter().map(|&rid| (RowLockMode::Shared, oid, rid)));
        }
        for (&oid, rids) in &locks.exclusive_rows {
            rows.extend(rids.iter().map(|&rid| (RowLockMode::Exclusive, oid, rid)));
        }
        let mut tables = Vec::new();
        for (set, mode) in [
            (&locks.shared_tables, LockMode::Shared),
            (&locks.exclusive_tables, LockMode::Exclusive),
            (&locks.intention_shared_tables, LockMode::IntentionShared),
            (&locks.intention_exclusive_tables, LockMode::IntentionExclusive),
            (
                &locks.shared_intention_exclusive_tables,
                LockMode::SharedIntentionExclusive,
            ),
        ] {
            tables.extend(set.iter().map(|&oid| (mode, oid)));
        }
        (rows, tables)
    }
}

/// Creates transactions, tracks them for the deadlock detector, and drives
/// commit/abort, which release every held lock (rows before tables).
pub struct TransactionManager {
    id_generator: TransactionIdGenerator,
    transactions: RwLock<HashMap<TransactionId, Arc<Transaction>>>,
    lock_manager: Arc<LockManager>,
}

impl TransactionManager {
    pub fn new(lock_manager: Arc<LockManager>) -> Self {
        Self {
            id_generator: TransactionIdGenerator::new(),
            transactions: RwLock::new(HashMap::new()),
            lock_manager,
        }
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    pub fn begin(&self, isolation_level: IsolationLevel) -> Arc<Transaction> {
        let id = self.id_generator.next();
        let txn = Arc::new(Transaction::new(id, isolation_level));
        self.transactions
            .write()
            .unwrap()
            .insert(id, Arc::clone(&txn));
        txn
    }

    pub fn get(&self, id: TransactionId) -> Option<Arc<Transaction>> {
        self.transactions.read().unwrap().get(&id).cloned()
    }

    pub fn commit(&self, txn: &Transaction) -> Result<(), TransactionError> {
        let state = txn.state();
        if state.is_finished() {
            return Err(TransactionError::AlreadyFinished(txn.id(), state));
        }
        txn.set_state(TransactionState::Committed);
        self.lock_manager.release_all(txn);
        Ok(())
    }

    pub fn abort(&self, txn: &Transaction) -> Result<(), TransactionError> {
        let state = txn.state();
        if state == TransactionState::Committed {
            return Err(TransactionError::AlreadyFinished(txn.id(), state));
        }
        txn.set_state(TransactionState::Aborted);
        self.lock_manager.release_all(txn);
        Ok(())
    }

    pub fn active_transactions(&self) -> Vec<TransactionId> {
        self.transactions
            .read()
            .unwrap()
            .iter()
            .filter(|(_, txn)| !txn.state().is_finished())
            .map(|(&id, _)| id)
            .collect()
    }

    /// Drops finished transactions from the registry; returns how many.
    pub fn cleanup_finished(&self) -> usize {
        let mut transactions = self.transactions.write().unwrap();
        let before = transactions.len();
        transactions.retain(|_, txn| !txn.state().is_finished());
        before - transactions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> TransactionManager {
        TransactionManager::new(Arc::new(LockManager::new()))
    }

    #[test]
    fn test_begin_assigns_unique_ids() {
        let manager = manager();
        let a = manager.begin(IsolationLevel::RepeatableRead);
        let b = manager.begin(IsolationLevel::ReadCommitted);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.state(), TransactionState::Growing);
        assert_eq!(b.isolation_level(), IsolationLevel::ReadCommitted);
        assert_eq!(manager.active_transactions().len(), 2);
    }

    #[test]
    fn test_commit() {
        let manager = manager();
        let txn = manager.begin(IsolationLevel::RepeatableRead);
        manager.commit(&txn).unwrap();
        assert_eq!(txn.state(), TransactionState::Committed);
        assert!(matches!(
            manager.commit(&txn),
            Err(TransactionError::AlreadyFinished(_, _))
        ));
    }

    #[test]
    fn test_abort() {
        let manager = manager();
        let txn = manager.begin(IsolationLevel::RepeatableRead);
        manager.abort(&txn).unwrap();
        assert_eq!(txn.state(), TransactionState::Aborted);
        // Aborting twice is tolerated (the deadlock detector may get there
        // first), committing afterwards is not.
        manager.abort(&txn).unwrap();
        assert!(manager.commit(&txn).is_err());
    }

    #[test]
    fn test_cleanup_finished() {
        let manager = manager();
        let a = manager.begin(IsolationLevel::RepeatableRead);
        let _b = manager.begin(IsolationLevel::RepeatableRead);
        manager.commit(&a).unwrap();

        assert_eq!(manager.cleanup_finished(), 1);
        assert!(manager.get(a.id()).is_none());
        assert_eq!(manager.active_transactions().len(), 1);
    }

    #[test]
    fn test_lock_set_bookkeeping() {
        let manager = manager();
        let txn = manager.begin(IsolationLevel::RepeatableRead);
        let oid = TableOid(7);
        let rid = Rid::new(crate::storage::page::PageId(1), 2);

        txn.insert_table_lock(LockMode::IntentionExclusive, oid);
        assert_eq!(txn.held_table_lock(oid), Some(LockMode::IntentionExclusive));

        txn.insert_row_lock(RowLockMode::Exclusive, oid, rid);
        assert!(txn.holds_row_locks_on(oid));
        assert_eq!(txn.held_row_lock(oid, rid), Some(RowLockMode::Exclusive));

        txn.remove_row_lock(RowLockMode::Exclusive, oid, rid);
        assert!(!txn.holds_row_locks_on(oid));
        txn.remove_table_lock(LockMode::IntentionExclusive, oid);
        assert_eq!(txn.held_table_lock(oid), None);
    }

    #[test]
    fn test_begin_shrinking_only_from_growing() {
        let manager = manager();
        let txn = manager.begin(IsolationLevel::RepeatableRead);
        txn.begin_shrinking();
        assert_eq!(txn.state(), TransactionState::Shrinking);

        txn.set_state(TransactionState::Committed);
        txn.begin_shrinking();
        assert_eq!(txn.state(), TransactionState::Committed);
    }
}
