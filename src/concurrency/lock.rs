//! Hierarchical lock manager: multi-granularity two-phase locking.
//!
//! Tables take any of the five modes (IS, IX, S, SIX, X); rows take only S
//! and X and require a covering table lock. Each lockable object owns a
//! queue of requests guarded by its own mutex and condition variable: a
//! request is granted once every granted request is compatible with it and
//! it heads the wait region (upgrades jump the wait region but never the
//! holders). Grant order for new requests is FIFO.
//!
//! A waits-for graph can be derived from queue state at any time; the
//! deadlock detector aborts the youngest transaction of each cycle and
//! wakes the queues it sleeps on.

use crate::access::Rid;
use crate::catalog::TableOid;
use crate::transaction::manager::{Transaction, TransactionManager};
use crate::transaction::state::{IsolationLevel, TransactionState};
use crate::transaction::TransactionId;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;

/// Polling cadence of the background deadlock detector.
pub const DEADLOCK_DETECTION_INTERVAL: Duration = Duration::from_millis(50);

/// Table-granularity lock modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    IntentionShared,
    IntentionExclusive,
    Shared,
    SharedIntentionExclusive,
    Exclusive,
}

impl LockMode {
    /// The multi-granularity compatibility matrix.
    pub fn is_compatible_with(&self, other: &LockMode) -> bool {
        use LockMode::*;
        matches!(
            (self, other),
            (IntentionShared, IntentionShared | IntentionExclusive | Shared | SharedIntentionExclusive)
                | (IntentionExclusive, IntentionShared | IntentionExclusive)
                | (Shared, IntentionShared | Shared)
                | (SharedIntentionExclusive, IntentionShared)
        )
    }

    /// Legal strengthenings of an already-held mode.
    pub fn can_upgrade_to(&self, to: LockMode) -> bool {
        use LockMode::*;
        matches!(
            (self, to),
            (IntentionShared, Shared | Exclusive | IntentionExclusive | SharedIntentionExclusive)
                | (Shared, Exclusive | SharedIntentionExclusive)
                | (IntentionExclusive, Exclusive | SharedIntentionExclusive)
                | (SharedIntentionExclusive, Exclusive)
        )
    }
}

impl std::fmt::Display for LockMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::IntentionShared => "IS",
            Self::IntentionExclusive => "IX",
            Self::Shared => "S",
            Self::SharedIntentionExclusive => "SIX",
            Self::Exclusive => "X",
        };
        write!(f, "{name}")
    }
}

/// Row-granularity modes; intent modes on rows are unrepresentable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RowLockMode {
    Shared,
    Exclusive,
}

impl RowLockMode {
    fn as_lock_mode(self) -> LockMode {
        match self {
            Self::Shared => LockMode::Shared,
            Self::Exclusive => LockMode::Exclusive,
        }
    }
}

/// Why a lock request aborted its transaction.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    #[error("lock requested in the shrinking phase")]
    LockOnShrinking,
    #[error("shared lock requested under read-uncommitted")]
    LockSharedOnReadUncommitted,
    #[error("another transaction is already upgrading on this queue")]
    UpgradeConflict,
    #[error("requested mode is not a legal upgrade of the held mode")]
    IncompatibleUpgrade,
    #[error("no covering table lock for the requested row lock")]
    TableLockNotPresent,
    #[error("table unlocked while row locks are still held under it")]
    TableUnlockedBeforeUnlockingRows,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// The request violated a rule; the transaction has been aborted.
    #[error("{txn_id} aborted: {reason}")]
    Abort {
        txn_id: TransactionId,
        reason: AbortReason,
    },
    /// The transaction was aborted (e.g. by the deadlock detector) while
    /// blocked; its request has been withdrawn.
    #[error("{0} was aborted while waiting for a lock")]
    AbortedWhileWaiting(TransactionId),
    /// Release of a lock that is not held. Does not abort.
    #[error("{txn_id} holds no lock on the requested object")]
    NotHeld { txn_id: TransactionId },
}

#[derive(Debug)]
struct LockRequest {
    txn_id: TransactionId,
    mode: LockMode,
    granted: bool,
}

impl LockRequest {
    fn new(txn_id: TransactionId, mode: LockMode) -> Self {
        Self {
            txn_id,
            mode,
            granted: false,
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    requests: VecDeque<LockRequest>,
    /// Transaction currently upgrading on this queue, if any. At most one
    /// upgrade may be in flight per queue.
    upgrading: Option<TransactionId>,
}

impl QueueState {
    /// A request is granted iff every granted request is compatible with it
    /// and it heads the wait region (or is the in-flight upgrade).
    fn can_grant(&self, txn_id: TransactionId, mode: LockMode) -> bool {
        let mut first_waiter = None;
        for request in &self.requests {
            if request.granted {
                if request.txn_id != txn_id && !request.mode.is_compatible_with(&mode) {
                    return false;
                }
            } else if first_waiter.is_none() {
                first_waiter = Some(request.txn_id);
            }
        }
        first_waiter == Some(txn_id) || self.upgrading == Some(txn_id)
    }
}

struct LockRequestQueue {
    state: Mutex<QueueState>,
    cv: Condvar,
}

impl LockRequestQueue {
    fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            cv: Condvar::new(),
        }
    }
}

/// The lock manager. One queue per table oid and one per (oid, rid).
pub struct LockManager {
    table_queues: Mutex<HashMap<TableOid, Arc<LockRequestQueue>>>,
    row_queues: Mutex<HashMap<(TableOid, Rid), Arc<LockRequestQueue>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            table_queues: Mutex::new(HashMap::new()),
            row_queues: Mutex::new(HashMap::new()),
        }
    }

    /// Acquires (or upgrades to) `mode` on table `oid`, blocking until the
    /// request can be granted.
    pub fn lock_table(
        &self,
        txn: &Transaction,
        mode: LockMode,
        oid: TableOid,
    ) -> Result<(), LockError> {
        self.validate_request(txn, mode)?;
        let queue = self.table_queue(oid);
        self.acquire(txn, mode, &queue, |txn, held| match held {
            Some(old) => txn.remove_table_lock(old, oid),
            None => txn.insert_table_lock(mode, oid),
        })
    }

    /// Releases the table lock held on `oid`. Aborts the transaction if row
    /// locks under the table are still held.
    pub fn unlock_table(&self, txn: &Transaction, oid: TableOid) -> Result<(), LockError> {
        if txn.holds_row_locks_on(oid) {
            return Err(self.abort_txn(txn, AbortReason::TableUnlockedBeforeUnlockingRows));
        }

        let queue = self.table_queue(oid);
        let mut state = queue.state.lock().unwrap();
        let pos = state
            .requests
            .iter()
            .position(|r| r.txn_id == txn.id() && r.granted)
            .ok_or(LockError::NotHeld { txn_id: txn.id() })?;
        let mode = state.requests[pos].mode;
        state.requests.remove(pos);
        txn.remove_table_lock(mode, oid);

        if Self::release_triggers_shrinking(txn.isolation_level(), mode) {
            txn.begin_shrinking();
        }
        queue.cv.notify_all();
        Ok(())
    }

    /// Acquires (or upgrades to) a row lock. Requires a covering table
    /// lock: IS or stronger for S, IX/SIX/X for X.
    pub fn lock_row(
        &self,
        txn: &Transaction,
        mode: RowLockMode,
        oid: TableOid,
        rid: Rid,
    ) -> Result<(), LockError> {
        let lock_mode = mode.as_lock_mode();
        self.validate_request(txn, lock_mode)?;

        let covering = txn.held_table_lock(oid);
        let covered = match mode {
            RowLockMode::Shared => covering.is_some(),
            RowLockMode::Exclusive => matches!(
                covering,
                Some(LockMode::IntentionExclusive)
                    | Some(LockMode::SharedIntentionExclusive)
                    | Some(LockMode::Exclusive)
            ),
        };
        if !covered {
            return Err(self.abort_txn(txn, AbortReason::TableLockNotPresent));
        }

        let queue = self.row_queue(oid, rid);
        self.acquire(txn, lock_mode, &queue, |txn, held| match held {
            Some(LockMode::Shared) => txn.remove_row_lock(RowLockMode::Shared, oid, rid),
            Some(LockMode::Exclusive) => txn.remove_row_lock(RowLockMode::Exclusive, oid, rid),
            Some(_) => unreachable!("row queues only hold S and X requests"),
            None => txn.insert_row_lock(mode, oid, rid),
        })
    }

    /// Releases the row lock held on `(oid, rid)`.
    pub fn unlock_row(&self, txn: &Transaction, oid: TableOid, rid: Rid) -> Result<(), LockError> {
        let queue = self.row_queue(oid, rid);
        let mut state = queue.state.lock().unwrap();
        let pos = state
            .requests
            .iter()
            .position(|r| r.txn_id == txn.id() && r.granted)
            .ok_or(LockError::NotHeld { txn_id: txn.id() })?;
        let mode = state.requests[pos].mode;
        state.requests.remove(pos);
        let row_mode = match mode {
            LockMode::Shared => RowLockMode::Shared,
            LockMode::Exclusive => RowLockMode::Exclusive,
            _ => unreachable!("row queues only hold S and X requests"),
        };
        txn.remove_row_lock(row_mode, oid, rid);

        if Self::release_triggers_shrinking(txn.isolation_level(), mode) {
            txn.begin_shrinking();
        }
        queue.cv.notify_all();
        Ok(())
    }

    /// Withdraws every request of `txn` from every queue, clears its lock
    /// sets, and wakes affected waiters. Used on commit and abort; no phase
    /// transitions apply.
    pub fn release_all(&self, txn: &Transaction) {
        for queue in self.all_queues() {
            let mut state = queue.state.lock().unwrap();
            let before = state.requests.len();
            state.requests.retain(|r| r.txn_id != txn.id());
            if state.upgrading == Some(txn.id()) {
                state.upgrading = None;
            }
            if state.requests.len() != before {
                queue.cv.notify_all();
            }
        }

        let (rows, tables) = txn.held_locks();
        for (mode, oid, rid) in rows {
            txn.remove_row_lock(mode, oid, rid);
        }
        for (mode, oid) in tables {
            txn.remove_table_lock(mode, oid);
        }
    }

    /// The current waits-for graph: one edge from each waiting request to
    /// each granted request it conflicts with, in deterministic order.
    pub fn waits_for_edges(&self) -> Vec<(TransactionId, TransactionId)> {
        let mut edges = BTreeSet::new();
        for queue in self.all_queues() {
            let state = queue.state.lock().unwrap();
            for waiter in state.requests.iter().filter(|r| !r.granted) {
                for holder in state.requests.iter().filter(|r| r.granted) {
                    if holder.txn_id != waiter.txn_id
                        && !holder.mode.is_compatible_with(&waiter.mode)
                    {
                        edges.insert((waiter.txn_id, holder.txn_id));
                    }
                }
            }
        }
        edges.into_iter().collect()
    }

    /// One detection round: finds every cycle in the waits-for graph,
    /// aborts the youngest (highest-id) member of each, and wakes the
    /// queues it was sleeping on. Returns the victims.
    pub fn detect_deadlocks(&self, registry: &TransactionManager) -> Vec<TransactionId> {
        let mut graph: BTreeMap<TransactionId, BTreeSet<TransactionId>> = BTreeMap::new();
        for (waiter, holder) in self.waits_for_edges() {
            graph.entry(waiter).or_default().insert(holder);
        }

        let mut victims = Vec::new();
        while let Some(cycle) = find_cycle(&graph) {
            let victim = *cycle.iter().max().expect("cycles are non-empty");
            victims.push(victim);
            graph.remove(&victim);
            for targets in graph.values_mut() {
                targets.remove(&victim);
            }
        }

        for &victim in &victims {
            log::debug!("deadlock detected; aborting youngest participant {victim}");
            if let Some(txn) = registry.get(victim) {
                txn.set_state(TransactionState::Aborted);
            }
            // Wake the victim wherever it is blocked so it can withdraw.
            for queue in self.all_queues() {
                let state = queue.state.lock().unwrap();
                if state
                    .requests
                    .iter()
                    .any(|r| r.txn_id == victim && !r.granted)
                {
                    queue.cv.notify_all();
                }
            }
        }
        victims
    }

    /// Spawns the background detection thread with a fixed interval.
    pub fn spawn_deadlock_detector(
        self: &Arc<Self>,
        registry: Arc<TransactionManager>,
        interval: Duration,
    ) -> DeadlockDetector {
        let stop = Arc::new(AtomicBool::new(false));
        let lock_manager = Arc::clone(self);
        let stop_flag = Arc::clone(&stop);
        let handle = std::thread::spawn(move || {
            while !stop_flag.load(Ordering::Relaxed) {
                std::thread::sleep(interval);
                if stop_flag.load(Ordering::Relaxed) {
                    break;
                }
                lock_manager.detect_deadlocks(&registry);
            }
        });
        DeadlockDetector {
            stop,
            handle: Some(handle),
        }
    }

    /// Common queue protocol for tables and rows. `update_sets` is called
    /// under the queue latch with the previously held mode on removal (for
    /// an upgrade) and with `None` once the new request is granted.
    fn acquire(
        &self,
        txn: &Transaction,
        mode: LockMode,
        queue: &Arc<LockRequestQueue>,
        update_sets: impl Fn(&Transaction, Option<LockMode>),
    ) -> Result<(), LockError> {
        let mut state = queue.state.lock().unwrap();

        let held = state
            .requests
            .iter()
            .position(|r| r.txn_id == txn.id() && r.granted);
        if let Some(pos) = held {
            let held_mode = state.requests[pos].mode;
            if held_mode == mode {
                return Ok(());
            }
            if state.upgrading.is_some() {
                drop(state);
                return Err(self.abort_txn(txn, AbortReason::UpgradeConflict));
            }
            if !held_mode.can_upgrade_to(mode) {
                drop(state);
                return Err(self.abort_txn(txn, AbortReason::IncompatibleUpgrade));
            }
            // Drop the held request; the upgrade waits ahead of every other
            // waiter but behind the remaining holders.
            state.requests.remove(pos);
            update_sets(txn, Some(held_mode));
            state.upgrading = Some(txn.id());
            let insert_at = state
                .requests
                .iter()
                .position(|r| !r.granted)
                .unwrap_or(state.requests.len());
            state
                .requests
                .insert(insert_at, LockRequest::new(txn.id(), mode));
        } else {
            state.requests.push_back(LockRequest::new(txn.id(), mode));
        }

        loop {
            if state.can_grant(txn.id(), mode) {
                let pos = state
                    .requests
                    .iter()
                    .position(|r| r.txn_id == txn.id() && !r.granted)
                    .expect("request is still queued");
                state.requests[pos].granted = true;
                if state.upgrading == Some(txn.id()) {
                    state.upgrading = None;
                }
                update_sets(txn, None);
                queue.cv.notify_all();
                return Ok(());
            }

            state = queue.cv.wait(state).unwrap();

            if txn.state() == TransactionState::Aborted {
                if let Some(pos) = state
                    .requests
                    .iter()
                    .position(|r| r.txn_id == txn.id() && !r.granted)
                {
                    state.requests.remove(pos);
                }
                if state.upgrading == Some(txn.id()) {
                    state.upgrading = None;
                }
                queue.cv.notify_all();
                return Err(LockError::AbortedWhileWaiting(txn.id()));
            }
        }
    }

    /// Isolation-level and 2PL phase rules, applied before queueing.
    fn validate_request(&self, txn: &Transaction, mode: LockMode) -> Result<(), LockError> {
        use LockMode::*;
        if txn.state() == TransactionState::Aborted {
            return Err(LockError::AbortedWhileWaiting(txn.id()));
        }
        let shrinking = txn.state() == TransactionState::Shrinking;
        match txn.isolation_level() {
            IsolationLevel::ReadUncommitted => {
                if matches!(mode, Shared | IntentionShared | SharedIntentionExclusive) {
                    return Err(self.abort_txn(txn, AbortReason::LockSharedOnReadUncommitted));
                }
                if shrinking {
                    return Err(self.abort_txn(txn, AbortReason::LockOnShrinking));
                }
            }
            IsolationLevel::ReadCommitted => {
                if shrinking && !matches!(mode, Shared | IntentionShared) {
                    return Err(self.abort_txn(txn, AbortReason::LockOnShrinking));
                }
            }
            IsolationLevel::RepeatableRead => {
                if shrinking {
                    return Err(self.abort_txn(txn, AbortReason::LockOnShrinking));
                }
            }
        }
        Ok(())
    }

    fn release_triggers_shrinking(isolation: IsolationLevel, mode: LockMode) -> bool {
        match isolation {
            IsolationLevel::RepeatableRead => {
                matches!(mode, LockMode::Shared | LockMode::Exclusive)
            }
            IsolationLevel::ReadCommitted | IsolationLevel::ReadUncommitted => {
                matches!(mode, LockMode::Exclusive)
            }
        }
    }

    fn abort_txn(&self, txn: &Transaction, reason: AbortReason) -> LockError {
        txn.set_state(TransactionState::Aborted);
        LockError::Abort {
            txn_id: txn.id(),
            reason,
        }
    }

    fn table_queue(&self, oid: TableOid) -> Arc<LockRequestQueue> {
        self.table_queues
            .lock()
            .unwrap()
            .entry(oid)
            .or_insert_with(|| Arc::new(LockRequestQueue::new()))
            .clone()
    }

    fn row_queue(&self, oid: TableOid, rid: Rid) -> Arc<LockRequestQueue> {
        self.row_queues
            .lock()
            .unwrap()
            .entry((oid, rid))
            .or_insert_with(|| Arc::new(LockRequestQueue::new()))
            .clone()
    }

    fn all_queues(&self) -> Vec<Arc<LockRequestQueue>> {
        let mut queues: Vec<_> = self.table_queues.lock().unwrap().values().cloned().collect();
        queues.extend(self.row_queues.lock().unwrap().values().cloned());
        queues
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to the background detection thread; stops it on drop.
pub struct DeadlockDetector {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl DeadlockDetector {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DeadlockDetector {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Finds one cycle in the graph via DFS, visiting nodes and neighbors in
/// ascending id order so detection is deterministic.
fn find_cycle(graph: &BTreeMap<TransactionId, BTreeSet<TransactionId>>) -> Option<Vec<TransactionId>> {
    fn dfs(
        node: TransactionId,
        graph: &BTreeMap<TransactionId, BTreeSet<TransactionId>>,
        visited: &mut BTreeSet<TransactionId>,
        stack: &mut Vec<TransactionId>,
        on_stack: &mut BTreeSet<TransactionId>,
    ) -> Option<Vec<TransactionId>> {
        visited.insert(node);
        stack.push(node);
        on_stack.insert(node);

        if let Some(neighbors) = graph.get(&node) {
            for &next in neighbors {
                if on_stack.contains(&next) {
                    let start = stack
                        .iter()
                        .position(|&n| n == next)
                        .expect("node on stack");
                    return Some(stack[start..].to_vec());
                }
                if !visited.contains(&next) {
                    if let Some(cycle) = dfs(next, graph, visited, stack, on_stack) {
                        return Some(cycle);
                    }
                }
            }
        }

        stack.pop();
        on_stack.remove(&node);
        None
    }

    let mut visited = BTreeSet::new();
    for &start in graph.keys() {
        if !visited.contains(&start) {
            let mut stack = Vec::new();
            let mut on_stack = BTreeSet::new();
            if let Some(cycle) = dfs(start, graph, &mut visited, &mut stack, &mut on_stack) {
                return Some(cycle);
            }
        }
    }
    None
}
