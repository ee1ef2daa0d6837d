//! Multi-granularity lock manager.
//!
//! Hierarchical table/record locking with FIFO request queues, one condition
//! variable per lock entry, and waits-for deadlock detection. All state sits
//! behind a single latch; waiters block on their entry's condvar and re-check
//! compatibility after every broadcast.

use crate::transaction::{IsolationLevel, Transaction, TransactionState, TxnId};
use basalt_common::page::{FileId, Rid};
use basalt_common::{AbortReason, BasaltError, Result};
use log::debug;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// What a lock protects: a whole table file or one record in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockTarget {
    Table,
    Record(Rid),
}

/// Key of one lock table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockDataId {
    pub fd: FileId,
    pub target: LockTarget,
}

impl LockDataId {
    pub fn table(fd: FileId) -> Self {
        Self {
            fd,
            target: LockTarget::Table,
        }
    }

    pub fn record(fd: FileId, rid: Rid) -> Self {
        Self {
            fd,
            target: LockTarget::Record(rid),
        }
    }
}

/// Requestable lock modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    IntentionShared,
    IntentionExclusive,
    Shared,
    SharedIntentionExclusive,
    Exclusive,
}

/// Join of the granted modes on one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupLockMode {
    NonLock,
    IntentionShared,
    IntentionExclusive,
    Shared,
    SharedIntentionExclusive,
    Exclusive,
}

/// Compatibility of a requested mode against the group mode of the locks
/// already granted to other transactions.
fn compatible(group: GroupLockMode, req: LockMode) -> bool {
    use GroupLockMode as G;
    use LockMode as M;
    match group {
        G::NonLock => true,
        G::IntentionShared => req != M::Exclusive,
        G::IntentionExclusive => matches!(req, M::IntentionShared | M::IntentionExclusive),
        G::Shared => matches!(req, M::IntentionShared | M::Shared),
        G::SharedIntentionExclusive => req == M::IntentionShared,
        G::Exclusive => false,
    }
}

/// Folds one granted mode into a group mode.
fn group_join(group: GroupLockMode, mode: LockMode) -> GroupLockMode {
    use GroupLockMode as G;
    use LockMode as M;
    match mode {
        M::Exclusive => G::Exclusive,
        M::SharedIntentionExclusive => {
            if group == G::Exclusive {
                group
            } else {
                G::SharedIntentionExclusive
            }
        }
        M::Shared => match group {
            G::Exclusive | G::SharedIntentionExclusive => group,
            G::IntentionExclusive => G::SharedIntentionExclusive,
            _ => G::Shared,
        },
        M::IntentionExclusive => match group {
            G::Exclusive | G::SharedIntentionExclusive => group,
            G::Shared => G::SharedIntentionExclusive,
            _ => G::IntentionExclusive,
        },
        M::IntentionShared => {
            if group == G::NonLock {
                G::IntentionShared
            } else {
                group
            }
        }
    }
}

/// True if a held mode already grants everything the requested mode would.
fn covers(held: LockMode, req: LockMode) -> bool {
    use LockMode as M;
    match held {
        M::Exclusive => true,
        M::SharedIntentionExclusive => req != M::Exclusive,
        M::Shared => matches!(req, M::Shared | M::IntentionShared),
        M::IntentionExclusive => matches!(req, M::IntentionExclusive | M::IntentionShared),
        M::IntentionShared => req == M::IntentionShared,
    }
}

/// The mode an upgrade must acquire so the held rights are not lost:
/// holding IX and asking for S (or vice versa) needs SIX, anything else
/// needs the requested mode itself.
fn upgraded_mode(held: LockMode, req: LockMode) -> LockMode {
    use LockMode as M;
    match (held, req) {
        (M::IntentionExclusive, M::Shared) | (M::Shared, M::IntentionExclusive) => {
            M::SharedIntentionExclusive
        }
        _ => req,
    }
}

#[derive(Debug, Clone, Copy)]
struct LockRequest {
    txn_id: TxnId,
    mode: LockMode,
    granted: bool,
}

struct LockEntry {
    queue: VecDeque<LockRequest>,
    group_mode: GroupLockMode,
    /// Transaction currently re-queued for an upgrade, if any. Only one
    /// upgrade may be in flight per entry.
    upgrading: Option<TxnId>,
    cv: Arc<Condvar>,
}

impl Default for LockEntry {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            group_mode: GroupLockMode::NonLock,
            upgrading: None,
            cv: Arc::new(Condvar::new()),
        }
    }
}

impl LockEntry {
    fn group_excluding(&self, txn_id: TxnId) -> GroupLockMode {
        self.queue
            .iter()
            .filter(|r| r.granted && r.txn_id != txn_id)
            .fold(GroupLockMode::NonLock, |g, r| group_join(g, r.mode))
    }

    fn recompute_group(&mut self) {
        self.group_mode = self
            .queue
            .iter()
            .filter(|r| r.granted)
            .fold(GroupLockMode::NonLock, |g, r| group_join(g, r.mode));
    }

    /// Grants waiting requests in FIFO order up to the first incompatible one.
    fn try_grant(&mut self) {
        while let Some(pos) = self.queue.iter().position(|r| !r.granted) {
            let req = self.queue[pos];
            if compatible(self.group_excluding(req.txn_id), req.mode) {
                self.queue[pos].granted = true;
            } else {
                break;
            }
        }
        self.recompute_group();
    }
}

struct LockManagerInner {
    lock_table: HashMap<LockDataId, LockEntry>,
    /// Edges from a waiting transaction to the holders it waits on.
    waits_for: HashMap<TxnId, HashSet<TxnId>>,
}

/// The lock manager.
pub struct LockManager {
    inner: Mutex<LockManagerInner>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LockManagerInner {
                lock_table: HashMap::new(),
                waits_for: HashMap::new(),
            }),
        }
    }

    /// Shared lock on one record.
    pub fn lock_shared_on_record(&self, txn: &Transaction, rid: Rid, fd: FileId) -> Result<()> {
        self.lock(txn, LockDataId::record(fd, rid), LockMode::Shared)
    }

    /// Exclusive lock on one record.
    pub fn lock_exclusive_on_record(&self, txn: &Transaction, rid: Rid, fd: FileId) -> Result<()> {
        self.lock(txn, LockDataId::record(fd, rid), LockMode::Exclusive)
    }

    /// Shared lock on a whole table.
    pub fn lock_shared_on_table(&self, txn: &Transaction, fd: FileId) -> Result<()> {
        self.lock(txn, LockDataId::table(fd), LockMode::Shared)
    }

    /// Exclusive lock on a whole table.
    pub fn lock_exclusive_on_table(&self, txn: &Transaction, fd: FileId) -> Result<()> {
        self.lock(txn, LockDataId::table(fd), LockMode::Exclusive)
    }

    /// Intention-shared lock on a table.
    pub fn lock_is_on_table(&self, txn: &Transaction, fd: FileId) -> Result<()> {
        self.lock(txn, LockDataId::table(fd), LockMode::IntentionShared)
    }

    /// Intention-exclusive lock on a table.
    pub fn lock_ix_on_table(&self, txn: &Transaction, fd: FileId) -> Result<()> {
        self.lock(txn, LockDataId::table(fd), LockMode::IntentionExclusive)
    }

    fn abort(&self, txn: &Transaction, reason: AbortReason) -> BasaltError {
        txn.set_state(TransactionState::Aborted);
        debug!("txn {} forced to abort: {reason}", txn.id());
        BasaltError::TransactionAborted {
            txn_id: txn.id(),
            reason,
        }
    }

    fn lock(&self, txn: &Transaction, id: LockDataId, mode: LockMode) -> Result<()> {
        // READ UNCOMMITTED takes no locks at all; a request is a client bug.
        if txn.isolation_level() == IsolationLevel::ReadUncommitted {
            return Err(self.abort(txn, AbortReason::LockOnShrinking));
        }
        match txn.state() {
            TransactionState::Growing => {}
            TransactionState::Shrinking => {
                return Err(self.abort(txn, AbortReason::LockOnShrinking));
            }
            TransactionState::Committed | TransactionState::Aborted => {
                return Err(BasaltError::TransactionAborted {
                    txn_id: txn.id(),
                    reason: AbortReason::LockOnShrinking,
                });
            }
        }

        let txn_id = txn.id();
        let mut mode = mode;
        let mut inner = self.inner.lock();
        let entry = inner.lock_table.entry(id).or_default();

        // Fast path: an already-held mode that covers the request.
        if let Some(held) = entry
            .queue
            .iter()
            .find(|r| r.txn_id == txn_id && r.granted)
            .copied()
        {
            if covers(held.mode, mode) {
                return Ok(());
            }
            // Upgrade: only one transaction may be re-queued per entry.
            if entry.upgrading.is_some() {
                drop(inner);
                return Err(self.abort(txn, AbortReason::UpgradeConflict));
            }
            mode = upgraded_mode(held.mode, mode);
            entry.upgrading = Some(txn_id);
            entry.queue.retain(|r| r.txn_id != txn_id);
            entry.recompute_group();
        }

        // Upgrades enter ahead of plain waiters; everyone else joins the tail.
        let insert_at = if entry.upgrading == Some(txn_id) {
            entry
                .queue
                .iter()
                .position(|r| !r.granted)
                .unwrap_or(entry.queue.len())
        } else {
            entry.queue.len()
        };
        entry.queue.insert(
            insert_at,
            LockRequest {
                txn_id,
                mode,
                granted: false,
            },
        );
        txn.lock_set().lock().insert(id);

        loop {
            let entry = inner.lock_table.get_mut(&id).expect("entry exists while waiting");
            entry.try_grant();

            if entry
                .queue
                .iter()
                .any(|r| r.txn_id == txn_id && r.granted && r.mode == mode)
            {
                if entry.upgrading == Some(txn_id) {
                    entry.upgrading = None;
                }
                let cv = entry.cv.clone();
                inner.waits_for.remove(&txn_id);
                // Granting may have changed the group mode; let peers re-check.
                cv.notify_all();
                return Ok(());
            }

            // Blocked: refresh our waits-for edges and look for a cycle.
            let holders: HashSet<TxnId> = entry
                .queue
                .iter()
                .filter(|r| r.granted && r.txn_id != txn_id)
                .filter(|r| !compatible(group_join(GroupLockMode::NonLock, r.mode), mode))
                .map(|r| r.txn_id)
                .collect();
            let cv = entry.cv.clone();
            inner.waits_for.insert(txn_id, holders);

            if wait_cycle(&inner.waits_for, txn_id) {
                let entry = inner.lock_table.get_mut(&id).expect("entry exists");
                entry.queue.retain(|r| !(r.txn_id == txn_id && !r.granted));
                if entry.upgrading == Some(txn_id) {
                    entry.upgrading = None;
                }
                entry.try_grant();
                let still_holds = entry.queue.iter().any(|r| r.txn_id == txn_id && r.granted);
                if entry.queue.is_empty() {
                    inner.lock_table.remove(&id);
                }
                if !still_holds {
                    txn.lock_set().lock().remove(&id);
                }
                inner.waits_for.remove(&txn_id);
                for edges in inner.waits_for.values_mut() {
                    edges.remove(&txn_id);
                }
                drop(inner);
                cv.notify_all();
                return Err(self.abort(txn, AbortReason::Deadlock));
            }

            cv.wait(&mut inner);
        }
    }

    /// Releases one lock held by `txn`.
    ///
    /// Removes the transaction's requests from the entry, recomputes the
    /// group mode from the surviving granted requests, and wakes all waiters.
    /// Under strict 2PL this moves the transaction to Shrinking; the one
    /// exception is the early release of a read lock at READ COMMITTED,
    /// which by design does not end the growing phase.
    pub fn unlock(&self, txn: &Transaction, id: LockDataId) -> bool {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.lock_table.get_mut(&id) else {
            return false;
        };

        let mut removed = Vec::new();
        entry.queue.retain(|r| {
            if r.txn_id == txn.id() {
                removed.push(r.mode);
                false
            } else {
                true
            }
        });
        if removed.is_empty() {
            return false;
        }
        if entry.upgrading == Some(txn.id()) {
            entry.upgrading = None;
        }
        entry.recompute_group();
        entry.try_grant();
        let cv = entry.cv.clone();
        if entry.queue.is_empty() {
            inner.lock_table.remove(&id);
        }
        drop(inner);

        txn.lock_set().lock().remove(&id);

        let read_only_release = removed
            .iter()
            .all(|m| matches!(m, LockMode::Shared | LockMode::IntentionShared));
        if txn.state() == TransactionState::Growing
            && !(txn.isolation_level() == IsolationLevel::ReadCommitted && read_only_release)
        {
            txn.set_state(TransactionState::Shrinking);
        }

        cv.notify_all();
        true
    }

    /// Releases every lock in the transaction's lock set.
    pub fn release_all(&self, txn: &Transaction) {
        let ids: Vec<LockDataId> = txn.lock_set().lock().iter().copied().collect();
        for id in ids {
            self.unlock(txn, id);
        }
    }
}

/// True if `start` can reach itself through the waits-for edges.
fn wait_cycle(waits_for: &HashMap<TxnId, HashSet<TxnId>>, start: TxnId) -> bool {
    let mut stack: Vec<TxnId> = waits_for
        .get(&start)
        .map(|s| s.iter().copied().collect())
        .unwrap_or_default();
    let mut visited = HashSet::new();
    while let Some(t) = stack.pop() {
        if t == start {
            return true;
        }
        if visited.insert(t) {
            if let Some(next) = waits_for.get(&t) {
                stack.extend(next.iter().copied());
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn fd() -> FileId {
        FileId(0)
    }

    #[test]
    fn test_shared_locks_coexist() {
        let mgr = LockManager::new();
        let t1 = Transaction::new(1);
        let t2 = Transaction::new(2);
        let rid = Rid::new(1, 0);

        mgr.lock_shared_on_record(&t1, rid, fd()).unwrap();
        mgr.lock_shared_on_record(&t2, rid, fd()).unwrap();
        assert_eq!(t1.state(), TransactionState::Growing);
        assert_eq!(t2.state(), TransactionState::Growing);
    }

    #[test]
    fn test_intention_locks_coexist() {
        let mgr = LockManager::new();
        let t1 = Transaction::new(1);
        let t2 = Transaction::new(2);

        mgr.lock_is_on_table(&t1, fd()).unwrap();
        mgr.lock_ix_on_table(&t2, fd()).unwrap();
        mgr.lock_shared_on_record(&t2, Rid::new(1, 0), fd()).unwrap();
    }

    #[test]
    fn test_reentrant_lock_is_noop() {
        let mgr = LockManager::new();
        let t1 = Transaction::new(1);
        let rid = Rid::new(1, 0);

        mgr.lock_exclusive_on_record(&t1, rid, fd()).unwrap();
        // X covers S; no second request is queued.
        mgr.lock_shared_on_record(&t1, rid, fd()).unwrap();
        assert_eq!(t1.lock_set().lock().len(), 1);
    }

    #[test]
    fn test_read_uncommitted_may_not_lock() {
        let mgr = LockManager::new();
        let t1 = Transaction::new(1);
        t1.set_isolation_level(IsolationLevel::ReadUncommitted);

        let err = mgr.lock_shared_on_record(&t1, Rid::new(1, 0), fd()).unwrap_err();
        assert!(matches!(
            err,
            BasaltError::TransactionAborted {
                reason: AbortReason::LockOnShrinking,
                ..
            }
        ));
        assert_eq!(t1.state(), TransactionState::Aborted);
    }

    #[test]
    fn test_lock_while_shrinking_aborts() {
        let mgr = LockManager::new();
        let t1 = Transaction::new(1);
        let r1 = Rid::new(1, 0);
        let r2 = Rid::new(1, 1);

        mgr.lock_shared_on_record(&t1, r1, fd()).unwrap();
        assert!(mgr.unlock(&t1, LockDataId::record(fd(), r1)));
        assert_eq!(t1.state(), TransactionState::Shrinking);

        let err = mgr.lock_shared_on_record(&t1, r2, fd()).unwrap_err();
        assert!(matches!(
            err,
            BasaltError::TransactionAborted {
                reason: AbortReason::LockOnShrinking,
                ..
            }
        ));
    }

    #[test]
    fn test_read_committed_early_release_keeps_growing() {
        let mgr = LockManager::new();
        let t1 = Transaction::new(1);
        t1.set_isolation_level(IsolationLevel::ReadCommitted);
        let r1 = Rid::new(1, 0);
        let r2 = Rid::new(1, 1);

        mgr.lock_shared_on_record(&t1, r1, fd()).unwrap();
        assert!(mgr.unlock(&t1, LockDataId::record(fd(), r1)));
        assert_eq!(t1.state(), TransactionState::Growing);
        // A later read still locks.
        mgr.lock_shared_on_record(&t1, r2, fd()).unwrap();
    }

    #[test]
    fn test_exclusive_blocks_until_release() {
        let mgr = Arc::new(LockManager::new());
        let t1 = Arc::new(Transaction::new(1));
        let t2 = Arc::new(Transaction::new(2));
        let rid = Rid::new(1, 0);

        mgr.lock_shared_on_record(&t1, rid, fd()).unwrap();

        let mgr2 = mgr.clone();
        let t2c = t2.clone();
        let handle = thread::spawn(move || mgr2.lock_exclusive_on_record(&t2c, rid, fd()));

        // Give the writer time to block behind the shared lock.
        thread::sleep(Duration::from_millis(100));
        assert!(!handle.is_finished());

        mgr.release_all(&t1);
        handle.join().unwrap().unwrap();
        assert_eq!(t2.state(), TransactionState::Growing);
    }

    #[test]
    fn test_deadlock_detected_and_victim_aborted() {
        let mgr = Arc::new(LockManager::new());
        let t1 = Arc::new(Transaction::new(1));
        let t2 = Arc::new(Transaction::new(2));
        let r1 = Rid::new(1, 0);
        let r2 = Rid::new(1, 1);

        mgr.lock_exclusive_on_record(&t1, r1, fd()).unwrap();
        mgr.lock_exclusive_on_record(&t2, r2, fd()).unwrap();

        let mgr1 = mgr.clone();
        let t1c = t1.clone();
        let handle = thread::spawn(move || mgr1.lock_exclusive_on_record(&t1c, r2, fd()));
        thread::sleep(Duration::from_millis(100));

        // t2 -> t1 closes the cycle; t2 is the victim.
        let err = mgr.lock_exclusive_on_record(&t2, r1, fd()).unwrap_err();
        assert!(matches!(
            err,
            BasaltError::TransactionAborted {
                reason: AbortReason::Deadlock,
                ..
            }
        ));
        assert_eq!(t2.state(), TransactionState::Aborted);

        // Releasing the victim's locks lets t1 finish.
        mgr.release_all(&t2);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_upgrade_conflict_aborts_second_upgrader() {
        let mgr = Arc::new(LockManager::new());
        let t1 = Arc::new(Transaction::new(1));
        let t2 = Arc::new(Transaction::new(2));
        let rid = Rid::new(1, 0);

        mgr.lock_shared_on_record(&t1, rid, fd()).unwrap();
        mgr.lock_shared_on_record(&t2, rid, fd()).unwrap();

        let mgr1 = mgr.clone();
        let t1c = t1.clone();
        let handle = thread::spawn(move || mgr1.lock_exclusive_on_record(&t1c, rid, fd()));
        thread::sleep(Duration::from_millis(100));

        let err = mgr.lock_exclusive_on_record(&t2, rid, fd()).unwrap_err();
        assert!(matches!(
            err,
            BasaltError::TransactionAborted {
                reason: AbortReason::UpgradeConflict,
                ..
            }
        ));

        mgr.release_all(&t2);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_unlock_recomputes_group_mode() {
        let mgr = Arc::new(LockManager::new());
        let t1 = Arc::new(Transaction::new(1));
        let t2 = Arc::new(Transaction::new(2));
        let t3 = Arc::new(Transaction::new(3));
        let rid = Rid::new(2, 3);

        mgr.lock_shared_on_record(&t1, rid, fd()).unwrap();
        mgr.lock_shared_on_record(&t2, rid, fd()).unwrap();

        let mgr3 = mgr.clone();
        let t3c = t3.clone();
        let handle = thread::spawn(move || mgr3.lock_exclusive_on_record(&t3c, rid, fd()));
        thread::sleep(Duration::from_millis(50));

        // Releasing only one reader keeps the writer blocked.
        mgr.release_all(&t1);
        thread::sleep(Duration::from_millis(50));
        assert!(!handle.is_finished());

        mgr.release_all(&t2);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_unlock_unknown_lock_returns_false() {
        let mgr = LockManager::new();
        let t1 = Transaction::new(1);
        assert!(!mgr.unlock(&t1, LockDataId::table(fd())));
    }
}
