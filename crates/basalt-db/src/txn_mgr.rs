//! Transaction manager: begin/commit/abort over the global transaction map.

use crate::system::SystemManager;
use basalt_common::Result;
use basalt_txn::{
    Context, LockManager, LogManager, LogRecord, Transaction, TransactionState, TxnId, WriteRecord,
};
use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Coordinates transaction lifecycle: id allocation, the global map, commit
/// lock release, and undo-based rollback through the system manager.
pub struct TransactionManager {
    next_txn_id: AtomicU32,
    txn_map: Mutex<HashMap<TxnId, Arc<Transaction>>>,
    lock_mgr: Arc<LockManager>,
    sm: Arc<SystemManager>,
}

impl TransactionManager {
    pub fn new(lock_mgr: Arc<LockManager>, sm: Arc<SystemManager>) -> Self {
        Self {
            next_txn_id: AtomicU32::new(0),
            txn_map: Mutex::new(HashMap::new()),
            lock_mgr,
            sm,
        }
    }

    pub fn lock_mgr(&self) -> &Arc<LockManager> {
        &self.lock_mgr
    }

    /// Number of transactions currently registered.
    pub fn active_count(&self) -> usize {
        self.txn_map.lock().len()
    }

    /// Starts a transaction. With `txn` given, re-registers that transaction
    /// (an explicit BEGIN on an existing session); otherwise a fresh one is
    /// allocated in the Growing state.
    pub fn begin(&self, txn: Option<Arc<Transaction>>, log_mgr: &LogManager) -> Arc<Transaction> {
        let txn = txn.unwrap_or_else(|| {
            Arc::new(Transaction::new(self.next_txn_id.fetch_add(1, Ordering::SeqCst)))
        });
        log_mgr.add_record(LogRecord::Begin(txn.id()));
        self.txn_map.lock().insert(txn.id(), txn.clone());
        debug!("txn {} began", txn.id());
        txn
    }

    /// Builds a statement context for a transaction.
    pub fn context(&self, txn: Arc<Transaction>, log_mgr: Arc<LogManager>) -> Context {
        Context::new(self.lock_mgr.clone(), log_mgr, txn)
    }

    /// Commits: logs, drops the write set, releases every lock, and removes
    /// the transaction from the global map.
    pub fn commit(&self, txn: &Arc<Transaction>, log_mgr: &LogManager) -> Result<()> {
        log_mgr.add_record(LogRecord::Commit(txn.id()));
        log_mgr.flush()?;
        txn.take_write_set_reversed();
        self.lock_mgr.release_all(txn);
        txn.set_state(TransactionState::Committed);
        self.txn_map.lock().remove(&txn.id());
        debug!("txn {} committed", txn.id());
        Ok(())
    }

    /// Aborts: replays the write set in reverse through the rollback
    /// routines, releases every lock, and removes the transaction.
    ///
    /// Safe to call on an already-aborted transaction; the second call finds
    /// an empty write set and an empty lock set.
    pub fn abort(&self, txn: &Arc<Transaction>, log_mgr: &LogManager) -> Result<()> {
        for write in txn.take_write_set_reversed() {
            match write {
                WriteRecord::Insert { tab_name, rid } => {
                    self.sm.rollback_insert(&tab_name, rid)?;
                }
                WriteRecord::Delete { tab_name, record } => {
                    self.sm.rollback_delete(&tab_name, &record)?;
                }
                WriteRecord::Update {
                    tab_name,
                    rid,
                    before_image,
                } => {
                    self.sm.rollback_update(&tab_name, rid, &before_image)?;
                }
            }
        }
        self.lock_mgr.release_all(txn);
        txn.set_state(TransactionState::Aborted);
        log_mgr.add_record(LogRecord::Abort(txn.id()));
        log_mgr.flush()?;
        self.txn_map.lock().remove(&txn.id());
        debug!("txn {} aborted", txn.id());
        Ok(())
    }
}
