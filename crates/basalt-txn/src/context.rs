//! Per-statement execution context.

use crate::lock::LockManager;
use crate::log::LogManager;
use crate::transaction::Transaction;
use std::sync::Arc;

/// Everything an executor or storage handle needs from the surrounding
/// transaction: the lock manager, the log buffer, and the transaction itself.
#[derive(Clone)]
pub struct Context {
    pub lock_mgr: Arc<LockManager>,
    pub log_mgr: Arc<LogManager>,
    pub txn: Arc<Transaction>,
}

impl Context {
    pub fn new(lock_mgr: Arc<LockManager>, log_mgr: Arc<LogManager>, txn: Arc<Transaction>) -> Self {
        Self {
            lock_mgr,
            log_mgr,
            txn,
        }
    }
}
