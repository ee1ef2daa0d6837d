//! BasaltDB transactions and concurrency control.
//!
//! Strict two-phase locking at table and record granularity, transaction
//! state with an in-memory undo log, and the begin/commit/abort log buffer.

pub mod context;
pub mod lock;
pub mod log;
pub mod transaction;

pub use context::Context;
pub use lock::{LockDataId, LockManager, LockMode, LockTarget};
pub use log::{LogManager, LogRecord};
pub use transaction::{IsolationLevel, Transaction, TransactionState, TxnId, WriteRecord};
