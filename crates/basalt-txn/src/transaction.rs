//! Transaction state, isolation levels, and the in-memory undo log.

use crate::lock::LockDataId;
use basalt_common::page::Rid;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU8, Ordering};

/// Transaction identifier.
pub type TxnId = u32;

/// Lifecycle state of a transaction under strict 2PL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransactionState {
    Growing = 0,
    Shrinking = 1,
    Committed = 2,
    Aborted = 3,
}

impl TransactionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => TransactionState::Growing,
            1 => TransactionState::Shrinking,
            2 => TransactionState::Committed,
            _ => TransactionState::Aborted,
        }
    }
}

/// Supported isolation levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum IsolationLevel {
    ReadUncommitted = 0,
    ReadCommitted = 1,
    RepeatableRead = 2,
    Serializable = 3,
}

impl IsolationLevel {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => IsolationLevel::ReadUncommitted,
            1 => IsolationLevel::ReadCommitted,
            2 => IsolationLevel::RepeatableRead,
            _ => IsolationLevel::Serializable,
        }
    }
}

/// One undo entry: the inverse action required to roll back a single write.
#[derive(Debug, Clone)]
pub enum WriteRecord {
    /// Rolling back deletes the inserted rid (and its index entries).
    Insert { tab_name: String, rid: Rid },
    /// Rolling back re-inserts the stored record (and its index entries).
    Delete { tab_name: String, record: Bytes },
    /// Rolling back rewrites the before-image (and fixes index entries).
    Update {
        tab_name: String,
        rid: Rid,
        before_image: Bytes,
    },
}

/// A transaction: id, 2PL state, isolation level, the set of locks held,
/// and the ordered write set replayed in reverse on abort.
pub struct Transaction {
    id: TxnId,
    state: AtomicU8,
    isolation_level: AtomicU8,
    lock_set: Mutex<HashSet<LockDataId>>,
    write_set: Mutex<Vec<WriteRecord>>,
}

impl Transaction {
    /// Creates a transaction in the Growing state at Serializable isolation.
    pub fn new(id: TxnId) -> Self {
        Self {
            id,
            state: AtomicU8::new(TransactionState::Growing as u8),
            isolation_level: AtomicU8::new(IsolationLevel::Serializable as u8),
            lock_set: Mutex::new(HashSet::new()),
            write_set: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        TransactionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: TransactionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        IsolationLevel::from_u8(self.isolation_level.load(Ordering::Acquire))
    }

    pub fn set_isolation_level(&self, level: IsolationLevel) {
        self.isolation_level.store(level as u8, Ordering::Release);
    }

    /// The locks this transaction currently holds.
    pub fn lock_set(&self) -> &Mutex<HashSet<LockDataId>> {
        &self.lock_set
    }

    /// Appends an undo entry.
    pub fn append_write_record(&self, record: WriteRecord) {
        self.write_set.lock().push(record);
    }

    /// Drains the write set in reverse (most recent first) for rollback.
    pub fn take_write_set_reversed(&self) -> Vec<WriteRecord> {
        let mut set = std::mem::take(&mut *self.write_set.lock());
        set.reverse();
        set
    }

    /// Number of pending undo entries.
    pub fn write_set_len(&self) -> usize {
        self.write_set.lock().len()
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("isolation_level", &self.isolation_level())
            .field("locks", &self.lock_set.lock().len())
            .field("writes", &self.write_set.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_transaction_defaults() {
        let txn = Transaction::new(1);
        assert_eq!(txn.id(), 1);
        assert_eq!(txn.state(), TransactionState::Growing);
        assert_eq!(txn.isolation_level(), IsolationLevel::Serializable);
        assert_eq!(txn.write_set_len(), 0);
    }

    #[test]
    fn test_state_transitions() {
        let txn = Transaction::new(2);
        txn.set_state(TransactionState::Shrinking);
        assert_eq!(txn.state(), TransactionState::Shrinking);
        txn.set_state(TransactionState::Committed);
        assert_eq!(txn.state(), TransactionState::Committed);
    }

    #[test]
    fn test_isolation_level_ordering() {
        assert!(IsolationLevel::ReadUncommitted < IsolationLevel::ReadCommitted);
        assert!(IsolationLevel::ReadCommitted < IsolationLevel::RepeatableRead);
        assert!(IsolationLevel::RepeatableRead < IsolationLevel::Serializable);
    }

    #[test]
    fn test_write_set_reversal() {
        let txn = Transaction::new(3);
        txn.append_write_record(WriteRecord::Insert {
            tab_name: "t".into(),
            rid: Rid::new(1, 0),
        });
        txn.append_write_record(WriteRecord::Insert {
            tab_name: "t".into(),
            rid: Rid::new(1, 1),
        });

        let reversed = txn.take_write_set_reversed();
        assert_eq!(reversed.len(), 2);
        match &reversed[0] {
            WriteRecord::Insert { rid, .. } => assert_eq!(*rid, Rid::new(1, 1)),
            other => panic!("unexpected record {other:?}"),
        }
        // Draining leaves the set empty.
        assert_eq!(txn.write_set_len(), 0);
    }
}
