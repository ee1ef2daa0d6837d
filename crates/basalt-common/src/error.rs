//! Error types for BasaltDB.

use thiserror::Error;

/// Result type alias using BasaltError.
pub type Result<T> = std::result::Result<T, BasaltError>;

/// Why a transaction was forcibly aborted by the lock manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// A lock was requested while the transaction was shrinking
    /// (or at READ UNCOMMITTED, which forbids locking entirely).
    LockOnShrinking,
    /// The request would have closed a cycle in the waits-for graph.
    Deadlock,
    /// Two transactions tried to upgrade on the same lock entry.
    UpgradeConflict,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AbortReason::LockOnShrinking => "LOCK_ON_SHRINKING",
            AbortReason::Deadlock => "DEADLOCK",
            AbortReason::UpgradeConflict => "UPGRADE_CONFLICT",
        };
        f.write_str(s)
    }
}

/// Errors surfaced by BasaltDB operations.
#[derive(Debug, Error)]
pub enum BasaltError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // File errors
    #[error("file already exists: {0}")]
    FileExists(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("file is still open: {0}")]
    FileStillOpen(String),

    // Storage errors
    #[error("page {page_no} does not exist in file {fd}")]
    PageNotExist { fd: u32, page_no: i32 },

    #[error("buffer pool full, unable to allocate frame")]
    BufferFull,

    #[error("record not found at rid {0}")]
    RecordNotFound(String),

    // Catalog errors
    #[error("database already exists: {0}")]
    DatabaseExists(String),

    #[error("database not found: {0}")]
    DatabaseNotFound(String),

    #[error("table already exists: {0}")]
    TableExists(String),

    #[error("table not found: {0}")]
    TableNotFound(String),

    #[error("column not found: {0}")]
    ColumnNotFound(String),

    #[error("index already exists: {0}")]
    IndexExists(String),

    #[error("index not found: {0}")]
    IndexNotFound(String),

    // Transaction errors
    #[error("transaction {txn_id} aborted: {reason}")]
    TransactionAborted { txn_id: u32, reason: AbortReason },

    // Internal errors
    #[error("internal error: {0}")]
    Internal(String),
}

impl BasaltError {
    /// Returns true if this error carries a forced transaction abort.
    pub fn is_abort(&self) -> bool {
        matches!(self, BasaltError::TransactionAborted { .. })
    }
}
