//! Transaction log buffer.
//!
//! Begin/commit/abort records are appended to an in-memory buffer and pushed
//! to the disk manager's append-only log stream on flush. Undo information
//! for active transactions lives in each transaction's write set; this log
//! only records lifecycle events.

use crate::transaction::TxnId;
use basalt_common::Result;
use basalt_disk::DiskManager;
use parking_lot::Mutex;
use std::sync::Arc;

const LOG_RECORD_SIZE: usize = 5;

/// A transaction lifecycle log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRecord {
    Begin(TxnId),
    Commit(TxnId),
    Abort(TxnId),
}

impl LogRecord {
    /// Encodes the record as a kind byte followed by the txn id.
    pub fn to_bytes(&self) -> [u8; LOG_RECORD_SIZE] {
        let (kind, txn_id) = match self {
            LogRecord::Begin(id) => (1u8, *id),
            LogRecord::Commit(id) => (2u8, *id),
            LogRecord::Abort(id) => (3u8, *id),
        };
        let mut buf = [0u8; LOG_RECORD_SIZE];
        buf[0] = kind;
        buf[1..5].copy_from_slice(&txn_id.to_le_bytes());
        buf
    }

    /// Decodes a record; None for an unknown kind byte.
    pub fn from_bytes(buf: &[u8]) -> Option<LogRecord> {
        if buf.len() < LOG_RECORD_SIZE {
            return None;
        }
        let txn_id = u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]);
        match buf[0] {
            1 => Some(LogRecord::Begin(txn_id)),
            2 => Some(LogRecord::Commit(txn_id)),
            3 => Some(LogRecord::Abort(txn_id)),
            _ => None,
        }
    }
}

/// Buffers log records in memory and flushes them through the disk manager.
pub struct LogManager {
    disk: Arc<DiskManager>,
    buffer: Mutex<Vec<u8>>,
}

impl LogManager {
    pub fn new(disk: Arc<DiskManager>) -> Self {
        Self {
            disk,
            buffer: Mutex::new(Vec::new()),
        }
    }

    /// Appends a record to the log buffer.
    pub fn add_record(&self, record: LogRecord) {
        self.buffer.lock().extend_from_slice(&record.to_bytes());
    }

    /// Writes the buffered records to the log stream and clears the buffer.
    pub fn flush(&self) -> Result<()> {
        let mut buffer = self.buffer.lock();
        if buffer.is_empty() {
            return Ok(());
        }
        self.disk.write_log(&buffer)?;
        buffer.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_log_record_roundtrip() {
        for record in [
            LogRecord::Begin(1),
            LogRecord::Commit(u32::MAX),
            LogRecord::Abort(42),
        ] {
            let bytes = record.to_bytes();
            assert_eq!(LogRecord::from_bytes(&bytes), Some(record));
        }
        assert_eq!(LogRecord::from_bytes(&[9, 0, 0, 0, 0]), None);
        assert_eq!(LogRecord::from_bytes(&[1, 0]), None);
    }

    #[test]
    fn test_flush_appends_to_log_stream() {
        let dir = tempdir().unwrap();
        let disk = Arc::new(DiskManager::new(false));
        disk.open_log(dir.path().join("db.log")).unwrap();
        let log_mgr = LogManager::new(disk.clone());

        log_mgr.add_record(LogRecord::Begin(7));
        log_mgr.add_record(LogRecord::Commit(7));
        log_mgr.flush().unwrap();
        // Flushing an empty buffer is a no-op.
        log_mgr.flush().unwrap();

        let mut buf = [0u8; 64];
        let n = disk.read_log(&mut buf, 0).unwrap();
        assert_eq!(n, 2 * LOG_RECORD_SIZE);
        assert_eq!(LogRecord::from_bytes(&buf[..5]), Some(LogRecord::Begin(7)));
        assert_eq!(LogRecord::from_bytes(&buf[5..10]), Some(LogRecord::Commit(7)));
    }
}
