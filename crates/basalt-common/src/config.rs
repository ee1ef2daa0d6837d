//! Configuration structures for BasaltDB.

use crate::page::PAGE_SIZE;
use serde::{Deserialize, Serialize};

/// Storage configuration for the database engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Page size in bytes. Fixed at compile time; kept here so the value is
    /// visible in serialized configs.
    pub page_size: usize,
    /// Buffer pool size in number of frames.
    pub buffer_pool_pages: usize,
    /// Enable fsync after page writes.
    pub fsync_enabled: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            page_size: PAGE_SIZE,
            buffer_pool_pages: 1024, // 4 MB with 4 KB pages
            fsync_enabled: false,
        }
    }
}

impl StorageConfig {
    /// Returns the total buffer pool size in bytes.
    pub fn buffer_pool_size_bytes(&self) -> usize {
        self.buffer_pool_pages * self.page_size
    }
}
