//! Record (heap) file management.

pub mod file;
pub mod layout;
pub mod scan;

pub use file::{RecordFileHandle, RecordFileManager};
pub use layout::{RmFileHdr, RmPageHdr};
pub use scan::RecordScan;

use bytes::Bytes;

/// A fixed-size record copied out of a heap page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub data: Bytes,
}

impl Record {
    pub fn new(data: Bytes) -> Self {
        Self { data }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}
