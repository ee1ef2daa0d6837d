//! Record file handles: fixed-size tuple CRUD over slotted pages.

use crate::bitmap;
use crate::record::layout::{RmFileHdr, RmPageHdr, RM_FILE_HDR_PAGE, RM_MAX_RECORD_SIZE, RM_PAGE_HDR_SIZE};
use crate::record::Record;
use basalt_buffer::{BufferPoolManager, Frame};
use basalt_common::page::{FileId, PageId, Rid, INVALID_PAGE_NO, PAGE_SIZE};
use basalt_common::{BasaltError, Result};
use basalt_txn::transaction::IsolationLevel;
use basalt_txn::{Context, LockDataId};
use bytes::Bytes;
use log::debug;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;

/// Creates, opens, and destroys record files.
pub struct RecordFileManager {
    pool: Arc<BufferPoolManager>,
}

impl RecordFileManager {
    pub fn new(pool: Arc<BufferPoolManager>) -> Self {
        Self { pool }
    }

    /// Creates a record file for records of `record_size` bytes and writes
    /// the file header to page 0.
    pub fn create_file(&self, path: impl AsRef<Path>, record_size: usize) -> Result<()> {
        if record_size == 0 || record_size > RM_MAX_RECORD_SIZE {
            return Err(BasaltError::Internal(format!(
                "record size {record_size} out of range"
            )));
        }
        let disk = self.pool.disk();
        disk.create_file(&path)?;
        let fd = disk.open_file(&path)?;
        let page_no = disk.allocate_page(fd)?;
        debug_assert_eq!(page_no, RM_FILE_HDR_PAGE);

        let hdr = RmFileHdr::new(record_size);
        let mut page = [0u8; PAGE_SIZE];
        page[..RmFileHdr::SIZE].copy_from_slice(&hdr.to_bytes());
        disk.write_page(fd, RM_FILE_HDR_PAGE, &page)?;
        disk.close_file(fd)
    }

    /// Opens a record file and loads its header.
    pub fn open_file(&self, path: impl AsRef<Path>) -> Result<RecordFileHandle> {
        let disk = self.pool.disk();
        let fd = disk.open_file(&path)?;
        let mut page = [0u8; PAGE_SIZE];
        disk.read_page(fd, RM_FILE_HDR_PAGE, &mut page)?;
        let hdr = RmFileHdr::from_bytes(&page);
        debug!("opened record file {} ({} pages)", fd, hdr.num_pages);
        Ok(RecordFileHandle {
            fd,
            pool: self.pool.clone(),
            file_hdr: Mutex::new(hdr),
        })
    }

    /// Persists the header, flushes the file's pages, and closes it.
    pub fn close_file(&self, handle: &RecordFileHandle) -> Result<()> {
        let disk = self.pool.disk();
        let hdr = *handle.file_hdr.lock();
        let mut page = [0u8; PAGE_SIZE];
        page[..RmFileHdr::SIZE].copy_from_slice(&hdr.to_bytes());
        disk.write_page(handle.fd, RM_FILE_HDR_PAGE, &page)?;
        self.pool.flush_all(handle.fd)?;
        disk.close_file(handle.fd)
    }

    /// Removes a (closed) record file.
    pub fn destroy_file(&self, path: impl AsRef<Path>) -> Result<()> {
        self.pool.disk().destroy_file(path)
    }
}

/// Handle over one record file: CRUD on fixed-size tuples plus the
/// free-page chain linking every page that still has an empty slot.
pub struct RecordFileHandle {
    fd: FileId,
    pool: Arc<BufferPoolManager>,
    file_hdr: Mutex<RmFileHdr>,
}

impl RecordFileHandle {
    pub fn fd(&self) -> FileId {
        self.fd
    }

    pub fn record_size(&self) -> usize {
        self.file_hdr.lock().record_size as usize
    }

    /// Snapshot of the file header (for scans and tests).
    pub fn file_hdr(&self) -> RmFileHdr {
        *self.file_hdr.lock()
    }

    pub fn pool(&self) -> &Arc<BufferPoolManager> {
        &self.pool
    }

    /// Fetches a data page, pinned. The caller unpins.
    pub(crate) fn fetch_page(&self, page_no: i32) -> Result<&Frame> {
        let num_pages = self.file_hdr.lock().num_pages;
        self.fetch_page_bounded(page_no, num_pages)
    }

    /// `fetch_page` for callers already holding the header lock.
    fn fetch_page_bounded(&self, page_no: i32, num_pages: i32) -> Result<&Frame> {
        if page_no <= RM_FILE_HDR_PAGE || page_no >= num_pages {
            return Err(BasaltError::PageNotExist {
                fd: self.fd.0,
                page_no,
            });
        }
        self.pool.fetch_page(PageId::new(self.fd, page_no))
    }

    /// Returns a writable page with at least one empty slot: the head of the
    /// free chain if there is one, otherwise a freshly allocated page whose
    /// header is initialized and which becomes the new chain head.
    fn writable_page(&self, hdr: &mut RmFileHdr) -> Result<(i32, &Frame)> {
        if hdr.first_free_page_no == INVALID_PAGE_NO {
            let (page_id, frame) = self.pool.new_page(self.fd)?;
            {
                let mut data = frame.write_data();
                let page_hdr = RmPageHdr {
                    next_free_page_no: INVALID_PAGE_NO,
                    num_records: 0,
                };
                data[..RmPageHdr::SIZE].copy_from_slice(&page_hdr.to_bytes());
            }
            frame.set_dirty(true);
            hdr.num_pages += 1;
            hdr.first_free_page_no = page_id.page_no;
            Ok((page_id.page_no, frame))
        } else {
            let page_no = hdr.first_free_page_no;
            let frame = self.pool.fetch_page(PageId::new(self.fd, page_no))?;
            Ok((page_no, frame))
        }
    }

    /// Reads the record at `rid`.
    ///
    /// Takes a shared row lock unless the transaction runs at READ
    /// UNCOMMITTED or already holds a lock on the rid; at READ COMMITTED a
    /// newly acquired read lock is released as soon as the copy is made.
    pub fn get_record(&self, rid: Rid, ctx: Option<&Context>) -> Result<Record> {
        let mut release_after_read = false;
        if let Some(ctx) = ctx {
            let iso = ctx.txn.isolation_level();
            if iso != IsolationLevel::ReadUncommitted {
                let id = LockDataId::record(self.fd, rid);
                let already_held = ctx.txn.lock_set().lock().contains(&id);
                if !already_held {
                    ctx.lock_mgr
                        .lock_shared_on_record(&ctx.txn, rid, self.fd)?;
                    release_after_read = iso == IsolationLevel::ReadCommitted;
                }
            }
        }

        let result = self.read_record(rid);

        if release_after_read {
            if let Some(ctx) = ctx {
                ctx.lock_mgr
                    .unlock(&ctx.txn, LockDataId::record(self.fd, rid));
            }
        }
        result
    }

    fn read_record(&self, rid: Rid) -> Result<Record> {
        let hdr = self.file_hdr();
        let frame = self.fetch_page(rid.page_no)?;
        let result = {
            let data = frame.read_data();
            if rid.slot_no < 0
                || rid.slot_no >= hdr.records_per_page
                || !bitmap::test(&data[hdr.bitmap_range()], rid.slot_no as usize)
            {
                Err(BasaltError::RecordNotFound(rid.to_string()))
            } else {
                let off = hdr.slot_offset(rid.slot_no as usize);
                Ok(Record::new(Bytes::copy_from_slice(
                    &data[off..off + hdr.record_size as usize],
                )))
            }
        };
        self.pool.unpin_page(PageId::new(self.fd, rid.page_no), false);
        result
    }

    /// Inserts a record, returning its rid.
    ///
    /// Takes an IX lock on the table and an X lock on the new rid. If the
    /// row lock cannot be granted the slot is rolled back before the error
    /// propagates.
    pub fn insert_record(&self, buf: &[u8], ctx: Option<&Context>) -> Result<Rid> {
        if let Some(ctx) = ctx {
            ctx.lock_mgr.lock_ix_on_table(&ctx.txn, self.fd)?;
        }

        let rid = {
            let mut hdr = self.file_hdr.lock();
            if buf.len() != hdr.record_size as usize {
                return Err(BasaltError::Internal(format!(
                    "record is {} bytes, file stores {}",
                    buf.len(),
                    hdr.record_size
                )));
            }
            let (page_no, frame) = self.writable_page(&mut hdr)?;
            let slot_no = {
                let mut data = frame.write_data();
                let mut page_hdr = RmPageHdr::from_bytes(&data[..RmPageHdr::SIZE]);
                let slot_no = bitmap::first_clear(
                    &data[hdr.bitmap_range()],
                    hdr.records_per_page as usize,
                )
                .ok_or_else(|| {
                    BasaltError::Internal(format!("page {page_no} on free chain but full"))
                })?;

                let off = hdr.slot_offset(slot_no);
                data[off..off + buf.len()].copy_from_slice(buf);
                bitmap::set(&mut data[hdr.bitmap_range()], slot_no);
                page_hdr.num_records += 1;
                // A page that just filled up leaves the free chain.
                if page_hdr.num_records >= hdr.records_per_page {
                    hdr.first_free_page_no = page_hdr.next_free_page_no;
                }
                data[..RmPageHdr::SIZE].copy_from_slice(&page_hdr.to_bytes());
                slot_no
            };
            self.pool.unpin_page(PageId::new(self.fd, page_no), true);
            Rid::new(page_no, slot_no as i32)
        };

        if let Some(ctx) = ctx {
            if let Err(e) = ctx.lock_mgr.lock_exclusive_on_record(&ctx.txn, rid, self.fd) {
                self.erase_record(rid)?;
                return Err(e);
            }
        }
        Ok(rid)
    }

    /// Deletes the record at `rid` under IX table and X row locks.
    pub fn delete_record(&self, rid: Rid, ctx: Option<&Context>) -> Result<()> {
        if let Some(ctx) = ctx {
            ctx.lock_mgr.lock_ix_on_table(&ctx.txn, self.fd)?;
            ctx.lock_mgr.lock_exclusive_on_record(&ctx.txn, rid, self.fd)?;
        }
        self.erase_record(rid)
    }

    /// Clears a slot and maintains the free chain. Shared by delete and by
    /// insert's lock-failure unwind.
    fn erase_record(&self, rid: Rid) -> Result<()> {
        let mut hdr = self.file_hdr.lock();
        let frame = self.fetch_page_bounded(rid.page_no, hdr.num_pages)?;
        let result = {
            let mut data = frame.write_data();
            if rid.slot_no < 0
                || rid.slot_no >= hdr.records_per_page
                || !bitmap::test(&data[hdr.bitmap_range()], rid.slot_no as usize)
            {
                Err(BasaltError::RecordNotFound(rid.to_string()))
            } else {
                let mut page_hdr = RmPageHdr::from_bytes(&data[..RmPageHdr::SIZE]);
                bitmap::clear(&mut data[hdr.bitmap_range()], rid.slot_no as usize);
                page_hdr.num_records -= 1;
                // Full page regained a slot: push it onto the free chain.
                if page_hdr.num_records == hdr.records_per_page - 1 {
                    page_hdr.next_free_page_no = hdr.first_free_page_no;
                    hdr.first_free_page_no = rid.page_no;
                }
                data[..RmPageHdr::SIZE].copy_from_slice(&page_hdr.to_bytes());
                Ok(())
            }
        };
        let dirty = result.is_ok();
        self.pool.unpin_page(PageId::new(self.fd, rid.page_no), dirty);
        result
    }

    /// Overwrites the record at `rid` under IX table and X row locks.
    pub fn update_record(&self, rid: Rid, buf: &[u8], ctx: Option<&Context>) -> Result<()> {
        if let Some(ctx) = ctx {
            ctx.lock_mgr.lock_ix_on_table(&ctx.txn, self.fd)?;
            ctx.lock_mgr.lock_exclusive_on_record(&ctx.txn, rid, self.fd)?;
        }

        let hdr = self.file_hdr();
        if buf.len() != hdr.record_size as usize {
            return Err(BasaltError::Internal(format!(
                "record is {} bytes, file stores {}",
                buf.len(),
                hdr.record_size
            )));
        }
        let frame = self.fetch_page(rid.page_no)?;
        let result = {
            let mut data = frame.write_data();
            if rid.slot_no < 0
                || rid.slot_no >= hdr.records_per_page
                || !bitmap::test(&data[hdr.bitmap_range()], rid.slot_no as usize)
            {
                Err(BasaltError::RecordNotFound(rid.to_string()))
            } else {
                let off = hdr.slot_offset(rid.slot_no as usize);
                data[off..off + buf.len()].copy_from_slice(buf);
                Ok(())
            }
        };
        let dirty = result.is_ok();
        self.pool.unpin_page(PageId::new(self.fd, rid.page_no), dirty);
        result
    }

    /// Number of live records on a page, by popcount of its bitmap.
    #[cfg(test)]
    fn live_records_on_page(&self, page_no: i32) -> Result<usize> {
        let hdr = self.file_hdr();
        let frame = self.fetch_page(page_no)?;
        let count = {
            let data = frame.read_data();
            bitmap::count_set(&data[hdr.bitmap_range()], hdr.records_per_page as usize)
        };
        self.pool.unpin_page(PageId::new(self.fd, page_no), false);
        Ok(count)
    }

    /// Reads a page's header (for scans and tests).
    pub(crate) fn page_hdr(&self, page_no: i32) -> Result<RmPageHdr> {
        let frame = self.fetch_page(page_no)?;
        let page_hdr = RmPageHdr::from_bytes(&frame.read_data()[..RM_PAGE_HDR_SIZE]);
        self.pool.unpin_page(PageId::new(self.fd, page_no), false);
        Ok(page_hdr)
    }
}
