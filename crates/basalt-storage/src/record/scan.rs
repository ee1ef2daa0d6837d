//! Forward cursor over the live records of a record file.

use crate::bitmap;
use crate::record::layout::RM_FIRST_RECORD_PAGE;
use crate::record::RecordFileHandle;
use basalt_common::page::{PageId, Rid, INVALID_PAGE_NO};
use basalt_common::Result;
use std::sync::Arc;

/// Scans a record file slot by slot, skipping clear bitmap bits and crossing
/// page boundaries in page-number order. Once exhausted, `is_end` stays true.
pub struct RecordScan {
    fh: Arc<RecordFileHandle>,
    rid: Rid,
}

impl RecordScan {
    /// Creates a scan positioned on the first live record (or at the end).
    pub fn new(fh: Arc<RecordFileHandle>) -> Result<Self> {
        let mut scan = Self {
            fh,
            rid: Rid::new(RM_FIRST_RECORD_PAGE, -1),
        };
        scan.next()?;
        Ok(scan)
    }

    /// Advances to the next live slot.
    pub fn next(&mut self) -> Result<()> {
        if self.is_end() {
            return Ok(());
        }
        let hdr = self.fh.file_hdr();
        while self.rid.page_no < hdr.num_pages {
            let frame = self.fh.fetch_page(self.rid.page_no)?;
            let found = {
                let data = frame.read_data();
                bitmap::next_set(
                    &data[hdr.bitmap_range()],
                    hdr.records_per_page as usize,
                    self.rid.slot_no,
                )
            };
            self.fh
                .pool()
                .unpin_page(PageId::new(self.fh.fd(), self.rid.page_no), false);

            if let Some(slot_no) = found {
                self.rid.slot_no = slot_no as i32;
                return Ok(());
            }
            self.rid = Rid::new(self.rid.page_no + 1, -1);
        }
        self.rid = Rid::new(INVALID_PAGE_NO, -1);
        Ok(())
    }

    /// True once the cursor has moved past the last live record.
    pub fn is_end(&self) -> bool {
        self.rid.page_no == INVALID_PAGE_NO
    }

    /// The rid the cursor is positioned on.
    pub fn rid(&self) -> Rid {
        self.rid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordFileManager;
    use basalt_buffer::BufferPoolManager;
    use basalt_disk::DiskManager;
    use tempfile::tempdir;

    fn setup(record_size: usize) -> (Arc<RecordFileHandle>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let disk = Arc::new(DiskManager::new(false));
        let pool = Arc::new(BufferPoolManager::new(64, disk));
        let rm = RecordFileManager::new(pool);
        let path = dir.path().join("t.tab");
        rm.create_file(&path, record_size).unwrap();
        (Arc::new(rm.open_file(&path).unwrap()), dir)
    }

    #[test]
    fn test_scan_empty_file_is_end() {
        let (fh, _dir) = setup(4);
        let scan = RecordScan::new(fh).unwrap();
        assert!(scan.is_end());
    }

    #[test]
    fn test_scan_visits_all_in_insertion_order() {
        let (fh, _dir) = setup(4);
        let mut rids = Vec::new();
        for i in 0..20i32 {
            rids.push(fh.insert_record(&i.to_le_bytes(), None).unwrap());
        }

        let mut scan = RecordScan::new(fh.clone()).unwrap();
        let mut seen = Vec::new();
        while !scan.is_end() {
            seen.push(scan.rid());
            scan.next().unwrap();
        }
        assert_eq!(seen, rids);
    }

    #[test]
    fn test_scan_skips_deleted_slots() {
        let (fh, _dir) = setup(4);
        let mut rids = Vec::new();
        for i in 0..10i32 {
            rids.push(fh.insert_record(&i.to_le_bytes(), None).unwrap());
        }
        for rid in [rids[0], rids[4], rids[9]] {
            fh.delete_record(rid, None).unwrap();
        }

        let mut scan = RecordScan::new(fh.clone()).unwrap();
        let mut count = 0;
        while !scan.is_end() {
            let rid = scan.rid();
            assert!(rid != rids[0] && rid != rids[4] && rid != rids[9]);
            count += 1;
            scan.next().unwrap();
        }
        assert_eq!(count, 7);
    }

    #[test]
    fn test_scan_crosses_pages() {
        let (fh, _dir) = setup(400);
        let rpp = fh.file_hdr().records_per_page;
        let total = rpp as usize * 2 + 3;
        for i in 0..total {
            fh.insert_record(&vec![i as u8; 400], None).unwrap();
        }

        let mut scan = RecordScan::new(fh.clone()).unwrap();
        let mut count = 0;
        let mut last_page = 0;
        while !scan.is_end() {
            assert!(scan.rid().page_no >= last_page);
            last_page = scan.rid().page_no;
            count += 1;
            scan.next().unwrap();
        }
        assert_eq!(count, total);
        assert_eq!(last_page, 3);
    }

    #[test]
    fn test_is_end_latches() {
        let (fh, _dir) = setup(4);
        fh.insert_record(&1i32.to_le_bytes(), None).unwrap();

        let mut scan = RecordScan::new(fh).unwrap();
        scan.next().unwrap();
        assert!(scan.is_end());
        scan.next().unwrap();
        assert!(scan.is_end());
    }
}
