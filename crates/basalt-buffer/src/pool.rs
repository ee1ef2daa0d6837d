//! Buffer pool manager.

use crate::frame::{Frame, FrameId};
use crate::replacer::LruReplacer;
use basalt_common::page::{FileId, PageId};
use basalt_common::{BasaltError, Result};
use basalt_disk::DiskManager;
use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Buffer pool manager.
///
/// Owns a fixed array of frames and maps `PageId`s onto them. Pages are
/// pinned while in use and written back to disk when a dirty frame is
/// evicted, flushed, or deleted.
///
/// Invariants:
/// - a frame is in the replacer iff it is mapped and its pin count is zero;
/// - every mapped frame id appears in the page table exactly once;
/// - `dirty` implies the frame was modified since its last write-back.
pub struct BufferPoolManager {
    frames: Vec<Frame>,
    inner: Mutex<PoolInner>,
    replacer: LruReplacer,
    disk: Arc<DiskManager>,
}

struct PoolInner {
    page_table: HashMap<PageId, FrameId>,
    free_list: Vec<FrameId>,
}

impl BufferPoolManager {
    /// Creates a pool with `pool_size` frames over the given disk manager.
    pub fn new(pool_size: usize, disk: Arc<DiskManager>) -> Self {
        let frames = (0..pool_size).map(|i| Frame::new(FrameId(i as u32))).collect();
        // Seed the free list with every frame; pop from the back.
        let free_list = (0..pool_size).rev().map(|i| FrameId(i as u32)).collect();
        Self {
            frames,
            inner: Mutex::new(PoolInner {
                page_table: HashMap::new(),
                free_list,
            }),
            replacer: LruReplacer::new(pool_size),
            disk,
        }
    }

    /// Returns the disk manager backing this pool.
    pub fn disk(&self) -> &Arc<DiskManager> {
        &self.disk
    }

    /// Returns the number of frames in the pool.
    pub fn pool_size(&self) -> usize {
        self.frames.len()
    }

    /// Returns true if the page is currently mapped to a frame.
    pub fn contains(&self, page_id: PageId) -> bool {
        self.inner.lock().page_table.contains_key(&page_id)
    }

    /// Picks a frame to (re)use: the free list first, then an LRU victim.
    fn find_victim(&self, inner: &mut PoolInner) -> Result<FrameId> {
        if let Some(frame_id) = inner.free_list.pop() {
            return Ok(frame_id);
        }
        self.replacer.victim().ok_or(BasaltError::BufferFull)
    }

    /// Writes a frame's page back to disk if dirty and drops its mapping.
    fn evict(&self, inner: &mut PoolInner, frame: &Frame) -> Result<()> {
        if let Some(old_id) = frame.page_id() {
            if frame.is_dirty() {
                debug!("evicting dirty page {old_id}");
                let data = frame.read_data();
                self.disk.write_page(old_id.fd, old_id.page_no, &**data)?;
                frame.set_dirty(false);
            }
            inner.page_table.remove(&old_id);
        }
        Ok(())
    }

    /// Fetches a page, pinning it.
    ///
    /// If the page is already resident its pin count is bumped; otherwise a
    /// frame is claimed from the free list or the LRU victim (`BufferFull`
    /// if neither yields one), the old page is written back if dirty, and
    /// the requested page is read from disk.
    pub fn fetch_page(&self, page_id: PageId) -> Result<&Frame> {
        let mut inner = self.inner.lock();

        if let Some(&frame_id) = inner.page_table.get(&page_id) {
            let frame = &self.frames[frame_id.0 as usize];
            frame.pin();
            self.replacer.pin(frame_id);
            return Ok(frame);
        }

        let frame_id = self.find_victim(&mut inner)?;
        let frame = &self.frames[frame_id.0 as usize];
        self.evict(&mut inner, frame)?;

        {
            let mut data = frame.write_data();
            if let Err(e) = self.disk.read_page(page_id.fd, page_id.page_no, &mut **data) {
                drop(data);
                frame.reset();
                inner.free_list.push(frame_id);
                return Err(e);
            }
        }
        frame.set_page_id(Some(page_id));
        frame.set_dirty(false);
        frame.pin();
        inner.page_table.insert(page_id, frame_id);
        self.replacer.pin(frame_id);
        Ok(frame)
    }

    /// Drops one pin on a page, optionally marking it dirty.
    ///
    /// Returns false if the page is not resident or was not pinned.
    pub fn unpin_page(&self, page_id: PageId, mark_dirty: bool) -> bool {
        let inner = self.inner.lock();
        let Some(&frame_id) = inner.page_table.get(&page_id) else {
            return false;
        };
        let frame = &self.frames[frame_id.0 as usize];
        if frame.pin_count() == 0 {
            return false;
        }
        if mark_dirty {
            frame.set_dirty(true);
        }
        if frame.unpin() == 0 {
            self.replacer.unpin(frame_id);
        }
        true
    }

    /// Unconditionally writes a resident page back to disk, clearing dirty.
    ///
    /// Returns false if the page is not resident.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        let inner = self.inner.lock();
        let Some(&frame_id) = inner.page_table.get(&page_id) else {
            return Ok(false);
        };
        let frame = &self.frames[frame_id.0 as usize];
        let data = frame.read_data();
        self.disk.write_page(page_id.fd, page_id.page_no, &**data)?;
        frame.set_dirty(false);
        Ok(true)
    }

    /// Allocates a fresh page in file `fd` and pins it in a zeroed frame.
    pub fn new_page(&self, fd: FileId) -> Result<(PageId, &Frame)> {
        let mut inner = self.inner.lock();

        let frame_id = self.find_victim(&mut inner)?;
        let frame = &self.frames[frame_id.0 as usize];
        self.evict(&mut inner, frame)?;

        let page_no = match self.disk.allocate_page(fd) {
            Ok(n) => n,
            Err(e) => {
                inner.free_list.push(frame_id);
                return Err(e);
            }
        };
        let page_id = PageId::new(fd, page_no);

        frame.write_data().fill(0);
        frame.set_page_id(Some(page_id));
        frame.set_dirty(false);
        frame.pin();
        inner.page_table.insert(page_id, frame_id);
        self.replacer.pin(frame_id);
        Ok((page_id, frame))
    }

    /// Removes a page from the pool, returning its frame to the free list.
    ///
    /// Returns true if the page was absent or successfully removed, false
    /// if it is pinned.
    pub fn delete_page(&self, page_id: PageId) -> Result<bool> {
        let mut inner = self.inner.lock();
        let Some(&frame_id) = inner.page_table.get(&page_id) else {
            return Ok(true);
        };
        let frame = &self.frames[frame_id.0 as usize];
        if frame.pin_count() != 0 {
            return Ok(false);
        }
        if frame.is_dirty() {
            let data = frame.read_data();
            self.disk.write_page(page_id.fd, page_id.page_no, &**data)?;
        }
        inner.page_table.remove(&page_id);
        self.replacer.pin(frame_id);
        frame.reset();
        inner.free_list.push(frame_id);
        Ok(true)
    }

    /// Writes back every resident page belonging to file `fd`.
    pub fn flush_all(&self, fd: FileId) -> Result<()> {
        let _inner = self.inner.lock();
        for frame in &self.frames {
            if let Some(page_id) = frame.page_id() {
                if page_id.fd == fd {
                    let data = frame.read_data();
                    self.disk.write_page(page_id.fd, page_id.page_no, &**data)?;
                    frame.set_dirty(false);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use basalt_common::page::PAGE_SIZE;
    use tempfile::tempdir;

    fn setup(pool_size: usize) -> (Arc<DiskManager>, BufferPoolManager, FileId, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let disk = Arc::new(DiskManager::new(false));
        let path = dir.path().join("pool.dat");
        disk.create_file(&path).unwrap();
        let fd = disk.open_file(&path).unwrap();
        let pool = BufferPoolManager::new(pool_size, disk.clone());
        (disk, pool, fd, dir)
    }

    #[test]
    fn test_new_page_pins_and_maps() {
        let (_disk, pool, fd, _dir) = setup(4);
        let (page_id, frame) = pool.new_page(fd).unwrap();
        assert_eq!(page_id.page_no, 0);
        assert_eq!(frame.pin_count(), 1);
        assert!(pool.contains(page_id));
    }

    #[test]
    fn test_fetch_resident_page_bumps_pin() {
        let (_disk, pool, fd, _dir) = setup(4);
        let (page_id, _) = pool.new_page(fd).unwrap();
        let frame = pool.fetch_page(page_id).unwrap();
        assert_eq!(frame.pin_count(), 2);
        assert!(pool.unpin_page(page_id, false));
        assert!(pool.unpin_page(page_id, false));
        assert!(!pool.unpin_page(page_id, false));
    }

    #[test]
    fn test_dirty_data_survives_eviction() {
        let (_disk, pool, fd, _dir) = setup(1);
        let (page_a, frame) = pool.new_page(fd).unwrap();
        frame.write_data()[0] = 0x5A;
        pool.unpin_page(page_a, true);

        // Single frame: creating page B evicts A, which must be written out.
        let (page_b, _) = pool.new_page(fd).unwrap();
        assert!(!pool.contains(page_a));
        pool.unpin_page(page_b, false);

        let frame = pool.fetch_page(page_a).unwrap();
        assert_eq!(frame.read_data()[0], 0x5A);
        pool.unpin_page(page_a, false);
    }

    #[test]
    fn test_buffer_full_when_all_pinned() {
        let (_disk, pool, fd, _dir) = setup(3);
        let mut pages = Vec::new();
        for _ in 0..3 {
            pages.push(pool.new_page(fd).unwrap().0);
        }
        // Fourth page with every frame pinned.
        assert!(matches!(pool.new_page(fd), Err(BasaltError::BufferFull)));

        pool.unpin_page(pages[0], false);
        let (page_d, _) = pool.new_page(fd).unwrap();
        assert!(pool.contains(page_d));
        assert!(!pool.contains(pages[0]));
    }

    #[test]
    fn test_lru_eviction_order() {
        let (_disk, pool, fd, _dir) = setup(2);
        let (page_a, _) = pool.new_page(fd).unwrap();
        let (page_b, _) = pool.new_page(fd).unwrap();
        // Unpin A before B: A is the colder page.
        pool.unpin_page(page_a, false);
        pool.unpin_page(page_b, false);

        let (page_c, _) = pool.new_page(fd).unwrap();
        pool.unpin_page(page_c, false);
        assert!(!pool.contains(page_a));
        assert!(pool.contains(page_b));
    }

    #[test]
    fn test_unpin_unmapped_page_fails() {
        let (_disk, pool, fd, _dir) = setup(2);
        assert!(!pool.unpin_page(PageId::new(fd, 9), false));
    }

    #[test]
    fn test_flush_page() {
        let (disk, pool, fd, _dir) = setup(2);
        let (page_id, frame) = pool.new_page(fd).unwrap();
        frame.write_data()[7] = 0x77;
        pool.unpin_page(page_id, true);

        assert!(pool.flush_page(page_id).unwrap());
        assert!(!frame.is_dirty());

        let mut buf = [0u8; PAGE_SIZE];
        disk.read_page(fd, page_id.page_no, &mut buf).unwrap();
        assert_eq!(buf[7], 0x77);

        assert!(!pool.flush_page(PageId::new(fd, 99)).unwrap());
    }

    #[test]
    fn test_delete_page() {
        let (_disk, pool, fd, _dir) = setup(2);
        let (page_id, _) = pool.new_page(fd).unwrap();

        // Pinned: refuse.
        assert!(!pool.delete_page(page_id).unwrap());

        pool.unpin_page(page_id, true);
        assert!(pool.delete_page(page_id).unwrap());
        assert!(!pool.contains(page_id));

        // Absent: reported as success.
        assert!(pool.delete_page(page_id).unwrap());
    }

    #[test]
    fn test_flush_all_writes_only_target_fd() {
        let (disk, pool, fd, dir) = setup(4);
        let other_path = dir.path().join("other.dat");
        disk.create_file(&other_path).unwrap();
        let other_fd = disk.open_file(&other_path).unwrap();

        let (page_a, fa) = pool.new_page(fd).unwrap();
        fa.write_data()[0] = 1;
        pool.unpin_page(page_a, true);

        let (page_b, fb) = pool.new_page(other_fd).unwrap();
        fb.write_data()[0] = 2;
        pool.unpin_page(page_b, true);

        pool.flush_all(fd).unwrap();
        assert!(!fa.is_dirty());
        assert!(fb.is_dirty());

        let mut buf = [0u8; PAGE_SIZE];
        disk.read_page(fd, page_a.page_no, &mut buf).unwrap();
        assert_eq!(buf[0], 1);
    }

    #[test]
    fn test_pin_accounting_across_operations() {
        let (_disk, pool, fd, _dir) = setup(4);
        let (page_id, frame) = pool.new_page(fd).unwrap();
        for _ in 0..4 {
            pool.fetch_page(page_id).unwrap();
        }
        assert_eq!(frame.pin_count(), 5);
        for _ in 0..5 {
            assert!(pool.unpin_page(page_id, false));
        }
        assert_eq!(frame.pin_count(), 0);
        assert!(!pool.unpin_page(page_id, false));
    }
}
