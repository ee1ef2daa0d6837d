//! B+-tree index handle: ordered key→rid mapping over buffer-pool pages.

use crate::index::node::{btree_order, IxFileHdr, IxNodeHandle, IX_FILE_HDR_PAGE};
use crate::index::KeyComparator;
use basalt_buffer::BufferPoolManager;
use basalt_common::page::{FileId, Iid, PageId, Rid, INVALID_PAGE_NO};
use basalt_common::types::ColType;
use basalt_common::{BasaltError, Result};
use basalt_txn::Transaction;
use log::debug;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::path::Path;
use std::sync::Arc;

/// Derives the index file name for a table and its indexed columns.
pub fn index_name(tab_name: &str, col_names: &[String]) -> String {
    format!("{}_{}.idx", tab_name, col_names.join("_"))
}

/// Creates, opens, and destroys B+-tree index files.
pub struct IndexManager {
    pool: Arc<BufferPoolManager>,
}

impl IndexManager {
    pub fn new(pool: Arc<BufferPoolManager>) -> Self {
        Self { pool }
    }

    /// Creates an index file over the given key schema with an empty root
    /// leaf, ready for inserts.
    pub fn create_index(&self, path: impl AsRef<Path>, cols: Vec<(ColType, usize)>) -> Result<()> {
        let key_size: usize = cols.iter().map(|(_, len)| len).sum();
        if key_size == 0 {
            return Err(BasaltError::Internal("index key has zero width".into()));
        }
        let disk = self.pool.disk();
        disk.create_file(&path)?;
        let fd = disk.open_file(&path)?;

        let hdr_page = disk.allocate_page(fd)?;
        debug_assert_eq!(hdr_page, IX_FILE_HDR_PAGE);
        let root_page = disk.allocate_page(fd)?;

        // Root starts as an empty leaf; it is both first and last leaf.
        let frame = basalt_buffer::Frame::new(basalt_buffer::FrameId(0));
        let node = IxNodeHandle::new(root_page, &frame, key_size);
        node.init(true);
        disk.write_page(fd, root_page, &**frame.read_data())?;

        let hdr = IxFileHdr {
            key_size: key_size as i32,
            btree_order: btree_order(key_size) as i32,
            root_page,
            first_leaf: root_page,
            last_leaf: root_page,
            num_pages: 2,
            cols,
        };
        disk.write_page(fd, IX_FILE_HDR_PAGE, &hdr.to_page_bytes())?;
        disk.close_file(fd)
    }

    /// Opens an index file and loads its header.
    pub fn open_index(&self, path: impl AsRef<Path>) -> Result<BTreeHandle> {
        let disk = self.pool.disk();
        let fd = disk.open_file(&path)?;
        let mut page = [0u8; basalt_common::PAGE_SIZE];
        disk.read_page(fd, IX_FILE_HDR_PAGE, &mut page)?;
        let hdr = IxFileHdr::from_page_bytes(&page);
        let comparator = KeyComparator::new(hdr.cols.clone());
        debug!("opened index {} (order {})", fd, hdr.btree_order);
        Ok(BTreeHandle {
            fd,
            pool: self.pool.clone(),
            comparator,
            hdr: Mutex::new(hdr),
        })
    }

    /// Persists the header, flushes the index's pages, and closes it.
    pub fn close_index(&self, handle: &BTreeHandle) -> Result<()> {
        let disk = self.pool.disk();
        let hdr = handle.hdr.lock().clone();
        disk.write_page(handle.fd, IX_FILE_HDR_PAGE, &hdr.to_page_bytes())?;
        self.pool.flush_all(handle.fd)?;
        disk.close_file(handle.fd)
    }

    /// Removes a (closed) index file.
    pub fn destroy_index(&self, path: impl AsRef<Path>) -> Result<()> {
        self.pool.disk().destroy_file(path)
    }
}

/// Handle over one open B+-tree index.
///
/// Structural operations serialize on the header mutex; node pages are
/// pinned through the buffer pool for the duration of each operation and
/// marked dirty on mutation.
pub struct BTreeHandle {
    fd: FileId,
    pool: Arc<BufferPoolManager>,
    comparator: KeyComparator,
    hdr: Mutex<IxFileHdr>,
}

impl BTreeHandle {
    pub fn fd(&self) -> FileId {
        self.fd
    }

    pub fn comparator(&self) -> &KeyComparator {
        &self.comparator
    }

    fn key_size(&self) -> usize {
        self.comparator.key_size()
    }

    fn min_keys(&self, hdr: &IxFileHdr) -> usize {
        hdr.btree_order as usize / 2
    }

    fn fetch_node(&self, page_no: i32) -> Result<IxNodeHandle<'_>> {
        let frame = self.pool.fetch_page(PageId::new(self.fd, page_no))?;
        Ok(IxNodeHandle::new(page_no, frame, self.key_size()))
    }

    fn release_node(&self, node: IxNodeHandle<'_>, dirty: bool) {
        self.pool
            .unpin_page(PageId::new(self.fd, node.page_no()), dirty);
    }

    /// Allocates and pins a fresh node page.
    fn new_node(&self, hdr: &mut IxFileHdr, is_leaf: bool) -> Result<IxNodeHandle<'_>> {
        let (page_id, frame) = self.pool.new_page(self.fd)?;
        hdr.num_pages += 1;
        let node = IxNodeHandle::new(page_id.page_no, frame, self.key_size());
        node.init(is_leaf);
        node.mark_dirty();
        Ok(node)
    }

    /// Walks from the root to the leaf whose range covers `key`; equal keys
    /// descend right.
    fn descend(&self, hdr: &IxFileHdr, key: &[u8]) -> Result<i32> {
        let mut page_no = hdr.root_page;
        loop {
            let node = self.fetch_node(page_no)?;
            if node.is_leaf() {
                self.release_node(node, false);
                return Ok(page_no);
            }
            let idx = node.upper_bound_key(key, &self.comparator);
            let child = node.child_at(idx);
            self.release_node(node, false);
            page_no = child;
        }
    }

    /// Position before the first entry.
    pub fn leaf_begin(&self) -> Iid {
        let hdr = self.hdr.lock();
        Iid::new(hdr.first_leaf, 0)
    }

    /// Position after the last entry.
    pub fn leaf_end(&self) -> Result<Iid> {
        let hdr = self.hdr.lock();
        let node = self.fetch_node(hdr.last_leaf)?;
        let iid = Iid::new(hdr.last_leaf, node.num_keys() as i32);
        self.release_node(node, false);
        Ok(iid)
    }

    /// Position of the first entry with key `>= key`.
    pub fn lower_bound(&self, key: &[u8]) -> Result<Iid> {
        let hdr = self.hdr.lock();
        self.lower_bound_locked(&hdr, key)
    }

    fn lower_bound_locked(&self, hdr: &IxFileHdr, key: &[u8]) -> Result<Iid> {
        let mut page_no = self.descend(hdr, key)?;
        let mut node = self.fetch_node(page_no)?;
        let mut pos = node.lower_bound_key(key, &self.comparator);

        // A duplicate run may span into earlier leaves.
        while pos == 0 {
            let prev = node.prev_leaf();
            if prev == INVALID_PAGE_NO {
                break;
            }
            let prev_node = self.fetch_node(prev)?;
            let pn = prev_node.num_keys();
            if pn > 0
                && self
                    .comparator
                    .compare(&prev_node.key_at(pn - 1), key)
                    != Ordering::Less
            {
                self.release_node(node, false);
                page_no = prev;
                pos = prev_node.lower_bound_key(key, &self.comparator);
                node = prev_node;
            } else {
                self.release_node(prev_node, false);
                break;
            }
        }

        let num_keys = node.num_keys();
        let next = node.next_leaf();
        self.release_node(node, false);
        Ok(self.normalize(hdr, page_no, pos, num_keys, next))
    }

    /// Position of the first entry with key `> key`.
    pub fn upper_bound(&self, key: &[u8]) -> Result<Iid> {
        let hdr = self.hdr.lock();
        let page_no = self.descend(&hdr, key)?;
        let node = self.fetch_node(page_no)?;
        let pos = node.upper_bound_key(key, &self.comparator);
        let num_keys = node.num_keys();
        let next = node.next_leaf();
        self.release_node(node, false);
        Ok(self.normalize(&hdr, page_no, pos, num_keys, next))
    }

    /// A position one past a non-terminal leaf folds onto the head of the
    /// next leaf so cursors compare positions exactly.
    fn normalize(&self, hdr: &IxFileHdr, page_no: i32, pos: usize, num_keys: usize, next: i32) -> Iid {
        if pos == num_keys && page_no != hdr.last_leaf && next != INVALID_PAGE_NO {
            Iid::new(next, 0)
        } else {
            Iid::new(page_no, pos as i32)
        }
    }

    /// The rid stored at a leaf position.
    pub fn get_rid(&self, iid: Iid) -> Result<Rid> {
        let _hdr = self.hdr.lock();
        let node = self.fetch_node(iid.page_no)?;
        let result = if !node.is_leaf() || iid.slot_no < 0 || iid.slot_no as usize >= node.num_keys()
        {
            Err(BasaltError::Internal(format!(
                "iid {iid} does not address a leaf entry"
            )))
        } else {
            Ok(node.rid_at(iid.slot_no as usize))
        };
        self.release_node(node, false);
        result
    }

    /// Advances a leaf position by one entry, crossing to the next leaf when
    /// the slot runs off the page.
    pub fn next_iid(&self, iid: Iid) -> Result<Iid> {
        let hdr = self.hdr.lock();
        let node = self.fetch_node(iid.page_no)?;
        let mut next = Iid::new(iid.page_no, iid.slot_no + 1);
        if next.slot_no as usize >= node.num_keys() && iid.page_no != hdr.last_leaf {
            let nl = node.next_leaf();
            if nl != INVALID_PAGE_NO {
                next = Iid::new(nl, 0);
            }
        }
        self.release_node(node, false);
        Ok(next)
    }

    /// Inserts a `(key, rid)` entry, splitting on the way up as needed.
    pub fn insert_entry(&self, key: &[u8], rid: Rid, _txn: Option<&Transaction>) -> Result<()> {
        if key.len() != self.key_size() {
            return Err(BasaltError::Internal(format!(
                "key is {} bytes, index stores {}",
                key.len(),
                self.key_size()
            )));
        }
        let mut hdr = self.hdr.lock();
        let leaf_pn = self.descend(&hdr, key)?;
        let leaf = self.fetch_node(leaf_pn)?;

        let pos = leaf.upper_bound_pair(key, rid, &self.comparator);
        if pos > 0
            && leaf.rid_at(pos - 1) == rid
            && self.comparator.compare(&leaf.key_at(pos - 1), key) == Ordering::Equal
        {
            self.release_node(leaf, false);
            return Err(BasaltError::Internal(format!(
                "duplicate index entry for rid {rid}"
            )));
        }

        leaf.leaf_insert(pos, key, rid);
        let overflow = leaf.num_keys() > hdr.btree_order as usize;
        self.release_node(leaf, true);
        if overflow {
            self.split(&mut hdr, leaf_pn)?;
        }
        Ok(())
    }

    /// Splits an overflowing node at the midpoint and pushes the separator
    /// into the parent, recursively.
    fn split(&self, hdr: &mut IxFileHdr, page_no: i32) -> Result<()> {
        let node = self.fetch_node(page_no)?;
        let n = node.num_keys();
        let mid = n / 2;
        let is_leaf = node.is_leaf();

        let right = self.new_node(hdr, is_leaf)?;
        right.set_parent(node.parent());
        let right_pn = right.page_no();

        let separator;
        if is_leaf {
            for i in mid..n {
                right.leaf_insert(i - mid, &node.key_at(i), node.rid_at(i));
            }
            node.leaf_truncate(mid);

            // Stitch the leaf chain around the new node.
            let old_next = node.next_leaf();
            right.set_prev_leaf(page_no);
            right.set_next_leaf(old_next);
            node.set_next_leaf(right_pn);
            if old_next == INVALID_PAGE_NO {
                hdr.last_leaf = right_pn;
            } else {
                let next_node = self.fetch_node(old_next)?;
                next_node.set_prev_leaf(right_pn);
                next_node.mark_dirty();
                self.release_node(next_node, true);
            }
            separator = right.key_at(0);
        } else {
            separator = node.key_at(mid);
            right.set_first_child(node.child_at(mid + 1));
            for i in mid + 1..n {
                right.internal_append(&node.key_at(i), node.child_at(i + 1));
            }
            node.internal_truncate(mid);

            // Moved children switch parents.
            for i in 0..right.num_keys() + 1 {
                let child = self.fetch_node(right.child_at(i))?;
                child.set_parent(right_pn);
                child.mark_dirty();
                self.release_node(child, true);
            }
        }

        let parent_pn = node.parent();
        self.release_node(node, true);
        self.release_node(right, true);

        self.insert_into_parent(hdr, page_no, &separator, right_pn, parent_pn)
    }

    fn insert_into_parent(
        &self,
        hdr: &mut IxFileHdr,
        left_pn: i32,
        separator: &[u8],
        right_pn: i32,
        parent_pn: i32,
    ) -> Result<()> {
        if parent_pn == INVALID_PAGE_NO {
            // The root split: grow a new root with the two halves.
            let root = self.new_node(hdr, false)?;
            root.set_first_child(left_pn);
            root.internal_append(separator, right_pn);
            let root_pn = root.page_no();
            self.release_node(root, true);

            for pn in [left_pn, right_pn] {
                let child = self.fetch_node(pn)?;
                child.set_parent(root_pn);
                child.mark_dirty();
                self.release_node(child, true);
            }
            hdr.root_page = root_pn;
            debug!("index {} grew a new root {root_pn}", self.fd);
            return Ok(());
        }

        let parent = self.fetch_node(parent_pn)?;
        let idx = parent.find_child_pos(left_pn).ok_or_else(|| {
            BasaltError::Internal(format!("page {left_pn} missing from parent {parent_pn}"))
        })?;
        parent.internal_insert(idx, separator, idx + 1, right_pn);
        let overflow = parent.num_keys() > hdr.btree_order as usize;
        self.release_node(parent, true);

        let right = self.fetch_node(right_pn)?;
        right.set_parent(parent_pn);
        right.mark_dirty();
        self.release_node(right, true);

        if overflow {
            self.split(hdr, parent_pn)?;
        }
        Ok(())
    }

    /// Removes the entry for `(key, rid)`; with `rid` None the first entry
    /// matching `key` goes. Returns false if no such entry exists.
    pub fn delete_entry(&self, key: &[u8], rid: Option<Rid>, _txn: Option<&Transaction>) -> Result<bool> {
        let mut hdr = self.hdr.lock();
        let mut iid = self.lower_bound_locked(&hdr, key)?;

        // Walk the duplicate run until the rid matches.
        let (page_no, pos) = loop {
            let node = self.fetch_node(iid.page_no)?;
            let pos = iid.slot_no as usize;
            if pos >= node.num_keys() {
                self.release_node(node, false);
                return Ok(false);
            }
            if self.comparator.compare(&node.key_at(pos), key) != Ordering::Equal {
                self.release_node(node, false);
                return Ok(false);
            }
            if rid.is_none() || rid == Some(node.rid_at(pos)) {
                self.release_node(node, false);
                break (iid.page_no, pos);
            }
            let next = if pos + 1 >= node.num_keys() && iid.page_no != hdr.last_leaf {
                Iid::new(node.next_leaf(), 0)
            } else {
                Iid::new(iid.page_no, iid.slot_no + 1)
            };
            self.release_node(node, false);
            if next.page_no == INVALID_PAGE_NO {
                return Ok(false);
            }
            iid = next;
        };

        let leaf = self.fetch_node(page_no)?;
        leaf.leaf_remove(pos);
        let underfull = leaf.parent() != INVALID_PAGE_NO && leaf.num_keys() < self.min_keys(&hdr);
        self.release_node(leaf, true);

        if underfull {
            self.rebalance(&mut hdr, page_no)?;
        }
        Ok(true)
    }

    /// Restores the minimum-occupancy invariant for a non-root node by
    /// borrowing from a sibling that can spare an entry, or merging.
    fn rebalance(&self, hdr: &mut IxFileHdr, page_no: i32) -> Result<()> {
        let node = self.fetch_node(page_no)?;
        let parent_pn = node.parent();
        if parent_pn == INVALID_PAGE_NO || node.num_keys() >= self.min_keys(hdr) {
            self.release_node(node, false);
            return Ok(());
        }
        let is_leaf = node.is_leaf();
        self.release_node(node, false);

        let parent = self.fetch_node(parent_pn)?;
        let idx = parent.find_child_pos(page_no).ok_or_else(|| {
            BasaltError::Internal(format!("page {page_no} missing from parent {parent_pn}"))
        })?;

        // Borrow from the left sibling.
        if idx > 0 {
            let left_pn = parent.child_at(idx - 1);
            let left = self.fetch_node(left_pn)?;
            if left.num_keys() > self.min_keys(hdr) {
                let node = self.fetch_node(page_no)?;
                let ln = left.num_keys();
                if is_leaf {
                    let (k, r) = (left.key_at(ln - 1), left.rid_at(ln - 1));
                    left.leaf_remove(ln - 1);
                    node.leaf_insert(0, &k, r);
                    parent.set_key_at(idx - 1, &node.key_at(0));
                } else {
                    let moved_child = left.child_at(ln);
                    node.internal_insert(0, &parent.key_at(idx - 1), 0, moved_child);
                    parent.set_key_at(idx - 1, &left.key_at(ln - 1));
                    left.internal_remove(ln - 1, ln);
                    let child = self.fetch_node(moved_child)?;
                    child.set_parent(page_no);
                    child.mark_dirty();
                    self.release_node(child, true);
                }
                self.release_node(node, true);
                self.release_node(left, true);
                parent.mark_dirty();
                self.release_node(parent, true);
                return Ok(());
            }
            self.release_node(left, false);
        }

        // Borrow from the right sibling.
        if idx < parent.num_keys() {
            let right_pn = parent.child_at(idx + 1);
            let right = self.fetch_node(right_pn)?;
            if right.num_keys() > self.min_keys(hdr) {
                let node = self.fetch_node(page_no)?;
                let n = node.num_keys();
                if is_leaf {
                    let (k, r) = (right.key_at(0), right.rid_at(0));
                    right.leaf_remove(0);
                    node.leaf_insert(n, &k, r);
                    parent.set_key_at(idx, &right.key_at(0));
                } else {
                    let moved_child = right.child_at(0);
                    node.internal_append(&parent.key_at(idx), moved_child);
                    parent.set_key_at(idx, &right.key_at(0));
                    right.internal_remove(0, 0);
                    let child = self.fetch_node(moved_child)?;
                    child.set_parent(page_no);
                    child.mark_dirty();
                    self.release_node(child, true);
                }
                self.release_node(node, true);
                self.release_node(right, true);
                parent.mark_dirty();
                self.release_node(parent, true);
                return Ok(());
            }
            self.release_node(right, false);
        }

        // No sibling can spare an entry: merge into the left neighbour, or
        // pull the right neighbour in when this is the leftmost child.
        let sep_idx = if idx > 0 { idx - 1 } else { idx };
        self.release_node(parent, false);
        self.merge(hdr, parent_pn, sep_idx)
    }

    /// Merges children `sep_idx` and `sep_idx + 1` of `parent_pn`, pulling
    /// the separator down, and rebalances upward.
    fn merge(&self, hdr: &mut IxFileHdr, parent_pn: i32, sep_idx: usize) -> Result<()> {
        let parent = self.fetch_node(parent_pn)?;
        let left_pn = parent.child_at(sep_idx);
        let right_pn = parent.child_at(sep_idx + 1);
        let left = self.fetch_node(left_pn)?;
        let right = self.fetch_node(right_pn)?;

        if left.is_leaf() {
            let base = left.num_keys();
            for i in 0..right.num_keys() {
                left.leaf_insert(base + i, &right.key_at(i), right.rid_at(i));
            }
            // Unlink the right leaf from the chain.
            let after = right.next_leaf();
            left.set_next_leaf(after);
            if after == INVALID_PAGE_NO {
                hdr.last_leaf = left_pn;
            } else {
                let after_node = self.fetch_node(after)?;
                after_node.set_prev_leaf(left_pn);
                after_node.mark_dirty();
                self.release_node(after_node, true);
            }
        } else {
            let sep = parent.key_at(sep_idx);
            left.internal_append(&sep, right.child_at(0));
            for i in 0..right.num_keys() {
                left.internal_append(&right.key_at(i), right.child_at(i + 1));
            }
            // Adopted children switch parents.
            for i in 0..right.num_keys() + 1 {
                let child = self.fetch_node(right.child_at(i))?;
                child.set_parent(left_pn);
                child.mark_dirty();
                self.release_node(child, true);
            }
        }

        parent.internal_remove(sep_idx, sep_idx + 1);
        self.release_node(right, false);
        self.pool.delete_page(PageId::new(self.fd, right_pn))?;
        self.release_node(left, true);

        let parent_is_root = parent.parent() == INVALID_PAGE_NO;
        let parent_keys = parent.num_keys();
        self.release_node(parent, true);

        if parent_is_root && parent_keys == 0 {
            // Root shrinks onto its single surviving child.
            let root = self.fetch_node(parent_pn)?;
            let only_child = root.child_at(0);
            self.release_node(root, false);
            self.pool.delete_page(PageId::new(self.fd, parent_pn))?;

            let child = self.fetch_node(only_child)?;
            child.set_parent(INVALID_PAGE_NO);
            child.mark_dirty();
            self.release_node(child, true);
            hdr.root_page = only_child;
            debug!("index {} root shrank onto {only_child}", self.fd);
        } else if !parent_is_root && parent_keys < self.min_keys(hdr) {
            self.rebalance(hdr, parent_pn)?;
        }
        Ok(())
    }
}
