//! LRU page replacement for the buffer pool.

use crate::frame::FrameId;
use parking_lot::Mutex;

/// LRU replacer over the pool's unpinned frames.
///
/// Keeps a doubly linked list of frame ids in recency order. Frame ids are
/// dense (`0..num_frames`), so the list nodes live in a flat array and every
/// operation is O(1). Newly unpinned frames enter at the head; victims leave
/// from the tail.
pub struct LruReplacer {
    inner: Mutex<LruInner>,
}

struct LruInner {
    head: Option<usize>,
    tail: Option<usize>,
    nodes: Vec<LruNode>,
    len: usize,
}

#[derive(Clone, Copy, Default)]
struct LruNode {
    prev: Option<usize>,
    next: Option<usize>,
    in_list: bool,
}

impl LruReplacer {
    /// Creates a replacer for a pool of `num_frames` frames.
    pub fn new(num_frames: usize) -> Self {
        Self {
            inner: Mutex::new(LruInner {
                head: None,
                tail: None,
                nodes: vec![LruNode::default(); num_frames],
                len: 0,
            }),
        }
    }

    /// Removes and returns the least-recently-unpinned frame, if any.
    pub fn victim(&self) -> Option<FrameId> {
        let mut inner = self.inner.lock();
        let idx = inner.tail?;
        inner.unlink(idx);
        Some(FrameId(idx as u32))
    }

    /// Marks a frame as unevictable, removing it from the list.
    /// No-op if the frame is not present.
    pub fn pin(&self, frame_id: FrameId) {
        let idx = frame_id.0 as usize;
        let mut inner = self.inner.lock();
        if idx < inner.nodes.len() && inner.nodes[idx].in_list {
            inner.unlink(idx);
        }
    }

    /// Marks a frame as evictable, inserting it at the most-recently-used
    /// end. Idempotent: a frame already present stays where it is.
    pub fn unpin(&self, frame_id: FrameId) {
        let idx = frame_id.0 as usize;
        let mut inner = self.inner.lock();
        if idx < inner.nodes.len() && !inner.nodes[idx].in_list {
            inner.push_front(idx);
        }
    }

    /// Returns the number of evictable frames.
    pub fn size(&self) -> usize {
        self.inner.lock().len
    }
}

impl LruInner {
    fn push_front(&mut self, idx: usize) {
        self.nodes[idx] = LruNode {
            prev: None,
            next: self.head,
            in_list: true,
        };
        if let Some(old_head) = self.head {
            self.nodes[old_head].prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
        self.len += 1;
    }

    fn unlink(&mut self, idx: usize) {
        let node = self.nodes[idx];
        match node.prev {
            Some(p) => self.nodes[p].next = node.next,
            None => self.head = node.next,
        }
        match node.next {
            Some(n) => self.nodes[n].prev = node.prev,
            None => self.tail = node.prev,
        }
        self.nodes[idx] = LruNode::default();
        self.len -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_replacer() {
        let replacer = LruReplacer::new(8);
        assert_eq!(replacer.size(), 0);
        assert!(replacer.victim().is_none());
    }

    #[test]
    fn test_victim_is_least_recently_unpinned() {
        let replacer = LruReplacer::new(8);
        replacer.unpin(FrameId(1));
        replacer.unpin(FrameId(2));
        replacer.unpin(FrameId(3));

        assert_eq!(replacer.victim(), Some(FrameId(1)));
        assert_eq!(replacer.victim(), Some(FrameId(2)));
        assert_eq!(replacer.victim(), Some(FrameId(3)));
        assert!(replacer.victim().is_none());
    }

    #[test]
    fn test_unpin_is_idempotent() {
        let replacer = LruReplacer::new(4);
        replacer.unpin(FrameId(0));
        replacer.unpin(FrameId(1));
        // Re-unpinning frame 0 must not move it back to the MRU end.
        replacer.unpin(FrameId(0));
        assert_eq!(replacer.size(), 2);
        assert_eq!(replacer.victim(), Some(FrameId(0)));
    }

    #[test]
    fn test_pin_removes_from_list() {
        let replacer = LruReplacer::new(4);
        replacer.unpin(FrameId(0));
        replacer.unpin(FrameId(1));
        replacer.unpin(FrameId(2));

        replacer.pin(FrameId(1));
        assert_eq!(replacer.size(), 2);
        assert_eq!(replacer.victim(), Some(FrameId(0)));
        assert_eq!(replacer.victim(), Some(FrameId(2)));
    }

    #[test]
    fn test_pin_absent_frame_is_noop() {
        let replacer = LruReplacer::new(4);
        replacer.unpin(FrameId(0));
        replacer.pin(FrameId(3));
        assert_eq!(replacer.size(), 1);
    }

    #[test]
    fn test_pin_head_and_tail() {
        let replacer = LruReplacer::new(4);
        replacer.unpin(FrameId(0));
        replacer.unpin(FrameId(1));
        replacer.unpin(FrameId(2));

        // Remove the current head and tail; the middle frame remains.
        replacer.pin(FrameId(2));
        replacer.pin(FrameId(0));
        assert_eq!(replacer.size(), 1);
        assert_eq!(replacer.victim(), Some(FrameId(1)));
    }

    #[test]
    fn test_reinsert_after_victim() {
        let replacer = LruReplacer::new(4);
        replacer.unpin(FrameId(0));
        assert_eq!(replacer.victim(), Some(FrameId(0)));
        replacer.unpin(FrameId(0));
        assert_eq!(replacer.size(), 1);
        assert_eq!(replacer.victim(), Some(FrameId(0)));
    }

    #[test]
    fn test_out_of_bounds_ignored() {
        let replacer = LruReplacer::new(2);
        replacer.unpin(FrameId(100));
        replacer.pin(FrameId(100));
        assert_eq!(replacer.size(), 0);
    }
}
