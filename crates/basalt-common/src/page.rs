//! Page and record identifiers for BasaltDB storage.

use serde::{Deserialize, Serialize};

/// Page size in bytes (4 KB).
pub const PAGE_SIZE: usize = 4096;

/// Sentinel page number meaning "no page".
pub const INVALID_PAGE_NO: i32 = -1;

/// Handle for an open disk file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileId(pub u32);

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fd:{}", self.0)
    }
}

/// Unique identifier for a page: a file handle plus a page number within it.
///
/// Page numbers are signed because `INVALID_PAGE_NO` (-1) is the on-disk
/// sentinel used by the free-page chain and the leaf sibling pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageId {
    /// File the page belongs to.
    pub fd: FileId,
    /// Page number within the file (0-indexed).
    pub page_no: i32,
}

impl PageId {
    /// Creates a new PageId.
    pub fn new(fd: FileId, page_no: i32) -> Self {
        Self { fd, page_no }
    }

    /// Returns true if the page number is not the invalid sentinel.
    pub fn is_valid(&self) -> bool {
        self.page_no != INVALID_PAGE_NO
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.fd.0, self.page_no)
    }
}

/// Record identifier: the page and slot a tuple lives in.
///
/// Stable for the lifetime of the tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Rid {
    pub page_no: i32,
    pub slot_no: i32,
}

impl Rid {
    pub fn new(page_no: i32, slot_no: i32) -> Self {
        Self { page_no, slot_no }
    }
}

impl std::fmt::Display for Rid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.page_no, self.slot_no)
    }
}

/// Position of an entry inside a B+-tree leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Iid {
    pub page_no: i32,
    pub slot_no: i32,
}

impl Iid {
    pub fn new(page_no: i32, slot_no: i32) -> Self {
        Self { page_no, slot_no }
    }
}

impl std::fmt::Display for Iid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.page_no, self.slot_no)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_id_validity() {
        assert!(PageId::new(FileId(0), 3).is_valid());
        assert!(!PageId::new(FileId(0), INVALID_PAGE_NO).is_valid());
    }

    #[test]
    fn test_page_id_display() {
        assert_eq!(PageId::new(FileId(2), 17).to_string(), "2:17");
    }

    #[test]
    fn test_page_id_hash() {
        use std::collections::HashSet;

        let mut set = HashSet::new();
        set.insert(PageId::new(FileId(1), 1));
        set.insert(PageId::new(FileId(1), 2));
        set.insert(PageId::new(FileId(2), 1));
        set.insert(PageId::new(FileId(1), 1));

        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_rid_ordering() {
        let a = Rid::new(1, 5);
        let b = Rid::new(1, 6);
        let c = Rid::new(2, 0);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_rid_serde_roundtrip() {
        let rid = Rid::new(7, 42);
        let json = serde_json::to_string(&rid).unwrap();
        let back: Rid = serde_json::from_str(&json).unwrap();
        assert_eq!(rid, back);
    }

    #[test]
    fn test_iid_display() {
        assert_eq!(Iid::new(4, 0).to_string(), "[4, 0]");
    }
}
