//! B+-tree index management.

pub mod node;
pub mod scan;
pub mod tree;

pub use scan::IndexScan;
pub use tree::{index_name, BTreeHandle, IndexManager};

use basalt_common::types::{compare_encoded, ColType};
use std::cmp::Ordering;

/// Compares encoded index keys column by column.
///
/// A key shorter than the full schema acts as a prefix: comparison stops at
/// the last column both keys fully contain, so bound searches with a
/// leading-column key behave as prefix bounds.
#[derive(Debug, Clone)]
pub struct KeyComparator {
    cols: Vec<(ColType, usize)>,
}

impl KeyComparator {
    pub fn new(cols: Vec<(ColType, usize)>) -> Self {
        Self { cols }
    }

    /// Total byte width of a full key.
    pub fn key_size(&self) -> usize {
        self.cols.iter().map(|(_, len)| len).sum()
    }

    pub fn cols(&self) -> &[(ColType, usize)] {
        &self.cols
    }

    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        let mut off = 0;
        for &(col_type, len) in &self.cols {
            if off + len > a.len() || off + len > b.len() {
                break;
            }
            match compare_encoded(col_type, &a[off..off + len], &b[off..off + len]) {
                Ordering::Equal => off += len,
                other => return other,
            }
        }
        Ordering::Equal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use basalt_common::types::Value;

    fn int_key(v: i32) -> Vec<u8> {
        Value::Int(v).to_bytes(4).unwrap()
    }

    #[test]
    fn test_single_column_compare() {
        let cmp = KeyComparator::new(vec![(ColType::Int, 4)]);
        assert_eq!(cmp.compare(&int_key(1), &int_key(2)), Ordering::Less);
        assert_eq!(cmp.compare(&int_key(-5), &int_key(3)), Ordering::Less);
        assert_eq!(cmp.compare(&int_key(7), &int_key(7)), Ordering::Equal);
    }

    #[test]
    fn test_multi_column_compare() {
        let cmp = KeyComparator::new(vec![(ColType::Int, 4), (ColType::Int, 4)]);
        let a = [int_key(1), int_key(9)].concat();
        let b = [int_key(1), int_key(10)].concat();
        assert_eq!(cmp.compare(&a, &b), Ordering::Less);
        assert_eq!(cmp.key_size(), 8);
    }

    #[test]
    fn test_prefix_compare() {
        let cmp = KeyComparator::new(vec![(ColType::Int, 4), (ColType::Int, 4)]);
        let full = [int_key(1), int_key(9)].concat();
        // A 4-byte prefix key compares only the first column.
        assert_eq!(cmp.compare(&int_key(1), &full), Ordering::Equal);
        assert_eq!(cmp.compare(&int_key(2), &full), Ordering::Greater);
    }
}
