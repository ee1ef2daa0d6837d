//! Forward cursor over a half-open B+-tree leaf range.

use crate::index::tree::BTreeHandle;
use basalt_common::page::{Iid, Rid};
use basalt_common::Result;
use std::sync::Arc;

/// Scans leaf entries in `[lower, upper)`, following the leaf chain.
pub struct IndexScan {
    ih: Arc<BTreeHandle>,
    iid: Iid,
    end: Iid,
}

impl IndexScan {
    pub fn new(ih: Arc<BTreeHandle>, lower: Iid, upper: Iid) -> Self {
        Self {
            ih,
            iid: lower,
            end: upper,
        }
    }

    /// Advances to the next entry.
    pub fn next(&mut self) -> Result<()> {
        if self.is_end() {
            return Ok(());
        }
        self.iid = self.ih.next_iid(self.iid)?;
        Ok(())
    }

    /// True once the cursor has reached the upper bound.
    pub fn is_end(&self) -> bool {
        self.iid == self.end
    }

    /// The position the cursor is on.
    pub fn iid(&self) -> Iid {
        self.iid
    }

    /// The rid stored at the current position.
    pub fn rid(&self) -> Result<Rid> {
        self.ih.get_rid(self.iid)
    }
}
