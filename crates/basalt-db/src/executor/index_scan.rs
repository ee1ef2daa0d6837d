//! Index scan executor.

use crate::catalog::{IndexMeta, TabMeta};
use crate::executor::{eval_conds, CompOp, CondRhs, Condition, Executor};
use basalt_common::page::Rid;
use basalt_common::{BasaltError, Result};
use basalt_storage::{BTreeHandle, IndexScan, Record, RecordFileHandle};
use basalt_txn::Context;
use std::sync::Arc;

/// Drives a B+-tree cursor over the half-open leaf range derived from the
/// predicates on the index's leading column, re-checking the full predicate
/// against each fetched record.
pub struct IndexScanExecutor {
    tab: TabMeta,
    index_meta: IndexMeta,
    fh: Arc<RecordFileHandle>,
    ih: Arc<BTreeHandle>,
    conds: Vec<Condition>,
    ctx: Context,
    scan: Option<IndexScan>,
    current: Option<(Rid, Record)>,
    last_rid: Rid,
}

impl IndexScanExecutor {
    pub fn new(
        tab: TabMeta,
        index_meta: IndexMeta,
        fh: Arc<RecordFileHandle>,
        ih: Arc<BTreeHandle>,
        conds: Vec<Condition>,
        ctx: Context,
    ) -> Self {
        Self {
            tab,
            index_meta,
            fh,
            ih,
            conds,
            ctx,
            scan: None,
            current: None,
            last_rid: Rid::new(-1, -1),
        }
    }

    /// Narrows `[lower, upper)` using every literal predicate on the index's
    /// leading column: equality closes both bounds, `<`/`<=` the upper,
    /// `>`/`>=` the lower.
    fn adjust_bounds(
        &self,
        lower: basalt_common::page::Iid,
        upper: basalt_common::page::Iid,
    ) -> Result<(basalt_common::page::Iid, basalt_common::page::Iid)> {
        let leading = &self.index_meta.cols[0];
        let mut lower = lower;
        let mut upper = upper;

        for cond in &self.conds {
            if cond.lhs_col.col_name != leading.name {
                continue;
            }
            let CondRhs::Val(val) = &cond.rhs else {
                continue;
            };
            let key = val.to_bytes(leading.len)?;
            match cond.op {
                CompOp::Eq => {
                    lower = self.ih.lower_bound(&key)?;
                    upper = self.ih.upper_bound(&key)?;
                }
                CompOp::Gt => lower = self.ih.upper_bound(&key)?,
                CompOp::Ge => lower = self.ih.lower_bound(&key)?,
                CompOp::Lt => upper = self.ih.lower_bound(&key)?,
                CompOp::Le => upper = self.ih.upper_bound(&key)?,
                CompOp::Ne => {}
            }
        }
        Ok((lower, upper))
    }

    /// Moves the cursor forward until the record it points at satisfies the
    /// whole predicate, caching the record.
    fn settle(&mut self) -> Result<()> {
        loop {
            let Some(scan) = self.scan.as_mut() else {
                self.current = None;
                return Ok(());
            };
            if scan.is_end() {
                self.current = None;
                return Ok(());
            }
            // A cursor that runs off the last leaf without meeting `upper`
            // (contradictory bounds) terminates instead of erroring.
            let Ok(rid) = scan.rid() else {
                self.current = None;
                return Ok(());
            };
            match self.fh.get_record(rid, Some(&self.ctx)) {
                Ok(record) => {
                    if eval_conds(&self.tab, &self.conds, &record)? {
                        self.current = Some((rid, record));
                        return Ok(());
                    }
                }
                // Heap slot vanished under the cursor; skip the entry.
                Err(BasaltError::RecordNotFound(_)) => {}
                Err(e) => return Err(e),
            }
            if let Some(scan) = self.scan.as_mut() {
                scan.next()?;
            }
        }
    }
}

impl Executor for IndexScanExecutor {
    fn begin_tuple(&mut self) -> Result<()> {
        self.ctx
            .lock_mgr
            .lock_shared_on_table(&self.ctx.txn, self.fh.fd())?;

        let lower = self.ih.leaf_begin();
        let upper = self.ih.leaf_end()?;
        let (lower, upper) = self.adjust_bounds(lower, upper)?;
        self.scan = Some(IndexScan::new(self.ih.clone(), lower, upper));
        self.settle()
    }

    fn next_tuple(&mut self) -> Result<()> {
        if let Some(scan) = self.scan.as_mut() {
            if !scan.is_end() {
                scan.next()?;
            }
        }
        self.settle()
    }

    fn next(&mut self) -> Result<Option<Record>> {
        let Some((rid, record)) = self.current.take() else {
            return Ok(None);
        };
        self.last_rid = rid;
        self.next_tuple()?;
        Ok(Some(record))
    }

    fn rid(&self) -> Rid {
        self.current
            .as_ref()
            .map(|(rid, _)| *rid)
            .unwrap_or(self.last_rid)
    }

    fn is_end(&self) -> bool {
        self.current.is_none()
    }
}
