//! Sequential scan executor.

use crate::catalog::TabMeta;
use crate::executor::{eval_conds, Condition, Executor};
use basalt_common::page::Rid;
use basalt_common::{BasaltError, Result};
use basalt_storage::{Record, RecordFileHandle, RecordScan};
use basalt_txn::Context;
use std::sync::Arc;

/// Walks a table's heap in rid order, returning the records that satisfy a
/// conjunction of predicates. Takes a shared table lock at `begin_tuple`.
pub struct SeqScanExecutor {
    tab: TabMeta,
    fh: Arc<RecordFileHandle>,
    conds: Vec<Condition>,
    ctx: Context,
    scan: Option<RecordScan>,
    current: Option<(Rid, Record)>,
    last_rid: Rid,
}

impl SeqScanExecutor {
    pub fn new(
        tab: TabMeta,
        fh: Arc<RecordFileHandle>,
        conds: Vec<Condition>,
        ctx: Context,
    ) -> Self {
        Self {
            tab,
            fh,
            conds,
            ctx,
            scan: None,
            current: None,
            last_rid: Rid::new(-1, -1),
        }
    }

    /// Moves the underlying cursor forward until it rests on a record that
    /// satisfies the predicate, caching the record.
    fn settle(&mut self) -> Result<()> {
        let Some(scan) = self.scan.as_mut() else {
            self.current = None;
            return Ok(());
        };
        while !scan.is_end() {
            let rid = scan.rid();
            match self.fh.get_record(rid, Some(&self.ctx)) {
                Ok(record) => {
                    if eval_conds(&self.tab, &self.conds, &record)? {
                        self.current = Some((rid, record));
                        return Ok(());
                    }
                }
                // A slot freed between cursor steps is skipped, not an error.
                Err(BasaltError::RecordNotFound(_)) => {}
                Err(e) => return Err(e),
            }
            scan.next()?;
        }
        self.current = None;
        Ok(())
    }
}

impl Executor for SeqScanExecutor {
    fn begin_tuple(&mut self) -> Result<()> {
        self.ctx
            .lock_mgr
            .lock_shared_on_table(&self.ctx.txn, self.fh.fd())?;
        self.scan = Some(RecordScan::new(self.fh.clone())?);
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
