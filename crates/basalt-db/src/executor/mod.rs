//! Scan executors and predicate evaluation.

pub mod index_scan;
pub mod seq_scan;

pub use index_scan::IndexScanExecutor;
pub use seq_scan::SeqScanExecutor;

use crate::catalog::TabMeta;
use basalt_common::page::Rid;
use basalt_common::types::Value;
use basalt_common::Result;
use basalt_storage::Record;
use std::cmp::Ordering;

/// Comparison operators usable in scan predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompOp {
    /// Applies the operator to an ordering of lhs versus rhs.
    pub fn matches(&self, ord: Ordering) -> bool {
        match self {
            CompOp::Eq => ord == Ordering::Equal,
            CompOp::Ne => ord != Ordering::Equal,
            CompOp::Lt => ord == Ordering::Less,
            CompOp::Le => ord != Ordering::Greater,
            CompOp::Gt => ord == Ordering::Greater,
            CompOp::Ge => ord != Ordering::Less,
        }
    }
}

/// A table-qualified column reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabCol {
    pub tab_name: String,
    pub col_name: String,
}

/// Right-hand side of a condition: a literal or another column.
#[derive(Debug, Clone)]
pub enum CondRhs {
    Val(Value),
    Col(TabCol),
}

/// One conjunct of a scan predicate.
#[derive(Debug, Clone)]
pub struct Condition {
    pub lhs_col: TabCol,
    pub op: CompOp,
    pub rhs: CondRhs,
}

/// Extracts a column's value from a record image.
pub fn col_value(tab: &TabMeta, col_name: &str, record: &Record) -> Result<Value> {
    let col = tab.get_col(col_name)?;
    Ok(Value::from_bytes(
        col.col_type,
        &record.data[col.offset..col.offset + col.len],
    ))
}

/// Evaluates a conjunction of conditions against a record.
pub fn eval_conds(tab: &TabMeta, conds: &[Condition], record: &Record) -> Result<bool> {
    for cond in conds {
        let lhs = col_value(tab, &cond.lhs_col.col_name, record)?;
        let rhs = match &cond.rhs {
            CondRhs::Val(v) => v.clone(),
            CondRhs::Col(col) => col_value(tab, &col.col_name, record)?,
        };
        if !cond.op.matches(lhs.compare(&rhs)) {
            return Ok(false);
        }
    }
    Ok(true)
}

/// A forward-only, single-use record iterator.
///
/// `next` returns the current record and advances past it; once the scan is
/// exhausted every further call returns `None`.
pub trait Executor {
    /// Positions the scan on the first tuple satisfying the predicate.
    fn begin_tuple(&mut self) -> Result<()>;

    /// Advances to the next satisfying tuple.
    fn next_tuple(&mut self) -> Result<()>;

    /// Returns the current record and advances.
    fn next(&mut self) -> Result<Option<Record>>;

    /// The rid of the most recently returned record.
    fn rid(&self) -> Rid;

    /// True once the scan is exhausted.
    fn is_end(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ColMeta;
    use basalt_common::types::ColType;
    use bytes::Bytes;

    fn two_int_table() -> TabMeta {
        let col = |name: &str, offset: usize| ColMeta {
            tab_name: "t".into(),
            name: name.into(),
            col_type: ColType::Int,
            len: 4,
            offset,
            index: false,
        };
        TabMeta {
            name: "t".into(),
            cols: vec![col("x", 0), col("y", 4)],
            indexes: vec![],
        }
    }

    fn record(x: i32, y: i32) -> Record {
        Record::new(Bytes::from(
            [x.to_le_bytes(), y.to_le_bytes()].concat(),
        ))
    }

    fn cond_val(col: &str, op: CompOp, v: i32) -> Condition {
        Condition {
            lhs_col: TabCol {
                tab_name: "t".into(),
                col_name: col.into(),
            },
            op,
            rhs: CondRhs::Val(Value::Int(v)),
        }
    }

    #[test]
    fn test_comp_op_matches() {
        assert!(CompOp::Eq.matches(Ordering::Equal));
        assert!(!CompOp::Eq.matches(Ordering::Less));
        assert!(CompOp::Ne.matches(Ordering::Greater));
        assert!(CompOp::Le.matches(Ordering::Equal));
        assert!(CompOp::Ge.matches(Ordering::Greater));
        assert!(!CompOp::Gt.matches(Ordering::Equal));
    }

    #[test]
    fn test_col_value_extraction() {
        let tab = two_int_table();
        let rec = record(3, -9);
        assert_eq!(col_value(&tab, "x", &rec).unwrap(), Value::Int(3));
        assert_eq!(col_value(&tab, "y", &rec).unwrap(), Value::Int(-9));
        assert!(col_value(&tab, "z", &rec).is_err());
    }

    #[test]
    fn test_eval_conjunction() {
        let tab = two_int_table();
        let rec = record(10, 20);

        let conds = vec![
            cond_val("x", CompOp::Ge, 10),
            cond_val("y", CompOp::Lt, 25),
        ];
        assert!(eval_conds(&tab, &conds, &rec).unwrap());

        let conds = vec![
            cond_val("x", CompOp::Ge, 10),
            cond_val("y", CompOp::Gt, 25),
        ];
        assert!(!eval_conds(&tab, &conds, &rec).unwrap());
    }

    #[test]
    fn test_eval_column_to_column() {
        let tab = two_int_table();
        let cond = Condition {
            lhs_col: TabCol {
                tab_name: "t".into(),
                col_name: "x".into(),
            },
            op: CompOp::Lt,
            rhs: CondRhs::Col(TabCol {
                tab_name: "t".into(),
                col_name: "y".into(),
            }),
        };
        assert!(eval_conds(&tab, &[cond.clone()], &record(1, 2)).unwrap());
        assert!(!eval_conds(&tab, &[cond], &record(2, 1)).unwrap());
    }

    #[test]
    fn test_empty_conjunction_is_true() {
        let tab = two_int_table();
        assert!(eval_conds(&tab, &[], &record(0, 0)).unwrap());
    }
}
