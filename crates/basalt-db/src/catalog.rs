//! Catalog metadata: databases, tables, columns, indexes.
//!
//! The catalog serializes to `<db>.meta` as JSON inside the database
//! directory. Column offsets are fixed at table creation; records are
//! fixed-width concatenations of their columns.

use basalt_common::types::ColType;
use basalt_common::{BasaltError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A column as declared in CREATE TABLE.
#[derive(Debug, Clone)]
pub struct ColDef {
    pub name: String,
    pub col_type: ColType,
    pub len: usize,
}

/// Catalog entry for one column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColMeta {
    pub tab_name: String,
    pub name: String,
    pub col_type: ColType,
    pub len: usize,
    pub offset: usize,
    /// True when some index covers this column.
    pub index: bool,
}

/// Catalog entry for one index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMeta {
    pub tab_name: String,
    pub col_tot_len: usize,
    pub cols: Vec<ColMeta>,
}

impl IndexMeta {
    pub fn col_names(&self) -> Vec<String> {
        self.cols.iter().map(|c| c.name.clone()).collect()
    }
}

/// Catalog entry for one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabMeta {
    pub name: String,
    pub cols: Vec<ColMeta>,
    pub indexes: Vec<IndexMeta>,
}

impl TabMeta {
    /// Fixed record width: the end of the last column.
    pub fn record_size(&self) -> usize {
        self.cols.last().map(|c| c.offset + c.len).unwrap_or(0)
    }

    pub fn get_col(&self, name: &str) -> Result<&ColMeta> {
        self.cols
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| BasaltError::ColumnNotFound(format!("{}.{}", self.name, name)))
    }

    pub fn is_index(&self, col_names: &[String]) -> bool {
        self.indexes
            .iter()
            .any(|ix| ix.col_names() == col_names)
    }

    pub fn get_index_meta(&self, col_names: &[String]) -> Result<&IndexMeta> {
        self.indexes
            .iter()
            .find(|ix| ix.col_names() == col_names)
            .ok_or_else(|| {
                BasaltError::IndexNotFound(format!("{}({})", self.name, col_names.join(", ")))
            })
    }
}

/// The whole catalog for one database.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DbMeta {
    pub name: String,
    pub tabs: HashMap<String, TabMeta>,
}

impl DbMeta {
    pub fn is_table(&self, tab_name: &str) -> bool {
        self.tabs.contains_key(tab_name)
    }

    pub fn get_table(&self, tab_name: &str) -> Result<&TabMeta> {
        self.tabs
            .get(tab_name)
            .ok_or_else(|| BasaltError::TableNotFound(tab_name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_table() -> TabMeta {
        TabMeta {
            name: "emp".into(),
            cols: vec![
                ColMeta {
                    tab_name: "emp".into(),
                    name: "id".into(),
                    col_type: ColType::Int,
                    len: 4,
                    offset: 0,
                    index: true,
                },
                ColMeta {
                    tab_name: "emp".into(),
                    name: "name".into(),
                    col_type: ColType::Char,
                    len: 16,
                    offset: 4,
                    index: false,
                },
            ],
            indexes: vec![],
        }
    }

    #[test]
    fn test_record_size_is_last_offset_plus_len() {
        let tab = sample_table();
        assert_eq!(tab.record_size(), 20);
    }

    #[test]
    fn test_get_col() {
        let tab = sample_table();
        assert_eq!(tab.get_col("name").unwrap().offset, 4);
        assert!(matches!(
            tab.get_col("salary"),
            Err(BasaltError::ColumnNotFound(_))
        ));
    }

    #[test]
    fn test_index_lookup() {
        let mut tab = sample_table();
        tab.indexes.push(IndexMeta {
            tab_name: "emp".into(),
            col_tot_len: 4,
            cols: vec![tab.cols[0].clone()],
        });

        assert!(tab.is_index(&["id".to_string()]));
        assert!(!tab.is_index(&["name".to_string()]));
        assert_eq!(
            tab.get_index_meta(&["id".to_string()]).unwrap().col_tot_len,
            4
        );
        assert!(matches!(
            tab.get_index_meta(&["name".to_string()]),
            Err(BasaltError::IndexNotFound(_))
        ));
    }

    #[test]
    fn test_db_meta_serde_roundtrip() {
        let mut db = DbMeta {
            name: "shop".into(),
            tabs: HashMap::new(),
        };
        db.tabs.insert("emp".into(), sample_table());

        let json = serde_json::to_string(&db).unwrap();
        let back: DbMeta = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, "shop");
        assert_eq!(back.get_table("emp").unwrap(), &sample_table());
    }

    #[test]
    fn test_get_missing_table() {
        let db = DbMeta::default();
        assert!(matches!(
            db.get_table("ghost"),
            Err(BasaltError::TableNotFound(_))
        ));
    }
}
