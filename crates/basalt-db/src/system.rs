//! System manager: database lifecycle, DDL, DML with index maintenance and
//! undo recording, and the rollback routines driven by transaction abort.

use crate::catalog::{ColDef, ColMeta, DbMeta, IndexMeta, TabMeta};
use basalt_buffer::BufferPoolManager;
use basalt_common::config::StorageConfig;
use basalt_common::page::Rid;
use basalt_common::{BasaltError, Result};
use basalt_disk::DiskManager;
use basalt_storage::{index_name, BTreeHandle, IndexManager, Record, RecordFileHandle, RecordFileManager, RecordScan};
use basalt_txn::{Context, WriteRecord};
use bytes::Bytes;
use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Name of the append-only log file inside each database directory.
const LOG_FILE_NAME: &str = "db.log";

/// The system manager.
///
/// Owns the catalog for the open database and the open heap/index handles.
/// DDL runs under the catalog mutex; concurrent DDL and DML is out of scope.
pub struct SystemManager {
    disk: Arc<DiskManager>,
    pool: Arc<BufferPoolManager>,
    rm: RecordFileManager,
    ix: IndexManager,
    root_dir: PathBuf,
    db: Mutex<DbMeta>,
    db_dir: Mutex<Option<PathBuf>>,
    fhs: RwLock<HashMap<String, Arc<RecordFileHandle>>>,
    ihs: RwLock<HashMap<String, Arc<BTreeHandle>>>,
}

impl SystemManager {
    /// Builds the storage stack rooted at `root_dir`.
    pub fn new(root_dir: impl Into<PathBuf>, config: &StorageConfig) -> Result<Self> {
        let root_dir = root_dir.into();
        std::fs::create_dir_all(&root_dir)?;
        let disk = Arc::new(DiskManager::new(config.fsync_enabled));
        let pool = Arc::new(BufferPoolManager::new(config.buffer_pool_pages, disk.clone()));
        Ok(Self {
            disk,
            rm: RecordFileManager::new(pool.clone()),
            ix: IndexManager::new(pool.clone()),
            pool,
            root_dir,
            db: Mutex::new(DbMeta::default()),
            db_dir: Mutex::new(None),
            fhs: RwLock::new(HashMap::new()),
            ihs: RwLock::new(HashMap::new()),
        })
    }

    pub fn disk(&self) -> &Arc<DiskManager> {
        &self.disk
    }

    pub fn pool(&self) -> &Arc<BufferPoolManager> {
        &self.pool
    }

    fn db_path(&self, db_name: &str) -> PathBuf {
        self.root_dir.join(db_name)
    }

    fn open_dir(&self) -> Result<PathBuf> {
        self.db_dir
            .lock()
            .clone()
            .ok_or_else(|| BasaltError::Internal("no database is open".into()))
    }

    fn meta_path(&self, dir: &PathBuf, db_name: &str) -> PathBuf {
        dir.join(format!("{db_name}.meta"))
    }

    /// Creates a database: a directory holding the meta file and the log.
    pub fn create_db(&self, db_name: &str) -> Result<()> {
        let dir = self.db_path(db_name);
        if dir.is_dir() {
            return Err(BasaltError::DatabaseExists(db_name.to_string()));
        }
        std::fs::create_dir(&dir)?;
        let meta = DbMeta {
            name: db_name.to_string(),
            tabs: HashMap::new(),
        };
        std::fs::write(
            self.meta_path(&dir, db_name),
            serde_json::to_string(&meta).map_err(meta_error)?,
        )?;
        self.disk.create_file(dir.join(LOG_FILE_NAME))?;
        info!("created database {db_name}");
        Ok(())
    }

    /// Removes a database directory and everything inside.
    pub fn drop_db(&self, db_name: &str) -> Result<()> {
        let dir = self.db_path(db_name);
        if !dir.is_dir() {
            return Err(BasaltError::DatabaseNotFound(db_name.to_string()));
        }
        std::fs::remove_dir_all(dir)?;
        info!("dropped database {db_name}");
        Ok(())
    }

    /// Opens a database: loads the catalog and reopens every heap and index.
    pub fn open_db(&self, db_name: &str) -> Result<()> {
        let dir = self.db_path(db_name);
        if !dir.is_dir() {
            return Err(BasaltError::DatabaseNotFound(db_name.to_string()));
        }
        let meta_json = std::fs::read_to_string(self.meta_path(&dir, db_name))?;
        let meta: DbMeta = serde_json::from_str(&meta_json).map_err(meta_error)?;
        self.disk.open_log(dir.join(LOG_FILE_NAME))?;

        for (tab_name, tab) in &meta.tabs {
            let fh = self.rm.open_file(dir.join(tab_name))?;
            self.fhs.write().insert(tab_name.clone(), Arc::new(fh));
            for index in &tab.indexes {
                let name = index_name(tab_name, &index.col_names());
                let ih = self.ix.open_index(dir.join(&name))?;
                self.ihs.write().insert(name, Arc::new(ih));
            }
        }
        *self.db.lock() = meta;
        *self.db_dir.lock() = Some(dir);
        info!("opened database {db_name}");
        Ok(())
    }

    /// Flushes the catalog and closes every open handle.
    pub fn close_db(&self) -> Result<()> {
        self.flush_meta()?;
        for (_, fh) in self.fhs.write().drain() {
            self.rm.close_file(&fh)?;
        }
        for (_, ih) in self.ihs.write().drain() {
            self.ix.close_index(&ih)?;
        }
        let name = std::mem::take(&mut *self.db.lock()).name;
        *self.db_dir.lock() = None;
        info!("closed database {name}");
        Ok(())
    }

    /// Writes the catalog back to the meta file.
    pub fn flush_meta(&self) -> Result<()> {
        let dir = self.open_dir()?;
        let db = self.db.lock();
        std::fs::write(
            self.meta_path(&dir, &db.name),
            serde_json::to_string(&*db).map_err(meta_error)?,
        )?;
        Ok(())
    }

    /// Snapshot of a table's catalog entry.
    pub fn get_table(&self, tab_name: &str) -> Result<TabMeta> {
        self.db.lock().get_table(tab_name).cloned()
    }

    /// The open heap handle for a table.
    pub fn table_fh(&self, tab_name: &str) -> Result<Arc<RecordFileHandle>> {
        self.fhs
            .read()
            .get(tab_name)
            .cloned()
            .ok_or_else(|| BasaltError::TableNotFound(tab_name.to_string()))
    }

    /// The open index handle for a table's indexed columns.
    pub fn index_ih(&self, tab_name: &str, col_names: &[String]) -> Result<Arc<BTreeHandle>> {
        let name = index_name(tab_name, col_names);
        self.ihs
            .read()
            .get(&name)
            .cloned()
            .ok_or_else(|| BasaltError::IndexNotFound(name))
    }

    /// Creates a table and its heap file.
    pub fn create_table(&self, tab_name: &str, col_defs: &[ColDef]) -> Result<()> {
        let dir = self.open_dir()?;
        {
            let db = self.db.lock();
            if db.is_table(tab_name) {
                return Err(BasaltError::TableExists(tab_name.to_string()));
            }
        }
        let mut offset = 0;
        let mut cols = Vec::with_capacity(col_defs.len());
        for def in col_defs {
            cols.push(ColMeta {
                tab_name: tab_name.to_string(),
                name: def.name.clone(),
                col_type: def.col_type,
                len: def.len,
                offset,
                index: false,
            });
            offset += def.len;
        }
        let tab = TabMeta {
            name: tab_name.to_string(),
            cols,
            indexes: Vec::new(),
        };

        self.rm.create_file(dir.join(tab_name), offset)?;
        let fh = self.rm.open_file(dir.join(tab_name))?;
        self.fhs.write().insert(tab_name.to_string(), Arc::new(fh));
        self.db.lock().tabs.insert(tab_name.to_string(), tab);
        self.flush_meta()?;
        debug!("created table {tab_name} ({offset} bytes per record)");
        Ok(())
    }

    /// Drops a table, its heap file, and all its indexes.
    pub fn drop_table(&self, tab_name: &str) -> Result<()> {
        let dir = self.open_dir()?;
        let tab = self.get_table(tab_name)?;
        for index in &tab.indexes {
            self.drop_index(tab_name, &index.col_names())?;
        }
        if let Some(fh) = self.fhs.write().remove(tab_name) {
            self.rm.close_file(&fh)?;
        }
        self.rm.destroy_file(dir.join(tab_name))?;
        self.db.lock().tabs.remove(tab_name);
        self.flush_meta()?;
        debug!("dropped table {tab_name}");
        Ok(())
    }

    /// Creates a B+-tree index over `col_names` and loads the existing rows.
    pub fn create_index(&self, tab_name: &str, col_names: &[String]) -> Result<()> {
        let dir = self.open_dir()?;
        let tab = self.get_table(tab_name)?;
        if tab.is_index(col_names) {
            return Err(BasaltError::IndexExists(format!(
                "{}({})",
                tab_name,
                col_names.join(", ")
            )));
        }
        let mut index_cols = Vec::with_capacity(col_names.len());
        for name in col_names {
            index_cols.push(tab.get_col(name)?.clone());
        }
        let col_tot_len = index_cols.iter().map(|c| c.len).sum();
        let schema: Vec<_> = index_cols.iter().map(|c| (c.col_type, c.len)).collect();

        let name = index_name(tab_name, col_names);
        self.ix.create_index(dir.join(&name), schema)?;
        let ih = Arc::new(self.ix.open_index(dir.join(&name))?);

        let index_meta = IndexMeta {
            tab_name: tab_name.to_string(),
            col_tot_len,
            cols: index_cols,
        };

        // Existing rows enter the new index.
        let fh = self.table_fh(tab_name)?;
        let mut scan = RecordScan::new(fh.clone())?;
        while !scan.is_end() {
            let rid = scan.rid();
            let record = fh.get_record(rid, None)?;
            ih.insert_entry(&build_key(&index_meta, &record.data), rid, None)?;
            scan.next()?;
        }

        self.ihs.write().insert(name, ih);
        {
            let mut db = self.db.lock();
            let tab = db.tabs.get_mut(tab_name).expect("table exists");
            for col in tab.cols.iter_mut() {
                if col_names.contains(&col.name) {
                    col.index = true;
                }
            }
            tab.indexes.push(index_meta);
        }
        self.flush_meta()?;
        debug!("created index on {}({})", tab_name, col_names.join(", "));
        Ok(())
    }

    /// Drops an index and its file.
    pub fn drop_index(&self, tab_name: &str, col_names: &[String]) -> Result<()> {
        let dir = self.open_dir()?;
        let tab = self.get_table(tab_name)?;
        if !tab.is_index(col_names) {
            return Err(BasaltError::IndexNotFound(format!(
                "{}({})",
                tab_name,
                col_names.join(", ")
            )));
        }
        let name = index_name(tab_name, col_names);
        if let Some(ih) = self.ihs.write().remove(&name) {
            self.ix.close_index(&ih)?;
        }
        self.ix.destroy_index(dir.join(&name))?;
        {
            let mut db = self.db.lock();
            let tab = db.tabs.get_mut(tab_name).expect("table exists");
            tab.indexes.retain(|ix| ix.col_names() != col_names);
            // A column stays flagged only while another index still covers it.
            for col in tab.cols.iter_mut() {
                col.index = tab
                    .indexes
                    .iter()
                    .any(|ix| ix.cols.iter().any(|c| c.name == col.name));
            }
        }
        self.flush_meta()?;
        debug!("dropped index on {}({})", tab_name, col_names.join(", "));
        Ok(())
    }

    // DML entry points. Each maintains every index on the table and appends
    // the matching undo entry to the transaction's write set.

    /// Inserts a record into a table.
    pub fn insert_record(&self, tab_name: &str, buf: &[u8], ctx: &Context) -> Result<Rid> {
        let tab = self.get_table(tab_name)?;
        let fh = self.table_fh(tab_name)?;
        let rid = fh.insert_record(buf, Some(ctx))?;

        for index in &tab.indexes {
            let ih = self.index_ih(tab_name, &index.col_names())?;
            ih.insert_entry(&build_key(index, buf), rid, Some(ctx.txn.as_ref()))?;
        }
        ctx.txn.append_write_record(WriteRecord::Insert {
            tab_name: tab_name.to_string(),
            rid,
        });
        Ok(rid)
    }

    /// Deletes the record at `rid`.
    pub fn delete_record(&self, tab_name: &str, rid: Rid, ctx: &Context) -> Result<()> {
        let tab = self.get_table(tab_name)?;
        let fh = self.table_fh(tab_name)?;
        ctx.lock_mgr.lock_ix_on_table(&ctx.txn, fh.fd())?;
        ctx.lock_mgr.lock_exclusive_on_record(&ctx.txn, rid, fh.fd())?;

        let old = fh.get_record(rid, Some(ctx))?;
        fh.delete_record(rid, Some(ctx))?;
        for index in &tab.indexes {
            let ih = self.index_ih(tab_name, &index.col_names())?;
            ih.delete_entry(&build_key(index, &old.data), Some(rid), Some(ctx.txn.as_ref()))?;
        }
        ctx.txn.append_write_record(WriteRecord::Delete {
            tab_name: tab_name.to_string(),
            record: old.data,
        });
        Ok(())
    }

    /// Overwrites the record at `rid`.
    pub fn update_record(&self, tab_name: &str, rid: Rid, buf: &[u8], ctx: &Context) -> Result<()> {
        let tab = self.get_table(tab_name)?;
        let fh = self.table_fh(tab_name)?;
        ctx.lock_mgr.lock_ix_on_table(&ctx.txn, fh.fd())?;
        ctx.lock_mgr.lock_exclusive_on_record(&ctx.txn, rid, fh.fd())?;

        let old = fh.get_record(rid, Some(ctx))?;
        fh.update_record(rid, buf, Some(ctx))?;
        for index in &tab.indexes {
            let old_key = build_key(index, &old.data);
            let new_key = build_key(index, buf);
            if old_key != new_key {
                let ih = self.index_ih(tab_name, &index.col_names())?;
                ih.delete_entry(&old_key, Some(rid), Some(ctx.txn.as_ref()))?;
                ih.insert_entry(&new_key, rid, Some(ctx.txn.as_ref()))?;
            }
        }
        ctx.txn.append_write_record(WriteRecord::Update {
            tab_name: tab_name.to_string(),
            rid,
            before_image: old.data,
        });
        Ok(())
    }

    /// Reads one record under the transaction's isolation rules.
    pub fn get_record(&self, tab_name: &str, rid: Rid, ctx: &Context) -> Result<Record> {
        self.table_fh(tab_name)?.get_record(rid, Some(ctx))
    }

    // Rollback routines, called by the transaction manager with the write
    // set in reverse order. The aborting transaction still holds every lock
    // it took for the forward operations, so these run lock-free.

    /// Undoes an insert: the rid and its index entries disappear.
    pub fn rollback_insert(&self, tab_name: &str, rid: Rid) -> Result<()> {
        let tab = self.get_table(tab_name)?;
        let fh = self.table_fh(tab_name)?;
        let record = fh.get_record(rid, None)?;
        for index in &tab.indexes {
            let ih = self.index_ih(tab_name, &index.col_names())?;
            ih.delete_entry(&build_key(index, &record.data), Some(rid), None)?;
        }
        fh.delete_record(rid, None)
    }

    /// Undoes a delete: the stored record and its index entries return.
    pub fn rollback_delete(&self, tab_name: &str, record: &Bytes) -> Result<()> {
        let tab = self.get_table(tab_name)?;
        let fh = self.table_fh(tab_name)?;
        let rid = fh.insert_record(record, None)?;
        for index in &tab.indexes {
            let ih = self.index_ih(tab_name, &index.col_names())?;
            ih.insert_entry(&build_key(index, record), rid, None)?;
        }
        Ok(())
    }

    /// Undoes an update: the before-image and its index entries return.
    pub fn rollback_update(&self, tab_name: &str, rid: Rid, before_image: &Bytes) -> Result<()> {
        let tab = self.get_table(tab_name)?;
        let fh = self.table_fh(tab_name)?;
        let current = fh.get_record(rid, None)?;
        fh.update_record(rid, before_image, None)?;
        for index in &tab.indexes {
            let old_key = build_key(index, &current.data);
            let new_key = build_key(index, before_image);
            if old_key != new_key {
                let ih = self.index_ih(tab_name, &index.col_names())?;
                ih.delete_entry(&old_key, Some(rid), None)?;
                ih.insert_entry(&new_key, rid, None)?;
            }
        }
        Ok(())
    }
}

/// Concatenates the indexed columns of a record image into an index key.
pub fn build_key(index: &IndexMeta, record: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(index.col_tot_len);
    for col in &index.cols {
        key.extend_from_slice(&record[col.offset..col.offset + col.len]);
    }
    key
}

fn meta_error(e: serde_json::Error) -> BasaltError {
    BasaltError::Internal(format!("catalog serialization failed: {e}"))
}
