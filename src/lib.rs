//! # WAL B+-tree storage engine
//!
//! A single-node, disk-based, multi-table key/value storage engine: a
//! B+-tree index over slotted pages, a clock-less LRU buffer pool, a
//! record-level two-phase lock manager with deadlock detection, and an
//! ARIES-style write-ahead log with analysis/redo/undo recovery.
//!
//! ## Architecture
//!
//! - **Storage layer** (`storage`): per-table paged file I/O and free list.
//! - **Buffer pool** (`buffer`): LRU frame cache shared across open tables.
//! - **Page layer** (`page`): slotted leaf pages and fixed-entry internal pages.
//! - **B+-tree layer** (`btree`): find/insert/delete/scan/update.
//! - **Transaction layer** (`txn`): record locks and the transaction table.
//! - **Write-ahead log** (`wal`): record format, durable append, recovery.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use wal_btree_engine::{Engine, EngineConfig};
//!
//! let config = EngineConfig::new("wal.log", "recovery.log").table_path("t1.db");
//! let engine = Engine::init(config)?;
//!
//! let table = engine.open_table("t1.db")?;
//! engine.insert(table, 1, vec![b'x'; 60])?;
//!
//! let trx = engine.begin_transaction();
//! engine.update(table, 1, vec![b'y'; 60], trx)?;
//! engine.commit_transaction(trx)?;
//!
//! engine.shutdown()?;
//! ```

pub mod buffer;
pub mod btree;
pub mod error;
pub mod page;
pub mod storage;
pub mod txn;
pub mod types;
pub mod wal;

pub use error::{EngineError, Result};
pub use types::{Lsn, RecordKey, TableId, TrxId, PAGE_SIZE};
pub use wal::RecoveryMode;

use btree::BTree;
use buffer::BufferPool;
use storage::{DiskManager, DiskManagerImpl};
use txn::lock::{LockMode, RecordId};
use txn::{LockManager, TransactionManager};
use types::MAX_NUM_TABLE;
use wal::{LogManager, LogRecordType};

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Engine configuration: table files, buffer pool size, WAL/recovery-trace
/// paths, and recovery mode. Generalizes the teacher crate's `Config`.
///
/// Which table file becomes which `TableId` is this struct's call - table
/// paths are opened in order starting at `TableId` 1, and that order must
/// be reproduced across a crash for WAL records (which carry only a bare
/// `TableId`) to resolve correctly during recovery.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EngineConfig {
    pub table_paths: Vec<PathBuf>,
    pub buffer_pool_size: usize,
    pub wal_path: PathBuf,
    pub logmsg_path: PathBuf,
    pub recovery_mode: RecoveryMode,
    pub sync_on_write: bool,
}

impl EngineConfig {
    /// A configuration with no tables yet open, 1000 buffer frames, normal
    /// recovery, and writes not forced to disk synchronously.
    pub fn new<P: Into<PathBuf>, Q: Into<PathBuf>>(wal_path: P, logmsg_path: Q) -> Self {
        Self {
            table_paths: Vec::new(),
            buffer_pool_size: 1000,
            wal_path: wal_path.into(),
            logmsg_path: logmsg_path.into(),
            recovery_mode: RecoveryMode::Normal,
            sync_on_write: false,
        }
    }

    /// Append a table file to be opened (in order) by `Engine::init`.
    pub fn table_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.table_paths.push(path.into());
        self
    }

    pub fn buffer_pool_size(mut self, size: usize) -> Self {
        self.buffer_pool_size = size;
        self
    }

    pub fn sync_on_write(mut self, enabled: bool) -> Self {
        self.sync_on_write = enabled;
        self
    }

    pub fn recovery_mode(mut self, mode: RecoveryMode) -> Self {
        self.recovery_mode = mode;
        self
    }
}

struct TableRegistry {
    path_to_id: HashMap<PathBuf, TableId>,
    next_id: TableId,
}

/// The storage engine: one buffer pool, lock table, transaction table and
/// WAL shared across every open table.
///
/// This is the primary public interface for the storage engine. Global
/// mutable state that the course project this engine is modeled on keeps as
/// process-wide statics (open-tables map, buffer pool, lock table,
/// transaction table, log file) lives here instead, scoped to one `Engine`
/// handle created by `init` and consumed by `shutdown`.
pub struct Engine {
    pool: Arc<BufferPool>,
    wal: Arc<LogManager>,
    lock_manager: Arc<LockManager>,
    txn_manager: Arc<TransactionManager>,
    trees: RwLock<HashMap<TableId, Arc<BTree>>>,
    tables: Mutex<TableRegistry>,
    sync_on_write: bool,
}

impl Engine {
    /// Open every configured table, open the WAL, and run ARIES recovery
    /// before any client request is served.
    pub fn init(config: EngineConfig) -> Result<Self> {
        let pool = BufferPool::new(config.buffer_pool_size);
        let lock_manager = Arc::new(LockManager::new());
        let txn_manager = Arc::new(TransactionManager::new(lock_manager.clone()));
        let wal = Arc::new(LogManager::open(&config.wal_path)?);
        pool.attach_wal(wal.clone());

        let engine = Self {
            pool,
            wal,
            lock_manager,
            txn_manager,
            trees: RwLock::new(HashMap::new()),
            tables: Mutex::new(TableRegistry { path_to_id: HashMap::new(), next_id: 1 }),
            sync_on_write: config.sync_on_write,
        };

        for path in &config.table_paths {
            engine.open_table(path)?;
        }

        wal::recovery::recover(
            &engine.wal,
            &engine.pool,
            &engine.txn_manager,
            config.recovery_mode,
            &config.logmsg_path,
        )?;

        log::info!("engine initialized with {} table(s)", config.table_paths.len());
        Ok(engine)
    }

    /// Open (or re-open) a table file, returning its `TableId`. Idempotent:
    /// re-opening an already-open path returns the same id. At most
    /// `MAX_NUM_TABLE` tables may be open at once.
    pub fn open_table<P: AsRef<Path>>(&self, path: P) -> Result<TableId> {
        let path = path.as_ref().to_path_buf();
        let mut reg = self.tables.lock();
        if let Some(&id) = reg.path_to_id.get(&path) {
            return Ok(id);
        }
        if reg.path_to_id.len() >= MAX_NUM_TABLE {
            return Err(EngineError::TooManyTables(MAX_NUM_TABLE));
        }

        let id = reg.next_id;
        let disk: Arc<dyn DiskManager> = Arc::new(DiskManagerImpl::open(&path, self.sync_on_write)?);
        self.pool.register_table(id, disk.clone());
        let tree = Arc::new(BTree::new(self.pool.clone(), disk, id));

        self.trees.write().insert(id, tree);
        reg.path_to_id.insert(path, id);
        reg.next_id += 1;
        log::debug!("opened table {id}");
        Ok(id)
    }

    fn tree(&self, table: TableId) -> Result<Arc<BTree>> {
        self.trees.read().get(&table).cloned().ok_or(EngineError::UnknownTable(table))
    }

    /// Insert a new key. Not lock- or WAL-protected, matching the scope the
    /// course project's own `db_insert` gives structural tree operations.
    pub fn insert(&self, table: TableId, key: RecordKey, value: Vec<u8>) -> Result<()> {
        self.tree(table)?.insert(key, value)
    }

    /// Look up a key. When `trx` is `Some`, acquires a SHARED record lock
    /// first and aborts the transaction if that would deadlock.
    pub fn find(&self, table: TableId, key: RecordKey, trx: Option<TrxId>) -> Result<Option<Vec<u8>>> {
        let tree = self.tree(table)?;
        let Some(trx_id) = trx else {
            return tree.find(key);
        };

        let leaf = match tree.find_leaf_page(key) {
            Ok(id) => id,
            Err(EngineError::KeyNotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        self.acquire_or_abort(table, leaf, key, trx_id, LockMode::Shared)?;
        tree.find(key)
    }

    /// Replace an existing key's value under an EXCLUSIVE record lock,
    /// WAL-logging the change. Returns the old value's size.
    pub fn update(&self, table: TableId, key: RecordKey, value: Vec<u8>, trx: TrxId) -> Result<usize> {
        let tree = self.tree(table)?;
        let leaf = tree.find_leaf_page(key)?;
        self.acquire_or_abort(table, leaf, key, trx, LockMode::Exclusive)?;

        let prev_lsn = self.txn_manager.last_lsn(trx)?;
        let (old_size, lsn) = tree.update(key, value, trx, &self.wal, prev_lsn)?;
        self.txn_manager.set_last_lsn(trx, lsn)?;
        Ok(old_size)
    }

    /// Delete a key. Not lock- or WAL-protected, matching `db_delete`'s scope.
    pub fn delete(&self, table: TableId, key: RecordKey) -> Result<()> {
        self.tree(table)?.delete(key)
    }

    /// Return every key in `[begin, end]` with its value, in key order.
    pub fn scan(&self, table: TableId, begin: RecordKey, end: RecordKey) -> Result<Vec<(RecordKey, Vec<u8>)>> {
        self.tree(table)?.scan(begin, end)
    }

    fn acquire_or_abort(
        &self,
        table: TableId,
        page: types::PageId,
        key: RecordKey,
        trx_id: TrxId,
        mode: LockMode,
    ) -> Result<()> {
        let record: RecordId = (table, page, key);
        match self.lock_manager.acquire(record, trx_id, mode) {
            Ok(req) => self.txn_manager.record_lock(trx_id, record, req),
            Err(e @ EngineError::DeadlockAborted(_)) => {
                self.abort_transaction(trx_id)?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Start a new transaction and log its BEGIN record. Always succeeds.
    pub fn begin_transaction(&self) -> TrxId {
        let id = self.txn_manager.begin();
        let lsn = self.wal.append_begin(id);
        self.txn_manager.set_last_lsn(id, lsn).ok();
        log::trace!("trx {id} begin at lsn {lsn}");
        id
    }

    /// Release every lock the transaction holds and durably log its COMMIT.
    pub fn commit_transaction(&self, trx: TrxId) -> Result<TrxId> {
        let last_lsn = self.txn_manager.last_lsn(trx)?;
        self.wal.append_commit_and_flush(trx, last_lsn)?;
        self.txn_manager.end(trx)?;
        log::trace!("trx {trx} commit");
        Ok(trx)
    }

    /// Walk the transaction's log chain backward by `prev_lsn`, physically
    /// undoing each UPDATE and emitting a CLR, then log its ROLLBACK and
    /// release its locks. Shares `wal::recovery::undo_one` with crash undo.
    pub fn abort_transaction(&self, trx: TrxId) -> Result<TrxId> {
        let mut current = self.txn_manager.last_lsn(trx)?;
        while current >= 0 {
            let record = self.wal.read_one(current)?;
            if record.rtype == LogRecordType::Update {
                wal::recovery::undo_one(&self.pool, &self.wal, &self.txn_manager, &record)?;
            }
            current = record.prev_lsn;
        }

        let last_lsn = self.txn_manager.last_lsn(trx)?;
        self.wal.append_rollback_and_flush(trx, last_lsn)?;
        self.txn_manager.end(trx)?;
        log::debug!("trx {trx} aborted");
        Ok(trx)
    }

    /// Abort every still-active transaction, flush the WAL, and write back
    /// every dirty frame. Table files close when the returned handles drop.
    pub fn shutdown(self) -> Result<()> {
        for trx in self.txn_manager.active_ids() {
            self.abort_transaction(trx)?;
        }
        self.wal.flush()?;
        self.pool.flush_all(None)?;
        log::info!("engine shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config(dir: &std::path::Path) -> EngineConfig {
        EngineConfig::new(dir.join("wal.log"), dir.join("recovery.log")).table_path(dir.join("t1.db"))
    }

    #[test]
    fn insert_find_update_delete_roundtrip() {
        let dir = tempdir().unwrap();
        let engine = Engine::init(config(dir.path())).unwrap();
        let table = engine.open_table(dir.path().join("t1.db")).unwrap();

        engine.insert(table, 1, vec![b'a'; 60]).unwrap();
        assert_eq!(engine.find(table, 1, None).unwrap(), Some(vec![b'a'; 60]));

        let trx = engine.begin_transaction();
        let old_size = engine.update(table, 1, vec![b'b'; 70], trx).unwrap();
        assert_eq!(old_size, 60);
        engine.commit_transaction(trx).unwrap();

        assert_eq!(engine.find(table, 1, None).unwrap(), Some(vec![b'b'; 70]));

        engine.delete(table, 1).unwrap();
        assert_eq!(engine.find(table, 1, None).unwrap(), None);
    }

    #[test]
    fn open_table_is_idempotent_and_capped() {
        let dir = tempdir().unwrap();
        let engine = Engine::init(config(dir.path())).unwrap();
        let path = dir.path().join("t1.db");
        let first = engine.open_table(&path).unwrap();
        let second = engine.open_table(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn abort_undoes_uncommitted_update() {
        let dir = tempdir().unwrap();
        let engine = Engine::init(config(dir.path())).unwrap();
        let table = engine.open_table(dir.path().join("t1.db")).unwrap();
        engine.insert(table, 1, vec![b'a'; 60]).unwrap();

        let trx = engine.begin_transaction();
        engine.update(table, 1, vec![b'b'; 60], trx).unwrap();
        engine.abort_transaction(trx).unwrap();

        assert_eq!(engine.find(table, 1, None).unwrap(), Some(vec![b'a'; 60]));
    }

    #[test]
    fn scan_returns_keys_in_order() {
        let dir = tempdir().unwrap();
        let engine = Engine::init(config(dir.path())).unwrap();
        let table = engine.open_table(dir.path().join("t1.db")).unwrap();
        for key in [3, 1, 2] {
            engine.insert(table, key, vec![b'x'; 50]).unwrap();
        }
        let scanned: Vec<RecordKey> = engine.scan(table, 1, 3).unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(scanned, vec![1, 2, 3]);
    }

    #[test]
    fn shutdown_aborts_in_flight_transactions() {
        let dir = tempdir().unwrap();
        let engine = Engine::init(config(dir.path())).unwrap();
        let table = engine.open_table(dir.path().join("t1.db")).unwrap();
        engine.insert(table, 1, vec![b'a'; 60]).unwrap();

        let trx = engine.begin_transaction();
        engine.update(table, 1, vec![b'b'; 60], trx).unwrap();
        engine.shutdown().unwrap();

        let engine = Engine::init(config(dir.path())).unwrap();
        let table = engine.open_table(dir.path().join("t1.db")).unwrap();
        assert_eq!(engine.find(table, 1, None).unwrap(), Some(vec![b'a'; 60]));
    }
}
