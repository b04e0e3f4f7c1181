//! ARIES-style recovery: a single analysis pass followed by redo and undo
//! passes, run once from `Engine::init` before any client request is served.
//!
//! Grounded directly in the course project's `log_recover` (see
//! `examples/original_source/project6/db_project/db/src/log.cc`): the pass
//! structure, the CLR-driven "drop already-undone" pruning in analysis, and
//! the human-readable trace line shapes all mirror it. One deliberate
//! departure: the original logs a byte *range* within a page (`offset`,
//! `length`) taken from `db_update`'s in-place value write; this engine's
//! page layer always works on a fully decoded `TreePage`, so `Engine::update`
//! logs the whole page's before/after image instead (`offset = 0`,
//! `length = PAGE_SIZE`, which still fits the 16-bit length field) and redo
//! /undo here just swap in a freshly decoded page rather than splicing a
//! byte range. See DESIGN.md.

use crate::buffer::BufferPool;
use crate::error::Result;
use crate::page::TreePage;
use crate::txn::transaction::TransactionManager;
use crate::wal::manager::LogManager;
use crate::wal::record::{ImageDelta, LogRecord, LogRecordBody, LogRecordType};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

/// How recovery should run, mirroring `init_db`'s `flag`/`log_num` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RecoveryMode {
    Normal,
    /// Stop after applying `after` redo records (simulated crash mid-redo).
    RedoCrash { after: usize },
    /// Stop after applying `after` undo steps (simulated crash mid-undo).
    UndoCrash { after: usize },
}

/// Run analysis, redo, and undo against `pool`'s already-registered tables,
/// writing a human-readable trace to `logmsg_path`. Resurrects loser
/// transactions into `txn_mgr` as analysis finds them.
pub fn recover(
    wal: &LogManager,
    pool: &Arc<BufferPool>,
    txn_mgr: &TransactionManager,
    mode: RecoveryMode,
    logmsg_path: &Path,
) -> Result<()> {
    let mut trace = File::create(logmsg_path)?;

    // --- Analysis ---------------------------------------------------
    writeln!(trace, "[ANALYSIS] Analysis pass start")?;
    let redo_logs = wal.read_all()?;

    let mut winners: BTreeSet<i32> = BTreeSet::new();
    let mut losers: BTreeSet<i32> = BTreeSet::new();
    for record in &redo_logs {
        match record.rtype {
            LogRecordType::Begin => {
                losers.insert(record.trx_id);
            }
            LogRecordType::Commit | LogRecordType::Rollback => {
                winners.insert(record.trx_id);
                losers.remove(&record.trx_id);
            }
            _ => {}
        }
    }

    let mut undo_logs: Vec<LogRecord> =
        redo_logs.iter().filter(|r| losers.contains(&r.trx_id)).cloned().collect();

    for &trx_id in &losers {
        let last_idx = undo_logs.iter().rposition(|r| r.trx_id == trx_id);
        let Some(last_idx) = last_idx else { continue };
        if !txn_mgr.is_active(trx_id) {
            txn_mgr.resurrect(trx_id, undo_logs[last_idx].lsn);
        }
        if let LogRecordBody::Compensate { next_undo_lsn, .. } = &undo_logs[last_idx].body {
            let next_undo_lsn = *next_undo_lsn;
            undo_logs.retain(|r| !(r.trx_id == trx_id && r.lsn > next_undo_lsn));
        }
    }
    undo_logs.reverse();

    write!(trace, "[ANALYSIS] Analysis success. Winner:")?;
    for id in &winners {
        write!(trace, " {id}")?;
    }
    write!(trace, ", Loser:")?;
    for id in &losers {
        write!(trace, " {id}")?;
    }
    writeln!(trace)?;

    // --- Redo ---------------------------------------------------------
    writeln!(trace, "[REDO] Redo pass start")?;
    let mut applied = 0usize;
    for record in &redo_logs {
        if let RecoveryMode::RedoCrash { after } = mode {
            if applied >= after {
                break;
            }
        }
        applied += 1;

        match record.rtype {
            LogRecordType::Begin => {
                writeln!(trace, "LSN {} [BEGIN] Transaction id {}", record.lsn, record.trx_id)?;
            }
            LogRecordType::Commit => {
                writeln!(trace, "LSN {} [COMMIT] Transaction id {}", record.lsn, record.trx_id)?;
            }
            LogRecordType::Rollback => {
                writeln!(trace, "LSN {} [ROLLBACK] Transaction id {}", record.lsn, record.trx_id)?;
            }
            LogRecordType::Update | LogRecordType::Compensate => {
                if redo_one(pool, record)? {
                    if record.rtype == LogRecordType::Update {
                        writeln!(trace, "LSN {} [UPDATE] Transaction id {} redo apply", record.lsn, record.trx_id)?;
                    } else if let LogRecordBody::Compensate { next_undo_lsn, .. } = &record.body {
                        writeln!(trace, "LSN {} [CLR] next undo lsn {}", record.lsn, next_undo_lsn)?;
                    }
                } else {
                    writeln!(trace, "LSN {} [CONSIDER-REDO] Transaction id {}", record.lsn, record.trx_id)?;
                }
            }
        }
    }
    if let RecoveryMode::RedoCrash { .. } = mode {
        return Ok(());
    }
    writeln!(trace, "[REDO] Redo pass end")?;

    // --- Undo -----------------------------------------------------------
    writeln!(trace, "[UNDO] Undo pass start")?;
    let mut undone = 0usize;
    for record in &undo_logs {
        if let RecoveryMode::UndoCrash { after } = mode {
            if undone >= after {
                break;
            }
        }
        undone += 1;

        match record.rtype {
            LogRecordType::Begin => {
                let prev_lsn = txn_mgr.last_lsn(record.trx_id).unwrap_or(record.lsn);
                let lsn = wal.append_rollback_and_flush(record.trx_id, prev_lsn)?;
                txn_mgr.set_last_lsn(record.trx_id, lsn).ok();
                txn_mgr.end(record.trx_id).ok();
            }
            LogRecordType::Update => {
                undo_one(pool, wal, txn_mgr, record)?;
                writeln!(trace, "LSN {} [UPDATE] Transaction id {} undo apply", record.lsn, record.trx_id)?;
            }
            _ => {}
        }
    }
    if let RecoveryMode::UndoCrash { .. } = mode {
        return Ok(());
    }
    writeln!(trace, "[UNDO] Undo pass end")?;

    wal.flush()?;
    pool.flush_all(None)?;
    Ok(())
}

/// Apply an UPDATE/COMPENSATE record's new image to its target page if the
/// page's current LSN predates the record (WAL redo gate). Returns whether
/// the page was mutated. An unreadable target page is a recovery-time
/// inconsistency (§7) and is skipped rather than failing the pass.
fn redo_one(pool: &Arc<BufferPool>, record: &LogRecord) -> Result<bool> {
    let (table_id, page_num, new_image) = match &record.body {
        LogRecordBody::Update(delta) => (delta.table_id, delta.page_num, &delta.new_image),
        LogRecordBody::Compensate { delta, .. } => (delta.table_id, delta.page_num, &delta.new_image),
        LogRecordBody::None => unreachable!("redo_one only called for UPDATE/COMPENSATE"),
    };

    let mut guard = match pool.read_page_mut(table_id, page_num) {
        Ok(g) => g,
        Err(_) => return Ok(false),
    };
    if record.lsn <= guard.page_lsn() {
        guard.mark_dirty(false);
        return Ok(false);
    }
    *guard = TreePage::from_bytes(new_image)?;
    guard.set_page_lsn(record.lsn);
    Ok(true)
}

/// Physically reverse one UPDATE record: restore its old image, emit the
/// compensating CLR, and stamp the page with the CLR's LSN. Shared with
/// live transaction abort (`Engine::abort_transaction`), which walks the
/// same chain outside of recovery.
pub(crate) fn undo_one(
    pool: &Arc<BufferPool>,
    wal: &LogManager,
    txn_mgr: &TransactionManager,
    record: &LogRecord,
) -> Result<()> {
    let delta = match &record.body {
        LogRecordBody::Update(delta) => delta.clone(),
        _ => unreachable!("undo_one only called for UPDATE"),
    };

    let mut guard = pool.read_page_mut(delta.table_id, delta.page_num)?;
    *guard = TreePage::from_bytes(&delta.old_image)?;

    // A CLR is "same as UPDATE with new_image = previous old_image, old_image
    // = previous new_image" - it pins down the pre-update value so that
    // redoing this CLR after a later crash reapplies the undo, not the
    // original update.
    let clr_delta = ImageDelta {
        table_id: delta.table_id,
        page_num: delta.page_num,
        offset: delta.offset,
        old_image: delta.new_image.clone(),
        new_image: delta.old_image.clone(),
    };

    let prev_lsn = txn_mgr.last_lsn(record.trx_id).unwrap_or(record.lsn);
    let clr_lsn = wal.append_compensate(record.trx_id, prev_lsn, clr_delta, record.prev_lsn);
    guard.set_page_lsn(clr_lsn);
    txn_mgr.set_last_lsn(record.trx_id, clr_lsn).ok();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{DiskManager, DiskManagerImpl};
    use crate::txn::lock::LockManager;
    use crate::types::PageId;
    use std::sync::Arc;
    use tempfile::tempdir;

    /// Commit a transaction that updated one key, then rerun recovery and
    /// confirm the committed value survives (durability, spec property 1).
    #[test]
    fn committed_update_survives_recovery() {
        let dir = tempdir().unwrap();
        let table_path = dir.path().join("t.db");
        let wal_path = dir.path().join("wal.log");
        let msg_path = dir.path().join("msg.txt");

        let disk: Arc<dyn DiskManager> = Arc::new(DiskManagerImpl::open(&table_path, true).unwrap());
        let pool = BufferPool::new(8);
        pool.register_table(1, disk.clone());

        let tree = crate::btree::BTree::new(pool.clone(), disk.clone(), 1);
        tree.insert(1, vec![b'a'; 60]).unwrap();

        let wal = LogManager::open(&wal_path).unwrap();
        let lock_mgr = Arc::new(LockManager::new());
        let txn_mgr = TransactionManager::new(lock_mgr);

        let trx = txn_mgr.begin();
        let begin_lsn = wal.append_begin(trx);
        txn_mgr.set_last_lsn(trx, begin_lsn).unwrap();

        let (_, update_lsn) = tree.update(1, vec![b'b'; 60], trx, &wal, begin_lsn).unwrap();
        txn_mgr.set_last_lsn(trx, update_lsn).unwrap();

        let last = txn_mgr.last_lsn(trx).unwrap();
        wal.append_commit_and_flush(trx, last).unwrap();
        txn_mgr.end(trx).unwrap();

        // Simulate a crash: drop the pool without flushing dirty frames,
        // then open a fresh pool over the same files and recover.
        drop(pool);

        let disk2: Arc<dyn DiskManager> = Arc::new(DiskManagerImpl::open(&table_path, true).unwrap());
        let pool2 = BufferPool::new(8);
        pool2.register_table(1, disk2.clone());
        let lock_mgr2 = Arc::new(LockManager::new());
        let txn_mgr2 = TransactionManager::new(lock_mgr2);

        recover(&wal, &pool2, &txn_mgr2, RecoveryMode::Normal, &msg_path).unwrap();

        let tree2 = crate::btree::BTree::new(pool2, disk2, 1);
        assert_eq!(tree2.find(1).unwrap(), Some(vec![b'b'; 60]));

        let trace = std::fs::read_to_string(&msg_path).unwrap();
        assert!(trace.contains("[ANALYSIS] Analysis pass start"));
        assert!(trace.contains("[REDO] Redo pass start"));
        assert!(trace.contains("[UNDO] Undo pass start"));
    }

    /// A transaction with no COMMIT/ROLLBACK record is a loser: undo must
    /// restore the pre-update value (atomicity of aborted/crashed effects).
    #[test]
    fn uncommitted_update_is_undone() {
        let dir = tempdir().unwrap();
        let table_path = dir.path().join("t.db");
        let wal_path = dir.path().join("wal.log");
        let msg_path = dir.path().join("msg.txt");

        let disk: Arc<dyn DiskManager> = Arc::new(DiskManagerImpl::open(&table_path, true).unwrap());
        let pool = BufferPool::new(8);
        pool.register_table(1, disk.clone());
        let tree = crate::btree::BTree::new(pool.clone(), disk.clone(), 1);
        tree.insert(1, vec![b'a'; 60]).unwrap();

        let wal = LogManager::open(&wal_path).unwrap();
        let lock_mgr = Arc::new(LockManager::new());
        let txn_mgr = TransactionManager::new(lock_mgr);

        let trx = txn_mgr.begin();
        let begin_lsn = wal.append_begin(trx);
        txn_mgr.set_last_lsn(trx, begin_lsn).unwrap();
        let (_, update_lsn) = tree.update(1, vec![b'z'; 60], trx, &wal, begin_lsn).unwrap();
        txn_mgr.set_last_lsn(trx, update_lsn).unwrap();
        wal.flush().unwrap();
        // No commit: simulate a crash with the transaction still in flight.
        drop(pool);

        let disk2: Arc<dyn DiskManager> = Arc::new(DiskManagerImpl::open(&table_path, true).unwrap());
        let pool2 = BufferPool::new(8);
        pool2.register_table(1, disk2.clone());
        let lock_mgr2 = Arc::new(LockManager::new());
        let txn_mgr2 = TransactionManager::new(lock_mgr2);

        recover(&wal, &pool2, &txn_mgr2, RecoveryMode::Normal, &msg_path).unwrap();

        let tree2 = crate::btree::BTree::new(pool2, disk2, 1);
        assert_eq!(tree2.find(1).unwrap(), Some(vec![b'a'; 60]));
        assert!(!txn_mgr2.is_active(trx));
    }

    /// A second recovery run over the now-clean log/pages is a no-op: the
    /// trace still parses and the data is unchanged (idempotent recovery,
    /// spec property 9).
    #[test]
    fn recovery_is_idempotent() {
        let dir = tempdir().unwrap();
        let table_path = dir.path().join("t.db");
        let wal_path = dir.path().join("wal.log");
        let msg_path = dir.path().join("msg.txt");

        let disk: Arc<dyn DiskManager> = Arc::new(DiskManagerImpl::open(&table_path, true).unwrap());
        let pool = BufferPool::new(8);
        pool.register_table(1, disk.clone());
        let tree = crate::btree::BTree::new(pool.clone(), disk.clone(), 1);
        tree.insert(1, vec![b'a'; 60]).unwrap();
        drop(pool);

        let wal = LogManager::open(&wal_path).unwrap();
        let lock_mgr = Arc::new(LockManager::new());
        let txn_mgr = TransactionManager::new(lock_mgr);
        let disk2: Arc<dyn DiskManager> = Arc::new(DiskManagerImpl::open(&table_path, true).unwrap());
        let pool2 = BufferPool::new(8);
        pool2.register_table(1, disk2.clone());
        recover(&wal, &pool2, &txn_mgr, RecoveryMode::Normal, &msg_path).unwrap();

        let lock_mgr2 = Arc::new(LockManager::new());
        let txn_mgr2 = TransactionManager::new(lock_mgr2);
        recover(&wal, &pool2, &txn_mgr2, RecoveryMode::Normal, &msg_path).unwrap();

        let tree2 = crate::btree::BTree::new(pool2, disk2, 1);
        assert_eq!(tree2.find(1).unwrap(), Some(vec![b'a'; 60]));
        let _ = PageId::NONE;
    }
}
