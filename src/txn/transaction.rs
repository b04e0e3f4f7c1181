//! Transaction table: lifecycle and the set of locks each live transaction
//! currently owns, mirroring the course project's `trx_t` / transaction
//! table but keeping the owned-lock list in safe, owned `Vec`s rather than
//! an intrusive linked list.

use crate::error::{EngineError, Result};
use crate::txn::lock::{LockManager, LockRequest, RecordId};
use crate::types::{Lsn, TrxId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

struct TrxState {
    last_lsn: Lsn,
    locks: Vec<(RecordId, Arc<LockRequest>)>,
}

/// Tracks every in-flight transaction and the locks it has acquired.
pub struct TransactionManager {
    lock_manager: Arc<LockManager>,
    next_id: Mutex<TrxId>,
    active: Mutex<HashMap<TrxId, TrxState>>,
}

impl TransactionManager {
    pub fn new(lock_manager: Arc<LockManager>) -> Self {
        Self {
            lock_manager,
            next_id: Mutex::new(1),
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    pub fn begin(&self) -> TrxId {
        let mut next = self.next_id.lock();
        let id = *next;
        *next += 1;
        self.active.lock().insert(id, TrxState { last_lsn: -1, locks: Vec::new() });
        id
    }

    pub fn is_active(&self, trx_id: TrxId) -> bool {
        self.active.lock().contains_key(&trx_id)
    }

    /// Every transaction currently live, for shutdown to abort en masse.
    pub fn active_ids(&self) -> Vec<TrxId> {
        self.active.lock().keys().copied().collect()
    }

    pub fn record_lock(&self, trx_id: TrxId, record: RecordId, req: Arc<LockRequest>) -> Result<()> {
        let mut active = self.active.lock();
        let state = active.get_mut(&trx_id).ok_or(EngineError::UnknownTransaction(trx_id))?;
        state.locks.push((record, req));
        Ok(())
    }

    pub fn set_last_lsn(&self, trx_id: TrxId, lsn: Lsn) -> Result<()> {
        let mut active = self.active.lock();
        let state = active.get_mut(&trx_id).ok_or(EngineError::UnknownTransaction(trx_id))?;
        state.last_lsn = lsn;
        Ok(())
    }

    pub fn last_lsn(&self, trx_id: TrxId) -> Result<Lsn> {
        let active = self.active.lock();
        let state = active.get(&trx_id).ok_or(EngineError::UnknownTransaction(trx_id))?;
        Ok(state.last_lsn)
    }

    /// End a transaction (commit or abort) and release every lock it held.
    /// Returns the transaction's final `last_lsn`, needed by abort to walk
    /// the undo chain before this call.
    pub fn end(&self, trx_id: TrxId) -> Result<Lsn> {
        let state = self
            .active
            .lock()
            .remove(&trx_id)
            .ok_or(EngineError::UnknownTransaction(trx_id))?;
        for (record, req) in &state.locks {
            self.lock_manager.release(*record, req);
        }
        Ok(state.last_lsn)
    }

    /// Forcibly resurrect a transaction found in the loser set during
    /// recovery, so its undo can acquire the same bookkeeping path as a
    /// live abort.
    pub fn resurrect(&self, trx_id: TrxId, last_lsn: Lsn) {
        self.active.lock().insert(trx_id, TrxState { last_lsn, locks: Vec::new() });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PageId;

    #[test]
    fn begin_assigns_increasing_ids() {
        let mgr = TransactionManager::new(Arc::new(LockManager::new()));
        let a = mgr.begin();
        let b = mgr.begin();
        assert!(b > a);
        assert!(mgr.is_active(a));
    }

    #[test]
    fn end_releases_locks_and_forgets_transaction() {
        let lock_manager = Arc::new(LockManager::new());
        let mgr = TransactionManager::new(lock_manager.clone());
        let trx = mgr.begin();
        let record = (1, PageId::new(1), 7);
        let req = lock_manager
            .acquire(record, trx, crate::txn::lock::LockMode::Exclusive)
            .unwrap();
        mgr.record_lock(trx, record, req).unwrap();
        mgr.set_last_lsn(trx, 128).unwrap();

        let last_lsn = mgr.end(trx).unwrap();
        assert_eq!(last_lsn, 128);
        assert!(!mgr.is_active(trx));
    }
}
