//! Record-level lock manager: per-record FIFO wait queues, strict two-phase
//! locking, and cycle-based deadlock detection.
//!
//! Grounded in the course project's `lock_table`/`trx` modules: each record
//! (identified by `(table, page, key)`) owns a queue of lock requests in
//! arrival order. A request is grantable once no earlier, still-held request
//! in its queue conflicts with it. A transaction that would have to wait
//! checks whether doing so closes a cycle in the wait-for graph; if so, it
//! aborts itself immediately rather than actually blocking, which is the
//! simplest correct deadlock policy and the one the original lock table uses.

use crate::error::{EngineError, Result};
use crate::types::{PageId, RecordKey, TableId, TrxId};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Identifies the record a lock request is made against.
pub type RecordId = (TableId, PageId, RecordKey);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

fn modes_conflict(a: LockMode, b: LockMode) -> bool {
    !(a == LockMode::Shared && b == LockMode::Shared)
}

/// One transaction's request for a record, queued in arrival order.
pub struct LockRequest {
    pub trx_id: TrxId,
    pub mode: LockMode,
    granted: Mutex<bool>,
    cv: Condvar,
}

impl LockRequest {
    fn new(trx_id: TrxId, mode: LockMode) -> Self {
        Self {
            trx_id,
            mode,
            granted: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn is_granted(&self) -> bool {
        *self.granted.lock()
    }

    fn set_granted(&self) {
        *self.granted.lock() = true;
        self.cv.notify_all();
    }

    /// Block the calling thread until the lock manager grants this request.
    fn wait_until_granted(&self) {
        let mut granted = self.granted.lock();
        while !*granted {
            self.cv.wait(&mut granted);
        }
    }

    fn covers(&self, requested: LockMode) -> bool {
        matches!((self.mode, requested), (LockMode::Exclusive, _) | (LockMode::Shared, LockMode::Shared))
    }
}

struct LockTable {
    queues: HashMap<RecordId, Vec<Arc<LockRequest>>>,
    /// `waits_for[t]` is the set of transactions `t` is currently blocked
    /// behind. Only populated while a transaction is actually waiting.
    waits_for: HashMap<TrxId, HashSet<TrxId>>,
}

/// Global lock table shared by every open table.
pub struct LockManager {
    inner: Mutex<LockTable>,
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LockTable {
                queues: HashMap::new(),
                waits_for: HashMap::new(),
            }),
        }
    }

    /// Acquire a lock on `record` for `trx_id`, blocking until it is granted.
    /// Returns `EngineError::DeadlockAborted` instead of blocking if granting
    /// the request would close a cycle in the wait-for graph.
    pub fn acquire(&self, record: RecordId, trx_id: TrxId, mode: LockMode) -> Result<Arc<LockRequest>> {
        let req;
        {
            let mut table = self.inner.lock();
            let queue = table.queues.entry(record).or_default();

            if let Some(existing) = queue.iter().find(|r| r.trx_id == trx_id) {
                if existing.covers(mode) {
                    return Ok(existing.clone());
                }
            }

            req = Arc::new(LockRequest::new(trx_id, mode));
            let blockers: HashSet<TrxId> = queue
                .iter()
                .filter(|r| r.trx_id != trx_id && modes_conflict(r.mode, mode))
                .map(|r| r.trx_id)
                .collect();
            queue.push(req.clone());

            if blockers.is_empty() {
                req.set_granted();
                return Ok(req);
            }

            table.waits_for.insert(trx_id, blockers);
            if has_cycle(&table.waits_for, trx_id) {
                table.waits_for.remove(&trx_id);
                if let Some(queue) = table.queues.get_mut(&record) {
                    queue.retain(|r| !Arc::ptr_eq(r, &req));
                }
                return Err(EngineError::DeadlockAborted(trx_id));
            }
        }

        req.wait_until_granted();
        {
            let mut table = self.inner.lock();
            table.waits_for.remove(&trx_id);
        }
        Ok(req)
    }

    /// Release a previously granted lock, waking every subsequent waiter
    /// that is now grantable: a waiter is grantable once none of the
    /// requests still ahead of it in the queue - granted or not - conflicts
    /// with its mode. Scanning stops at the first waiter that still
    /// conflicts, since every request behind it is blocked transitively, and
    /// stops just after granting an exclusive request, since nothing behind
    /// an exclusive holder can be compatible with it.
    pub fn release(&self, record: RecordId, req: &Arc<LockRequest>) {
        let mut table = self.inner.lock();
        table.waits_for.remove(&req.trx_id);
        if let Some(queue) = table.queues.get_mut(&record) {
            if let Some(pos) = queue.iter().position(|r| Arc::ptr_eq(r, req)) {
                queue.remove(pos);
            }
            for i in 0..queue.len() {
                if queue[i].is_granted() {
                    continue;
                }
                let blocked = queue[..i]
                    .iter()
                    .any(|p| p.trx_id != queue[i].trx_id && modes_conflict(p.mode, queue[i].mode));
                if blocked {
                    break;
                }
                queue[i].set_granted();
                if queue[i].mode == LockMode::Exclusive {
                    break;
                }
            }
            if queue.is_empty() {
                table.queues.remove(&record);
            }
        }
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether granting `start`'s outstanding wait would close a cycle, i.e.
/// whether `start` is reachable from itself by following wait-for edges.
fn has_cycle(waits_for: &HashMap<TrxId, HashSet<TrxId>>, start: TrxId) -> bool {
    let mut visited = HashSet::new();
    let mut stack: Vec<TrxId> = waits_for.get(&start).into_iter().flatten().copied().collect();
    while let Some(cur) = stack.pop() {
        if cur == start {
            return true;
        }
        if !visited.insert(cur) {
            continue;
        }
        if let Some(next) = waits_for.get(&cur) {
            stack.extend(next.iter().copied());
        }
    }
    false
}
