//! Buffer manager: fixed-capacity frame pool shared by every open table.
//!
//! Frames are addressed by `(table_id, page_id)`. A single *pool latch*
//! guards the page map and the LRU chain; each frame additionally carries
//! its own *page latch* (an `Arc`-based `RwLock`, so a `PageGuard` can be
//! returned to the caller without borrowing the pool) which is held for the
//! duration of a borrow. Frames never leave the pool once allocated -
//! eviction repurposes a control block in place, so a page latch is never
//! held on a block that has already left the pool (see DESIGN.md).
//!
//! Every write-back of a dirty frame - on eviction or on `flush_all` - first
//! flushes the WAL, so the log record that produced the page's current
//! bytes is durable before the bytes themselves reach disk (the WAL
//! property, spec.md §4.5/§5).

use crate::buffer::lru::LruChain;
use crate::error::{EngineError, Result};
use crate::page::TreePage;
use crate::storage::DiskManager;
use crate::types::{PageId, TableId};
use crate::wal::LogManager;
use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, Mutex, RawRwLock, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

struct Frame {
    /// `None` when the control block has never held a page, or has been
    /// freed and not yet repurposed.
    key: RwLock<Option<(TableId, PageId)>>,
    pin_count: AtomicU32,
    dirty: AtomicBool,
    data: Arc<RwLock<TreePage>>,
}

impl Frame {
    fn empty() -> Self {
        Self {
            key: RwLock::new(None),
            pin_count: AtomicU32::new(0),
            dirty: AtomicBool::new(false),
            data: Arc::new(RwLock::new(TreePage::Leaf(crate::page::LeafPage::new()))),
        }
    }
}

struct PoolState {
    map: HashMap<(TableId, PageId), usize>,
    lru: LruChain,
    len: usize,
}

/// Shared frame pool for every table an `Engine` has open.
pub struct BufferPool {
    capacity: usize,
    frames: Vec<Frame>,
    state: Mutex<PoolState>,
    tables: RwLock<HashMap<TableId, Arc<dyn DiskManager>>>,
    /// Bound by `attach_wal` once the engine's log is open. `None` only in
    /// tests that exercise the pool in isolation from a WAL.
    wal: RwLock<Option<Arc<LogManager>>>,
}

/// Read-only borrow of a page; the page latch is held until dropped.
pub struct PageGuard {
    pool: Arc<BufferPool>,
    frame_idx: usize,
    guard: ArcRwLockReadGuard<RawRwLock, TreePage>,
}

impl std::ops::Deref for PageGuard {
    type Target = TreePage;
    fn deref(&self) -> &TreePage {
        &self.guard
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        self.pool.unpin(self.frame_idx, false);
    }
}

/// Mutable borrow of a page; the page latch is held until dropped. Dropping
/// (or explicit `mark_dirty(false)`) merges the caller's dirty bit into the
/// frame's - pages are written back only on eviction, shutdown, or recovery.
pub struct PageGuardMut {
    pool: Arc<BufferPool>,
    frame_idx: usize,
    guard: ArcRwLockWriteGuard<RawRwLock, TreePage>,
    dirty: bool,
}

impl PageGuardMut {
    /// Override whether this borrow counts as a write; defaults to `true`.
    pub fn mark_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }
}

impl std::ops::Deref for PageGuardMut {
    type Target = TreePage;
    fn deref(&self) -> &TreePage {
        &self.guard
    }
}

impl std::ops::DerefMut for PageGuardMut {
    fn deref_mut(&mut self) -> &mut TreePage {
        &mut self.guard
    }
}

impl Drop for PageGuardMut {
    fn drop(&mut self) {
        self.pool.unpin(self.frame_idx, self.dirty);
    }
}

impl BufferPool {
    pub fn new(num_frames: usize) -> Arc<Self> {
        let mut frames = Vec::with_capacity(num_frames);
        for _ in 0..num_frames {
            frames.push(Frame::empty());
        }
        Arc::new(Self {
            capacity: num_frames,
            frames,
            state: Mutex::new(PoolState {
                map: HashMap::new(),
                lru: LruChain::new(num_frames),
                len: 0,
            }),
            tables: RwLock::new(HashMap::new()),
            wal: RwLock::new(None),
        })
    }

    /// Bind the write-ahead log so eviction and `flush_all` can enforce
    /// WAL-before-page: a dirty victim's bytes are never written back before
    /// the log record that produced them is durable.
    pub fn attach_wal(&self, wal: Arc<LogManager>) {
        *self.wal.write() = Some(wal);
    }

    pub fn register_table(&self, table_id: TableId, disk: Arc<dyn DiskManager>) {
        self.tables.write().insert(table_id, disk);
    }

    pub fn unregister_table(&self, table_id: TableId) {
        self.tables.write().remove(&table_id);
        let mut state = self.state.lock();
        let stale: Vec<(TableId, PageId)> = state
            .map
            .keys()
            .filter(|(t, _)| *t == table_id)
            .copied()
            .collect();
        for key in stale {
            if let Some(idx) = state.map.remove(&key) {
                state.lru.remove(idx);
                state.len -= 1;
                *self.frames[idx].key.write() = None;
            }
        }
    }

    fn disk_for(&self, table_id: TableId) -> Result<Arc<dyn DiskManager>> {
        self.tables
            .read()
            .get(&table_id)
            .cloned()
            .ok_or(EngineError::UnknownTable(table_id))
    }

    /// Find a victim frame to repurpose, writing back a dirty victim first.
    /// Called with `state` already locked. Returns the frame index, with the
    /// old `(table_id, page_id)` mapping (if any) already removed from the
    /// map and LRU chain.
    fn find_victim(&self, state: &mut PoolState) -> Result<usize> {
        if state.len < self.capacity {
            let idx = state.len;
            state.len += 1;
            state.lru.push_new(idx);
            return Ok(idx);
        }

        for idx in state.lru.iter_from_tail().collect::<Vec<_>>() {
            if let Some(data_guard) = self.frames[idx].data.try_write_arc() {
                drop(data_guard);
                let old_key = *self.frames[idx].key.read();
                if let Some(old_key) = old_key {
                    if self.frames[idx].dirty.load(Ordering::Acquire) {
                        if let Some(wal) = self.wal.read().clone() {
                            wal.flush()?;
                        }
                        let bytes = self.frames[idx].data.read().to_bytes();
                        let disk = self.disk_for(old_key.0)?;
                        disk.write_page(old_key.1, &bytes)?;
                        self.frames[idx].dirty.store(false, Ordering::Release);
                    }
                    state.map.remove(&old_key);
                }
                state.lru.touch(idx);
                return Ok(idx);
            }
        }
        Err(EngineError::BufferPoolExhausted)
    }

    /// Resolve `(table_id, page_id)` to a pinned frame index, loading it
    /// from disk (evicting a victim if necessary) if not already resident.
    /// The pool latch is held for the whole operation, per the read-page
    /// contract of the component spec; only the frame's own page latch is
    /// taken afterward, by the caller.
    fn locate_and_pin(&self, table_id: TableId, page_id: PageId) -> Result<usize> {
        let mut state = self.state.lock();
        if let Some(&idx) = state.map.get(&(table_id, page_id)) {
            state.lru.touch(idx);
            self.frames[idx].pin_count.fetch_add(1, Ordering::AcqRel);
            return Ok(idx);
        }

        let disk = self.disk_for(table_id)?;
        let bytes = disk.read_page(page_id)?;
        let page = TreePage::from_bytes(&bytes)?;

        let idx = self.find_victim(&mut state)?;
        *self.frames[idx].key.write() = Some((table_id, page_id));
        self.frames[idx].dirty.store(false, Ordering::Release);
        self.frames[idx].pin_count.store(1, Ordering::Release);
        *self.frames[idx].data.write() = page;
        state.map.insert((table_id, page_id), idx);
        state.lru.touch(idx);
        Ok(idx)
    }

    /// Load `(table_id, page_id)` into a frame and return a read-locked
    /// handle.
    pub fn read_page(self: &Arc<Self>, table_id: TableId, page_id: PageId) -> Result<PageGuard> {
        let idx = self.locate_and_pin(table_id, page_id)?;
        let guard = self.frames[idx].data.read_arc();
        Ok(PageGuard {
            pool: self.clone(),
            frame_idx: idx,
            guard,
        })
    }

    /// Load `(table_id, page_id)` into a frame and return a write-locked
    /// handle.
    pub fn read_page_mut(self: &Arc<Self>, table_id: TableId, page_id: PageId) -> Result<PageGuardMut> {
        let idx = self.locate_and_pin(table_id, page_id)?;
        let guard = self.frames[idx].data.write_arc();
        Ok(PageGuardMut {
            pool: self.clone(),
            frame_idx: idx,
            guard,
            dirty: true,
        })
    }

    /// Allocate a brand new page for `table_id`, install `initial` as its
    /// content, and return a dirty write handle.
    pub fn alloc_page(self: &Arc<Self>, table_id: TableId, initial: TreePage) -> Result<(PageId, PageGuardMut)> {
        let disk = self.disk_for(table_id)?;
        let page_id = disk.allocate_page()?;

        let mut state = self.state.lock();
        let idx = self.find_victim(&mut state)?;
        *self.frames[idx].key.write() = Some((table_id, page_id));
        self.frames[idx].dirty.store(true, Ordering::Release);
        self.frames[idx].pin_count.store(1, Ordering::Release);
        *self.frames[idx].data.write() = initial;
        state.map.insert((table_id, page_id), idx);
        state.lru.touch(idx);
        drop(state);

        let write_guard = self.frames[idx].data.write_arc();
        Ok((
            page_id,
            PageGuardMut {
                pool: self.clone(),
                frame_idx: idx,
                guard: write_guard,
                dirty: true,
            },
        ))
    }

    /// Free a page: delegate to the file layer's free list and, if the page
    /// is resident, drop its control block to the tail so it is the next
    /// victim.
    pub fn free_page(&self, table_id: TableId, page_id: PageId) -> Result<()> {
        let disk = self.disk_for(table_id)?;
        {
            let mut state = self.state.lock();
            if let Some(idx) = state.map.remove(&(table_id, page_id)) {
                state.lru.remove(idx);
                state.len -= 1;
                *self.frames[idx].key.write() = None;
                self.frames[idx].dirty.store(false, Ordering::Release);
            }
        }
        disk.free_page(page_id)
    }

    fn unpin(&self, frame_idx: usize, dirty: bool) {
        if dirty {
            self.frames[frame_idx].dirty.store(true, Ordering::Release);
        }
        self.frames[frame_idx].pin_count.fetch_sub(1, Ordering::AcqRel);
        let mut state = self.state.lock();
        if let Some((t, p)) = *self.frames[frame_idx].key.read() {
            if state.map.get(&(t, p)) == Some(&frame_idx) {
                state.lru.touch(frame_idx);
            }
        }
    }

    /// Stamp a resident page's LSN directly, bypassing the normal
    /// read-modify-write dance (used by recovery's redo/undo passes, which
    /// operate outside the index layer).
    pub fn set_page_lsn(self: &Arc<Self>, table_id: TableId, page_id: PageId, lsn: i64) -> Result<()> {
        let mut guard = self.read_page_mut(table_id, page_id)?;
        guard.set_page_lsn(lsn);
        Ok(())
    }

    /// Flush every dirty frame currently belonging to `table_id` (or all
    /// tables if `table_id` is `None`) to disk.
    pub fn flush_all(&self, table_id: Option<TableId>) -> Result<()> {
        if let Some(wal) = self.wal.read().clone() {
            wal.flush()?;
        }
        let state = self.state.lock();
        for (&(t, p), &idx) in state.map.iter() {
            if let Some(only) = table_id {
                if t != only {
                    continue;
                }
            }
            if self.frames[idx].dirty.load(Ordering::Acquire) {
                let bytes = self.frames[idx].data.read().to_bytes();
                let disk = self.disk_for(t)?;
                disk.write_page(p, &bytes)?;
                self.frames[idx].dirty.store(false, Ordering::Release);
            }
        }
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::LeafPage;
    use crate::storage::DiskManagerImpl;
    use tempfile::tempdir;

    fn setup(capacity: usize) -> (Arc<BufferPool>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.db");
        let disk: Arc<dyn DiskManager> = Arc::new(DiskManagerImpl::open(&path, false).unwrap());
        let pool = BufferPool::new(capacity);
        pool.register_table(1, disk);
        (pool, dir)
    }

    #[test]
    fn alloc_and_read_roundtrip() {
        let (pool, _dir) = setup(4);
        let (page_id, mut guard) = pool.alloc_page(1, TreePage::Leaf(LeafPage::new())).unwrap();
        guard.as_leaf_mut().unwrap().insert(1, vec![7u8; 50]);
        drop(guard);

        let guard = pool.read_page(1, page_id).unwrap();
        assert_eq!(guard.as_leaf().unwrap().get(1), Some(vec![7u8; 50].as_slice()));
    }

    #[test]
    fn eviction_writes_back_dirty_pages() {
        let (pool, _dir) = setup(2);
        let (p1, mut g1) = pool.alloc_page(1, TreePage::Leaf(LeafPage::new())).unwrap();
        g1.as_leaf_mut().unwrap().insert(10, vec![1u8; 50]);
        drop(g1);
        let (p2, mut g2) = pool.alloc_page(1, TreePage::Leaf(LeafPage::new())).unwrap();
        g2.as_leaf_mut().unwrap().insert(20, vec![2u8; 50]);
        drop(g2);
        // Third page forces eviction of p1 (LRU).
        let (_p3, g3) = pool.alloc_page(1, TreePage::Leaf(LeafPage::new())).unwrap();
        drop(g3);

        let guard = pool.read_page(1, p1).unwrap();
        assert_eq!(guard.as_leaf().unwrap().get(10), Some(vec![1u8; 50].as_slice()));
        let guard = pool.read_page(1, p2).unwrap();
        assert_eq!(guard.as_leaf().unwrap().get(20), Some(vec![2u8; 50].as_slice()));
    }
}
