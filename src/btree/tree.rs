//! B+-tree index operations: find, insert, delete, scan.
//!
//! Each operation crabs down from the root through the buffer pool, touching
//! one page latch at a time. Structural changes (splits, merges) are *not*
//! logged or locked - only `update`'s in-place value replacement goes through
//! the WAL and lock manager (see `Engine::update`), matching the scope the
//! course project this engine is modeled on gives its own `db_update`.

use crate::buffer::BufferPool;
use crate::error::{EngineError, Result};
use crate::page::internal::InternalPage;
use crate::page::leaf::{LeafPage, LeafSlot, SLOT_SIZE};
use crate::page::{InternalEntry, TreePage};
use crate::storage::DiskManager;
use crate::types::{cut, Lsn, PageId, RecordKey, TableId, TrxId, DEFAULT_ORDER, MIDDLE_OF_PAGE, THRESHOLD};
use crate::wal::manager::LogManager;
use std::sync::Arc;

/// A single table's B+-tree, addressed through the shared buffer pool.
pub struct BTree {
    pool: Arc<BufferPool>,
    disk: Arc<dyn DiskManager>,
    table_id: TableId,
}

impl BTree {
    pub fn new(pool: Arc<BufferPool>, disk: Arc<dyn DiskManager>, table_id: TableId) -> Self {
        Self { pool, disk, table_id }
    }

    fn root(&self) -> PageId {
        self.disk.header().root_page
    }

    fn set_root(&self, page_id: PageId) -> Result<()> {
        self.disk.set_root_page(page_id)
    }

    fn set_parent(&self, page_id: PageId, parent: PageId) -> Result<()> {
        if !page_id.is_some() {
            return Ok(());
        }
        let mut guard = self.pool.read_page_mut(self.table_id, page_id)?;
        guard.set_parent(parent);
        Ok(())
    }

    /// Descend from the root to the leaf that would contain `key`.
    pub fn find_leaf_page(&self, key: RecordKey) -> Result<PageId> {
        let mut cur = self.root();
        if !cur.is_some() {
            return Err(EngineError::KeyNotFound(key));
        }
        loop {
            let guard = self.pool.read_page(self.table_id, cur)?;
            match &*guard {
                TreePage::Leaf(_) => return Ok(cur),
                TreePage::Internal(internal) => {
                    let next = internal.child_for(key);
                    drop(guard);
                    cur = next;
                }
            }
        }
    }

    pub fn find(&self, key: RecordKey) -> Result<Option<Vec<u8>>> {
        let leaf_id = match self.find_leaf_page(key) {
            Ok(id) => id,
            Err(EngineError::KeyNotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let guard = self.pool.read_page(self.table_id, leaf_id)?;
        Ok(guard.as_leaf()?.get(key).map(|v| v.to_vec()))
    }

    /// Replace an existing key's value in place and WAL-log the change as a
    /// physical whole-page before/after image (see DESIGN.md for why a
    /// whole page rather than the byte range the course project logs).
    /// Returns the old value's size and the LSN the page was stamped with.
    ///
    /// Unlike `insert`/`delete`, this is the one B+-tree operation the
    /// component spec requires to go through the WAL - structural changes
    /// (splits, merges) are not logged, matching `db_update` being the only
    /// logging call site in the course project's `db.cc`.
    pub fn update(
        &self,
        key: RecordKey,
        value: Vec<u8>,
        trx_id: TrxId,
        wal: &LogManager,
        prev_lsn: Lsn,
    ) -> Result<(usize, Lsn)> {
        LeafPage::validate_value_size(value.len())?;
        let leaf_id = self.find_leaf_page(key)?;

        let mut guard = self.pool.read_page_mut(self.table_id, leaf_id)?;
        let old_image = guard.to_bytes();
        let old_value = {
            let leaf = guard.as_leaf_mut()?;
            let old_len = leaf.get(key).ok_or(EngineError::KeyNotFound(key))?.len();
            // A replacement that grows the value can only happen in place if the
            // page's existing free space covers the difference - mirrors insert's
            // `free_space() >= needed` guard at the call site above. Without this,
            // `replace` followed by `to_bytes`'s value-region repacking would walk
            // the page's high end past its low end on a near-full leaf.
            if value.len() > old_len {
                let extra = value.len() - old_len;
                if leaf.free_space() < extra {
                    return Err(EngineError::invalid_operation(format!(
                        "update of key {key} needs {extra} more bytes than leaf page {leaf_id} has free; \
                         in-place update cannot grow a value into a split"
                    )));
                }
            }
            leaf.replace(key, value).ok_or(EngineError::KeyNotFound(key))?
        };
        let new_image = guard.to_bytes();

        let lsn = wal.append_update(
            trx_id,
            prev_lsn,
            self.table_id,
            leaf_id,
            0,
            old_image.to_vec(),
            new_image.to_vec(),
        );
        guard.set_page_lsn(lsn);
        Ok((old_value.len(), lsn))
    }

    /// Scan `[begin, end]` inclusive, following the leaf sibling chain.
    pub fn scan(&self, begin: RecordKey, end: RecordKey) -> Result<Vec<(RecordKey, Vec<u8>)>> {
        let mut out = Vec::new();
        if !self.root().is_some() {
            return Ok(out);
        }
        let mut leaf_id = match self.find_leaf_page(begin) {
            Ok(id) => id,
            Err(EngineError::KeyNotFound(_)) => return Ok(out),
            Err(e) => return Err(e),
        };
        loop {
            let guard = self.pool.read_page(self.table_id, leaf_id)?;
            let leaf = guard.as_leaf()?;
            for slot in leaf.slots() {
                if slot.key > end {
                    return Ok(out);
                }
                if slot.key >= begin {
                    out.push((slot.key, slot.value.clone()));
                }
            }
            let next = leaf.right_sibling;
            drop(guard);
            if !next.is_some() {
                return Ok(out);
            }
            leaf_id = next;
        }
    }

    pub fn insert(&self, key: RecordKey, value: Vec<u8>) -> Result<()> {
        LeafPage::validate_value_size(value.len())?;

        if !self.root().is_some() {
            let mut leaf = LeafPage::new();
            leaf.insert(key, value);
            let (page_id, guard) = self.pool.alloc_page(self.table_id, TreePage::Leaf(leaf))?;
            drop(guard);
            self.set_root(page_id)?;
            return Ok(());
        }

        let leaf_id = self.find_leaf_page(key)?;
        let needed = SLOT_SIZE + value.len();
        let (fits, parent) = {
            let mut guard = self.pool.read_page_mut(self.table_id, leaf_id)?;
            let leaf = guard.as_leaf_mut()?;
            if leaf.find(key).is_some() {
                return Err(EngineError::DuplicateKey(key));
            }
            if leaf.free_space() >= needed {
                leaf.insert(key, value.clone());
                (true, PageId::NONE)
            } else {
                (false, leaf.parent)
            }
        };
        if fits {
            return Ok(());
        }
        self.split_leaf_and_insert(leaf_id, parent, key, value)
    }

    fn split_leaf_and_insert(&self, leaf_id: PageId, parent: PageId, key: RecordKey, value: Vec<u8>) -> Result<()> {
        let right_slots;
        let right_sibling;
        {
            let mut guard = self.pool.read_page_mut(self.table_id, leaf_id)?;
            let leaf = guard.as_leaf_mut()?;
            let mut all = leaf.take_slots();
            let pos = all.partition_point(|s| s.key < key);
            all.insert(pos, LeafSlot { key, value });

            let split_at = leaf_split_point(&all);
            let right = all.split_off(split_at);
            leaf.set_slots(all);
            right_sibling = leaf.right_sibling;
            right_slots = right;
        }

        let mut right_leaf = LeafPage::new();
        right_leaf.parent = parent;
        right_leaf.right_sibling = right_sibling;
        right_leaf.set_slots(right_slots);
        let separator = right_leaf.first_key().expect("split always leaves the right half non-empty");

        let (new_right_id, guard) = self.pool.alloc_page(self.table_id, TreePage::Leaf(right_leaf))?;
        drop(guard);

        {
            let mut guard = self.pool.read_page_mut(self.table_id, leaf_id)?;
            guard.as_leaf_mut()?.right_sibling = new_right_id;
        }

        self.insert_into_parent(leaf_id, parent, separator, new_right_id)
    }

    /// Insert `(separator, right)` into `parent`, creating a new root if
    /// `parent` is `PageId::NONE`, and splitting `parent` if it overflows.
    fn insert_into_parent(&self, left_id: PageId, parent_id: PageId, separator: RecordKey, right_id: PageId) -> Result<()> {
        if !parent_id.is_some() {
            let mut root = InternalPage::new();
            root.leftmost_child = left_id;
            root.insert_at(0, separator, right_id);
            let (new_root_id, guard) = self.pool.alloc_page(self.table_id, TreePage::Internal(root))?;
            drop(guard);
            self.set_root(new_root_id)?;
            self.set_parent(left_id, new_root_id)?;
            self.set_parent(right_id, new_root_id)?;
            return Ok(());
        }

        let overflow = {
            let mut guard = self.pool.read_page_mut(self.table_id, parent_id)?;
            let internal = guard.as_internal_mut()?;
            let pos = internal.insert_position(separator);
            internal.insert_at(pos, separator, right_id);
            internal.key_count() >= DEFAULT_ORDER
        };
        self.set_parent(right_id, parent_id)?;
        if !overflow {
            return Ok(());
        }
        self.split_internal(parent_id)
    }

    fn split_internal(&self, page_id: PageId) -> Result<()> {
        let left_parent;
        let mut entries;
        {
            let mut guard = self.pool.read_page_mut(self.table_id, page_id)?;
            let internal = guard.as_internal_mut()?;
            left_parent = internal.parent;
            entries = internal.take_entries();
        }

        let split = cut(DEFAULT_ORDER);
        let right_entries: Vec<InternalEntry> = entries.split_off(split);
        let middle = entries.pop().expect("overflowed internal page has at least `split` entries");
        let right_leftmost = middle.child;

        {
            let mut guard = self.pool.read_page_mut(self.table_id, page_id)?;
            guard.as_internal_mut()?.set_entries(entries);
        }

        let mut right = InternalPage::new();
        right.parent = left_parent;
        right.leftmost_child = right_leftmost;
        right.set_entries(right_entries.clone());

        let (right_id, guard) = self.pool.alloc_page(self.table_id, TreePage::Internal(right))?;
        drop(guard);

        self.set_parent(right_leftmost, right_id)?;
        for entry in &right_entries {
            self.set_parent(entry.child, right_id)?;
        }

        self.insert_into_parent(page_id, left_parent, middle.key, right_id)
    }

    pub fn delete(&self, key: RecordKey) -> Result<()> {
        let leaf_id = self.find_leaf_page(key)?;
        {
            let mut guard = self.pool.read_page_mut(self.table_id, leaf_id)?;
            let leaf = guard.as_leaf_mut()?;
            if leaf.remove(key).is_none() {
                return Err(EngineError::KeyNotFound(key));
            }
        }
        self.after_removal(leaf_id)
    }

    /// Post-removal bookkeeping shared by the initial leaf deletion and every
    /// cascaded internal-entry removal: collapse the root if it emptied out,
    /// otherwise rebalance if the page fell under its minimum fill.
    fn after_removal(&self, page_id: PageId) -> Result<()> {
        let (is_root, parent_id, underfull) = {
            let guard = self.pool.read_page(self.table_id, page_id)?;
            match &*guard {
                TreePage::Leaf(l) => (l.parent == PageId::NONE, l.parent, l.free_space() >= THRESHOLD),
                TreePage::Internal(i) => (i.parent == PageId::NONE, i.parent, i.key_count() + 1 < cut(DEFAULT_ORDER)),
            }
        };

        if is_root {
            return self.collapse_root_if_needed(page_id);
        }
        if !underfull {
            return Ok(());
        }
        self.rebalance(page_id, parent_id)
    }

    fn collapse_root_if_needed(&self, page_id: PageId) -> Result<()> {
        enum Collapse {
            FreeLeaf,
            Keep,
            PromoteChild(PageId),
        }
        let action = {
            let guard = self.pool.read_page(self.table_id, page_id)?;
            match &*guard {
                TreePage::Leaf(l) if l.key_count() == 0 => Collapse::FreeLeaf,
                TreePage::Leaf(_) => Collapse::Keep,
                TreePage::Internal(i) if i.key_count() == 0 => Collapse::PromoteChild(i.leftmost_child),
                TreePage::Internal(_) => Collapse::Keep,
            }
        };
        match action {
            Collapse::Keep => Ok(()),
            Collapse::FreeLeaf => {
                self.set_root(PageId::NONE)?;
                self.pool.free_page(self.table_id, page_id)
            }
            Collapse::PromoteChild(only_child) => {
                self.set_root(only_child)?;
                self.set_parent(only_child, PageId::NONE)?;
                self.pool.free_page(self.table_id, page_id)
            }
        }
    }

    /// `position` of `page_id` among `parent`'s children (0 = leftmost).
    fn child_position(parent: &InternalPage, page_id: PageId) -> usize {
        match parent.index_of_child(page_id) {
            Some(usize::MAX) => 0,
            Some(i) => i + 1,
            None => unreachable!("parent must reference its own child"),
        }
    }

    fn child_at(parent: &InternalPage, position: usize) -> PageId {
        if position == 0 {
            parent.leftmost_child
        } else {
            parent.entries()[position - 1].child
        }
    }

    /// Returns `(neighbor_id, k_prime_index, neighbor_is_left)`.
    fn neighbor_of(parent: &InternalPage, position: usize) -> (PageId, usize, bool) {
        if position == 0 {
            (Self::child_at(parent, 1), 0, false)
        } else {
            (Self::child_at(parent, position - 1), position - 1, true)
        }
    }

    fn rebalance(&self, page_id: PageId, parent_id: PageId) -> Result<()> {
        let (neighbor_id, k_prime_index, neighbor_is_left) = {
            let guard = self.pool.read_page(self.table_id, parent_id)?;
            let parent = guard.as_internal()?;
            let position = Self::child_position(parent, page_id);
            Self::neighbor_of(parent, position)
        };

        // Always operate on (left, right) in key order regardless of which
        // side triggered the rebalance, so the leaf sibling chain and the
        // internal key ordering stay correct.
        let (left_id, right_id) = if neighbor_is_left {
            (neighbor_id, page_id)
        } else {
            (page_id, neighbor_id)
        };

        let is_leaf = matches!(&*self.pool.read_page(self.table_id, page_id)?, TreePage::Leaf(_));
        if is_leaf {
            self.rebalance_leaves(left_id, right_id, parent_id, k_prime_index, neighbor_is_left)
        } else {
            self.rebalance_internal(left_id, right_id, parent_id, k_prime_index, neighbor_is_left)
        }
    }

    fn rebalance_leaves(
        &self,
        left_id: PageId,
        right_id: PageId,
        parent_id: PageId,
        k_prime_index: usize,
        neighbor_is_left: bool,
    ) -> Result<()> {
        let (left_space, right_payload) = {
            let left_guard = self.pool.read_page(self.table_id, left_id)?;
            let right_guard = self.pool.read_page(self.table_id, right_id)?;
            let left = left_guard.as_leaf()?;
            let right = right_guard.as_leaf()?;
            let payload: usize = right.slots().iter().map(|s| SLOT_SIZE + s.value.len()).sum();
            (left.free_space(), payload)
        };

        if left_space >= right_payload {
            self.coalesce_leaves(left_id, right_id, parent_id)
        } else {
            self.redistribute_leaves(left_id, right_id, parent_id, k_prime_index, neighbor_is_left)
        }
    }

    fn coalesce_leaves(&self, left_id: PageId, right_id: PageId, parent_id: PageId) -> Result<()> {
        {
            let mut right_guard = self.pool.read_page_mut(self.table_id, right_id)?;
            let right = right_guard.as_leaf_mut()?;
            let slots = right.take_slots();
            let sibling = right.right_sibling;
            drop(right_guard);

            let mut left_guard = self.pool.read_page_mut(self.table_id, left_id)?;
            let left = left_guard.as_leaf_mut()?;
            left.append_sorted(slots);
            left.right_sibling = sibling;
        }

        self.pool.free_page(self.table_id, right_id)?;

        {
            let mut guard = self.pool.read_page_mut(self.table_id, parent_id)?;
            let parent = guard.as_internal_mut()?;
            if let Some(idx) = parent.entries().iter().position(|e| e.child == right_id) {
                parent.remove_at(idx);
            }
        }
        self.after_removal(parent_id)
    }

    /// Move exactly enough entries across the separator to bring the
    /// underfull page back above `THRESHOLD`. When the neighbor is on the
    /// left, donation comes from its tail (largest keys) into the underfull
    /// right page; when the neighbor is on the right, donation comes from
    /// its head (smallest keys) into the underfull left page. Either way the
    /// parent's separator key is updated to the new first key of whichever
    /// page now starts with the donated-from neighbor's remaining entries.
    fn redistribute_leaves(
        &self,
        left_id: PageId,
        right_id: PageId,
        parent_id: PageId,
        k_prime_index: usize,
        neighbor_is_left: bool,
    ) -> Result<()> {
        let new_separator = {
            let mut left_guard = self.pool.read_page_mut(self.table_id, left_id)?;
            let mut right_guard = self.pool.read_page_mut(self.table_id, right_id)?;
            let left = left_guard.as_leaf_mut()?;
            let right = right_guard.as_leaf_mut()?;

            if neighbor_is_left {
                // left_id is the full neighbor; right_id is underfull.
                while right.free_space() >= THRESHOLD && left.key_count() > 1 {
                    let mut slots = left.take_slots();
                    let moved = slots.pop().expect("left leaf has at least one slot while key_count > 1");
                    left.set_slots(slots);
                    right.append_sorted(vec![moved]);
                }
            } else {
                // right_id is the full neighbor; left_id is underfull.
                while left.free_space() >= THRESHOLD && right.key_count() > 1 {
                    let mut slots = right.take_slots();
                    let moved = slots.remove(0);
                    right.set_slots(slots);
                    left.append_sorted(vec![moved]);
                }
            }

            right.first_key().expect("redistribution leaves the right leaf non-empty")
        };

        let mut parent_guard = self.pool.read_page_mut(self.table_id, parent_id)?;
        let parent = parent_guard.as_internal_mut()?;
        let mut entries = parent.take_entries();
        entries[k_prime_index].key = new_separator;
        parent.set_entries(entries);
        Ok(())
    }

    fn rebalance_internal(
        &self,
        left_id: PageId,
        right_id: PageId,
        parent_id: PageId,
        k_prime_index: usize,
        neighbor_is_left: bool,
    ) -> Result<()> {
        let (left_keys, right_keys) = {
            let left_guard = self.pool.read_page(self.table_id, left_id)?;
            let right_guard = self.pool.read_page(self.table_id, right_id)?;
            (left_guard.as_internal()?.key_count(), right_guard.as_internal()?.key_count())
        };

        if left_keys + 1 + right_keys + 1 <= DEFAULT_ORDER {
            self.coalesce_internal(left_id, right_id, parent_id, k_prime_index)
        } else {
            self.redistribute_internal(left_id, right_id, parent_id, k_prime_index, neighbor_is_left)
        }
    }

    fn coalesce_internal(&self, left_id: PageId, right_id: PageId, parent_id: PageId, k_prime_index: usize) -> Result<()> {
        let k_prime_key = {
            let guard = self.pool.read_page(self.table_id, parent_id)?;
            guard.as_internal()?.entries()[k_prime_index].key
        };

        let (right_leftmost, right_entries) = {
            let mut guard = self.pool.read_page_mut(self.table_id, right_id)?;
            let right = guard.as_internal_mut()?;
            (right.leftmost_child, right.take_entries())
        };

        {
            let mut guard = self.pool.read_page_mut(self.table_id, left_id)?;
            let left = guard.as_internal_mut()?;
            let mut entries = left.take_entries();
            entries.push(InternalEntry { key: k_prime_key, child: right_leftmost });
            entries.extend(right_entries.iter().copied());
            left.set_entries(entries);
        }

        self.set_parent(right_leftmost, left_id)?;
        for entry in &right_entries {
            self.set_parent(entry.child, left_id)?;
        }

        self.pool.free_page(self.table_id, right_id)?;

        {
            let mut guard = self.pool.read_page_mut(self.table_id, parent_id)?;
            let parent = guard.as_internal_mut()?;
            if let Some(idx) = parent.entries().iter().position(|e| e.key == k_prime_key && e.child == right_id) {
                parent.remove_at(idx);
            }
        }
        self.after_removal(parent_id)
    }

    /// Rotate exactly one (key, child) across the parent separator, from the
    /// full neighbor into the underfull page. When the neighbor is on the
    /// right, its leftmost_child moves up to become the underfull left
    /// page's new last child, with the parent's k_prime key sliding down to
    /// become that child's separating key, and the neighbor's own first key
    /// rises to replace k_prime. When the neighbor is on the left, the
    /// mirror image happens: its last child moves up to become the underfull
    /// right page's new leftmost_child, k_prime slides down to become the
    /// old leftmost_child's separating key, and the neighbor's own last key
    /// rises to replace k_prime.
    fn redistribute_internal(
        &self,
        left_id: PageId,
        right_id: PageId,
        parent_id: PageId,
        k_prime_index: usize,
        neighbor_is_left: bool,
    ) -> Result<()> {
        let k_prime_key = {
            let guard = self.pool.read_page(self.table_id, parent_id)?;
            guard.as_internal()?.entries()[k_prime_index].key
        };

        let new_k_prime = if neighbor_is_left {
            // left_id is the full neighbor; right_id is underfull.
            let (moved_child, new_k_prime) = {
                let mut left_guard = self.pool.read_page_mut(self.table_id, left_id)?;
                let left = left_guard.as_internal_mut()?;
                let mut entries = left.take_entries();
                let last = entries.pop().expect("left internal has at least one entry while redistributing");
                left.set_entries(entries);
                (last.child, last.key)
            };

            {
                let mut right_guard = self.pool.read_page_mut(self.table_id, right_id)?;
                let right = right_guard.as_internal_mut()?;
                let old_leftmost = right.leftmost_child;
                right.leftmost_child = moved_child;
                right.insert_at(0, k_prime_key, old_leftmost);
            }
            self.set_parent(moved_child, right_id)?;
            new_k_prime
        } else {
            // right_id is the full neighbor; left_id is underfull.
            let (moved_child, new_k_prime) = {
                let mut right_guard = self.pool.read_page_mut(self.table_id, right_id)?;
                let right = right_guard.as_internal_mut()?;
                let moved_child = right.leftmost_child;
                let mut entries = right.take_entries();
                let first = entries.remove(0);
                right.leftmost_child = first.child;
                right.set_entries(entries);
                (moved_child, first.key)
            };

            {
                let mut left_guard = self.pool.read_page_mut(self.table_id, left_id)?;
                let left = left_guard.as_internal_mut()?;
                let pos = left.key_count();
                left.insert_at(pos, k_prime_key, moved_child);
            }
            self.set_parent(moved_child, left_id)?;
            new_k_prime
        };

        let mut parent_guard = self.pool.read_page_mut(self.table_id, parent_id)?;
        let parent = parent_guard.as_internal_mut()?;
        let mut entries = parent.take_entries();
        entries[k_prime_index].key = new_k_prime;
        parent.set_entries(entries);
        Ok(())
    }
}

/// Choose the split point for a leaf holding `slots` (already includes the
/// new entry) by accumulating slot costs left-to-right until the cumulative
/// byte offset would cross `MIDDLE_OF_PAGE`.
fn leaf_split_point(slots: &[LeafSlot]) -> usize {
    let mut cumulative = 0usize;
    for (i, slot) in slots.iter().enumerate() {
        cumulative += SLOT_SIZE + slot.value.len();
        if cumulative > MIDDLE_OF_PAGE {
            return i.max(1);
        }
    }
    (slots.len() / 2).max(1)
}
