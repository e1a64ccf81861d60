//! Ordered iteration over external nodes (§4.5).
//!
//! A cursor holds `(node_id, slot_index)` into a leaf plus the slot-directory index
//! within it; `next`/`prev` advance within the leaf and cross into the neighbor via
//! `next_id`/`prev_id` at its ends. There is no snapshot isolation: any mutating call
//! on the tree bumps a shared epoch counter, and a cursor that notices its captured
//! epoch is stale reports `Invalidated` rather than silently reading newer data.

use crate::error::{Error, Result};
use crate::page::cell;
use crate::page::PageId;

use super::{node, read_cell_kv, BTree};

use std::cell::Cell;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorStatus {
    /// Positioned on a live key; `key()`/`value()` will succeed.
    Valid,
    /// Ran off either end of the ordered sequence (`seek` found nothing `>=` its
    /// target, or `next`/`prev` walked past the last/first entry).
    NotFound,
    /// The tree was mutated since this cursor last repositioned itself.
    Invalidated,
}

#[derive(Clone, Copy)]
struct Position {
    node_id: PageId,
    idx: usize,
}

pub struct Cursor<'p> {
    tree: BTree<'p>,
    epoch: Rc<Cell<u64>>,
    captured_epoch: u64,
    position: Option<Position>,
    status: CursorStatus,
}

impl<'p> BTree<'p> {
    /// `epoch` is bumped by the caller (the engine) on every `put`/`erase`/`commit_txn`/
    /// `rollback_txn`; every cursor sharing it is invalidated by the bump.
    pub fn new_cursor(&self, epoch: Rc<Cell<u64>>) -> Cursor<'p> {
        let captured_epoch = epoch.get();
        Cursor {
            tree: *self,
            epoch,
            captured_epoch,
            position: None,
            status: CursorStatus::Invalidated,
        }
    }
}

impl<'p> Cursor<'p> {
    pub fn status(&self) -> CursorStatus {
        self.status
    }

    pub fn seek(&mut self, key: &[u8]) -> Result<()> {
        self.captured_epoch = self.epoch.get();
        let (_, leaf) = self.tree.descend_read(key)?;
        self.apply_forward(leaf.id, leaf.idx)
    }

    pub fn seek_first(&mut self) -> Result<()> {
        self.captured_epoch = self.epoch.get();
        let mut cur = self.tree.root_id();
        loop {
            let page_ref = self.tree.pager().acquire(cur)?;
            let page = page_ref.borrow();
            if node::is_external_of(&page) {
                drop(page);
                return self.apply_forward(cur, 0);
            }
            let count = node::cell_count_of(&page) as usize;
            let next = if count > 0 {
                let meta = self.tree.meta(false);
                let off = node::slot_of(&page, 0) as usize;
                cell::parse_cell(&meta, &page.as_slice()[off..])?
                    .child_id
                    .ok_or_else(|| Error::corruption("internal cell missing its child id"))?
            } else {
                node::next_id_of(&page)
            };
            drop(page);
            cur = next;
        }
    }

    pub fn seek_last(&mut self) -> Result<()> {
        self.captured_epoch = self.epoch.get();
        let mut cur = self.tree.root_id();
        loop {
            let page_ref = self.tree.pager().acquire(cur)?;
            let is_ext = node::is_external_of(&page_ref.borrow());
            if is_ext {
                break;
            }
            cur = node::next_id_of(&page_ref.borrow());
        }
        let count = {
            let page_ref = self.tree.pager().acquire(cur)?;
            node::cell_count_of(&page_ref.borrow()) as usize
        };
        if count > 0 {
            self.position = Some(Position { node_id: cur, idx: count - 1 });
            self.status = CursorStatus::Valid;
            Ok(())
        } else {
            self.settle(self.retreat_backward(cur)?)
        }
    }

    pub fn next(&mut self) -> Result<()> {
        if !self.check_epoch() {
            return Ok(());
        }
        match self.position {
            Some(pos) => self.apply_forward(pos.node_id, pos.idx + 1),
            None => {
                self.status = CursorStatus::NotFound;
                Ok(())
            }
        }
    }

    pub fn prev(&mut self) -> Result<()> {
        if !self.check_epoch() {
            return Ok(());
        }
        let Some(pos) = self.position else {
            self.status = CursorStatus::NotFound;
            return Ok(());
        };
        if pos.idx == 0 {
            let found = self.retreat_backward(pos.node_id)?;
            self.settle(found)
        } else {
            self.position = Some(Position {
                node_id: pos.node_id,
                idx: pos.idx - 1,
            });
            self.status = CursorStatus::Valid;
            Ok(())
        }
    }

    pub fn key(&self) -> Result<Vec<u8>> {
        let pos = self.require_valid()?;
        self.read_at(pos).map(|(k, _)| k)
    }

    pub fn value(&self) -> Result<Vec<u8>> {
        let pos = self.require_valid()?;
        self.read_at(pos).map(|(_, v)| v)
    }

    fn require_valid(&self) -> Result<Position> {
        if self.epoch.get() != self.captured_epoch {
            return Err(Error::NotFound);
        }
        match (self.status, self.position) {
            (CursorStatus::Valid, Some(pos)) => Ok(pos),
            _ => Err(Error::NotFound),
        }
    }

    fn read_at(&self, pos: Position) -> Result<(Vec<u8>, Vec<u8>)> {
        let page_ref = self.tree.pager().acquire(pos.node_id)?;
        let page = page_ref.borrow();
        let off = node::slot_of(&page, pos.idx) as usize;
        let meta = self.tree.meta(true);
        read_cell_kv(self.tree.pager(), &meta, &page.as_slice()[off..])
    }

    fn check_epoch(&mut self) -> bool {
        if self.epoch.get() != self.captured_epoch {
            self.position = None;
            self.status = CursorStatus::Invalidated;
            false
        } else {
            true
        }
    }

    fn settle(&mut self, found: Option<Position>) -> Result<()> {
        match found {
            Some(pos) => {
                self.position = Some(pos);
                self.status = CursorStatus::Valid;
            }
            None => {
                self.position = None;
                self.status = CursorStatus::NotFound;
            }
        }
        Ok(())
    }

    fn apply_forward(&mut self, node_id: PageId, idx: usize) -> Result<()> {
        let found = self.advance_forward(node_id, idx)?;
        self.settle(found)
    }

    /// Walk forward from `(node_id, idx)` — which may point one past the last live
    /// slot in `node_id` — through the leaf sibling chain to the first in-range slot.
    fn advance_forward(&self, mut node_id: PageId, mut idx: usize) -> Result<Option<Position>> {
        loop {
            let page_ref = self.tree.pager().acquire(node_id)?;
            let count = node::cell_count_of(&page_ref.borrow()) as usize;
            if idx < count {
                return Ok(Some(Position { node_id, idx }));
            }
            let next = node::next_id_of(&page_ref.borrow());
            if next == 0 {
                return Ok(None);
            }
            node_id = next;
            idx = 0;
        }
    }

    /// Walk backward from just before `node_id`'s first slot to the last slot of the
    /// nearest non-empty predecessor leaf.
    fn retreat_backward(&self, mut node_id: PageId) -> Result<Option<Position>> {
        loop {
            let prev = {
                let page_ref = self.tree.pager().acquire(node_id)?;
                node::prev_id_of(&page_ref.borrow())
            };
            if prev == 0 {
                return Ok(None);
            }
            let count = {
                let page_ref = self.tree.pager().acquire(prev)?;
                node::cell_count_of(&page_ref.borrow()) as usize
            };
            if count > 0 {
                return Ok(Some(Position { node_id: prev, idx: count - 1 }));
            }
            node_id = prev;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    use tempdir::TempDir;

    use super::CursorStatus;
    use crate::btree::BTree;
    use crate::env::OsEnv;
    use crate::pager::Pager;

    fn fresh_tree(dir: &TempDir, page_size: usize) -> Pager {
        Pager::open(
            Arc::new(OsEnv),
            &dir.path().join("data.calico"),
            page_size,
            64,
            Arc::new(AtomicU64::new(u64::MAX)),
        )
        .unwrap()
    }

    #[test]
    fn seek_semantics_match_nearest_key_at_or_after_target() {
        let dir = TempDir::new("btree-cursor").unwrap();
        let pager = fresh_tree(&dir, 512);
        let tree = BTree::create_fresh(&pager).unwrap();
        let mut noop = |_id| Ok(());
        tree.insert(&mut noop, b"a", b"1").unwrap();
        tree.insert(&mut noop, b"c", b"2").unwrap();
        tree.insert(&mut noop, b"e", b"3").unwrap();

        let epoch = Rc::new(Cell::new(0));
        let mut cursor = tree.new_cursor(epoch);
        cursor.seek(b"b").unwrap();
        assert_eq!(cursor.status(), CursorStatus::Valid);
        assert_eq!(cursor.key().unwrap(), b"c");

        cursor.prev().unwrap();
        assert_eq!(cursor.status(), CursorStatus::Valid);
        assert_eq!(cursor.key().unwrap(), b"a");

        cursor.prev().unwrap();
        assert_eq!(cursor.status(), CursorStatus::NotFound);

        cursor.seek(b"z").unwrap();
        assert_eq!(cursor.status(), CursorStatus::NotFound);
    }

    #[test]
    fn forward_and_backward_full_scan() {
        let dir = TempDir::new("btree-cursor").unwrap();
        let pager = fresh_tree(&dir, 256);
        let tree = BTree::create_fresh(&pager).unwrap();
        let mut noop = |_id| Ok(());
        let keys: Vec<String> = (0..200u32).map(|i| format!("key-{i:06}")).collect();
        for k in &keys {
            tree.insert(&mut noop, k.as_bytes(), b"v").unwrap();
        }

        let epoch = Rc::new(Cell::new(0));
        let mut cursor = tree.new_cursor(epoch.clone());
        cursor.seek_first().unwrap();
        let mut seen = Vec::new();
        loop {
            if cursor.status() != CursorStatus::Valid {
                break;
            }
            seen.push(String::from_utf8(cursor.key().unwrap()).unwrap());
            cursor.next().unwrap();
        }
        assert_eq!(seen, keys);

        let mut cursor = tree.new_cursor(epoch);
        cursor.seek_last().unwrap();
        let mut rev = Vec::new();
        loop {
            if cursor.status() != CursorStatus::Valid {
                break;
            }
            rev.push(String::from_utf8(cursor.key().unwrap()).unwrap());
            cursor.prev().unwrap();
        }
        rev.reverse();
        assert_eq!(rev, keys);
    }

    #[test]
    fn mutation_invalidates_outstanding_cursor() {
        let dir = TempDir::new("btree-cursor").unwrap();
        let pager = fresh_tree(&dir, 512);
        let tree = BTree::create_fresh(&pager).unwrap();
        let mut noop = |_id| Ok(());
        tree.insert(&mut noop, b"a", b"1").unwrap();

        let epoch = Rc::new(Cell::new(0));
        let mut cursor = tree.new_cursor(epoch.clone());
        cursor.seek(b"a").unwrap();
        assert_eq!(cursor.status(), CursorStatus::Valid);

        epoch.set(epoch.get() + 1);
        cursor.next().unwrap();
        assert_eq!(cursor.status(), CursorStatus::Invalidated);
        assert!(cursor.key().is_err());
    }
}
