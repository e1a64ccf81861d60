//! Insertion and the split path (§4.5).
//!
//! A node that can't fit a new cell is split in two; the tie-break on where to split
//! favors whichever side keeps the *next* sequential insert cheap: appending at the
//! right end splits off the new cell alone onto a fresh right sibling (bulk-load/append
//! workloads never waste half a page), inserting at the very start mirrors that for
//! descending sequences, and anything else splits near the middle by cell count.
//!
//! Nodes carry no parent pointer, so propagating a split upward re-searches the parent
//! for the promoted separator key rather than walking a stored back-pointer — the
//! "anchor key" approach the cell layout was designed around (§9).

use crate::error::{Error, Result};
use crate::page::alloc;
use crate::page::cell;
use crate::page::node::{Node, NodeMeta};
use crate::page::{write_u64, PageId, PointerType};

use super::{node, read_cell_key, BTree, LeafLoc, TouchFn};

impl<'p> BTree<'p> {
    pub fn insert(&self, touch: &mut TouchFn, key: &[u8], value: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::invalid_argument("key must not be empty"));
        }
        let meta = self.meta(true);
        if key.len() > meta.max_local {
            return Err(Error::invalid_argument(
                "key exceeds the size that can stay local to a node",
            ));
        }
        let (mut path, leaf) = self.descend_read(key)?;
        let cell_buf = self.build_external_cell(touch, leaf.id, &meta, key, value)?;
        path.pop();
        if leaf.exact {
            self.replace_in_place(touch, &meta, leaf, &cell_buf, path)
        } else {
            self.insert_cell(touch, leaf.id, leaf.idx, cell_buf, path)
        }
    }

    fn build_external_cell(
        &self,
        touch: &mut TouchFn,
        owner: PageId,
        meta: &NodeMeta,
        key: &[u8],
        value: &[u8],
    ) -> Result<Vec<u8>> {
        let total = key.len() + value.len();
        let local = cell::compute_local(meta, key.len(), total);
        let mut combined = Vec::with_capacity(total);
        combined.extend_from_slice(key);
        combined.extend_from_slice(value);
        let overflow_head = if local < total {
            Some(self.write_chain(touch, owner, &combined[local..])?)
        } else {
            None
        };
        let size = cell::external_footprint(meta, key.len(), value.len());
        let mut buf = vec![0u8; size];
        cell::emplace_external(&mut buf, key.len(), value.len(), &combined[..local], overflow_head);
        Ok(buf)
    }

    fn replace_in_place(
        &self,
        touch: &mut TouchFn,
        meta: &NodeMeta,
        leaf: LeafLoc,
        new_cell: &[u8],
        ancestors: Vec<PageId>,
    ) -> Result<()> {
        touch(leaf.id)?;
        let page_ref = self.pager.acquire(leaf.id)?;
        {
            let page = page_ref.borrow();
            self.free_cell_overflow(touch, meta, &page.as_slice()[leaf.offset..])?;
        }
        {
            let mut page = page_ref.borrow_mut();
            let mut node = Node::new(&mut page);
            let len = cell::cell_size_for(meta, node.cell_bytes(leaf.offset, node.page_size() - leaf.offset));
            alloc::free(&mut node, leaf.offset, len);
            node.remove_slot(leaf.idx);
        }
        self.insert_cell(touch, leaf.id, leaf.idx, new_cell.to_vec(), ancestors)
    }

    fn insert_cell(
        &self,
        touch: &mut TouchFn,
        node_id: PageId,
        idx: usize,
        cell_bytes: Vec<u8>,
        ancestors: Vec<PageId>,
    ) -> Result<()> {
        touch(node_id)?;
        let page_ref = self.pager.acquire(node_id)?;
        let is_ext = {
            let page = page_ref.borrow();
            node::is_external_of(&page)
        };
        let meta = self.meta(is_ext);
        let placed = {
            let mut page = page_ref.borrow_mut();
            let mut node = Node::new(&mut page);
            try_place(&mut node, &meta, idx, &cell_bytes)
        };
        if placed {
            return Ok(());
        }
        self.perform_split(touch, node_id, idx, cell_bytes, ancestors)
    }

    pub(super) fn collect_cells(&self, node_id: PageId, meta: &NodeMeta) -> Result<(Vec<Vec<u8>>, PageId, PageId)> {
        let page_ref = self.pager.acquire(node_id)?;
        let page = page_ref.borrow();
        let count = node::cell_count_of(&page) as usize;
        let mut cells = Vec::with_capacity(count);
        for i in 0..count {
            let off = node::slot_of(&page, i) as usize;
            let len = cell::cell_size_for(meta, &page.as_slice()[off..]);
            cells.push(page.as_slice()[off..off + len].to_vec());
        }
        Ok((cells, node::next_id_of(&page), node::prev_id_of(&page)))
    }

    /// After cells with overflow chains change owner (a split moving them to a new
    /// sibling), repoint each chain's head entry at its new owner so vacuum's
    /// pointer-map lookup doesn't find a stale referrer.
    pub(super) fn retarget_overflow_owners(&self, touch: &mut TouchFn, meta: &NodeMeta, cells: &[Vec<u8>], new_owner: PageId) -> Result<()> {
        for raw in cells {
            let parsed = cell::parse_cell(meta, raw)?;
            if let Some(head) = parsed.overflow_head {
                self.set_pointer(touch, head, PointerType::OverflowHead, new_owner)?;
            }
        }
        Ok(())
    }

    pub(super) fn rewrite_node(&self, node_id: PageId, meta: &NodeMeta, cells: &[Vec<u8>]) -> Result<()> {
        let page_ref = self.pager.acquire(node_id)?;
        let mut page = page_ref.borrow_mut();
        let mut node = Node::new(&mut page);
        let next_id = node.next_id();
        let prev_id = node.prev_id();
        node.init(meta.is_external);
        node.set_next_id(next_id);
        node.set_prev_id(prev_id);
        for (i, bytes) in cells.iter().enumerate() {
            let off = alloc::allocate(&mut node, bytes.len());
            debug_assert!(off != 0, "a freshly split node must have room for its own cells");
            node.cell_bytes_mut(off, bytes.len()).copy_from_slice(bytes);
            node.insert_slot(i, off as u16);
        }
        Ok(())
    }

    fn perform_split(
        &self,
        touch: &mut TouchFn,
        node_id: PageId,
        idx: usize,
        new_cell: Vec<u8>,
        ancestors: Vec<PageId>,
    ) -> Result<()> {
        let is_ext = self.is_external(node_id)?;
        let meta = self.meta(is_ext);
        let (mut cells, next_id, prev_id) = self.collect_cells(node_id, &meta)?;
        cells.insert(idx.min(cells.len()), new_cell);
        let n = cells.len();
        let split_at = if idx + 1 == n {
            n - 1
        } else if idx == 0 {
            1
        } else {
            n / 2
        };

        let right_ref = self.pager.allocate()?;
        let right_id = right_ref.id();
        touch(right_id)?;

        if is_ext {
            let left_cells = cells[..split_at].to_vec();
            let right_cells = cells[split_at..].to_vec();
            let promote_key = read_cell_key(self.pager, &meta, &right_cells[0])?;
            self.rewrite_node(node_id, &meta, &left_cells)?;
            self.rewrite_node(right_id, &meta, &right_cells)?;
            self.retarget_overflow_owners(touch, &meta, &right_cells, right_id)?;

            {
                let mut page = right_ref.borrow_mut();
                let mut node = Node::new(&mut page);
                node.set_next_id(next_id);
                node.set_prev_id(node_id);
            }
            if next_id != 0 {
                touch(next_id)?;
                let next_ref = self.pager.acquire(next_id)?;
                let mut page = next_ref.borrow_mut();
                Node::new(&mut page).set_prev_id(right_id);
            }
            {
                let left_ref = self.pager.acquire(node_id)?;
                let mut page = left_ref.borrow_mut();
                let mut node = Node::new(&mut page);
                node.set_next_id(right_id);
                node.set_prev_id(prev_id);
            }
            self.finish_split(touch, node_id, right_id, &promote_key, ancestors)
        } else {
            let left_cells = cells[..split_at].to_vec();
            let mid = cells[split_at].clone();
            let right_cells = cells[split_at + 1..].to_vec();
            let mid_parsed = cell::parse_cell(&meta, &mid)?;
            let promote_key = read_cell_key(self.pager, &meta, &mid)?;
            let left_rightmost = mid_parsed
                .child_id
                .ok_or_else(|| Error::corruption("internal cell missing its child id"))?;

            self.rewrite_node(node_id, &meta, &left_cells)?;
            self.rewrite_node(right_id, &meta, &right_cells)?;
            for raw in &right_cells {
                let parsed = cell::parse_cell(&meta, raw)?;
                let child = parsed
                    .child_id
                    .ok_or_else(|| Error::corruption("internal cell missing its child id"))?;
                self.set_pointer(touch, child, PointerType::TreeNode, right_id)?;
            }
            if next_id != 0 {
                self.set_pointer(touch, next_id, PointerType::TreeNode, right_id)?;
            }
            {
                let left_ref = self.pager.acquire(node_id)?;
                let mut page = left_ref.borrow_mut();
                Node::new(&mut page).set_next_id(left_rightmost);
            }
            {
                let mut page = right_ref.borrow_mut();
                Node::new(&mut page).set_next_id(next_id);
            }
            self.finish_split(touch, node_id, right_id, &promote_key, ancestors)
        }
    }

    fn finish_split(
        &self,
        touch: &mut TouchFn,
        left_id: PageId,
        right_id: PageId,
        promote_key: &[u8],
        mut ancestors: Vec<PageId>,
    ) -> Result<()> {
        match ancestors.pop() {
            Some(parent_id) => {
                self.set_pointer(touch, right_id, PointerType::TreeNode, parent_id)?;
                self.insert_separator_and_retarget(touch, parent_id, promote_key, left_id, right_id, ancestors)
            }
            None => {
                debug_assert_eq!(left_id, self.root_id);
                self.grow_root(touch, promote_key, right_id)
            }
        }
    }

    /// A key that used to route entirely to `left_id` now splits between `left_id` and
    /// `right_id` at `promote_key`; re-derive the parent slot that pointed to `left_id`
    /// by searching for `promote_key` again rather than remembering it from the descent.
    fn insert_separator_and_retarget(
        &self,
        touch: &mut TouchFn,
        parent_id: PageId,
        promote_key: &[u8],
        left_id: PageId,
        right_id: PageId,
        ancestors: Vec<PageId>,
    ) -> Result<()> {
        touch(parent_id)?;
        let meta = self.meta(false);
        let page_ref = self.pager.acquire(parent_id)?;
        let idx = {
            let page = page_ref.borrow();
            let count = node::cell_count_of(&page) as usize;
            super::find_slot(self.pager, &page, &meta, count, promote_key)?.0
        };
        {
            let mut page = page_ref.borrow_mut();
            let mut node = Node::new(&mut page);
            let count = node.cell_count() as usize;
            if idx < count {
                let off = node.slot(idx) as usize;
                write_u64(node.raw_mut(), off, right_id);
            } else {
                node.set_next_id(right_id);
            }
        }
        let sep_cell = cell::promote_cell(&meta, promote_key, left_id)?;
        self.insert_cell(touch, parent_id, idx, sep_cell, ancestors)
    }

    /// The root page split; its content has already been rewritten in place to hold the
    /// *left* half, but the root's `PageId` must stay fixed forever, so that content
    /// moves to a freshly allocated page and the root is rewritten as a one-cell
    /// internal node over it and `right_id` (§4.5).
    fn grow_root(&self, touch: &mut TouchFn, promote_key: &[u8], right_id: PageId) -> Result<()> {
        let new_left = self.pager.allocate()?;
        let new_left_id = new_left.id();
        touch(new_left_id)?;
        {
            let root_ref = self.pager.acquire(self.root_id)?;
            let bytes = root_ref.borrow().as_slice().to_vec();
            new_left.borrow_mut().as_mut_slice().copy_from_slice(&bytes);
        }
        let was_ext = node::is_external_of(&new_left.borrow());
        if was_ext {
            let prev = node::prev_id_of(&new_left.borrow());
            if prev != 0 {
                touch(prev)?;
                let prev_ref = self.pager.acquire(prev)?;
                Node::new(&mut prev_ref.borrow_mut()).set_next_id(new_left_id);
            }
            touch(right_id)?;
            let right_ref = self.pager.acquire(right_id)?;
            Node::new(&mut right_ref.borrow_mut()).set_prev_id(new_left_id);

            let meta = self.meta(true);
            let (cells, _next_id, _prev_id) = self.collect_cells(new_left_id, &meta)?;
            self.retarget_overflow_owners(touch, &meta, &cells, new_left_id)?;
        } else {
            let meta = self.meta(false);
            let (cells, next_id, _prev_id) = self.collect_cells(new_left_id, &meta)?;
            for raw in &cells {
                let parsed = cell::parse_cell(&meta, raw)?;
                let child = parsed
                    .child_id
                    .ok_or_else(|| Error::corruption("internal cell missing its child id"))?;
                self.set_pointer(touch, child, PointerType::TreeNode, new_left_id)?;
            }
            if next_id != 0 {
                self.set_pointer(touch, next_id, PointerType::TreeNode, new_left_id)?;
            }
        }
        self.set_pointer(touch, new_left_id, PointerType::TreeNode, self.root_id)?;
        self.set_pointer(touch, right_id, PointerType::TreeNode, self.root_id)?;

        touch(self.root_id)?;
        let root_ref = self.pager.acquire(self.root_id)?;
        let internal_meta = self.meta(false);
        let sep_cell = cell::promote_cell(&internal_meta, promote_key, new_left_id)?;
        let mut page = root_ref.borrow_mut();
        let mut node = Node::new(&mut page);
        node.init(false);
        let off = alloc::allocate(&mut node, sep_cell.len());
        debug_assert!(off != 0, "an empty root page always has room for one cell");
        node.cell_bytes_mut(off, sep_cell.len()).copy_from_slice(&sep_cell);
        node.insert_slot(0, off as u16);
        node.set_next_id(right_id);
        Ok(())
    }
}

fn try_place(node: &mut Node, meta: &NodeMeta, idx: usize, cell_bytes: &[u8]) -> bool {
    let size = cell_bytes.len();
    let mut off = alloc::allocate(node, size);
    if off == 0 {
        alloc::defragment(node, None, |raw| cell::cell_size_for(meta, raw));
        off = alloc::allocate(node, size);
        if off == 0 {
            return false;
        }
    }
    node.cell_bytes_mut(off, size).copy_from_slice(cell_bytes);
    node.insert_slot(idx, off as u16);
    true
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    use tempdir::TempDir;

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
    fn insert_and_get_roundtrip() {
        let dir = TempDir::new("btree-insert").unwrap();
        let pager = fresh_tree(&dir, 512);
        let tree = BTree::create_fresh(&pager).unwrap();
        let mut noop = |_id| Ok(());
        tree.insert(&mut noop, b"alpha", b"1").unwrap();
        tree.insert(&mut noop, b"beta", b"2").unwrap();
        assert_eq!(tree.get(b"alpha").unwrap(), b"1");
        assert_eq!(tree.get(b"beta").unwrap(), b"2");
        assert!(tree.get(b"gamma").is_err());
    }

    #[test]
    fn insert_overwrites_existing_key() {
        let dir = TempDir::new("btree-insert").unwrap();
        let pager = fresh_tree(&dir, 512);
        let tree = BTree::create_fresh(&pager).unwrap();
        let mut noop = |_id| Ok(());
        tree.insert(&mut noop, b"k", b"v1").unwrap();
        tree.insert(&mut noop, b"k", b"v2-longer-value").unwrap();
        assert_eq!(tree.get(b"k").unwrap(), b"v2-longer-value");
    }

    #[test]
    fn many_sequential_inserts_force_splits() {
        let dir = TempDir::new("btree-insert").unwrap();
        let pager = fresh_tree(&dir, 256);
        let tree = BTree::create_fresh(&pager).unwrap();
        let mut noop = |_id| Ok(());
        for i in 0..500u32 {
            let key = format!("key-{i:06}");
            tree.insert(&mut noop, key.as_bytes(), b"payload").unwrap();
        }
        for i in 0..500u32 {
            let key = format!("key-{i:06}");
            assert_eq!(tree.get(key.as_bytes()).unwrap(), b"payload");
        }
    }

    #[test]
    fn reverse_sequential_inserts_also_work() {
        let dir = TempDir::new("btree-insert").unwrap();
        let pager = fresh_tree(&dir, 256);
        let tree = BTree::create_fresh(&pager).unwrap();
        let mut noop = |_id| Ok(());
        for i in (0..300u32).rev() {
            let key = format!("key-{i:06}");
            tree.insert(&mut noop, key.as_bytes(), b"x").unwrap();
        }
        for i in 0..300u32 {
            let key = format!("key-{i:06}");
            assert_eq!(tree.get(key.as_bytes()).unwrap(), b"x");
        }
    }

    #[test]
    fn large_value_spills_to_overflow_chain() {
        let dir = TempDir::new("btree-insert").unwrap();
        let pager = fresh_tree(&dir, 256);
        let tree = BTree::create_fresh(&pager).unwrap();
        let mut noop = |_id| Ok(());
        let value = vec![0x42u8; 4000];
        tree.insert(&mut noop, b"big", &value).unwrap();
        assert_eq!(tree.get(b"big").unwrap(), value);
    }
}
