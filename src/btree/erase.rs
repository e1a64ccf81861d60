//! Deletion, merge and rotation (§4.5).
//!
//! A node below 1/4 full (usable space over 3/4 of its capacity) triggers a rebalance:
//! borrow a cell from a sibling through the parent if one has spare cells, otherwise
//! merge with a sibling and remove the separator from the parent, which may itself now
//! be underflowing — propagated up the same descent-path stack insertion uses, one
//! level at a time, until the root (which never underflows; an internal root left with
//! no keys collapses its one remaining child into itself, §4.5).

use crate::error::{Error, Result};
use crate::page::alloc;
use crate::page::cell;
use crate::page::node::{Node, NodeMeta};
use crate::page::{write_u64, PageId, PointerType};

use super::{node, read_cell_key, BTree, TouchFn};

const UNDERFLOW_NUMERATOR: usize = 3;
const UNDERFLOW_DENOMINATOR: usize = 4;

struct Siblings {
    left: Option<PageId>,
    right: Option<PageId>,
}

impl<'p> BTree<'p> {
    pub fn erase(&self, touch: &mut TouchFn, key: &[u8]) -> Result<()> {
        let (mut path, leaf) = self.descend_read(key)?;
        if !leaf.exact {
            return Err(Error::NotFound);
        }
        path.pop();
        touch(leaf.id)?;
        {
            let meta = self.meta(true);
            let page_ref = self.pager.acquire(leaf.id)?;
            {
                let page = page_ref.borrow();
                self.free_cell_overflow(touch, &meta, &page.as_slice()[leaf.offset..])?;
            }
            let mut page = page_ref.borrow_mut();
            let mut node = Node::new(&mut page);
            let len = cell::cell_size_for(&meta, node.cell_bytes(leaf.offset, node.page_size() - leaf.offset));
            alloc::free(&mut node, leaf.offset, len);
            node.remove_slot(leaf.idx);
        }
        self.rebalance(touch, leaf.id, path)
    }

    fn rebalance(&self, touch: &mut TouchFn, node_id: PageId, mut ancestors: Vec<PageId>) -> Result<()> {
        if node_id == self.root_id {
            return self.maybe_collapse_root(touch);
        }
        if !self.is_underflowing(node_id)? {
            return Ok(());
        }
        let parent_id = *ancestors
            .last()
            .ok_or_else(|| Error::corruption("non-root node has no parent on its own descent path"))?;
        let mut grandparents = ancestors.clone();
        grandparents.pop();
        let _ = &mut ancestors;

        let siblings = self.sibling_ids(parent_id, node_id)?;
        let meta = self.meta(self.is_external(node_id)?);

        if let Some(right_id) = siblings.right {
            if self.can_lend(right_id)? {
                self.rotate_left(touch, parent_id, node_id, right_id, &meta)?;
                return Ok(());
            }
        }
        if let Some(left_id) = siblings.left {
            if self.can_lend(left_id)? {
                self.rotate_right(touch, parent_id, left_id, node_id, &meta)?;
                return Ok(());
            }
        }
        if let Some(right_id) = siblings.right {
            self.merge(touch, parent_id, node_id, right_id, &meta)?;
        } else if let Some(left_id) = siblings.left {
            self.merge(touch, parent_id, left_id, node_id, &meta)?;
        } else {
            // only child of the parent and the parent isn't the root: shouldn't arise
            // given every non-root internal node has at least one key, but tolerate it
            // as a no-op rather than panicking on an unexpected shape.
            return Ok(());
        }
        self.rebalance(touch, parent_id, grandparents)
    }

    fn is_underflowing(&self, node_id: PageId) -> Result<bool> {
        if node_id == self.root_id {
            return Ok(false);
        }
        let page_ref = self.pager.acquire(node_id)?;
        let page = page_ref.borrow();
        let capacity = page.len() - crate::page::node::NODE_HEADER_SIZE;
        let usable = node::usable_space_of(&page);
        Ok(usable * UNDERFLOW_DENOMINATOR > capacity * UNDERFLOW_NUMERATOR)
    }

    fn can_lend(&self, sibling_id: PageId) -> Result<bool> {
        let page_ref = self.pager.acquire(sibling_id)?;
        let count = node::cell_count_of(&page_ref.borrow()) as usize;
        Ok(count > 1)
    }

    fn sibling_ids(&self, parent_id: PageId, node_id: PageId) -> Result<Siblings> {
        let meta = self.meta(false);
        let page_ref = self.pager.acquire(parent_id)?;
        let page = page_ref.borrow();
        let count = node::cell_count_of(&page) as usize;
        let mut children = Vec::with_capacity(count + 1);
        for i in 0..count {
            let off = node::slot_of(&page, i) as usize;
            let parsed = cell::parse_cell(&meta, &page.as_slice()[off..])?;
            children.push(
                parsed
                    .child_id
                    .ok_or_else(|| Error::corruption("internal cell missing its child id"))?,
            );
        }
        children.push(node::next_id_of(&page));
        let pos = children
            .iter()
            .position(|&c| c == node_id)
            .ok_or_else(|| Error::corruption("child page not referenced by its parent"))?;
        Ok(Siblings {
            left: if pos > 0 { Some(children[pos - 1]) } else { None },
            right: children.get(pos + 1).copied(),
        })
    }

    fn parent_separator_key(&self, parent_id: PageId, left_child_id: PageId) -> Result<Vec<u8>> {
        let meta = self.meta(false);
        let page_ref = self.pager.acquire(parent_id)?;
        let page = page_ref.borrow();
        let count = node::cell_count_of(&page) as usize;
        for i in 0..count {
            let off = node::slot_of(&page, i) as usize;
            let parsed = cell::parse_cell(&meta, &page.as_slice()[off..])?;
            if parsed.child_id == Some(left_child_id) {
                return read_cell_key(self.pager, &meta, &page.as_slice()[off..]);
            }
        }
        Err(Error::corruption("separator key not found for child"))
    }

    fn replace_parent_separator_key(&self, parent_id: PageId, left_child_id: PageId, new_key: &[u8]) -> Result<()> {
        let meta = self.meta(false);
        let (mut cells, _next_id, _prev_id) = self.collect_cells(parent_id, &meta)?;
        let idx = cells
            .iter()
            .position(|c| {
                cell::parse_cell(&meta, c)
                    .map(|p| p.child_id == Some(left_child_id))
                    .unwrap_or(false)
            })
            .ok_or_else(|| Error::corruption("separator cell not found in parent"))?;
        cells[idx] = cell::promote_cell(&meta, new_key, left_child_id)?;
        self.rewrite_node(parent_id, &meta, &cells)
    }

    /// Remove the parent's separator cell whose left child is `merged_child_id` (the
    /// two children either side of it have just been combined into that one page);
    /// whichever reference used to follow it — the next cell's child id, or the
    /// parent's rightmost pointer — is retargeted to `merged_child_id` in its place.
    fn remove_parent_separator(&self, touch: &mut TouchFn, parent_id: PageId, merged_child_id: PageId) -> Result<()> {
        touch(parent_id)?;
        let meta = self.meta(false);
        let page_ref = self.pager.acquire(parent_id)?;
        let p = {
            let page = page_ref.borrow();
            let count = node::cell_count_of(&page) as usize;
            let mut found = None;
            for i in 0..count {
                let off = node::slot_of(&page, i) as usize;
                let parsed = cell::parse_cell(&meta, &page.as_slice()[off..])?;
                if parsed.child_id == Some(merged_child_id) {
                    found = Some(i);
                    break;
                }
            }
            found.ok_or_else(|| Error::corruption("merged child not referenced by its parent"))?
        };
        let mut page = page_ref.borrow_mut();
        let mut node = Node::new(&mut page);
        let off = node.slot(p) as usize;
        let len = cell::cell_size_for(&meta, node.cell_bytes(off, node.page_size() - off));
        alloc::free(&mut node, off, len);
        node.remove_slot(p);
        let count_after = node.cell_count() as usize;
        if p < count_after {
            let next_off = node.slot(p) as usize;
            write_u64(node.raw_mut(), next_off, merged_child_id);
        } else {
            node.set_next_id(merged_child_id);
        }
        Ok(())
    }

    fn rotate_left(
        &self,
        touch: &mut TouchFn,
        parent_id: PageId,
        node_id: PageId,
        right_id: PageId,
        meta: &NodeMeta,
    ) -> Result<()> {
        touch(parent_id)?;
        touch(node_id)?;
        touch(right_id)?;
        let (mut node_cells, _node_next, _node_prev) = self.collect_cells(node_id, meta)?;
        let (mut right_cells, right_next, _right_prev) = self.collect_cells(right_id, meta)?;

        if meta.is_external {
            let moved = right_cells.remove(0);
            self.retarget_overflow_owners(touch, meta, std::slice::from_ref(&moved), node_id)?;
            node_cells.push(moved);
            let new_sep = read_cell_key(self.pager, meta, &right_cells[0])?;
            self.rewrite_node(node_id, meta, &node_cells)?;
            self.rewrite_node(right_id, meta, &right_cells)?;
            self.replace_parent_separator_key(parent_id, node_id, &new_sep)
        } else {
            let sep_key = self.parent_separator_key(parent_id, node_id)?;
            let moved = right_cells.remove(0);
            let moved_parsed = cell::parse_cell(meta, &moved)?;
            let new_left_rightmost = moved_parsed
                .child_id
                .ok_or_else(|| Error::corruption("internal cell missing its child id"))?;
            let old_left_rightmost = {
                let page_ref = self.pager.acquire(node_id)?;
                node::next_id_of(&page_ref.borrow())
            };
            let pushed = cell::promote_cell(meta, &sep_key, old_left_rightmost)?;
            node_cells.push(pushed);
            let new_sep = read_cell_key(self.pager, meta, &moved)?;
            self.rewrite_node(node_id, meta, &node_cells)?;
            self.rewrite_node(right_id, meta, &right_cells)?;
            {
                let r = self.pager.acquire(node_id)?;
                Node::new(&mut r.borrow_mut()).set_next_id(new_left_rightmost);
            }
            {
                let r = self.pager.acquire(right_id)?;
                Node::new(&mut r.borrow_mut()).set_next_id(right_next);
            }
            self.set_pointer(touch, new_left_rightmost, PointerType::TreeNode, node_id)?;
            self.replace_parent_separator_key(parent_id, node_id, &new_sep)
        }
    }

    fn rotate_right(
        &self,
        touch: &mut TouchFn,
        parent_id: PageId,
        left_id: PageId,
        node_id: PageId,
        meta: &NodeMeta,
    ) -> Result<()> {
        touch(parent_id)?;
        touch(left_id)?;
        touch(node_id)?;
        let (mut left_cells, left_next, _left_prev) = self.collect_cells(left_id, meta)?;
        let (mut node_cells, node_next, _node_prev) = self.collect_cells(node_id, meta)?;

        if meta.is_external {
            let moved = left_cells.pop().ok_or_else(|| Error::corruption("lending sibling has no cells to rotate"))?;
            let new_sep = read_cell_key(self.pager, meta, &moved)?;
            self.retarget_overflow_owners(touch, meta, std::slice::from_ref(&moved), node_id)?;
            node_cells.insert(0, moved);
            self.rewrite_node(left_id, meta, &left_cells)?;
            self.rewrite_node(node_id, meta, &node_cells)?;
            self.replace_parent_separator_key(parent_id, left_id, &new_sep)
        } else {
            let sep_key = self.parent_separator_key(parent_id, left_id)?;
            let moved = left_cells.pop().ok_or_else(|| Error::corruption("lending sibling has no cells to rotate"))?;
            let moved_parsed = cell::parse_cell(meta, &moved)?;
            let new_left_rightmost = moved_parsed
                .child_id
                .ok_or_else(|| Error::corruption("internal cell missing its child id"))?;
            let pushed = cell::promote_cell(meta, &sep_key, left_next)?;
            node_cells.insert(0, pushed);
            let new_sep = read_cell_key(self.pager, meta, &moved)?;
            self.rewrite_node(left_id, meta, &left_cells)?;
            self.rewrite_node(node_id, meta, &node_cells)?;
            {
                let r = self.pager.acquire(left_id)?;
                Node::new(&mut r.borrow_mut()).set_next_id(new_left_rightmost);
            }
            {
                let r = self.pager.acquire(node_id)?;
                Node::new(&mut r.borrow_mut()).set_next_id(node_next);
            }
            if left_next != 0 {
                self.set_pointer(touch, left_next, PointerType::TreeNode, node_id)?;
            }
            self.replace_parent_separator_key(parent_id, left_id, &new_sep)
        }
    }

    fn merge(&self, touch: &mut TouchFn, parent_id: PageId, left_id: PageId, right_id: PageId, meta: &NodeMeta) -> Result<()> {
        touch(parent_id)?;
        touch(left_id)?;
        touch(right_id)?;
        let (mut left_cells, _left_next, left_prev) = self.collect_cells(left_id, meta)?;
        let (right_cells, right_next, _right_prev) = self.collect_cells(right_id, meta)?;

        if meta.is_external {
            self.retarget_overflow_owners(touch, meta, &right_cells, left_id)?;
            left_cells.extend(right_cells);
            self.rewrite_node(left_id, meta, &left_cells)?;
            {
                let r = self.pager.acquire(left_id)?;
                let mut p = r.borrow_mut();
                let mut n = Node::new(&mut p);
                n.set_next_id(right_next);
                n.set_prev_id(left_prev);
            }
            if right_next != 0 {
                touch(right_next)?;
                let r = self.pager.acquire(right_next)?;
                Node::new(&mut r.borrow_mut()).set_prev_id(left_id);
            }
        } else {
            let sep_key = self.parent_separator_key(parent_id, left_id)?;
            let left_rightmost = {
                let page_ref = self.pager.acquire(left_id)?;
                node::next_id_of(&page_ref.borrow())
            };
            let bridging = cell::promote_cell(meta, &sep_key, left_rightmost)?;
            for raw in &right_cells {
                let parsed = cell::parse_cell(meta, raw)?;
                let child = parsed
                    .child_id
                    .ok_or_else(|| Error::corruption("internal cell missing its child id"))?;
                self.set_pointer(touch, child, PointerType::TreeNode, left_id)?;
            }
            if right_next != 0 {
                self.set_pointer(touch, right_next, PointerType::TreeNode, left_id)?;
            }
            left_cells.push(bridging);
            left_cells.extend(right_cells);
            self.rewrite_node(left_id, meta, &left_cells)?;
            {
                let r = self.pager.acquire(left_id)?;
                Node::new(&mut r.borrow_mut()).set_next_id(right_next);
            }
        }
        self.pager.free_page(right_id)?;
        self.remove_parent_separator(touch, parent_id, left_id)
    }

    /// An internal root left with no cells has exactly one child (its former rightmost
    /// pointer); collapse that child's content up into the root page, which keeps the
    /// root's `PageId` fixed across the whole tree's lifetime (§4.5).
    fn maybe_collapse_root(&self, touch: &mut TouchFn) -> Result<()> {
        loop {
            let only_child = {
                let page_ref = self.pager.acquire(self.root_id)?;
                let page = page_ref.borrow();
                if node::is_external_of(&page) || node::cell_count_of(&page) != 0 {
                    None
                } else {
                    Some(node::next_id_of(&page))
                }
            };
            let Some(child_id) = only_child else { break };
            if child_id == 0 {
                break;
            }
            touch(self.root_id)?;
            touch(child_id)?;
            let bytes = {
                let child_ref = self.pager.acquire(child_id)?;
                child_ref.borrow().as_slice().to_vec()
            };
            let still_internal = {
                let root_ref = self.pager.acquire(self.root_id)?;
                root_ref.borrow_mut().as_mut_slice().copy_from_slice(&bytes);
                !node::is_external_of(&root_ref.borrow())
            };
            // The root's content used to live at `child_id`; every pointer-map entry
            // and sibling link that referenced it as the owner/neighbor now needs to
            // point at `self.root_id` instead, since `child_id` is about to be freed.
            if still_internal {
                let meta = self.meta(false);
                let (cells, next_id, _prev_id) = self.collect_cells(self.root_id, &meta)?;
                for raw in &cells {
                    let parsed = cell::parse_cell(&meta, raw)?;
                    let child = parsed
                        .child_id
                        .ok_or_else(|| Error::corruption("internal cell missing its child id"))?;
                    self.set_pointer(touch, child, PointerType::TreeNode, self.root_id)?;
                }
                if next_id != 0 {
                    self.set_pointer(touch, next_id, PointerType::TreeNode, self.root_id)?;
                }
            } else {
                let meta = self.meta(true);
                let (cells, next_id, prev_id) = self.collect_cells(self.root_id, &meta)?;
                self.retarget_overflow_owners(touch, &meta, &cells, self.root_id)?;
                if next_id != 0 {
                    touch(next_id)?;
                    let r = self.pager.acquire(next_id)?;
                    Node::new(&mut r.borrow_mut()).set_prev_id(self.root_id);
                }
                if prev_id != 0 {
                    touch(prev_id)?;
                    let r = self.pager.acquire(prev_id)?;
                    Node::new(&mut r.borrow_mut()).set_next_id(self.root_id);
                }
            }
            self.clear_pointer(touch, child_id)?;
            self.pager.free_page(child_id)?;
            if !still_internal {
                break;
            }
        }
        Ok(())
    }
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
    fn erase_removes_key() {
        let dir = TempDir::new("btree-erase").unwrap();
        let pager = fresh_tree(&dir, 512);
        let tree = BTree::create_fresh(&pager).unwrap();
        let mut noop = |_id| Ok(());
        tree.insert(&mut noop, b"a", b"1").unwrap();
        tree.insert(&mut noop, b"b", b"2").unwrap();
        tree.erase(&mut noop, b"a").unwrap();
        assert!(tree.get(b"a").is_err());
        assert_eq!(tree.get(b"b").unwrap(), b"2");
    }

    #[test]
    fn erase_missing_key_is_not_found() {
        let dir = TempDir::new("btree-erase").unwrap();
        let pager = fresh_tree(&dir, 512);
        let tree = BTree::create_fresh(&pager).unwrap();
        let mut noop = |_id| Ok(());
        assert!(tree.erase(&mut noop, b"nope").is_err());
    }

    #[test]
    fn insert_many_then_erase_all_leaves_tree_empty() {
        let dir = TempDir::new("btree-erase").unwrap();
        let pager = fresh_tree(&dir, 256);
        let tree = BTree::create_fresh(&pager).unwrap();
        let mut noop = |_id| Ok(());
        let keys: Vec<String> = (0..400u32).map(|i| format!("key-{i:06}")).collect();
        for k in &keys {
            tree.insert(&mut noop, k.as_bytes(), b"v").unwrap();
        }
        for k in &keys {
            tree.erase(&mut noop, k.as_bytes()).unwrap();
        }
        for k in &keys {
            assert!(tree.get(k.as_bytes()).is_err());
        }
    }

    #[test]
    fn erase_interleaved_with_insert_keeps_survivors_readable() {
        let dir = TempDir::new("btree-erase").unwrap();
        let pager = fresh_tree(&dir, 256);
        let tree = BTree::create_fresh(&pager).unwrap();
        let mut noop = |_id| Ok(());
        let keys: Vec<String> = (0..200u32).map(|i| format!("key-{i:06}")).collect();
        for k in &keys {
            tree.insert(&mut noop, k.as_bytes(), b"v").unwrap();
        }
        for k in keys.iter().step_by(2) {
            tree.erase(&mut noop, k.as_bytes()).unwrap();
        }
        for (i, k) in keys.iter().enumerate() {
            if i % 2 == 0 {
                assert!(tree.get(k.as_bytes()).is_err());
            } else {
                assert_eq!(tree.get(k.as_bytes()).unwrap(), b"v");
            }
        }
    }
}
