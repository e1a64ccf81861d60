//! Compaction (§4.5, §4's "Vacuum" operation).
//!
//! insert/erase keep every moved page's pointer-map entry current (§3), so vacuum
//! consults it first: an overflow page's entry names its owning cell or predecessor
//! directly, letting `relocate_one` retarget it in O(1) instead of searching. Only
//! pages outside the single map stride this implementation maintains, or whose entry
//! names a tree node (reparenting a node touches more than the one back-pointer this
//! map records), fall back to rediscovering the referrer by walking the live tree from
//! the root, the same way every other operation here does.
//!
//! Either way vacuum repeatedly moves the file's current last page down into some free
//! slot and shrinks the file by one page, until no free pages remain below the live
//! high-water mark.

use std::collections::{HashMap, HashSet};

use crate::error::{Error, Result};
use crate::page::cell;
use crate::page::node::Node;
use crate::page::{overflow, read_u64, write_u64, PageId, PointerType, PAGE_LSN_SIZE};

use super::{node, BTree, TouchFn, POINTER_MAP_PAGE_ID};

#[derive(Clone, Copy)]
enum PageKind {
    Internal,
    External,
    Overflow,
}

impl<'p> BTree<'p> {
    pub fn vacuum(&self, touch: &mut TouchFn) -> Result<()> {
        let mut live = HashSet::new();
        live.insert(POINTER_MAP_PAGE_ID);
        self.collect_live(self.root_id(), &mut live)?;
        let desired = 1 + live.len() as u64;

        loop {
            let page_count = self.pager().page_count();
            if page_count <= desired {
                break;
            }
            if live.contains(&page_count) {
                let dst_ref = self.pager().allocate()?;
                let dst = dst_ref.id();
                let src = page_count;
                touch(src)?;
                touch(dst)?;
                let bytes = { self.pager().acquire(src)?.borrow().as_slice().to_vec() };
                dst_ref.borrow_mut().as_mut_slice().copy_from_slice(&bytes);

                self.relocate_one(touch, src, dst)?;

                live.remove(&src);
                live.insert(dst);
                self.pager().truncate(page_count - 1)?;
            } else {
                match self.reclaim_free_page(touch, page_count)? {
                    Some(_) => {
                        self.pager().truncate(page_count - 1)?;
                    }
                    None => break,
                }
            }
        }
        Ok(())
    }

    fn collect_live(&self, id: PageId, out: &mut HashSet<PageId>) -> Result<()> {
        if !out.insert(id) {
            return Ok(());
        }
        if self.root_is_external_of(id)? {
            let meta = self.meta(true);
            let (cells, _next_id, _prev_id) = self.collect_cells(id, &meta)?;
            for raw in &cells {
                let parsed = cell::parse_cell(&meta, raw)?;
                if let Some(head) = parsed.overflow_head {
                    self.collect_overflow_chain(head, out)?;
                }
            }
        } else {
            let meta = self.meta(false);
            let (cells, next_id, _prev_id) = self.collect_cells(id, &meta)?;
            for raw in &cells {
                let parsed = cell::parse_cell(&meta, raw)?;
                let child = parsed
                    .child_id
                    .ok_or_else(|| Error::corruption("internal cell missing its child id"))?;
                self.collect_live(child, out)?;
            }
            if next_id != 0 {
                self.collect_live(next_id, out)?;
            }
        }
        Ok(())
    }

    fn root_is_external_of(&self, id: PageId) -> Result<bool> {
        let page_ref = self.pager().acquire(id)?;
        Ok(node::is_external_of(&page_ref.borrow()))
    }

    fn collect_overflow_chain(&self, head: PageId, out: &mut HashSet<PageId>) -> Result<()> {
        let mut cur = head;
        while cur != 0 {
            if !out.insert(cur) {
                break;
            }
            let page_ref = self.pager().acquire(cur)?;
            cur = overflow::next_page_id(&page_ref.borrow());
        }
        Ok(())
    }

    /// Rewrite every live pointer field equal to a key in `relocation` to its mapped
    /// value. `id`'s own content is read at its pre-move location throughout, even
    /// after its id has been remapped elsewhere in the map — the physical copy to the
    /// new location happens separately, after this pass.
    fn remap_references(
        &self,
        touch: &mut TouchFn,
        id: PageId,
        kind: PageKind,
        relocation: &HashMap<PageId, PageId>,
    ) -> Result<()> {
        match kind {
            PageKind::Overflow => {
                let next = {
                    let page_ref = self.pager().acquire(id)?;
                    overflow::next_page_id(&page_ref.borrow())
                };
                if next == 0 {
                    return Ok(());
                }
                if let Some(&new_next) = relocation.get(&next) {
                    touch(id)?;
                    let page_ref = self.pager().acquire(id)?;
                    overflow::set_next_page_id(&mut page_ref.borrow_mut(), new_next);
                }
                self.remap_references(touch, next, PageKind::Overflow, relocation)
            }
            PageKind::External => {
                let meta = self.meta(true);
                let (mut cells, next_id, prev_id) = self.collect_cells(id, &meta)?;
                let mut changed = false;
                for raw in cells.iter_mut() {
                    let parsed = cell::parse_cell(&meta, raw)?;
                    if let Some(head) = parsed.overflow_head {
                        if let Some(&new_head) = relocation.get(&head) {
                            let off = parsed.footprint - cell::OVERFLOW_ID_SIZE;
                            write_u64(raw, off, new_head);
                            changed = true;
                        }
                        self.remap_references(touch, head, PageKind::Overflow, relocation)?;
                    }
                }
                if changed {
                    touch(id)?;
                    self.rewrite_node(id, &meta, &cells)?;
                }
                let new_next = relocation.get(&next_id).copied().filter(|_| next_id != 0);
                let new_prev = relocation.get(&prev_id).copied().filter(|_| prev_id != 0);
                if new_next.is_some() || new_prev.is_some() {
                    touch(id)?;
                    let page_ref = self.pager().acquire(id)?;
                    let mut page = page_ref.borrow_mut();
                    let mut node = Node::new(&mut page);
                    if let Some(n) = new_next {
                        node.set_next_id(n);
                    }
                    if let Some(p) = new_prev {
                        node.set_prev_id(p);
                    }
                }
                Ok(())
            }
            PageKind::Internal => {
                let meta = self.meta(false);
                let (mut cells, next_id, _prev_id) = self.collect_cells(id, &meta)?;
                let mut changed = false;
                let mut children = Vec::with_capacity(cells.len());
                for raw in cells.iter_mut() {
                    let parsed = cell::parse_cell(&meta, raw)?;
                    let child = parsed
                        .child_id
                        .ok_or_else(|| Error::corruption("internal cell missing its child id"))?;
                    if let Some(&new_child) = relocation.get(&child) {
                        write_u64(raw, 0, new_child);
                        changed = true;
                    }
                    children.push(child);
                }
                if changed {
                    touch(id)?;
                    self.rewrite_node(id, &meta, &cells)?;
                }
                for child in children {
                    let child_kind = if self.root_is_external_of(child)? {
                        PageKind::External
                    } else {
                        PageKind::Internal
                    };
                    self.remap_references(touch, child, child_kind, relocation)?;
                }
                if next_id != 0 {
                    if let Some(&new_next) = relocation.get(&next_id) {
                        touch(id)?;
                        let page_ref = self.pager().acquire(id)?;
                        Node::new(&mut page_ref.borrow_mut()).set_next_id(new_next);
                    }
                    let next_kind = if self.root_is_external_of(next_id)? {
                        PageKind::External
                    } else {
                        PageKind::Internal
                    };
                    self.remap_references(touch, next_id, next_kind, relocation)?;
                }
                Ok(())
            }
        }
    }

    /// Move `src`'s single in-bound reference to `dst`, which already holds a copy of
    /// `src`'s former content. Consults the pointer map first for an `O(1)` retarget;
    /// falls back to a full-tree walk for tree nodes and pages the map doesn't cover.
    fn relocate_one(&self, touch: &mut TouchFn, src: PageId, dst: PageId) -> Result<()> {
        let entry = self.get_pointer(src)?;
        match entry {
            Some((PointerType::OverflowHead, owner)) => {
                self.retarget_overflow_head_in_node(touch, owner, src, dst)?;
            }
            Some((PointerType::OverflowLink, prev)) => {
                touch(prev)?;
                let page_ref = self.pager().acquire(prev)?;
                overflow::set_next_page_id(&mut page_ref.borrow_mut(), dst);
            }
            _ => {
                let root_kind = if self.root_is_external_of(self.root_id())? {
                    PageKind::External
                } else {
                    PageKind::Internal
                };
                let mut relocation = HashMap::with_capacity(1);
                relocation.insert(src, dst);
                self.remap_references(touch, self.root_id(), root_kind, &relocation)?;
            }
        }
        if matches!(
            entry,
            Some((PointerType::OverflowHead, _)) | Some((PointerType::OverflowLink, _))
        ) {
            let next = {
                let page_ref = self.pager().acquire(dst)?;
                overflow::next_page_id(&page_ref.borrow())
            };
            if next != 0 {
                self.set_pointer(touch, next, PointerType::OverflowLink, dst)?;
            }
        }
        self.fixup_pointer_map_after_move(touch, src, dst)
    }

    /// Rewrite the one cell in `owner` whose overflow head is `old_head` to point at
    /// `new_head` instead.
    fn retarget_overflow_head_in_node(
        &self,
        touch: &mut TouchFn,
        owner: PageId,
        old_head: PageId,
        new_head: PageId,
    ) -> Result<()> {
        let meta = self.meta(true);
        let (mut cells, _next_id, _prev_id) = self.collect_cells(owner, &meta)?;
        let mut changed = false;
        for raw in cells.iter_mut() {
            let parsed = cell::parse_cell(&meta, raw)?;
            if parsed.overflow_head == Some(old_head) {
                let off = parsed.footprint - cell::OVERFLOW_ID_SIZE;
                write_u64(raw, off, new_head);
                changed = true;
                break;
            }
        }
        if changed {
            touch(owner)?;
            self.rewrite_node(owner, &meta, &cells)?;
        }
        Ok(())
    }

    /// `dst` now holds `src`'s former content at a new id: carry its own pointer-map
    /// entry over to `dst`'s slot, and retarget the entries of whatever it owns (an
    /// external node's overflow heads, an internal node's children and `next_id`) so
    /// they name `dst` rather than the stale `src`.
    fn fixup_pointer_map_after_move(&self, touch: &mut TouchFn, src: PageId, dst: PageId) -> Result<()> {
        if let Some((kind, back_pointer)) = self.get_pointer(src)? {
            self.set_pointer(touch, dst, kind, back_pointer)?;
            self.clear_pointer(touch, src)?;
        }
        if self.root_is_external_of(dst)? {
            let meta = self.meta(true);
            let (cells, _next_id, _prev_id) = self.collect_cells(dst, &meta)?;
            for raw in &cells {
                let parsed = cell::parse_cell(&meta, raw)?;
                if let Some(head) = parsed.overflow_head {
                    self.set_pointer(touch, head, PointerType::OverflowHead, dst)?;
                }
            }
        } else {
            let meta = self.meta(false);
            let (cells, next_id, _prev_id) = self.collect_cells(dst, &meta)?;
            for raw in &cells {
                let parsed = cell::parse_cell(&meta, raw)?;
                let child = parsed
                    .child_id
                    .ok_or_else(|| Error::corruption("internal cell missing its child id"))?;
                self.set_pointer(touch, child, PointerType::TreeNode, dst)?;
            }
            if next_id != 0 {
                self.set_pointer(touch, next_id, PointerType::TreeNode, dst)?;
            }
        }
        Ok(())
    }

    /// Splice `target` out of the free list, wherever it sits in the chain, and
    /// return it zeroed and pinned — like `allocate()`, but for a specific id rather
    /// than whatever's at the head. `Ok(None)` means `target` wasn't actually on the
    /// free list, which vacuum treats as a reason to stop rather than to panic.
    fn reclaim_free_page(&self, touch: &mut TouchFn, target: PageId) -> Result<Option<crate::pager::PageRef>> {
        if self.pager().free_list_head() == target {
            touch(target)?;
            return Ok(Some(self.pager().allocate()?));
        }
        let mut prev = self.pager().free_list_head();
        while prev != 0 {
            let next = {
                let page_ref = self.pager().acquire(prev)?;
                read_u64(page_ref.borrow().as_slice(), PAGE_LSN_SIZE)
            };
            if next == target {
                let target_next = {
                    let page_ref = self.pager().acquire(target)?;
                    read_u64(page_ref.borrow().as_slice(), PAGE_LSN_SIZE)
                };
                touch(prev)?;
                touch(target)?;
                {
                    let page_ref = self.pager().acquire(prev)?;
                    write_u64(page_ref.borrow_mut().as_mut_slice(), PAGE_LSN_SIZE, target_next);
                }
                let target_ref = self.pager().acquire(target)?;
                target_ref.borrow_mut().as_mut_slice().fill(0);
                return Ok(Some(target_ref));
            }
            prev = next;
        }
        Ok(None)
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
    fn vacuum_shrinks_file_after_bulk_erase() {
        let dir = TempDir::new("btree-vacuum").unwrap();
        let pager = fresh_tree(&dir, 256);
        let tree = BTree::create_fresh(&pager).unwrap();
        let mut noop = |_id| Ok(());
        let keys: Vec<String> = (0..400u32).map(|i| format!("key-{i:06}")).collect();
        for k in &keys {
            tree.insert(&mut noop, k.as_bytes(), b"payload").unwrap();
        }
        let grown_count = pager.page_count();
        for k in keys.iter().take(380) {
            tree.erase(&mut noop, k.as_bytes()).unwrap();
        }
        tree.vacuum(&mut noop).unwrap();
        assert!(pager.page_count() < grown_count);
        for k in keys.iter().skip(380) {
            assert_eq!(tree.get(k.as_bytes()).unwrap(), b"payload");
        }
    }

    #[test]
    fn vacuum_on_freshly_created_tree_is_a_no_op() {
        let dir = TempDir::new("btree-vacuum").unwrap();
        let pager = fresh_tree(&dir, 512);
        let tree = BTree::create_fresh(&pager).unwrap();
        let mut noop = |_id| Ok(());
        let before = pager.page_count();
        tree.vacuum(&mut noop).unwrap();
        assert_eq!(pager.page_count(), before);
    }
}
