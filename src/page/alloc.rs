//! Intra-node free-block allocator (§4.1).
//!
//! Manages cell placement inside a single node page: `allocate` first tries the gap
//! between the slot directory and the cell region, then falls back to a singly linked
//! free-block list (first-fit); `free` either returns a block to that list or, for
//! scraps under 4 bytes, counts it as wasted "fragment" space that only
//! `defragment` can reclaim. This mirrors the teacher's explicit, no-merge free list
//! (§9: no in-place coalescing — the tree relies on occasional defragmentation rather
//! than eagerly compacting every free).

use crate::page::node::Node;
use crate::page::{read_u16, write_u16};

/// Free blocks are at least this large; anything smaller is a fragment, tracked only
/// by count/byte-total in the node header, never linked.
pub const MIN_FREE_BLOCK: usize = 4;

/// Try the gap first, then the free-block list (first-fit). Returns 0 if neither has
/// room; the caller (insert/split-resolution, §4.5) treats that as "this node is full"
/// and falls back to an in-RAM overflow cell.
pub fn allocate(node: &mut Node, size: usize) -> usize {
    debug_assert!(size > 0);

    let gap = node.gap_size();
    if gap >= size {
        let new_start = node.cell_start() as usize - size;
        node.set_cell_start(new_start as u16);
        return new_start;
    }

    let mut prev: Option<usize> = None;
    let mut cur = node.free_start() as usize;
    while cur != 0 {
        let (next, block_size) = read_block(node, cur);
        if block_size >= size {
            unlink(node, prev, next);
            let remainder = block_size - size;
            if remainder == 0 {
                node.set_free_total(node.free_total() - block_size as u16);
            } else if remainder < MIN_FREE_BLOCK {
                node.set_free_total(node.free_total() - block_size as u16);
                add_fragment(node, remainder);
            } else {
                node.set_free_total(node.free_total() - size as u16);
                push_block(node, cur + size, remainder);
            }
            return cur;
        }
        prev = Some(cur);
        cur = next;
    }
    0
}

/// Release `size` bytes at `offset`. Blocks `< MIN_FREE_BLOCK` become fragments;
/// everything else is pushed onto the free-block list head. No in-place merge with
/// adjacent blocks (§4.1) — callers that care about tight packing call `defragment`.
pub fn free(node: &mut Node, offset: usize, size: usize) {
    if size < MIN_FREE_BLOCK {
        add_fragment(node, size);
        return;
    }
    push_block(node, offset, size);
}

/// Rewrite the cell region contiguously in slot order, packing all live cells at the
/// page end, clearing the free-block list and fragment count. `cell_size` computes a
/// cell's footprint in bytes given its raw header bytes (injected so this module
/// doesn't need to know cell internals — §9's `NodeMeta` vtable). `skip_index`, when
/// set, omits that slot's cell from the rewrite (used right before it is overwritten
/// by a new, larger payload during insert — §4.1).
pub fn defragment(node: &mut Node, skip_index: Option<usize>, cell_size: impl Fn(&[u8]) -> usize) {
    let count = node.cell_count() as usize;
    let page_size = node.page_size();
    let mut scratch = vec![0u8; page_size];
    let mut write_at = page_size;

    for i in 0..count {
        if Some(i) == skip_index {
            node.set_slot(i, 0);
            continue;
        }
        let offset = node.slot(i) as usize;
        let len = cell_size(node.cell_bytes(offset, page_size - offset));
        write_at -= len;
        scratch[write_at..write_at + len].copy_from_slice(node.cell_bytes(offset, len));
        node.set_slot(i, write_at as u16);
    }

    node.raw_mut()[write_at..page_size].copy_from_slice(&scratch[write_at..page_size]);
    node.set_cell_start(write_at as u16);
    node.set_free_start(0);
    node.set_free_total(0);
    node.set_frag_count(0);
}

fn add_fragment(node: &mut Node, size: usize) {
    let total = node.frag_count() as usize + size;
    if total > u8::MAX as usize {
        node.set_frag_count(u8::MAX);
    } else {
        node.set_frag_count(total as u8);
    }
}

fn read_block(node: &Node, offset: usize) -> (usize, usize) {
    let buf = node.raw();
    (read_u16(buf, offset) as usize, read_u16(buf, offset + 2) as usize)
}

fn write_block(node: &mut Node, offset: usize, next: usize, size: usize) {
    let buf = node.raw_mut();
    write_u16(buf, offset, next as u16);
    write_u16(buf, offset + 2, size as u16);
}

fn push_block(node: &mut Node, offset: usize, size: usize) {
    let head = node.free_start() as usize;
    write_block(node, offset, head, size);
    node.set_free_start(offset as u16);
    node.set_free_total(node.free_total() + size as u16);
}

fn unlink(node: &mut Node, prev: Option<usize>, next: usize) {
    match prev {
        Some(p) => {
            let (_, size) = read_block(node, p);
            write_block(node, p, next, size);
        }
        None => node.set_free_start(next as u16),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::Page;

    fn fresh_node(page_size: usize) -> Page {
        let mut page = Page::new(1, page_size);
        Node::new(&mut page).init(true);
        page
    }

    #[test]
    fn allocate_from_gap() {
        let mut page = fresh_node(512);
        let mut node = Node::new(&mut page);
        let off = allocate(&mut node, 20);
        assert_eq!(off, 512 - 20);
        assert_eq!(node.cell_start(), 512 - 20);
    }

    #[test]
    fn free_and_reuse_exact_fit() {
        let mut page = fresh_node(512);
        let mut node = Node::new(&mut page);
        let a = allocate(&mut node, 20);
        let b = allocate(&mut node, 30);
        free(&mut node, a, 20);
        let c = allocate(&mut node, 20);
        assert_eq!(c, a);
        assert!(b != a);
    }

    #[test]
    fn free_small_becomes_fragment() {
        let mut page = fresh_node(512);
        let mut node = Node::new(&mut page);
        let a = allocate(&mut node, 10);
        free(&mut node, a, 3);
        assert_eq!(node.frag_count(), 3);
        assert_eq!(node.free_total(), 0);
    }

    #[test]
    fn defragment_packs_live_cells() {
        let mut page = fresh_node(512);
        let mut node = Node::new(&mut page);
        let a = allocate(&mut node, 10);
        let _b = allocate(&mut node, 10);
        node.insert_slot(0, a as u16);
        free(&mut node, a, 10);
        // one live slot remains logically invalid here; exercise defragment with a
        // trivial fixed-size cell function instead.
        node.remove_slot(0);
        let c = allocate(&mut node, 5);
        node.insert_slot(0, c as u16);
        defragment(&mut node, None, |_| 5);
        assert_eq!(node.free_total(), 0);
        assert_eq!(node.frag_count(), 0);
    }
}
