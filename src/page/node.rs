//! Node header and slot directory (§3: Node pages).
//!
//! A node page (internal or external) is laid out as: the 34-byte node header, a slot
//! directory of 2-byte cell offsets, a gap, and a cell region growing downward from
//! the page's end. `Node` is a thin, borrowed view over a `Page` buffer that exposes
//! the header fields and slot directory; it does not itself decide cell contents —
//! that is `cell`'s job — mirroring the teacher's separation of `Page` (container) and
//! `Row` (payload codec).

use crate::error::{Error, Result};
use crate::page::{read_u16, read_u64, write_u16, write_u64, Page, PageId};

pub const NODE_HEADER_SIZE: usize = 34;
pub const SLOT_SIZE: usize = 2;

/// Conservative upper bound on a cell's fixed-size header fields (child id / varint
/// sizes / overflow id), used by the `local_size` policy (§3) so it never has to know
/// about a specific cell's actual encoded header length.
pub const CELL_HEADER_BOUND: usize = 20;

const OFF_FLAGS: usize = 8;
const OFF_NEXT_ID: usize = 9;
const OFF_PREV_ID: usize = 17;
const OFF_CELL_COUNT: usize = 25;
const OFF_CELL_START: usize = 27;
const OFF_FREE_START: usize = 29;
const OFF_FREE_TOTAL: usize = 31;
const OFF_FRAG_COUNT: usize = 33;

const FLAG_EXTERNAL: u8 = 0x01;

pub const SLOTS_OFFSET: usize = NODE_HEADER_SIZE;

/// `min_local`/`max_local` policy (§3), deterministic across writers/readers: a
/// fraction of usable header-free space, biased so large values always spill.
pub fn local_size_bounds(page_size: usize) -> (usize, usize) {
    let usable = page_size.saturating_sub(NODE_HEADER_SIZE);
    let min_local = (usable * 32 / 256).saturating_sub(CELL_HEADER_BOUND + SLOT_SIZE);
    let max_local = (usable * 64 / 256).saturating_sub(CELL_HEADER_BOUND + SLOT_SIZE);
    (min_local, max_local)
}

/// Per-node-type constants and cell codec entry points (§9: `NodeMeta` vtable).
/// Chosen once at node load time; callers never branch on node type to decide memory
/// layout.
#[derive(Clone, Copy)]
pub struct NodeMeta {
    pub is_external: bool,
    pub min_local: usize,
    pub max_local: usize,
}

impl NodeMeta {
    pub fn for_node(page_size: usize, is_external: bool) -> Self {
        let (min_local, max_local) = local_size_bounds(page_size);
        Self {
            is_external,
            min_local,
            max_local,
        }
    }
}

/// Read-only accessors that work from a shared `&Page` borrow, for the common case of
/// descending the tree without intending to mutate anything (search, cursor walk).
/// `Node` itself always needs `&mut Page` even for getters, since it's built as one
/// type covering both read and write; these free functions avoid forcing a caller who
/// only has a `Ref<Page>` to take out a mutable borrow just to call `cell_count()`.
pub fn is_external_of(page: &Page) -> bool {
    page.as_slice()[OFF_FLAGS] & FLAG_EXTERNAL != 0
}

pub fn next_id_of(page: &Page) -> PageId {
    read_u64(page.as_slice(), OFF_NEXT_ID)
}

pub fn prev_id_of(page: &Page) -> PageId {
    read_u64(page.as_slice(), OFF_PREV_ID)
}

pub fn cell_count_of(page: &Page) -> u16 {
    read_u16(page.as_slice(), OFF_CELL_COUNT)
}

pub fn slot_of(page: &Page, index: usize) -> u16 {
    read_u16(page.as_slice(), SLOTS_OFFSET + index * SLOT_SIZE)
}

/// Bytes neither occupied by a live cell nor the slot directory: the gap plus the
/// free-block list total (§4.1). Used by erase's underflow check, which only needs to
/// read this, not mutate the page.
pub fn usable_space_of(page: &Page) -> usize {
    let cell_start = read_u16(page.as_slice(), OFF_CELL_START) as usize;
    let cell_count = cell_count_of(page) as usize;
    let slots_end = SLOTS_OFFSET + cell_count * SLOT_SIZE;
    let gap = cell_start.saturating_sub(slots_end);
    let free_total = read_u16(page.as_slice(), OFF_FREE_TOTAL) as usize;
    gap + free_total
}

/// Borrowed view over a node page's header and slot directory.
pub struct Node<'a> {
    page: &'a mut Page,
}

impl<'a> Node<'a> {
    pub fn new(page: &'a mut Page) -> Self {
        Self { page }
    }

    pub fn id(&self) -> PageId {
        self.page.id
    }

    pub fn page_size(&self) -> usize {
        self.page.len()
    }

    pub fn init(&mut self, is_external: bool) {
        let buf = self.page.as_mut_slice();
        buf[NODE_HEADER_SIZE..].fill(0);
        buf[OFF_FLAGS] = if is_external { FLAG_EXTERNAL } else { 0 };
        write_u64(buf, OFF_NEXT_ID, 0);
        write_u64(buf, OFF_PREV_ID, 0);
        write_u16(buf, OFF_CELL_COUNT, 0);
        write_u16(buf, OFF_CELL_START, self.page_size() as u16);
        write_u16(buf, OFF_FREE_START, 0);
        write_u16(buf, OFF_FREE_TOTAL, 0);
        buf[OFF_FRAG_COUNT] = 0;
    }

    pub fn is_external(&self) -> bool {
        self.page.as_slice()[OFF_FLAGS] & FLAG_EXTERNAL != 0
    }

    pub fn next_id(&self) -> PageId {
        read_u64(self.page.as_slice(), OFF_NEXT_ID)
    }

    pub fn set_next_id(&mut self, id: PageId) {
        write_u64(self.page.as_mut_slice(), OFF_NEXT_ID, id);
    }

    pub fn prev_id(&self) -> PageId {
        read_u64(self.page.as_slice(), OFF_PREV_ID)
    }

    pub fn set_prev_id(&mut self, id: PageId) {
        write_u64(self.page.as_mut_slice(), OFF_PREV_ID, id);
    }

    pub fn cell_count(&self) -> u16 {
        read_u16(self.page.as_slice(), OFF_CELL_COUNT)
    }

    pub fn set_cell_count(&mut self, n: u16) {
        write_u16(self.page.as_mut_slice(), OFF_CELL_COUNT, n);
    }

    pub fn cell_start(&self) -> u16 {
        read_u16(self.page.as_slice(), OFF_CELL_START)
    }

    pub fn set_cell_start(&mut self, v: u16) {
        write_u16(self.page.as_mut_slice(), OFF_CELL_START, v);
    }

    pub fn free_start(&self) -> u16 {
        read_u16(self.page.as_slice(), OFF_FREE_START)
    }

    pub fn set_free_start(&mut self, v: u16) {
        write_u16(self.page.as_mut_slice(), OFF_FREE_START, v);
    }

    pub fn free_total(&self) -> u16 {
        read_u16(self.page.as_slice(), OFF_FREE_TOTAL)
    }

    pub fn set_free_total(&mut self, v: u16) {
        write_u16(self.page.as_mut_slice(), OFF_FREE_TOTAL, v);
    }

    pub fn frag_count(&self) -> u8 {
        self.page.as_slice()[OFF_FRAG_COUNT]
    }

    pub fn set_frag_count(&mut self, v: u8) {
        self.page.as_mut_slice()[OFF_FRAG_COUNT] = v;
    }

    pub fn slots_end(&self) -> usize {
        SLOTS_OFFSET + self.cell_count() as usize * SLOT_SIZE
    }

    pub fn gap_size(&self) -> usize {
        self.cell_start() as usize - self.slots_end()
    }

    pub fn usable_space(&self) -> usize {
        self.free_total() as usize + self.gap_size()
    }

    pub fn slot(&self, index: usize) -> u16 {
        read_u16(self.page.as_slice(), SLOTS_OFFSET + index * SLOT_SIZE)
    }

    pub fn set_slot(&mut self, index: usize, offset: u16) {
        write_u16(self.page.as_mut_slice(), SLOTS_OFFSET + index * SLOT_SIZE, offset);
    }

    /// Insert a slot at `index`, shifting subsequent slots right.
    pub fn insert_slot(&mut self, index: usize, offset: u16) {
        let count = self.cell_count() as usize;
        for i in (index..count).rev() {
            let v = self.slot(i);
            self.set_slot(i + 1, v);
        }
        self.set_slot(index, offset);
        self.set_cell_count(count as u16 + 1);
    }

    /// Remove the slot at `index`, shifting subsequent slots left.
    pub fn remove_slot(&mut self, index: usize) -> u16 {
        let count = self.cell_count() as usize;
        let removed = self.slot(index);
        for i in index..count - 1 {
            let v = self.slot(i + 1);
            self.set_slot(i, v);
        }
        self.set_cell_count(count as u16 - 1);
        removed
    }

    pub fn cell_bytes(&self, offset: usize, len: usize) -> &[u8] {
        &self.page.as_slice()[offset..offset + len]
    }

    pub fn cell_bytes_mut(&mut self, offset: usize, len: usize) -> &mut [u8] {
        &mut self.page.as_mut_slice()[offset..offset + len]
    }

    pub fn raw(&self) -> &[u8] {
        self.page.as_slice()
    }

    pub fn raw_mut(&mut self) -> &mut [u8] {
        self.page.as_mut_slice()
    }

    pub fn validate(&self) -> Result<()> {
        if (self.cell_start() as usize) < self.slots_end() {
            return Err(Error::corruption("node cell_start overlaps slot directory"));
        }
        Ok(())
    }
}
