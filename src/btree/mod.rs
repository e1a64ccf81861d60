//! Ordered map built on the `Pager` (§4.5).
//!
//! Nodes carry no parent pointer (§9: the 34-byte wire header has no such field); a
//! traversal keeps the path of ancestor ids it descended through in a `Vec`, and
//! split/merge propagation walks that path back up rather than chasing a stored
//! back-pointer or re-searching from the root for an anchor key. Submodules: `insert`
//! (split-resolution), `erase` (merge/rotate), `cursor` (ordered iteration), `vacuum`
//! (pointer-map-page-aware compaction).

pub mod cursor;
pub mod erase;
pub mod insert;
pub mod vacuum;

use crate::error::{Error, Result};
use crate::page::cell::{self, ParsedCell};
use crate::page::node::{self, Node, NodeMeta};
use crate::page::{overflow, pointer_map, Page, PageId, PointerType};
use crate::pager::{PageRef, Pager};

/// The root page is fixed at creation time and never moves: split pushes the root's
/// contents down into a new child and converts the root in place to internal; merge
/// of a single-child root collapses the child back up into it (§4.5).
pub const ROOT_TREE_PAGE_ID: PageId = 3;
/// Page 2 is reserved for the first pointer-map page (§3's stride starts there); the
/// tree's root is the next page allocated after it.
pub const POINTER_MAP_PAGE_ID: PageId = 2;

/// Called once per page, right before its first mutation within the *caller's*
/// transaction, so the transaction driver can capture a before-image (§4.6). Batched
/// callers that aren't inside a transaction (e.g. `Options.use_wal == false`) pass a
/// no-op.
pub type TouchFn<'a> = dyn FnMut(PageId) -> Result<()> + 'a;

/// Where a key falls within an external node's slot directory: `idx` is the insertion
/// point (shifts existing slots right) when `exact` is false, or the matching slot
/// when `exact` is true — in which case `offset` is that slot's cell offset.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LeafLoc {
    pub id: PageId,
    pub idx: usize,
    pub exact: bool,
    pub offset: usize,
}

#[derive(Clone, Copy)]
pub struct BTree<'p> {
    pager: &'p Pager,
    root_id: PageId,
}

impl<'p> BTree<'p> {
    pub fn new(pager: &'p Pager, root_id: PageId) -> Self {
        Self { pager, root_id }
    }

    pub fn root_id(&self) -> PageId {
        self.root_id
    }

    pub(crate) fn pager(&self) -> &'p Pager {
        self.pager
    }

    pub(crate) fn meta(&self, is_external: bool) -> NodeMeta {
        NodeMeta::for_node(self.pager.page_size(), is_external)
    }

    fn is_external(&self, id: PageId) -> Result<bool> {
        let page_ref = self.pager.acquire(id)?;
        Ok(node::is_external_of(&page_ref.borrow()))
    }

    /// Initialize a freshly created database: page 2 as the (empty) pointer-map page,
    /// page 3 as the root, an empty external node with no parent entry (back_pointer
    /// 0 marks "this is the root").
    pub fn create_fresh(pager: &'p Pager) -> Result<Self> {
        let pm = pager.allocate()?;
        debug_assert_eq!(pm.id(), POINTER_MAP_PAGE_ID);
        let root = pager.allocate()?;
        debug_assert_eq!(root.id(), ROOT_TREE_PAGE_ID);
        Node::new(&mut root.borrow_mut()).init(true);
        let tree = Self::new(pager, ROOT_TREE_PAGE_ID);
        let mut noop = |_: PageId| Ok(());
        tree.set_pointer(&mut noop, ROOT_TREE_PAGE_ID, PointerType::TreeNode, 0)?;
        Ok(tree)
    }

    /// Record (or correct) `page_id`'s pointer-map entry. A no-op for any page beyond
    /// the single map page this implementation maintains (see `page::pointer_map`).
    pub(crate) fn set_pointer(&self, touch: &mut TouchFn, page_id: PageId, kind: PointerType, back_pointer: PageId) -> Result<()> {
        let Some(index) = pointer_map::location_of(page_id, POINTER_MAP_PAGE_ID, self.pager.page_size()) else {
            return Ok(());
        };
        touch(POINTER_MAP_PAGE_ID)?;
        let page_ref = self.pager.acquire(POINTER_MAP_PAGE_ID)?;
        pointer_map::write_entry(&mut page_ref.borrow_mut(), index, kind, back_pointer);
        Ok(())
    }

    pub(crate) fn get_pointer(&self, page_id: PageId) -> Result<Option<(PointerType, PageId)>> {
        let Some(index) = pointer_map::location_of(page_id, POINTER_MAP_PAGE_ID, self.pager.page_size()) else {
            return Ok(None);
        };
        let page_ref = self.pager.acquire(POINTER_MAP_PAGE_ID)?;
        pointer_map::read_entry(&page_ref.borrow(), index)
    }

    pub(crate) fn clear_pointer(&self, touch: &mut TouchFn, page_id: PageId) -> Result<()> {
        let Some(index) = pointer_map::location_of(page_id, POINTER_MAP_PAGE_ID, self.pager.page_size()) else {
            return Ok(());
        };
        touch(POINTER_MAP_PAGE_ID)?;
        let page_ref = self.pager.acquire(POINTER_MAP_PAGE_ID)?;
        pointer_map::clear_entry(&mut page_ref.borrow_mut(), index);
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        let (_, leaf) = self.descend_read(key)?;
        if !leaf.exact {
            return Err(Error::NotFound);
        }
        let page_ref = self.pager.acquire(leaf.id)?;
        let page = page_ref.borrow();
        let meta = self.meta(true);
        let (_, value) = read_cell_kv(self.pager, &meta, &page.as_slice()[leaf.offset..])?;
        Ok(value)
    }

    /// Descend from the root to the external node that would contain `key`.
    /// Returns the descent path (root-first) and the leaf location.
    pub(crate) fn descend_read(&self, key: &[u8]) -> Result<(Vec<PageId>, LeafLoc)> {
        let mut path = Vec::new();
        let mut cur = self.root_id;
        loop {
            path.push(cur);
            let page_ref = self.pager.acquire(cur)?;
            let page = page_ref.borrow();
            let is_ext = node::is_external_of(&page);
            let meta = self.meta(is_ext);
            let count = node::cell_count_of(&page) as usize;
            let (idx, exact) = find_slot(self.pager, &page, &meta, count, key)?;
            if is_ext {
                let offset = if idx < count {
                    node::slot_of(&page, idx) as usize
                } else {
                    0
                };
                return Ok((
                    path,
                    LeafLoc {
                        id: cur,
                        idx,
                        exact: exact && idx < count,
                        offset,
                    },
                ));
            }
            let next = if idx < count {
                let offset = node::slot_of(&page, idx) as usize;
                let parsed = cell::parse_cell(&meta, &page.as_slice()[offset..])?;
                if exact {
                    // exact match on an internal separator: its right child holds
                    // keys >= it, i.e. the next slot's left child (or next_id).
                    child_right_of(&page, &meta, idx, count)?
                } else {
                    parsed
                        .child_id
                        .ok_or_else(|| Error::corruption("internal cell missing its child id"))?
                }
            } else {
                node::next_id_of(&page)
            };
            cur = next;
        }
    }
}

/// Binary search a node's slot directory for the first key `>= target`; `(index,
/// exact)` with `index == count` meaning "greater than every key present".
pub(crate) fn find_slot(
    pager: &Pager,
    page: &Page,
    meta: &NodeMeta,
    count: usize,
    target: &[u8],
) -> Result<(usize, bool)> {
    let mut lo = 0usize;
    let mut hi = count;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let offset = node::slot_of(page, mid) as usize;
        let key = read_cell_key(pager, meta, &page.as_slice()[offset..])?;
        match key.as_slice().cmp(target) {
            std::cmp::Ordering::Less => lo = mid + 1,
            std::cmp::Ordering::Equal => return Ok((mid, true)),
            std::cmp::Ordering::Greater => hi = mid,
        }
    }
    Ok((lo, false))
}

fn child_right_of(page: &Page, meta: &NodeMeta, idx: usize, count: usize) -> Result<PageId> {
    if idx + 1 < count {
        let offset = node::slot_of(page, idx + 1) as usize;
        let parsed = cell::parse_cell(meta, &page.as_slice()[offset..])?;
        parsed
            .child_id
            .ok_or_else(|| Error::corruption("internal cell missing its child id"))
    } else {
        Ok(node::next_id_of(page))
    }
}

/// Full key bytes for the cell at `raw`, following its overflow chain for the tail end
/// of an oversized key if needed.
pub(crate) fn read_cell_key(pager: &Pager, meta: &NodeMeta, raw: &[u8]) -> Result<Vec<u8>> {
    let parsed = cell::parse_cell(meta, raw)?;
    let mut key = cell::local_key_bytes(&parsed, raw).to_vec();
    if parsed.key_size > key.len() {
        if let Some(head) = parsed.overflow_head {
            let need = parsed.key_size - key.len();
            let tail = read_chain(pager, head, need)?;
            key.extend_from_slice(&tail);
        }
    }
    Ok(key)
}

/// Full `(key, value)` for an external cell at `raw`, following the overflow chain for
/// whatever didn't fit locally.
pub(crate) fn read_cell_kv(pager: &Pager, meta: &NodeMeta, raw: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    let parsed = cell::parse_cell(meta, raw)?;
    let mut key = cell::local_key_bytes(&parsed, raw).to_vec();
    let mut value = cell::local_value_bytes(&parsed, raw).to_vec();
    if let Some(head) = parsed.overflow_head {
        let remaining = read_chain(pager, head, parsed.overflow_payload_size())?;
        let key_tail = parsed.key_size - key.len();
        key.extend_from_slice(&remaining[..key_tail]);
        value.extend_from_slice(&remaining[key_tail..]);
    }
    Ok((key, value))
}

fn read_chain(pager: &Pager, head: PageId, total_len: usize) -> Result<Vec<u8>> {
    overflow::read_chain(head, total_len, |id| {
        pager.acquire(id).map(|p| p.borrow().clone())
    })
}

impl<'p> BTree<'p> {
    /// Write `data` into a freshly allocated overflow chain owned by `owner` (the node
    /// page whose cell will store the head id), returning the head page id. Every
    /// page but the last is pinned only transiently through `touch`/allocate; each
    /// page's pointer-map entry is recorded as it's written (§3).
    pub(crate) fn write_chain(&self, touch: &mut TouchFn, owner: PageId, data: &[u8]) -> Result<PageId> {
        let page_size = self.pager.page_size();
        let chunks: Vec<Vec<u8>> = overflow::chunk(data, page_size)
            .into_iter()
            .map(|c| c.to_vec())
            .collect();
        let mut refs: Vec<PageRef> = Vec::with_capacity(chunks.len());
        for _ in &chunks {
            refs.push(self.pager.allocate()?);
        }
        for (i, chunk) in chunks.iter().enumerate() {
            touch(refs[i].id())?;
            let next = if i + 1 < refs.len() { refs[i + 1].id() } else { 0 };
            {
                let mut page = refs[i].borrow_mut();
                overflow::set_next_page_id(&mut page, next);
                overflow::set_payload(&mut page, chunk);
            }
            let (kind, back_pointer) = if i == 0 {
                (PointerType::OverflowHead, owner)
            } else {
                (PointerType::OverflowLink, refs[i - 1].id())
            };
            self.set_pointer(touch, refs[i].id(), kind, back_pointer)?;
        }
        Ok(refs.first().map(|r| r.id()).unwrap_or(0))
    }

    /// Release every page in an overflow chain back to the free list.
    pub(crate) fn free_chain(&self, touch: &mut TouchFn, head: PageId) -> Result<()> {
        let mut cur = head;
        while cur != 0 {
            let next = {
                let page_ref = self.pager.acquire(cur)?;
                overflow::next_page_id(&page_ref.borrow())
            };
            touch(cur)?;
            self.clear_pointer(touch, cur)?;
            self.pager.free_page(cur)?;
            cur = next;
        }
        Ok(())
    }

    /// Release a cell's overflow chain (if any) given its raw bytes.
    pub(crate) fn free_cell_overflow(&self, touch: &mut TouchFn, meta: &NodeMeta, raw: &[u8]) -> Result<()> {
        let parsed: ParsedCell = cell::parse_cell(meta, raw)?;
        if let Some(head) = parsed.overflow_head {
            self.free_chain(touch, head)?;
        }
        Ok(())
    }
}
