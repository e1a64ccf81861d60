//! Pointer-map page layout (§3): fixed-size `{type, back_pointer}` entries, one per
//! non-map page in the map's stride. Vacuum consults these to find a relocated page's
//! referrer directly instead of searching for it.
//!
//! This implementation maintains a single map page (`POINTER_MAP_PAGE_ID`, §4's
//! reserved page 2) covering the first `capacity(page_size)` data pages after it. A
//! database that grows past that stride keeps working — pages beyond it simply have no
//! entry, and callers fall back to other means of locating their referrer — but only
//! the first stride gets the `O(1)` relocation win. See DESIGN.md.

use crate::error::Result;
use crate::page::{read_u64, write_u64, Page, PageId, PointerType, PAGE_LSN_SIZE};

/// 1-byte type tag + 8-byte back pointer.
const ENTRY_SIZE: usize = 9;

pub fn capacity(page_size: usize) -> usize {
    (page_size - PAGE_LSN_SIZE) / ENTRY_SIZE
}

/// Index of `page_id`'s entry within `map_page_id`'s stride, or `None` if `page_id`
/// isn't covered by this map page (it precedes it, is the map page itself, or falls
/// beyond its capacity).
pub fn location_of(page_id: PageId, map_page_id: PageId, page_size: usize) -> Option<usize> {
    if page_id <= map_page_id {
        return None;
    }
    let idx = (page_id - map_page_id - 1) as usize;
    if idx >= capacity(page_size) {
        return None;
    }
    Some(idx)
}

pub fn read_entry(page: &Page, index: usize) -> Result<Option<(PointerType, PageId)>> {
    let off = PAGE_LSN_SIZE + index * ENTRY_SIZE;
    let kind_byte = page.as_slice()[off];
    if kind_byte == 0 {
        return Ok(None);
    }
    let kind = PointerType::try_from(kind_byte)?;
    let back_pointer = read_u64(page.as_slice(), off + 1);
    Ok(Some((kind, back_pointer)))
}

pub fn write_entry(page: &mut Page, index: usize, kind: PointerType, back_pointer: PageId) {
    let off = PAGE_LSN_SIZE + index * ENTRY_SIZE;
    page.as_mut_slice()[off] = kind as u8;
    write_u64(page.as_mut_slice(), off + 1, back_pointer);
}

pub fn clear_entry(page: &mut Page, index: usize) {
    let off = PAGE_LSN_SIZE + index * ENTRY_SIZE;
    page.as_mut_slice()[off] = 0;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::ROOT_PAGE_ID;

    #[test]
    fn location_excludes_map_page_and_predecessors() {
        assert_eq!(location_of(ROOT_PAGE_ID, 2, 512), None);
        assert_eq!(location_of(2, 2, 512), None);
        assert_eq!(location_of(3, 2, 512), Some(0));
        assert_eq!(location_of(4, 2, 512), Some(1));
    }

    #[test]
    fn location_is_none_past_capacity() {
        let page_size = 64;
        let cap = capacity(page_size);
        let last_covered = 2 + cap as PageId;
        assert!(location_of(last_covered, 2, page_size).is_some());
        assert_eq!(location_of(last_covered + 1, 2, page_size), None);
    }

    #[test]
    fn entry_roundtrip() {
        let mut page = Page::new(2, 512);
        write_entry(&mut page, 0, PointerType::OverflowHead, 77);
        assert_eq!(read_entry(&page, 0).unwrap(), Some((PointerType::OverflowHead, 77)));
        clear_entry(&mut page, 0);
        assert_eq!(read_entry(&page, 0).unwrap(), None);
    }
}
