//! Overflow chain pages (§3, §4.2).
//!
//! A cell's payload that doesn't fit in `local_size` spills into a chain of overflow
//! pages: each page carries the usual 8-byte `page_lsn` prefix, an 8-byte
//! `next_page_id` (0 terminates the chain), and the rest of the page is raw payload
//! bytes. Reading or writing a chain is a straight-line walk — the B+-tree only ever
//! needs "give me N bytes starting here" or "store these N bytes starting here", never
//! random access into the middle of a chain.

use crate::page::{read_u64, write_u64, Page, PageId, PAGE_LSN_SIZE};

/// Offset of the `next_page_id` field, right after the page-lsn prefix.
pub const NEXT_ID_OFFSET: usize = PAGE_LSN_SIZE;
/// Offset where payload bytes begin on every overflow page.
pub const PAYLOAD_OFFSET: usize = NEXT_ID_OFFSET + 8;

pub fn payload_capacity(page_size: usize) -> usize {
    page_size - PAYLOAD_OFFSET
}

pub fn next_page_id(page: &Page) -> PageId {
    read_u64(page.as_slice(), NEXT_ID_OFFSET)
}

pub fn set_next_page_id(page: &mut Page, id: PageId) {
    write_u64(page.as_mut_slice(), NEXT_ID_OFFSET, id);
}

pub fn payload(page: &Page) -> &[u8] {
    &page.as_slice()[PAYLOAD_OFFSET..]
}

/// Write `data` (assumed to be exactly `payload_capacity` bytes, the caller pads the
/// final page's tail) into this overflow page's payload region.
pub fn set_payload(page: &mut Page, data: &[u8]) {
    let cap = payload_capacity(page.len());
    let n = data.len().min(cap);
    page.as_mut_slice()[PAYLOAD_OFFSET..PAYLOAD_OFFSET + n].copy_from_slice(&data[..n]);
}

/// Split `data` into the per-page payload chunks a chain starting at `page_size` would
/// need, in order. The caller allocates one page per chunk via the pager/free-list and
/// links them with `set_next_page_id`.
pub fn chunk(data: &[u8], page_size: usize) -> Vec<&[u8]> {
    let cap = payload_capacity(page_size);
    if data.is_empty() {
        return Vec::new();
    }
    data.chunks(cap).collect()
}

/// Read exactly `total_len` bytes out of a chain given a `read_page` callback that
/// fetches the page for an id (the pager owns actual I/O and caching; this module only
/// knows the chain's layout).
pub fn read_chain<E>(
    head: PageId,
    total_len: usize,
    mut read_page: impl FnMut(PageId) -> Result<Page, E>,
) -> Result<Vec<u8>, E> {
    let mut out = Vec::with_capacity(total_len);
    let mut cur = head;
    while out.len() < total_len && cur != 0 {
        let page = read_page(cur)?;
        let remaining = total_len - out.len();
        let take = remaining.min(payload_capacity(page.len()));
        out.extend_from_slice(&payload(&page)[..take]);
        cur = next_page_id(&page);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::ROOT_PAGE_ID;

    #[test]
    fn chunk_splits_by_capacity() {
        let page_size = 128;
        let cap = payload_capacity(page_size);
        let data = vec![7u8; cap * 2 + 3];
        let chunks = chunk(&data, page_size);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), cap);
        assert_eq!(chunks[2].len(), 3);
    }

    #[test]
    fn single_page_chain_roundtrip() {
        let page_size = 128;
        let mut page = Page::new(ROOT_PAGE_ID + 1, page_size);
        set_next_page_id(&mut page, 0);
        let data = vec![9u8; payload_capacity(page_size)];
        set_payload(&mut page, &data);
        let read: Result<Vec<u8>, ()> =
            read_chain(page.id, data.len(), |_| Ok(page.clone()));
        assert_eq!(read.unwrap(), data);
    }
}
