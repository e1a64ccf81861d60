//! Cell codec: external and internal cell layout (§4.2).
//!
//! Bit-exact across readers — these functions decide the on-disk byte layout, so every
//! implementation of this format must agree byte-for-byte. An external cell is
//! `varint key_size, varint value_size, local payload bytes, [overflow head]`; an
//! internal cell is `child PageId, varint key_size, local key bytes, [overflow head]`.
//! How many bytes are "local" vs. spilled to an overflow chain is never stored
//! explicitly — it's recomputed from `key_size`/`total_size` and `NodeMeta` by both
//! sides, per the `local_size` policy in §3.

use crate::error::{Error, Result};
use crate::page::node::NodeMeta;
use crate::page::{read_u64, write_u64, PageId};
use crate::varint;

/// Bytes a child `PageId` occupies at the front of an internal cell.
pub const CHILD_ID_SIZE: usize = 8;
/// Bytes an overflow-chain head `PageId` occupies at the tail of a spilled cell.
pub const OVERFLOW_ID_SIZE: usize = 8;

/// Result of parsing a cell's header in place (§4.2).
#[derive(Debug, Clone, Copy)]
pub struct ParsedCell {
    /// Offset, relative to the slice passed to `parse_cell`, of the key's first byte.
    pub key_ptr: usize,
    pub key_size: usize,
    /// Bytes of payload (key for internal cells, key+value for external) stored on
    /// this page, as opposed to spilled to an overflow chain.
    pub local_payload_size: usize,
    /// Logical payload size: `key_size` for internal cells, `key_size + value_size`
    /// for external cells.
    pub total_payload_size: usize,
    pub overflow_head: Option<PageId>,
    /// Left child id, for internal cells only.
    pub child_id: Option<PageId>,
    /// Total bytes this cell occupies on the page.
    pub footprint: usize,
}

impl ParsedCell {
    pub fn is_spilled(&self) -> bool {
        self.overflow_head.is_some()
    }

    pub fn overflow_payload_size(&self) -> usize {
        self.total_payload_size - self.local_payload_size
    }

    pub fn value_size(&self) -> usize {
        self.total_payload_size - self.key_size
    }
}

/// How many bytes of a `total_size`-byte payload (of which the first `key_size` bytes
/// are the key) stay local, per §3's policy: fits entirely under `max_local`, store it
/// all; otherwise store `max(min_local, key_size)` bytes — the key is never split
/// unless it alone exceeds `max_local`, in which case only `max_local` bytes of it
/// stay local and the rest (including the whole value) spills.
pub fn compute_local(meta: &NodeMeta, key_size: usize, total_size: usize) -> usize {
    if total_size <= meta.max_local {
        return total_size;
    }
    if key_size > meta.max_local {
        meta.max_local
    } else {
        meta.min_local.max(key_size).min(total_size)
    }
}

/// Total on-page footprint of the cell whose header starts at `raw[0..]`, without the
/// caller needing to separately track node type (§9: `NodeMeta` vtable).
pub fn cell_size_for(meta: &NodeMeta, raw: &[u8]) -> usize {
    parse_cell(meta, raw).map(|c| c.footprint).unwrap_or(0)
}

pub fn parse_cell(meta: &NodeMeta, raw: &[u8]) -> Result<ParsedCell> {
    if meta.is_external {
        parse_external(meta, raw)
    } else {
        parse_internal(meta, raw)
    }
}

fn parse_external(meta: &NodeMeta, raw: &[u8]) -> Result<ParsedCell> {
    let (key_size, n1) =
        varint::decode(raw).ok_or_else(|| Error::corruption("truncated cell key_size"))?;
    let (value_size, n2) = varint::decode(&raw[n1..])
        .ok_or_else(|| Error::corruption("truncated cell value_size"))?;
    let key_size = key_size as usize;
    let value_size = value_size as usize;
    let total = key_size + value_size;
    let header_len = n1 + n2;
    let local = compute_local(meta, key_size, total);
    let spilled = total > local;
    let mut footprint = header_len + local;
    let overflow_head = if spilled {
        let off = header_len + local;
        footprint += OVERFLOW_ID_SIZE;
        Some(read_u64(raw, off))
    } else {
        None
    };
    Ok(ParsedCell {
        key_ptr: header_len,
        key_size,
        local_payload_size: local,
        total_payload_size: total,
        overflow_head,
        child_id: None,
        footprint,
    })
}

fn parse_internal(meta: &NodeMeta, raw: &[u8]) -> Result<ParsedCell> {
    let child_id = read_u64(raw, 0);
    let (key_size, n1) = varint::decode(&raw[CHILD_ID_SIZE..])
        .ok_or_else(|| Error::corruption("truncated internal cell key_size"))?;
    let key_size = key_size as usize;
    let header_len = CHILD_ID_SIZE + n1;
    let local = compute_local(meta, key_size, key_size);
    let spilled = key_size > local;
    let mut footprint = header_len + local;
    let overflow_head = if spilled {
        let off = header_len + local;
        footprint += OVERFLOW_ID_SIZE;
        Some(read_u64(raw, off))
    } else {
        None
    };
    Ok(ParsedCell {
        key_ptr: header_len,
        key_size,
        local_payload_size: local,
        total_payload_size: key_size,
        overflow_head,
        child_id: Some(child_id),
        footprint,
    })
}

/// Full key bytes present on this page (i.e. `local_payload_size` bytes starting at
/// `key_ptr`, clamped to the key, never the spilled value tail).
pub fn local_key_bytes<'a>(cell: &ParsedCell, raw: &'a [u8]) -> &'a [u8] {
    let n = cell.key_size.min(cell.local_payload_size);
    &raw[cell.key_ptr..cell.key_ptr + n]
}

/// Local (on-page) value bytes of an external cell — empty if the whole value spilled.
pub fn local_value_bytes<'a>(cell: &ParsedCell, raw: &'a [u8]) -> &'a [u8] {
    let key_local = cell.key_size.min(cell.local_payload_size);
    let value_local = cell.local_payload_size - key_local;
    let start = cell.key_ptr + key_local;
    &raw[start..start + value_local]
}

/// Encode an external cell into `out` (which must already be sized to the footprint
/// `compute_local` implies). `local_bytes` is the concatenation of the locally-stored
/// key prefix and value prefix, in that order; `overflow_head`, when `Some`, is written
/// after it. Returns the number of bytes written.
pub fn emplace_external(
    out: &mut [u8],
    key_size: usize,
    value_size: usize,
    local_bytes: &[u8],
    overflow_head: Option<PageId>,
) -> usize {
    let mut header = Vec::with_capacity(varint::MAX_VARINT_LEN * 2);
    varint::encode(key_size as u64, &mut header);
    varint::encode(value_size as u64, &mut header);
    out[..header.len()].copy_from_slice(&header);
    let mut w = header.len();
    out[w..w + local_bytes.len()].copy_from_slice(local_bytes);
    w += local_bytes.len();
    if let Some(head) = overflow_head {
        write_u64(out, w, head);
        w += OVERFLOW_ID_SIZE;
    }
    w
}

/// Encode an internal (separator) cell into `out`. `local_key_bytes` is the on-page key
/// prefix; `overflow_head` carries the remainder when the key alone exceeds
/// `max_local`.
pub fn emplace_internal(
    out: &mut [u8],
    child_id: PageId,
    key_size: usize,
    local_key_bytes: &[u8],
    overflow_head: Option<PageId>,
) -> usize {
    write_u64(out, 0, child_id);
    let mut header = Vec::with_capacity(varint::MAX_VARINT_LEN);
    varint::encode(key_size as u64, &mut header);
    out[CHILD_ID_SIZE..CHILD_ID_SIZE + header.len()].copy_from_slice(&header);
    let mut w = CHILD_ID_SIZE + header.len();
    out[w..w + local_key_bytes.len()].copy_from_slice(local_key_bytes);
    w += local_key_bytes.len();
    if let Some(head) = overflow_head {
        write_u64(out, w, head);
        w += OVERFLOW_ID_SIZE;
    }
    w
}

/// Footprint an external cell with the given key/value sizes would occupy, before it
/// is written — used by insert to decide whether a node has room (§4.5).
pub fn external_footprint(meta: &NodeMeta, key_size: usize, value_size: usize) -> usize {
    let total = key_size + value_size;
    let header_len = varint::encoded_len(key_size as u64) + varint::encoded_len(value_size as u64);
    let local = compute_local(meta, key_size, total);
    header_len + local + if total > local { OVERFLOW_ID_SIZE } else { 0 }
}

/// Footprint an internal cell with the given key size would occupy.
pub fn internal_footprint(meta: &NodeMeta, key_size: usize) -> usize {
    let header_len = CHILD_ID_SIZE + varint::encoded_len(key_size as u64);
    let local = compute_local(meta, key_size, key_size);
    header_len + local + if key_size > local { OVERFLOW_ID_SIZE } else { 0 }
}

/// Build the bytes for an internal separator cell that replaces an external cell's key
/// as a parent's routing entry (§4.5's split and merge paths use this to promote a
/// leaf's leftmost key). The key must already be fully local to the source external
/// cell — promotion never re-chases an overflow chain, since separator keys are always
/// chosen to be short.
pub fn promote_cell(meta: &NodeMeta, key: &[u8], left_child_id: PageId) -> Result<Vec<u8>> {
    let key_size = key.len();
    let local = compute_local(meta, key_size, key_size);
    if local < key_size {
        return Err(Error::logic(
            "promote_cell requires a key short enough to stay fully local",
        ));
    }
    let mut out = vec![0u8; internal_footprint(meta, key_size)];
    emplace_internal(&mut out, left_child_id, key_size, key, None);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(page_size: usize, is_external: bool) -> NodeMeta {
        NodeMeta::for_node(page_size, is_external)
    }

    #[test]
    fn external_roundtrip_no_spill() {
        let m = meta(512, true);
        let key = b"hello";
        let value = b"world!";
        let size = external_footprint(&m, key.len(), value.len());
        let mut buf = vec![0u8; size];
        let mut local = Vec::new();
        local.extend_from_slice(key);
        local.extend_from_slice(value);
        emplace_external(&mut buf, key.len(), value.len(), &local, None);
        let parsed = parse_cell(&m, &buf).unwrap();
        assert_eq!(parsed.key_size, key.len());
        assert_eq!(parsed.total_payload_size, key.len() + value.len());
        assert!(!parsed.is_spilled());
        assert_eq!(local_key_bytes(&parsed, &buf), key);
        assert_eq!(local_value_bytes(&parsed, &buf), value);
        assert_eq!(parsed.footprint, size);
    }

    #[test]
    fn external_spills_large_value() {
        let m = meta(512, true);
        let key = b"k";
        let value_size = m.max_local + 500;
        let local_size = compute_local(&m, key.len(), key.len() + value_size);
        assert!(local_size < key.len() + value_size);
        let local: Vec<u8> = key
            .iter()
            .copied()
            .chain(std::iter::repeat(b'v').take(local_size - key.len()))
            .collect();
        let size = external_footprint(&m, key.len(), value_size);
        let mut buf = vec![0u8; size];
        emplace_external(&mut buf, key.len(), value_size, &local, Some(99));
        let parsed = parse_cell(&m, &buf).unwrap();
        assert!(parsed.is_spilled());
        assert_eq!(parsed.overflow_head, Some(99));
        assert_eq!(parsed.overflow_payload_size(), value_size - (local_size - key.len()));
    }

    #[test]
    fn internal_roundtrip() {
        let m = meta(512, false);
        let key = b"separator";
        let size = internal_footprint(&m, key.len());
        let mut buf = vec![0u8; size];
        emplace_internal(&mut buf, 42, key.len(), key, None);
        let parsed = parse_cell(&m, &buf).unwrap();
        assert_eq!(parsed.child_id, Some(42));
        assert_eq!(local_key_bytes(&parsed, &buf), key);
        assert_eq!(parsed.footprint, size);
    }

    #[test]
    fn promote_builds_separator() {
        let m = meta(512, false);
        let out = promote_cell(&m, b"sep", 7).unwrap();
        let parsed = parse_cell(&m, &out).unwrap();
        assert_eq!(parsed.child_id, Some(7));
        assert_eq!(local_key_bytes(&parsed, &out), b"sep");
    }
}
