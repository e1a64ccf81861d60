//! Write-ahead log (§4.4): segmented, block-framed, append-only.
//!
//! Submodules: `record` (frame + payload codec), `writer` (append/flush/rotate),
//! `reader` (forward/backward segment iteration with fragment reassembly).

pub mod reader;
pub mod record;
pub mod writer;

pub use crate::page::{Lsn, NO_LSN};

/// Default block size when the caller doesn't override it — matches the data page
/// size so a block and a page are interchangeable units of I/O.
pub const DEFAULT_BLOCK_SIZE: usize = 8192;

/// Segment files roll over past this many bytes, only at a block boundary (§4.4).
pub const DEFAULT_SEGMENT_LIMIT: u64 = 16 * 1024 * 1024;

pub fn segment_file_name(prefix: &str, segment_no: u64) -> String {
    format!("{prefix}-{segment_no:020}.wal")
}

pub fn parse_segment_no(prefix: &str, file_name: &str) -> Option<u64> {
    let stem = file_name.strip_prefix(prefix)?.strip_prefix('-')?;
    let digits = stem.strip_suffix(".wal")?;
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_name_roundtrip() {
        let name = segment_file_name("calico", 42);
        assert_eq!(parse_segment_no("calico", &name), Some(42));
    }
}
