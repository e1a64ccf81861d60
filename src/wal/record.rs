//! WAL record framing and payload encoding (§4.4).
//!
//! Two layers: the **frame** (fixed 15-byte header + payload bytes, possibly one
//! fragment of a larger logical record) is what actually sits in a block on disk; the
//! **payload** (deltas / full image / commit) is what the frame carries once
//! reassembled. Frames are block-local; payloads are logical-record-local.

use crate::error::{Error, Result};
use crate::page::{read_u16, read_u64, write_u16, write_u64, PageId};
use crate::wal::Lsn;

/// `lsn(8) + crc32c(4) + kind(1) + payload_len(2)`.
pub const FRAME_HEADER_SIZE: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Full = 0,
    First = 1,
    Middle = 2,
    Last = 3,
}

impl TryFrom<u8> for FrameKind {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        Ok(match v {
            0 => FrameKind::Full,
            1 => FrameKind::First,
            2 => FrameKind::Middle,
            3 => FrameKind::Last,
            other => return Err(Error::corruption(format!("bad WAL frame kind {other}"))),
        })
    }
}

/// A decoded frame header plus a borrowed view of its payload bytes.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    pub lsn: Lsn,
    pub crc: u32,
    pub kind: FrameKind,
    pub payload: &'a [u8],
}

/// Write one frame (header + payload) into `out`, returning bytes written. `crc` is
/// the crc32c of the *whole logical record's payload*, not just this fragment's chunk
/// — every fragment of one logical record carries the same lsn and crc (§4.4), so the
/// reader verifies only after reassembling all fragments.
pub fn encode_frame(out: &mut Vec<u8>, lsn: Lsn, crc: u32, kind: FrameKind, payload: &[u8]) {
    let start = out.len();
    out.resize(start + FRAME_HEADER_SIZE, 0);
    write_u64(&mut out[start..], 0, lsn);
    write_u32_at(out, start + 8, crc);
    out[start + 12] = kind as u8;
    write_u16(&mut out[start..], 13, payload.len() as u16);
    out.extend_from_slice(payload);
}

fn write_u32_at(out: &mut [u8], off: usize, v: u32) {
    out[off..off + 4].copy_from_slice(&v.to_be_bytes());
}

fn read_u32_at(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes(buf[off..off + 4].try_into().unwrap())
}

/// Decode one frame starting at `buf[0..]`. Returns `None` when `lsn == 0`, the
/// end-of-log sentinel within a block (§4.4).
pub fn decode_frame(buf: &[u8]) -> Result<Option<(Frame<'_>, usize)>> {
    if buf.len() < FRAME_HEADER_SIZE {
        return Ok(None);
    }
    let lsn = read_u64(buf, 0);
    if lsn == 0 {
        return Ok(None);
    }
    let crc = read_u32_at(buf, 8);
    let kind = FrameKind::try_from(buf[12])?;
    let payload_len = read_u16(buf, 13) as usize;
    let total = FRAME_HEADER_SIZE + payload_len;
    if buf.len() < total {
        return Err(Error::corruption("WAL frame payload truncated"));
    }
    let payload = &buf[FRAME_HEADER_SIZE..total];
    Ok(Some((
        Frame {
            lsn,
            crc,
            kind,
            payload,
        },
        total,
    )))
}

/// Logical record payload kinds (§4.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Deltas {
        page_id: PageId,
        deltas: Vec<(u16, Vec<u8>)>,
    },
    FullImage {
        page_id: PageId,
        image: Vec<u8>,
    },
    Commit,
}

const KIND_DELTAS: u8 = 0xD0;
const KIND_FULL_IMAGE: u8 = 0xF0;
const KIND_COMMIT: u8 = 0xC0;

impl Payload {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Payload::Deltas { page_id, deltas } => {
                let mut out = Vec::with_capacity(1 + 8 + 2 + deltas.len() * 4);
                out.push(KIND_DELTAS);
                let mut tail = vec![0u8; 8 + 2];
                write_u64(&mut tail, 0, *page_id);
                write_u16(&mut tail, 8, deltas.len() as u16);
                out.extend_from_slice(&tail);
                for (offset, bytes) in deltas {
                    let mut hdr = [0u8; 4];
                    write_u16(&mut hdr, 0, *offset);
                    write_u16(&mut hdr, 2, bytes.len() as u16);
                    out.extend_from_slice(&hdr);
                    out.extend_from_slice(bytes);
                }
                out
            }
            Payload::FullImage { page_id, image } => {
                let mut out = Vec::with_capacity(1 + 8 + image.len());
                out.push(KIND_FULL_IMAGE);
                let mut head = [0u8; 8];
                write_u64(&mut head, 0, *page_id);
                out.extend_from_slice(&head);
                out.extend_from_slice(image);
                out
            }
            Payload::Commit => vec![KIND_COMMIT],
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let kind = *buf.first().ok_or_else(|| Error::corruption("empty WAL payload"))?;
        let body = &buf[1..];
        Ok(match kind {
            KIND_DELTAS => {
                if body.len() < 10 {
                    return Err(Error::corruption("truncated deltas record"));
                }
                let page_id = read_u64(body, 0);
                let count = read_u16(body, 8) as usize;
                let mut pos = 10;
                let mut deltas = Vec::with_capacity(count);
                for _ in 0..count {
                    if body.len() < pos + 4 {
                        return Err(Error::corruption("truncated delta entry"));
                    }
                    let offset = read_u16(body, pos);
                    let size = read_u16(body, pos + 2) as usize;
                    pos += 4;
                    if body.len() < pos + size {
                        return Err(Error::corruption("truncated delta payload"));
                    }
                    deltas.push((offset, body[pos..pos + size].to_vec()));
                    pos += size;
                }
                Payload::Deltas { page_id, deltas }
            }
            KIND_FULL_IMAGE => {
                if body.len() < 8 {
                    return Err(Error::corruption("truncated full-image record"));
                }
                let page_id = read_u64(body, 0);
                let image = body[8..].to_vec();
                Payload::FullImage { page_id, image }
            }
            KIND_COMMIT => Payload::Commit,
            other => return Err(Error::corruption(format!("unknown WAL payload kind {other:#x}"))),
        })
    }

    pub fn page_id(&self) -> Option<PageId> {
        match self {
            Payload::Deltas { page_id, .. } => Some(*page_id),
            Payload::FullImage { page_id, .. } => Some(*page_id),
            Payload::Commit => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrip() {
        let mut buf = Vec::new();
        let crc = crc32c::crc32c(b"payload");
        encode_frame(&mut buf, 42, crc, FrameKind::Full, b"payload");
        let (frame, consumed) = decode_frame(&buf).unwrap().unwrap();
        assert_eq!(frame.lsn, 42);
        assert_eq!(frame.crc, crc);
        assert_eq!(frame.kind, FrameKind::Full);
        assert_eq!(frame.payload, b"payload");
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn zero_lsn_is_sentinel() {
        let buf = vec![0u8; FRAME_HEADER_SIZE];
        assert!(decode_frame(&buf).unwrap().is_none());
    }

    #[test]
    fn deltas_roundtrip() {
        let payload = Payload::Deltas {
            page_id: 7,
            deltas: vec![(4, vec![1, 2, 3]), (100, vec![9])],
        };
        let encoded = payload.encode();
        let decoded = Payload::decode(&encoded).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn full_image_roundtrip() {
        let payload = Payload::FullImage {
            page_id: 3,
            image: vec![5u8; 64],
        };
        let decoded = Payload::decode(&payload.encode()).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn commit_roundtrip() {
        let decoded = Payload::decode(&Payload::Commit.encode()).unwrap();
        assert_eq!(decoded, Payload::Commit);
    }
}
