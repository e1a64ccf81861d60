//! WAL writer (§4.4): assigns LSNs, frames records across blocks, rotates segments.

use std::path::PathBuf;
use std::sync::Arc;

use crate::env::{Env, Sink};
use crate::error::Result;
use crate::wal::record::{encode_frame, FrameKind, Payload, FRAME_HEADER_SIZE};
use crate::wal::{segment_file_name, Lsn};

pub struct WalWriter {
    env: Arc<dyn Env>,
    dir: PathBuf,
    prefix: String,
    block_size: usize,
    segment_limit: u64,
    segment_no: u64,
    sink: Box<dyn Sink>,
    /// Blocks already padded and ready to flush.
    pending: Vec<u8>,
    /// The in-progress, not-yet-padded block.
    current_block: Vec<u8>,
    bytes_in_segment: u64,
    next_lsn: Lsn,
    flushed_lsn: Lsn,
}

impl WalWriter {
    pub fn create(
        env: Arc<dyn Env>,
        dir: PathBuf,
        prefix: String,
        block_size: usize,
        segment_limit: u64,
        starting_lsn: Lsn,
        segment_no: u64,
    ) -> Result<Self> {
        env.create_dir_all(&dir)?;
        let path = dir.join(segment_file_name(&prefix, segment_no));
        let sink = env.new_sink(&path)?;
        Ok(Self {
            env,
            dir,
            prefix,
            block_size,
            segment_limit,
            segment_no,
            sink,
            pending: Vec::new(),
            current_block: Vec::new(),
            bytes_in_segment: 0,
            next_lsn: starting_lsn,
            flushed_lsn: if starting_lsn == 0 { 0 } else { starting_lsn - 1 },
        })
    }

    pub fn flushed_lsn(&self) -> Lsn {
        self.flushed_lsn
    }

    /// Append a logical record, returning its assigned LSN. Buffered only — call
    /// `flush` to make it durable.
    pub fn append(&mut self, payload: &Payload) -> Result<Lsn> {
        let lsn = self.next_lsn;
        self.next_lsn += 1;
        let bytes = payload.encode();
        let crc = crc32c::crc32c(&bytes);
        let mut remaining = &bytes[..];
        let mut first = true;
        loop {
            let space = self.block_size.saturating_sub(self.current_block.len());
            if space <= FRAME_HEADER_SIZE {
                self.seal_current_block()?;
                continue;
            }
            let max_payload = space - FRAME_HEADER_SIZE;
            if remaining.len() <= max_payload {
                let kind = if first { FrameKind::Full } else { FrameKind::Last };
                encode_frame(&mut self.current_block, lsn, crc, kind, remaining);
                break;
            }
            let kind = if first { FrameKind::First } else { FrameKind::Middle };
            let (chunk, rest) = remaining.split_at(max_payload);
            encode_frame(&mut self.current_block, lsn, crc, kind, chunk);
            remaining = rest;
            first = false;
            self.seal_current_block()?;
        }
        Ok(lsn)
    }

    /// Pad the in-progress block to `block_size` and move it into the pending queue,
    /// rotating to a new segment first if the pending queue would push this segment
    /// past `segment_limit` (rotation only ever happens at a block boundary, §4.4).
    fn seal_current_block(&mut self) -> Result<()> {
        self.current_block.resize(self.block_size, 0);
        if self.bytes_in_segment + self.pending.len() as u64 + self.block_size as u64
            > self.segment_limit
            && (self.bytes_in_segment > 0 || !self.pending.is_empty())
        {
            self.flush_pending()?;
            self.rotate_segment()?;
        }
        self.pending.append(&mut self.current_block);
        self.current_block.clear();
        Ok(())
    }

    fn rotate_segment(&mut self) -> Result<()> {
        self.segment_no += 1;
        let path = self.dir.join(segment_file_name(&self.prefix, self.segment_no));
        self.sink = self.env.new_sink(&path)?;
        self.bytes_in_segment = 0;
        Ok(())
    }

    fn flush_pending(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.sink.append(&self.pending)?;
        self.bytes_in_segment += self.pending.len() as u64;
        self.pending.clear();
        Ok(())
    }

    /// Write all full blocks and the current partial block (padded), then fsync.
    /// After this call, `flushed_lsn` reflects every record appended so far.
    pub fn flush(&mut self) -> Result<()> {
        let last_assigned = self.next_lsn - 1;
        if !self.current_block.is_empty() {
            self.seal_current_block()?;
        }
        self.flush_pending()?;
        self.sink.sync()?;
        self.flushed_lsn = last_assigned;
        Ok(())
    }

    pub fn segment_no(&self) -> u64 {
        self.segment_no
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::OsEnv;
    use crate::wal::reader::WalReader;
    use tempdir::TempDir;

    #[test]
    fn append_and_flush_then_read_back() {
        let dir = TempDir::new("wal").unwrap();
        let env: Arc<dyn Env> = Arc::new(OsEnv);
        let mut writer = WalWriter::create(
            env.clone(),
            dir.path().to_path_buf(),
            "test".into(),
            256,
            1 << 20,
            1,
            0,
        )
        .unwrap();

        let lsn1 = writer
            .append(&Payload::FullImage {
                page_id: 1,
                image: vec![1u8; 64],
            })
            .unwrap();
        let lsn2 = writer.append(&Payload::Commit).unwrap();
        writer.flush().unwrap();
        assert_eq!(writer.flushed_lsn(), lsn2);
        assert_eq!(lsn1, 1);
        assert_eq!(lsn2, 2);

        let reader = WalReader::new(env, dir.path().to_path_buf(), "test".into());
        let records: Vec<_> = reader.open_forward(0).unwrap().collect::<Result<_>>().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].0, 1);
        assert_eq!(records[1].1, Payload::Commit);
    }

    #[test]
    fn large_record_fragments_across_blocks() {
        let dir = TempDir::new("wal").unwrap();
        let env: Arc<dyn Env> = Arc::new(OsEnv);
        let mut writer = WalWriter::create(
            env.clone(),
            dir.path().to_path_buf(),
            "test".into(),
            64,
            1 << 20,
            1,
            0,
        )
        .unwrap();
        let image = vec![7u8; 500];
        let lsn = writer
            .append(&Payload::FullImage {
                page_id: 5,
                image: image.clone(),
            })
            .unwrap();
        writer.flush().unwrap();

        let reader = WalReader::new(env, dir.path().to_path_buf(), "test".into());
        let records: Vec<_> = reader.open_forward(0).unwrap().collect::<Result<_>>().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0, lsn);
        match &records[0].1 {
            Payload::FullImage { page_id, image: got } => {
                assert_eq!(*page_id, 5);
                assert_eq!(got, &image);
            }
            _ => panic!("wrong payload kind"),
        }
    }
}
