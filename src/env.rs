//! Filesystem abstraction (§6: the `Env` trait).
//!
//! The core never touches `std::fs` directly; every durable side effect goes through
//! an `Env`. This is the teacher's "pass dependencies explicitly, no global
//! singletons" design note generalized from a single log sink to the whole
//! filesystem surface (§9's note on global singletons).
//!
//! The only contract the core actually relies on: a successful `sync` on a handle
//! durably persists everything written through that handle before the call.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Sequential or positional reads over an existing file.
pub trait SeqReader: Send {
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize>;
}

/// Positional writes plus the durability primitives the engine depends on.
pub trait RandEditor: Send {
    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()>;
    fn sync(&mut self) -> Result<()>;
    fn resize(&mut self, len: u64) -> Result<()>;
    fn size(&mut self) -> Result<u64>;
}

/// An append-only sink, used for WAL segments and log files.
pub trait Sink: Send {
    fn append(&mut self, buf: &[u8]) -> Result<()>;
    fn sync(&mut self) -> Result<()>;
}

/// Dependency-injected filesystem namespace. The default is [`OsEnv`]; tests supply
/// a fault-injecting or in-memory implementation (outside this crate's scope — see
/// §1, test tooling).
pub trait Env: Send + Sync {
    fn new_reader(&self, path: &Path) -> Result<Box<dyn SeqReader>>;
    fn new_editor(&self, path: &Path) -> Result<Box<dyn RandEditor>>;
    fn new_sink(&self, path: &Path) -> Result<Box<dyn Sink>>;

    fn file_exists(&self, path: &Path) -> bool;
    fn file_size(&self, path: &Path) -> Result<u64>;
    fn remove_file(&self, path: &Path) -> Result<()>;
    fn rename_file(&self, from: &Path, to: &Path) -> Result<()>;
    fn get_children(&self, dir: &Path) -> Result<Vec<PathBuf>>;
    fn create_dir_all(&self, dir: &Path) -> Result<()>;
}

/// Default platform `Env`, constructed once at `Engine::open` (§9: no thread-locals).
#[derive(Debug, Default, Clone, Copy)]
pub struct OsEnv;

struct OsReader(File);
struct OsEditor(File);
struct OsSink(File);

impl SeqReader for OsReader {
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.0.seek(SeekFrom::Start(offset))?;
        let mut read = 0;
        while read < buf.len() {
            match self.0.read(&mut buf[read..])? {
                0 => break,
                n => read += n,
            }
        }
        Ok(read)
    }
}

impl RandEditor for OsEditor {
    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.0.seek(SeekFrom::Start(offset))?;
        self.0.write_all(buf)?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.0.sync_all()?;
        Ok(())
    }

    fn resize(&mut self, len: u64) -> Result<()> {
        self.0.set_len(len)?;
        Ok(())
    }

    fn size(&mut self) -> Result<u64> {
        Ok(self.0.metadata()?.len())
    }
}

impl Sink for OsSink {
    fn append(&mut self, buf: &[u8]) -> Result<()> {
        self.0.write_all(buf)?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.0.sync_all()?;
        Ok(())
    }
}

impl Env for OsEnv {
    fn new_reader(&self, path: &Path) -> Result<Box<dyn SeqReader>> {
        Ok(Box::new(OsReader(File::open(path)?)))
    }

    fn new_editor(&self, path: &Path) -> Result<Box<dyn RandEditor>> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        Ok(Box::new(OsEditor(file)))
    }

    fn new_sink(&self, path: &Path) -> Result<Box<dyn Sink>> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Box::new(OsSink(file)))
    }

    fn file_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn file_size(&self, path: &Path) -> Result<u64> {
        Ok(fs::metadata(path)?.len())
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        fs::remove_file(path)?;
        Ok(())
    }

    fn rename_file(&self, from: &Path, to: &Path) -> Result<()> {
        fs::rename(from, to)?;
        Ok(())
    }

    fn get_children(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(dir)? {
            out.push(entry?.path());
        }
        Ok(out)
    }

    fn create_dir_all(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn os_env_roundtrip() {
        let dir = TempDir::new("env").unwrap();
        let path = dir.path().join("f.bin");
        let env = OsEnv;

        let mut editor = env.new_editor(&path).unwrap();
        editor.write(0, b"hello").unwrap();
        editor.sync().unwrap();

        let mut reader = env.new_reader(&path).unwrap();
        let mut buf = [0u8; 5];
        reader.read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(env.file_size(&path).unwrap(), 5);
    }
}
