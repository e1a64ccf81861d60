//! Public engine API (§6): the single entry point wiring `Pager`, WAL, `BTree`, and
//! the transaction driver together under `Options`.

use std::cell::{Cell, RefCell};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::info;

use crate::btree::cursor::Cursor;
use crate::btree::{BTree, ROOT_TREE_PAGE_ID};
use crate::error::{Error, Result};
use crate::options::Options;
use crate::pager::Pager;
use crate::txn::{self, Txn};
use crate::wal::reader::WalReader;
use crate::wal::writer::WalWriter;
use crate::wal::{parse_segment_no, DEFAULT_BLOCK_SIZE, DEFAULT_SEGMENT_LIMIT};

const WAL_PREFIX: &str = "calico";

/// Opaque handle returned by `begin_txn`; `commit_txn`/`rollback_txn` must be called
/// with the same id, since the engine is single-writer and only ever has one
/// transaction open at a time (§5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnId(u64);

struct OpenTxn {
    id: TxnId,
    txn: Txn,
}

/// An open database. Not `Send`/`Sync` — matches the single-threaded cooperative
/// model of §5; callers needing cross-thread access must serialize it themselves.
pub struct Engine {
    pager: Pager,
    wal: Option<RefCell<WalWriter>>,
    wal_durable_lsn: std::sync::Arc<AtomicU64>,
    cursor_epoch: Rc<Cell<u64>>,
    current_txn: RefCell<Option<OpenTxn>>,
    next_txn_id: Cell<u64>,
    options: Options,
}

impl Engine {
    pub fn open(path: impl AsRef<Path>, mut options: Options) -> Result<Self> {
        options.validate()?;
        crate::logging::init(&options);
        let path = path.as_ref();
        let exists = options.env.file_exists(path);
        if !exists && !options.create_if_missing {
            return Err(Error::invalid_argument(format!(
                "database {} does not exist and create_if_missing is false",
                path.display()
            )));
        }
        if exists && options.error_if_exists {
            return Err(Error::invalid_argument(format!(
                "database {} already exists",
                path.display()
            )));
        }

        let wal_durable_lsn = std::sync::Arc::new(AtomicU64::new(if options.use_wal { 0 } else { u64::MAX }));
        let pager = Pager::open(
            options.env.clone(),
            path,
            options.page_size as usize,
            options.frame_count(),
            wal_durable_lsn.clone(),
        )?;
        let is_fresh = pager.page_count() == 1;
        if is_fresh {
            BTree::create_fresh(&pager)?;
        }

        let wal = if options.use_wal {
            let wal_dir = options
                .wal_prefix
                .clone()
                .unwrap_or_else(|| default_wal_dir(path));
            if !is_fresh {
                let reader = WalReader::new(options.env.clone(), wal_dir.clone(), WAL_PREFIX.into());
                txn::recover(&pager, &reader, 0)?;
            }
            wal_durable_lsn.store(pager.recovery_lsn(), Ordering::Release);
            let segment_no = next_segment_no(options.env.as_ref(), &wal_dir, WAL_PREFIX)?;
            let writer = WalWriter::create(
                options.env.clone(),
                wal_dir,
                WAL_PREFIX.into(),
                DEFAULT_BLOCK_SIZE,
                DEFAULT_SEGMENT_LIMIT,
                pager.recovery_lsn() + 1,
                segment_no,
            )?;
            Some(RefCell::new(writer))
        } else {
            None
        };

        info!(
            "opened database at {} (page_size={}, pages={}, wal={})",
            path.display(),
            pager.page_size(),
            pager.page_count(),
            options.use_wal
        );

        Ok(Self {
            pager,
            wal,
            wal_durable_lsn,
            cursor_epoch: Rc::new(Cell::new(0)),
            current_txn: RefCell::new(None),
            next_txn_id: Cell::new(1),
            options,
        })
    }

    /// Flush and fsync everything outstanding. After this returns, dropping the
    /// engine loses nothing that was already committed.
    pub fn close(&self) -> Result<()> {
        if self.current_txn.borrow().is_some() {
            return Err(Error::logic("cannot close engine with an open transaction"));
        }
        if let Some(wal) = &self.wal {
            wal.borrow_mut().flush()?;
        }
        self.pager.sync()?;
        Ok(())
    }

    fn tree(&self) -> BTree<'_> {
        BTree::new(&self.pager, ROOT_TREE_PAGE_ID)
    }

    fn bump_epoch(&self) {
        self.cursor_epoch.set(self.cursor_epoch.get() + 1);
    }

    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        validate_key(key)?;
        self.tree().get(key)
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        validate_key(key)?;
        let guard = self.current_txn.borrow();
        if let Some(open) = guard.as_ref() {
            let mut touch = |id| open.txn.touch(&self.pager, self.wal.as_ref(), id);
            self.tree().insert(&mut touch, key, value)?;
            drop(guard);
            self.bump_epoch();
            return Ok(());
        }
        drop(guard);

        let txn = Txn::begin(&self.pager);
        {
            let mut touch = |id| txn.touch(&self.pager, self.wal.as_ref(), id);
            self.tree().insert(&mut touch, key, value)?;
        }
        txn.commit(&self.pager, self.wal.as_ref(), &self.wal_durable_lsn)?;
        self.bump_epoch();
        Ok(())
    }

    pub fn erase(&self, key: &[u8]) -> Result<()> {
        validate_key(key)?;
        let guard = self.current_txn.borrow();
        if let Some(open) = guard.as_ref() {
            let mut touch = |id| open.txn.touch(&self.pager, self.wal.as_ref(), id);
            self.tree().erase(&mut touch, key)?;
            drop(guard);
            self.bump_epoch();
            return Ok(());
        }
        drop(guard);

        let txn = Txn::begin(&self.pager);
        {
            let mut touch = |id| txn.touch(&self.pager, self.wal.as_ref(), id);
            self.tree().erase(&mut touch, key)?;
        }
        txn.commit(&self.pager, self.wal.as_ref(), &self.wal_durable_lsn)?;
        self.bump_epoch();
        Ok(())
    }

    pub fn new_cursor(&self) -> Cursor<'_> {
        self.tree().new_cursor(self.cursor_epoch.clone())
    }

    /// Begin an explicit transaction batching several mutations into one commit.
    /// Only one may be open at a time (§5 single-writer).
    pub fn begin_txn(&self) -> Result<TxnId> {
        let mut guard = self.current_txn.borrow_mut();
        if guard.is_some() {
            return Err(Error::logic("a transaction is already open"));
        }
        let id = TxnId(self.next_txn_id.get());
        self.next_txn_id.set(id.0 + 1);
        *guard = Some(OpenTxn {
            id,
            txn: Txn::begin(&self.pager),
        });
        Ok(id)
    }

    pub fn commit_txn(&self, id: TxnId) -> Result<()> {
        let open = self.take_txn(id)?;
        open.txn.commit(&self.pager, self.wal.as_ref(), &self.wal_durable_lsn)?;
        self.bump_epoch();
        Ok(())
    }

    pub fn rollback_txn(&self, id: TxnId) -> Result<()> {
        let open = self.take_txn(id)?;
        open.txn.rollback(&self.pager)?;
        self.bump_epoch();
        Ok(())
    }

    fn take_txn(&self, id: TxnId) -> Result<OpenTxn> {
        let mut guard = self.current_txn.borrow_mut();
        match guard.take() {
            Some(open) if open.id == id => Ok(open),
            Some(open) => {
                let err = Err(Error::logic("txn id does not match the currently open transaction"));
                *guard = Some(open);
                err
            }
            None => Err(Error::logic("no transaction is open")),
        }
    }

    pub fn vacuum(&self) -> Result<()> {
        let guard = self.current_txn.borrow();
        if let Some(open) = guard.as_ref() {
            let mut touch = |id| open.txn.touch(&self.pager, self.wal.as_ref(), id);
            return self.tree().vacuum(&mut touch);
        }
        drop(guard);

        let txn = Txn::begin(&self.pager);
        {
            let mut touch = |id| txn.touch(&self.pager, self.wal.as_ref(), id);
            self.tree().vacuum(&mut touch)?;
        }
        txn.commit(&self.pager, self.wal.as_ref(), &self.wal_durable_lsn)
    }

    /// Diagnostic properties (§4.3a, §6): `record_count`, `page_count`,
    /// `cache_hit_ratio`, `page_size`.
    pub fn get_property(&self, name: &str) -> Result<String> {
        match name {
            "record_count" => Ok(self.pager.record_count().to_string()),
            "page_count" => Ok(self.pager.page_count().to_string()),
            "page_size" => Ok(self.pager.page_size().to_string()),
            "cache_hit_ratio" => Ok(format!("{:.6}", self.pager.metrics().cache_hit_ratio())),
            _ => Err(Error::invalid_argument(format!("unknown property {name:?}"))),
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }
}

/// Remove a database's data file and its WAL directory. Destructive and
/// irreversible — callers must hold no open `Engine` over `path` when calling this.
pub fn destroy(path: impl AsRef<Path>, options: &Options) -> Result<()> {
    let path = path.as_ref();
    if options.env.file_exists(path) {
        options.env.remove_file(path)?;
    }
    let wal_dir = options
        .wal_prefix
        .clone()
        .unwrap_or_else(|| default_wal_dir(path));
    if options.env.file_exists(&wal_dir) {
        for child in options.env.get_children(&wal_dir)? {
            options.env.remove_file(&child)?;
        }
    }
    Ok(())
}

fn default_wal_dir(data_path: &Path) -> PathBuf {
    let file_name = data_path
        .file_name()
        .map(|n| format!("{}-wal", n.to_string_lossy()))
        .unwrap_or_else(|| "wal".to_string());
    match data_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.join(file_name),
        _ => PathBuf::from(file_name),
    }
}

fn next_segment_no(env: &dyn crate::env::Env, dir: &Path, prefix: &str) -> Result<u64> {
    if !env.file_exists(dir) {
        return Ok(0);
    }
    let max = env
        .get_children(dir)?
        .into_iter()
        .filter_map(|p| p.file_name().and_then(|n| n.to_str()).and_then(|n| parse_segment_no(prefix, n)))
        .max();
    Ok(max.map_or(0, |n| n + 1))
}

fn validate_key(key: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(Error::invalid_argument("key must be non-empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::OsEnv;
    use std::sync::Arc;
    use tempdir::TempDir;

    fn opts(env: Arc<OsEnv>) -> Options {
        let mut o = Options {
            page_size: 512,
            cache_size: 512 * 64,
            env,
            ..Options::default()
        };
        o.validate().unwrap();
        o
    }

    #[test]
    fn put_get_erase_round_trip() {
        let dir = TempDir::new("engine").unwrap();
        let engine = Engine::open(dir.path().join("data.calico"), opts(Arc::new(OsEnv))).unwrap();
        engine.put(b"a", b"1").unwrap();
        engine.put(b"b", b"2").unwrap();
        assert_eq!(engine.get(b"a").unwrap(), b"1");
        engine.erase(b"a").unwrap();
        assert!(engine.get(b"a").is_err());
        assert_eq!(engine.get(b"b").unwrap(), b"2");
    }

    #[test]
    fn reopen_after_close_keeps_committed_data() {
        let dir = TempDir::new("engine").unwrap();
        let path = dir.path().join("data.calico");
        {
            let engine = Engine::open(&path, opts(Arc::new(OsEnv))).unwrap();
            engine.put(b"persisted", b"yes").unwrap();
            engine.close().unwrap();
        }
        let engine = Engine::open(&path, opts(Arc::new(OsEnv))).unwrap();
        assert_eq!(engine.get(b"persisted").unwrap(), b"yes");
    }

    #[test]
    fn explicit_transaction_commits_atomically() {
        let dir = TempDir::new("engine").unwrap();
        let engine = Engine::open(dir.path().join("data.calico"), opts(Arc::new(OsEnv))).unwrap();
        let id = engine.begin_txn().unwrap();
        engine.put(b"x", b"1").unwrap();
        engine.put(b"y", b"2").unwrap();
        engine.commit_txn(id).unwrap();
        assert_eq!(engine.get(b"x").unwrap(), b"1");
        assert_eq!(engine.get(b"y").unwrap(), b"2");
    }

    #[test]
    fn explicit_transaction_rollback_discards_writes() {
        let dir = TempDir::new("engine").unwrap();
        let engine = Engine::open(dir.path().join("data.calico"), opts(Arc::new(OsEnv))).unwrap();
        engine.put(b"keep", b"1").unwrap();
        let id = engine.begin_txn().unwrap();
        engine.put(b"keep", b"2").unwrap();
        engine.put(b"gone", b"x").unwrap();
        engine.rollback_txn(id).unwrap();
        assert_eq!(engine.get(b"keep").unwrap(), b"1");
        assert!(engine.get(b"gone").is_err());
    }

    #[test]
    fn wrong_txn_id_is_rejected() {
        let dir = TempDir::new("engine").unwrap();
        let engine = Engine::open(dir.path().join("data.calico"), opts(Arc::new(OsEnv))).unwrap();
        let id = engine.begin_txn().unwrap();
        let bogus = TxnId(id.0 + 1);
        assert!(engine.commit_txn(bogus).is_err());
        engine.commit_txn(id).unwrap();
    }

    #[test]
    fn cursor_is_invalidated_by_mutation() {
        let dir = TempDir::new("engine").unwrap();
        let engine = Engine::open(dir.path().join("data.calico"), opts(Arc::new(OsEnv))).unwrap();
        engine.put(b"a", b"1").unwrap();
        let mut cursor = engine.new_cursor();
        cursor.seek(b"a").unwrap();
        assert_eq!(cursor.key().unwrap(), b"a");
        engine.put(b"b", b"2").unwrap();
        assert!(cursor.next().is_ok());
        assert!(cursor.key().is_err());
    }

    #[test]
    fn get_property_reports_basic_stats() {
        let dir = TempDir::new("engine").unwrap();
        let engine = Engine::open(dir.path().join("data.calico"), opts(Arc::new(OsEnv))).unwrap();
        engine.put(b"a", b"1").unwrap();
        assert_eq!(engine.get_property("page_size").unwrap(), "512");
        assert_eq!(engine.get_property("record_count").unwrap(), "1");
        assert!(engine.get_property("unknown").is_err());
    }

    #[test]
    fn destroy_removes_data_file() {
        let dir = TempDir::new("engine").unwrap();
        let path = dir.path().join("data.calico");
        let options = opts(Arc::new(OsEnv));
        {
            let engine = Engine::open(&path, options.clone()).unwrap();
            engine.put(b"a", b"1").unwrap();
        }
        destroy(&path, &options).unwrap();
        assert!(!options.env.file_exists(&path));
    }
}
