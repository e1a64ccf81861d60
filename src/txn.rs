//! Transaction boundaries and crash recovery (§4.6).
//!
//! This engine is single-writer (§5): exactly one `Txn` is ever open at a time, so
//! the WAL is a strict linear sequence of per-page records followed by one `Commit`.
//!
//! `touch` logs a page's pre-mutation bytes as a `Payload::FullImage` record (the
//! undo image) the first time a transaction touches it, and immediately stamps that
//! record's LSN onto the page. Since that LSN isn't covered by the WAL's durable LSN
//! until this same transaction's own `commit` flushes the log, `Pager::evict_one`'s
//! dirty-eviction gate (durable LSN must cover page LSN) cannot let the page reach
//! the data file before commit — an uncommitted page can never be stolen out from
//! under an open transaction. `commit` then logs a `Payload::Deltas` record per
//! touched page (the redo image) plus a commit marker, advances the durable LSN, and
//! only then flushes the pager.
//!
//! An abort just copies the in-memory before-images back into the pager's cached
//! frames — cheaper than unwinding anything durable, and correct precisely because
//! the eviction gate above guarantees nothing uncommitted ever reached disk.
//!
//! Recovery (`recover`) replays every `Deltas`/`FullImage` record from `from_segment`
//! onward: `Deltas` records are merged into a per-page staging buffer and applied on
//! the matching `Commit` (redo); any `FullImage` record still staged once the scan
//! ends belongs to a transaction that never committed, and is applied as-is (undo) —
//! restoring that page to its pre-transaction bytes explicitly rather than relying
//! solely on the eviction gate never having let it diverge from disk in the first
//! place. `page_count`/`free_list_head` ride along in the same record stream via the
//! header page (§3), recovered by decoding it the same way `Pager::open` does.
//!
//! `Txn` itself holds no borrow of the pager or WAL writer — only the scratch state
//! (before-images, starting counters) that must outlive a single method call, so the
//! engine can hold one across `begin_txn`/`commit_txn` without a self-referential
//! struct.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;
use crate::page::{PageId, ROOT_PAGE_ID};
use crate::pager::Pager;
use crate::wal::reader::WalReader;
use crate::wal::record::Payload;
use crate::wal::writer::WalWriter;
use crate::wal::Lsn;

pub struct Txn {
    before_images: RefCell<HashMap<PageId, Vec<u8>>>,
    start_page_count: u64,
    start_free_list_head: PageId,
}

impl Txn {
    pub fn begin(pager: &Pager) -> Self {
        Self {
            before_images: RefCell::new(HashMap::new()),
            start_page_count: pager.page_count(),
            start_free_list_head: pager.free_list_head(),
        }
    }

    /// Capture `id`'s pre-mutation bytes the first time it's touched in this
    /// transaction; a no-op on every later touch of the same page. Handed to
    /// `BTree` operations as a `TouchFn` (§4.5).
    ///
    /// With a WAL configured, also logs that snapshot as a `FullImage` undo record
    /// and stamps its LSN onto the page immediately — see the module doc for why
    /// this, not anything done at commit time, is what keeps an uncommitted page off
    /// the data file.
    pub fn touch(&self, pager: &Pager, wal: Option<&RefCell<WalWriter>>, id: PageId) -> Result<()> {
        if self.before_images.borrow().contains_key(&id) {
            return Ok(());
        }
        let image = pager.snapshot(id)?;
        if let Some(wal) = wal {
            let lsn = wal.borrow_mut().append(&Payload::FullImage {
                page_id: id,
                image: image.clone(),
            })?;
            pager.acquire(id)?.borrow_mut().set_page_lsn(lsn);
        }
        self.before_images.borrow_mut().insert(id, image);
        Ok(())
    }

    /// Write a redo record for every touched page (plus the header page, which is
    /// never routed through `touch` but still changes if this transaction allocated
    /// or freed anything), append the commit marker, and make it durable before
    /// writing any of it back to the data file. With no WAL configured, this just
    /// flushes the pager directly — durable, but not crash-safe (§6 `use_wal`).
    pub fn commit(self, pager: &Pager, wal: Option<&RefCell<WalWriter>>, wal_durable_lsn: &AtomicU64) -> Result<()> {
        let Some(wal) = wal else {
            pager.flush(Lsn::MAX)?;
            pager.sync()?;
            pager.set_record_count(pager.record_count() + 1);
            return Ok(());
        };

        let mut touched: Vec<PageId> = self
            .before_images
            .borrow()
            .keys()
            .copied()
            .filter(|&id| id != ROOT_PAGE_ID)
            .collect();
        touched.sort_unstable();

        let mut wal = wal.borrow_mut();
        for id in &touched {
            let bytes = pager.acquire(*id)?.borrow().as_slice().to_vec();
            let lsn = wal.append(&Payload::Deltas {
                page_id: *id,
                deltas: vec![(0, bytes)],
            })?;
            pager.acquire(*id)?.borrow_mut().set_page_lsn(lsn);
        }

        let header_bytes = pager.header_snapshot();
        let header_lsn = wal.append(&Payload::Deltas {
            page_id: ROOT_PAGE_ID,
            deltas: vec![(0, header_bytes.clone())],
        })?;
        {
            let header_ref = pager.acquire(ROOT_PAGE_ID)?;
            let mut page = header_ref.borrow_mut();
            page.as_mut_slice().copy_from_slice(&header_bytes);
            page.set_page_lsn(header_lsn);
        }

        let commit_lsn = wal.append(&Payload::Commit)?;
        wal.flush()?;
        wal_durable_lsn.store(wal.flushed_lsn(), Ordering::Release);
        drop(wal);

        pager.flush(commit_lsn)?;
        pager.sync()?;
        pager.set_recovery_lsn(commit_lsn);
        pager.set_record_count(pager.record_count() + 1);
        Ok(())
    }

    /// Undo every touched page in place and restore the page-count/free-list
    /// counters this transaction may have advanced — nothing durable was ever
    /// written, so there's no WAL to unwind, only the pager's live cache.
    pub fn rollback(self, pager: &Pager) -> Result<()> {
        for (id, image) in self.before_images.into_inner() {
            let page_ref = pager.acquire(id)?;
            page_ref.borrow_mut().as_mut_slice().copy_from_slice(&image);
        }
        pager.set_free_list_head(self.start_free_list_head);
        pager.truncate(self.start_page_count)?;
        Ok(())
    }
}

/// Redo every complete (commit-terminated) transaction found from `from_segment`
/// onward, then re-derive the pager's counters from the recovered header page.
/// Called once, by `Engine::open`, before any new transaction begins.
pub fn recover(pager: &Pager, wal_reader: &WalReader, from_segment: u64) -> Result<()> {
    let mut staged: HashMap<PageId, Vec<u8>> = HashMap::new();
    // Full-image (undo) records seen since the last `Commit`; cleared whenever a
    // `Commit` is reached, since everything before that point is settled history.
    // Whatever's left once the scan ends belongs to a transaction that never
    // finished, and its pages must be explicitly restored to these pre-transaction
    // bytes (§4.6's undo pass).
    let mut pending_undo: HashMap<PageId, (Lsn, Vec<u8>)> = HashMap::new();
    let mut last_commit_lsn: Lsn = 0;

    for record in wal_reader.open_forward(from_segment)? {
        let (lsn, payload) = match record {
            Ok(r) => r,
            // A torn trailing record is exactly what a mid-write crash leaves behind;
            // everything before it is still good, so stop here rather than failing
            // recovery outright.
            Err(_) => break,
        };
        match payload {
            Payload::Deltas { page_id, deltas } => {
                let bytes = staged.entry(page_id).or_insert_with(|| vec![0u8; pager.page_size()]);
                for (offset, chunk) in deltas {
                    let off = offset as usize;
                    if bytes.len() < off + chunk.len() {
                        bytes.resize(off + chunk.len(), 0);
                    }
                    bytes[off..off + chunk.len()].copy_from_slice(&chunk);
                }
            }
            Payload::FullImage { page_id, image } => {
                pending_undo.insert(page_id, (lsn, image.clone()));
                staged.insert(page_id, image);
            }
            Payload::Commit => {
                for (page_id, bytes) in staged.drain() {
                    apply_redo_image(pager, page_id, &bytes, lsn)?;
                }
                pending_undo.clear();
                last_commit_lsn = lsn;
            }
        }
    }

    let had_undo = !pending_undo.is_empty();
    for (page_id, (lsn, image)) in pending_undo {
        apply_redo_image(pager, page_id, &image, lsn)?;
    }

    if last_commit_lsn > 0 || had_undo {
        pager.reload_header()?;
        pager.flush(last_commit_lsn)?;
        pager.sync()?;
    }
    Ok(())
}

fn apply_redo_image(pager: &Pager, page_id: PageId, bytes: &[u8], lsn: Lsn) -> Result<()> {
    let page_ref = pager.acquire(page_id)?;
    let mut page = page_ref.borrow_mut();
    let mut buf = bytes.to_vec();
    buf.resize(pager.page_size(), 0);
    page.as_mut_slice().copy_from_slice(&buf);
    page.set_page_lsn(lsn);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempdir::TempDir;

    use super::*;
    use crate::btree::BTree;
    use crate::env::OsEnv;

    fn open_pager(path: &std::path::Path, durable: Arc<AtomicU64>) -> Pager {
        Pager::open(Arc::new(OsEnv), path, 512, 64, durable).unwrap()
    }

    fn open_wal(dir: &std::path::Path) -> RefCell<WalWriter> {
        RefCell::new(WalWriter::create(Arc::new(OsEnv), dir.to_path_buf(), "wal".into(), 4096, 1 << 20, 1, 0).unwrap())
    }

    #[test]
    fn commit_then_reopen_without_crash_keeps_data() {
        let dir = TempDir::new("txn").unwrap();
        let data_path = dir.path().join("data.calico");
        let wal_dir = dir.path().join("wal");
        let durable = Arc::new(AtomicU64::new(u64::MAX));

        {
            let pager = open_pager(&data_path, durable.clone());
            let tree = BTree::create_fresh(&pager).unwrap();
            let wal = open_wal(&wal_dir);
            let txn = Txn::begin(&pager);
            {
                let mut touch = |id| txn.touch(&pager, Some(&wal), id);
                tree.insert(&mut touch, b"k1", b"v1").unwrap();
                tree.insert(&mut touch, b"k2", b"v2").unwrap();
            }
            txn.commit(&pager, Some(&wal), &durable).unwrap();
        }

        let pager = open_pager(&data_path, durable);
        let tree = BTree::new(&pager, crate::btree::ROOT_TREE_PAGE_ID);
        assert_eq!(tree.get(b"k1").unwrap(), b"v1");
        assert_eq!(tree.get(b"k2").unwrap(), b"v2");
    }

    #[test]
    fn rollback_discards_uncommitted_writes() {
        let dir = TempDir::new("txn").unwrap();
        let data_path = dir.path().join("data.calico");
        let wal_dir = dir.path().join("wal");
        let durable = Arc::new(AtomicU64::new(u64::MAX));
        let pager = open_pager(&data_path, durable.clone());
        let tree = BTree::create_fresh(&pager).unwrap();
        let wal = open_wal(&wal_dir);

        {
            let txn = Txn::begin(&pager);
            let mut touch = |id| txn.touch(&pager, Some(&wal), id);
            tree.insert(&mut touch, b"a", b"1").unwrap();
            txn.rollback(&pager).unwrap();
        }
        assert!(tree.get(b"a").is_err());

        let txn = Txn::begin(&pager);
        let mut touch = |id| txn.touch(&pager, Some(&wal), id);
        tree.insert(&mut touch, b"b", b"2").unwrap();
        txn.commit(&pager, Some(&wal), &durable).unwrap();
        assert_eq!(tree.get(b"b").unwrap(), b"2");
    }

    #[test]
    fn recovery_redoes_committed_transaction_from_wal_alone() {
        let dir = TempDir::new("txn").unwrap();
        let data_path = dir.path().join("data.calico");
        let wal_dir = dir.path().join("wal");
        let durable = Arc::new(AtomicU64::new(u64::MAX));

        {
            let pager = open_pager(&data_path, durable.clone());
            let tree = BTree::create_fresh(&pager).unwrap();
            let wal = open_wal(&wal_dir);
            let txn = Txn::begin(&pager);
            let mut touch = |id| txn.touch(&pager, Some(&wal), id);
            for i in 0..50u32 {
                tree.insert(&mut touch, format!("key-{i:04}").as_bytes(), b"payload").unwrap();
            }
            txn.commit(&pager, Some(&wal), &durable).unwrap();
        }

        // A fresh pager plus an explicit redo pass over the WAL reconstructs the
        // same state a normal reopen would — recovery is idempotent with an
        // already-fully-flushed log, which is the case this test exercises.
        let pager = open_pager(&data_path, durable);
        let reader = WalReader::new(Arc::new(OsEnv), wal_dir, "wal".into());
        recover(&pager, &reader, 0).unwrap();
        let tree = BTree::new(&pager, crate::btree::ROOT_TREE_PAGE_ID);
        for i in 0..50u32 {
            assert_eq!(tree.get(format!("key-{i:04}").as_bytes()).unwrap(), b"payload");
        }
    }

    #[test]
    fn uncommitted_page_cannot_be_stolen_by_eviction() {
        let dir = TempDir::new("txn").unwrap();
        let data_path = dir.path().join("data.calico");
        let wal_dir = dir.path().join("wal");
        // Durable starts at 0, matching a freshly opened engine before this
        // transaction's own commit has ever flushed the WAL.
        let durable = Arc::new(AtomicU64::new(0));
        let pager = Pager::open(Arc::new(OsEnv), &data_path, 512, 4, durable).unwrap();
        let tree = BTree::create_fresh(&pager).unwrap();
        let wal = open_wal(&wal_dir);

        let txn = Txn::begin(&pager);
        let mut touch = |id| txn.touch(&pager, Some(&wal), id);
        // More distinct pages than fit in 4 frames. If a dirty, uncommitted page
        // could be evicted to the data file here, every insert below would succeed
        // silently instead of the cache eventually refusing to make room.
        let mut saw_busy = false;
        for i in 0..200u32 {
            match tree.insert(&mut touch, format!("k-{i:04}").as_bytes(), b"v") {
                Ok(()) => {}
                Err(crate::error::Error::Busy) => {
                    saw_busy = true;
                    break;
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(saw_busy, "expected the cache to refuse eviction once every frame held an uncommitted dirty page");
    }

    #[test]
    fn recovery_undoes_a_transaction_that_never_committed() {
        let dir = TempDir::new("txn").unwrap();
        let data_path = dir.path().join("data.calico");
        let wal_dir = dir.path().join("wal");
        let durable = Arc::new(AtomicU64::new(u64::MAX));

        {
            let pager = open_pager(&data_path, durable.clone());
            let tree = BTree::create_fresh(&pager).unwrap();
            let wal = open_wal(&wal_dir);
            let txn = Txn::begin(&pager);
            let mut touch = |id| txn.touch(&pager, Some(&wal), id);
            tree.insert(&mut touch, b"k1", b"v1").unwrap();
            txn.commit(&pager, Some(&wal), &durable).unwrap();

            // A second transaction logs its undo (`FullImage`) records via `touch`
            // but crashes before ever appending a `Commit` — simulated here by
            // simply dropping it instead of calling `commit`/`rollback`.
            let txn2 = Txn::begin(&pager);
            let mut touch2 = |id| txn2.touch(&pager, Some(&wal), id);
            tree.insert(&mut touch2, b"k2", b"v2").unwrap();
            wal.borrow_mut().flush().unwrap();
        }

        let pager = open_pager(&data_path, durable);
        let reader = WalReader::new(Arc::new(OsEnv), wal_dir, "wal".into());
        recover(&pager, &reader, 0).unwrap();
        let tree = BTree::new(&pager, crate::btree::ROOT_TREE_PAGE_ID);
        assert_eq!(tree.get(b"k1").unwrap(), b"v1");
        assert!(tree.get(b"k2").is_err());
    }
}
