// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::item::{BlockNumber, INVALID_BLOCK_NUMBER};
use crate::page::{Page, BLCKSZ};
use rustc_hash::FxHashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// One resident page with its latch and pin count
pub struct PageFrame {
    blkno: BlockNumber,
    latch: RwLock<Page>,
    pins: AtomicU32,
}

/// A pinned page handle
///
/// Pinning keeps the frame resident and blocks cleanup locks; the page latch
/// is taken separately through [`Buffer::read`] / [`Buffer::write`].
pub struct Buffer {
    frame: Arc<PageFrame>,
}

impl Buffer {
    #[must_use]
    pub fn blkno(&self) -> BlockNumber {
        self.frame.blkno
    }

    /// Acquires the page latch in SHARE mode.
    pub fn read(&self) -> RwLockReadGuard<'_, Page> {
        self.frame.latch.read().expect("page latch poisoned")
    }

    /// Acquires the page latch in EXCLUSIVE mode.
    pub fn write(&self) -> RwLockWriteGuard<'_, Page> {
        self.frame.latch.write().expect("page latch poisoned")
    }

    /// Tries to acquire a cleanup latch: EXCLUSIVE plus the guarantee that
    /// nobody else holds a pin.
    pub fn try_write_cleanup(&self) -> Option<RwLockWriteGuard<'_, Page>> {
        let guard = self.frame.latch.try_write().ok()?;
        if self.frame.pins.load(AtomicOrdering::Acquire) == 1 {
            Some(guard)
        } else {
            None
        }
    }

    /// Acquires a cleanup latch, waiting for concurrent pins to go away.
    pub fn write_cleanup(&self) -> RwLockWriteGuard<'_, Page> {
        loop {
            if let Some(guard) = self.try_write_cleanup() {
                return guard;
            }
            std::thread::yield_now();
        }
    }

    #[must_use]
    pub fn pin_count(&self) -> u32 {
        self.frame.pins.load(AtomicOrdering::Acquire)
    }
}

impl Clone for Buffer {
    fn clone(&self) -> Self {
        self.frame.pins.fetch_add(1, AtomicOrdering::AcqRel);
        Self {
            frame: self.frame.clone(),
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.frame.pins.fetch_sub(1, AtomicOrdering::AcqRel);
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Buffer({})", self.frame.blkno)
    }
}

/// Buffered page store for one index
///
/// Pages live in memory once touched; `flush` persists them to the backing
/// file (if any) with checksums stamped. Allocation prefers recycled pages
/// recorded in the free-space map and extends the file otherwise.
pub struct BufferManager {
    frames: RwLock<FxHashMap<BlockNumber, Arc<PageFrame>>>,
    n_pages: AtomicU32,
    free_pages: Mutex<Vec<BlockNumber>>,
    file: Option<Mutex<File>>,
    lsn: AtomicU64,
    /// Serializes page-group commits (see `wal.rs`)
    pub(crate) commit_lock: Mutex<()>,
}

impl BufferManager {
    /// Creates a purely in-memory store.
    #[must_use]
    pub fn new_in_memory() -> Self {
        Self {
            frames: RwLock::new(FxHashMap::default()),
            n_pages: AtomicU32::new(0),
            free_pages: Mutex::new(Vec::new()),
            file: None,
            lsn: AtomicU64::new(1),
            commit_lock: Mutex::new(()),
        }
    }

    /// Opens (or creates) a file-backed store.
    pub fn open<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let len = file.metadata()?.len() as usize;
        if len % BLCKSZ != 0 {
            return Err(crate::Error::StructureCorrupt("file size not page-aligned"));
        }

        Ok(Self {
            frames: RwLock::new(FxHashMap::default()),
            n_pages: AtomicU32::new((len / BLCKSZ) as u32),
            free_pages: Mutex::new(Vec::new()),
            file: Some(Mutex::new(file)),
            lsn: AtomicU64::new(1),
            commit_lock: Mutex::new(()),
        })
    }

    /// Number of pages in the relation.
    #[must_use]
    pub fn n_pages(&self) -> u32 {
        self.n_pages.load(AtomicOrdering::Acquire)
    }

    /// Serializes mutating operations. Every top-level write path (insert,
    /// build drain, vacuum) holds this token for its duration; readers only
    /// take page latches and recover from concurrent splits via right links.
    pub fn begin_write(&self) -> std::sync::MutexGuard<'_, ()> {
        self.commit_lock.lock().expect("commit lock poisoned")
    }

    pub(crate) fn next_lsn(&self) -> u64 {
        self.lsn.fetch_add(1, AtomicOrdering::AcqRel)
    }

    fn load_frame(&self, blkno: BlockNumber) -> crate::Result<Arc<PageFrame>> {
        if let Some(frame) = self.frames.read().expect("frame map poisoned").get(&blkno) {
            return Ok(frame.clone());
        }

        let mut page = Page::default();

        if let Some(file) = &self.file {
            let mut file = file.lock().expect("file lock poisoned");
            file.seek(SeekFrom::Start(blkno as u64 * BLCKSZ as u64))?;

            // A page past the current EOF (freshly extended) stays zeroed
            let mut read = 0;
            let buf = page.bytes_mut();
            while read < BLCKSZ {
                let n = file.read(&mut buf[read..])?;
                if n == 0 {
                    break;
                }
                read += n;
            }
            if read == BLCKSZ {
                page.verify_checksum()?;
            }
        }

        let mut frames = self.frames.write().expect("frame map poisoned");
        let frame = frames
            .entry(blkno)
            .or_insert_with(|| {
                Arc::new(PageFrame {
                    blkno,
                    latch: RwLock::new(page),
                    pins: AtomicU32::new(0),
                })
            })
            .clone();
        Ok(frame)
    }

    /// Pins the page at `blkno`.
    pub fn pin(&self, blkno: BlockNumber) -> crate::Result<Buffer> {
        debug_assert!(blkno != INVALID_BLOCK_NUMBER);
        debug_assert!(blkno < self.n_pages());

        let frame = self.load_frame(blkno)?;
        frame.pins.fetch_add(1, AtomicOrdering::AcqRel);
        Ok(Buffer { frame })
    }

    /// Allocates a page, recycling through the free-space map first.
    /// The caller initializes the page under its own latch.
    pub fn new_buffer(&self) -> crate::Result<Buffer> {
        // First, try to get a page from the FSM
        loop {
            let blkno = {
                let mut free = self.free_pages.lock().expect("fsm lock poisoned");
                free.pop()
            };
            let Some(blkno) = blkno else { break };

            let buffer = self.pin(blkno)?;

            // Guard against somebody having recycled this page already
            let usable = {
                let page = buffer.read();
                page.is_new() || page.is_deleted()
            };
            if usable {
                return Ok(buffer);
            }
        }

        // Must extend the relation
        let blkno = self.n_pages.fetch_add(1, AtomicOrdering::AcqRel);
        self.pin(blkno)
    }

    /// Records a recyclable page in the free-space map.
    pub fn record_free_page(&self, blkno: BlockNumber) {
        self.free_pages
            .lock()
            .expect("fsm lock poisoned")
            .push(blkno);
    }

    /// Writes every resident page back to the backing file.
    pub fn flush(&self) -> crate::Result<()> {
        let Some(file) = &self.file else {
            return Ok(());
        };

        let frames: Vec<Arc<PageFrame>> = self
            .frames
            .read()
            .expect("frame map poisoned")
            .values()
            .cloned()
            .collect();

        let mut file = file.lock().expect("file lock poisoned");
        for frame in frames {
            let mut page = frame.latch.write().expect("page latch poisoned");
            page.update_checksum();
            file.seek(SeekFrom::Start(frame.blkno as u64 * BLCKSZ as u64))?;
            file.write_all(page.bytes())?;
        }

        // pad the file out to the page count so reopen sees every page
        let want = self.n_pages() as u64 * BLCKSZ as u64;
        if file.metadata()?.len() < want {
            file.set_len(want)?;
        }

        file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::flags;
    use test_log::test;

    #[test]
    fn bufmgr_alloc_and_pin() {
        let bm = BufferManager::new_in_memory();
        assert_eq!(0, bm.n_pages());

        let b0 = bm.new_buffer().unwrap();
        let b1 = bm.new_buffer().unwrap();
        assert_eq!(0, b0.blkno());
        assert_eq!(1, b1.blkno());
        assert_eq!(2, bm.n_pages());

        b0.write().init(flags::META);
        assert!(bm.pin(0).unwrap().read().is_meta());
    }

    #[test]
    fn bufmgr_fsm_recycles_deleted() {
        let bm = BufferManager::new_in_memory();
        let b0 = bm.new_buffer().unwrap();
        b0.write().init(flags::DATA | flags::LEAF);
        let blkno = b0.blkno();

        b0.write().mark_deleted();
        bm.record_free_page(blkno);
        drop(b0);

        let again = bm.new_buffer().unwrap();
        assert_eq!(blkno, again.blkno());
        assert_eq!(1, bm.n_pages());
    }

    #[test]
    fn bufmgr_cleanup_lock_requires_sole_pin() {
        let bm = BufferManager::new_in_memory();
        let b = bm.new_buffer().unwrap();

        let second = bm.pin(b.blkno()).unwrap();
        assert!(b.try_write_cleanup().is_none());

        drop(second);
        assert!(b.try_write_cleanup().is_some());
    }

    #[test]
    fn bufmgr_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idx");

        {
            let bm = BufferManager::open(&path).unwrap();
            let b = bm.new_buffer().unwrap();
            b.write().init(flags::META);
            bm.flush().unwrap();
        }

        let bm = BufferManager::open(&path).unwrap();
        assert_eq!(1, bm.n_pages());
        assert!(bm.pin(0).unwrap().read().is_meta());
    }
}
