// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::buffer::BufferManager;
use crate::config::Config;
use crate::datum::Datum;
use crate::insert::{self, BuildResult};
use crate::item::ItemPointer;
use crate::meta::IndexStats;
use crate::scan::ScanState;
use crate::state::{ColumnDef, RumState};
use crate::tidbitmap::TidBitmap;
use crate::vacuum::{self, VacuumStats};
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// A RUM index over one or more typed columns
///
/// The index owns its page store; readers and writers go through the access
/// method surface below. Writers serialize on the page store's commit lock,
/// readers only take page latches and rely on right-link recovery.
///
/// # Example
///
/// ```
/// use rum_tree::{ColumnDef, Config, Datum, ItemPointer, RumIndex, ScanQual};
/// use rum_tree::opclasses::{btree_strategy, Int64Ops};
/// use std::sync::Arc;
///
/// let index = RumIndex::create(
///     vec![ColumnDef::new("x", Arc::new(Int64Ops))],
///     Config::new(),
/// )?;
///
/// index.build(vec![
///     (ItemPointer::new(0, 1), vec![Some(Datum::Inline(5))]),
///     (ItemPointer::new(0, 2), vec![Some(Datum::Inline(7))]),
/// ])?;
///
/// let mut scan = index.begin_scan();
/// scan.rescan(
///     vec![ScanQual::new(1, btree_strategy::EQUAL, Datum::Inline(5))],
///     vec![],
/// );
///
/// let mut tids = vec![];
/// while scan.get_tuple()? {
///     tids.push(scan.heap_ptr.expect("positioned"));
/// }
/// assert_eq!(vec![ItemPointer::new(0, 1)], tids);
/// # Ok::<(), rum_tree::Error>(())
/// ```
pub struct RumIndex {
    state: RumState,
    bufmgr: BufferManager,
}

impl RumIndex {
    /// Creates an empty in-memory index (not yet built).
    pub fn create(columns: Vec<ColumnDef>, config: Config) -> crate::Result<Self> {
        let state = RumState::new(columns, config)?;
        Ok(Self {
            state,
            bufmgr: BufferManager::new_in_memory(),
        })
    }

    /// Creates or opens a file-backed index. A fresh file must be built
    /// before scanning; an existing one is verified against the format
    /// version.
    pub fn open<P: AsRef<Path>>(
        path: P,
        columns: Vec<ColumnDef>,
        config: Config,
    ) -> crate::Result<Self> {
        let state = RumState::new(columns, config)?;
        let bufmgr = BufferManager::open(path)?;

        if bufmgr.n_pages() > 0 {
            // verifies the metapage version
            insert::get_stats(&bufmgr)?;
        }

        Ok(Self { state, bufmgr })
    }

    /// Installs a cooperative cancellation flag, polled at tuple and page
    /// boundaries of long operations.
    pub fn set_interrupt_flag(&mut self, flag: Option<Arc<AtomicBool>>) {
        self.state.interrupt = flag;
    }

    #[must_use]
    pub fn state(&self) -> &RumState {
        &self.state
    }

    /// Checks the column/opclass configuration for consistency.
    pub fn validate(&self) -> crate::Result<()> {
        for attnum in 1..=self.state.n_columns() as u16 {
            let opclass = self.state.opclass(attnum);
            let config = self.state.rum_config(attnum);

            if !config.strategy_info.is_empty()
                && !opclass.supports_outer_ordering()
                && !opclass.supports_key_ordering()
            {
                return Err(crate::Error::ConfigConflict(
                    "order-by strategies declared without an ordering method",
                ));
            }

            if opclass.supports_join_add_info() && config.add_info_type.is_none() {
                return Err(crate::Error::ConfigConflict(
                    "addInfo join declared without an addInfo type",
                ));
            }
        }
        Ok(())
    }

    /// Builds the index from a stream of `(heap pointer, column values)`;
    /// the relation must be empty.
    pub fn build<I>(&self, heap_tuples: I) -> crate::Result<BuildResult>
    where
        I: IntoIterator<Item = (ItemPointer, Vec<Option<Datum>>)>,
    {
        let _writer = self.bufmgr.begin_write();
        insert::build(&self.state, &self.bufmgr, heap_tuples)
    }

    /// Initializes an empty index (metapage and leaf root only).
    pub fn build_empty(&self) -> crate::Result<()> {
        let _writer = self.bufmgr.begin_write();
        insert::build_empty(&self.bufmgr)
    }

    /// Inserts the entries of a single heap tuple.
    ///
    /// Always returns false: the access method does not enforce uniqueness.
    pub fn insert(
        &self,
        values: &[Option<Datum>],
        heap_ptr: ItemPointer,
    ) -> crate::Result<bool> {
        let _writer = self.bufmgr.begin_write();
        insert::heap_tuple_insert(&self.state, &self.bufmgr, values, heap_ptr)?;
        Ok(false)
    }

    /// Starts a scan; install conditions with [`ScanState::rescan`], pull
    /// rows with [`ScanState::get_tuple`] or [`ScanState::get_bitmap`].
    /// Dropping the scan ends it.
    #[must_use]
    pub fn begin_scan(&self) -> ScanState<'_> {
        ScanState::begin(&self.state, &self.bufmgr)
    }

    /// Convenience wrapper: runs a bitmap scan for the given conditions.
    pub fn scan_bitmap(&self, quals: Vec<crate::scan::ScanQual>) -> crate::Result<TidBitmap> {
        let mut scan = self.begin_scan();
        scan.rescan(quals, Vec::new());

        let mut tbm = TidBitmap::new();
        scan.get_bitmap(&mut tbm)?;
        Ok(tbm)
    }

    /// Removes all occurrences the callback marks deletable.
    pub fn bulk_delete(
        &self,
        is_deletable: &dyn Fn(&ItemPointer) -> bool,
    ) -> crate::Result<VacuumStats> {
        let _writer = self.bufmgr.begin_write();
        vacuum::bulk_delete(&self.state, &self.bufmgr, is_deletable)
    }

    /// Refreshes statistics and free-space bookkeeping after deletes.
    pub fn vacuum_cleanup(&self, stats: Option<VacuumStats>) -> crate::Result<VacuumStats> {
        let _writer = self.bufmgr.begin_write();
        vacuum::vacuum_cleanup(&self.state, &self.bufmgr, stats)
    }

    /// Planner statistics as of the last build or cleanup.
    pub fn stats(&self) -> crate::Result<IndexStats> {
        insert::get_stats(&self.bufmgr)
    }

    /// Persists all pages to the backing file, if any.
    pub fn flush(&self) -> crate::Result<()> {
        self.bufmgr.flush()
    }

    #[must_use]
    pub fn n_pages(&self) -> u32 {
        self.bufmgr.n_pages()
    }
}
