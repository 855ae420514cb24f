// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Scan state
//!
//! A scan qualifier is expanded by `extract_query` into one [`ScanKey`] with
//! one or more search conditions; identical conditions across keys are
//! merged into a single shared [`ScanEntry`]. Keys reference entries by
//! index into the scan-wide entry table.

pub mod executor;
pub mod ordering;
pub mod plan;
pub mod stream;

use crate::btree::data::PostingTreeScan;
use crate::btree::BtreeStack;
use crate::buffer::{Buffer, BufferManager};
use crate::datum::Datum;
use crate::item::{ItemPointer, RumItem};
use crate::opclass::{ExtraData, NullCategory, ScanDirection, SearchMode, StrategyNumber};
use crate::sort::{RumScanItem, RumSortItem, Tuplesort};
use crate::state::RumState;

/// One scan qualifier or ORDER BY expression handed to the scan driver
#[derive(Clone, Debug)]
pub struct ScanQual {
    pub attnum: u16,
    pub strategy: StrategyNumber,
    /// `None` is an SQL NULL comparison value: the query is unsatisfiable
    pub value: Option<Datum>,
}

impl ScanQual {
    #[must_use]
    pub fn new(attnum: u16, strategy: StrategyNumber, value: Datum) -> Self {
        Self {
            attnum,
            strategy,
            value: Some(value),
        }
    }
}

/// Which executor loop drives the scan
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ScanType {
    Fast,
    Regular,
    Full,
}

/// Partial-match drain state of an entry
pub enum CollectState {
    /// Nothing pending, pull from the sorter
    Start,
    /// The first occurrence of the next output item
    Pending(RumScanItem),
    /// Sorter exhausted; the next call delivers the end-of-stream
    Drained,
}

/// One index search condition with its cursor state
pub struct ScanEntry<'a> {
    // --- search condition --------------------------------------------------
    pub query_key: Option<Datum>,
    pub query_category: NullCategory,
    pub is_partial_match: bool,
    pub extra: Option<ExtraData>,
    pub strategy: StrategyNumber,
    pub search_mode: SearchMode,
    pub attnum: u16,

    /// Entry belongs only to regrouped addInfo filter keys and is never
    /// cursor-driven
    pub detached: bool,

    // --- cursor ------------------------------------------------------------
    /// Pin on the current posting-tree leaf
    pub buffer: Option<Buffer>,
    pub cur_item: RumItem,

    /// Partial-match / full-scan collection
    pub match_sortstate: Option<Tuplesort<RumScanItem>>,
    pub collect: CollectState,

    /// Entry-tree position for full-index scans that walk every entry
    pub stack: Option<BtreeStack>,
    pub scan_with_add_info: bool,

    /// Snapshot of the entry key the cursor is on (ranking by key value)
    pub use_cur_key: bool,
    pub cur_key: Option<(Datum, NullCategory)>,

    /// Decoded copy of the current posting list / posting-tree page
    pub list: Vec<RumItem>,
    pub offset: i32,

    pub gdi: Option<PostingTreeScan<'a>>,

    pub direction: ScanDirection,
    pub is_finished: bool,
    pub reduce_result: bool,
    pub pre_value: bool,
    pub need_reset: bool,
    pub predict_number_result: u32,

    /// Range-scan start position by addInfo (alternative order)
    pub use_mark_add_info: bool,
    pub mark_add_info: RumItem,
}

impl<'a> ScanEntry<'a> {
    #[must_use]
    pub fn new(
        attnum: u16,
        strategy: StrategyNumber,
        search_mode: SearchMode,
        query_key: Option<Datum>,
        query_category: NullCategory,
        is_partial_match: bool,
        extra: Option<ExtraData>,
    ) -> Self {
        Self {
            query_key,
            query_category,
            is_partial_match,
            extra,
            strategy,
            search_mode,
            attnum,
            detached: false,
            buffer: None,
            cur_item: RumItem::min(),
            match_sortstate: None,
            collect: CollectState::Start,
            stack: None,
            scan_with_add_info: false,
            use_cur_key: false,
            cur_key: None,
            list: Vec::new(),
            offset: -1,
            gdi: None,
            direction: ScanDirection::Forward,
            is_finished: false,
            reduce_result: false,
            pre_value: false,
            need_reset: false,
            predict_number_result: 0,
            use_mark_add_info: false,
            mark_add_info: RumItem::min(),
        }
    }
}

/// One scan qualifier with its extracted conditions and match state
pub struct ScanKey {
    /// Indices into the scan's entry table; user entries first
    pub entries: Vec<usize>,
    pub n_user_entries: usize,

    pub entry_res: Vec<bool>,
    pub add_info: Vec<Option<Datum>>,

    pub use_add_to_column: bool,
    pub outer_add_info: Option<Datum>,

    pub use_cur_key: bool,
    pub cur_key: Option<(Datum, NullCategory)>,

    pub query: Option<Datum>,
    pub query_values: Vec<Datum>,
    pub query_categories: Vec<NullCategory>,
    pub strategy: StrategyNumber,
    pub search_mode: SearchMode,
    pub attnum: u16,
    pub attnum_orig: u16,

    pub cur_item: RumItem,
    pub cur_item_matches: bool,
    pub recheck_cur_item: bool,
    pub is_finished: bool,
    pub order_by: bool,
    pub direction: ScanDirection,
    pub will_sort: bool,

    /// Filter keys on the attach column, evaluated against this key's
    /// discovered addInfo
    pub add_info_keys: Vec<ScanKey>,
}

impl ScanKey {
    #[must_use]
    pub fn new(
        attnum: u16,
        strategy: StrategyNumber,
        search_mode: SearchMode,
        query: Option<Datum>,
        order_by: bool,
    ) -> Self {
        Self {
            entries: Vec::new(),
            n_user_entries: 0,
            entry_res: Vec::new(),
            add_info: Vec::new(),
            use_add_to_column: false,
            outer_add_info: None,
            use_cur_key: false,
            cur_key: None,
            query,
            query_values: Vec::new(),
            query_categories: Vec::new(),
            strategy,
            search_mode,
            attnum,
            attnum_orig: attnum,
            cur_item: RumItem::min(),
            cur_item_matches: false,
            recheck_cur_item: false,
            is_finished: false,
            order_by,
            direction: ScanDirection::Forward,
            will_sort: false,
            add_info_keys: Vec::new(),
        }
    }
}

/// The per-scan working state (the scan opaque)
pub struct ScanState<'a> {
    pub state: &'a RumState,
    pub bufmgr: &'a BufferManager,

    pub quals: Vec<ScanQual>,
    pub order_bys: Vec<ScanQual>,

    pub keys: Vec<ScanKey>,
    pub entries: Vec<ScanEntry<'a>>,
    /// Fast-scan ordering of entry indices (descending current item)
    pub sorted_entries: Vec<usize>,
    pub entries_incr_index: i32,

    pub sortstate: Option<Tuplesort<RumSortItem>>,
    pub item: RumItem,
    pub first_call: bool,
    pub is_void_res: bool,
    pub scan_type: ScanType,
    pub scan_with_alt_order_keys: bool,
    pub will_sort: bool,

    /// Direction the index itself delivers the first ORDER BY key in, when
    /// alternative order makes the external sort unnecessary
    pub natural_order: ScanDirection,
    pub second_pass: bool,

    // --- driver-visible outputs -------------------------------------------
    pub heap_ptr: Option<ItemPointer>,
    pub recheck: bool,
    pub order_by_vals: Vec<Option<f64>>,
}

impl<'a> ScanState<'a> {
    /// Begins a scan; conditions arrive through [`ScanState::rescan`].
    #[must_use]
    pub fn begin(state: &'a RumState, bufmgr: &'a BufferManager) -> Self {
        Self {
            state,
            bufmgr,
            quals: Vec::new(),
            order_bys: Vec::new(),
            keys: Vec::new(),
            entries: Vec::new(),
            sorted_entries: Vec::new(),
            entries_incr_index: -1,
            sortstate: None,
            item: RumItem::min(),
            first_call: true,
            is_void_res: false,
            scan_type: ScanType::Regular,
            scan_with_alt_order_keys: false,
            will_sort: false,
            natural_order: ScanDirection::NoMovement,
            second_pass: false,
            heap_ptr: None,
            recheck: false,
            order_by_vals: Vec::new(),
        }
    }

    /// Installs new conditions and resets all cursor state.
    pub fn rescan(&mut self, quals: Vec<ScanQual>, order_bys: Vec<ScanQual>) {
        self.free_scan_keys();
        self.quals = quals;
        self.order_bys = order_bys;
        self.first_call = true;
        self.second_pass = false;
        self.heap_ptr = None;
    }

    /// Drops all keys, entries and sort state (rescan/endscan path).
    pub fn free_scan_keys(&mut self) {
        self.keys.clear();
        self.entries.clear();
        self.sorted_entries.clear();
        self.entries_incr_index = -1;
        self.sortstate = None;
        self.item = RumItem::min();
        self.is_void_res = false;
        self.scan_with_alt_order_keys = false;
        self.will_sort = false;
        self.natural_order = ScanDirection::NoMovement;
        self.order_by_vals.clear();
    }

    /// Mark/restore is not provided by this access method.
    pub fn mark_position(&self) -> crate::Result<()> {
        Err(crate::Error::Unsupported("mark/restore is not supported"))
    }

    /// Mark/restore is not provided by this access method.
    pub fn restore_position(&self) -> crate::Result<()> {
        Err(crate::Error::Unsupported("mark/restore is not supported"))
    }

    pub(crate) fn fuzzy_search_limit(&self) -> u32 {
        self.state.config.fuzzy_search_limit
    }
}

/// Category of the hidden entry a non-default search mode seeds
pub(crate) fn hidden_entry_category(mode: SearchMode) -> NullCategory {
    match mode {
        SearchMode::IncludeEmpty => NullCategory::EmptyItem,
        SearchMode::All | SearchMode::Everything => NullCategory::EmptyQuery,
        SearchMode::Default => unreachable!("default mode has no hidden entry"),
    }
}
