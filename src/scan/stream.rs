// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Entry cursor streams
//!
//! A scan entry delivers its occurrences one at a time in scan direction,
//! backed by one of three sources: an inline posting list held in memory, a
//! posting-tree cursor that materializes one leaf page at a time (latch
//! released, pin kept), or — for partial matches and keyless walks — an
//! external sorter fed by a range of the entry tree.

use super::{CollectState, ScanEntry};
use crate::btree::data::prepare_scan_posting_tree;
use crate::btree::entry::EntryBtree;
use crate::btree::{find_leaf_page, re_find_leaf_page, step, BtreeOps, BtreeStack};
use crate::buffer::BufferManager;
use crate::datum::Datum;
use crate::item::{ItemPointer, RumItem, INVALID_BLOCK_NUMBER};
use crate::meta::ROOT_BLKNO;
use crate::opclass::{NullCategory, SearchMode};
use crate::postinglist::read_all_items;
use crate::sort::{RumScanItem, SortCmp, Tuplesort};
use crate::state::RumState;
use crate::tuple::EntryTuple;
use log::trace;
use rand::Rng;
use std::cmp::Ordering;

/// True when this entry's posting trees are stored in (addInfo, iptr) order.
pub(crate) fn entry_ordered_by_add_info(state: &RumState, entry: &ScanEntry<'_>) -> bool {
    state.use_alternative_order && state.add_to_attnum == Some(entry.attnum)
}

/// Steps an entry-tree stack to the right sibling once the current page is
/// exhausted. Returns false at the rightmost page's end.
pub(crate) fn move_right_if_needed(
    stack: &mut BtreeStack,
    bufmgr: &BufferManager,
) -> crate::Result<bool> {
    loop {
        let (maxoff, rightmost, rightlink) = {
            let page = stack.buffer.read();
            (page.max_offset_number(), page.is_rightmost(), page.rightlink())
        };

        if stack.off <= maxoff {
            return Ok(true);
        }
        if rightmost {
            return Ok(false);
        }

        stack.buffer = bufmgr.pin(rightlink)?;
        stack.blkno = rightlink;
        stack.off = 1;
    }
}

fn invalid_iptr() -> ItemPointer {
    ItemPointer {
        blkno: INVALID_BLOCK_NUMBER,
        offset: 0,
    }
}

impl<'a> ScanEntry<'a> {
    fn cmp(&self, state: &RumState, a: &RumItem, b: &RumItem) -> Ordering {
        state.compare_rum_item(self.attnum, a, b)
    }

    fn cmp_dir(&self, state: &RumState, a: &RumItem, b: &RumItem) -> Ordering {
        let res = self.cmp(state, a, b);
        if self.direction.is_forward() {
            res
        } else {
            res.reverse()
        }
    }

    fn key_snapshot(
        &self,
        key: Option<&Datum>,
        category: NullCategory,
    ) -> Option<(Datum, NullCategory)> {
        if !self.use_cur_key {
            return None;
        }
        Some((
            key.cloned().unwrap_or(Datum::Inline(0)),
            category,
        ))
    }

    /// Loads the posting-tree leaf the cursor's descent ended on into the
    /// in-memory list and positions the cursor (honouring the addInfo mark).
    fn load_posting_tree_page(&mut self, state: &RumState) -> crate::Result<()> {
        let (buffer, predict) = {
            let gdi = self.gdi.as_ref().expect("posting tree cursor missing");
            let stack = gdi.stack.as_ref().expect("descent not begun");
            (stack.buffer.clone(), stack.predict_number)
        };

        let codec = state.leaf_codec(self.attnum);

        let page = buffer.read();
        self.predict_number_result = predict.saturating_mul(u32::from(page.maxoff()));
        self.list = read_all_items(&page, &codec).map_err(crate::Error::Decode)?;
        drop(page);

        self.buffer = Some(buffer);
        self.is_finished = self.set_list_position(state);
        if !self.is_finished {
            if let Some(item) = self.list.get(self.offset as usize) {
                self.cur_item = item.clone();
            }
        }
        Ok(())
    }

    /// Positions `offset` at the scan start: the list edge, or the first
    /// item at/after the addInfo mark. Returns true when nothing qualifies.
    fn set_list_position(&mut self, state: &RumState) -> bool {
        if !self.use_mark_add_info {
            self.offset = if self.direction.is_forward() {
                0
            } else {
                self.list.len() as i32 - 1
            };
            return false;
        }

        let mut lo = 0usize;
        let mut hi = self.list.len();

        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.cmp(state, &self.mark_add_info.clone(), &self.list[mid]) {
                Ordering::Less => hi = mid,
                Ordering::Greater => lo = mid + 1,
                Ordering::Equal => {
                    self.offset = mid as i32;
                    return false;
                }
            }
        }

        if self.direction.is_forward() {
            self.offset = hi as i32;
            hi >= self.list.len()
        } else {
            if hi == 0 {
                return true;
            }
            self.offset = hi as i32 - 1;
            false
        }
    }

    /// Collects every posting of one posting tree into the match sorter.
    fn scan_posting_tree_all(
        &mut self,
        state: &'a RumState,
        bufmgr: &BufferManager,
        root: crate::item::BlockNumber,
        key: Option<&Datum>,
        category: NullCategory,
    ) -> crate::Result<()> {
        let codec = state.leaf_codec(self.attnum);
        let snapshot = self.key_snapshot(key, category);

        let mut gdi = prepare_scan_posting_tree(
            state,
            self.attnum,
            root,
            true,
            crate::opclass::ScanDirection::Forward,
        )?;
        gdi.begin(bufmgr, None)?;

        let mut buffer = gdi
            .stack
            .as_ref()
            .expect("descent not begun")
            .buffer
            .clone();

        loop {
            state.check_for_interrupts()?;

            let (deleted, maxoff, rightmost) = {
                let page = buffer.read();
                (page.is_deleted(), page.maxoff(), page.is_rightmost())
            };

            if !deleted && maxoff >= 1 {
                let items = {
                    let page = buffer.read();
                    read_all_items(&page, &codec).map_err(crate::Error::Decode)?
                };
                let sorter = self
                    .match_sortstate
                    .as_mut()
                    .expect("collection without sorter");
                for item in items {
                    sorter.put(RumScanItem {
                        item,
                        key: snapshot.clone(),
                    })?;
                }
                self.predict_number_result += u32::from(maxoff);
            }

            if rightmost {
                return Ok(());
            }
            buffer = step(bufmgr, &buffer, crate::opclass::ScanDirection::Forward)?
                .ok_or(crate::Error::StructureCorrupt("broken sibling chain"))?;
        }
    }

    /// Walks the entry tree from the positioned stack, feeding all matching
    /// occurrences into the match sorter. Supports partial matches (ended by
    /// `compare_partial`) and ALL/EVERYTHING walks.
    ///
    /// Returns false if the tree was restructured underneath and the
    /// collection must restart from scratch.
    fn collect_matches(
        &mut self,
        state: &'a RumState,
        bufmgr: &BufferManager,
        stack: &mut BtreeStack,
    ) -> crate::Result<bool> {
        let add_info_cmp: Option<SortCmp<Datum>> = if entry_ordered_by_add_info(state, self) {
            let attach = state.attach_attnum.expect("alt order implies attach");
            let opclass = state.opclass(attach).clone();
            Some(std::sync::Arc::new(move |a: &Datum, b: &Datum| {
                opclass.compare(a, b)
            }))
        } else {
            None
        };

        self.match_sortstate = Some(Tuplesort::begin_rum_item(
            state.config.work_mem_kb,
            add_info_cmp,
        ));

        // a null query cannot partial-match anything
        if self.is_partial_match && !self.query_category.is_norm() {
            return Ok(true);
        }

        let codec = state.leaf_codec(self.attnum);
        let opclass = state.opclass(self.attnum).clone();

        loop {
            state.check_for_interrupts()?;

            if !move_right_if_needed(stack, bufmgr)? {
                return Ok(true);
            }

            let raw = {
                let page = stack.buffer.read();
                page.item(stack.off).to_vec()
            };
            let tuple = EntryTuple::parse(&raw).map_err(crate::Error::Decode)?;

            if tuple.attnum() != self.attnum {
                return Ok(true);
            }

            let (key, category) = state.tuple_key(&tuple)?;

            if self.is_partial_match {
                // partial matches never match nulls (or placeholders)
                if !category.is_norm() {
                    return Ok(true);
                }

                let cmp = opclass.compare_partial(
                    self.query_key.as_ref().expect("partial match needs a key"),
                    key.as_ref().expect("normal key"),
                    self.strategy,
                    self.extra.as_ref(),
                );

                if cmp > 0 {
                    return Ok(true);
                } else if cmp < 0 {
                    stack.off += 1;
                    continue;
                }
            } else if self.search_mode == SearchMode::All && category == NullCategory::NullItem {
                // ALL mode skips the trailing null-item placeholder
                return Ok(true);
            }

            if tuple.is_posting_tree() {
                let root = tuple.posting_tree_root();

                self.scan_posting_tree_all(state, bufmgr, root, key.as_ref(), category)?;

                // while the tree was walked, inserts may have moved our
                // entry; re-find it, or restart if the root grew a level
                {
                    let page = stack.buffer.read();
                    if !page.is_leaf() {
                        return Ok(false);
                    }
                }

                loop {
                    if !move_right_if_needed(stack, bufmgr)? {
                        return Err(crate::Error::StructureCorrupt("lost saved point in index"));
                    }

                    let raw = {
                        let page = stack.buffer.read();
                        page.item(stack.off).to_vec()
                    };
                    let found = EntryTuple::parse(&raw).map_err(crate::Error::Decode)?;
                    if found.attnum() != self.attnum {
                        return Err(crate::Error::StructureCorrupt("lost saved point in index"));
                    }

                    let (fkey, fcategory) = state.tuple_key(&found)?;
                    if state.compare_entries(
                        self.attnum,
                        fkey.as_ref(),
                        fcategory,
                        key.as_ref(),
                        category,
                    ) == Ordering::Equal
                    {
                        break;
                    }
                    stack.off += 1;
                }
            } else {
                let items = tuple.read_posting(&codec).map_err(crate::Error::Decode)?;
                let snapshot = self.key_snapshot(key.as_ref(), category);
                let n = items.len();

                let sorter = self
                    .match_sortstate
                    .as_mut()
                    .expect("collection without sorter");
                for item in items {
                    sorter.put(RumScanItem {
                        item,
                        key: snapshot.clone(),
                    })?;
                }
                self.predict_number_result += n as u32;
            }

            stack.off += 1;
        }
    }

    /// Positions the cursor at the first occurrence: finds the entry tuple,
    /// opens its posting tree or loads its posting list, or collects the
    /// partial-match range into the sorter.
    pub fn start(&mut self, state: &'a RumState, bufmgr: &BufferManager) -> crate::Result<()> {
        if self.detached {
            self.is_finished = true;
            return Ok(());
        }

        'restart: loop {
            self.buffer = None;
            self.cur_item = RumItem::min();
            self.offset = -1;
            self.list.clear();
            self.gdi = None;
            self.stack = None;
            self.match_sortstate = None;
            self.collect = CollectState::Start;
            self.reduce_result = false;
            self.predict_number_result = 0;
            self.need_reset = false;
            self.is_finished = true;

            let mut btree = EntryBtree::new(
                state,
                self.attnum,
                self.query_key.clone(),
                self.query_category,
            );
            btree.search_mode = true;

            let mut stack = find_leaf_page(&mut btree, bufmgr, ROOT_BLKNO, None)?;

            let (found, off) = {
                let page = stack.buffer.read();
                btree.find_item(&page)?
            };
            stack.off = off;

            if self.is_partial_match
                || (self.query_category == NullCategory::EmptyQuery && !self.scan_with_add_info)
            {
                // collect every matching TID; the entry search positioned us
                // at the first candidate (EmptyQuery sorts leftmost)
                if !self.collect_matches(state, bufmgr, &mut stack)? {
                    trace!("entry tree restructured during collection, restarting");
                    self.match_sortstate = None;
                    continue 'restart;
                }

                if let Some(sorter) = self.match_sortstate.as_mut() {
                    sorter.perform_sort()?;
                    self.collect = CollectState::Start;
                    self.is_finished = false;
                }
                return Ok(());
            }

            if found
                || (self.query_category == NullCategory::EmptyQuery && self.scan_with_add_info)
            {
                let maxoff = stack.buffer.read().max_offset_number();
                if stack.off > maxoff {
                    // keyless walk over an empty tree
                    return Ok(());
                }

                let raw = {
                    let page = stack.buffer.read();
                    page.item(stack.off).to_vec()
                };
                let tuple = EntryTuple::parse(&raw).map_err(crate::Error::Decode)?;

                if tuple.is_posting_tree() {
                    let root = tuple.posting_tree_root();

                    let mut gdi = prepare_scan_posting_tree(
                        state,
                        self.attnum,
                        root,
                        true,
                        self.direction,
                    )?;
                    let mark = if self.use_mark_add_info {
                        Some(self.mark_add_info.clone())
                    } else {
                        None
                    };
                    gdi.begin(bufmgr, mark)?;

                    self.gdi = Some(gdi);
                    self.load_posting_tree_page(state)?;
                } else if tuple.n_posting() > 0 {
                    let codec = state.leaf_codec(self.attnum);
                    self.list = tuple.read_posting(&codec).map_err(crate::Error::Decode)?;
                    self.predict_number_result = self.list.len() as u32;

                    self.is_finished = self.set_list_position(state);
                    if !self.is_finished {
                        if let Some(item) = self.list.get(self.offset as usize) {
                            self.cur_item = item.clone();
                        }
                    }
                }

                if self.use_cur_key {
                    self.cur_key = state.tuple_key(&tuple).ok().map(|(k, c)| {
                        (k.unwrap_or(Datum::Inline(0)), c)
                    });
                }

                if self.query_category == NullCategory::EmptyQuery && self.scan_with_add_info {
                    // remember the entry-tree position to continue the walk
                    stack.off += 1;
                    self.stack = Some(stack);
                    self.is_finished = false;
                }
            }

            return Ok(());
        }
    }

    /// Re-descends the posting tree after its root changed shape, resuming
    /// just past the current item.
    fn restart_posting_tree(
        &mut self,
        state: &'a RumState,
        bufmgr: &BufferManager,
    ) -> crate::Result<()> {
        let Some(gdi) = self.gdi.as_mut() else {
            self.is_finished = true;
            return Ok(());
        };

        gdi.stack = None;
        let key = if self.cur_item.iptr.is_valid() {
            gdi.btree.full_scan = false;
            Some(self.cur_item.clone())
        } else {
            None
        };
        gdi.begin(bufmgr, key)?;

        let stack = gdi.stack.as_ref().expect("descent not begun");
        self.buffer = Some(stack.buffer.clone());

        let codec = state.leaf_codec(self.attnum);
        let page = stack.buffer.read();
        let items = read_all_items(&page, &codec).map_err(crate::Error::Decode)?;
        drop(page);
        self.list = items;

        if self.cur_item.iptr.is_valid() {
            let cur = self.cur_item.clone();
            if self.direction.is_forward() {
                self.offset = self
                    .list
                    .partition_point(|it| self.cmp(state, it, &cur) != Ordering::Greater)
                    as i32;
            } else {
                let first_ge = self
                    .list
                    .partition_point(|it| self.cmp(state, it, &cur) == Ordering::Less);
                self.offset = first_ge as i32 - 1;
            }
        } else {
            self.offset = if self.direction.is_forward() {
                0
            } else {
                self.list.len() as i32 - 1
            };
        }
        Ok(())
    }

    /// Finds part of the current posting-tree page at/after `item` using the
    /// page's sparse index, loading the narrowed region into the list.
    fn scan_page(
        &mut self,
        state: &RumState,
        page: &crate::page::Page,
        item: &RumItem,
        equal_ok: bool,
    ) -> crate::Result<bool> {
        use crate::page::DATA_CONTENTS_OFFSET;
        use crate::postinglist::leaf_anchor;

        let codec = state.leaf_codec(self.attnum);

        if self.direction.is_forward() && !page.is_rightmost() {
            let cmp = self.cmp(state, &page.right_bound(), item);
            if cmp == Ordering::Less || (cmp != Ordering::Greater && !equal_ok) {
                return Ok(false);
            }
        }

        let mut pos = DATA_CONTENTS_OFFSET;
        let mut first: u16 = 1;
        let mut maxoff = page.maxoff();
        let mut iter_item = RumItem::min();

        for j in 0..crate::page::LEAF_INDEX_COUNT {
            let Some(anchor) = leaf_anchor(page, j) else {
                break;
            };

            let cmp = if codec.alt_order {
                self.cmp(state, &anchor.item, item)
            } else {
                anchor.item.iptr.cmp(&item.iptr)
            };

            if cmp == Ordering::Less || (cmp != Ordering::Greater && !equal_ok) {
                pos = DATA_CONTENTS_OFFSET + anchor.page_offset as usize;
                first = anchor.offset_number;
                iter_item.iptr = anchor.item.iptr;
                iter_item.add_info = anchor.item.add_info.clone();
            } else {
                if self.direction.is_backward() {
                    if let Some(next) = leaf_anchor(page, j + 1) {
                        maxoff = next.offset_number;
                    }
                } else {
                    maxoff = anchor.offset_number - 1;
                }
                break;
            }
        }

        if self.direction.is_backward() && first >= maxoff {
            first = 1;
            iter_item = RumItem::min();
            pos = DATA_CONTENTS_OFFSET;
        }

        if maxoff < first {
            return Ok(false);
        }

        self.list.clear();
        let mut bound: i32 = -1;
        let mut found_eq = false;

        for _ in first..=maxoff {
            pos = codec
                .read_item(page.bytes(), pos, &mut iter_item)
                .map_err(crate::Error::Decode)?;
            self.list.push(iter_item.clone());

            if bound != -1 {
                continue;
            }

            match self.cmp(state, item, &iter_item) {
                Ordering::Less => bound = self.list.len() as i32 - 1,
                Ordering::Equal => {
                    bound = self.list.len() as i32 - 1;
                    found_eq = true;
                }
                Ordering::Greater => {}
            }
        }

        if bound == -1 {
            if self.direction.is_backward() {
                self.offset = self.list.len() as i32 - 1;
                self.cur_item = self.list[self.offset as usize].clone();
                self.offset += self.direction.step();
                return Ok(true);
            }
            return Ok(false);
        }

        if found_eq {
            self.offset = bound;
            if !equal_ok {
                self.offset += self.direction.step();
            }
        } else if self.direction.is_backward() {
            self.offset = bound - 1;
        } else {
            self.offset = bound;
        }

        if self.offset < 0 || self.offset as usize >= self.list.len() {
            return Ok(false);
        }

        self.cur_item = self.list[self.offset as usize].clone();
        self.offset += self.direction.step();
        Ok(true)
    }

    /// Advances a posting-tree cursor by one item, stepping through sibling
    /// leaves as pages run out.
    fn get_next_item(&mut self, state: &'a RumState, bufmgr: &BufferManager) -> crate::Result<()> {
        let codec = state.leaf_codec(self.attnum);

        loop {
            if self.offset >= 0 && (self.offset as usize) < self.list.len() {
                self.cur_item = self.list[self.offset as usize].clone();
                self.offset += self.direction.step();
                return Ok(());
            }

            let Some(buffer) = self.buffer.clone() else {
                self.is_finished = true;
                return Ok(());
            };

            {
                let page = buffer.read();
                if !page.is_leaf() && !page.is_deleted() {
                    // the pinned page was the root and the tree grew a level
                    drop(page);
                    self.restart_posting_tree(state, bufmgr)?;
                    continue;
                }

                if !page.is_deleted() {
                    let target = self.cur_item.clone();
                    if self.scan_page(state, &page, &target, false)? {
                        return Ok(());
                    }
                }
            }

            // walk siblings until something qualifies
            loop {
                let buffer = self
                    .buffer
                    .clone()
                    .expect("sibling walk without a pinned page");

                let at_end = {
                    let page = buffer.read();
                    if self.direction.is_forward() {
                        page.is_rightmost()
                    } else {
                        page.is_leftmost()
                    }
                };

                if at_end {
                    self.buffer = None;
                    if let Some(gdi) = self.gdi.as_mut() {
                        gdi.stack = None;
                    }
                    self.cur_item.iptr = invalid_iptr();
                    self.is_finished = true;
                    return Ok(());
                }

                let next = step(bufmgr, &buffer, self.direction)?
                    .ok_or(crate::Error::StructureCorrupt("broken sibling chain"))?;
                if let Some(gdi) = self.gdi.as_mut() {
                    if let Some(stack) = gdi.stack.as_mut() {
                        stack.buffer = next.clone();
                        stack.blkno = next.blkno();
                    }
                }
                self.buffer = Some(next.clone());

                let page = next.read();
                if page.is_deleted() {
                    continue;
                }

                self.list = read_all_items(&page, &codec).map_err(crate::Error::Decode)?;
                drop(page);

                if self.direction.is_forward() {
                    let idx = if self.cur_item.iptr.is_valid() {
                        let cur = self.cur_item.clone();
                        self.list
                            .partition_point(|it| self.cmp(state, it, &cur) != Ordering::Greater)
                    } else {
                        0
                    };
                    if idx >= self.list.len() {
                        continue;
                    }
                    self.offset = idx as i32;
                } else {
                    if self.list.is_empty() {
                        continue;
                    }
                    self.offset = self.list.len() as i32 - 1;
                }

                self.cur_item = self.list[self.offset as usize].clone();
                self.offset += self.direction.step();
                return Ok(());
            }
        }
    }

    /// Moves a keyless full-index walk to the next entry tuple of its
    /// column, opening its posting list or tree. Returns true when a new
    /// entry list started (order-by entries must rewind then).
    fn get_next_item_list(
        &mut self,
        state: &'a RumState,
        bufmgr: &BufferManager,
    ) -> crate::Result<bool> {
        debug_assert!(self.direction.is_forward());

        self.buffer = None;
        self.cur_item = RumItem::min();
        self.offset = -1;
        self.list.clear();
        self.gdi = None;
        self.match_sortstate = None;
        self.reduce_result = false;
        self.predict_number_result = 0;

        let mut stack = self.stack.take().expect("keyless walk without a stack");

        if !move_right_if_needed(&mut stack, bufmgr)? {
            self.cur_item.iptr = invalid_iptr();
            self.is_finished = true;
            return Ok(false);
        }

        let raw = {
            let page = stack.buffer.read();
            page.item(stack.off).to_vec()
        };
        let tuple = EntryTuple::parse(&raw).map_err(crate::Error::Decode)?;

        if tuple.attnum() != self.attnum {
            self.cur_item.iptr = invalid_iptr();
            self.is_finished = true;
            return Ok(false);
        }

        if tuple.is_posting_tree() {
            let root = tuple.posting_tree_root();

            let mut gdi =
                prepare_scan_posting_tree(state, self.attnum, root, true, self.direction)?;
            gdi.begin(bufmgr, None)?;
            self.gdi = Some(gdi);
            self.load_posting_tree_page(state)?;
        } else if tuple.n_posting() > 0 {
            let codec = state.leaf_codec(self.attnum);
            self.list = tuple.read_posting(&codec).map_err(crate::Error::Decode)?;
            self.predict_number_result = self.list.len() as u32;
            self.is_finished = self.set_list_position(state);
        }

        if self.list.is_empty() {
            // an empty entry: keep walking
            stack.off += 1;
            self.stack = Some(stack);
            return self.get_next_item_list(state, bufmgr);
        }

        self.is_finished = false;
        self.cur_item = self.list[self.offset.max(0) as usize].clone();
        self.offset = self.offset.max(0) + self.direction.step();

        if self.use_cur_key {
            self.cur_key = state
                .tuple_key(&tuple)
                .ok()
                .map(|(k, c)| (k.unwrap_or(Datum::Inline(0)), c));
        }

        // remember the next tuple for the following call
        stack.off += 1;
        self.stack = Some(stack);

        Ok(true)
    }

    /// Sets `cur_item` to the next occurrence (or `is_finished`).
    ///
    /// Returns true when a keyless walk moved to a new entry list.
    pub fn get_item(
        &mut self,
        state: &'a RumState,
        bufmgr: &BufferManager,
        scan_with_alt_order_keys: bool,
        fuzzy_limit: u32,
    ) -> crate::Result<bool> {
        debug_assert!(!self.is_finished);

        let mut rng = rand::thread_rng();
        let mut drop_item = |predict: u32| {
            fuzzy_limit > 0 && rng.gen::<f64>() > f64::from(fuzzy_limit) / f64::from(predict.max(1))
        };

        let mut next_entry_list = false;

        if self.match_sortstate.is_some() {
            debug_assert!(self.direction.is_forward());

            loop {
                // drained on the previous call: deliver the end of stream
                if matches!(self.collect, CollectState::Drained) {
                    if scan_with_alt_order_keys && !entry_ordered_by_add_info(state, self) {
                        // keep the sorter; alt-order scans rewind these
                        // entries and drain them again
                        self.is_finished = true;
                        break;
                    }

                    self.is_finished = true;
                    self.match_sortstate = None;
                    break;
                }

                let (mut collected, mut have_collected) = match &self.collect {
                    CollectState::Pending(item) => (item.clone(), true),
                    _ => (
                        RumScanItem {
                            item: RumItem::min(),
                            key: None,
                        },
                        false,
                    ),
                };
                self.cur_item = RumItem::min();

                let mut exhausted = false;
                loop {
                    let Some(current) = self
                        .match_sortstate
                        .as_mut()
                        .expect("sorter disappeared")
                        .get_next()?
                    else {
                        exhausted = true;
                        self.cur_item = collected.item.clone();
                        if self.use_cur_key {
                            self.cur_key = collected.key.clone();
                        }
                        break;
                    };

                    if !have_collected || collected.item.iptr == current.item.iptr {
                        // merge equal item pointers, joining their addInfo
                        let joined = match (&collected.item.add_info, &current.item.add_info) {
                            (None, None) => None,
                            (Some(a), None) => Some(a.clone()),
                            (None, Some(b)) => Some(b.clone()),
                            (Some(a), Some(b)) => {
                                let opclass = state.opclass(self.attnum);
                                if have_collected && opclass.supports_join_add_info() {
                                    Some(opclass.join_add_info(a, b))
                                } else {
                                    Some(b.clone())
                                }
                            }
                        };

                        collected.item.iptr = current.item.iptr;
                        collected.item.add_info = joined;
                        if self.use_cur_key {
                            collected.key = current.key.clone();
                        }
                        have_collected = true;
                    } else {
                        self.cur_item = collected.item.clone();
                        if self.use_cur_key {
                            self.cur_key = collected.key.clone();
                        }
                        self.collect = CollectState::Pending(current);
                        break;
                    }
                }

                if exhausted {
                    self.collect = CollectState::Drained;

                    if self.cur_item.iptr.is_min() {
                        // even this call found nothing
                        self.is_finished = true;
                        if !(scan_with_alt_order_keys
                            && !entry_ordered_by_add_info(state, self))
                        {
                            self.match_sortstate = None;
                        }
                        break;
                    }
                }

                if !(self.reduce_result && drop_item(self.predict_number_result)) {
                    break;
                }
            }
        } else if self.buffer.is_none() {
            if self.offset >= 0 && (self.offset as usize) < self.list.len() {
                self.cur_item = self.list[self.offset as usize].clone();
                self.offset += self.direction.step();
            } else if self.stack.is_some() {
                next_entry_list = self.get_next_item_list(state, bufmgr)?;
            } else {
                self.cur_item.iptr = invalid_iptr();
                self.is_finished = true;
            }
        } else {
            loop {
                self.get_next_item(state, bufmgr)?;
                if self.is_finished
                    || !(self.reduce_result && drop_item(self.predict_number_result))
                {
                    break;
                }
            }

            if self.stack.is_some() && self.is_finished {
                self.is_finished = false;
                next_entry_list = self.get_next_item_list(state, bufmgr)?;
            }
        }

        Ok(next_entry_list)
    }

    /// Finds the first occurrence at or beyond `item` in scan direction
    /// (fast-scan skip step).
    pub fn find_item_ge(
        &mut self,
        state: &'a RumState,
        bufmgr: &BufferManager,
        item: &RumItem,
    ) -> crate::Result<()> {
        if self.list.is_empty() && self.buffer.is_none() {
            self.is_finished = true;
            return Ok(());
        }

        // the loaded part of the page may already cover the target
        let in_loaded_range = if self.list.is_empty() {
            false
        } else if self.direction.is_forward() {
            self.cmp(
                state,
                self.list.last().expect("nonempty"),
                item,
            ) != Ordering::Less
        } else {
            self.cmp(
                state,
                self.list.first().expect("nonempty"),
                item,
            ) != Ordering::Greater
        };

        if in_loaded_range {
            if self.cmp_dir(state, &self.cur_item.clone(), item) != Ordering::Less
                && self.offset >= 0
                && (self.offset as usize) < self.list.len()
                && self.cur_item.iptr == self.list[self.offset as usize].iptr
            {
                return Ok(());
            }

            while self.offset >= 0 && (self.offset as usize) < self.list.len() {
                let candidate = self.list[self.offset as usize].clone();
                if self.cmp_dir(state, &candidate, item) != Ordering::Less {
                    self.cur_item = candidate;
                    self.offset += self.direction.step();
                    return Ok(());
                }
                self.offset += self.direction.step();
            }
        }

        let Some(buffer) = self.buffer.clone() else {
            self.is_finished = true;
            return Ok(());
        };

        // check the rest of the current page
        {
            let page = buffer.read();
            if !page.is_deleted() && page.is_leaf() && self.scan_page(state, &page, item, true)? {
                return Ok(());
            }
        }

        // re-descend from the last known leaf, tolerating splits
        let Some(gdi) = self.gdi.as_mut() else {
            self.is_finished = true;
            return Ok(());
        };

        gdi.btree.items = vec![item.clone()];
        gdi.btree.cur_item = 0;
        gdi.btree.full_scan = false;

        let stack = match gdi.stack.take() {
            Some(mut stack) => {
                stack.buffer = buffer;
                stack
            }
            None => {
                self.is_finished = true;
                return Ok(());
            }
        };
        gdi.stack = Some(re_find_leaf_page(&mut gdi.btree, bufmgr, gdi.root, stack)?);
        let refound = gdi.stack.as_ref().expect("just set").buffer.clone();
        self.buffer = Some(refound.clone());

        {
            let page = refound.read();
            if page.is_leaf() && self.scan_page(state, &page, item, true)? {
                return Ok(());
            }
        }

        // at last, traverse by direction
        loop {
            let buffer = self.buffer.clone().expect("walk without a pinned page");
            let Some(next) = step(bufmgr, &buffer, self.direction)? else {
                self.cur_item.iptr = invalid_iptr();
                self.is_finished = true;
                return Ok(());
            };

            if let Some(gdi) = self.gdi.as_mut() {
                if let Some(stack) = gdi.stack.as_mut() {
                    stack.buffer = next.clone();
                    stack.blkno = next.blkno();
                }
            }
            self.buffer = Some(next.clone());

            let page = next.read();
            if !page.is_deleted() && self.scan_page(state, &page, item, true)? {
                return Ok(());
            }
        }
    }

    /// Rewinds the entry so it delivers its stream from the very beginning
    /// (alternative-order regular scans reset side entries every round).
    pub fn reset_regular(
        &mut self,
        state: &'a RumState,
        bufmgr: &BufferManager,
    ) -> crate::Result<()> {
        self.is_finished = false;
        self.need_reset = false;
        self.cur_item = RumItem::min();
        self.collect = CollectState::Start;

        if let Some(sorter) = self.match_sortstate.as_mut() {
            sorter.rescan()?;
            return Ok(());
        }

        if self.gdi.is_some() {
            self.restart_posting_tree(state, bufmgr)?;
            // deliver from the loaded position on the next get
            return Ok(());
        }

        self.offset = if self.direction.is_forward() {
            0
        } else {
            self.list.len() as i32 - 1
        };
        Ok(())
    }
}
