// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Scan execution
//!
//! Three strategies share the entry cursors: the regular loop advances every
//! entry and intersects through `consistent`; the fast loop keeps entries
//! sorted by descending position and prunes whole frontier prefixes with
//! `preConsistent` before touching `consistent`; the full loop streams every
//! indexed occurrence off a keyless entry walk and treats the other keys as
//! filters. An alternative-order variant lets the addInfo-ordered key drive
//! and repeatedly re-synchronizes the remaining entries.

use super::{ScanEntry, ScanKey, ScanState, ScanType};
use crate::buffer::BufferManager;
use crate::item::RumItem;
use crate::opclass::{KeyCheck, SearchMode};
use crate::scan::stream::entry_ordered_by_add_info;
use crate::state::RumState;
use log::{debug, trace};
use std::cmp::Ordering;

/// Evaluates the addInfo filter keys riding on an add-to key, and remembers
/// the discovered addInfo for later ordering.
pub(crate) fn call_add_info_consistent(
    state: &RumState,
    key: &mut ScanKey,
    entries: &[ScanEntry<'_>],
) -> bool {
    if Some(key.attnum) != state.add_to_attnum {
        return true;
    }

    key.outer_add_info = None;

    if key.add_info_keys.is_empty() && !key.will_sort {
        return true;
    }

    for i in 0..key.entries.len() {
        if key.entry_res[i] && key.add_info[i].is_some() {
            key.outer_add_info = key.add_info[i].clone();
            break;
        }
    }

    if !key.add_info_keys.is_empty() {
        // a strict operator cannot match a null addInfo
        let Some(outer) = key.outer_add_info.clone() else {
            return false;
        };

        for subkey in &key.add_info_keys {
            for &e in &subkey.entries {
                let entry = &entries[e];
                let Some(query_key) = &entry.query_key else {
                    continue;
                };

                let cmp = state.opclass(entry.attnum).compare_partial(
                    query_key,
                    &outer,
                    entry.strategy,
                    entry.extra.as_ref(),
                );
                if cmp != 0 {
                    return false;
                }
            }
        }
    }

    true
}

/// Invokes a key's `consistent` predicate over the prepared match vector.
pub(crate) fn call_consistent(
    state: &RumState,
    key: &mut ScanKey,
    entries: &[ScanEntry<'_>],
) -> bool {
    let res = if key.search_mode == SearchMode::Everything {
        key.recheck_cur_item = false;
        true
    } else {
        // opclasses that do not know about rechecking force it
        key.recheck_cur_item = true;

        let check = KeyCheck {
            matches: &key.entry_res,
            add_info: &key.add_info,
            query_keys: &key.query_values,
            query_categories: &key.query_categories,
        };
        let query = key.query.as_ref().expect("non-everything key has a query");

        state.opclass(key.attnum).consistent(
            &check,
            key.strategy,
            query,
            key.n_user_entries,
            &mut key.recheck_cur_item,
        )
    };

    res && call_add_info_consistent(state, key, entries)
}

/// Positions `key.cur_item` at the smallest (in scan direction) current item
/// of its entries and evaluates `consistent` there.
pub(crate) fn key_get_item(state: &RumState, key: &mut ScanKey, entries: &[ScanEntry<'_>]) {
    debug_assert!(!key.is_finished);

    let mut min_item: Option<RumItem> = None;

    for &e in &key.entries {
        let entry = &entries[e];
        if entry.is_finished {
            continue;
        }

        let take = match &min_item {
            None => true,
            Some(min) => {
                let res = state.compare_rum_item(entry.attnum, &entry.cur_item, min);
                let res = if entry.direction.is_backward() {
                    res.reverse()
                } else {
                    res
                };
                res == Ordering::Less
            }
        };
        if take {
            min_item = Some(entry.cur_item.clone());
        }
    }

    let Some(min_item) = min_item else {
        key.is_finished = true;
        return;
    };

    // already tested this item pointer, no need to repeat the work
    if key.cur_item.iptr == min_item.iptr && key.cur_item.iptr.is_valid() {
        return;
    }

    key.cur_item = min_item;

    for (i, &e) in key.entries.clone().iter().enumerate() {
        let entry = &entries[e];
        if !entry.is_finished && entry.cur_item.iptr == key.cur_item.iptr {
            key.entry_res[i] = true;
            key.add_info[i] = entry.cur_item.add_info.clone();
        } else {
            key.entry_res[i] = false;
            key.add_info[i] = None;
        }
    }

    key.cur_item_matches = call_consistent(state, key, entries);
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum RegularStatus {
    Finished,
    NotFinished,
    NeedUpdateAdvancePast,
    Matches,
}

fn set_entry_past<'a>(
    state: &'a RumState,
    bufmgr: &BufferManager,
    entry: &mut ScanEntry<'a>,
    advance_past: &RumItem,
    scan_alt: bool,
    fuzzy_limit: u32,
) -> crate::Result<()> {
    loop {
        let skip = if entry.is_finished {
            true
        } else if scan_alt {
            let res = state.compare_rum_item(entry.attnum, &entry.cur_item, advance_past);
            let res = if entry.direction.is_backward() {
                res.reverse()
            } else {
                res
            };
            res == Ordering::Greater
        } else {
            let res = entry.cur_item.iptr.cmp(&advance_past.iptr);
            let res = if entry.direction.is_backward() {
                res.reverse()
            } else {
                res
            };
            res == Ordering::Greater
        };

        if skip {
            return Ok(());
        }

        entry.get_item(state, bufmgr, scan_alt, fuzzy_limit)?;

        // the first call has no position to advance past
        if !advance_past.iptr.is_valid() {
            return Ok(());
        }
    }
}

impl<'a> ScanState<'a> {
    /// Starts every entry cursor and key, applies the fuzzy limit, decides
    /// the execution strategy and (for fast scans) pre-sorts the entries.
    pub fn start_scan(&mut self) -> crate::Result<()> {
        let state = self.state;
        let bufmgr = self.bufmgr;

        for entry in &mut self.entries {
            entry.start(state, bufmgr)?;
        }

        let fuzzy = self.fuzzy_search_limit();
        if fuzzy > 0 {
            let live: Vec<usize> = (0..self.entries.len())
                .filter(|&i| !self.entries[i].detached)
                .collect();

            let threshold = live.len() as u64 * u64::from(fuzzy);
            let reduce = live
                .iter()
                .all(|&i| u64::from(self.entries[i].predict_number_result) > threshold);

            if reduce {
                debug!("fuzzy limit engaged, thinning {} entries", live.len());
                for &i in &live {
                    self.entries[i].predict_number_result /= live.len() as u32;
                    self.entries[i].reduce_result = true;
                }
            }
        }

        self.scan_with_alt_order_keys = false;
        for key in &mut self.keys {
            key.cur_item = RumItem::min();
            key.cur_item_matches = false;
            key.recheck_cur_item = false;
            key.is_finished = false;

            if !key.order_by
                && state.use_alternative_order
                && state.add_to_attnum == Some(key.attnum_orig)
            {
                self.scan_with_alt_order_keys = true;
            }
        }

        // strategy selection: a keyless walk forces the full loop; otherwise
        // the fast loop requires a preConsistent on every key and no partial
        // matches anywhere
        let mut scan_type = ScanType::Fast;
        for (i, key) in self.keys.iter().enumerate() {
            if i == 0 && !key.entries.is_empty() {
                let first = &self.entries[key.entries[0]];
                if first.scan_with_add_info {
                    scan_type = ScanType::Full;
                    break;
                }
            }

            if !state.opclass(key.attnum).supports_pre_consistent() {
                scan_type = ScanType::Regular;
                break;
            }
        }

        if scan_type == ScanType::Fast
            && self
                .entries
                .iter()
                .any(|e| !e.detached && e.is_partial_match)
        {
            scan_type = ScanType::Regular;
        }

        self.item = RumItem {
            iptr: crate::item::ItemPointer {
                blkno: crate::item::INVALID_BLOCK_NUMBER,
                offset: 0,
            },
            add_info: None,
        };

        if scan_type == ScanType::Fast {
            self.sorted_entries = (0..self.entries.len())
                .filter(|&i| !self.entries[i].detached)
                .collect();

            for idx in self.sorted_entries.clone() {
                if !self.entries[idx].is_finished {
                    self.entries[idx].get_item(state, bufmgr, false, fuzzy)?;
                }
            }

            let ScanState {
                sorted_entries,
                entries,
                ..
            } = self;
            sorted_entries.sort_by(|&a, &b| cmp_entries(state, &entries[b], &entries[a]));
        }

        trace!("scan strategy: {scan_type:?}");
        self.scan_type = scan_type;
        Ok(())
    }

    /// Advances every live entry past `advance_past` (alternative-order
    /// scans drive only the addInfo-ordered entries and rewind the rest).
    fn update_entries_regular(&mut self, advance_past: &RumItem) -> crate::Result<RegularStatus> {
        let state = self.state;
        let bufmgr = self.bufmgr;
        let scan_alt = self.scan_with_alt_order_keys;
        let fuzzy = self.fuzzy_search_limit();

        let mut status = RegularStatus::Finished;

        for entry in &mut self.entries {
            if entry.detached {
                continue;
            }

            if scan_alt && !entry_ordered_by_add_info(state, entry) {
                if entry.need_reset {
                    entry.reset_regular(state, bufmgr)?;
                }
                continue;
            }

            set_entry_past(state, bufmgr, entry, advance_past, scan_alt, fuzzy)?;

            if !entry.is_finished {
                status = RegularStatus::NotFinished;
            }
        }

        Ok(status)
    }

    /// Catches the non-alt entries up to `item` so the filter keys can be
    /// evaluated at the position the ordered key chose.
    fn sync_entries_to_item(&mut self, item: &RumItem) -> crate::Result<()> {
        let state = self.state;
        let bufmgr = self.bufmgr;
        let fuzzy = self.fuzzy_search_limit();

        for entry in &mut self.entries {
            if entry.detached || entry_ordered_by_add_info(state, entry) {
                continue;
            }

            while !entry.is_finished {
                let res = entry.cur_item.iptr.cmp(&item.iptr);
                let res = if entry.direction.is_backward() {
                    res.reverse()
                } else {
                    res
                };
                if res != Ordering::Less {
                    break;
                }
                entry.get_item(state, bufmgr, false, fuzzy)?;
            }

            entry.need_reset = true;
        }

        Ok(())
    }

    /// Evaluates all plain (non-alt, non-order) keys at their minimum item.
    fn update_keys_regular(&mut self, item: &mut RumItem) -> RegularStatus {
        let state = self.state;
        let scan_alt = self.scan_with_alt_order_keys;

        let mut status = RegularStatus::NotFinished;
        let mut item_set = item.iptr.is_valid() && scan_alt;

        let ScanState { keys, entries, .. } = self;

        for key in keys.iter_mut() {
            if key.order_by
                || (scan_alt
                    && state.use_alternative_order
                    && state.add_to_attnum == Some(key.attnum_orig))
            {
                continue;
            }

            key_get_item(state, key, entries);

            if key.is_finished {
                if scan_alt {
                    // the alt key drives; this key restarts next round
                    key.is_finished = false;
                    return RegularStatus::NeedUpdateAdvancePast;
                }
                return RegularStatus::Finished;
            }

            if !scan_alt {
                if !item_set {
                    *item = key.cur_item.clone();
                    item_set = true;
                }

                let cmp = state.compare_rum_item(key.attnum_orig, &key.cur_item, item);
                if cmp != Ordering::Equal {
                    status = RegularStatus::NeedUpdateAdvancePast;

                    let take = if key.direction.is_backward() {
                        cmp == Ordering::Greater
                    } else {
                        cmp == Ordering::Less
                    };
                    if take {
                        *item = key.cur_item.clone();
                    }
                }
            }

            if key.cur_item_matches && status != RegularStatus::NeedUpdateAdvancePast {
                status = RegularStatus::Matches;
            } else {
                status = RegularStatus::NeedUpdateAdvancePast;
            }
        }

        status
    }

    /// Evaluates the addInfo-ordered keys (alternative-order scans only).
    fn update_alt_keys_regular(&mut self, item: &mut RumItem) -> RegularStatus {
        let state = self.state;
        let mut status = RegularStatus::NotFinished;
        let mut item_set = false;

        let ScanState { keys, entries, .. } = self;

        for key in keys.iter_mut() {
            if key.order_by
                || !(state.use_alternative_order
                    && state.add_to_attnum == Some(key.attnum_orig))
            {
                continue;
            }

            key_get_item(state, key, entries);

            if key.is_finished {
                return RegularStatus::Finished;
            }

            if !item_set {
                *item = key.cur_item.clone();
                item_set = true;
            }

            let cmp = state.compare_rum_item(key.attnum_orig, &key.cur_item, item);
            if cmp != Ordering::Equal {
                status = RegularStatus::NeedUpdateAdvancePast;

                let take = if key.direction.is_backward() {
                    cmp == Ordering::Greater
                } else {
                    cmp == Ordering::Less
                };
                if take {
                    *item = key.cur_item.clone();
                }
            }

            if key.cur_item_matches && status != RegularStatus::NeedUpdateAdvancePast {
                status = RegularStatus::Matches;
            } else {
                status = RegularStatus::NeedUpdateAdvancePast;
            }
        }

        status
    }

    /// Regular scan: intersects all keys at one item pointer per round.
    fn scan_get_item_regular(&mut self) -> crate::Result<Option<(RumItem, bool)>> {
        let mut advance_past = self.item.clone();
        let mut item = RumItem::min();

        loop {
            self.state.check_for_interrupts()?;

            if self.update_entries_regular(&advance_past)? == RegularStatus::Finished {
                return Ok(None);
            }

            if self.scan_with_alt_order_keys {
                match self.update_alt_keys_regular(&mut item) {
                    RegularStatus::Finished => return Ok(None),
                    RegularStatus::NeedUpdateAdvancePast => {
                        advance_past = item.clone();
                        continue;
                    }
                    _ => {}
                }

                self.sync_entries_to_item(&item.clone())?;
            }

            match self.update_keys_regular(&mut item) {
                RegularStatus::Matches => break,
                RegularStatus::NeedUpdateAdvancePast => {
                    advance_past = item.clone();
                    continue;
                }
                RegularStatus::Finished => return Ok(None),
                RegularStatus::NotFinished => break,
            }
        }

        // catch order-by keys up with the accepted item, collect recheck
        let mut recheck = false;
        {
            let state = self.state;
            let bufmgr = self.bufmgr;
            let fuzzy = self.fuzzy_search_limit();
            let ScanState { keys, entries, .. } = self;

            for key in keys.iter_mut() {
                if key.order_by {
                    for &e in &key.entries {
                        let entry = &mut entries[e];
                        while !entry.is_finished
                            && state.compare_rum_item(key.attnum_orig, &entry.cur_item, &item)
                                == Ordering::Less
                        {
                            entry.get_item(state, bufmgr, false, fuzzy)?;
                        }
                    }
                } else if key.recheck_cur_item {
                    recheck = true;
                }
            }
        }

        Ok(Some((item, recheck)))
    }

    /// Calls `preConsistent` over the "might match at this frontier" vector.
    fn pre_consistent_check(&mut self) -> bool {
        let state = self.state;
        let ScanState { keys, entries, .. } = self;

        for key in keys.iter_mut() {
            if key.order_by || key.search_mode == SearchMode::Everything {
                continue;
            }
            if !state.opclass(key.attnum).supports_pre_consistent() {
                continue;
            }

            let mut has_false = false;
            for (i, &e) in key.entries.iter().enumerate() {
                key.entry_res[i] = entries[e].pre_value;
                if !entries[e].pre_value {
                    has_false = true;
                }
            }

            if !has_false {
                continue;
            }

            let query = key.query.as_ref().expect("non-everything key has a query");
            if !state.opclass(key.attnum).pre_consistent(
                &key.entry_res,
                key.strategy,
                query,
                key.n_user_entries,
            ) {
                return false;
            }
        }

        true
    }

    /// Advances the cheapest entry at or after `sorted_entries[i]`, keeping
    /// the descending order of the frontier.
    fn entry_shift(&mut self, i: usize, find: bool) -> crate::Result<()> {
        let state = self.state;
        let bufmgr = self.bufmgr;
        let fuzzy = self.fuzzy_search_limit();

        // move the entry with the smallest predicted set
        let mut min_index: Option<usize> = None;
        let mut min_predict = u32::MAX;
        for j in i..self.sorted_entries.len() {
            let predict = self.entries[self.sorted_entries[j]].predict_number_result;
            if min_index.is_none() || predict < min_predict {
                min_index = Some(j);
                min_predict = predict;
            }
        }
        let Some(mut min_index) = min_index else {
            return Ok(());
        };

        if find {
            debug_assert!(i > 0);
            let target = self.entries[self.sorted_entries[i - 1]].cur_item.clone();
            let idx = self.sorted_entries[min_index];
            self.entries[idx].find_item_ge(state, bufmgr, &target)?;
        } else {
            let idx = self.sorted_entries[min_index];
            if !self.entries[idx].is_finished {
                self.entries[idx].get_item(state, bufmgr, false, fuzzy)?;
            }
        }

        while min_index > 0 {
            let a = self.sorted_entries[min_index];
            let b = self.sorted_entries[min_index - 1];
            if cmp_entries(state, &self.entries[a], &self.entries[b]) != Ordering::Greater {
                break;
            }
            self.sorted_entries.swap(min_index, min_index - 1);
            min_index -= 1;
        }

        Ok(())
    }

    /// Fast scan: prune with `preConsistent` over the sorted entry frontier.
    fn scan_get_item_fast(&mut self) -> crate::Result<Option<(RumItem, bool)>> {
        if self.entries_incr_index >= 0 {
            for k in self.entries_incr_index as usize..self.sorted_entries.len() {
                self.entry_shift(k, false)?;
            }
            self.entries_incr_index = -1;
        }

        let n = self.sorted_entries.len();
        if n == 0 {
            return Ok(None);
        }

        'outer: loop {
            self.state.check_for_interrupts()?;

            // find the border where preConsistent first fails
            let mut pre_ok = true;
            let mut j = 0usize;
            let mut k_idx = 0usize;
            let mut fail_at = n;

            for i in 0..n {
                let e = self.sorted_entries[i];
                self.entries[e].pre_value = true;
            }

            for i in 1..n {
                let a = self.sorted_entries[i];
                let b = self.sorted_entries[i - 1];
                if cmp_entries(self.state, &self.entries[a], &self.entries[b])
                    == Ordering::Less
                {
                    k_idx = i;
                    while j < i {
                        let e = self.sorted_entries[j];
                        self.entries[e].pre_value = false;
                        j += 1;
                    }

                    if !self.pre_consistent_check() {
                        pre_ok = false;
                        fail_at = i;
                        break;
                    }
                }
            }

            if self.entries[self.sorted_entries[n - 1]].is_finished {
                return Ok(None);
            }

            if !pre_ok {
                self.entry_shift(fail_at, true)?;
                continue;
            }

            // the frontier bottom is the candidate item
            let candidate = self.entries[self.sorted_entries[n - 1]].cur_item.clone();

            let mut consistent = true;
            {
                let state = self.state;
                let ScanState { keys, entries, .. } = self;

                for key in keys.iter_mut() {
                    if key.order_by {
                        continue;
                    }

                    for (i, &e) in key.entries.clone().iter().enumerate() {
                        let entry = &entries[e];
                        if !entry.is_finished && entry.cur_item.iptr == candidate.iptr {
                            key.entry_res[i] = true;
                            key.add_info[i] = entry.cur_item.add_info.clone();
                        } else {
                            key.entry_res[i] = false;
                            key.add_info[i] = None;
                        }
                    }

                    if !call_consistent(state, key, entries) {
                        consistent = false;
                        break;
                    }
                }
            }

            if !consistent {
                for j2 in k_idx..n {
                    self.entry_shift(j2, false)?;
                }
                continue 'outer;
            }

            let mut recheck = false;
            for key in &self.keys {
                if !key.order_by && key.recheck_cur_item {
                    recheck = true;
                    break;
                }
            }

            self.entries_incr_index = k_idx as i32;

            return Ok(Some((candidate, recheck)));
        }
    }

    /// Full-index scan: the keyless entry streams every occurrence, other
    /// keys only rank or filter.
    fn scan_get_item_full(&mut self) -> crate::Result<Option<(RumItem, bool)>> {
        debug_assert!(!self.keys.is_empty() && !self.entries.is_empty());

        let state = self.state;
        let bufmgr = self.bufmgr;
        let fuzzy = self.fuzzy_search_limit();

        let drive_idx = *self.keys[0]
            .entries
            .first()
            .expect("full scan without a driving entry");
        debug_assert!(self.entries[drive_idx].scan_with_add_info);

        if self.entries[drive_idx].is_finished {
            return Ok(None);
        }

        let next_entry_list = self.entries[drive_idx].get_item(state, bufmgr, false, fuzzy)?;

        if self.entries[drive_idx].is_finished {
            return Ok(None);
        }

        let cur = self.entries[drive_idx].cur_item.clone();
        let cur_key = self.entries[drive_idx].cur_key.clone();

        {
            let ScanState { keys, entries, .. } = self;
            let key = &mut keys[0];
            key.entry_res[0] = true;
            key.add_info[0] = cur.add_info.clone();
            key.cur_key = cur_key;
            call_add_info_consistent(state, key, entries);
        }

        // a new entry list rewinds the order-by entries
        if next_entry_list {
            for (i, entry) in self.entries.iter_mut().enumerate() {
                if i == drive_idx || entry.detached {
                    continue;
                }
                if !entry.list.is_empty() {
                    entry.is_finished = false;
                    entry.offset = if entry.direction.is_forward() {
                        0
                    } else {
                        entry.list.len() as i32 - 1
                    };
                    entry.cur_item = RumItem::min();
                }
            }
        }

        for (i, entry) in self.entries.iter_mut().enumerate() {
            if i == drive_idx || entry.detached {
                continue;
            }

            while !entry.is_finished {
                let cmp = if !entry.cur_item.iptr.is_valid() {
                    Ordering::Less
                } else {
                    let res = state.compare_rum_item(entry.attnum, &entry.cur_item, &cur);
                    if entry.direction.is_backward() {
                        res.reverse()
                    } else {
                        res
                    }
                };
                if cmp != Ordering::Less {
                    break;
                }
                entry.get_item(state, bufmgr, false, fuzzy)?;
            }
        }

        Ok(Some((cur, false)))
    }

    /// Gets the next item pointer using whichever strategy the scan chose.
    pub fn scan_get_item(&mut self) -> crate::Result<Option<(RumItem, bool)>> {
        match self.scan_type {
            ScanType::Fast => self.scan_get_item_fast(),
            ScanType::Full => self.scan_get_item_full(),
            ScanType::Regular => self.scan_get_item_regular(),
        }
    }
}

/// Orders two entries by current position: finished entries last, then the
/// current item under the entry's direction.
pub(crate) fn cmp_entries(
    state: &RumState,
    e1: &ScanEntry<'_>,
    e2: &ScanEntry<'_>,
) -> Ordering {
    match (e1.is_finished, e2.is_finished) {
        (true, true) => return Ordering::Equal,
        (true, false) => return Ordering::Greater,
        (false, true) => return Ordering::Less,
        (false, false) => {}
    }

    if e1.attnum != e2.attnum {
        // keep columns apart; later columns sort first like their entries do
        return e2.attnum.cmp(&e1.attnum);
    }

    let res = state.compare_rum_item(e1.attnum, &e1.cur_item, &e2.cur_item);
    if e1.direction.is_backward() {
        res.reverse()
    } else {
        res
    }
}
