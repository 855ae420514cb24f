// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! ORDER BY pipeline and driver entry points
//!
//! `get_tuple` runs the executor to completion on first call, feeding every
//! match with its per-key distances into an external sort, then streams the
//! ranked rows. When alternative order makes the index itself deliver the
//! first ORDER BY key monotonically, the sort is skipped and a forward pass
//! is followed by one reversed pass to cover the other side of the query
//! point ("seek then two-way stream").

use super::{ScanKey, ScanState};
use crate::opclass::{KeyCheck, NullCategory};
use crate::scan::ScanEntry;
use crate::sort::{RumSortItem, Tuplesort};
use crate::state::RumState;
use crate::tidbitmap::TidBitmap;
use crate::{item::ItemPointer, scan::ScanType};
use log::{debug, trace};

/// Distance of the current item under one ORDER BY key.
fn key_get_ordering(
    state: &RumState,
    key: &mut ScanKey,
    entries: &[ScanEntry<'_>],
    iptr: &ItemPointer,
) -> f64 {
    if key.use_add_to_column {
        // ranked by the attached column's value discovered during the scan
        let Some(outer) = &key.outer_add_info else {
            return f64::INFINITY;
        };

        let attach = state.attach_attnum.expect("attach column configured");
        return state.opclass(attach).outer_ordering(
            outer,
            key.query_values.first().expect("order query value"),
            key.strategy,
        );
    }

    if key.use_cur_key {
        // ranked by the discovered key value (full-index walks)
        let Some((cur_key, category)) = &key.cur_key else {
            return f64::INFINITY;
        };
        if *category != NullCategory::NormKey {
            return f64::INFINITY;
        }

        return state.opclass(key.attnum).key_ordering(
            cur_key,
            key.query.as_ref().expect("order key has a query"),
            key.strategy,
        );
    }

    for (i, &e) in key.entries.clone().iter().enumerate() {
        let entry = &entries[e];
        if !entry.is_finished && entry.cur_item.iptr == *iptr {
            key.entry_res[i] = true;
            key.add_info[i] = entry.cur_item.add_info.clone();
        } else {
            key.entry_res[i] = false;
            key.add_info[i] = None;
        }
    }

    let check = KeyCheck {
        matches: &key.entry_res,
        add_info: &key.add_info,
        query_keys: &key.query_values,
        query_categories: &key.query_categories,
    };

    state.opclass(key.attnum).ordering(
        &check,
        key.strategy,
        key.query.as_ref().expect("order key has a query"),
        key.n_user_entries,
    )
}

impl<'a> ScanState<'a> {
    /// Evaluates every ORDER BY key at the current item, propagating the
    /// discovered addInfo / key value from the filter keys first. Ordering
    /// state is consumed per item.
    fn current_distances(&mut self) -> Vec<f64> {
        let state = self.state;
        let iptr = self.item.iptr;

        if state.add_to_attnum.is_some() || self.will_sort {
            let mut outer: Option<crate::datum::Datum> = None;
            let mut cur_key: Option<(crate::datum::Datum, NullCategory)> = None;

            for key in &self.keys {
                if key.order_by {
                    continue;
                }
                if outer.is_none()
                    && Some(key.attnum) == state.add_to_attnum
                    && key.outer_add_info.is_some()
                {
                    outer = key.outer_add_info.clone();
                }
                if cur_key.is_none() && key.cur_key.is_some() {
                    cur_key = key.cur_key.clone();
                }
            }

            for key in &mut self.keys {
                if !key.order_by {
                    continue;
                }
                if key.use_add_to_column && key.outer_add_info.is_none() {
                    key.outer_add_info = outer.clone();
                }
                if key.use_cur_key && cur_key.is_some() {
                    key.cur_key = cur_key.clone();
                }
            }
        }

        let mut data = Vec::with_capacity(self.order_bys.len());
        {
            let ScanState { keys, entries, .. } = self;
            for key in keys.iter_mut() {
                if !key.order_by {
                    continue;
                }
                data.push(key_get_ordering(state, key, entries, &iptr));
            }
        }

        for key in &mut self.keys {
            if key.order_by && key.use_add_to_column {
                key.outer_add_info = None;
            }
        }

        data
    }

    /// Feeds the accepted item with its distances into the output sorter.
    fn insert_scan_item(&mut self, recheck: bool) -> crate::Result<()> {
        let iptr = self.item.iptr;
        let data = self.current_distances();

        self.sortstate
            .as_mut()
            .expect("order-by scan without a sorter")
            .put(RumSortItem {
                iptr,
                recheck,
                data,
            })
    }

    /// Flips every scan direction and restarts: the second pass of a
    /// natural-order ORDER BY scan.
    fn reverse_scan(&mut self) -> crate::Result<()> {
        debug!("natural-order scan exhausted, reversing for second pass");

        let quals = self.quals.clone();
        let order_bys = self.order_bys.clone();

        self.free_scan_keys();
        self.quals = quals;
        self.order_bys = order_bys;
        self.new_scan_key()?;

        for key in &mut self.keys {
            key.direction = key.direction.reverse();
        }
        for entry in &mut self.entries {
            entry.direction = entry.direction.reverse();
        }

        self.start_scan()
    }

    /// Returns the next tuple in ORDER BY (or natural) order; the result is
    /// published in `heap_ptr`, `recheck` and `order_by_vals`.
    pub fn get_tuple(&mut self) -> crate::Result<bool> {
        if self.first_call {
            if self.keys.is_empty() && self.entries.is_empty() {
                self.new_scan_key()?;
            }

            self.first_call = false;
            self.heap_ptr = None;

            if self.is_void_res {
                return Ok(false);
            }

            self.start_scan()?;

            if self.natural_order == crate::opclass::ScanDirection::NoMovement {
                self.sortstate = Some(Tuplesort::begin_rum(
                    self.state.config.work_mem_kb,
                    self.scan_type != ScanType::Full,
                ));

                // run the scan to completion, ranking every match
                loop {
                    self.state.check_for_interrupts()?;
                    let Some((item, recheck)) = self.scan_get_item()? else {
                        break;
                    };
                    self.item = item;
                    self.insert_scan_item(recheck)?;
                }

                self.sortstate
                    .as_mut()
                    .expect("just created")
                    .perform_sort()?;
            }
        }

        // natural order: stream directly, then reverse once
        if self.natural_order != crate::opclass::ScanDirection::NoMovement {
            if let Some((item, recheck)) = self.scan_get_item()? {
                self.item = item.clone();
                self.heap_ptr = Some(item.iptr);
                self.recheck = recheck;

                // the external sort is skipped, but the driver still gets
                // its per-key distances
                let distances = self.current_distances();
                for (i, v) in distances.iter().enumerate() {
                    if let Some(slot) = self.order_by_vals.get_mut(i) {
                        *slot = Some(*v);
                    }
                }

                trace!("natural-order hit {:?}", item.iptr);
                return Ok(true);
            }

            if !self.second_pass {
                self.reverse_scan()?;
                self.second_pass = true;
                return self.get_tuple();
            }

            return Ok(false);
        }

        // ranked output, with the duplicate-iptr guard
        let Some(sorter) = self.sortstate.as_mut() else {
            // unsatisfiable query, nothing was ever collected
            return Ok(false);
        };

        loop {
            let Some(item) = sorter.get_next()? else {
                return Ok(false);
            };

            if self.heap_ptr == Some(item.iptr) {
                continue;
            }

            self.heap_ptr = Some(item.iptr);
            self.recheck = item.recheck;

            for (i, v) in item.data.iter().enumerate() {
                if let Some(slot) = self.order_by_vals.get_mut(i) {
                    *slot = Some(*v);
                }
            }

            return Ok(true);
        }
    }

    /// Runs the scan to completion into a TID bitmap. Returns the number of
    /// tuples added.
    pub fn get_bitmap(&mut self, tbm: &mut TidBitmap) -> crate::Result<i64> {
        if self.keys.is_empty() && self.entries.is_empty() {
            self.new_scan_key()?;
        }

        if self.is_void_res {
            return Ok(0);
        }

        self.entries_incr_index = -1;
        self.start_scan()?;

        let mut ntids = 0i64;
        loop {
            self.state.check_for_interrupts()?;

            let Some((item, recheck)) = self.scan_get_item()? else {
                break;
            };
            self.item = item.clone();

            tbm.add_tuple(item.iptr, recheck);
            ntids += 1;
        }

        Ok(ntids)
    }
}
