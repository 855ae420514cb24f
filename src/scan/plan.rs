// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Scan planner
//!
//! Expands scan qualifiers through `extract_query` into keys and entries,
//! merging identical search conditions into shared entries, seeding hidden
//! placeholder entries for non-default search modes, and wiring the
//! alternative-order shortcuts (natural-order marks, addInfo filter keys).

use super::{hidden_entry_category, ScanKey, ScanQual, ScanState};
use crate::datum::Datum;
use crate::opclass::{
    NullCategory, ScanDirection, SearchMode, StrategyNumber, INVALID_STRATEGY,
};
use crate::scan::ScanEntry;
use log::debug;
use std::cmp::Ordering;

impl<'a> ScanState<'a> {
    /// Finds an existing equivalent entry or creates a new one. Entries with
    /// opclass-private extra data are never considered identical.
    #[allow(clippy::too_many_arguments)]
    fn fill_scan_entry(
        &mut self,
        attnum: u16,
        strategy: StrategyNumber,
        search_mode: SearchMode,
        query_key: Option<Datum>,
        query_category: NullCategory,
        is_partial_match: bool,
        extra: Option<crate::opclass::ExtraData>,
    ) -> usize {
        if extra.is_none() || !is_partial_match {
            for (i, prev) in self.entries.iter().enumerate() {
                if prev.extra.is_none()
                    && prev.is_partial_match == is_partial_match
                    && prev.strategy == strategy
                    && prev.search_mode == search_mode
                    && prev.attnum == attnum
                    && self.state.compare_entries(
                        attnum,
                        prev.query_key.as_ref(),
                        prev.query_category,
                        query_key.as_ref(),
                        query_category,
                    ) == Ordering::Equal
                {
                    return i;
                }
            }
        }

        self.entries.push(ScanEntry::new(
            attnum,
            strategy,
            search_mode,
            query_key,
            query_category,
            is_partial_match,
            extra,
        ));
        self.entries.len() - 1
    }

    /// Builds one scan key from the `extract_query` output.
    #[allow(clippy::too_many_arguments)]
    fn fill_scan_key(
        &mut self,
        attnum: u16,
        strategy: StrategyNumber,
        search_mode: SearchMode,
        query: Option<Datum>,
        query_entries: Vec<crate::opclass::QueryEntry>,
        order_by: bool,
    ) -> crate::Result<()> {
        let state = self.state;
        let n_user = query_entries.len();

        let mut key = ScanKey::new(attnum, strategy, search_mode, query, order_by);

        if order_by {
            if Some(attnum) == state.attach_attnum {
                // ORDER BY over the attached column: its distance comes from
                // the sibling column's addInfo discovered during the scan
                if n_user != 1 {
                    return Err(crate::Error::Unsupported(
                        "ordering by an attached column needs exactly one query value",
                    ));
                }
                if !state.opclass(attnum).supports_outer_ordering() {
                    return Err(crate::Error::Unsupported(
                        "opclass cannot order by additional info",
                    ));
                }
                if !state.key_attr(attnum).typbyval {
                    return Err(crate::Error::Unsupported(
                        "ordering by a pass-by-reference attached column",
                    ));
                }

                key.use_add_to_column = true;
                key.attnum = state.add_to_attnum.expect("attach implies add-to");
                key.query_values = query_entries.into_iter().map(|e| e.key).collect();
                key.query_categories = vec![NullCategory::NormKey];
                self.will_sort = true;
                self.keys.push(key);
                return Ok(());
            }

            if !state.opclass(attnum).supports_ordering()
                && !state.opclass(attnum).supports_key_ordering()
            {
                return Err(crate::Error::Unsupported(
                    "opclass does not support ordering",
                ));
            }
        }

        let n_entries = n_user + usize::from(search_mode != SearchMode::Default);

        key.n_user_entries = n_user;
        key.entry_res = vec![false; n_entries];
        key.add_info = vec![None; n_entries];

        for entry in &query_entries {
            if entry.partial_match && !state.opclass(attnum).supports_partial_match() {
                return Err(crate::Error::Unsupported(
                    "prefix comparison requires a comparePartial method",
                ));
            }

            key.query_values.push(entry.key.clone());
            key.query_categories.push(if entry.is_null {
                NullCategory::NullKey
            } else {
                NullCategory::NormKey
            });

            let idx = self.fill_scan_entry(
                attnum,
                strategy,
                search_mode,
                if entry.is_null {
                    None
                } else {
                    Some(entry.key.clone())
                },
                if entry.is_null {
                    NullCategory::NullKey
                } else {
                    NullCategory::NormKey
                },
                entry.partial_match,
                entry.extra.clone(),
            );
            key.entries.push(idx);
        }

        if search_mode != SearchMode::Default {
            // the hidden entry carries a fixed strategy so identical hidden
            // entries of different keys merge
            let category = hidden_entry_category(search_mode);
            let idx = self.fill_scan_entry(
                attnum,
                INVALID_STRATEGY,
                search_mode,
                None,
                category,
                false,
                None,
            );
            key.entries.push(idx);
        }

        self.keys.push(key);
        Ok(())
    }

    /// Expands one driver qualifier; a NULL comparison value makes the whole
    /// query unsatisfiable.
    fn init_scan_key(&mut self, qual: &ScanQual, order_by: bool) -> crate::Result<()> {
        let Some(value) = &qual.value else {
            self.is_void_res = true;
            return Ok(());
        };

        // an unrecognized strategy is a caller error, not a panic
        if !self.state.opclass(qual.attnum).supports_strategy(qual.strategy) {
            return Err(crate::Error::Unsupported("unrecognized strategy number"));
        }

        let extracted = self
            .state
            .opclass(qual.attnum)
            .extract_query(value, qual.strategy);

        // an opclass may not select Everything for itself
        let search_mode = match extracted.search_mode {
            SearchMode::Everything => SearchMode::All,
            other => other,
        };

        if extracted.entries.is_empty() && search_mode == SearchMode::Default {
            self.is_void_res = true;
            return Ok(());
        }

        self.fill_scan_key(
            qual.attnum,
            qual.strategy,
            search_mode,
            Some(value.clone()),
            extracted.entries,
            order_by,
        )
    }

    /// Scan direction an order-by strategy implies, per the opclass config.
    fn lookup_scan_direction(&self, attnum: u16, strategy: StrategyNumber) -> ScanDirection {
        for (strat, direction) in &self.state.rum_config(attnum).strategy_info {
            if *strat == strategy {
                return *direction;
            }
        }
        ScanDirection::NoMovement
    }

    /// When an alternative-order index serves an ORDER BY over the attached
    /// column, seed the add-to keys' entries with the order-by bound so the
    /// posting trees are entered at the right position and stream in index
    /// order.
    fn fill_mark_add_info(&mut self, order_key_idx: usize) -> crate::Result<()> {
        let add_to = self.state.add_to_attnum;
        let (order_attnum_orig, order_strategy, order_value) = {
            let key = &self.keys[order_key_idx];
            (
                key.attnum_orig,
                key.strategy,
                key.query_values.first().cloned(),
            )
        };

        let direction = self.lookup_scan_direction(order_attnum_orig, order_strategy);
        if direction == ScanDirection::NoMovement {
            return Ok(());
        }

        for i in 0..self.keys.len() {
            if self.keys[i].order_by || Some(self.keys[i].attnum) != add_to {
                continue;
            }

            if self.natural_order != ScanDirection::NoMovement && self.natural_order != direction {
                return Err(crate::Error::Unsupported(
                    "cannot scan in two directions at once",
                ));
            }

            let entry_indices = self.keys[i].entries.clone();
            for e in entry_indices {
                let entry = &mut self.entries[e];
                if entry.use_mark_add_info {
                    return Err(crate::Error::Unsupported(
                        "cannot order by more than one operator",
                    ));
                }
                entry.use_mark_add_info = true;
                entry.mark_add_info.add_info = order_value.clone();
                entry.direction = direction;
            }

            self.keys[i].direction = direction;
            self.natural_order = direction;
        }

        Ok(())
    }

    /// Aligns every add-to key (and its entries) with the natural order
    /// chosen above.
    fn adjust_scan_direction(&mut self) -> crate::Result<()> {
        if self.natural_order == ScanDirection::NoMovement {
            return Ok(());
        }

        for i in 0..self.keys.len() {
            if self.keys[i].order_by || Some(self.keys[i].attnum) != self.state.add_to_attnum {
                continue;
            }

            if self.keys[i].direction != self.natural_order {
                if self.keys[i].direction != ScanDirection::Forward
                    && self.keys[i].direction != ScanDirection::NoMovement
                {
                    return Err(crate::Error::Unsupported(
                        "cannot scan in two directions at once",
                    ));
                }

                self.keys[i].direction = self.natural_order;
                for e in self.keys[i].entries.clone() {
                    self.entries[e].direction = self.natural_order;
                }
            }
        }

        Ok(())
    }

    /// When both the attach column and the add-to column carry filter quals,
    /// the attach-side keys become addInfo filters of the add-to key: their
    /// range is evaluated against the addInfo found during the scan instead
    /// of scanning the attach column's entries separately.
    fn regroup_add_info_keys(&mut self) {
        let attach = self.state.attach_attnum;
        let add_to = self.state.add_to_attnum;

        let has_add_to = self
            .keys
            .iter()
            .any(|k| !k.order_by && Some(k.attnum_orig) == add_to);
        let has_attach = self
            .keys
            .iter()
            .any(|k| !k.order_by && Some(k.attnum_orig) == attach);

        if !(has_add_to && has_attach) {
            return;
        }

        let mut moved: Vec<ScanKey> = Vec::new();
        let mut kept: Vec<ScanKey> = Vec::new();

        for key in self.keys.drain(..) {
            if !key.order_by && Some(key.attnum_orig) == attach {
                moved.push(key);
            } else {
                kept.push(key);
            }
        }

        // detach the moved keys' entries from the cursor machinery
        for key in &moved {
            for &e in &key.entries {
                self.entries[e].detached = true;
            }
        }

        if let Some(target) = kept
            .iter_mut()
            .find(|k| !k.order_by && Some(k.attnum_orig) == add_to)
        {
            debug!("{} attach-side keys become addInfo filters", moved.len());
            target.add_info_keys = moved;
            self.keys = kept;
        } else {
            // cannot happen per has_add_to, but never drop user quals
            kept.extend(moved);
            self.keys = kept;
        }
    }

    /// Builds all scan keys and entries for the installed qualifiers
    /// (the `rescan` follow-up).
    pub fn new_scan_key(&mut self) -> crate::Result<()> {
        self.is_void_res = false;
        self.natural_order = ScanDirection::NoMovement;
        self.second_pass = false;
        self.entries_incr_index = -1;
        self.will_sort = false;

        let quals = self.quals.clone();
        let order_bys = self.order_bys.clone();

        for qual in &quals {
            self.init_scan_key(qual, false)?;
            if self.is_void_res {
                return Ok(());
            }
        }

        // with no regular keys, drive a full-index walk
        let mut check_empty_entry = false;
        if self.keys.is_empty() {
            check_empty_entry = true;
            self.fill_scan_key(
                1,
                INVALID_STRATEGY,
                SearchMode::Everything,
                None,
                Vec::new(),
                false,
            )?;
        }

        for qual in &order_bys {
            self.init_scan_key(qual, true)?;
            if self.is_void_res {
                return Ok(());
            }
        }

        // natural-order marks for attached-column ordering
        for i in 0..self.keys.len() {
            let is_attached_order = {
                let key = &self.keys[i];
                self.state.use_alternative_order
                    && key.order_by
                    && key.use_add_to_column
                    && Some(key.attnum) == self.state.add_to_attnum
            };
            if is_attached_order {
                self.fill_mark_add_info(i)?;
            }
        }

        let will_sort = self.will_sort;
        for key in &mut self.keys {
            key.will_sort = will_sort;
        }

        self.regroup_add_info_keys();
        self.adjust_scan_direction()?;

        // keyless full scans combined with ORDER BY walk the entry tree
        // with addInfo in tow
        if check_empty_entry && self.keys.len() > 1 {
            let first_entry = self.keys[0].entries.first().copied();
            if let Some(e) = first_entry {
                self.entries[e].scan_with_add_info = true;
            }
        }

        // full-scan ORDER BY keys that rank by the key value itself
        if check_empty_entry {
            for key in &mut self.keys {
                if key.order_by
                    && !key.use_add_to_column
                    && self.state.opclass(key.attnum_orig).supports_key_ordering()
                {
                    key.use_cur_key = true;
                    self.will_sort = true;
                }
            }

            if self.keys.len() > 1 {
                if let Some(&e) = self.keys[0].entries.first() {
                    self.entries[e].use_cur_key = true;
                }
            }
        }

        self.order_by_vals = vec![None; self.order_bys.len()];

        Ok(())
    }
}
