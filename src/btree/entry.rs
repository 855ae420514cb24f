// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Entry-tree flavor of the B-tree engine
//!
//! The entry tree is "static": tuples are never physically removed except
//! when an insert overwrites an obsolete leaf tuple, so instead of a
//! separate right bound each page's rightmost tuple serves as its bound.

use super::BtreeOps;
use crate::datum::Datum;
use crate::item::{BlockNumber, OffsetNumber, INVALID_OFFSET_NUMBER};
use crate::opclass::NullCategory;
use crate::page::Page;
use crate::state::RumState;
use crate::tuple::{form_interior_tuple, set_downlink, tuple_page_space, EntryTuple};
use std::cmp::Ordering;

/// Entry-tree operations around one search key
pub struct EntryBtree<'a> {
    state: &'a RumState,
    pub attnum: u16,
    pub key: Option<Datum>,
    pub category: NullCategory,

    pub search_mode: bool,
    pub full_scan: bool,

    /// Replace the obsolete tuple at the insert position first
    pub is_delete: bool,
    /// Pending tuple to place
    pub entry: Option<Vec<u8>>,

    /// After a child split: the old downlink must be redirected here
    right_blkno: Option<BlockNumber>,
}

impl<'a> EntryBtree<'a> {
    #[must_use]
    pub fn new(
        state: &'a RumState,
        attnum: u16,
        key: Option<Datum>,
        category: NullCategory,
    ) -> Self {
        Self {
            state,
            attnum,
            key,
            category,
            search_mode: false,
            full_scan: false,
            is_delete: false,
            entry: None,
            right_blkno: None,
        }
    }

    /// Compares the search key against a stored tuple.
    fn compare_to_tuple(&self, tuple: &EntryTuple<'_>) -> crate::Result<Ordering> {
        let (key, category) = self.state.tuple_key(tuple)?;
        Ok(self.state.compare_att_entries(
            self.attnum,
            self.key.as_ref(),
            self.category,
            tuple.attnum(),
            key.as_ref(),
            category,
        ))
    }

    fn prepare_page(&mut self, page: &mut Page, off: OffsetNumber) -> crate::Result<()> {
        if self.is_delete {
            debug_assert!(page.is_leaf());
            page.delete_item(off);
            self.is_delete = false;
        }

        if !page.is_leaf() {
            if let Some(right) = self.right_blkno.take() {
                set_downlink(page.item_mut(off), right);
            }
        } else {
            self.right_blkno = None;
        }

        Ok(())
    }
}

fn rightmost_tuple(page: &Page) -> crate::Result<EntryTuple<'_>> {
    let maxoff = page.max_offset_number();
    if maxoff == 0 {
        return Err(crate::Error::StructureCorrupt("empty entry page"));
    }
    EntryTuple::parse(page.item(maxoff)).map_err(crate::Error::Decode)
}

impl BtreeOps for EntryBtree<'_> {
    fn is_data(&self) -> bool {
        false
    }

    fn search_mode(&self) -> bool {
        self.search_mode
    }

    fn is_move_right(&self, page: &Page) -> crate::Result<bool> {
        if page.is_rightmost() {
            return Ok(false);
        }
        if self.full_scan {
            return Ok(false);
        }

        let tuple = rightmost_tuple(page)?;
        Ok(self.compare_to_tuple(&tuple)? == Ordering::Greater)
    }

    fn find_child_page(
        &mut self,
        page: &Page,
        predict_number: &mut u32,
    ) -> crate::Result<(BlockNumber, OffsetNumber)> {
        debug_assert!(!page.is_leaf());
        debug_assert!(!page.is_data());

        let maxoff = page.max_offset_number();

        if self.full_scan {
            *predict_number = predict_number.saturating_mul(u32::from(maxoff));
            let leftmost = EntryTuple::parse(page.item(1)).map_err(crate::Error::Decode)?;
            return Ok((leftmost.downlink(), 1));
        }

        let mut low = 1;
        let mut high = maxoff + 1;

        while high > low {
            let mid = low + (high - low) / 2;

            let result = if mid == maxoff && page.is_rightmost() {
                // right infinity
                Ordering::Less
            } else {
                let tuple = EntryTuple::parse(page.item(mid)).map_err(crate::Error::Decode)?;
                self.compare_to_tuple(&tuple)?
            };

            match result {
                Ordering::Equal => {
                    let tuple =
                        EntryTuple::parse(page.item(mid)).map_err(crate::Error::Decode)?;
                    return Ok((tuple.downlink(), mid));
                }
                Ordering::Greater => low = mid + 1,
                Ordering::Less => high = mid,
            }
        }

        debug_assert!(high >= 1 && high <= maxoff);
        let tuple = EntryTuple::parse(page.item(high)).map_err(crate::Error::Decode)?;
        Ok((tuple.downlink(), high))
    }

    fn find_item(&mut self, page: &Page) -> crate::Result<(bool, OffsetNumber)> {
        debug_assert!(page.is_leaf());
        debug_assert!(!page.is_data());

        if self.full_scan {
            return Ok((true, 1));
        }

        let maxoff = page.max_offset_number();
        if maxoff == 0 {
            return Ok((false, 1));
        }

        let mut low = 1;
        let mut high = maxoff + 1;

        while high > low {
            let mid = low + (high - low) / 2;
            let tuple = EntryTuple::parse(page.item(mid)).map_err(crate::Error::Decode)?;

            match self.compare_to_tuple(&tuple)? {
                Ordering::Equal => return Ok((true, mid)),
                Ordering::Greater => low = mid + 1,
                Ordering::Less => high = mid,
            }
        }

        Ok((false, high))
    }

    fn find_child_ptr(
        &self,
        page: &Page,
        child: BlockNumber,
        stored_off: OffsetNumber,
    ) -> crate::Result<OffsetNumber> {
        debug_assert!(!page.is_leaf());

        let mut maxoff = page.max_offset_number();

        // if the page hasn't changed, the stored offset is still right
        if stored_off >= 1 && stored_off <= maxoff {
            let tuple = EntryTuple::parse(page.item(stored_off)).map_err(crate::Error::Decode)?;
            if tuple.downlink() == child {
                return Ok(stored_off);
            }

            // the pointer usually only moves right
            for i in stored_off + 1..=maxoff {
                let tuple = EntryTuple::parse(page.item(i)).map_err(crate::Error::Decode)?;
                if tuple.downlink() == child {
                    return Ok(i);
                }
            }
            maxoff = stored_off - 1;
        }

        for i in 1..=maxoff {
            let tuple = EntryTuple::parse(page.item(i)).map_err(crate::Error::Decode)?;
            if tuple.downlink() == child {
                return Ok(i);
            }
        }

        Ok(INVALID_OFFSET_NUMBER)
    }

    fn is_enough_space(&self, page: &Page, off: OffsetNumber) -> crate::Result<bool> {
        let entry = self.entry.as_ref().expect("no pending entry tuple");
        debug_assert!(!page.is_data());

        let reclaimed = if self.is_delete {
            tuple_page_space(page.item(off).len())
        } else {
            0
        };

        Ok(page.free_space() + reclaimed >= tuple_page_space(entry.len()))
    }

    fn place_to_page(&mut self, page: &mut Page, off: OffsetNumber) -> crate::Result<()> {
        self.prepare_page(page, off)?;

        let entry = self.entry.take().expect("no pending entry tuple");
        match page.add_item(&entry, off) {
            Some(placed) if placed == off => Ok(()),
            _ => Err(crate::Error::StructureCorrupt(
                "failed to add item to entry page",
            )),
        }
    }

    fn split_page(
        &mut self,
        left_blkno: BlockNumber,
        right_blkno: BlockNumber,
        old_page: &Page,
        off: OffsetNumber,
    ) -> crate::Result<(Page, Page)> {
        let mut work = old_page.clone();
        self.prepare_page(&mut work, off)?;

        let entry = self.entry.take().expect("no pending entry tuple");
        let maxoff = work.max_offset_number();
        debug_assert!(off >= 1 && off <= maxoff + 1);

        let mut tuples: Vec<Vec<u8>> = Vec::with_capacity(maxoff as usize + 1);
        for i in 1..=maxoff {
            if i == off {
                tuples.push(entry.clone());
            }
            tuples.push(work.item(i).to_vec());
        }
        if off == maxoff + 1 {
            tuples.push(entry);
        }

        let totalsize: usize = tuples.iter().map(|t| tuple_page_space(t.len())).sum();

        let mut left = Page::new(old_page.flags());
        let mut right = Page::new(old_page.flags());

        // tuples are distributed by equal byte share, not equal count
        let mut lsize = 0usize;
        let mut left_rightmost: Option<Vec<u8>> = None;

        for tuple in tuples {
            let target = if lsize > totalsize / 2 {
                &mut right
            } else {
                lsize += tuple_page_space(tuple.len());
                left_rightmost = Some(tuple.clone());
                &mut left
            };

            if target.add_item(&tuple, 0).is_none() {
                return Err(crate::Error::StructureCorrupt(
                    "failed to add item while splitting entry page",
                ));
            }
        }

        let left_rightmost =
            left_rightmost.ok_or(crate::Error::StructureCorrupt("split left page empty"))?;
        let link = EntryTuple::parse(&left_rightmost).map_err(crate::Error::Decode)?;
        self.entry = Some(form_interior_tuple(&link, left_blkno));
        self.right_blkno = Some(right_blkno);

        Ok((left, right))
    }

    fn fill_root(
        &mut self,
        root: &mut Page,
        left_blkno: BlockNumber,
        left: &Page,
        right_blkno: BlockNumber,
        right: &Page,
    ) -> crate::Result<()> {
        // the root keeps its block but becomes internal
        root.init(left.flags() & !crate::page::flags::LEAF);

        for (blkno, page) in [(left_blkno, left), (right_blkno, right)] {
            let tuple = rightmost_tuple(page)?;
            let link = form_interior_tuple(&tuple, blkno);
            if root.add_item(&link, 0).is_none() {
                return Err(crate::Error::StructureCorrupt(
                    "failed to add item to new entry root",
                ));
            }
        }

        // the pending downlink was consumed by the root fill
        self.entry = None;
        self.right_blkno = None;
        Ok(())
    }
}
