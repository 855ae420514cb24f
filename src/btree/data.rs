// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Posting-tree flavor of the B-tree engine
//!
//! Internal pages hold an array of `{child, key}` posting items plus a right
//! bound; leaf pages hold the varbyte stream and a 32-anchor sparse index.
//! Leaf splits distribute items by encoded byte size, internal splits by
//! count — except on the rightmost page during a build, where the left page
//! is packed to maximize fan-in under monotonically growing item pointers.

use super::{find_leaf_page, BtreeOps, BtreeStack};
use crate::buffer::BufferManager;
use crate::item::{
    BlockNumber, ItemPointer, OffsetNumber, RumItem, INVALID_OFFSET_NUMBER,
};
use crate::meta::IndexStats;
use crate::opclass::ScanDirection;
use crate::page::{
    flags, posting_item_offset, read_posting_item, write_posting_item, Page,
    DATA_CONTENTS_OFFSET, DATA_INTERNAL_SIZE, LEAF_INDEX_COUNT, LEAF_INDEX_OFFSET, MAX_ALIGN,
    PACKED_ITEM_SIZE, PAGE_HEADER_SIZE, POSTING_ITEM_SIZE,
};
use crate::postinglist::{leaf_anchor, read_all_items, update_item_indexes, LeafCodec};
use crate::state::RumState;
use crate::wal::GenericXlog;
use log::trace;
use std::cmp::Ordering;

/// Reads posting item `off` (1-based) from an internal data page.
#[must_use]
pub fn posting_item(page: &Page, off: OffsetNumber) -> (BlockNumber, RumItem) {
    let pos = posting_item_offset(off);
    read_posting_item(&page.bytes()[pos..pos + POSTING_ITEM_SIZE])
}

/// Inserts a posting item at `off` (0 = append), shifting the tail right.
pub fn add_posting_item(page: &mut Page, off: OffsetNumber, child: BlockNumber, key: &RumItem) {
    debug_assert!(!page.is_leaf());
    let maxoff = page.maxoff();
    let target = if off == INVALID_OFFSET_NUMBER {
        maxoff + 1
    } else {
        off
    };

    let start = posting_item_offset(target);
    if target <= maxoff {
        let moved = (maxoff - target + 1) as usize * POSTING_ITEM_SIZE;
        page.bytes_mut()
            .copy_within(start..start + moved, start + POSTING_ITEM_SIZE);
    }
    write_posting_item(
        &mut page.bytes_mut()[start..start + POSTING_ITEM_SIZE],
        child,
        key,
    );
    page.set_maxoff(maxoff + 1);
}

/// Deletes the posting item at `off`, shifting the tail left.
pub fn delete_posting_item(page: &mut Page, off: OffsetNumber) {
    debug_assert!(!page.is_leaf());
    let maxoff = page.maxoff();
    debug_assert!(off >= 1 && off <= maxoff);

    if off != maxoff {
        let src = posting_item_offset(off + 1);
        let dst = posting_item_offset(off);
        let moved = (maxoff - off) as usize * POSTING_ITEM_SIZE;
        page.bytes_mut().copy_within(src..src + moved, dst);
    }
    page.set_maxoff(maxoff - 1);
}

/// Free bytes on an internal data page
#[must_use]
pub fn internal_free_space(page: &Page) -> usize {
    DATA_INTERNAL_SIZE - page.maxoff() as usize * POSTING_ITEM_SIZE
}

/// Result of a position search on a data leaf page
pub struct LeafSearch {
    pub found: bool,
    /// 1-based position of the match / insertion point (`maxoff + 1` when
    /// everything on the page is smaller)
    pub off: OffsetNumber,
    /// Byte position where item `off` starts (stream end for `maxoff + 1`)
    pub pos: usize,
    /// Item pointer written just before `pos`
    pub prev: ItemPointer,
}

/// Posting-tree operations around a batch of items to insert or look up
pub struct DataBtree<'a> {
    state: &'a RumState,
    pub attnum: u16,
    codec: LeafCodec,

    pub search_mode: bool,
    pub full_scan: bool,
    pub direction: ScanDirection,
    pub is_build: bool,

    /// Insert payload (or the single search key), consumed in order
    pub items: Vec<RumItem>,
    pub cur_item: usize,

    /// Parent downlink produced by a split
    pending_downlink: Option<(BlockNumber, RumItem)>,
    /// After a child split: the old downlink must be redirected here
    right_blkno: Option<BlockNumber>,
}

impl<'a> DataBtree<'a> {
    #[must_use]
    pub fn new(state: &'a RumState, attnum: u16) -> Self {
        Self {
            codec: state.leaf_codec(attnum),
            state,
            attnum,
            search_mode: false,
            full_scan: false,
            direction: ScanDirection::Forward,
            is_build: false,
            items: Vec::new(),
            cur_item: 0,
            pending_downlink: None,
            right_blkno: None,
        }
    }

    #[must_use]
    pub fn codec(&self) -> LeafCodec {
        self.codec
    }

    fn cmp(&self, a: &RumItem, b: &RumItem) -> Ordering {
        self.state.compare_rum_item(self.attnum, a, b)
    }

    fn current(&self) -> &RumItem {
        &self.items[self.cur_item]
    }

    /// Finds the position of `target` on a leaf page, narrowing the range
    /// with the sparse index first.
    pub fn find_in_leaf_page(&self, page: &Page, target: &RumItem) -> crate::Result<LeafSearch> {
        debug_assert!(page.is_data() && page.is_leaf());

        let mut pos = DATA_CONTENTS_OFFSET;
        let mut first: OffsetNumber = 1;
        let mut maxoff = page.maxoff();
        let mut item = RumItem::min();

        for j in 0..LEAF_INDEX_COUNT {
            let Some(anchor) = leaf_anchor(page, j) else {
                break;
            };

            let cmp = if self.codec.alt_order {
                self.cmp(&anchor.item, target)
            } else {
                anchor.item.iptr.cmp(&target.iptr)
            };

            if cmp == Ordering::Less {
                pos = DATA_CONTENTS_OFFSET + anchor.page_offset as usize;
                first = anchor.offset_number;
                item = anchor.item;
            } else {
                maxoff = anchor.offset_number - 1;
                break;
            }
        }

        for i in first..=maxoff {
            let out_pos = pos;
            let out_prev = item.iptr;

            pos = self
                .codec
                .read_item(page.bytes(), pos, &mut item)
                .map_err(crate::Error::Decode)?;

            match self.cmp(target, &item) {
                Ordering::Equal => {
                    return Ok(LeafSearch {
                        found: true,
                        off: i,
                        pos: out_pos,
                        prev: out_prev,
                    })
                }
                Ordering::Less => {
                    return Ok(LeafSearch {
                        found: false,
                        off: i,
                        pos: out_pos,
                        prev: out_prev,
                    })
                }
                Ordering::Greater => {}
            }
        }

        Ok(LeafSearch {
            found: false,
            off: page.maxoff() + 1,
            pos,
            prev: item.iptr,
        })
    }

    /// Merge-joins the pending items into a leaf page, stopping when the
    /// page runs out of space (remaining items go to the right sibling).
    fn leaf_place(&mut self, page: &mut Page) -> crate::Result<()> {
        let maxoff = page.maxoff();
        let search = self.find_in_leaf_page(page, self.current())?;

        let mut write_pos = search.pos;
        let mut prev = search.prev;

        // the tail of the old stream is re-encoded, keep a copy of it
        let tail = page.bytes()[search.pos..page.lower() as usize].to_vec();
        let mut tail_pos = 0usize;
        let mut tail_item = RumItem {
            iptr: search.prev,
            add_info: None,
        };
        let mut tail_off = search.off;
        let mut tail_item_loaded = false;

        let mut freespace = page.freespace() as usize;
        let mut insert_count: u16 = 0;
        let mut stop_append = false;

        loop {
            if !tail_item_loaded && tail_off <= maxoff {
                tail_pos = self
                    .codec
                    .read_item(&tail, tail_pos, &mut tail_item)
                    .map_err(crate::Error::Decode)?;
                tail_item_loaded = true;
            }

            let cmp = if tail_off <= maxoff && self.cur_item < self.items.len() {
                if stop_append {
                    Ordering::Less
                } else {
                    self.cmp(&tail_item, self.current())
                }
            } else if self.cur_item < self.items.len() {
                if stop_append {
                    break;
                }
                if page.is_rightmost() {
                    Ordering::Greater
                } else if self.cmp(&page.right_bound(), self.current()) != Ordering::Less {
                    // current item still belongs on this page
                    Ordering::Greater
                } else {
                    // the rest belongs on a following page
                    break;
                }
            } else if tail_off <= maxoff {
                Ordering::Less
            } else {
                break;
            };

            if cmp != Ordering::Greater {
                // keep the old item
                write_pos = self
                    .codec
                    .write_item(page.bytes_mut(), write_pos, &tail_item, &prev);
                prev = tail_item.iptr;
                tail_off += 1;
                tail_item_loaded = false;

                if cmp == Ordering::Equal {
                    // the item is already present, drop the duplicate
                    self.cur_item += 1;
                }
            } else {
                // insert the new item if it still fits
                let align_prefix = write_pos - (write_pos & !(MAX_ALIGN - 1));
                let new_size =
                    self.codec.item_size(align_prefix, self.current(), &prev) - align_prefix;

                if new_size <= freespace {
                    let before = write_pos;
                    write_pos =
                        self.codec
                            .write_item(page.bytes_mut(), write_pos, self.current(), &prev);
                    debug_assert_eq!(new_size, write_pos - before);

                    prev = self.current().iptr;
                    freespace -= new_size;
                    self.cur_item += 1;
                    insert_count += 1;
                } else {
                    stop_append = true;
                }
            }

            if write_pos > LEAF_INDEX_OFFSET {
                return Err(crate::Error::StructureCorrupt(
                    "posting stream overran data page",
                ));
            }
        }

        page.set_maxoff(maxoff + insert_count);
        update_item_indexes(page, &self.codec).map_err(crate::Error::Decode)?;
        Ok(())
    }

    fn prepare_internal(&mut self, page: &mut Page, off: OffsetNumber) {
        if !page.is_leaf() {
            if let Some(right) = self.right_blkno.take() {
                let (_, key) = posting_item(page, off);
                let pos = posting_item_offset(off);
                write_posting_item(
                    &mut page.bytes_mut()[pos..pos + POSTING_ITEM_SIZE],
                    right,
                    &key,
                );
            }
        } else {
            self.right_blkno = None;
        }
    }

    fn copy_right_bound(dst: &mut Page, src: &Page) {
        let (a, b) = (PAGE_HEADER_SIZE, PAGE_HEADER_SIZE + PACKED_ITEM_SIZE);
        let raw = src.bytes()[a..b].to_vec();
        dst.bytes_mut()[a..b].copy_from_slice(&raw);
    }

    /// Splits a leaf page by encoded byte size. On the rightmost page during
    /// a build, greedily pulls in as many pending items as two pages can
    /// safely hold.
    fn leaf_split(
        &mut self,
        left_blkno: BlockNumber,
        right_blkno: BlockNumber,
        old_page: &Page,
        off: OffsetNumber,
    ) -> crate::Result<(Page, Page)> {
        let old_items = read_all_items(old_page, &self.codec).map_err(crate::Error::Decode)?;
        let maxoff = old_items.len();
        let off = off as usize;
        debug_assert!(off >= 1 && off <= maxoff + 1);

        let mut merged: Vec<RumItem> = Vec::with_capacity(maxoff + 1);
        let mut totalsize = 0usize;
        let mut max_item_size = 0usize;
        let mut prev = ItemPointer::min();
        let mut take = 0usize;

        let push = |item: &RumItem,
                    merged: &mut Vec<RumItem>,
                    totalsize: &mut usize,
                    max_item_size: &mut usize,
                    prev: &mut ItemPointer| {
            let grown = self.codec.item_size(*totalsize, item, prev);
            *max_item_size = (*max_item_size).max(grown - *totalsize);
            *totalsize = grown;
            *prev = item.iptr;
            merged.push(item.clone());
        };

        if off <= maxoff {
            for item in &old_items[..off - 1] {
                push(item, &mut merged, &mut totalsize, &mut max_item_size, &mut prev);
            }
            push(
                &self.items[self.cur_item],
                &mut merged,
                &mut totalsize,
                &mut max_item_size,
                &mut prev,
            );
            take = 1;
            for item in &old_items[off - 1..] {
                push(item, &mut merged, &mut totalsize, &mut max_item_size, &mut prev);
            }
        } else {
            for item in &old_items {
                push(item, &mut merged, &mut totalsize, &mut max_item_size, &mut prev);
            }

            if old_page.is_rightmost() {
                // pack as many pending items as both halves can safely take,
                // assuming worst-case alignment and the delta restart on the
                // right page
                while self.cur_item + take < self.items.len() {
                    let candidate = &self.items[self.cur_item + take];
                    let grown = self.codec.item_size(totalsize, candidate, &prev);
                    let headroom =
                        2 * crate::page::DATA_PAGE_SIZE - 2 * max_item_size - 2 * MAX_ALIGN;

                    if take > 0 && grown >= headroom {
                        break;
                    }

                    max_item_size = max_item_size.max(grown - totalsize);
                    totalsize = grown;
                    prev = candidate.iptr;
                    merged.push(candidate.clone());
                    take += 1;
                }
            } else {
                push(
                    &self.items[self.cur_item],
                    &mut merged,
                    &mut totalsize,
                    &mut max_item_size,
                    &mut prev,
                );
                take = 1;
            }
        }

        // distribute: left page until its stream passes half the total
        let mut left = Page::new(old_page.flags());
        let mut right = Page::new(old_page.flags());

        let mut on_left = true;
        let mut write_pos = DATA_CONTENTS_OFFSET;
        let mut prev = ItemPointer::min();
        let mut count: u16 = 0;
        let mut max_left: Option<RumItem> = None;

        for item in &merged {
            let target = if on_left { &mut left } else { &mut right };
            write_pos = self
                .codec
                .write_item(target.bytes_mut(), write_pos, item, &prev);
            prev = item.iptr;
            count += 1;

            if write_pos > LEAF_INDEX_OFFSET {
                return Err(crate::Error::StructureCorrupt(
                    "posting stream overran page during split",
                ));
            }

            if on_left && write_pos - DATA_CONTENTS_OFFSET > totalsize / 2 {
                left.set_maxoff(count);
                max_left = Some(item.clone());

                on_left = false;
                write_pos = DATA_CONTENTS_OFFSET;
                prev = ItemPointer::min();
                count = 0;
            }
        }
        right.set_maxoff(count);

        let max_left = max_left.ok_or(crate::Error::StructureCorrupt(
            "leaf split produced no separator",
        ))?;

        left.set_right_bound(&max_left);
        Self::copy_right_bound(&mut right, old_page);

        update_item_indexes(&mut left, &self.codec).map_err(crate::Error::Decode)?;
        update_item_indexes(&mut right, &self.codec).map_err(crate::Error::Decode)?;

        self.pending_downlink = Some((left_blkno, max_left));
        self.right_blkno = Some(right_blkno);
        self.cur_item += take;

        trace!(
            "leaf split: {} items left, {} right, {} new consumed",
            left.maxoff(),
            right.maxoff(),
            take
        );

        Ok((left, right))
    }

    /// Splits an internal page by item count; during a build the rightmost
    /// page keeps the left half packed full.
    fn internal_split(
        &mut self,
        left_blkno: BlockNumber,
        right_blkno: BlockNumber,
        old_page: &Page,
        off: OffsetNumber,
    ) -> crate::Result<(Page, Page)> {
        let mut work = old_page.clone();
        self.prepare_internal(&mut work, off);

        let maxoff = work.maxoff();
        let mut vector: Vec<(BlockNumber, RumItem)> =
            (1..=maxoff).map(|i| posting_item(&work, i)).collect();

        let (child, key) = self
            .pending_downlink
            .take()
            .ok_or(crate::Error::StructureCorrupt("split without a downlink"))?;
        vector.insert(off as usize - 1, (child, key));

        let maxoff = maxoff + 1;

        // during a build the table is scanned front to back, so item
        // pointers grow monotonically and packing the left page maximizes
        // fan-in
        let capacity = (DATA_INTERNAL_SIZE / POSTING_ITEM_SIZE) as u16;
        let separator = if self.is_build && old_page.is_rightmost() {
            capacity.min(maxoff - 1)
        } else {
            maxoff / 2
        };

        let mut left = Page::new(old_page.flags());
        let mut right = Page::new(old_page.flags());

        for (i, (child, key)) in vector.iter().enumerate() {
            let target = if i < separator as usize {
                &mut left
            } else {
                &mut right
            };
            add_posting_item(target, INVALID_OFFSET_NUMBER, *child, key);
        }

        let (_, separator_key) = posting_item(&left, left.maxoff());
        left.set_right_bound(&separator_key);
        Self::copy_right_bound(&mut right, old_page);

        self.pending_downlink = Some((left_blkno, separator_key));
        self.right_blkno = Some(right_blkno);

        Ok((left, right))
    }
}

impl BtreeOps for DataBtree<'_> {
    fn is_data(&self) -> bool {
        true
    }

    fn search_mode(&self) -> bool {
        self.search_mode
    }

    fn is_move_right(&self, page: &Page) -> crate::Result<bool> {
        if page.is_rightmost() || self.full_scan {
            return Ok(false);
        }

        Ok(self.cmp(self.current(), &page.right_bound()) == Ordering::Greater)
    }

    fn find_child_page(
        &mut self,
        page: &Page,
        predict_number: &mut u32,
    ) -> crate::Result<(BlockNumber, OffsetNumber)> {
        debug_assert!(!page.is_leaf() && page.is_data());

        let maxoff = page.maxoff();
        if maxoff == 0 {
            return Err(crate::Error::StructureCorrupt("empty internal data page"));
        }

        if self.full_scan {
            *predict_number = predict_number.saturating_mul(u32::from(maxoff));
            let off = if self.direction.is_forward() {
                1
            } else {
                maxoff
            };
            let (child, _) = posting_item(page, off);
            return Ok((child, 1));
        }

        let mut low = 1;
        let mut high = maxoff + 1;

        while high > low {
            let mid = low + (high - low) / 2;

            let result = if mid == maxoff {
                // right infinity: the page was already chosen via its bound
                Ordering::Less
            } else {
                let (_, key) = posting_item(page, mid);
                self.cmp(self.current(), &key)
            };

            match result {
                Ordering::Equal => {
                    *predict_number =
                        predict_number.saturating_mul(u32::from(maxoff - mid));
                    let (child, _) = posting_item(page, mid);
                    return Ok((child, mid));
                }
                Ordering::Greater => low = mid + 1,
                Ordering::Less => high = mid,
            }
        }

        debug_assert!(high >= 1 && high <= maxoff);
        *predict_number = predict_number.saturating_mul(u32::from(maxoff - high).max(1));
        let (child, _) = posting_item(page, high);
        Ok((child, high))
    }

    fn find_item(&mut self, page: &Page) -> crate::Result<(bool, OffsetNumber)> {
        if self.full_scan {
            return Ok((true, 1));
        }

        let target = self.items[self.cur_item].clone();
        let search = self.find_in_leaf_page(page, &target)?;
        Ok((search.found, search.off))
    }

    fn find_child_ptr(
        &self,
        page: &Page,
        child: BlockNumber,
        stored_off: OffsetNumber,
    ) -> crate::Result<OffsetNumber> {
        debug_assert!(!page.is_leaf());

        let mut maxoff = page.maxoff();

        if stored_off >= 1 && stored_off <= maxoff {
            if posting_item(page, stored_off).0 == child {
                return Ok(stored_off);
            }

            for i in stored_off + 1..=maxoff {
                if posting_item(page, i).0 == child {
                    return Ok(i);
                }
            }
            maxoff = stored_off - 1;
        }

        for i in 1..=maxoff {
            if posting_item(page, i).0 == child {
                return Ok(i);
            }
        }

        Ok(INVALID_OFFSET_NUMBER)
    }

    fn is_enough_space(&self, page: &Page, _off: OffsetNumber) -> crate::Result<bool> {
        if page.is_leaf() {
            // worst case: varbyte restart from a zero item pointer plus
            // alignment padding
            let zero = ItemPointer::min();
            let size = self.codec.item_size(0, self.current(), &zero) + MAX_ALIGN;
            Ok(page.freespace() as usize >= size)
        } else {
            Ok(internal_free_space(page) >= POSTING_ITEM_SIZE)
        }
    }

    fn place_to_page(&mut self, page: &mut Page, off: OffsetNumber) -> crate::Result<()> {
        debug_assert!(page.is_data());

        if page.is_leaf() {
            self.right_blkno = None;
            self.leaf_place(page)
        } else {
            self.prepare_internal(page, off);
            let (child, key) = self
                .pending_downlink
                .take()
                .ok_or(crate::Error::StructureCorrupt("insert without a downlink"))?;
            add_posting_item(page, off, child, &key);
            Ok(())
        }
    }

    fn split_page(
        &mut self,
        left_blkno: BlockNumber,
        right_blkno: BlockNumber,
        old_page: &Page,
        off: OffsetNumber,
    ) -> crate::Result<(Page, Page)> {
        if old_page.is_leaf() {
            self.leaf_split(left_blkno, right_blkno, old_page, off)
        } else {
            self.internal_split(left_blkno, right_blkno, old_page, off)
        }
    }

    fn fill_root(
        &mut self,
        root: &mut Page,
        left_blkno: BlockNumber,
        left: &Page,
        right_blkno: BlockNumber,
        right: &Page,
    ) -> crate::Result<()> {
        root.init(flags::DATA);

        add_posting_item(root, INVALID_OFFSET_NUMBER, left_blkno, &left.right_bound());
        add_posting_item(
            root,
            INVALID_OFFSET_NUMBER,
            right_blkno,
            &right.right_bound(),
        );

        self.pending_downlink = None;
        self.right_blkno = None;
        Ok(())
    }
}

/// A prepared posting-tree descent (cursor state for scans and inserts)
pub struct PostingTreeScan<'a> {
    pub btree: DataBtree<'a>,
    pub root: BlockNumber,
    pub stack: Option<BtreeStack>,
}

/// Sets up a posting-tree descent.
pub fn prepare_scan_posting_tree<'a>(
    state: &'a RumState,
    attnum: u16,
    root: BlockNumber,
    search_mode: bool,
    direction: ScanDirection,
) -> crate::Result<PostingTreeScan<'a>> {
    let mut btree = DataBtree::new(state, attnum);
    btree.search_mode = search_mode;
    btree.full_scan = search_mode;
    btree.direction = direction;

    Ok(PostingTreeScan {
        btree,
        root,
        stack: None,
    })
}

impl PostingTreeScan<'_> {
    /// Descends to the first leaf: with a key, to the leaf containing it
    /// (range scans with a mark); without one, to the leftmost or rightmost
    /// leaf depending on direction.
    pub fn begin(&mut self, bufmgr: &BufferManager, key: Option<RumItem>) -> crate::Result<()> {
        if let Some(key) = key {
            self.btree.full_scan = false;
            self.btree.items = vec![key];
            self.btree.cur_item = 0;
        }

        let start = self.stack.take();
        self.stack = Some(find_leaf_page(&mut self.btree, bufmgr, self.root, start)?);
        Ok(())
    }
}

/// Creates a posting tree of a single leaf page holding `items` (which must
/// fit; the caller sized them against the data-page capacity).
pub fn create_posting_tree(
    state: &RumState,
    attnum: u16,
    bufmgr: &BufferManager,
    items: &[RumItem],
) -> crate::Result<BlockNumber> {
    let codec = state.leaf_codec(attnum);
    let buffer = bufmgr.new_buffer()?;

    let mut xlog = GenericXlog::start(bufmgr);
    let h = xlog.register(&buffer);
    let page = xlog.page_mut(h);
    page.init(flags::DATA | flags::LEAF);

    let mut pos = DATA_CONTENTS_OFFSET;
    let mut prev = ItemPointer::min();
    for item in items {
        pos = codec.write_item(page.bytes_mut(), pos, item, &prev);
        prev = item.iptr;
    }
    if pos > LEAF_INDEX_OFFSET {
        return Err(crate::Error::StructureCorrupt(
            "initial posting list overruns page",
        ));
    }
    page.set_maxoff(items.len() as u16);
    update_item_indexes(page, &codec).map_err(crate::Error::Decode)?;

    xlog.finish();

    trace!("created posting tree at {}", buffer.blkno());
    Ok(buffer.blkno())
}

/// Inserts items into an existing posting tree, deduplicating against
/// already-present occurrences.
pub fn insert_item_pointers(
    state: &RumState,
    attnum: u16,
    bufmgr: &BufferManager,
    root: BlockNumber,
    items: &[RumItem],
    mut stats: Option<&mut IndexStats>,
    is_build: bool,
) -> crate::Result<()> {
    let mut btree = DataBtree::new(state, attnum);
    btree.is_build = is_build;
    btree.items = items.to_vec();
    btree.cur_item = 0;

    while btree.cur_item < btree.items.len() {
        let stack = find_leaf_page(&mut btree, bufmgr, root, None)?;

        let (found, off) = {
            let page = stack.buffer.read();
            btree.find_item(&page)?
        };

        if found {
            // already present in the index
            btree.cur_item += 1;
            continue;
        }

        let mut stack = stack;
        stack.off = off;
        super::insert_value(&mut btree, bufmgr, stack, stats.as_deref_mut())?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn posting_item_insert_delete() {
        let mut page = Page::new(flags::DATA);

        let k = |n: u32| RumItem::new(ItemPointer::new(n, 1), None);
        add_posting_item(&mut page, INVALID_OFFSET_NUMBER, 10, &k(10));
        add_posting_item(&mut page, INVALID_OFFSET_NUMBER, 30, &k(30));
        add_posting_item(&mut page, 2, 20, &k(20));

        assert_eq!(3, page.maxoff());
        assert_eq!(10, posting_item(&page, 1).0);
        assert_eq!(20, posting_item(&page, 2).0);
        assert_eq!(30, posting_item(&page, 3).0);

        delete_posting_item(&mut page, 2);
        assert_eq!(2, page.maxoff());
        assert_eq!(30, posting_item(&page, 2).0);
    }
}
