// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Vacuum
//!
//! Two phases: entry-tree leaves are scrubbed left to right (inline posting
//! lists re-encoded without the dead occurrences, posting-tree roots queued),
//! then each queued posting tree is compacted leaf by leaf. A non-root leaf
//! that comes out empty is spliced out of its sibling chain under a cleanup
//! latch, with the left-right-parent lock order, keeping its links intact so
//! concurrent scans can still step across it.

use crate::btree::data::{delete_posting_item, posting_item};
use crate::buffer::BufferManager;
use crate::item::{BlockNumber, ItemPointer, OffsetNumber, RumItem, INVALID_BLOCK_NUMBER};
use crate::meta::{IndexStats, ROOT_BLKNO};
use crate::page::{Page, DATA_CONTENTS_OFFSET};
use crate::postinglist::{update_item_indexes, LeafCodec};
use crate::state::RumState;
use crate::tuple::{form_tuple_raw, EntryTuple};
use crate::wal::GenericXlog;
use log::{debug, trace};

/// Result of a bulk delete / cleanup pass
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct VacuumStats {
    pub tuples_removed: u64,
    pub num_index_tuples: u64,
    pub pages_deleted: u32,
    pub pages_free: u32,
    pub num_pages: u32,
}

struct VacuumContext<'a, 'c> {
    state: &'a RumState,
    bufmgr: &'a BufferManager,
    is_deletable: &'c dyn Fn(&ItemPointer) -> bool,
    result: VacuumStats,
}

impl VacuumContext<'_, '_> {
    /// Filters one decoded posting stream. Returns `None` when nothing was
    /// removed.
    fn vacuum_posting_items(&mut self, items: &[RumItem]) -> Option<Vec<RumItem>> {
        let mut kept: Vec<RumItem> = Vec::with_capacity(items.len());
        let mut removed = 0u64;

        for item in items {
            if (self.is_deletable)(&item.iptr) {
                removed += 1;
            } else {
                kept.push(item.clone());
            }
        }

        self.result.tuples_removed += removed;
        self.result.num_index_tuples += kept.len() as u64;

        if removed == 0 {
            None
        } else {
            Some(kept)
        }
    }

    fn encode_items(codec: &LeafCodec, items: &[RumItem], buf: &mut [u8]) -> usize {
        let mut pos = 0;
        let mut prev = ItemPointer::min();
        for item in items {
            pos = codec.write_item(buf, pos, item, &prev);
            prev = item.iptr;
        }
        pos
    }

    /// Scrubs the leaves of one posting tree. Returns true when some
    /// non-root leaf became empty and phase two should run.
    fn vacuum_posting_tree_leaves(
        &mut self,
        attnum: u16,
        blkno: BlockNumber,
        is_root: bool,
    ) -> crate::Result<bool> {
        let codec = self.state.leaf_codec(attnum);
        let buffer = self.bufmgr.pin(blkno)?;

        // wait out concurrent pins; scans keep a pin on the page they sit on
        if is_root {
            drop(buffer.write_cleanup());
        }

        let (is_leaf, children) = {
            let page = buffer.read();
            if page.is_leaf() {
                (true, Vec::new())
            } else {
                let children: Vec<BlockNumber> = (1..=page.maxoff())
                    .map(|i| posting_item(&page, i).0)
                    .collect();
                (false, children)
            }
        };

        let mut has_void = false;

        if is_leaf {
            let items = {
                let page = buffer.read();
                crate::postinglist::read_all_items(&page, &codec).map_err(crate::Error::Decode)?
            };

            if let Some(kept) = self.vacuum_posting_items(&items) {
                let mut xlog = GenericXlog::start(self.bufmgr);
                let h = xlog.register(&buffer);
                let page = xlog.page_mut(h);

                let region_len = page.lower() as usize - DATA_CONTENTS_OFFSET;
                page.bytes_mut()[DATA_CONTENTS_OFFSET..DATA_CONTENTS_OFFSET + region_len].fill(0);

                let mut scratch = vec![0u8; crate::page::DATA_PAGE_SIZE];
                let used = Self::encode_items(&codec, &kept, &mut scratch);
                page.bytes_mut()[DATA_CONTENTS_OFFSET..DATA_CONTENTS_OFFSET + used]
                    .copy_from_slice(&scratch[..used]);

                page.set_maxoff(kept.len() as OffsetNumber);
                update_item_indexes(page, &codec).map_err(crate::Error::Decode)?;

                if !is_root && kept.is_empty() {
                    has_void = true;
                }
                xlog.finish();
            }
        } else {
            for child in children {
                if self.vacuum_posting_tree_leaves(attnum, child, false)? {
                    has_void = true;
                }
            }
        }

        Ok(has_void)
    }

    /// Splices one empty leaf out of the tree. Lock order: left sibling,
    /// cleanup on the target, right sibling, parent.
    fn delete_page(
        &mut self,
        delete_blkno: BlockNumber,
        parent_blkno: BlockNumber,
    ) -> crate::Result<bool> {
        loop {
            let d_buffer = self.bufmgr.pin(delete_blkno)?;

            let (left_blkno, right_blkno) = {
                let page = d_buffer.read();
                (page.leftlink(), page.rightlink())
            };

            // never remove the chain ends
            if left_blkno == INVALID_BLOCK_NUMBER || right_blkno == INVALID_BLOCK_NUMBER {
                return Ok(false);
            }

            let l_buffer = self.bufmgr.pin(left_blkno)?;
            let r_buffer = self.bufmgr.pin(right_blkno)?;
            let p_buffer = self.bufmgr.pin(parent_blkno)?;

            // a scan sitting on the page keeps it pinned; wait it out
            if d_buffer.try_write_cleanup().is_none() {
                std::thread::yield_now();
                continue;
            }

            let mut xlog = GenericXlog::start(self.bufmgr);
            let dh = xlog.register(&d_buffer);
            let lh = xlog.register(&l_buffer);
            let rh = xlog.register(&r_buffer);
            let ph = xlog.register(&p_buffer);

            // last chance to check: concurrent activity may have withdrawn
            // the page's eligibility
            let still_empty = xlog.page(dh).maxoff() == 0 && !xlog.page(dh).is_deleted();
            let links_ok = xlog.page(lh).rightlink() == delete_blkno
                && xlog.page(rh).leftlink() == delete_blkno;

            let parent_off = (1..=xlog.page(ph).maxoff())
                .find(|&i| posting_item(xlog.page(ph), i).0 == delete_blkno);

            if !still_empty {
                return Ok(false);
            }
            let Some(parent_off) = parent_off else {
                return Ok(false);
            };
            if !links_ok {
                xlog.abort();
                std::thread::yield_now();
                continue;
            }

            xlog.page_mut(lh).set_rightlink(right_blkno);
            xlog.page_mut(rh).set_leftlink(left_blkno);
            delete_posting_item(xlog.page_mut(ph), parent_off);

            // links stay in place so concurrent scans can finish stepping
            // across the dead page
            xlog.page_mut(dh).mark_deleted();

            xlog.finish();

            self.result.pages_deleted += 1;
            self.bufmgr.record_free_page(delete_blkno);

            trace!("deleted posting tree page {delete_blkno}");
            return Ok(true);
        }
    }

    /// Depth-first walk deleting empty leaves bottom-up.
    fn scan_to_delete(
        &mut self,
        blkno: BlockNumber,
        is_root: bool,
        parent_blkno: BlockNumber,
    ) -> crate::Result<bool> {
        let buffer = self.bufmgr.pin(blkno)?;

        let is_leaf = buffer.read().is_leaf();
        if !is_leaf {
            let mut i: OffsetNumber = 1;
            loop {
                let child = {
                    let page = buffer.read();
                    if i > page.maxoff() {
                        break;
                    }
                    posting_item(&page, i).0
                };

                if !self.scan_to_delete(child, false, blkno)? {
                    i += 1;
                }
                // on deletion the next child slid into offset i
            }
        }

        let empty = {
            let page = buffer.read();
            page.maxoff() == 0 && !page.is_deleted()
        };

        if empty && !is_root {
            drop(buffer);
            return self.delete_page(blkno, parent_blkno);
        }

        Ok(false)
    }

    fn vacuum_posting_tree(&mut self, attnum: u16, root: BlockNumber) -> crate::Result<()> {
        if !self.vacuum_posting_tree_leaves(attnum, root, true)? {
            return Ok(());
        }

        self.state.check_for_interrupts()?;
        self.scan_to_delete(root, true, INVALID_BLOCK_NUMBER)?;
        Ok(())
    }

    /// Scrubs one entry-tree leaf page, queuing posting-tree roots. Returns
    /// the modified page image, or `None` when nothing changed.
    fn vacuum_entry_page(
        &mut self,
        page: &Page,
        roots: &mut Vec<(u16, BlockNumber)>,
    ) -> crate::Result<Option<Page>> {
        let mut work: Option<Page> = None;

        for i in 1..=page.max_offset_number() {
            let raw = match &work {
                Some(w) => w.item(i).to_vec(),
                None => page.item(i).to_vec(),
            };
            let tuple = EntryTuple::parse(&raw).map_err(crate::Error::Decode)?;

            if tuple.is_posting_tree() {
                // posting trees are compacted later, deadlock-free
                roots.push((tuple.attnum(), tuple.posting_tree_root()));
                continue;
            }

            if tuple.n_posting() == 0 {
                continue;
            }

            let attnum = tuple.attnum();
            let codec = self.state.leaf_codec(attnum);
            let items = tuple.read_posting(&codec).map_err(crate::Error::Decode)?;

            let Some(kept) = self.vacuum_posting_items(&items) else {
                continue;
            };

            // re-form the tuple around the surviving occurrences; the entry
            // itself stays even when its posting list became empty
            let (key, category) = self.state.tuple_key(&tuple)?;
            let attr = self.state.key_attr(attnum);

            let mut scratch = vec![0u8; crate::page::DATA_PAGE_SIZE];
            let used = Self::encode_items(&codec, &kept, &mut scratch);
            let new_raw = form_tuple_raw(
                attnum,
                key.as_ref(),
                category,
                &attr,
                &scratch[..used],
                kept.len() as u16,
            )?;

            let target = work.get_or_insert_with(|| page.clone());
            if !target.replace_item(&new_raw, i) {
                return Err(crate::Error::StructureCorrupt(
                    "entry page cannot hold shrunken tuple",
                ));
            }
        }

        Ok(work)
    }
}

/// Deletes every occurrence for which `is_deletable` returns true.
pub fn bulk_delete(
    state: &RumState,
    bufmgr: &BufferManager,
    is_deletable: &dyn Fn(&ItemPointer) -> bool,
) -> crate::Result<VacuumStats> {
    let mut ctx = VacuumContext {
        state,
        bufmgr,
        is_deletable,
        result: VacuumStats::default(),
    };

    // descend to the leftmost entry leaf
    let mut blkno = ROOT_BLKNO;
    loop {
        let buffer = bufmgr.pin(blkno)?;
        let page = buffer.read();
        debug_assert!(!page.is_data());

        if page.is_leaf() {
            break;
        }

        let first = EntryTuple::parse(page.item(1)).map_err(crate::Error::Decode)?;
        blkno = first.downlink();
        if blkno == INVALID_BLOCK_NUMBER {
            return Err(crate::Error::StructureCorrupt("bad downlink"));
        }
    }

    // walk the leaf level left to right
    loop {
        state.check_for_interrupts()?;

        let buffer = bufmgr.pin(blkno)?;
        let mut roots: Vec<(u16, BlockNumber)> = Vec::new();

        let (modified, rightlink) = {
            let page = buffer.read();
            (ctx.vacuum_entry_page(&page, &mut roots)?, page.rightlink())
        };

        if let Some(new_page) = modified {
            let mut xlog = GenericXlog::start(bufmgr);
            let h = xlog.register(&buffer);
            *xlog.page_mut(h) = new_page;
            xlog.finish();
        }
        drop(buffer);

        for (attnum, root) in roots {
            ctx.vacuum_posting_tree(attnum, root)?;
            state.check_for_interrupts()?;
        }

        if rightlink == INVALID_BLOCK_NUMBER {
            break;
        }
        blkno = rightlink;
    }

    debug!(
        "bulk delete removed {} occurrences, deleted {} pages",
        ctx.result.tuples_removed, ctx.result.pages_deleted
    );
    Ok(ctx.result)
}

/// Post-delete cleanup: refreshes the metapage statistics and reports free
/// pages. Fresh (never initialized) pages go back to the free-space map.
pub fn vacuum_cleanup(
    state: &RumState,
    bufmgr: &BufferManager,
    stats: Option<VacuumStats>,
) -> crate::Result<VacuumStats> {
    let mut stats = stats.unwrap_or_default();
    let mut idx_stats = IndexStats::default();

    let npages = bufmgr.n_pages();

    for blkno in ROOT_BLKNO..npages {
        state.check_for_interrupts()?;

        let buffer = bufmgr.pin(blkno)?;
        let page = buffer.read();

        if page.is_new() {
            bufmgr.record_free_page(blkno);
            stats.pages_free += 1;
        } else if page.is_deleted() {
            // already recorded when it was spliced out
            stats.pages_free += 1;
        } else if page.is_data() {
            idx_stats.n_data_pages += 1;
        } else {
            idx_stats.n_entry_pages += 1;
            if page.is_leaf() {
                idx_stats.n_entries += i64::from(page.max_offset_number());
            }
        }
    }

    idx_stats.n_total_pages = npages;
    crate::insert::update_stats(bufmgr, &idx_stats)?;

    stats.num_pages = npages;
    Ok(stats)
}
