// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Insert path: retail inserts and the bulk build
//!
//! Each heap tuple is taken apart per column by the opclass, de-duplicated,
//! possibly re-labelled with the attached column's value as addInfo, and
//! flushed into the entry tree. Posting lists that outgrow the maximum entry
//! tuple size are converted into posting trees on the fly.

use crate::btree::data::{create_posting_tree, insert_item_pointers};
use crate::btree::entry::EntryBtree;
use crate::btree::{find_leaf_page, insert_value, BtreeOps};
use crate::buffer::BufferManager;
use crate::bulk::BuildAccumulator;
use crate::datum::Datum;
use crate::item::{ItemPointer, RumItem};
use crate::meta::{self, IndexStats, META_BLKNO, ROOT_BLKNO};
use crate::opclass::NullCategory;
use crate::page::flags;
use crate::state::RumState;
use crate::tuple::{form_posting_tree_tuple, form_tuple, EntryTuple};
use crate::wal::GenericXlog;
use log::debug;
use std::cmp::Ordering;

/// Merges two ordered occurrence arrays, dropping duplicates (the second
/// array's copy survives).
#[must_use]
pub fn merge_item_pointers(
    state: &RumState,
    attnum: u16,
    a: &[RumItem],
    b: &[RumItem],
) -> Vec<RumItem> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let mut ai = 0;
    let mut bi = 0;

    while ai < a.len() && bi < b.len() {
        match state.compare_rum_item(attnum, &a[ai], &b[bi]) {
            Ordering::Greater => {
                out.push(b[bi].clone());
                bi += 1;
            }
            Ordering::Equal => {
                out.push(b[bi].clone());
                bi += 1;
                ai += 1;
            }
            Ordering::Less => {
                out.push(a[ai].clone());
                ai += 1;
            }
        }
    }

    out.extend_from_slice(&a[ai..]);
    out.extend_from_slice(&b[bi..]);
    out
}

/// How many leading items fit onto one fresh posting-tree leaf.
fn initial_tree_item_count(state: &RumState, attnum: u16, items: &[RumItem]) -> usize {
    let codec = state.leaf_codec(attnum);

    let mut size = 0usize;
    let mut prev = ItemPointer::min();
    let mut count = 0usize;

    while count < items.len() {
        size = codec.item_size(size, &items[count], &prev);
        prev = items[count].iptr;
        count += 1;

        if size >= crate::page::DATA_PAGE_SIZE {
            return count - 1;
        }
    }

    count
}

/// Inserts one or more occurrences of a single key: enlarges a pre-existing
/// entry (or its posting tree) or creates a fresh leaf tuple.
///
/// `items` must be sorted with no duplicates.
#[allow(clippy::too_many_arguments)]
pub fn entry_insert(
    state: &RumState,
    bufmgr: &BufferManager,
    attnum: u16,
    key: Option<&Datum>,
    category: NullCategory,
    items: &[RumItem],
    mut stats: Option<&mut IndexStats>,
    is_build: bool,
) -> crate::Result<()> {
    if let Some(stats) = stats.as_deref_mut() {
        stats.n_entries += 1;
    }

    let attr = state.key_attr(attnum);
    let codec = state.leaf_codec(attnum);

    let mut btree = EntryBtree::new(state, attnum, key.cloned(), category);
    let mut stack = find_leaf_page(&mut btree, bufmgr, ROOT_BLKNO, None)?;

    let (found, off) = {
        let page = stack.buffer.read();
        btree.find_item(&page)?
    };
    stack.off = off;

    if found {
        let raw = stack.buffer.read().item(off).to_vec();
        let tuple = EntryTuple::parse(&raw).map_err(crate::Error::Decode)?;

        if tuple.is_posting_tree() {
            // add the occurrences to the existing posting tree
            let root = tuple.posting_tree_root();
            drop(stack);
            return insert_item_pointers(state, attnum, bufmgr, root, items, stats, is_build);
        }

        let old_items = tuple.read_posting(&codec).map_err(crate::Error::Decode)?;
        let merged = merge_item_pointers(state, attnum, items, &old_items);

        match form_tuple(attnum, key, category, &attr, &codec, &merged, false)? {
            Some(raw) => {
                btree.is_delete = true;
                btree.entry = Some(raw);
            }
            None => {
                // the posting list outgrew the tuple: move it into a tree
                debug!("converting posting list to posting tree (attnum {attnum})");

                let root = create_posting_tree(state, attnum, bufmgr, &old_items)?;
                if let Some(stats) = stats.as_deref_mut() {
                    stats.n_data_pages += 1;
                }
                insert_item_pointers(
                    state,
                    attnum,
                    bufmgr,
                    root,
                    items,
                    stats.as_deref_mut(),
                    is_build,
                )?;

                btree.is_delete = true;
                btree.entry = Some(form_posting_tree_tuple(attnum, key, category, &attr, root)?);
            }
        }
    } else {
        match form_tuple(attnum, key, category, &attr, &codec, items, false)? {
            Some(raw) => btree.entry = Some(raw),
            None => {
                // fail fast when the key alone does not fit
                let probe = form_posting_tree_tuple(attnum, key, category, &attr, 0)?;
                drop(probe);

                let head = initial_tree_item_count(state, attnum, items);
                let root = create_posting_tree(state, attnum, bufmgr, &items[..head])?;
                if let Some(stats) = stats.as_deref_mut() {
                    stats.n_data_pages += 1;
                }

                if head < items.len() {
                    insert_item_pointers(
                        state,
                        attnum,
                        bufmgr,
                        root,
                        &items[head..],
                        stats.as_deref_mut(),
                        is_build,
                    )?;
                }

                btree.entry = Some(form_posting_tree_tuple(attnum, key, category, &attr, root)?);
            }
        }
    }

    insert_value(&mut btree, bufmgr, stack, stats)
}

/// The attached column's value of the current heap tuple, if configured.
fn outer_add_info(state: &RumState, values: &[Option<Datum>]) -> Option<Datum> {
    let attach = state.attach_attnum?;
    values.get(attach as usize - 1).cloned().flatten()
}

/// Inserts the index entries for a single heap tuple (retail insert).
pub fn heap_tuple_insert(
    state: &RumState,
    bufmgr: &BufferManager,
    values: &[Option<Datum>],
    heap_ptr: ItemPointer,
) -> crate::Result<()> {
    debug_assert_eq!(values.len(), state.n_columns());

    let outer = outer_add_info(state, values);

    for attnum in 1..=state.n_columns() as u16 {
        let mut entries = state.extract_entries(attnum, values[attnum as usize - 1].as_ref());

        if state.add_to_attnum == Some(attnum) {
            // the attached value shadows whatever the opclass produced
            for entry in &mut entries {
                entry.add_info = outer.clone();
            }
        }

        for entry in entries {
            if entry.add_info.is_some() && state.add_attr(attnum).is_none() {
                return Err(crate::Error::ConfigConflict(
                    "column produced addInfo but has no addInfo type",
                ));
            }

            let item = RumItem::new(heap_ptr, entry.add_info.clone());
            entry_insert(
                state,
                bufmgr,
                attnum,
                entry.key.as_ref(),
                entry.category,
                &[item],
                None,
                false,
            )?;
        }
    }

    Ok(())
}

/// Initializes the fixed pages of an empty index (metapage + leaf root).
pub fn build_empty(bufmgr: &BufferManager) -> crate::Result<()> {
    let meta_buffer = bufmgr.new_buffer()?;
    let root_buffer = bufmgr.new_buffer()?;
    debug_assert_eq!(META_BLKNO, meta_buffer.blkno());
    debug_assert_eq!(ROOT_BLKNO, root_buffer.blkno());

    let mut xlog = GenericXlog::start(bufmgr);
    let mh = xlog.register(&meta_buffer);
    meta::init_meta_page(xlog.page_mut(mh));
    let rh = xlog.register(&root_buffer);
    xlog.page_mut(rh).init(flags::LEAF);
    xlog.finish();

    Ok(())
}

/// Result of a bulk build
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct BuildResult {
    pub heap_tuples: u64,
    pub index_tuples: u64,
}

fn flush_accumulator(
    state: &RumState,
    bufmgr: &BufferManager,
    accum: &mut BuildAccumulator<'_>,
    stats: &mut IndexStats,
) -> crate::Result<()> {
    for group in accum.drain() {
        state.check_for_interrupts()?;
        entry_insert(
            state,
            bufmgr,
            group.attnum,
            group.key.as_ref(),
            group.category,
            &group.items,
            Some(stats),
            true,
        )?;
    }
    Ok(())
}

/// Builds the index from scratch over a stream of heap tuples.
pub fn build<I>(
    state: &RumState,
    bufmgr: &BufferManager,
    heap_tuples: I,
) -> crate::Result<BuildResult>
where
    I: IntoIterator<Item = (ItemPointer, Vec<Option<Datum>>)>,
{
    if bufmgr.n_pages() != 0 {
        return Err(crate::Error::Unsupported("index already contains data"));
    }

    build_empty(bufmgr)?;

    let mut stats = IndexStats {
        // the root is the first entry page
        n_entry_pages: 1,
        ..IndexStats::default()
    };
    let mut result = BuildResult::default();

    let budget = state.config.maintenance_work_mem_kb * 1024;
    let mut accum = BuildAccumulator::new(state);

    for (heap_ptr, values) in heap_tuples {
        state.check_for_interrupts()?;
        debug_assert_eq!(values.len(), state.n_columns());

        let outer = outer_add_info(state, &values);

        for attnum in 1..=state.n_columns() as u16 {
            let mut entries = state.extract_entries(attnum, values[attnum as usize - 1].as_ref());

            if state.add_to_attnum == Some(attnum) {
                for entry in &mut entries {
                    entry.add_info = outer.clone();
                }
            }

            for entry in &entries {
                if entry.add_info.is_some() && state.add_attr(attnum).is_none() {
                    return Err(crate::Error::ConfigConflict(
                        "column produced addInfo but has no addInfo type",
                    ));
                }
            }

            result.index_tuples += entries.len() as u64;
            accum.insert_entries(heap_ptr, attnum, &entries);
        }

        result.heap_tuples += 1;

        if accum.memory() >= budget {
            debug!("build accumulator at {} bytes, flushing", accum.memory());
            flush_accumulator(state, bufmgr, &mut accum, &mut stats)?;
        }
    }

    flush_accumulator(state, bufmgr, &mut accum, &mut stats)?;

    // publish metapage statistics
    stats.n_total_pages = bufmgr.n_pages();
    update_stats(bufmgr, &stats)?;

    debug!(
        "build done: {} heap tuples, {} entries, {} pages",
        result.heap_tuples, result.index_tuples, stats.n_total_pages
    );

    Ok(result)
}

/// Writes statistics into the metapage under its latch.
pub fn update_stats(bufmgr: &BufferManager, stats: &IndexStats) -> crate::Result<()> {
    let meta_buffer = bufmgr.pin(META_BLKNO)?;
    let mut xlog = GenericXlog::start(bufmgr);
    let h = xlog.register(&meta_buffer);
    meta::write_stats(xlog.page_mut(h), stats);
    xlog.finish();
    Ok(())
}

/// Reads statistics from the metapage under a share latch.
pub fn get_stats(bufmgr: &BufferManager) -> crate::Result<IndexStats> {
    let meta_buffer = bufmgr.pin(META_BLKNO)?;
    let page = meta_buffer.read();
    meta::read_stats(&page)
}
