// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Build accumulator
//!
//! During a bulk build, occurrences are collected per `(attnum, category,
//! key)` into an in-memory map and flushed to the tree in sorted order once
//! the memory budget is exceeded. Grouping uses a canonical byte form of the
//! key; the drain re-sorts groups with the real opclass comparator, which
//! replaces the insertion-order balancing trick of rb-tree based designs.

use crate::datum::Datum;
use crate::item::{ItemPointer, RumItem};
use crate::opclass::NullCategory;
use crate::state::{ExtractedEntry, RumState};
use std::collections::BTreeMap;

/// Initial per-key occurrence capacity
const DEF_NPTR: usize = 5;

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord)]
struct AccumKey {
    attnum: u16,
    category: i8,
    key_bytes: Vec<u8>,
}

struct AccumEntry {
    key: Option<Datum>,
    list: Vec<RumItem>,
    /// Occurrences arrived out of item-pointer order (or the column uses
    /// alternative order) and need sorting on drain
    should_sort: bool,
}

/// One drained group: every accumulated occurrence of one key, sorted
pub struct AccumGroup {
    pub attnum: u16,
    pub key: Option<Datum>,
    pub category: NullCategory,
    pub items: Vec<RumItem>,
}

/// Accumulates `(key, occurrence)` pairs for a bulk build
pub struct BuildAccumulator<'a> {
    state: &'a RumState,
    tree: BTreeMap<AccumKey, AccumEntry>,
    allocated: usize,
}

fn canonical_key_bytes(key: Option<&Datum>) -> Vec<u8> {
    match key {
        None => Vec::new(),
        Some(Datum::Inline(v)) => v.to_be_bytes().to_vec(),
        Some(Datum::Bytes(b)) => b.to_vec(),
    }
}

impl<'a> BuildAccumulator<'a> {
    #[must_use]
    pub fn new(state: &'a RumState) -> Self {
        Self {
            state,
            tree: BTreeMap::new(),
            allocated: 0,
        }
    }

    /// Approximate memory held by the accumulator, in bytes.
    #[must_use]
    pub fn memory(&self) -> usize {
        self.allocated
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Inserts the extracted entries of one heap tuple's column.
    pub fn insert_entries(
        &mut self,
        heap_ptr: ItemPointer,
        attnum: u16,
        entries: &[ExtractedEntry],
    ) {
        debug_assert!(heap_ptr.is_valid());

        let alt_column = self.state.is_alt_order_column(attnum);

        for entry in entries {
            let key = AccumKey {
                attnum,
                category: entry.category.as_i8(),
                key_bytes: canonical_key_bytes(entry.key.as_ref()),
            };

            let item = RumItem::new(heap_ptr, entry.add_info.clone());
            let item_mem = std::mem::size_of::<RumItem>()
                + entry
                    .add_info
                    .as_ref()
                    .map_or(0, |d| match d {
                        Datum::Inline(_) => 0,
                        Datum::Bytes(b) => b.len(),
                    });
            let key_mem = key.key_bytes.len() + std::mem::size_of::<AccumKey>();

            match self.tree.entry(key) {
                std::collections::btree_map::Entry::Occupied(mut slot) => {
                    let existing = slot.get_mut();

                    // detect out-of-order arrival; with alternative order the
                    // list needs sorting regardless
                    if !alt_column && !existing.should_sort {
                        if let Some(last) = existing.list.last() {
                            debug_assert!(last.iptr != item.iptr);
                            if last.iptr > item.iptr {
                                existing.should_sort = true;
                            }
                        }
                    }
                    existing.list.push(item);
                    self.allocated += item_mem;
                }
                std::collections::btree_map::Entry::Vacant(slot) => {
                    let mut list = Vec::with_capacity(DEF_NPTR);
                    list.push(item);

                    self.allocated +=
                        key_mem + DEF_NPTR * std::mem::size_of::<RumItem>() + item_mem;

                    slot.insert(AccumEntry {
                        key: entry.key.clone(),
                        list,
                        should_sort: alt_column,
                    });
                }
            }
        }
    }

    /// Drains every accumulated group in `(attnum, category, key)` order
    /// under the opclass comparator, each group's occurrence list sorted.
    pub fn drain(&mut self) -> Vec<AccumGroup> {
        let state = self.state;
        let tree = std::mem::take(&mut self.tree);
        self.allocated = 0;

        let mut groups: Vec<AccumGroup> = tree
            .into_iter()
            .map(|(k, mut v)| {
                let category =
                    NullCategory::from_i8(k.category).expect("accumulator stored bad category");

                if v.should_sort && v.list.len() > 1 {
                    v.list
                        .sort_by(|a, b| state.compare_rum_item(k.attnum, a, b));
                }

                AccumGroup {
                    attnum: k.attnum,
                    key: v.key,
                    category,
                    items: v.list,
                }
            })
            .collect();

        // canonical byte order groups; the opclass decides the real order
        groups.sort_by(|a, b| {
            state.compare_att_entries(
                a.attnum,
                a.key.as_ref(),
                a.category,
                b.attnum,
                b.key.as_ref(),
                b.category,
            )
        });

        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::opclasses::{Int64Ops, TextTermsOps};
    use crate::state::ColumnDef;
    use std::sync::Arc;
    use test_log::test;

    fn state() -> RumState {
        RumState::new(
            vec![ColumnDef::new("x", Arc::new(Int64Ops))],
            Config::default(),
        )
        .unwrap()
    }

    fn entry(v: i64) -> ExtractedEntry {
        ExtractedEntry {
            key: Some(Datum::Inline(v)),
            category: NullCategory::NormKey,
            add_info: None,
        }
    }

    #[test]
    fn accumulator_groups_by_key() {
        let state = state();
        let mut accum = BuildAccumulator::new(&state);

        accum.insert_entries(ItemPointer::new(0, 1), 1, &[entry(5)]);
        accum.insert_entries(ItemPointer::new(0, 2), 1, &[entry(7)]);
        accum.insert_entries(ItemPointer::new(0, 3), 1, &[entry(5)]);

        let groups = accum.drain();
        assert_eq!(2, groups.len());

        assert_eq!(Some(Datum::Inline(5)), groups[0].key);
        assert_eq!(
            vec![ItemPointer::new(0, 1), ItemPointer::new(0, 3)],
            groups[0].items.iter().map(|i| i.iptr).collect::<Vec<_>>()
        );
        assert_eq!(Some(Datum::Inline(7)), groups[1].key);
    }

    #[test]
    fn accumulator_sorts_out_of_order_occurrences() {
        let state = state();
        let mut accum = BuildAccumulator::new(&state);

        accum.insert_entries(ItemPointer::new(9, 1), 1, &[entry(5)]);
        accum.insert_entries(ItemPointer::new(2, 1), 1, &[entry(5)]);
        accum.insert_entries(ItemPointer::new(5, 1), 1, &[entry(5)]);

        let groups = accum.drain();
        assert_eq!(
            vec![
                ItemPointer::new(2, 1),
                ItemPointer::new(5, 1),
                ItemPointer::new(9, 1)
            ],
            groups[0].items.iter().map(|i| i.iptr).collect::<Vec<_>>()
        );
    }

    #[test]
    fn accumulator_orders_groups_with_opclass() {
        let config = Config::default();
        let state = RumState::new(
            vec![ColumnDef::new("t", Arc::new(TextTermsOps))],
            config,
        )
        .unwrap();

        let mut accum = BuildAccumulator::new(&state);
        let mk = |s: &str| ExtractedEntry {
            key: Some(Datum::from(s)),
            category: NullCategory::NormKey,
            add_info: None,
        };

        accum.insert_entries(ItemPointer::new(0, 1), 1, &[mk("pear"), mk("apple")]);
        accum.insert_entries(ItemPointer::new(0, 2), 1, &[mk("mango")]);

        let groups = accum.drain();
        let keys: Vec<&[u8]> = groups
            .iter()
            .map(|g| g.key.as_ref().unwrap().bytes())
            .collect();
        assert_eq!(vec![b"apple".as_slice(), b"mango", b"pear"], keys);
    }

    #[test]
    fn accumulator_memory_grows_and_resets() {
        let state = state();
        let mut accum = BuildAccumulator::new(&state);
        assert_eq!(0, accum.memory());

        accum.insert_entries(ItemPointer::new(0, 1), 1, &[entry(1)]);
        assert!(accum.memory() > 0);

        accum.drain();
        assert_eq!(0, accum.memory());
        assert!(accum.is_empty());
    }
}
