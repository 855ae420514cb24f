// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::item::ItemPointer;
use rustc_hash::FxHashMap;

/// Bitmap of heap tuple pointers produced by a bitmap scan
///
/// Collects TIDs together with their recheck flag; iteration drains them in
/// item-pointer order. An already-present TID keeps its recheck flag unless
/// a lossy (recheck) insert upgrades it.
#[derive(Default)]
pub struct TidBitmap {
    tids: FxHashMap<ItemPointer, bool>,
}

impl TidBitmap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_tuple(&mut self, iptr: ItemPointer, recheck: bool) {
        self.tids
            .entry(iptr)
            .and_modify(|r| *r |= recheck)
            .or_insert(recheck);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tids.is_empty()
    }

    #[must_use]
    pub fn contains(&self, iptr: &ItemPointer) -> bool {
        self.tids.contains_key(iptr)
    }

    /// Drains the bitmap in item-pointer order.
    #[must_use]
    pub fn into_sorted_vec(self) -> Vec<(ItemPointer, bool)> {
        let mut v: Vec<(ItemPointer, bool)> = self.tids.into_iter().collect();
        v.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn tidbitmap_dedups_and_sorts() {
        let mut tbm = TidBitmap::new();
        tbm.add_tuple(ItemPointer::new(2, 1), false);
        tbm.add_tuple(ItemPointer::new(1, 5), true);
        tbm.add_tuple(ItemPointer::new(2, 1), true);

        assert_eq!(2, tbm.len());

        let v = tbm.into_sorted_vec();
        assert_eq!((ItemPointer::new(1, 5), true), v[0]);
        assert_eq!((ItemPointer::new(2, 1), true), v[1]);
    }
}
