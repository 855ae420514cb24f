use rum_tree::opclasses::btree_strategy;
use rum_tree::{
    AttrInfo, ColumnDef, Config, Datum, ItemPointer, RumConfig, RumIndex, ScanQual,
};
use std::cmp::Ordering;
use std::sync::Arc;
use test_log::test;

/// Int64 keys carrying a 16-bit addInfo derived from the value
#[derive(Copy, Clone, Debug, Default)]
struct TaggedInt64Ops;

impl rum_tree::Opclass for TaggedInt64Ops {
    fn key_attr(&self) -> AttrInfo {
        AttrInfo::int8()
    }

    fn compare(&self, a: &Datum, b: &Datum) -> Ordering {
        a.inline().cmp(&b.inline())
    }

    fn extract_value(&self, value: &Datum) -> Vec<rum_tree::opclass::ValueEntry> {
        vec![rum_tree::opclass::ValueEntry::with_add_info(
            Datum::Inline(value.inline() % 1000),
            Datum::Inline(value.inline() % 32_768),
        )]
    }

    fn extract_query(
        &self,
        query: &Datum,
        strategy: rum_tree::StrategyNumber,
    ) -> rum_tree::opclass::ExtractedQuery {
        assert_eq!(btree_strategy::EQUAL, strategy);
        rum_tree::opclass::ExtractedQuery {
            entries: vec![rum_tree::opclass::QueryEntry::new(query.clone())],
            search_mode: rum_tree::SearchMode::Default,
        }
    }

    fn consistent(
        &self,
        _check: &rum_tree::opclass::KeyCheck<'_>,
        _strategy: rum_tree::StrategyNumber,
        _query: &Datum,
        _n_user_entries: usize,
        recheck: &mut bool,
    ) -> bool {
        *recheck = false;
        true
    }

    fn config(&self) -> RumConfig {
        RumConfig {
            add_info_type: Some(AttrInfo::int2()),
            strategy_info: vec![],
        }
    }
}

#[test]
fn posting_tree_survives_bulk_load() -> rum_tree::Result<()> {
    let index = RumIndex::create(
        vec![ColumnDef::new("x", Arc::new(TaggedInt64Ops))],
        Config::new(),
    )?;

    // 100k occurrences of key 42, ascending item pointers
    let n: u32 = 100_000;
    index.build((0..n).map(|i| {
        (
            ItemPointer::new(i / 16, (i % 16 + 1) as u16),
            vec![Some(Datum::Inline(42 + 1000 * i64::from(i)))],
        )
    }))?;

    let stats = index.stats()?;
    assert!(stats.n_data_pages >= 2, "expected a posting tree: {stats:?}");
    assert_eq!(1, stats.n_entries);

    // everything comes back, in strictly ascending item-pointer order
    let mut scan = index.begin_scan();
    scan.rescan(
        vec![ScanQual::new(1, btree_strategy::EQUAL, Datum::Inline(42))],
        vec![],
    );

    let mut count = 0u32;
    let mut prev: Option<ItemPointer> = None;
    while scan.get_tuple()? {
        let tid = scan.heap_ptr.unwrap();
        if let Some(p) = prev {
            assert!(p < tid, "item pointers must be strictly ascending");
        }
        prev = Some(tid);

        let expect = ItemPointer::new(count / 16, (count % 16 + 1) as u16);
        assert_eq!(expect, tid);
        count += 1;
    }

    assert_eq!(n, count);
    Ok(())
}

#[test]
fn posting_tree_grows_from_retail_inserts() -> rum_tree::Result<()> {
    let index = RumIndex::create(
        vec![ColumnDef::new("x", Arc::new(TaggedInt64Ops))],
        Config::new(),
    )?;
    index.build_empty()?;

    // enough single-row inserts to convert the inline list into a tree and
    // split its leaves a few times
    let n: u32 = 30_000;
    for i in 0..n {
        index.insert(
            &[Some(Datum::Inline(7 + 1000 * i64::from(i)))],
            ItemPointer::new(i, 1),
        )?;
    }

    let tbm = index.scan_bitmap(vec![ScanQual::new(
        1,
        btree_strategy::EQUAL,
        Datum::Inline(7),
    )])?;
    assert_eq!(n as usize, tbm.len());

    Ok(())
}

#[test]
fn posting_tree_out_of_order_inserts() -> rum_tree::Result<()> {
    let index = RumIndex::create(
        vec![ColumnDef::new("x", Arc::new(TaggedInt64Ops))],
        Config::new(),
    )?;
    index.build_empty()?;

    // descending insertion exercises mid-page leaf placement and splits
    let n: u32 = 20_000;
    for i in (0..n).rev() {
        index.insert(
            &[Some(Datum::Inline(7 + 1000 * i64::from(i)))],
            ItemPointer::new(i, 1),
        )?;
    }

    let mut scan = index.begin_scan();
    scan.rescan(
        vec![ScanQual::new(1, btree_strategy::EQUAL, Datum::Inline(7))],
        vec![],
    );

    let mut expect = 0u32;
    while scan.get_tuple()? {
        assert_eq!(ItemPointer::new(expect, 1), scan.heap_ptr.unwrap());
        expect += 1;
    }
    assert_eq!(n, expect);

    Ok(())
}
