use rum_tree::opclasses::{btree_strategy, Int64Ops};
use rum_tree::{ColumnDef, Config, Datum, ItemPointer, RumIndex, ScanQual};
use std::sync::Arc;
use test_log::test;

fn build_index(config: Config, n: u32) -> RumIndex {
    let index = RumIndex::create(
        vec![ColumnDef::new("x", Arc::new(Int64Ops))],
        config,
    )
    .unwrap();

    index
        .build((0..n).map(|i| {
            (
                ItemPointer::new(i * 100, 1),
                vec![Some(Datum::Inline(42))],
            )
        }))
        .unwrap();
    index
}

fn eq_scan(index: &RumIndex) -> Vec<ItemPointer> {
    let mut scan = index.begin_scan();
    scan.rescan(
        vec![ScanQual::new(1, btree_strategy::EQUAL, Datum::Inline(42))],
        vec![],
    );

    let mut out = vec![];
    while scan.get_tuple().unwrap() {
        out.push(scan.heap_ptr.unwrap());
    }
    out
}

#[test]
fn fuzzy_limit_off_returns_everything() {
    let n = 10_000;
    let index = build_index(Config::new(), n);
    assert_eq!(n as usize, eq_scan(&index).len());
}

#[test]
fn fuzzy_limit_thins_large_results() {
    let n = 10_000;
    let index = build_index(Config::new().fuzzy_search_limit(10), n);

    let exact = build_index(Config::new(), n);
    let full = eq_scan(&exact);

    let got = eq_scan(&index);

    // probabilistic: roughly fuzzy_search_limit survivors, always a strict
    // subset of the exact answer
    assert!(
        !got.is_empty() && got.len() < 1000,
        "unexpected fuzzy result size {}",
        got.len()
    );

    let mut full_iter = full.iter();
    for tid in &got {
        assert!(
            full_iter.any(|t| t == tid),
            "fuzzy scan produced a tuple outside the exact answer"
        );
    }
}
