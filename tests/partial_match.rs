use rum_tree::opclasses::{btree_strategy, text_strategy, Int64Ops, TextTermsOps};
use rum_tree::{ColumnDef, Config, Datum, ItemPointer, RumIndex, ScanQual};
use std::sync::Arc;
use test_log::test;

fn int_index_1_to_100() -> RumIndex {
    let index = RumIndex::create(
        vec![ColumnDef::new("t", Arc::new(Int64Ops))],
        Config::new(),
    )
    .unwrap();

    index
        .build((1..=100i64).map(|v| (ItemPointer::new(0, v as u16), vec![Some(Datum::Inline(v))])))
        .unwrap();
    index
}

fn keys_of(index: &RumIndex, quals: Vec<ScanQual>) -> Vec<u16> {
    let mut scan = index.begin_scan();
    scan.rescan(quals, vec![]);

    let mut out = vec![];
    while scan.get_tuple().unwrap() {
        out.push(scan.heap_ptr.unwrap().offset);
    }
    out
}

#[test]
fn range_inclusive_both_sides() {
    let index = int_index_1_to_100();

    // t1 <= t <= t2 as two partial-match quals
    let got = keys_of(
        &index,
        vec![
            ScanQual::new(1, btree_strategy::GREATER_EQUAL, Datum::Inline(25)),
            ScanQual::new(1, btree_strategy::LESS_EQUAL, Datum::Inline(75)),
        ],
    );

    assert_eq!((25..=75).collect::<Vec<u16>>(), got);
}

#[test]
fn range_single_bounds() {
    let index = int_index_1_to_100();

    assert_eq!(
        (1..10).collect::<Vec<u16>>(),
        keys_of(
            &index,
            vec![ScanQual::new(1, btree_strategy::LESS, Datum::Inline(10))]
        )
    );

    assert_eq!(
        (1..=10).collect::<Vec<u16>>(),
        keys_of(
            &index,
            vec![ScanQual::new(1, btree_strategy::LESS_EQUAL, Datum::Inline(10))]
        )
    );

    assert_eq!(
        (91..=100).collect::<Vec<u16>>(),
        keys_of(
            &index,
            vec![ScanQual::new(
                1,
                btree_strategy::GREATER_EQUAL,
                Datum::Inline(91)
            )]
        )
    );

    assert_eq!(
        (92..=100).collect::<Vec<u16>>(),
        keys_of(
            &index,
            vec![ScanQual::new(1, btree_strategy::GREATER, Datum::Inline(91))]
        )
    );
}

#[test]
fn range_empty_and_total() {
    let index = int_index_1_to_100();

    assert!(keys_of(
        &index,
        vec![ScanQual::new(1, btree_strategy::LESS, Datum::Inline(1))]
    )
    .is_empty());

    assert_eq!(
        100,
        keys_of(
            &index,
            vec![ScanQual::new(
                1,
                btree_strategy::GREATER_EQUAL,
                Datum::Inline(i64::MIN + 1)
            )]
        )
        .len()
    );
}

#[test]
fn text_prefix_match() {
    let index = RumIndex::create(
        vec![ColumnDef::new("body", Arc::new(TextTermsOps))],
        Config::new(),
    )
    .unwrap();

    index
        .build(vec![
            (ItemPointer::new(0, 1), vec![Some(Datum::from("apple pie"))]),
            (
                ItemPointer::new(0, 2),
                vec![Some(Datum::from("application server"))],
            ),
            (ItemPointer::new(0, 3), vec![Some(Datum::from("banana"))]),
            (ItemPointer::new(0, 4), vec![Some(Datum::from("apricot"))]),
        ])
        .unwrap();

    let got = keys_of(
        &index,
        vec![ScanQual::new(1, text_strategy::PREFIX, Datum::from("app"))],
    );
    assert_eq!(vec![1, 2], got);

    let got = keys_of(
        &index,
        vec![ScanQual::new(1, text_strategy::PREFIX, Datum::from("ap"))],
    );
    assert_eq!(vec![1, 2, 4], got);
}

#[test]
fn partial_match_merges_duplicate_pointers() {
    // both tokens of one row match the prefix: the row must come out once
    let index = RumIndex::create(
        vec![ColumnDef::new("body", Arc::new(TextTermsOps))],
        Config::new(),
    )
    .unwrap();

    index
        .build(vec![(
            ItemPointer::new(0, 1),
            vec![Some(Datum::from("alpha alert"))],
        )])
        .unwrap();

    let got = keys_of(
        &index,
        vec![ScanQual::new(1, text_strategy::PREFIX, Datum::from("al"))],
    );
    assert_eq!(vec![1], got);
}
