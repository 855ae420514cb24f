use rum_tree::opclasses::{btree_strategy, text_strategy, Int64Ops, TextTermsOps};
use rum_tree::{ColumnDef, Config, Datum, ItemPointer, RumIndex, ScanQual};
use std::sync::Arc;
use test_log::test;

fn two_int_index() -> RumIndex {
    RumIndex::create(
        vec![
            ColumnDef::new("a", Arc::new(Int64Ops)),
            ColumnDef::new("b", Arc::new(Int64Ops)),
        ],
        Config::new(),
    )
    .unwrap()
}

fn run(index: &RumIndex, quals: Vec<ScanQual>) -> Vec<ItemPointer> {
    let mut scan = index.begin_scan();
    scan.rescan(quals, vec![]);

    let mut out = vec![];
    while scan.get_tuple().unwrap() {
        out.push(scan.heap_ptr.unwrap());
    }
    out
}

#[test]
fn multicolumn_and_intersection() -> rum_tree::Result<()> {
    let index = two_int_index();

    index.build((1..=100u16).map(|i| {
        (
            ItemPointer::new(0, i),
            vec![
                Some(Datum::Inline(i64::from(i % 4))),
                Some(Datum::Inline(i64::from(i % 6))),
            ],
        )
    }))?;

    // a = 1 AND b = 3: i % 4 == 1 && i % 6 == 3, so i % 12 == 9
    let got = run(
        &index,
        vec![
            ScanQual::new(1, btree_strategy::EQUAL, Datum::Inline(1)),
            ScanQual::new(2, btree_strategy::EQUAL, Datum::Inline(3)),
        ],
    );

    let expect: Vec<ItemPointer> = (1..=100u16)
        .filter(|i| i % 12 == 9)
        .map(|i| ItemPointer::new(0, i))
        .collect();
    assert_eq!(expect, got);

    Ok(())
}

#[test]
fn multicolumn_text_plus_range() -> rum_tree::Result<()> {
    let index = RumIndex::create(
        vec![
            ColumnDef::new("body", Arc::new(TextTermsOps)),
            ColumnDef::new("ts", Arc::new(Int64Ops)),
        ],
        Config::new(),
    )?;

    index.build((1..=60u16).map(|i| {
        let word = if i % 3 == 0 { "fizz" } else { "plain" };
        (
            ItemPointer::new(0, i),
            vec![
                Some(Datum::from(word)),
                Some(Datum::Inline(i64::from(i))),
            ],
        )
    }))?;

    // body @@ 'fizz' AND ts >= 20 AND ts < 40
    let got = run(
        &index,
        vec![
            ScanQual::new(1, text_strategy::MATCH, Datum::from("fizz")),
            ScanQual::new(2, btree_strategy::GREATER_EQUAL, Datum::Inline(20)),
            ScanQual::new(2, btree_strategy::LESS, Datum::Inline(40)),
        ],
    );

    let expect: Vec<ItemPointer> = (20..40u16)
        .filter(|i| i % 3 == 0)
        .map(|i| ItemPointer::new(0, i))
        .collect();
    assert_eq!(expect, got);

    Ok(())
}

#[test]
fn multicolumn_same_key_value_in_both_columns() -> rum_tree::Result<()> {
    // identical key values in different columns must stay apart
    let index = two_int_index();

    index.build(vec![
        (
            ItemPointer::new(0, 1),
            vec![Some(Datum::Inline(5)), Some(Datum::Inline(6))],
        ),
        (
            ItemPointer::new(0, 2),
            vec![Some(Datum::Inline(6)), Some(Datum::Inline(5))],
        ),
    ])?;

    assert_eq!(
        vec![ItemPointer::new(0, 1)],
        run(
            &index,
            vec![ScanQual::new(1, btree_strategy::EQUAL, Datum::Inline(5))]
        )
    );
    assert_eq!(
        vec![ItemPointer::new(0, 2)],
        run(
            &index,
            vec![ScanQual::new(2, btree_strategy::EQUAL, Datum::Inline(5))]
        )
    );

    Ok(())
}
