use rum_tree::opclasses::{btree_strategy, text_strategy, Int64Ops, TextPositionsOps};
use rum_tree::{ColumnDef, Config, Datum, ItemPointer, RumIndex, ScanQual};
use std::sync::Arc;
use test_log::test;

#[test]
fn order_by_distance_over_full_scan() -> rum_tree::Result<()> {
    let index = RumIndex::create(
        vec![ColumnDef::new("x", Arc::new(Int64Ops))],
        Config::new(),
    )?;

    index.build(
        [50i64, 10, 42, 47, 90, 41]
            .iter()
            .enumerate()
            .map(|(i, v)| (ItemPointer::new(0, i as u16 + 1), vec![Some(Datum::Inline(*v))])),
    )?;

    // no filter, ORDER BY x <-> 45: ranked by |x - 45|
    let mut scan = index.begin_scan();
    scan.rescan(
        vec![],
        vec![ScanQual::new(1, btree_strategy::DISTANCE, Datum::Inline(45))],
    );

    let mut values = vec![];
    let mut distances = vec![];
    while scan.get_tuple()? {
        values.push(scan.heap_ptr.unwrap());
        distances.push(scan.order_by_vals[0].unwrap());
    }

    // 47 (2), 42 (3), 41 (4), 50 (5), 10 (35), 90 (45)
    assert_eq!(
        vec![
            ItemPointer::new(0, 4),
            ItemPointer::new(0, 3),
            ItemPointer::new(0, 6),
            ItemPointer::new(0, 1),
            ItemPointer::new(0, 2),
            ItemPointer::new(0, 5),
        ],
        values
    );
    assert_eq!(vec![2.0, 3.0, 4.0, 5.0, 35.0, 45.0], distances);

    Ok(())
}

#[test]
fn order_by_rank_with_positions() -> rum_tree::Result<()> {
    let index = RumIndex::create(
        vec![ColumnDef::new("body", Arc::new(TextPositionsOps))],
        Config::new(),
    )?;

    index.build(vec![
        (
            ItemPointer::new(0, 1),
            vec![Some(Datum::from("rust and more rust and more rust"))],
        ),
        (ItemPointer::new(0, 2), vec![Some(Datum::from("rust once"))]),
        (
            ItemPointer::new(0, 3),
            vec![Some(Datum::from("rust rust here"))],
        ),
    ])?;

    // WHERE body @@ 'rust' ORDER BY rank: more occurrences rank closer
    let mut scan = index.begin_scan();
    scan.rescan(
        vec![ScanQual::new(1, text_strategy::MATCH, Datum::from("rust"))],
        vec![ScanQual::new(1, text_strategy::RANK, Datum::from("rust"))],
    );

    let mut tids = vec![];
    while scan.get_tuple()? {
        tids.push(scan.heap_ptr.unwrap());
    }

    assert_eq!(
        vec![
            ItemPointer::new(0, 1),
            ItemPointer::new(0, 3),
            ItemPointer::new(0, 2),
        ],
        tids
    );

    Ok(())
}

#[test]
fn order_by_values_exposed_to_driver() -> rum_tree::Result<()> {
    let index = RumIndex::create(
        vec![ColumnDef::new("x", Arc::new(Int64Ops))],
        Config::new(),
    )?;

    index.build(vec![
        (ItemPointer::new(0, 1), vec![Some(Datum::Inline(100))]),
        (ItemPointer::new(0, 2), vec![Some(Datum::Inline(200))]),
    ])?;

    let mut scan = index.begin_scan();
    scan.rescan(
        vec![],
        vec![ScanQual::new(1, btree_strategy::DISTANCE, Datum::Inline(150))],
    );

    assert!(scan.get_tuple()?);
    assert_eq!(Some(50.0), scan.order_by_vals[0]);

    Ok(())
}
