use rum_tree::opclasses::{btree_strategy, text_strategy, Int64Ops, TextTermsOps};
use rum_tree::{ColumnDef, Config, Datum, ItemPointer, RumIndex, ScanQual};
use std::sync::Arc;
use test_log::test;

/// Index over (tsv, ts) with ts attached to every token occurrence and the
/// posting trees ordered by it
fn attached_index() -> RumIndex {
    RumIndex::create(
        vec![
            ColumnDef::new("tsv", Arc::new(TextTermsOps)),
            ColumnDef::new("ts", Arc::new(Int64Ops)),
        ],
        Config::new().attach("ts", "tsv").order_by_attach(true),
    )
    .unwrap()
}

fn run(
    index: &RumIndex,
    quals: Vec<ScanQual>,
    order_bys: Vec<ScanQual>,
) -> Vec<ItemPointer> {
    let mut scan = index.begin_scan();
    scan.rescan(quals, order_bys);

    let mut out = vec![];
    while scan.get_tuple().unwrap() {
        out.push(scan.heap_ptr.unwrap());
    }
    out
}

#[test]
fn order_by_attached_timestamp_desc() -> rum_tree::Result<()> {
    let index = attached_index();

    index.build(vec![
        (
            ItemPointer::new(0, 1),
            vec![Some(Datum::from("a b")), Some(Datum::Inline(1000))],
        ),
        (
            ItemPointer::new(0, 2),
            vec![Some(Datum::from("a")), Some(Datum::Inline(2000))],
        ),
        (
            ItemPointer::new(0, 3),
            vec![Some(Datum::from("a")), Some(Datum::Inline(1500))],
        ),
    ])?;

    // tsv @@ 'a' ORDER BY ts descending: distance to the left of +infinity
    let got = run(
        &index,
        vec![ScanQual::new(1, text_strategy::MATCH, Datum::from("a"))],
        vec![ScanQual::new(
            2,
            btree_strategy::LEFT_DISTANCE,
            Datum::Inline(i64::MAX / 2),
        )],
    );

    assert_eq!(
        vec![
            ItemPointer::new(0, 2),
            ItemPointer::new(0, 3),
            ItemPointer::new(0, 1)
        ],
        got
    );

    Ok(())
}

#[test]
fn order_by_attached_timestamp_asc() -> rum_tree::Result<()> {
    let index = attached_index();

    index.build(vec![
        (
            ItemPointer::new(0, 1),
            vec![Some(Datum::from("w")), Some(Datum::Inline(300))],
        ),
        (
            ItemPointer::new(0, 2),
            vec![Some(Datum::from("w")), Some(Datum::Inline(100))],
        ),
        (
            ItemPointer::new(0, 3),
            vec![Some(Datum::from("w")), Some(Datum::Inline(200))],
        ),
    ])?;

    // ascending: distance to the right of -infinity
    let got = run(
        &index,
        vec![ScanQual::new(1, text_strategy::MATCH, Datum::from("w"))],
        vec![ScanQual::new(
            2,
            btree_strategy::RIGHT_DISTANCE,
            Datum::Inline(i64::MIN / 2),
        )],
    );

    assert_eq!(
        vec![
            ItemPointer::new(0, 2),
            ItemPointer::new(0, 3),
            ItemPointer::new(0, 1)
        ],
        got
    );

    Ok(())
}

#[test]
fn two_way_stream_around_query_point() -> rum_tree::Result<()> {
    let index = attached_index();

    index.build((1..=20u16).map(|i| {
        (
            ItemPointer::new(0, i),
            vec![
                Some(Datum::from("evt")),
                Some(Datum::Inline(i64::from(i) * 100)),
            ],
        )
    }))?;

    // timestamps right of 1050 stream first (ascending), then the reverse
    // pass delivers the left side
    let got = run(
        &index,
        vec![ScanQual::new(1, text_strategy::MATCH, Datum::from("evt"))],
        vec![ScanQual::new(
            2,
            btree_strategy::RIGHT_DISTANCE,
            Datum::Inline(1050),
        )],
    );

    let mut expect: Vec<ItemPointer> = (11..=20).map(|i| ItemPointer::new(0, i)).collect();
    expect.extend((1..=10).rev().map(|i| ItemPointer::new(0, i)));
    assert_eq!(expect, got);

    Ok(())
}

#[test]
fn natural_order_exposes_distances() -> rum_tree::Result<()> {
    let index = attached_index();

    index.build((1..=20u16).map(|i| {
        (
            ItemPointer::new(0, i),
            vec![
                Some(Datum::from("evt")),
                Some(Datum::Inline(i64::from(i) * 100)),
            ],
        )
    }))?;

    // even when the index streams in natural order, the driver still gets
    // the per-key distance of every returned row
    let mut scan = index.begin_scan();
    scan.rescan(
        vec![ScanQual::new(1, text_strategy::MATCH, Datum::from("evt"))],
        vec![ScanQual::new(
            2,
            btree_strategy::RIGHT_DISTANCE,
            Datum::Inline(1050),
        )],
    );

    let mut distances = vec![];
    while scan.get_tuple()? {
        distances.push(scan.order_by_vals[0].unwrap());
    }

    // rows 11..=20 to the right of the query point, then the reverse pass
    // (left of it, infinitely distant under a right-distance operator)
    let mut expect: Vec<f64> = (11..=20).map(|i| f64::from(i * 100 - 1050)).collect();
    expect.extend(std::iter::repeat(f64::INFINITY).take(10));
    assert_eq!(expect, distances);

    Ok(())
}

#[test]
fn add_info_filter_keys_combine() -> rum_tree::Result<()> {
    let index = attached_index();

    index.build((1..=50u16).map(|i| {
        let word = if i % 2 == 0 { "even" } else { "odd" };
        (
            ItemPointer::new(0, i),
            vec![
                Some(Datum::from(word)),
                Some(Datum::Inline(i64::from(i) * 10)),
            ],
        )
    }))?;

    // tsv @@ 'even' AND ts >= 200 AND ts <= 300: the timestamp quals are
    // evaluated against the addInfo discovered on the token's postings
    let got = run(
        &index,
        vec![
            ScanQual::new(1, text_strategy::MATCH, Datum::from("even")),
            ScanQual::new(2, btree_strategy::GREATER_EQUAL, Datum::Inline(200)),
            ScanQual::new(2, btree_strategy::LESS_EQUAL, Datum::Inline(300)),
        ],
        vec![],
    );

    let expect: Vec<ItemPointer> = (20..=30)
        .filter(|i| i % 2 == 0)
        .map(|i| ItemPointer::new(0, i))
        .collect();
    assert_eq!(expect, got);

    Ok(())
}

#[test]
fn alt_order_mixed_with_null_attachments() -> rum_tree::Result<()> {
    let index = attached_index();

    index.build(vec![
        (
            ItemPointer::new(0, 1),
            vec![Some(Datum::from("x")), Some(Datum::Inline(500))],
        ),
        // null attachment sorts last in the posting order
        (ItemPointer::new(0, 2), vec![Some(Datum::from("x")), None]),
        (
            ItemPointer::new(0, 3),
            vec![Some(Datum::from("x")), Some(Datum::Inline(100))],
        ),
    ])?;

    let got = run(
        &index,
        vec![ScanQual::new(1, text_strategy::MATCH, Datum::from("x"))],
        vec![],
    );

    // plain scans return every posting, whatever the attachment
    assert_eq!(3, got.len());

    Ok(())
}
