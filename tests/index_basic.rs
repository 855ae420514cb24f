use rum_tree::opclasses::{btree_strategy, Int64Ops};
use rum_tree::{ColumnDef, Config, Datum, ItemPointer, RumIndex, ScanQual};
use std::sync::Arc;
use test_log::test;

fn int_index() -> RumIndex {
    RumIndex::create(
        vec![ColumnDef::new("x", Arc::new(Int64Ops))],
        Config::new(),
    )
    .unwrap()
}

fn collect_tids(index: &RumIndex, quals: Vec<ScanQual>) -> Vec<ItemPointer> {
    let mut scan = index.begin_scan();
    scan.rescan(quals, vec![]);

    let mut out = vec![];
    while scan.get_tuple().unwrap() {
        out.push(scan.heap_ptr.unwrap());
    }
    out
}

#[test]
fn index_three_rows_equality() -> rum_tree::Result<()> {
    let index = int_index();

    index.build(vec![
        (ItemPointer::new(0, 1), vec![Some(Datum::Inline(5))]),
        (ItemPointer::new(0, 2), vec![Some(Datum::Inline(7))]),
        (ItemPointer::new(0, 3), vec![Some(Datum::Inline(5))]),
    ])?;

    assert_eq!(
        vec![ItemPointer::new(0, 1), ItemPointer::new(0, 3)],
        collect_tids(
            &index,
            vec![ScanQual::new(1, btree_strategy::EQUAL, Datum::Inline(5))]
        )
    );

    assert_eq!(
        vec![ItemPointer::new(0, 2)],
        collect_tids(
            &index,
            vec![ScanQual::new(1, btree_strategy::EQUAL, Datum::Inline(7))]
        )
    );

    assert!(collect_tids(
        &index,
        vec![ScanQual::new(1, btree_strategy::EQUAL, Datum::Inline(6))]
    )
    .is_empty());

    Ok(())
}

#[test]
fn index_bitmap_scan_matches_tuple_scan() -> rum_tree::Result<()> {
    let index = int_index();

    let tuples: Vec<_> = (1..=500u16)
        .map(|i| {
            (
                ItemPointer::new(u32::from(i / 50), i % 50 + 1),
                vec![Some(Datum::Inline(i64::from(i % 7)))],
            )
        })
        .collect();
    index.build(tuples)?;

    let quals = vec![ScanQual::new(1, btree_strategy::EQUAL, Datum::Inline(3))];

    let tids = collect_tids(&index, quals.clone());
    let tbm = index.scan_bitmap(quals)?;

    assert_eq!(tids.len(), tbm.len());
    for tid in &tids {
        assert!(tbm.contains(tid));
    }

    Ok(())
}

#[test]
fn index_null_query_is_void() -> rum_tree::Result<()> {
    let index = int_index();
    index.build(vec![(ItemPointer::new(0, 1), vec![Some(Datum::Inline(5))])])?;

    let mut scan = index.begin_scan();
    scan.rescan(
        vec![ScanQual {
            attnum: 1,
            strategy: btree_strategy::EQUAL,
            value: None,
        }],
        vec![],
    );

    assert!(!scan.get_tuple()?);
    Ok(())
}

#[test]
fn index_null_values_are_indexed() -> rum_tree::Result<()> {
    let index = int_index();

    index.build(vec![
        (ItemPointer::new(0, 1), vec![Some(Datum::Inline(5))]),
        (ItemPointer::new(0, 2), vec![None]),
        (ItemPointer::new(0, 3), vec![Some(Datum::Inline(5))]),
    ])?;

    // the placeholder row does not disturb key lookups
    assert_eq!(
        vec![ItemPointer::new(0, 1), ItemPointer::new(0, 3)],
        collect_tids(
            &index,
            vec![ScanQual::new(1, btree_strategy::EQUAL, Datum::Inline(5))]
        )
    );

    // entry count includes the null placeholder
    assert_eq!(2, index.stats()?.n_entries);
    Ok(())
}

#[test]
fn index_retail_insert_matches_build() -> rum_tree::Result<()> {
    let built = int_index();
    let retail = int_index();

    let rows: Vec<(ItemPointer, i64)> = (1..200u16)
        .map(|i| (ItemPointer::new(0, i), i64::from(i % 13)))
        .collect();

    built.build(
        rows.iter()
            .map(|(tid, v)| (*tid, vec![Some(Datum::Inline(*v))])),
    )?;

    retail.build_empty()?;
    for (tid, v) in &rows {
        assert!(!retail.insert(&[Some(Datum::Inline(*v))], *tid)?);
    }

    for key in 0..13i64 {
        let quals = vec![ScanQual::new(1, btree_strategy::EQUAL, Datum::Inline(key))];
        assert_eq!(
            collect_tids(&built, quals.clone()),
            collect_tids(&retail, quals),
            "key {key} differs between build and retail insert"
        );
    }

    Ok(())
}

#[test]
fn index_stats_reflect_build() -> rum_tree::Result<()> {
    let index = int_index();
    index.build(vec![
        (ItemPointer::new(0, 1), vec![Some(Datum::Inline(5))]),
        (ItemPointer::new(0, 2), vec![Some(Datum::Inline(7))]),
    ])?;

    let stats = index.stats()?;
    assert_eq!(2, stats.n_entries);
    assert!(stats.n_total_pages >= 2);
    assert!(stats.n_entry_pages >= 1);
    Ok(())
}

#[test]
fn index_rejects_double_build() -> rum_tree::Result<()> {
    let index = int_index();
    index.build(vec![(ItemPointer::new(0, 1), vec![Some(Datum::Inline(1))])])?;

    assert!(index
        .build(vec![(ItemPointer::new(0, 2), vec![Some(Datum::Inline(2))])])
        .is_err());
    Ok(())
}

#[test]
fn index_mark_restore_unsupported() {
    let index = int_index();
    index.build_empty().unwrap();

    let scan = index.begin_scan();
    assert!(matches!(
        scan.mark_position(),
        Err(rum_tree::Error::Unsupported(_))
    ));
}

#[test]
fn index_unrecognized_strategy_is_rejected() {
    let index = int_index();
    index
        .build(vec![(ItemPointer::new(0, 1), vec![Some(Datum::Inline(5))])])
        .unwrap();

    let mut scan = index.begin_scan();
    scan.rescan(vec![ScanQual::new(1, 99, Datum::Inline(5))], vec![]);

    assert!(matches!(
        scan.get_tuple(),
        Err(rum_tree::Error::Unsupported(_))
    ));
}

#[test]
fn index_oversized_key_is_rejected() {
    let index = RumIndex::create(
        vec![ColumnDef::new(
            "t",
            Arc::new(rum_tree::opclasses::TextTermsOps),
        )],
        Config::new(),
    )
    .unwrap();
    index.build_empty().unwrap();

    // a single token bigger than any entry tuple may ever be
    let huge = "x".repeat(4096);
    let err = index
        .insert(&[Some(Datum::from(huge.as_str()))], ItemPointer::new(0, 1))
        .unwrap_err();

    assert!(matches!(err, rum_tree::Error::ItemTooLarge(..)));
}
