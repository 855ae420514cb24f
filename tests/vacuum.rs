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

fn eq_scan(index: &RumIndex, key: i64) -> Vec<ItemPointer> {
    let mut scan = index.begin_scan();
    scan.rescan(
        vec![ScanQual::new(1, btree_strategy::EQUAL, Datum::Inline(key))],
        vec![],
    );

    let mut out = vec![];
    while scan.get_tuple().unwrap() {
        out.push(scan.heap_ptr.unwrap());
    }
    out
}

#[test]
fn vacuum_inline_posting_list() -> rum_tree::Result<()> {
    let index = int_index();

    index.build((1..=20u16).map(|i| (ItemPointer::new(0, i), vec![Some(Datum::Inline(9))])))?;

    // kill the even offsets
    let stats = index.bulk_delete(&|tid| tid.offset % 2 == 0)?;
    assert_eq!(10, stats.tuples_removed);
    assert_eq!(10, stats.num_index_tuples);

    let got = eq_scan(&index, 9);
    assert_eq!(
        (1..=20).filter(|i| i % 2 == 1).count(),
        got.len()
    );
    assert!(got.iter().all(|tid| tid.offset % 2 == 1));

    Ok(())
}

#[test]
fn vacuum_keeps_emptied_entry() -> rum_tree::Result<()> {
    let index = int_index();

    index.build(vec![
        (ItemPointer::new(0, 1), vec![Some(Datum::Inline(1))]),
        (ItemPointer::new(0, 2), vec![Some(Datum::Inline(2))]),
    ])?;

    index.bulk_delete(&|tid| tid.offset == 1)?;

    // the key-1 entry survives with an empty posting list, the entry tree
    // being static; key 2 is untouched
    assert!(eq_scan(&index, 1).is_empty());
    assert_eq!(vec![ItemPointer::new(0, 2)], eq_scan(&index, 2));

    // and new occurrences can land on the emptied entry again
    index.insert(&[Some(Datum::Inline(1))], ItemPointer::new(5, 5))?;
    assert_eq!(vec![ItemPointer::new(5, 5)], eq_scan(&index, 1));

    Ok(())
}

#[test]
fn vacuum_empties_posting_tree() -> rum_tree::Result<()> {
    let index = int_index();

    // enough occurrences under one key for a multi-leaf posting tree
    let n: u32 = 20_000;
    index.build((0..n).map(|i| {
        (
            ItemPointer::new(i * 1000, 1),
            vec![Some(Datum::Inline(77))],
        )
    }))?;
    assert!(index.stats()?.n_data_pages >= 3);

    let stats = index.bulk_delete(&|_| true)?;
    assert_eq!(u64::from(n), stats.tuples_removed);
    assert!(
        stats.pages_deleted >= 1,
        "expected emptied posting-tree leaves to be deleted: {stats:?}"
    );

    assert!(eq_scan(&index, 77).is_empty());

    let cleanup = index.vacuum_cleanup(Some(stats))?;
    assert!(cleanup.pages_free >= stats.pages_deleted);

    Ok(())
}

#[test]
fn vacuum_partial_delete_in_posting_tree() -> rum_tree::Result<()> {
    let index = int_index();

    let n: u32 = 20_000;
    index.build((0..n).map(|i| {
        (
            ItemPointer::new(i * 1000, 1),
            vec![Some(Datum::Inline(77))],
        )
    }))?;

    index.bulk_delete(&|tid| tid.blkno % 2000 == 0)?;

    let got = eq_scan(&index, 77);
    assert_eq!(n as usize / 2, got.len());
    assert!(got.iter().all(|tid| tid.blkno % 2000 == 1000));

    // the survivors are still in order and scannable after cleanup
    index.vacuum_cleanup(None)?;
    assert_eq!(got, eq_scan(&index, 77));

    Ok(())
}

#[test]
fn vacuum_recycles_deleted_pages() -> rum_tree::Result<()> {
    let index = int_index();

    let n: u32 = 20_000;
    index.build((0..n).map(|i| {
        (
            ItemPointer::new(i * 1000, 1),
            vec![Some(Datum::Inline(77))],
        )
    }))?;

    let before = index.n_pages();
    index.bulk_delete(&|_| true)?;
    index.vacuum_cleanup(None)?;

    // new growth reuses the recycled pages instead of extending the file
    for i in 0..n {
        index.insert(
            &[Some(Datum::Inline(78))],
            ItemPointer::new(i * 1000, 1),
        )?;
    }

    assert!(
        index.n_pages() <= before + 4,
        "expected page recycling, went from {before} to {}",
        index.n_pages()
    );
    assert_eq!(n as usize, eq_scan(&index, 78).len());

    Ok(())
}
