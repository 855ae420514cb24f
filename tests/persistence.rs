use rum_tree::opclasses::{btree_strategy, Int64Ops};
use rum_tree::{ColumnDef, Config, Datum, ItemPointer, RumIndex, ScanQual};
use std::sync::Arc;
use test_log::test;

fn columns() -> Vec<ColumnDef> {
    vec![ColumnDef::new("x", Arc::new(Int64Ops))]
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
fn index_survives_reopen() -> rum_tree::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("rum.idx");

    {
        let index = RumIndex::open(&path, columns(), Config::new())?;
        index.build((1..=2000u16).map(|i| {
            (
                ItemPointer::new(0, i),
                vec![Some(Datum::Inline(i64::from(i % 5)))],
            )
        }))?;
        index.flush()?;
    }

    let index = RumIndex::open(&path, columns(), Config::new())?;

    let got = eq_scan(&index, 3);
    let expect: Vec<ItemPointer> = (1..=2000u16)
        .filter(|i| i % 5 == 3)
        .map(|i| ItemPointer::new(0, i))
        .collect();
    assert_eq!(expect, got);

    // stats came back through the metapage
    assert_eq!(5, index.stats()?.n_entries);

    Ok(())
}

#[test]
fn reopened_index_accepts_inserts() -> rum_tree::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("rum.idx");

    {
        let index = RumIndex::open(&path, columns(), Config::new())?;
        index.build(vec![(ItemPointer::new(0, 1), vec![Some(Datum::Inline(1))])])?;
        index.flush()?;
    }

    let index = RumIndex::open(&path, columns(), Config::new())?;
    index.insert(&[Some(Datum::Inline(1))], ItemPointer::new(0, 2))?;

    assert_eq!(
        vec![ItemPointer::new(0, 1), ItemPointer::new(0, 2)],
        eq_scan(&index, 1)
    );

    Ok(())
}

#[test]
fn corrupted_page_is_detected() -> rum_tree::Result<()> {
    use std::io::{Seek, SeekFrom, Write};

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("rum.idx");

    {
        let index = RumIndex::open(&path, columns(), Config::new())?;
        index.build((1..=100u16).map(|i| {
            (ItemPointer::new(0, i), vec![Some(Datum::Inline(7))])
        }))?;
        index.flush()?;
    }

    // flip a byte in the middle of the root page's payload
    {
        let mut file = std::fs::OpenOptions::new().write(true).open(&path)?;
        file.seek(SeekFrom::Start(8192 + 1000))?;
        file.write_all(&[0xFF])?;
    }

    let index = RumIndex::open(&path, columns(), Config::new());
    let failed = match index {
        Err(_) => true,
        Ok(index) => {
            let mut scan = index.begin_scan();
            scan.rescan(
                vec![ScanQual::new(1, btree_strategy::EQUAL, Datum::Inline(7))],
                vec![],
            );
            scan.get_tuple().is_err()
        }
    };

    assert!(failed, "corruption must surface as an error");
    Ok(())
}
