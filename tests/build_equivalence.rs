use rand::seq::SliceRandom;
use rand::SeedableRng;
use rum_tree::opclasses::{btree_strategy, text_strategy, Int64Ops, TextTermsOps};
use rum_tree::{ColumnDef, Config, Datum, ItemPointer, RumIndex, ScanQual};
use std::sync::Arc;
use test_log::test;

fn collect(index: &RumIndex, quals: Vec<ScanQual>) -> Vec<ItemPointer> {
    let mut scan = index.begin_scan();
    scan.rescan(quals, vec![]);

    let mut out = vec![];
    while scan.get_tuple().unwrap() {
        out.push(scan.heap_ptr.unwrap());
    }
    out
}

#[test]
fn build_order_does_not_change_contents() -> rum_tree::Result<()> {
    let mut rows: Vec<(ItemPointer, i64)> = (0..3000u32)
        .map(|i| (ItemPointer::new(i / 8, (i % 8 + 1) as u16), i64::from(i % 40)))
        .collect();

    let sorted = RumIndex::create(
        vec![ColumnDef::new("x", Arc::new(Int64Ops))],
        Config::new(),
    )?;
    sorted.build(
        rows.iter()
            .map(|(tid, v)| (*tid, vec![Some(Datum::Inline(*v))])),
    )?;

    let mut rng = rand::rngs::StdRng::seed_from_u64(0xC0DE);
    rows.shuffle(&mut rng);

    let shuffled = RumIndex::create(
        vec![ColumnDef::new("x", Arc::new(Int64Ops))],
        Config::new(),
    )?;
    shuffled.build(
        rows.iter()
            .map(|(tid, v)| (*tid, vec![Some(Datum::Inline(*v))])),
    )?;

    for key in 0..40i64 {
        let quals = vec![ScanQual::new(1, btree_strategy::EQUAL, Datum::Inline(key))];
        assert_eq!(
            collect(&sorted, quals.clone()),
            collect(&shuffled, quals),
            "key {key} differs between build orders"
        );
    }

    Ok(())
}

#[test]
fn small_build_budget_forces_intermediate_flushes() -> rum_tree::Result<()> {
    // a tiny accumulator budget drains mid-build many times; results must
    // not change
    let reference = RumIndex::create(
        vec![ColumnDef::new("t", Arc::new(TextTermsOps))],
        Config::new(),
    )?;
    let tiny = RumIndex::create(
        vec![ColumnDef::new("t", Arc::new(TextTermsOps))],
        Config::new().maintenance_work_mem_kb(1),
    )?;

    let rows: Vec<(ItemPointer, String)> = (1..=300u16)
        .map(|i| {
            (
                ItemPointer::new(0, i),
                format!("tok{} tok{} shared", i % 11, i % 7),
            )
        })
        .collect();

    for index in [&reference, &tiny] {
        index.build(
            rows.iter()
                .map(|(tid, text)| (*tid, vec![Some(Datum::from(text.as_str()))])),
        )?;
    }

    for query in ["shared", "tok3", "tok3 tok5", "shared tok0"] {
        let quals = vec![ScanQual::new(1, text_strategy::MATCH, Datum::from(query))];
        assert_eq!(
            collect(&reference, quals.clone()),
            collect(&tiny, quals),
            "query {query:?} differs"
        );
    }

    Ok(())
}
