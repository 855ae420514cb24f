// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! External sorter
//!
//! Thin tuplesort analogue handling the two record kinds the scan pipeline
//! needs: ranked output rows (`RumSortItem`, a float distance vector per
//! ORDER BY key) and raw occurrences (`RumScanItem`, optionally ordered by a
//! caller-supplied addInfo comparator). Runs that exceed the memory budget
//! spill to anonymous temp files and are merged back with a double-ended
//! heap.

use crate::coding::{DecodeError, EncodeError};
use crate::datum::Datum;
use crate::item::{ItemPointer, RumItem};
use crate::opclass::NullCategory;
use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use interval_heap::IntervalHeap as Heap;
use std::cmp::Ordering;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use varint_rs::{VarintReader, VarintWriter};

/// Record comparator
pub type SortCmp<T> = Arc<dyn Fn(&T, &T) -> Ordering + Send + Sync>;

/// A record the sorter can hold and spill
pub trait SortRecord: Clone {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError>;

    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError>
    where
        Self: Sized;

    /// Approximate in-memory footprint, for the spill threshold
    fn memory_size(&self) -> usize;
}

fn encode_iptr<W: Write>(iptr: &ItemPointer, writer: &mut W) -> Result<(), EncodeError> {
    writer.write_u32::<LE>(iptr.blkno)?;
    writer.write_u16::<LE>(iptr.offset)?;
    Ok(())
}

fn decode_iptr<R: Read>(reader: &mut R) -> Result<ItemPointer, DecodeError> {
    let blkno = reader.read_u32::<LE>()?;
    let offset = reader.read_u16::<LE>()?;
    Ok(ItemPointer::new(blkno, offset))
}

fn encode_datum<W: Write>(datum: &Datum, writer: &mut W) -> Result<(), EncodeError> {
    match datum {
        Datum::Inline(v) => {
            writer.write_u8(1)?;
            writer.write_i64::<LE>(*v)?;
        }
        Datum::Bytes(b) => {
            writer.write_u8(2)?;
            #[allow(clippy::cast_possible_truncation)]
            writer.write_u32_varint(b.len() as u32)?;
            writer.write_all(b)?;
        }
    }
    Ok(())
}

fn decode_datum<R: Read>(reader: &mut R) -> Result<Datum, DecodeError> {
    match reader.read_u8()? {
        1 => Ok(Datum::Inline(reader.read_i64::<LE>()?)),
        2 => {
            let len = reader.read_u32_varint()? as usize;
            let mut buf = vec![0u8; len];
            reader.read_exact(&mut buf)?;
            Ok(Datum::Bytes(buf.into()))
        }
        tag => Err(DecodeError::InvalidTag(("Datum", tag))),
    }
}

fn encode_opt_datum<W: Write>(datum: &Option<Datum>, writer: &mut W) -> Result<(), EncodeError> {
    match datum {
        None => writer.write_u8(0)?,
        Some(d) => encode_datum(d, writer)?,
    }
    Ok(())
}

fn decode_opt_datum<R: Read>(reader: &mut R) -> Result<Option<Datum>, DecodeError> {
    let mut tag = [0u8; 1];
    reader.read_exact(&mut tag)?;
    match tag[0] {
        0 => Ok(None),
        1 => Ok(Some(Datum::Inline(reader.read_i64::<LE>()?))),
        2 => {
            let len = reader.read_u32_varint()? as usize;
            let mut buf = vec![0u8; len];
            reader.read_exact(&mut buf)?;
            Ok(Some(Datum::Bytes(buf.into())))
        }
        tag => Err(DecodeError::InvalidTag(("Option<Datum>", tag))),
    }
}

/// One ranked output row: heap pointer, recheck flag and a distance per
/// ORDER BY key
#[derive(Clone, Debug)]
pub struct RumSortItem {
    pub iptr: ItemPointer,
    pub recheck: bool,
    pub data: Vec<f64>,
}

impl SortRecord for RumSortItem {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        encode_iptr(&self.iptr, writer)?;
        writer.write_u8(u8::from(self.recheck))?;
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32_varint(self.data.len() as u32)?;
        for v in &self.data {
            writer.write_f64::<LE>(*v)?;
        }
        Ok(())
    }

    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let iptr = decode_iptr(reader)?;
        let recheck = reader.read_u8()? != 0;
        let n = reader.read_u32_varint()? as usize;
        let mut data = Vec::with_capacity(n);
        for _ in 0..n {
            data.push(reader.read_f64::<LE>()?);
        }
        Ok(Self {
            iptr,
            recheck,
            data,
        })
    }

    fn memory_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.data.len() * 8
    }
}

/// Comparator for [`RumSortItem`]: the distance vector first, then (unless
/// suppressed for full-index scans) the item pointer.
#[must_use]
pub fn rum_sort_item_cmp(compare_item_pointer: bool) -> SortCmp<RumSortItem> {
    Arc::new(move |a, b| {
        for (va, vb) in a.data.iter().zip(b.data.iter()) {
            match va.total_cmp(vb) {
                Ordering::Equal => {}
                other => return other,
            }
        }

        if compare_item_pointer {
            a.iptr.cmp(&b.iptr)
        } else {
            Ordering::Equal
        }
    })
}

/// One collected occurrence, with an optional snapshot of the entry key it
/// came from (used when ranking by the discovered key)
#[derive(Clone, Debug)]
pub struct RumScanItem {
    pub item: RumItem,
    pub key: Option<(Datum, NullCategory)>,
}

impl SortRecord for RumScanItem {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        encode_iptr(&self.item.iptr, writer)?;
        encode_opt_datum(&self.item.add_info, writer)?;

        match &self.key {
            None => writer.write_u8(0)?,
            Some((key, category)) => {
                writer.write_u8(1)?;
                writer.write_i8(category.as_i8())?;
                encode_datum(key, writer)?;
            }
        }
        Ok(())
    }

    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let iptr = decode_iptr(reader)?;
        let add_info = decode_opt_datum(reader)?;

        let key = match reader.read_u8()? {
            0 => None,
            1 => {
                let category = NullCategory::from_i8(reader.read_i8()?)
                    .map_err(|_| DecodeError::InvalidHeader("bad key category"))?;
                Some((decode_datum(reader)?, category))
            }
            tag => return Err(DecodeError::InvalidTag(("RumScanItem", tag))),
        };

        Ok(Self {
            item: RumItem { iptr, add_info },
            key,
        })
    }

    fn memory_size(&self) -> usize {
        let datum_mem = |d: &Option<Datum>| match d {
            Some(Datum::Bytes(b)) => b.len(),
            _ => 0,
        };
        std::mem::size_of::<Self>()
            + datum_mem(&self.item.add_info)
            + self.key.as_ref().map_or(0, |(k, _)| match k {
                Datum::Bytes(b) => b.len(),
                Datum::Inline(_) => 0,
            })
    }
}

/// Comparator for [`RumScanItem`]: the caller's addInfo comparator first
/// (null addInfo after non-null), the item pointer breaks ties.
#[must_use]
pub fn rum_scan_item_cmp(
    add_info_cmp: Option<SortCmp<Datum>>,
) -> SortCmp<RumScanItem> {
    Arc::new(move |a, b| {
        if let Some(cmp) = &add_info_cmp {
            match (&a.item.add_info, &b.item.add_info) {
                (Some(va), Some(vb)) => match cmp(va, vb) {
                    Ordering::Equal => {}
                    other => return other,
                },
                (Some(_), None) => return Ordering::Less,
                (None, Some(_)) => return Ordering::Greater,
                (None, None) => {}
            }
        }

        a.item.iptr.cmp(&b.item.iptr)
    })
}

struct HeapEntry<T> {
    item: T,
    run: usize,
    cmp: SortCmp<T>,
}

impl<T> PartialEq for HeapEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        (self.cmp)(&self.item, &other.item) == Ordering::Equal
    }
}

impl<T> Eq for HeapEntry<T> {}

impl<T> PartialOrd for HeapEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for HeapEntry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.cmp)(&self.item, &other.item).then(self.run.cmp(&other.run))
    }
}

enum SortState {
    Building,
    InMemory { next: usize },
    Merging,
}

/// Sorts records within a memory budget, spilling to temp files
pub struct Tuplesort<T: SortRecord> {
    cmp: SortCmp<T>,
    budget: usize,
    mem_used: usize,

    items: Vec<T>,
    runs: Vec<std::fs::File>,

    state: SortState,
    readers: Vec<BufReader<std::fs::File>>,
    heap: Heap<HeapEntry<T>>,
}

impl<T: SortRecord> Tuplesort<T> {
    #[must_use]
    pub fn new(work_mem_kb: usize, cmp: SortCmp<T>) -> Self {
        Self {
            cmp,
            budget: work_mem_kb * 1024,
            mem_used: 0,
            items: Vec::new(),
            runs: Vec::new(),
            state: SortState::Building,
            readers: Vec::new(),
            heap: Heap::with_capacity(0),
        }
    }

    fn dump_run(&mut self) -> crate::Result<()> {
        let cmp = self.cmp.clone();
        self.items.sort_by(|a, b| cmp(a, b));

        let file = tempfile::tempfile()?;
        let mut writer = BufWriter::new(file);
        for item in self.items.drain(..) {
            item.encode_into(&mut writer)?;
        }
        let mut file = writer
            .into_inner()
            .map_err(|e| crate::Error::Io(e.into_error()))?;
        file.flush()?;

        self.runs.push(file);
        self.mem_used = 0;
        Ok(())
    }

    pub fn put(&mut self, item: T) -> crate::Result<()> {
        debug_assert!(matches!(self.state, SortState::Building));

        self.mem_used += item.memory_size();
        self.items.push(item);

        if self.mem_used > self.budget {
            self.dump_run()?;
        }
        Ok(())
    }

    fn read_record(reader: &mut BufReader<std::fs::File>) -> crate::Result<Option<T>> {
        // peek one byte to detect a clean end of run
        let mut probe = [0u8; 1];
        match reader.read_exact(&mut probe) {
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
            Ok(()) => {}
        }

        let mut chained = probe.as_slice().chain(reader);
        Ok(Some(T::decode_from(&mut chained).map_err(crate::Error::Decode)?))
    }

    fn start_merge(&mut self) -> crate::Result<()> {
        self.heap = Heap::with_capacity(self.readers.len());

        for run in 0..self.readers.len() {
            if let Some(item) = Self::read_record(&mut self.readers[run])? {
                self.heap.push(HeapEntry {
                    item,
                    run,
                    cmp: self.cmp.clone(),
                });
            }
        }
        Ok(())
    }

    /// Finishes loading and prepares for reading.
    pub fn perform_sort(&mut self) -> crate::Result<()> {
        if self.runs.is_empty() {
            let cmp = self.cmp.clone();
            self.items.sort_by(|a, b| cmp(a, b));
            self.state = SortState::InMemory { next: 0 };
            return Ok(());
        }

        if !self.items.is_empty() {
            self.dump_run()?;
        }

        self.readers = self
            .runs
            .drain(..)
            .map(|mut f| {
                f.seek(SeekFrom::Start(0)).map(|_| BufReader::new(f))
            })
            .collect::<std::io::Result<_>>()?;

        self.start_merge()?;
        self.state = SortState::Merging;
        Ok(())
    }

    /// Returns the next record in sort order.
    pub fn get_next(&mut self) -> crate::Result<Option<T>> {
        match &mut self.state {
            SortState::Building => {
                debug_assert!(false, "perform_sort was not called");
                Ok(None)
            }
            SortState::InMemory { next } => {
                let Some(item) = self.items.get(*next) else {
                    return Ok(None);
                };
                *next += 1;
                Ok(Some(item.clone()))
            }
            SortState::Merging => {
                let Some(top) = self.heap.pop_min() else {
                    return Ok(None);
                };

                if let Some(refill) = Self::read_record(&mut self.readers[top.run])? {
                    self.heap.push(HeapEntry {
                        item: refill,
                        run: top.run,
                        cmp: self.cmp.clone(),
                    });
                }

                Ok(Some(top.item))
            }
        }
    }

    /// Rewinds to the first record (random access restart).
    pub fn rescan(&mut self) -> crate::Result<()> {
        match &mut self.state {
            SortState::Building => Ok(()),
            SortState::InMemory { next } => {
                *next = 0;
                Ok(())
            }
            SortState::Merging => {
                for reader in &mut self.readers {
                    reader.seek(SeekFrom::Start(0))?;
                }
                self.start_merge()
            }
        }
    }
}

impl Tuplesort<RumSortItem> {
    /// Sorter for ranked output rows.
    #[must_use]
    pub fn begin_rum(work_mem_kb: usize, compare_item_pointer: bool) -> Self {
        Self::new(work_mem_kb, rum_sort_item_cmp(compare_item_pointer))
    }
}

impl Tuplesort<RumScanItem> {
    /// Sorter for collected occurrences with an optional addInfo order.
    #[must_use]
    pub fn begin_rum_item(work_mem_kb: usize, add_info_cmp: Option<SortCmp<Datum>>) -> Self {
        Self::new(work_mem_kb, rum_scan_item_cmp(add_info_cmp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn scan_item(blkno: u32, off: u16, info: Option<i64>) -> RumScanItem {
        RumScanItem {
            item: RumItem::new(ItemPointer::new(blkno, off), info.map(Datum::Inline)),
            key: None,
        }
    }

    #[test]
    fn sort_in_memory() {
        let mut sorter = Tuplesort::begin_rum_item(1024, None);
        for (b, o) in [(3, 1), (1, 2), (1, 1), (2, 7)] {
            sorter.put(scan_item(b, o, None)).unwrap();
        }
        sorter.perform_sort().unwrap();

        let mut got = Vec::new();
        while let Some(item) = sorter.get_next().unwrap() {
            got.push((item.item.iptr.blkno, item.item.iptr.offset));
        }
        assert_eq!(vec![(1, 1), (1, 2), (2, 7), (3, 1)], got);

        sorter.rescan().unwrap();
        assert_eq!(
            (1, 1),
            sorter
                .get_next()
                .unwrap()
                .map(|i| (i.item.iptr.blkno, i.item.iptr.offset))
                .unwrap()
        );
    }

    #[test]
    fn sort_spills_and_merges() {
        // a tiny budget forces several runs
        let mut sorter = Tuplesort::begin_rum_item(1, None);
        let n = 1000u32;
        for i in (0..n).rev() {
            sorter.put(scan_item(i, 1, None)).unwrap();
        }
        sorter.perform_sort().unwrap();

        let mut expect = 0;
        while let Some(item) = sorter.get_next().unwrap() {
            assert_eq!(expect, item.item.iptr.blkno);
            expect += 1;
        }
        assert_eq!(n, expect);

        sorter.rescan().unwrap();
        assert_eq!(0, sorter.get_next().unwrap().unwrap().item.iptr.blkno);
    }

    #[test]
    fn sort_by_add_info_nulls_last() {
        let cmp: SortCmp<Datum> = Arc::new(|a, b| a.inline().cmp(&b.inline()));
        let mut sorter = Tuplesort::begin_rum_item(1024, Some(cmp));

        sorter.put(scan_item(1, 1, Some(30))).unwrap();
        sorter.put(scan_item(2, 1, None)).unwrap();
        sorter.put(scan_item(3, 1, Some(10))).unwrap();
        sorter.perform_sort().unwrap();

        let order: Vec<u32> = std::iter::from_fn(|| sorter.get_next().unwrap())
            .map(|i| i.item.iptr.blkno)
            .collect();
        assert_eq!(vec![3, 1, 2], order);
    }

    #[test]
    fn sort_rum_items_by_distance_vector() {
        let mut sorter = Tuplesort::begin_rum(1024, true);

        for (b, d) in [(1u32, 5.0), (2, 1.0), (3, f64::INFINITY), (4, 1.0)] {
            sorter
                .put(RumSortItem {
                    iptr: ItemPointer::new(b, 1),
                    recheck: false,
                    data: vec![d],
                })
                .unwrap();
        }
        sorter.perform_sort().unwrap();

        let order: Vec<u32> = std::iter::from_fn(|| sorter.get_next().unwrap())
            .map(|i| i.iptr.blkno)
            .collect();
        assert_eq!(vec![2, 4, 1, 3], order);
    }

    #[test]
    fn scan_item_spill_roundtrip() {
        let item = RumScanItem {
            item: RumItem::new(
                ItemPointer::new(77, 3),
                Some(Datum::Bytes(b"positions".as_slice().into())),
            ),
            key: Some((Datum::from("lexeme"), NullCategory::NormKey)),
        };

        let mut buf = Vec::new();
        item.encode_into(&mut buf).unwrap();
        let back = RumScanItem::decode_from(&mut buf.as_slice()).unwrap();

        assert_eq!(item.item, back.item);
        assert_eq!(item.key.as_ref().unwrap().0, back.key.as_ref().unwrap().0);
    }
}
