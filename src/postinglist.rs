// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Varbyte codec for posting streams
//!
//! A stream stores `{item pointer, addInfoIsNull, addInfo}` triples. In
//! natural order the item pointer is delta-encoded: the block increment in
//! 7-bit little-endian varbyte, the offset likewise except the terminator
//! byte only carries six payload bits, its 0x40 bit holding the null flag.
//! In alternative order the raw 6-byte item pointer is stored instead and
//! the offset's high bit holds the null flag. The addInfo datum follows
//! whenever it is not null.

use crate::coding::DecodeError;
use crate::datum::{datum_read, datum_size, datum_write, AttrInfo, Datum};
use crate::item::{
    ItemPointer, OffsetNumber, RumItem, ALT_ADD_INFO_NULL_FLAG, MAX_OFFSET_NUMBER,
};
use crate::page::{
    Page, DATA_CONTENTS_OFFSET, DATA_PAGE_SIZE, LEAF_INDEX_COUNT, LEAF_INDEX_ENTRY_SIZE,
    LEAF_INDEX_OFFSET,
};
use byteorder::{ByteOrder, LittleEndian};

const HIGHBIT: u8 = 0x80;
const SEVENTH_BIT: u8 = 0x40;
const SIX_MASK: u8 = 0x3F;

/// Storage parameters of one column's posting streams
#[derive(Copy, Clone, Debug)]
pub struct LeafCodec {
    /// True only for the attach column of an alternative-order index
    pub alt_order: bool,
    /// Storage description of the addInfo type, if the column has one
    pub add_attr: Option<AttrInfo>,
}

impl LeafCodec {
    #[must_use]
    pub fn plain() -> Self {
        Self {
            alt_order: false,
            add_attr: None,
        }
    }

    /// Serializes one item at `offset`, returning the offset just past it.
    ///
    /// `prev` is the previously written item pointer (MIN for the first).
    pub fn write_item(
        &self,
        buf: &mut [u8],
        offset: usize,
        item: &RumItem,
        prev: &ItemPointer,
    ) -> usize {
        let mut pos = offset;

        if self.alt_order {
            LittleEndian::write_u32(&mut buf[pos..pos + 4], item.iptr.blkno);
            let mut posid = item.iptr.offset;
            debug_assert!(posid <= MAX_OFFSET_NUMBER);
            if item.add_info.is_none() {
                posid |= ALT_ADD_INFO_NULL_FLAG;
            }
            LittleEndian::write_u16(&mut buf[pos + 4..pos + 6], posid);
            pos += 6;
        } else {
            debug_assert!(item.iptr > *prev, "posting stream must be ascending");
            debug_assert!(item.iptr.offset != 0);

            let mut blk_incr = item.iptr.blkno - prev.blkno;
            loop {
                let byte = (blk_incr & 0x7F) as u8;
                blk_incr >>= 7;
                if blk_incr == 0 {
                    buf[pos] = byte;
                    pos += 1;
                    break;
                }
                buf[pos] = byte | HIGHBIT;
                pos += 1;
            }

            let mut off = item.iptr.offset;
            loop {
                if off >= SEVENTH_BIT as u16 {
                    buf[pos] = (off & 0x7F) as u8 | HIGHBIT;
                    pos += 1;
                    off >>= 7;
                } else {
                    let mut byte = off as u8;
                    if item.add_info.is_none() {
                        byte |= SEVENTH_BIT;
                    }
                    buf[pos] = byte;
                    pos += 1;
                    break;
                }
            }
        }

        if let Some(add_info) = &item.add_info {
            let attr = self.add_attr.expect("column has no addInfo type");
            pos = datum_write(buf, pos, &attr, add_info);
        }

        pos
    }

    /// Advances the running `size` by the bytes [`write_item`] would emit.
    ///
    /// `size` doubles as the alignment reference: callers synchronize it with
    /// the actual placement cursor (see the alignment prefix trick at the
    /// call sites).
    ///
    /// [`write_item`]: LeafCodec::write_item
    #[must_use]
    pub fn item_size(&self, size: usize, item: &RumItem, prev: &ItemPointer) -> usize {
        let mut size = size;

        if self.alt_order {
            size += 6;
        } else {
            let mut blk_incr = item.iptr.blkno.wrapping_sub(prev.blkno);
            loop {
                size += 1;
                blk_incr >>= 7;
                if blk_incr == 0 {
                    break;
                }
            }

            let mut off = item.iptr.offset;
            loop {
                size += 1;
                if off < SEVENTH_BIT as u16 {
                    break;
                }
                off >>= 7;
            }
        }

        if let Some(add_info) = &item.add_info {
            let attr = self.add_attr.expect("column has no addInfo type");
            size = datum_size(size, &attr, add_info);
        }

        size
    }

    /// Reads the item at `offset` into `item` (whose previous item pointer
    /// seeds the delta decode), returning the offset just past it.
    pub fn read_item(
        &self,
        buf: &[u8],
        offset: usize,
        item: &mut RumItem,
    ) -> Result<usize, DecodeError> {
        let mut pos = offset;
        let mut add_info_is_null = true;

        if self.alt_order {
            let raw = buf
                .get(pos..pos + 6)
                .ok_or(DecodeError::InvalidHeader("posting stream truncated"))?;
            item.iptr.blkno = LittleEndian::read_u32(&raw[0..4]);
            let posid = LittleEndian::read_u16(&raw[4..6]);
            add_info_is_null = posid & ALT_ADD_INFO_NULL_FLAG != 0;
            item.iptr.offset = posid & !ALT_ADD_INFO_NULL_FLAG;
            pos += 6;
        } else {
            let mut blk_incr: u64 = 0;
            let mut shift = 0u32;
            loop {
                let v = *buf
                    .get(pos)
                    .ok_or(DecodeError::InvalidHeader("posting stream truncated"))?;
                pos += 1;
                blk_incr |= u64::from(v & !HIGHBIT) << shift;
                shift += 7;
                if v & HIGHBIT == 0 {
                    break;
                }
                if shift > 35 {
                    return Err(DecodeError::InvalidHeader("runaway block increment"));
                }
            }

            let blkno = u64::from(item.iptr.blkno) + blk_incr;
            if blkno > u64::from(u32::MAX) {
                return Err(DecodeError::InvalidHeader("block number overflow"));
            }
            item.iptr.blkno = blkno as u32;

            let mut off: u16 = 0;
            let mut shift = 0u32;
            loop {
                let v = *buf
                    .get(pos)
                    .ok_or(DecodeError::InvalidHeader("posting stream truncated"))?;
                pos += 1;
                if v & HIGHBIT != 0 {
                    off |= u16::from(v & !HIGHBIT) << shift;
                } else {
                    off |= u16::from(v & SIX_MASK) << shift;
                    add_info_is_null = v & SEVENTH_BIT != 0;
                    break;
                }
                shift += 7;
                if shift > 14 {
                    return Err(DecodeError::InvalidHeader("runaway offset"));
                }
            }

            if off == 0 {
                return Err(DecodeError::InvalidHeader("invalid offset in stream"));
            }
            item.iptr.offset = off;
        }

        if add_info_is_null {
            item.add_info = None;
        } else {
            let attr = self
                .add_attr
                .ok_or(DecodeError::InvalidHeader("addInfo without addInfo type"))?;
            let (datum, next) = datum_read(buf, pos, &attr)?;
            item.add_info = Some(datum);
            pos = next;
        }

        Ok(pos)
    }
}

/// One sparse-index anchor of a data leaf page
///
/// `item` is the decoder state just before `offset_number` (the previous
/// item), `page_offset` the matching byte position relative to the stream
/// start.
#[derive(Clone, Debug)]
pub struct LeafAnchor {
    pub item: RumItem,
    pub offset_number: OffsetNumber,
    pub page_offset: u16,
}

fn anchor_slice(page: &Page, j: usize) -> &[u8] {
    let start = LEAF_INDEX_OFFSET + j * LEAF_INDEX_ENTRY_SIZE;
    &page.bytes()[start..start + LEAF_INDEX_ENTRY_SIZE]
}

/// Reads anchor `j` of a data leaf page; `None` when the slot is unused
/// (or out of range).
#[must_use]
pub fn leaf_anchor(page: &Page, j: usize) -> Option<LeafAnchor> {
    if j >= LEAF_INDEX_COUNT {
        return None;
    }
    let buf = anchor_slice(page, j);

    let offset_number = LittleEndian::read_u16(&buf[6..8]);
    if offset_number == 0 {
        return None;
    }

    let blkno = LittleEndian::read_u32(&buf[0..4]);
    let raw_posid = LittleEndian::read_u16(&buf[4..6]);
    let page_offset = LittleEndian::read_u16(&buf[8..10]);
    let inline = LittleEndian::read_i64(&buf[12..20]);

    let add_info = if raw_posid & ALT_ADD_INFO_NULL_FLAG != 0 {
        None
    } else {
        Some(Datum::Inline(inline))
    };

    Some(LeafAnchor {
        item: RumItem {
            iptr: ItemPointer::new(blkno, raw_posid & !ALT_ADD_INFO_NULL_FLAG),
            add_info,
        },
        offset_number,
        page_offset,
    })
}

fn write_anchor(page: &mut Page, j: usize, anchor: Option<&LeafAnchor>) {
    let start = LEAF_INDEX_OFFSET + j * LEAF_INDEX_ENTRY_SIZE;
    let buf = &mut page.bytes_mut()[start..start + LEAF_INDEX_ENTRY_SIZE];

    match anchor {
        None => buf.fill(0),
        Some(a) => {
            LittleEndian::write_u32(&mut buf[0..4], a.item.iptr.blkno);
            let (posid, inline) = match &a.item.add_info {
                Some(Datum::Inline(v)) => (a.item.iptr.offset, *v),
                Some(Datum::Bytes(_)) | None => {
                    (a.item.iptr.offset | ALT_ADD_INFO_NULL_FLAG, 0)
                }
            };
            LittleEndian::write_u16(&mut buf[4..6], posid);
            LittleEndian::write_u16(&mut buf[6..8], a.offset_number);
            LittleEndian::write_u16(&mut buf[8..10], a.page_offset);
            LittleEndian::write_u16(&mut buf[10..12], 0);
            LittleEndian::write_i64(&mut buf[12..20], inline);
        }
    }
}

/// Rebuilds the sparse index of a data leaf page and refreshes the
/// free-space bookkeeping. Returns the byte length of the stream.
pub fn update_item_indexes(page: &mut Page, codec: &LeafCodec) -> Result<usize, DecodeError> {
    let maxoff = page.maxoff() as usize;

    let mut anchors: Vec<LeafAnchor> = Vec::new();
    let mut item = RumItem::min();
    let mut pos = DATA_CONTENTS_OFFSET;

    {
        let buf = page.bytes();
        for i in 1..=maxoff {
            if i * (LEAF_INDEX_COUNT + 1) > (anchors.len() + 1) * maxoff {
                anchors.push(LeafAnchor {
                    item: item.clone(),
                    offset_number: i as OffsetNumber,
                    page_offset: (pos - DATA_CONTENTS_OFFSET) as u16,
                });
            }

            pos = codec.read_item(buf, pos, &mut item)?;
            if pos > LEAF_INDEX_OFFSET {
                return Err(DecodeError::InvalidHeader("stream overruns sparse index"));
            }
        }
    }

    let used_slots = anchors.len();
    for (slot, anchor) in anchors.iter().enumerate() {
        write_anchor(page, slot, Some(anchor));
    }
    for slot in used_slots..LEAF_INDEX_COUNT {
        write_anchor(page, slot, None);
    }

    let used = pos - DATA_CONTENTS_OFFSET;
    page.set_freespace((DATA_PAGE_SIZE - used) as u16);
    page.set_lower(pos as u16);
    page.set_upper(LEAF_INDEX_OFFSET as u16);

    Ok(used)
}

/// Decodes every item of a data leaf page.
pub fn read_all_items(page: &Page, codec: &LeafCodec) -> Result<Vec<RumItem>, DecodeError> {
    let maxoff = page.maxoff() as usize;
    let mut out = Vec::with_capacity(maxoff);

    let mut item = RumItem::min();
    let mut pos = DATA_CONTENTS_OFFSET;
    for _ in 0..maxoff {
        pos = codec.read_item(page.bytes(), pos, &mut item)?;
        out.push(item.clone());
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::flags;
    use test_log::test;

    fn items(specs: &[(u32, u16)]) -> Vec<RumItem> {
        specs
            .iter()
            .map(|&(b, o)| RumItem::new(ItemPointer::new(b, o), None))
            .collect()
    }

    #[test]
    fn varbyte_roundtrip_no_addinfo() {
        let codec = LeafCodec::plain();
        let input = items(&[(0, 1), (0, 2), (0, 100), (1, 1), (300, 7), (1 << 20, 0x7FFF)]);

        let mut buf = vec![0u8; 1024];
        let mut pos = 0;
        let mut prev = ItemPointer::min();
        let mut size = 0;

        for item in &input {
            size = codec.item_size(size, item, &prev);
            pos = codec.write_item(&mut buf, pos, item, &prev);
            assert_eq!(size, pos, "estimator and writer must agree");
            prev = item.iptr;
        }

        let mut out = Vec::new();
        let mut item = RumItem::min();
        let mut rpos = 0;
        for _ in 0..input.len() {
            rpos = codec.read_item(&buf, rpos, &mut item).unwrap();
            out.push(item.clone());
        }

        assert_eq!(input, out);
        assert_eq!(pos, rpos);
    }

    #[test]
    fn varbyte_roundtrip_with_addinfo() {
        let codec = LeafCodec {
            alt_order: false,
            add_attr: Some(AttrInfo::int8()),
        };

        let input = vec![
            RumItem::new(ItemPointer::new(0, 1), Some(Datum::Inline(1000))),
            RumItem::new(ItemPointer::new(0, 2), None),
            RumItem::new(ItemPointer::new(5, 3), Some(Datum::Inline(-7))),
        ];

        let mut buf = vec![0u8; 256];
        let mut pos = 0;
        let mut prev = ItemPointer::min();
        for item in &input {
            let want = codec.item_size(pos, item, &prev);
            pos = codec.write_item(&mut buf, pos, item, &prev);
            assert_eq!(want, pos);
            prev = item.iptr;
        }

        let mut out = Vec::new();
        let mut item = RumItem::min();
        let mut rpos = 0;
        for _ in 0..input.len() {
            rpos = codec.read_item(&buf, rpos, &mut item).unwrap();
            out.push(item.clone());
        }
        assert_eq!(input, out);
    }

    #[test]
    fn varbyte_alt_order_null_flag() {
        let codec = LeafCodec {
            alt_order: true,
            add_attr: Some(AttrInfo::int8()),
        };

        let input = vec![
            RumItem::new(ItemPointer::new(9, 0x7FFF), None),
            RumItem::new(ItemPointer::new(2, 4), Some(Datum::Inline(42))),
        ];

        let mut buf = vec![0u8; 128];
        let mut pos = 0;
        let prev = ItemPointer::min();
        for item in &input {
            pos = codec.write_item(&mut buf, pos, item, &prev);
        }

        let mut out = Vec::new();
        let mut item = RumItem::min();
        let mut rpos = 0;
        for _ in 0..input.len() {
            rpos = codec.read_item(&buf, rpos, &mut item).unwrap();
            out.push(item.clone());
        }
        assert_eq!(input, out);
    }

    #[test]
    fn varlena_addinfo_roundtrip() {
        let codec = LeafCodec {
            alt_order: false,
            add_attr: Some(AttrInfo::varlena()),
        };

        let input = vec![
            RumItem::new(
                ItemPointer::new(1, 1),
                Some(Datum::Bytes(b"positions".as_slice().into())),
            ),
            RumItem::new(ItemPointer::new(1, 2), None),
        ];

        let mut buf = vec![0u8; 256];
        let mut pos = 0;
        let mut prev = ItemPointer::min();
        let mut size = 0;
        for item in &input {
            size = codec.item_size(size, item, &prev);
            pos = codec.write_item(&mut buf, pos, item, &prev);
            assert_eq!(size, pos);
            prev = item.iptr;
        }

        let mut out = Vec::new();
        let mut item = RumItem::min();
        let mut rpos = 0;
        for _ in 0..input.len() {
            rpos = codec.read_item(&buf, rpos, &mut item).unwrap();
            out.push(item.clone());
        }
        assert_eq!(input, out);
    }

    #[test]
    fn sparse_index_covers_page() {
        let codec = LeafCodec::plain();
        let mut page = Page::new(flags::DATA | flags::LEAF);

        let n = 330;
        let mut pos = DATA_CONTENTS_OFFSET;
        let mut prev = ItemPointer::min();
        for i in 0..n {
            let item = RumItem::new(ItemPointer::new(i / 10, (i % 10 + 1) as u16), None);
            pos = codec.write_item(page.bytes_mut(), pos, &item, &prev);
            prev = item.iptr;
        }
        page.set_maxoff(n as u16);

        update_item_indexes(&mut page, &codec).unwrap();

        let mut seen = 0;
        let mut last_off = 0;
        for j in 0..LEAF_INDEX_COUNT {
            if let Some(anchor) = leaf_anchor(&page, j) {
                assert!(anchor.offset_number > last_off);
                last_off = anchor.offset_number;
                seen += 1;
            }
        }
        assert!(seen >= LEAF_INDEX_COUNT - 1, "expected dense anchor usage");

        // resuming from an anchor reproduces the tail of the stream
        let anchor = leaf_anchor(&page, 3).unwrap();
        let mut item = anchor.item.clone();
        let mut rpos = DATA_CONTENTS_OFFSET + anchor.page_offset as usize;
        let all = read_all_items(&page, &codec).unwrap();
        for expect in &all[anchor.offset_number as usize - 1..] {
            rpos = codec.read_item(page.bytes(), rpos, &mut item).unwrap();
            assert_eq!(expect, &item);
        }
    }
}
