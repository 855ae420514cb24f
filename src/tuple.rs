// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Entry-tree tuple format
//!
//! A tuple is a 12-byte header, the key datum (absent for placeholder
//! categories) and, on leaf pages, either an inline varbyte posting list of
//! `n_posting` items or, when `n_posting == 0xFFFF`, nothing — the posting
//! moved into a posting tree whose root block lives in the `aux` field.
//! On internal pages `aux` is the downlink.

use crate::coding::DecodeError;
use crate::datum::{datum_read, datum_size, datum_write, AttrInfo, Datum};
use crate::item::{BlockNumber, ItemPointer, RumItem};
use crate::opclass::NullCategory;
use crate::page::{BLCKSZ, MAX_ALIGN, PACKED_ITEM_SIZE, PAGE_HEADER_SIZE, PAGE_OPAQUE_SIZE};
use crate::postinglist::LeafCodec;
use byteorder::{ByteOrder, LittleEndian};

/// `n_posting` value marking a posting-tree reference
pub const POSTING_TREE_MARKER: u16 = 0xFFFF;

/// Tuple header size
pub const TUPLE_HEADER_SIZE: usize = 12;

/// Maximum size of an entry tuple; anything bigger converts its posting list
/// into a posting tree (or fails if the key alone is too big)
pub const RUM_MAX_ITEM_SIZE: usize =
    (BLCKSZ - PAGE_HEADER_SIZE - PAGE_OPAQUE_SIZE) / 6 - PACKED_ITEM_SIZE;

const O_NPOSTING: usize = 0;
const O_AUX: usize = 2;
const O_ATTNUM: usize = 6;
const O_CATEGORY: usize = 8;
const O_KEY_LEN: usize = 10;

/// Borrowed view over a serialized entry tuple
#[derive(Copy, Clone)]
pub struct EntryTuple<'a>(&'a [u8]);

impl<'a> EntryTuple<'a> {
    pub fn parse(raw: &'a [u8]) -> Result<Self, DecodeError> {
        if raw.len() < TUPLE_HEADER_SIZE {
            return Err(DecodeError::InvalidHeader("entry tuple too short"));
        }
        let tuple = Self(raw);
        if TUPLE_HEADER_SIZE + tuple.key_len() > raw.len() {
            return Err(DecodeError::InvalidHeader("entry tuple key overruns"));
        }
        Ok(tuple)
    }

    #[must_use]
    pub fn raw(&self) -> &'a [u8] {
        self.0
    }

    #[must_use]
    pub fn n_posting(&self) -> u16 {
        LittleEndian::read_u16(&self.0[O_NPOSTING..O_NPOSTING + 2])
    }

    #[must_use]
    pub fn is_posting_tree(&self) -> bool {
        self.n_posting() == POSTING_TREE_MARKER
    }

    /// Root block of the posting tree (only for posting-tree references).
    #[must_use]
    pub fn posting_tree_root(&self) -> BlockNumber {
        debug_assert!(self.is_posting_tree());
        LittleEndian::read_u32(&self.0[O_AUX..O_AUX + 4])
    }

    /// Child block (only meaningful on internal pages).
    #[must_use]
    pub fn downlink(&self) -> BlockNumber {
        LittleEndian::read_u32(&self.0[O_AUX..O_AUX + 4])
    }

    #[must_use]
    pub fn attnum(&self) -> u16 {
        LittleEndian::read_u16(&self.0[O_ATTNUM..O_ATTNUM + 2])
    }

    pub fn category(&self) -> Result<NullCategory, crate::Error> {
        NullCategory::from_i8(self.0[O_CATEGORY] as i8)
    }

    #[must_use]
    pub fn key_len(&self) -> usize {
        LittleEndian::read_u16(&self.0[O_KEY_LEN..O_KEY_LEN + 2]) as usize
    }

    /// The stored key, `None` for placeholder categories.
    pub fn key(&self, attr: &AttrInfo) -> Result<Option<Datum>, crate::Error> {
        if !self.category()?.is_norm() {
            if self.key_len() != 0 {
                return Err(crate::Error::CategoryMismatch);
            }
            return Ok(None);
        }
        if self.key_len() == 0 {
            return Err(crate::Error::CategoryMismatch);
        }
        let (datum, _) = datum_read(self.0, TUPLE_HEADER_SIZE, attr)
            .map_err(crate::Error::Decode)?;
        Ok(Some(datum))
    }

    #[must_use]
    pub fn posting_offset(&self) -> usize {
        TUPLE_HEADER_SIZE + self.key_len()
    }

    /// Decodes the inline posting list.
    pub fn read_posting(&self, codec: &LeafCodec) -> Result<Vec<RumItem>, DecodeError> {
        debug_assert!(!self.is_posting_tree());
        let n = self.n_posting() as usize;

        let mut out = Vec::with_capacity(n);
        let mut item = RumItem::min();
        let mut pos = self.posting_offset();
        for _ in 0..n {
            pos = codec.read_item(self.0, pos, &mut item)?;
            out.push(item.clone());
        }

        if pos != self.0.len() {
            return Err(DecodeError::InvalidHeader(
                "posting list does not fill entry tuple",
            ));
        }
        Ok(out)
    }
}

fn write_header(
    buf: &mut [u8],
    n_posting: u16,
    aux: u32,
    attnum: u16,
    category: NullCategory,
    key_len: usize,
) {
    LittleEndian::write_u16(&mut buf[O_NPOSTING..O_NPOSTING + 2], n_posting);
    LittleEndian::write_u32(&mut buf[O_AUX..O_AUX + 4], aux);
    LittleEndian::write_u16(&mut buf[O_ATTNUM..O_ATTNUM + 2], attnum);
    buf[O_CATEGORY] = category.as_i8() as u8;
    buf[O_CATEGORY + 1] = 0;
    LittleEndian::write_u16(&mut buf[O_KEY_LEN..O_KEY_LEN + 2], key_len as u16);
}

fn serialize_key(attr: &AttrInfo, key: Option<&Datum>, category: NullCategory) -> Vec<u8> {
    debug_assert_eq!(category.is_norm(), key.is_some());

    let Some(key) = key else { return Vec::new() };

    let end = datum_size(TUPLE_HEADER_SIZE, attr, key);
    let mut buf = vec![0u8; end];
    let written = datum_write(&mut buf, TUPLE_HEADER_SIZE, attr, key);
    debug_assert_eq!(end, written);
    buf.drain(..TUPLE_HEADER_SIZE);
    buf
}

/// Forms a leaf entry tuple with an inline posting list.
///
/// Returns `None` when the tuple would exceed [`RUM_MAX_ITEM_SIZE`] and
/// `error_too_big` is false; the caller converts to a posting tree then.
pub fn form_tuple(
    attnum: u16,
    key: Option<&Datum>,
    category: NullCategory,
    attr: &AttrInfo,
    codec: &LeafCodec,
    items: &[RumItem],
    error_too_big: bool,
) -> Result<Option<Vec<u8>>, crate::Error> {
    let key_bytes = serialize_key(attr, key, category);
    let posting_offset = TUPLE_HEADER_SIZE + key_bytes.len();

    // size check first, with the same running-total the writer will produce
    let mut size = posting_offset;
    let mut prev = ItemPointer::min();
    for item in items {
        size = codec.item_size(size, item, &prev);
        prev = item.iptr;
    }

    if size > RUM_MAX_ITEM_SIZE {
        if error_too_big {
            return Err(crate::Error::ItemTooLarge(size, RUM_MAX_ITEM_SIZE));
        }
        return Ok(None);
    }

    let mut buf = vec![0u8; size];
    write_header(
        &mut buf,
        items.len() as u16,
        0,
        attnum,
        category,
        key_bytes.len(),
    );
    buf[TUPLE_HEADER_SIZE..posting_offset].copy_from_slice(&key_bytes);

    let mut pos = posting_offset;
    let mut prev = ItemPointer::min();
    for item in items {
        pos = codec.write_item(&mut buf, pos, item, &prev);
        prev = item.iptr;
    }
    debug_assert_eq!(size, pos);

    Ok(Some(buf))
}

/// Forms a leaf entry tuple around an already-encoded posting stream
/// (vacuum's re-encode path).
pub fn form_tuple_raw(
    attnum: u16,
    key: Option<&Datum>,
    category: NullCategory,
    attr: &AttrInfo,
    data: &[u8],
    n_posting: u16,
) -> Result<Vec<u8>, crate::Error> {
    let key_bytes = serialize_key(attr, key, category);
    let posting_offset = TUPLE_HEADER_SIZE + key_bytes.len();
    let size = posting_offset + data.len();

    if size > RUM_MAX_ITEM_SIZE {
        return Err(crate::Error::ItemTooLarge(size, RUM_MAX_ITEM_SIZE));
    }

    let mut buf = vec![0u8; size];
    write_header(&mut buf, n_posting, 0, attnum, category, key_bytes.len());
    buf[TUPLE_HEADER_SIZE..posting_offset].copy_from_slice(&key_bytes);
    buf[posting_offset..].copy_from_slice(data);
    Ok(buf)
}

/// Forms a leaf entry tuple referencing a posting tree.
pub fn form_posting_tree_tuple(
    attnum: u16,
    key: Option<&Datum>,
    category: NullCategory,
    attr: &AttrInfo,
    root: BlockNumber,
) -> Result<Vec<u8>, crate::Error> {
    let key_bytes = serialize_key(attr, key, category);
    let size = TUPLE_HEADER_SIZE + key_bytes.len();

    if size > RUM_MAX_ITEM_SIZE {
        return Err(crate::Error::ItemTooLarge(size, RUM_MAX_ITEM_SIZE));
    }

    let mut buf = vec![0u8; size];
    write_header(
        &mut buf,
        POSTING_TREE_MARKER,
        root,
        attnum,
        category,
        key_bytes.len(),
    );
    buf[TUPLE_HEADER_SIZE..].copy_from_slice(&key_bytes);
    Ok(buf)
}

/// Forms an internal-page tuple from a leaf or internal tuple: same key, no
/// posting payload, downlink to `child`.
#[must_use]
pub fn form_interior_tuple(src: &EntryTuple<'_>, child: BlockNumber) -> Vec<u8> {
    let keep = TUPLE_HEADER_SIZE + src.key_len();

    let mut buf = src.raw()[..keep].to_vec();
    LittleEndian::write_u16(&mut buf[O_NPOSTING..O_NPOSTING + 2], 0);
    LittleEndian::write_u32(&mut buf[O_AUX..O_AUX + 4], child);
    buf
}

/// Overwrites the downlink of an internal tuple in place.
pub fn set_downlink(raw: &mut [u8], child: BlockNumber) {
    LittleEndian::write_u32(&mut raw[O_AUX..O_AUX + 4], child);
}

/// Page space an entry tuple occupies, including its line pointer.
#[must_use]
pub fn tuple_page_space(len: usize) -> usize {
    ((len + MAX_ALIGN - 1) & !(MAX_ALIGN - 1)) + 4
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn items(specs: &[(u32, u16)]) -> Vec<RumItem> {
        specs
            .iter()
            .map(|&(b, o)| RumItem::new(ItemPointer::new(b, o), None))
            .collect()
    }

    #[test]
    fn tuple_roundtrip_inline_list() {
        let attr = AttrInfo::int8();
        let codec = LeafCodec::plain();
        let list = items(&[(0, 1), (0, 3), (2, 1)]);

        let raw = form_tuple(
            1,
            Some(&Datum::Inline(5)),
            NullCategory::NormKey,
            &attr,
            &codec,
            &list,
            true,
        )
        .unwrap()
        .unwrap();

        let tuple = EntryTuple::parse(&raw).unwrap();
        assert_eq!(1, tuple.attnum());
        assert_eq!(3, tuple.n_posting());
        assert!(!tuple.is_posting_tree());
        assert_eq!(Some(Datum::Inline(5)), tuple.key(&attr).unwrap());
        assert_eq!(list, tuple.read_posting(&codec).unwrap());
    }

    #[test]
    fn tuple_null_category() {
        let attr = AttrInfo::int8();
        let codec = LeafCodec::plain();
        let list = items(&[(0, 7)]);

        let raw = form_tuple(
            2,
            None,
            NullCategory::NullItem,
            &attr,
            &codec,
            &list,
            true,
        )
        .unwrap()
        .unwrap();

        let tuple = EntryTuple::parse(&raw).unwrap();
        assert_eq!(NullCategory::NullItem, tuple.category().unwrap());
        assert_eq!(None, tuple.key(&attr).unwrap());
        assert_eq!(list, tuple.read_posting(&codec).unwrap());
    }

    #[test]
    fn tuple_posting_tree_reference() {
        let attr = AttrInfo::varlena();
        let raw = form_posting_tree_tuple(
            1,
            Some(&Datum::Bytes(b"lexeme".as_slice().into())),
            NullCategory::NormKey,
            &attr,
            4711,
        )
        .unwrap();

        let tuple = EntryTuple::parse(&raw).unwrap();
        assert!(tuple.is_posting_tree());
        assert_eq!(4711, tuple.posting_tree_root());
        assert_eq!(
            Some(Datum::Bytes(b"lexeme".as_slice().into())),
            tuple.key(&attr).unwrap()
        );
    }

    #[test]
    fn tuple_too_big_reports_or_converts() {
        let attr = AttrInfo::int8();
        let codec = LeafCodec::plain();

        // enough distant items to overflow the max tuple size
        let list: Vec<RumItem> = (0..RUM_MAX_ITEM_SIZE as u32)
            .map(|i| RumItem::new(ItemPointer::new(i * 1000, 1), None))
            .collect();

        assert!(matches!(
            form_tuple(
                1,
                Some(&Datum::Inline(1)),
                NullCategory::NormKey,
                &attr,
                &codec,
                &list,
                true,
            ),
            Err(crate::Error::ItemTooLarge(..))
        ));

        assert!(form_tuple(
            1,
            Some(&Datum::Inline(1)),
            NullCategory::NormKey,
            &attr,
            &codec,
            &list,
            false,
        )
        .unwrap()
        .is_none());
    }

    #[test]
    fn interior_tuple_drops_posting() {
        let attr = AttrInfo::int8();
        let codec = LeafCodec::plain();
        let list = items(&[(0, 1), (9, 2)]);

        let raw = form_tuple(
            1,
            Some(&Datum::Inline(13)),
            NullCategory::NormKey,
            &attr,
            &codec,
            &list,
            true,
        )
        .unwrap()
        .unwrap();
        let leaf = EntryTuple::parse(&raw).unwrap();

        let interior_raw = form_interior_tuple(&leaf, 99);
        let interior = EntryTuple::parse(&interior_raw).unwrap();

        assert_eq!(99, interior.downlink());
        assert_eq!(0, interior.n_posting());
        assert_eq!(Some(Datum::Inline(13)), interior.key(&attr).unwrap());
        assert_eq!(NullCategory::NormKey, interior.category().unwrap());
    }
}
