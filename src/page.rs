// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::checksum::Checksum;
use crate::datum::Datum;
use crate::item::{
    BlockNumber, ItemPointer, OffsetNumber, RumItem, ALT_ADD_INFO_NULL_FLAG, INVALID_BLOCK_NUMBER,
};
use byteorder::{ByteOrder, LittleEndian};

/// Fixed page size
pub const BLCKSZ: usize = 8192;

/// Page header: `{lsn: u64, checksum: u32, lower: u16, upper: u16}`
pub const PAGE_HEADER_SIZE: usize = 16;

/// Opaque trailer: `{leftlink, rightlink: u32, maxoff, freespace, flags: u16, pad}`
pub const PAGE_OPAQUE_SIZE: usize = 16;

/// Start of the opaque trailer
pub const SPECIAL_OFFSET: usize = BLCKSZ - PAGE_OPAQUE_SIZE;

/// Line pointer: `{offset: u16, len: u16}`
const ITEM_ID_SIZE: usize = 4;

/// Serialized size of a posting-tree routing key / right bound
pub const PACKED_ITEM_SIZE: usize = 16;

/// Contents offset of a data page's varbyte stream or posting-item array
/// (the right bound comes first)
pub const DATA_CONTENTS_OFFSET: usize = PAGE_HEADER_SIZE + PACKED_ITEM_SIZE;

/// Number of sparse-index anchors on a data leaf page
pub const LEAF_INDEX_COUNT: usize = 32;

/// Serialized anchor: `{blkno u32, posid u16, offset u16, page_offset u16, pad u16, inline i64}`
pub const LEAF_INDEX_ENTRY_SIZE: usize = 20;

/// Start of the sparse-index area on a data leaf page
pub const LEAF_INDEX_OFFSET: usize = SPECIAL_OFFSET - LEAF_INDEX_COUNT * LEAF_INDEX_ENTRY_SIZE;

/// Usable bytes for the varbyte stream on a data leaf page
pub const DATA_PAGE_SIZE: usize = LEAF_INDEX_OFFSET - DATA_CONTENTS_OFFSET;

/// Usable bytes for posting items on an internal data page
pub const DATA_INTERNAL_SIZE: usize = SPECIAL_OFFSET - DATA_CONTENTS_OFFSET;

/// Serialized size of a posting item on internal data pages
pub const POSTING_ITEM_SIZE: usize = 4 + PACKED_ITEM_SIZE;

/// Worst-case alignment padding of a datum
pub const MAX_ALIGN: usize = 8;

/// Page flag bits
pub mod flags {
    pub const DATA: u16 = 1 << 0;
    pub const LEAF: u16 = 1 << 1;
    pub const DELETED: u16 = 1 << 2;
    pub const META: u16 = 1 << 3;
    // Reserved: the pending list is not shipped, these values are never set
    pub const LIST: u16 = 1 << 4;
    pub const LIST_FULLROW: u16 = 1 << 5;
}

/// An 8 KiB index page
///
/// Layout: header, line pointers growing up, item bodies growing down,
/// opaque trailer in the last 16 bytes. Data (posting tree) pages do not use
/// line pointers; their contents start with the right-bound key at a fixed
/// offset.
#[derive(Clone)]
pub struct Page(Box<[u8]>);

impl Default for Page {
    fn default() -> Self {
        Self(vec![0u8; BLCKSZ].into_boxed_slice())
    }
}

impl Page {
    /// Initializes the page as empty with the given flag bits.
    pub fn init(&mut self, flag_bits: u16) {
        self.0.fill(0);
        self.set_lower(PAGE_HEADER_SIZE as u16);
        self.set_upper(SPECIAL_OFFSET as u16);
        self.set_leftlink(INVALID_BLOCK_NUMBER);
        self.set_rightlink(INVALID_BLOCK_NUMBER);
        self.set_maxoff(0);
        self.set_freespace(0);
        self.set_flags(flag_bits);
    }

    #[must_use]
    pub fn new(flag_bits: u16) -> Self {
        let mut page = Self::default();
        page.init(flag_bits);
        page
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }

    /// A page never written since allocation (or zero-initialized)
    #[must_use]
    pub fn is_new(&self) -> bool {
        self.lower() == 0 && self.upper() == 0
    }

    // --- header ------------------------------------------------------------

    #[must_use]
    pub fn lsn(&self) -> u64 {
        LittleEndian::read_u64(&self.0[0..8])
    }

    pub fn set_lsn(&mut self, lsn: u64) {
        LittleEndian::write_u64(&mut self.0[0..8], lsn);
    }

    #[must_use]
    pub fn stored_checksum(&self) -> Checksum {
        Checksum::from_raw(LittleEndian::read_u32(&self.0[8..12]))
    }

    /// Stamps the checksum over the page image (checksum field zeroed).
    pub fn update_checksum(&mut self) {
        LittleEndian::write_u32(&mut self.0[8..12], 0);
        let sum = Checksum::from_bytes(&self.0);
        LittleEndian::write_u32(&mut self.0[8..12], sum.into_u32());
    }

    /// Verifies the stored checksum, if any has ever been stamped.
    pub fn verify_checksum(&self) -> crate::Result<()> {
        let stored = self.stored_checksum();
        if stored.into_u32() == 0 {
            return Ok(());
        }

        let mut copy = self.0.to_vec();
        LittleEndian::write_u32(&mut copy[8..12], 0);

        if Checksum::from_bytes(&copy) == stored {
            Ok(())
        } else {
            Err(crate::Error::StructureCorrupt("page checksum mismatch"))
        }
    }

    #[must_use]
    pub fn lower(&self) -> u16 {
        LittleEndian::read_u16(&self.0[12..14])
    }

    pub fn set_lower(&mut self, v: u16) {
        LittleEndian::write_u16(&mut self.0[12..14], v);
    }

    #[must_use]
    pub fn upper(&self) -> u16 {
        LittleEndian::read_u16(&self.0[14..16])
    }

    pub fn set_upper(&mut self, v: u16) {
        LittleEndian::write_u16(&mut self.0[14..16], v);
    }

    // --- opaque trailer ----------------------------------------------------

    #[must_use]
    pub fn leftlink(&self) -> BlockNumber {
        LittleEndian::read_u32(&self.0[SPECIAL_OFFSET..SPECIAL_OFFSET + 4])
    }

    pub fn set_leftlink(&mut self, v: BlockNumber) {
        LittleEndian::write_u32(&mut self.0[SPECIAL_OFFSET..SPECIAL_OFFSET + 4], v);
    }

    #[must_use]
    pub fn rightlink(&self) -> BlockNumber {
        LittleEndian::read_u32(&self.0[SPECIAL_OFFSET + 4..SPECIAL_OFFSET + 8])
    }

    pub fn set_rightlink(&mut self, v: BlockNumber) {
        LittleEndian::write_u32(&mut self.0[SPECIAL_OFFSET + 4..SPECIAL_OFFSET + 8], v);
    }

    /// On data pages: number of stored occurrences (leaf) or posting items
    /// (internal). Entry pages derive it from the line-pointer array instead.
    #[must_use]
    pub fn maxoff(&self) -> OffsetNumber {
        LittleEndian::read_u16(&self.0[SPECIAL_OFFSET + 8..SPECIAL_OFFSET + 10])
    }

    pub fn set_maxoff(&mut self, v: OffsetNumber) {
        LittleEndian::write_u16(&mut self.0[SPECIAL_OFFSET + 8..SPECIAL_OFFSET + 10], v);
    }

    #[must_use]
    pub fn freespace(&self) -> u16 {
        LittleEndian::read_u16(&self.0[SPECIAL_OFFSET + 10..SPECIAL_OFFSET + 12])
    }

    pub fn set_freespace(&mut self, v: u16) {
        LittleEndian::write_u16(&mut self.0[SPECIAL_OFFSET + 10..SPECIAL_OFFSET + 12], v);
    }

    #[must_use]
    pub fn flags(&self) -> u16 {
        LittleEndian::read_u16(&self.0[SPECIAL_OFFSET + 12..SPECIAL_OFFSET + 14])
    }

    pub fn set_flags(&mut self, v: u16) {
        LittleEndian::write_u16(&mut self.0[SPECIAL_OFFSET + 12..SPECIAL_OFFSET + 14], v);
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.flags() & flags::LEAF != 0
    }

    #[must_use]
    pub fn is_data(&self) -> bool {
        self.flags() & flags::DATA != 0
    }

    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.flags() & flags::DELETED != 0
    }

    #[must_use]
    pub fn is_meta(&self) -> bool {
        self.flags() & flags::META != 0
    }

    pub fn set_non_leaf(&mut self) {
        let f = self.flags() & !flags::LEAF;
        self.set_flags(f);
    }

    pub fn mark_deleted(&mut self) {
        self.set_flags(flags::DELETED);
    }

    #[must_use]
    pub fn is_rightmost(&self) -> bool {
        self.rightlink() == INVALID_BLOCK_NUMBER
    }

    #[must_use]
    pub fn is_leftmost(&self) -> bool {
        self.leftlink() == INVALID_BLOCK_NUMBER
    }

    // --- entry-page line pointer array -------------------------------------

    /// Number of tuples on an entry page
    #[must_use]
    pub fn max_offset_number(&self) -> OffsetNumber {
        debug_assert!(!self.is_data());
        ((self.lower() as usize - PAGE_HEADER_SIZE) / ITEM_ID_SIZE) as OffsetNumber
    }

    /// Raw free space between line pointers and item bodies
    #[must_use]
    pub fn free_space(&self) -> usize {
        (self.upper() as usize).saturating_sub(self.lower() as usize)
    }

    fn item_id(&self, off: OffsetNumber) -> (usize, usize) {
        debug_assert!(off >= 1 && off <= self.max_offset_number());
        let pos = PAGE_HEADER_SIZE + (off as usize - 1) * ITEM_ID_SIZE;
        let body = LittleEndian::read_u16(&self.0[pos..pos + 2]) as usize;
        let len = LittleEndian::read_u16(&self.0[pos + 2..pos + 4]) as usize;
        (body, len)
    }

    fn set_item_id(&mut self, off: OffsetNumber, body: usize, len: usize) {
        let pos = PAGE_HEADER_SIZE + (off as usize - 1) * ITEM_ID_SIZE;
        LittleEndian::write_u16(&mut self.0[pos..pos + 2], body as u16);
        LittleEndian::write_u16(&mut self.0[pos + 2..pos + 4], len as u16);
    }

    /// Returns the bytes of the tuple at 1-based `off`.
    #[must_use]
    pub fn item(&self, off: OffsetNumber) -> &[u8] {
        let (body, len) = self.item_id(off);
        &self.0[body..body + len]
    }

    /// Mutable access to the tuple at 1-based `off` (in-place fixups only).
    #[must_use]
    pub fn item_mut(&mut self, off: OffsetNumber) -> &mut [u8] {
        let (body, len) = self.item_id(off);
        &mut self.0[body..body + len]
    }

    /// Places a tuple at 1-based `off` (0 = append), shifting following line
    /// pointers right. Returns the offset used, or `None` when the page is
    /// out of space.
    pub fn add_item(&mut self, data: &[u8], off: OffsetNumber) -> Option<OffsetNumber> {
        let maxoff = self.max_offset_number();
        let target = if off == 0 { maxoff + 1 } else { off };
        debug_assert!(target >= 1 && target <= maxoff + 1);

        let aligned = (data.len() + MAX_ALIGN - 1) & !(MAX_ALIGN - 1);
        if self.free_space() < aligned + ITEM_ID_SIZE {
            return None;
        }

        let new_upper = self.upper() as usize - aligned;
        self.0[new_upper..new_upper + data.len()].copy_from_slice(data);
        self.0[new_upper + data.len()..new_upper + aligned].fill(0);

        // shift line pointers to make room
        let mut i = maxoff;
        while i >= target {
            let (b, l) = self.item_id(i);
            self.set_item_id(i + 1, b, l);
            i -= 1;
        }
        self.set_item_id(target, new_upper, data.len());

        self.set_upper(new_upper as u16);
        self.set_lower(self.lower() + ITEM_ID_SIZE as u16);
        Some(target)
    }

    /// Deletes the tuple at `off`, compacting the page.
    pub fn delete_item(&mut self, off: OffsetNumber) {
        let maxoff = self.max_offset_number();
        debug_assert!(off >= 1 && off <= maxoff);

        let survivors: Vec<Vec<u8>> = (1..=maxoff)
            .filter(|&i| i != off)
            .map(|i| self.item(i).to_vec())
            .collect();

        let trailer = self.0[SPECIAL_OFFSET..].to_vec();
        let old_flags = self.flags();
        self.init(old_flags);
        self.0[SPECIAL_OFFSET..].copy_from_slice(&trailer);

        for tup in survivors {
            let placed = self.add_item(&tup, 0);
            debug_assert!(placed.is_some());
        }
    }

    /// Replaces the tuple at `off` with `data`, keeping its position.
    /// Returns false when the page cannot hold the new tuple.
    pub fn replace_item(&mut self, data: &[u8], off: OffsetNumber) -> bool {
        self.delete_item(off);
        if self.add_item(data, off).is_none() {
            return false;
        }
        true
    }

    // --- data-page right bound ---------------------------------------------

    /// Writes the page's right-bound key.
    pub fn set_right_bound(&mut self, item: &RumItem) {
        write_packed_item(&mut self.0[PAGE_HEADER_SIZE..DATA_CONTENTS_OFFSET], item);
    }

    /// Reads the page's right-bound key.
    #[must_use]
    pub fn right_bound(&self) -> RumItem {
        read_packed_item(&self.0[PAGE_HEADER_SIZE..DATA_CONTENTS_OFFSET])
    }
}

/// Serializes a [`RumItem`] into the fixed 16-byte routing-key layout.
///
/// Only pass-by-value addInfo survives; that is all the alternative-order
/// comparator may consult (a pass-by-reference attach column is rejected at
/// configuration time).
pub fn write_packed_item(buf: &mut [u8], item: &RumItem) {
    debug_assert!(buf.len() >= PACKED_ITEM_SIZE);
    LittleEndian::write_u32(&mut buf[0..4], item.iptr.blkno);

    let (posid, inline) = match &item.add_info {
        Some(Datum::Inline(v)) => (item.iptr.offset, *v),
        Some(Datum::Bytes(_)) | None => (item.iptr.offset | ALT_ADD_INFO_NULL_FLAG, 0),
    };
    LittleEndian::write_u16(&mut buf[4..6], posid);
    LittleEndian::write_u16(&mut buf[6..8], 0);
    LittleEndian::write_i64(&mut buf[8..16], inline);
}

/// Deserializes the fixed 16-byte routing-key layout.
#[must_use]
pub fn read_packed_item(buf: &[u8]) -> RumItem {
    debug_assert!(buf.len() >= PACKED_ITEM_SIZE);
    let blkno = LittleEndian::read_u32(&buf[0..4]);
    let raw_posid = LittleEndian::read_u16(&buf[4..6]);
    let inline = LittleEndian::read_i64(&buf[8..16]);

    let add_info = if raw_posid & ALT_ADD_INFO_NULL_FLAG != 0 {
        None
    } else {
        Some(Datum::Inline(inline))
    };

    RumItem {
        iptr: ItemPointer::new(blkno, raw_posid & !ALT_ADD_INFO_NULL_FLAG),
        add_info,
    }
}

/// Reads a posting item `{child_blkno, key}` from an internal data page.
#[must_use]
pub fn read_posting_item(buf: &[u8]) -> (BlockNumber, RumItem) {
    let child = LittleEndian::read_u32(&buf[0..4]);
    let key = read_packed_item(&buf[4..4 + PACKED_ITEM_SIZE]);
    (child, key)
}

/// Writes a posting item `{child_blkno, key}`.
pub fn write_posting_item(buf: &mut [u8], child: BlockNumber, key: &RumItem) {
    LittleEndian::write_u32(&mut buf[0..4], child);
    write_packed_item(&mut buf[4..4 + PACKED_ITEM_SIZE], key);
}

/// Byte offset of posting item `off` (1-based) on an internal data page.
#[must_use]
pub fn posting_item_offset(off: OffsetNumber) -> usize {
    DATA_CONTENTS_OFFSET + (off as usize - 1) * POSTING_ITEM_SIZE
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Page(flags={:#x}, maxoff={}, lower={}, upper={}, left={}, right={})",
            self.flags(),
            self.maxoff(),
            self.lower(),
            self.upper(),
            self.leftlink(),
            self.rightlink(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn page_init_state() {
        let page = Page::new(flags::LEAF);
        assert!(page.is_leaf());
        assert!(!page.is_data());
        assert!(page.is_rightmost());
        assert!(page.is_leftmost());
        assert_eq!(0, page.max_offset_number());
        assert_eq!(SPECIAL_OFFSET - PAGE_HEADER_SIZE, page.free_space());
    }

    #[test]
    fn page_add_and_get_items() {
        let mut page = Page::new(flags::LEAF);

        assert_eq!(Some(1), page.add_item(b"hello", 0));
        assert_eq!(Some(2), page.add_item(b"world", 0));
        assert_eq!(Some(1), page.add_item(b"first", 1));

        assert_eq!(3, page.max_offset_number());
        assert_eq!(b"first", page.item(1));
        assert_eq!(b"hello", page.item(2));
        assert_eq!(b"world", page.item(3));
    }

    #[test]
    fn page_delete_item_compacts() {
        let mut page = Page::new(flags::LEAF);
        page.add_item(b"aaaa", 0);
        page.add_item(b"bbbb", 0);
        page.add_item(b"cccc", 0);

        let free_before = page.free_space();
        page.delete_item(2);

        assert_eq!(2, page.max_offset_number());
        assert_eq!(b"aaaa", page.item(1));
        assert_eq!(b"cccc", page.item(2));
        assert!(page.free_space() > free_before);
    }

    #[test]
    fn packed_item_roundtrip() {
        let mut buf = [0u8; PACKED_ITEM_SIZE];

        let item = RumItem::new(ItemPointer::new(42, 7), Some(Datum::Inline(-1000)));
        write_packed_item(&mut buf, &item);
        assert_eq!(item, read_packed_item(&buf));

        let null_item = RumItem::new(ItemPointer::new(1, 2), None);
        write_packed_item(&mut buf, &null_item);
        assert_eq!(null_item, read_packed_item(&buf));
    }

    #[test]
    fn page_checksum_roundtrip() {
        let mut page = Page::new(flags::LEAF);
        page.add_item(b"xyz", 0);
        page.update_checksum();
        page.verify_checksum().unwrap();

        page.bytes_mut()[100] ^= 0xFF;
        assert!(page.verify_checksum().is_err());
    }
}
