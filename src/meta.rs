// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::item::{BlockNumber, INVALID_BLOCK_NUMBER};
use crate::page::{flags, Page, PAGE_HEADER_SIZE};
use byteorder::{ByteOrder, LittleEndian};

/// Block number of the metapage
pub const META_BLKNO: BlockNumber = 0;

/// Block number of the entry-tree root
pub const ROOT_BLKNO: BlockNumber = 1;

/// On-disk format version
pub const RUM_VERSION: u32 = 0xC0DE_0002;

const META_OFFSET: usize = PAGE_HEADER_SIZE;

// Layout within the metapage contents:
//   version u32, head u32, tail u32, tail_free_size u32, n_pending_pages u32,
//   n_pending_heap_tuples i64, n_total_pages u32, n_entry_pages u32,
//   n_data_pages u32, n_entries i64
//
// head/tail/tail_free_size/n_pending_* belong to the removed pending list and
// stay at their init values forever.
const O_VERSION: usize = META_OFFSET;
const O_HEAD: usize = META_OFFSET + 4;
const O_TAIL: usize = META_OFFSET + 8;
const O_TAIL_FREE: usize = META_OFFSET + 12;
const O_N_PENDING_PAGES: usize = META_OFFSET + 16;
const O_N_PENDING_TUPLES: usize = META_OFFSET + 20;
const O_N_TOTAL_PAGES: usize = META_OFFSET + 28;
const O_N_ENTRY_PAGES: usize = META_OFFSET + 32;
const O_N_DATA_PAGES: usize = META_OFFSET + 36;
const O_N_ENTRIES: usize = META_OFFSET + 40;

/// Statistics stored in the metapage, accurate as of the last build or
/// vacuum cleanup; consumed by cost estimation.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct IndexStats {
    pub n_total_pages: u32,
    pub n_entry_pages: u32,
    pub n_data_pages: u32,
    pub n_entries: i64,
}

/// Initializes a fresh metapage.
pub fn init_meta_page(page: &mut Page) {
    page.init(flags::META);

    let buf = page.bytes_mut();
    LittleEndian::write_u32(&mut buf[O_VERSION..O_VERSION + 4], RUM_VERSION);
    LittleEndian::write_u32(&mut buf[O_HEAD..O_HEAD + 4], INVALID_BLOCK_NUMBER);
    LittleEndian::write_u32(&mut buf[O_TAIL..O_TAIL + 4], INVALID_BLOCK_NUMBER);
    LittleEndian::write_u32(&mut buf[O_TAIL_FREE..O_TAIL_FREE + 4], 0);
    LittleEndian::write_u32(&mut buf[O_N_PENDING_PAGES..O_N_PENDING_PAGES + 4], 0);
    LittleEndian::write_i64(&mut buf[O_N_PENDING_TUPLES..O_N_PENDING_TUPLES + 8], 0);
}

/// Reads the statistics block, verifying the format version.
pub fn read_stats(page: &Page) -> crate::Result<IndexStats> {
    let buf = page.bytes();

    let version = LittleEndian::read_u32(&buf[O_VERSION..O_VERSION + 4]);
    if version != RUM_VERSION {
        return Err(crate::Error::StructureCorrupt("unexpected index version"));
    }

    Ok(IndexStats {
        n_total_pages: LittleEndian::read_u32(&buf[O_N_TOTAL_PAGES..O_N_TOTAL_PAGES + 4]),
        n_entry_pages: LittleEndian::read_u32(&buf[O_N_ENTRY_PAGES..O_N_ENTRY_PAGES + 4]),
        n_data_pages: LittleEndian::read_u32(&buf[O_N_DATA_PAGES..O_N_DATA_PAGES + 4]),
        n_entries: LittleEndian::read_i64(&buf[O_N_ENTRIES..O_N_ENTRIES + 8]),
    })
}

/// Writes the statistics block. Version and pending fields are untouched.
pub fn write_stats(page: &mut Page, stats: &IndexStats) {
    let buf = page.bytes_mut();
    LittleEndian::write_u32(
        &mut buf[O_N_TOTAL_PAGES..O_N_TOTAL_PAGES + 4],
        stats.n_total_pages,
    );
    LittleEndian::write_u32(
        &mut buf[O_N_ENTRY_PAGES..O_N_ENTRY_PAGES + 4],
        stats.n_entry_pages,
    );
    LittleEndian::write_u32(
        &mut buf[O_N_DATA_PAGES..O_N_DATA_PAGES + 4],
        stats.n_data_pages,
    );
    LittleEndian::write_i64(&mut buf[O_N_ENTRIES..O_N_ENTRIES + 8], stats.n_entries);
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn meta_roundtrip() {
        let mut page = Page::default();
        init_meta_page(&mut page);
        assert!(page.is_meta());

        assert_eq!(IndexStats::default(), read_stats(&page).unwrap());

        let stats = IndexStats {
            n_total_pages: 10,
            n_entry_pages: 4,
            n_data_pages: 5,
            n_entries: 1234,
        };
        write_stats(&mut page, &stats);
        assert_eq!(stats, read_stats(&page).unwrap());
    }

    #[test]
    fn meta_version_check() {
        let mut page = Page::default();
        init_meta_page(&mut page);
        // clobber the version word
        page.bytes_mut()[PAGE_HEADER_SIZE] ^= 0xFF;
        assert!(read_stats(&page).is_err());
    }
}
