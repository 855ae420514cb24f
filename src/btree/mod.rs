// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Generic B-link tree machinery, parameterized over the entry tree and the
//! posting (data) tree
//!
//! A descent keeps a stack of `{blkno, buffer, off, predict_number}` frames.
//! Searches tolerate concurrent splits by chasing right links whenever the
//! target key lies beyond a page's right bound; inserts split bottom-up and
//! may grow the tree by one level, keeping the root at its original block.

pub mod data;
pub mod entry;

use crate::buffer::{Buffer, BufferManager};
use crate::item::{BlockNumber, OffsetNumber, INVALID_BLOCK_NUMBER, INVALID_OFFSET_NUMBER};
use crate::meta::IndexStats;
use crate::opclass::ScanDirection;
use crate::page::Page;
use crate::wal::GenericXlog;
use log::trace;

/// One frame of a descent
pub struct BtreeStack {
    pub blkno: BlockNumber,
    pub buffer: Buffer,
    pub off: OffsetNumber,
    /// Upper bound on the number of leaves beneath this frame
    pub predict_number: u32,
    pub parent: Option<Box<BtreeStack>>,
}

impl BtreeStack {
    fn root(bufmgr: &BufferManager, blkno: BlockNumber) -> crate::Result<Self> {
        Ok(Self {
            blkno,
            buffer: bufmgr.pin(blkno)?,
            off: INVALID_OFFSET_NUMBER,
            predict_number: 1,
            parent: None,
        })
    }
}

/// Virtual methods distinguishing the entry tree from the posting tree
///
/// Implementations carry their own search key and pending insert payload,
/// the engine below only drives the descent and the split cascade.
pub trait BtreeOps {
    fn is_data(&self) -> bool;

    /// True when descending in search mode (no insert payload).
    fn search_mode(&self) -> bool;

    /// True when the search key lies beyond the page's right bound.
    fn is_move_right(&self, page: &Page) -> crate::Result<bool>;

    /// Locates the child to descend into on an internal page; updates the
    /// leaf-count prediction. The returned offset is the position of the
    /// chosen downlink.
    fn find_child_page(
        &mut self,
        page: &Page,
        predict_number: &mut u32,
    ) -> crate::Result<(BlockNumber, OffsetNumber)>;

    /// Locates the insertion (or scan start) position on a leaf page.
    /// Returns true when the search key itself was found.
    fn find_item(&mut self, page: &Page) -> crate::Result<(bool, OffsetNumber)>;

    /// Finds the downlink to `child` on an internal page, starting the scan
    /// at `stored_off` (where the descent last saw it).
    fn find_child_ptr(
        &self,
        page: &Page,
        child: BlockNumber,
        stored_off: OffsetNumber,
    ) -> crate::Result<OffsetNumber>;

    /// Whether the pending payload fits on the page at `off`.
    fn is_enough_space(&self, page: &Page, off: OffsetNumber) -> crate::Result<bool>;

    /// Places the pending payload on the page at `off`.
    fn place_to_page(&mut self, page: &mut Page, off: OffsetNumber) -> crate::Result<()>;

    /// Splits `old_page` around an insertion at `off`, consuming (part of)
    /// the pending payload. Returns the new left and right page images and
    /// records the parent downlink internally.
    fn split_page(
        &mut self,
        left_blkno: BlockNumber,
        right_blkno: BlockNumber,
        old_page: &Page,
        off: OffsetNumber,
    ) -> crate::Result<(Page, Page)>;

    /// Rebuilds a split root as an internal page over `left` and `right`.
    fn fill_root(
        &mut self,
        root: &mut Page,
        left_blkno: BlockNumber,
        left: &Page,
        right_blkno: BlockNumber,
        right: &Page,
    ) -> crate::Result<()>;
}

/// Pins the sibling of `buffer` in the given direction, or `None` at the end
/// of the chain.
pub fn step(
    bufmgr: &BufferManager,
    buffer: &Buffer,
    direction: ScanDirection,
) -> crate::Result<Option<Buffer>> {
    let sibling = {
        let page = buffer.read();
        if direction.is_forward() {
            page.rightlink()
        } else {
            page.leftlink()
        }
    };

    if sibling == INVALID_BLOCK_NUMBER {
        return Ok(None);
    }
    Ok(Some(bufmgr.pin(sibling)?))
}

/// Descends from `root_blkno` (or continues a prepared stack) to the leaf
/// the ops' search key belongs to.
pub fn find_leaf_page(
    ops: &mut dyn BtreeOps,
    bufmgr: &BufferManager,
    root_blkno: BlockNumber,
    start: Option<BtreeStack>,
) -> crate::Result<BtreeStack> {
    let mut stack = match start {
        Some(s) => s,
        None => BtreeStack::root(bufmgr, root_blkno)?,
    };

    loop {
        stack.off = INVALID_OFFSET_NUMBER;

        // B-link: follow right links while the key is beyond this page
        loop {
            let page = stack.buffer.read();

            if !ops.is_move_right(&page)? {
                break;
            }
            let rightlink = page.rightlink();
            if rightlink == INVALID_BLOCK_NUMBER {
                break;
            }
            drop(page);

            trace!("findLeaf: moving right to {rightlink}");
            stack.buffer = bufmgr.pin(rightlink)?;
            stack.blkno = rightlink;
        }

        let (is_leaf, child, off) = {
            let page = stack.buffer.read();
            if page.is_leaf() {
                (true, INVALID_BLOCK_NUMBER, INVALID_OFFSET_NUMBER)
            } else {
                let (child, off) = ops.find_child_page(&page, &mut stack.predict_number)?;
                (false, child, off)
            }
        };

        if is_leaf {
            return Ok(stack);
        }

        stack.off = off;
        if child == INVALID_BLOCK_NUMBER || child == stack.blkno {
            return Err(crate::Error::StructureCorrupt("bad downlink"));
        }

        if ops.search_mode() {
            // a search may forget the path to the leaf
            stack.blkno = child;
            stack.buffer = bufmgr.pin(child)?;
        } else {
            let frame = BtreeStack {
                blkno: child,
                buffer: bufmgr.pin(child)?,
                off: INVALID_OFFSET_NUMBER,
                predict_number: 1,
                parent: None,
            };
            let parent = std::mem::replace(&mut stack, frame);
            stack.parent = Some(Box::new(parent));
        }
    }
}

/// Re-descends starting from the stack's last known leaf, tolerating
/// concurrent splits: chase right links first, restart from the root when
/// the page vanished from under us.
pub fn re_find_leaf_page(
    ops: &mut dyn BtreeOps,
    bufmgr: &BufferManager,
    root_blkno: BlockNumber,
    mut stack: BtreeStack,
) -> crate::Result<BtreeStack> {
    let restart = {
        let page = stack.buffer.read();
        page.is_deleted() || !page.is_leaf()
    };

    if restart {
        return find_leaf_page(ops, bufmgr, root_blkno, None);
    }

    loop {
        let page = stack.buffer.read();
        if !ops.is_move_right(&page)? {
            break;
        }
        let rightlink = page.rightlink();
        if rightlink == INVALID_BLOCK_NUMBER {
            break;
        }
        drop(page);

        stack.buffer = bufmgr.pin(rightlink)?;
        stack.blkno = rightlink;
    }

    Ok(stack)
}

fn locate_parent_offset(
    ops: &dyn BtreeOps,
    bufmgr: &BufferManager,
    stack: &mut BtreeStack,
    child: BlockNumber,
) -> crate::Result<OffsetNumber> {
    loop {
        let (off, rightlink) = {
            let page = stack.buffer.read();
            (
                ops.find_child_ptr(&page, child, stack.off)?,
                page.rightlink(),
            )
        };

        if off != INVALID_OFFSET_NUMBER {
            return Ok(off);
        }

        // the downlink moved right with a concurrent parent split
        if rightlink == INVALID_BLOCK_NUMBER {
            return Err(crate::Error::StructureCorrupt("lost downlink to child"));
        }
        stack.buffer = bufmgr.pin(rightlink)?;
        stack.blkno = rightlink;
        stack.off = INVALID_OFFSET_NUMBER;
    }
}

/// Inserts the ops' pending payload at the position the stack points to,
/// splitting bottom-up as needed.
pub fn insert_value(
    ops: &mut dyn BtreeOps,
    bufmgr: &BufferManager,
    mut stack: BtreeStack,
    mut stats: Option<&mut IndexStats>,
) -> crate::Result<()> {
    loop {
        let off = stack.off;

        let fits = {
            let page = stack.buffer.read();
            ops.is_enough_space(&page, off)?
        };

        if fits {
            let mut xlog = GenericXlog::start(bufmgr);
            let h = xlog.register(&stack.buffer);
            ops.place_to_page(xlog.page_mut(h), off)?;
            xlog.finish();
            return Ok(());
        }

        // Split. The right page is published before the left page so a
        // reader seeing a torn group can still reach everything.
        let rbuffer = bufmgr.new_buffer()?;
        let is_root = stack.parent.is_none();

        let old_page = stack.buffer.read().clone();

        if let Some(stats) = stats.as_deref_mut() {
            let new_pages = if is_root { 2 } else { 1 };
            if ops.is_data() {
                stats.n_data_pages += new_pages;
            } else {
                stats.n_entry_pages += new_pages;
            }
        }

        if is_root {
            // grow the tree: both halves move to fresh pages, the root stays
            // at its block and becomes internal
            let lbuffer = bufmgr.new_buffer()?;
            trace!(
                "splitting root {} into {} / {}",
                stack.blkno,
                lbuffer.blkno(),
                rbuffer.blkno()
            );

            let (mut newl, mut newr) =
                ops.split_page(lbuffer.blkno(), rbuffer.blkno(), &old_page, off)?;

            newl.set_leftlink(INVALID_BLOCK_NUMBER);
            newl.set_rightlink(rbuffer.blkno());
            newr.set_leftlink(lbuffer.blkno());
            newr.set_rightlink(INVALID_BLOCK_NUMBER);

            let mut xlog = GenericXlog::start(bufmgr);
            let rh = xlog.register(&rbuffer);
            let lh = xlog.register(&lbuffer);
            let rooth = xlog.register(&stack.buffer);

            ops.fill_root(
                xlog.page_mut(rooth),
                lbuffer.blkno(),
                &newl,
                rbuffer.blkno(),
                &newr,
            )?;
            *xlog.page_mut(lh) = newl;
            *xlog.page_mut(rh) = newr;
            xlog.finish();

            return Ok(());
        }

        trace!("splitting page {} into itself / {}", stack.blkno, rbuffer.blkno());

        let (mut newl, mut newr) = ops.split_page(stack.blkno, rbuffer.blkno(), &old_page, off)?;

        newl.set_leftlink(old_page.leftlink());
        newl.set_rightlink(rbuffer.blkno());
        newr.set_leftlink(stack.blkno);
        newr.set_rightlink(old_page.rightlink());

        let mut xlog = GenericXlog::start(bufmgr);
        let rh = xlog.register(&rbuffer);
        let lh = xlog.register(&stack.buffer);
        *xlog.page_mut(rh) = newr;
        *xlog.page_mut(lh) = newl;

        if old_page.rightlink() != INVALID_BLOCK_NUMBER {
            let sibling = bufmgr.pin(old_page.rightlink())?;
            let sh = xlog.register(&sibling);
            xlog.page_mut(sh).set_leftlink(rbuffer.blkno());
            xlog.finish();
        } else {
            xlog.finish();
        }

        // continue the cascade one level up with the pending downlink
        let child = stack.blkno;
        let parent = *stack.parent.take().expect("non-root split has a parent");
        stack = parent;
        stack.off = locate_parent_offset(ops, bufmgr, &mut stack, child)?;
    }
}
