// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::buffer::{Buffer, BufferManager};
use crate::page::Page;

/// Handle to one registered page inside a [`GenericXlog`] batch
#[derive(Copy, Clone, Debug)]
pub struct RegisteredPage(usize);

/// A page-group commit
///
/// Mirrors the generic-xlog contract: mutations happen on working copies of
/// the registered pages and are published on [`finish`], which also stamps a
/// fresh LSN on every touched page. Dropping the batch without finishing
/// aborts it, leaving the pages untouched.
///
/// Pages are published in registration order; callers register them so that
/// a reader observing a prefix of the group still sees a navigable tree
/// (right page before left page before parent on splits). Writer-writer
/// exclusion comes from [`BufferManager::begin_write`], held by the calling
/// operation.
///
/// [`finish`]: GenericXlog::finish
pub struct GenericXlog<'a> {
    bufmgr: &'a BufferManager,
    pages: Vec<(Buffer, Page)>,
}

impl<'a> GenericXlog<'a> {
    /// Starts a new batch.
    pub fn start(bufmgr: &'a BufferManager) -> Self {
        Self {
            bufmgr,
            pages: Vec::new(),
        }
    }

    /// Registers a page; further changes go to the working copy retrieved
    /// through [`GenericXlog::page_mut`].
    pub fn register(&mut self, buffer: &Buffer) -> RegisteredPage {
        let copy = buffer.read().clone();
        self.pages.push((buffer.clone(), copy));
        RegisteredPage(self.pages.len() - 1)
    }

    /// The working copy of a registered page.
    pub fn page_mut(&mut self, handle: RegisteredPage) -> &mut Page {
        &mut self
            .pages
            .get_mut(handle.0)
            .expect("registered page out of range")
            .1
    }

    /// Read access to the working copy.
    #[must_use]
    pub fn page(&self, handle: RegisteredPage) -> &Page {
        &self
            .pages
            .get(handle.0)
            .expect("registered page out of range")
            .1
    }

    /// Atomically publishes all registered copies.
    pub fn finish(self) {
        let lsn = self.bufmgr.next_lsn();

        for (buffer, mut copy) in self.pages {
            copy.set_lsn(lsn);
            *buffer.write() = copy;
        }
    }

    /// Discards the batch.
    pub fn abort(self) {
        drop(self);
    }
}
