// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A K.I.S.S. implementation of RUM: an inverted index that stores
//! *additional information* next to every indexed occurrence.
//!
//! ##### About
//!
//! Classic inverted indexes map each key to a posting list of heap item
//! pointers. RUM extends every posting with an opclass-typed payload
//! (addInfo) — token positions, an attached timestamp, anything the opclass
//! extracts — so ranking, distance ordering and ORDER BY run entirely inside
//! the index, without touching the heap.
//!
//! The structure is a two-level B-link tree: an *entry tree* keyed by
//! `(column, key)` whose leaf tuples hold either an inline varbyte posting
//! list or the root of a *posting tree* holding all occurrences of one key.
//! Posting-tree leaves store delta-encoded `{item pointer, addInfo}` triples
//! with a 32-anchor sparse index per page. With `order_by_attach`, the
//! posting trees of one column sort by the attached column's value first,
//! letting `ORDER BY` stream straight off the index.
//!
//! # Example usage
//!
//! ```
//! use rum_tree::{ColumnDef, Config, Datum, ItemPointer, RumIndex, ScanQual};
//! use rum_tree::opclasses::{text_strategy, Int64Ops, TextTermsOps};
//! use std::sync::Arc;
//!
//! // An index over (text terms, timestamp), the timestamp attached as
//! // addInfo to every term occurrence and driving the posting order
//! let index = RumIndex::create(
//!     vec![
//!         ColumnDef::new("body", Arc::new(TextTermsOps)),
//!         ColumnDef::new("ts", Arc::new(Int64Ops)),
//!     ],
//!     Config::new().attach("ts", "body").order_by_attach(true),
//! )?;
//!
//! index.build(vec![
//!     (
//!         ItemPointer::new(0, 1),
//!         vec![Some(Datum::from("hello world")), Some(Datum::Inline(1000))],
//!     ),
//!     (
//!         ItemPointer::new(0, 2),
//!         vec![Some(Datum::from("hello rum")), Some(Datum::Inline(2000))],
//!     ),
//! ])?;
//!
//! // WHERE body @@ 'hello'
//! let tbm = index.scan_bitmap(vec![ScanQual::new(
//!     1,
//!     text_strategy::MATCH,
//!     Datum::from("hello"),
//! )])?;
//! assert_eq!(2, tbm.len());
//! #
//! # Ok::<(), rum_tree::Error>(())
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all, clippy::cargo)]
#![warn(missing_docs)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::multiple_crate_versions)]
#![allow(clippy::option_if_let_else)]

mod buffer;
mod bulk;

#[doc(hidden)]
pub mod btree;

mod checksum;
mod coding;
mod config;
mod datum;
mod error;
mod index;

#[doc(hidden)]
pub mod insert;

mod item;

#[doc(hidden)]
pub mod meta;

pub mod opclass;
pub mod opclasses;

#[doc(hidden)]
pub mod page;

#[doc(hidden)]
pub mod postinglist;

#[doc(hidden)]
pub mod scan;

mod slice;

#[doc(hidden)]
pub mod sort;

mod state;
mod tidbitmap;

#[doc(hidden)]
pub mod tuple;

#[doc(hidden)]
pub mod vacuum;

mod wal;

#[doc(hidden)]
pub use {
    buffer::{Buffer, BufferManager},
    checksum::Checksum,
    wal::GenericXlog,
};

pub use {
    coding::{DecodeError, EncodeError},
    config::{Config, IndexOptions},
    datum::{AttrInfo, Datum, TypeAlign},
    error::{Error, Result},
    index::RumIndex,
    item::{BlockNumber, ItemPointer, OffsetNumber, RumItem},
    meta::IndexStats,
    opclass::{
        NullCategory, Opclass, RumConfig, ScanDirection, SearchMode, StrategyNumber,
    },
    scan::{ScanQual, ScanState},
    slice::Slice,
    state::ColumnDef,
    tidbitmap::TidBitmap,
    vacuum::VacuumStats,
};
