// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{DecodeError, EncodeError};

/// Represents errors that can occur in the RUM index
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// Serialization failed
    Encode(EncodeError),

    /// Deserialization failed
    Decode(DecodeError),

    /// On-disk structure is inconsistent (broken sibling chain, bad varbyte
    /// stream, out-of-range anchor, version mismatch, ...)
    StructureCorrupt(&'static str),

    /// A new entry tuple exceeds the maximum item size and cannot be
    /// converted to a posting tree (got, max)
    ItemTooLarge(usize, usize),

    /// An entry tuple's null category disagrees with its declared null-ness
    CategoryMismatch,

    /// Opclass `config` output conflicts with the index options
    ConfigConflict(&'static str),

    /// Requested operation is not supported by this access method
    Unsupported(&'static str),

    /// Cooperative cancellation was requested
    Interrupted,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RumTreeError: {self:?}")
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<EncodeError> for Error {
    fn from(value: EncodeError) -> Self {
        Self::Encode(value)
    }
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        Self::Decode(value)
    }
}

/// Index result
pub type Result<T> = std::result::Result<T, Error>;
