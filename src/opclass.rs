// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::datum::{AttrInfo, Datum};
use std::any::Any;
use std::cmp::Ordering;
use std::sync::Arc;

/// Operator strategy number, opclass-defined (0 is invalid)
pub type StrategyNumber = u16;

pub const INVALID_STRATEGY: StrategyNumber = 0;

/// Category codes to distinguish placeholder nulls from ordinary NULL keys
///
/// `EmptyQuery` is never stored in the index; it sorts before regular key
/// values and seeds full-index walks.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum NullCategory {
    EmptyQuery,
    NormKey,
    NullKey,
    EmptyItem,
    NullItem,
}

impl NullCategory {
    #[must_use]
    pub fn as_i8(self) -> i8 {
        match self {
            Self::EmptyQuery => -1,
            Self::NormKey => 0,
            Self::NullKey => 1,
            Self::EmptyItem => 2,
            Self::NullItem => 3,
        }
    }

    pub fn from_i8(v: i8) -> crate::Result<Self> {
        Ok(match v {
            -1 => Self::EmptyQuery,
            0 => Self::NormKey,
            1 => Self::NullKey,
            2 => Self::EmptyItem,
            3 => Self::NullItem,
            _ => return Err(crate::Error::CategoryMismatch),
        })
    }

    #[must_use]
    pub fn is_norm(self) -> bool {
        matches!(self, Self::NormKey)
    }
}

impl PartialOrd for NullCategory {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NullCategory {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_i8().cmp(&other.as_i8())
    }
}

/// Search modes an `extract_query` implementation may request
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SearchMode {
    /// Only items matching at least one extracted entry
    Default,
    /// Also include items containing no keys at all
    IncludeEmpty,
    /// Every non-null item, entries become optional filters
    All,
    /// Every item; reserved for the driver's keyless scans
    Everything,
}

/// Direction of an index scan
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ScanDirection {
    Backward,
    NoMovement,
    Forward,
}

impl ScanDirection {
    #[must_use]
    pub fn is_forward(self) -> bool {
        matches!(self, Self::Forward)
    }

    #[must_use]
    pub fn is_backward(self) -> bool {
        matches!(self, Self::Backward)
    }

    #[must_use]
    pub fn reverse(self) -> Self {
        match self {
            Self::Backward => Self::Forward,
            Self::NoMovement => Self::NoMovement,
            Self::Forward => Self::Backward,
        }
    }

    /// Cursor increment: -1, 0 or 1
    #[must_use]
    pub fn step(self) -> i32 {
        match self {
            Self::Backward => -1,
            Self::NoMovement => 0,
            Self::Forward => 1,
        }
    }
}

/// Opclass-private query data, threaded from `extract_query` into
/// `compare_partial`. Entries carrying extra data are never deduplicated.
pub type ExtraData = Arc<dyn Any + Send + Sync>;

/// One key produced by `extract_value`
#[derive(Clone, Debug)]
pub struct ValueEntry {
    pub key: Datum,
    pub is_null: bool,
    pub add_info: Option<Datum>,
}

impl ValueEntry {
    #[must_use]
    pub fn new(key: Datum) -> Self {
        Self {
            key,
            is_null: false,
            add_info: None,
        }
    }

    #[must_use]
    pub fn with_add_info(key: Datum, add_info: Datum) -> Self {
        Self {
            key,
            is_null: false,
            add_info: Some(add_info),
        }
    }
}

/// One search condition produced by `extract_query`
#[derive(Clone)]
pub struct QueryEntry {
    pub key: Datum,
    pub is_null: bool,
    pub partial_match: bool,
    pub extra: Option<ExtraData>,
}

impl QueryEntry {
    #[must_use]
    pub fn new(key: Datum) -> Self {
        Self {
            key,
            is_null: false,
            partial_match: false,
            extra: None,
        }
    }
}

/// Output of `extract_query`
pub struct ExtractedQuery {
    pub entries: Vec<QueryEntry>,
    pub search_mode: SearchMode,
}

/// Per-entry match state handed to `consistent`/`ordering`
pub struct KeyCheck<'a> {
    /// Whether the i-th entry has the current item
    pub matches: &'a [bool],
    /// The i-th entry's addInfo at the current item
    pub add_info: &'a [Option<Datum>],
    /// The extracted query keys (user entries only)
    pub query_keys: &'a [Datum],
    pub query_categories: &'a [NullCategory],
}

/// Per-strategy configuration reported by an opclass
#[derive(Clone, Debug, Default)]
pub struct RumConfig {
    /// Storage type of the addInfo attached to each occurrence, if any
    pub add_info_type: Option<AttrInfo>,
    /// Order-by strategies and the natural scan direction each one implies
    pub strategy_info: Vec<(StrategyNumber, ScanDirection)>,
}

/// The opclass vtable
///
/// Required methods mirror the mandatory support procs; the optional ones are
/// paired with `supports_*` capability probes, which the planner consults
/// instead of probing for a proc oid.
pub trait Opclass: Send + Sync {
    /// Storage description of the key type.
    fn key_attr(&self) -> AttrInfo;

    /// Total order on two non-null keys.
    fn compare(&self, a: &Datum, b: &Datum) -> Ordering;

    /// Extracts indexable keys (with optional addInfo) from a column value.
    fn extract_value(&self, value: &Datum) -> Vec<ValueEntry>;

    /// Whether the opclass recognizes `strategy`. The scan planner rejects
    /// qualifiers with an unrecognized strategy before `extract_query` ever
    /// sees them, so strategy dispatch inside the other methods never has
    /// to fail.
    fn supports_strategy(&self, _strategy: StrategyNumber) -> bool {
        true
    }

    /// Extracts search conditions from a query value. Only called with a
    /// strategy that passed [`Opclass::supports_strategy`].
    fn extract_query(&self, query: &Datum, strategy: StrategyNumber) -> ExtractedQuery;

    /// Decides whether an item matches given the per-entry match vector.
    /// `recheck` starts true; an exact opclass clears it.
    fn consistent(
        &self,
        check: &KeyCheck<'_>,
        strategy: StrategyNumber,
        query: &Datum,
        n_user_entries: usize,
        recheck: &mut bool,
    ) -> bool;

    /// Per-strategy configuration. The default has no addInfo and no
    /// order-by strategies.
    fn config(&self) -> RumConfig {
        RumConfig::default()
    }

    fn supports_partial_match(&self) -> bool {
        false
    }

    /// Compares a partial-match range bound against an indexed key.
    /// Returns 0 on match, < 0 to continue the scan, > 0 to stop it.
    fn compare_partial(
        &self,
        _query_key: &Datum,
        _index_key: &Datum,
        _strategy: StrategyNumber,
        _extra: Option<&ExtraData>,
    ) -> i32 {
        unimplemented!("opclass does not support partial match")
    }

    fn supports_pre_consistent(&self) -> bool {
        false
    }

    /// Monotone overapproximation of `consistent`: called with "might match"
    /// flags, must return true whenever `consistent` could.
    fn pre_consistent(
        &self,
        _check: &[bool],
        _strategy: StrategyNumber,
        _query: &Datum,
        _n_user_entries: usize,
    ) -> bool {
        unimplemented!("opclass does not support preConsistent")
    }

    fn supports_ordering(&self) -> bool {
        false
    }

    /// Distance of the current item for an ORDER BY key.
    fn ordering(
        &self,
        _check: &KeyCheck<'_>,
        _strategy: StrategyNumber,
        _query: &Datum,
        _n_user_entries: usize,
    ) -> f64 {
        unimplemented!("opclass does not support ordering")
    }

    fn supports_key_ordering(&self) -> bool {
        false
    }

    /// Distance between a discovered index key and the query value; used by
    /// full-index ORDER BY scans that rank by the key itself.
    fn key_ordering(&self, _key: &Datum, _query: &Datum, _strategy: StrategyNumber) -> f64 {
        unimplemented!("opclass does not support key ordering")
    }

    fn supports_outer_ordering(&self) -> bool {
        false
    }

    /// Distance between an attached-column value and a query value.
    fn outer_ordering(&self, _add_info: &Datum, _query: &Datum, _strategy: StrategyNumber) -> f64 {
        unimplemented!("opclass does not support outer ordering")
    }

    fn supports_join_add_info(&self) -> bool {
        false
    }

    /// Joins the addInfo of two occurrences with equal item pointers
    /// (partial-match streams).
    fn join_add_info(&self, _a: &Datum, _b: &Datum) -> Datum {
        unimplemented!("opclass does not support addInfo join")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn category_order() {
        assert!(NullCategory::EmptyQuery < NullCategory::NormKey);
        assert!(NullCategory::NormKey < NullCategory::NullKey);
        assert!(NullCategory::NullKey < NullCategory::EmptyItem);
        assert!(NullCategory::EmptyItem < NullCategory::NullItem);
    }

    #[test]
    fn category_codes_roundtrip() {
        for cat in [
            NullCategory::EmptyQuery,
            NullCategory::NormKey,
            NullCategory::NullKey,
            NullCategory::EmptyItem,
            NullCategory::NullItem,
        ] {
            assert_eq!(cat, NullCategory::from_i8(cat.as_i8()).unwrap());
        }
        assert!(NullCategory::from_i8(9).is_err());
    }

    #[test]
    fn direction_step() {
        assert_eq!(1, ScanDirection::Forward.step());
        assert_eq!(-1, ScanDirection::Backward.step());
        assert_eq!(ScanDirection::Backward, ScanDirection::Forward.reverse());
    }
}
