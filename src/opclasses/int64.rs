// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::btree_strategy as strategy;
use crate::datum::{AttrInfo, Datum};
use crate::opclass::{
    ExtraData, ExtractedQuery, KeyCheck, NullCategory, Opclass, QueryEntry, RumConfig,
    ScanDirection, SearchMode, StrategyNumber, ValueEntry,
};
use std::cmp::Ordering;
use std::sync::Arc;

/// Query state threaded from `extract_query` into `compare_partial`
struct QueryInfo {
    strategy: StrategyNumber,
    datum: i64,
}

/// Btree semantics for 64-bit integers
///
/// Range predicates start the entry stream at the range's left end (the
/// leftmost value for `<`/`<=`) and run as partial matches until
/// `compare_partial` reports the right end. Timestamps are microseconds in
/// an i64, so they share this opclass.
#[derive(Copy, Clone, Debug, Default)]
pub struct Int64Ops;

impl Int64Ops {
    fn distance(a: i64, b: i64) -> f64 {
        (a as f64) - (b as f64)
    }
}

impl Opclass for Int64Ops {
    fn key_attr(&self) -> AttrInfo {
        AttrInfo::int8()
    }

    fn compare(&self, a: &Datum, b: &Datum) -> Ordering {
        a.inline().cmp(&b.inline())
    }

    fn extract_value(&self, value: &Datum) -> Vec<ValueEntry> {
        vec![ValueEntry::new(value.clone())]
    }

    fn supports_strategy(&self, strat: StrategyNumber) -> bool {
        matches!(
            strat,
            strategy::LESS
                | strategy::LESS_EQUAL
                | strategy::EQUAL
                | strategy::GREATER_EQUAL
                | strategy::GREATER
                | strategy::DISTANCE
                | strategy::LEFT_DISTANCE
                | strategy::RIGHT_DISTANCE
        )
    }

    fn extract_query(&self, query: &Datum, strat: StrategyNumber) -> ExtractedQuery {
        debug_assert!(self.supports_strategy(strat));

        let datum = query.inline();
        let extra: ExtraData = Arc::new(QueryInfo {
            strategy: strat,
            datum,
        });

        let mut entry = match strat {
            strategy::LESS | strategy::LESS_EQUAL => {
                // start at the leftmost key and scan forward
                let mut e = QueryEntry::new(Datum::Inline(i64::MIN));
                e.partial_match = true;
                e
            }
            strategy::GREATER_EQUAL | strategy::GREATER => {
                let mut e = QueryEntry::new(query.clone());
                e.partial_match = true;
                e
            }
            // equality and the distance family look the key up directly;
            // the planner filtered everything else
            _ => QueryEntry::new(query.clone()),
        };
        entry.extra = Some(extra);

        ExtractedQuery {
            entries: vec![entry],
            search_mode: SearchMode::Default,
        }
    }

    // An always-true consistent without recheck: correct because range
    // bounds are enforced by compare_partial while collecting the entry
    // stream, and equality entries only ever see exact key matches.
    fn consistent(
        &self,
        _check: &KeyCheck<'_>,
        _strategy: StrategyNumber,
        _query: &Datum,
        _n_user_entries: usize,
        recheck: &mut bool,
    ) -> bool {
        *recheck = false;
        true
    }

    fn config(&self) -> RumConfig {
        RumConfig {
            add_info_type: None,
            strategy_info: vec![
                (strategy::LEFT_DISTANCE, ScanDirection::Backward),
                (strategy::RIGHT_DISTANCE, ScanDirection::Forward),
            ],
        }
    }

    fn supports_partial_match(&self) -> bool {
        true
    }

    fn compare_partial(
        &self,
        query_key: &Datum,
        index_key: &Datum,
        _strategy: StrategyNumber,
        extra: Option<&ExtraData>,
    ) -> i32 {
        let info = extra
            .and_then(|e| e.downcast_ref::<QueryInfo>())
            .expect("int64 query info missing");

        // For the less-than family the entry key is the leftmost value, so
        // compare against the original query datum instead.
        let reference = match info.strategy {
            strategy::LESS | strategy::LESS_EQUAL => info.datum,
            _ => query_key.inline(),
        };
        let indexed = index_key.inline();

        match info.strategy {
            strategy::LESS => {
                if reference > indexed {
                    0
                } else {
                    1
                }
            }
            strategy::LESS_EQUAL => {
                if reference >= indexed {
                    0
                } else {
                    1
                }
            }
            strategy::EQUAL => {
                if reference == indexed {
                    0
                } else {
                    1
                }
            }
            strategy::GREATER_EQUAL => {
                if reference <= indexed {
                    0
                } else {
                    1
                }
            }
            strategy::GREATER => {
                // equality keeps scanning, anything above matches
                match reference.cmp(&indexed) {
                    Ordering::Less => 0,
                    Ordering::Equal => -1,
                    Ordering::Greater => 1,
                }
            }
            other => {
                // planner-filtered; stop the scan rather than panic
                debug_assert!(false, "unrecognized strategy number: {other}");
                1
            }
        }
    }

    fn supports_key_ordering(&self) -> bool {
        true
    }

    fn key_ordering(&self, key: &Datum, query: &Datum, strat: StrategyNumber) -> f64 {
        self.outer_ordering(key, query, strat)
    }

    fn supports_outer_ordering(&self) -> bool {
        true
    }

    fn outer_ordering(&self, add_info: &Datum, query: &Datum, strat: StrategyNumber) -> f64 {
        let a = add_info.inline();
        let b = query.inline();

        match strat {
            strategy::DISTANCE => Self::distance(a, b).abs(),
            strategy::LEFT_DISTANCE => {
                // distance to values left of the query; right of it is infinite
                if a > b {
                    f64::INFINITY
                } else {
                    Self::distance(b, a)
                }
            }
            strategy::RIGHT_DISTANCE => {
                if a < b {
                    f64::INFINITY
                } else {
                    Self::distance(a, b)
                }
            }
            other => {
                // planner-filtered; rank last rather than panic
                debug_assert!(false, "unrecognized strategy number: {other}");
                f64::INFINITY
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn partial(strat: StrategyNumber, query: i64, indexed: i64) -> i32 {
        let ops = Int64Ops;
        let extracted = ops.extract_query(&Datum::Inline(query), strat);
        let entry = &extracted.entries[0];
        ops.compare_partial(
            &entry.key,
            &Datum::Inline(indexed),
            strat,
            entry.extra.as_ref(),
        )
    }

    #[test]
    fn int64_less_family_stops_at_bound() {
        assert_eq!(0, partial(strategy::LESS, 10, 9));
        assert_eq!(1, partial(strategy::LESS, 10, 10));
        assert_eq!(0, partial(strategy::LESS_EQUAL, 10, 10));
        assert_eq!(1, partial(strategy::LESS_EQUAL, 10, 11));
    }

    #[test]
    fn int64_greater_family() {
        assert_eq!(0, partial(strategy::GREATER_EQUAL, 10, 10));
        assert_eq!(0, partial(strategy::GREATER_EQUAL, 10, 11));
        assert_eq!(-1, partial(strategy::GREATER, 10, 10));
        assert_eq!(0, partial(strategy::GREATER, 10, 11));
    }

    #[test]
    fn int64_less_seeds_leftmost() {
        let ops = Int64Ops;
        let q = ops.extract_query(&Datum::Inline(55), strategy::LESS);
        assert_eq!(i64::MIN, q.entries[0].key.inline());
        assert!(q.entries[0].partial_match);
    }

    #[test]
    fn int64_distances() {
        let ops = Int64Ops;
        let a = Datum::Inline(1500);
        let q = Datum::Inline(1000);

        assert_eq!(500.0, ops.outer_ordering(&a, &q, strategy::DISTANCE));
        assert_eq!(500.0, ops.outer_ordering(&a, &q, strategy::RIGHT_DISTANCE));
        assert!(ops
            .outer_ordering(&a, &q, strategy::LEFT_DISTANCE)
            .is_infinite());
    }
}
