// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::text_strategy as strategy;
use crate::datum::{AttrInfo, Datum};
use crate::opclass::{
    ExtraData, ExtractedQuery, KeyCheck, Opclass, QueryEntry, RumConfig, SearchMode,
    StrategyNumber, ValueEntry,
};
use byteorder::{ByteOrder, LittleEndian};
use std::cmp::Ordering;

fn tokens(value: &Datum) -> Vec<(&str, u16)> {
    let text = std::str::from_utf8(value.bytes()).unwrap_or_default();
    let mut out = Vec::new();
    for (i, tok) in text.split_whitespace().enumerate() {
        out.push((tok, (i + 1) as u16));
    }
    out
}

fn query_entries(query: &Datum, partial: bool) -> Vec<QueryEntry> {
    let mut toks: Vec<&str> = tokens(query).into_iter().map(|(t, _)| t).collect();
    toks.sort_unstable();
    toks.dedup();

    toks.into_iter()
        .map(|t| {
            let mut e = QueryEntry::new(Datum::from(t));
            e.partial_match = partial;
            e
        })
        .collect()
}

fn and_consistent(check: &KeyCheck<'_>, n_user_entries: usize, recheck: &mut bool) -> bool {
    *recheck = false;
    check.matches.iter().take(n_user_entries).all(|m| *m)
}

/// Token index over whitespace-separated terms, AND query semantics
///
/// The addon flavor: it defines no addInfo of its own, so it can be the
/// add-to column of an attached timestamp (alternative-order setups).
#[derive(Copy, Clone, Debug, Default)]
pub struct TextTermsOps;

impl Opclass for TextTermsOps {
    fn key_attr(&self) -> AttrInfo {
        AttrInfo::varlena()
    }

    fn compare(&self, a: &Datum, b: &Datum) -> Ordering {
        a.bytes().cmp(b.bytes())
    }

    fn extract_value(&self, value: &Datum) -> Vec<ValueEntry> {
        tokens(value)
            .into_iter()
            .map(|(t, _)| ValueEntry::new(Datum::from(t)))
            .collect()
    }

    fn supports_strategy(&self, strat: StrategyNumber) -> bool {
        matches!(strat, strategy::MATCH | strategy::PREFIX | strategy::RANK)
    }

    fn extract_query(&self, query: &Datum, strat: StrategyNumber) -> ExtractedQuery {
        debug_assert!(self.supports_strategy(strat));

        ExtractedQuery {
            entries: query_entries(query, strat == strategy::PREFIX),
            search_mode: SearchMode::Default,
        }
    }

    fn consistent(
        &self,
        check: &KeyCheck<'_>,
        _strategy: StrategyNumber,
        _query: &Datum,
        n_user_entries: usize,
        recheck: &mut bool,
    ) -> bool {
        and_consistent(check, n_user_entries, recheck)
    }

    fn config(&self) -> RumConfig {
        RumConfig::default()
    }

    fn supports_partial_match(&self) -> bool {
        true
    }

    fn compare_partial(
        &self,
        query_key: &Datum,
        index_key: &Datum,
        _strategy: StrategyNumber,
        _extra: Option<&ExtraData>,
    ) -> i32 {
        let prefix = query_key.bytes();
        let indexed = index_key.bytes();

        if indexed.starts_with(prefix) {
            0
        } else if indexed < prefix {
            -1
        } else {
            1
        }
    }

    fn supports_pre_consistent(&self) -> bool {
        true
    }

    fn pre_consistent(
        &self,
        check: &[bool],
        _strategy: StrategyNumber,
        _query: &Datum,
        n_user_entries: usize,
    ) -> bool {
        check.iter().take(n_user_entries).all(|m| *m)
    }
}

/// Decodes a position list (u16 little-endian each)
#[must_use]
pub fn decode_positions(add_info: &Datum) -> Vec<u16> {
    let raw = add_info.bytes();
    raw.chunks_exact(2).map(LittleEndian::read_u16).collect()
}

fn encode_positions(positions: &[u16]) -> Datum {
    let mut raw = vec![0u8; positions.len() * 2];
    for (i, p) in positions.iter().enumerate() {
        LittleEndian::write_u16(&mut raw[i * 2..i * 2 + 2], *p);
    }
    Datum::Bytes(raw.into())
}

/// Token index that stores each token's positions as addInfo, enabling
/// in-index ranking without heap access
#[derive(Copy, Clone, Debug, Default)]
pub struct TextPositionsOps;

impl Opclass for TextPositionsOps {
    fn key_attr(&self) -> AttrInfo {
        AttrInfo::varlena()
    }

    fn compare(&self, a: &Datum, b: &Datum) -> Ordering {
        a.bytes().cmp(b.bytes())
    }

    fn extract_value(&self, value: &Datum) -> Vec<ValueEntry> {
        let mut by_token: Vec<(&str, Vec<u16>)> = Vec::new();

        for (tok, pos) in tokens(value) {
            match by_token.iter_mut().find(|(t, _)| *t == tok) {
                Some((_, positions)) => positions.push(pos),
                None => by_token.push((tok, vec![pos])),
            }
        }

        by_token
            .into_iter()
            .map(|(t, positions)| {
                ValueEntry::with_add_info(Datum::from(t), encode_positions(&positions))
            })
            .collect()
    }

    fn supports_strategy(&self, strat: StrategyNumber) -> bool {
        TextTermsOps.supports_strategy(strat)
    }

    fn extract_query(&self, query: &Datum, strat: StrategyNumber) -> ExtractedQuery {
        debug_assert!(self.supports_strategy(strat));

        ExtractedQuery {
            entries: query_entries(query, strat == strategy::PREFIX),
            search_mode: SearchMode::Default,
        }
    }

    fn consistent(
        &self,
        check: &KeyCheck<'_>,
        _strategy: StrategyNumber,
        _query: &Datum,
        n_user_entries: usize,
        recheck: &mut bool,
    ) -> bool {
        and_consistent(check, n_user_entries, recheck)
    }

    fn config(&self) -> RumConfig {
        RumConfig {
            add_info_type: Some(AttrInfo::varlena()),
            strategy_info: vec![],
        }
    }

    fn supports_partial_match(&self) -> bool {
        true
    }

    fn compare_partial(
        &self,
        query_key: &Datum,
        index_key: &Datum,
        strat: StrategyNumber,
        extra: Option<&ExtraData>,
    ) -> i32 {
        TextTermsOps.compare_partial(query_key, index_key, strat, extra)
    }

    fn supports_pre_consistent(&self) -> bool {
        true
    }

    fn pre_consistent(
        &self,
        check: &[bool],
        _strategy: StrategyNumber,
        _query: &Datum,
        n_user_entries: usize,
    ) -> bool {
        check.iter().take(n_user_entries).all(|m| *m)
    }

    fn supports_ordering(&self) -> bool {
        true
    }

    /// The more query-token occurrences an item has, the closer it ranks.
    fn ordering(
        &self,
        check: &KeyCheck<'_>,
        _strategy: StrategyNumber,
        _query: &Datum,
        n_user_entries: usize,
    ) -> f64 {
        let mut hits = 0usize;

        for i in 0..n_user_entries {
            if check.matches[i] {
                hits += match &check.add_info[i] {
                    Some(info) => decode_positions(info).len().max(1),
                    None => 1,
                };
            }
        }

        if hits == 0 {
            f64::INFINITY
        } else {
            1.0 / (hits as f64)
        }
    }

    fn supports_join_add_info(&self) -> bool {
        true
    }

    fn join_add_info(&self, a: &Datum, b: &Datum) -> Datum {
        let mut positions = decode_positions(a);
        positions.extend(decode_positions(b));
        positions.sort_unstable();
        positions.dedup();
        encode_positions(&positions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn text_extract_value_positions() {
        let ops = TextPositionsOps;
        let entries = ops.extract_value(&Datum::from("b a b"));

        let a = entries.iter().find(|e| e.key.bytes() == b"a").unwrap();
        let b = entries.iter().find(|e| e.key.bytes() == b"b").unwrap();

        assert_eq!(vec![2], decode_positions(a.add_info.as_ref().unwrap()));
        assert_eq!(vec![1, 3], decode_positions(b.add_info.as_ref().unwrap()));
    }

    #[test]
    fn text_query_dedups_tokens() {
        let ops = TextTermsOps;
        let q = ops.extract_query(&Datum::from("x y x"), strategy::MATCH);
        assert_eq!(2, q.entries.len());
    }

    #[test]
    fn text_prefix_compare_partial() {
        let ops = TextTermsOps;
        let q = Datum::from("ab");

        assert_eq!(0, ops.compare_partial(&q, &Datum::from("ab"), strategy::PREFIX, None));
        assert_eq!(0, ops.compare_partial(&q, &Datum::from("abc"), strategy::PREFIX, None));
        assert_eq!(-1, ops.compare_partial(&q, &Datum::from("aa"), strategy::PREFIX, None));
        assert_eq!(1, ops.compare_partial(&q, &Datum::from("ac"), strategy::PREFIX, None));
    }

    #[test]
    fn text_join_add_info_merges_positions() {
        let ops = TextPositionsOps;
        let a = encode_positions(&[1, 5]);
        let b = encode_positions(&[3, 5]);
        assert_eq!(
            vec![1, 3, 5],
            decode_positions(&ops.join_add_info(&a, &b))
        );
    }
}
