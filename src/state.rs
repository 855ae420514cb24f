// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::config::Config;
use crate::datum::{AttrInfo, Datum};
use crate::item::{compare_item_pointers, RumItem};
use crate::opclass::{NullCategory, Opclass, RumConfig};
use crate::postinglist::LeafCodec;
use crate::tuple::EntryTuple;
use std::cmp::Ordering;
use std::sync::Arc;

/// One indexed column: a name and the opclass driving it
#[derive(Clone)]
pub struct ColumnDef {
    pub name: String,
    pub opclass: Arc<dyn Opclass>,
}

impl ColumnDef {
    #[must_use]
    pub fn new(name: &str, opclass: Arc<dyn Opclass>) -> Self {
        Self {
            name: name.into(),
            opclass,
        }
    }
}

/// One key produced by entry extraction
#[derive(Clone, Debug)]
pub struct ExtractedEntry {
    pub key: Option<Datum>,
    pub category: NullCategory,
    pub add_info: Option<Datum>,
}

/// Working state describing the index being operated on
///
/// Resolves the index options against the column list once and hands out
/// per-column opclasses, addInfo storage descriptions and comparators.
pub struct RumState {
    pub columns: Vec<ColumnDef>,
    pub config: Config,

    pub one_col: bool,
    pub use_alternative_order: bool,

    /// Column whose value rides along as addInfo (1-based)
    pub attach_attnum: Option<u16>,
    /// Column whose occurrences carry that addInfo (1-based)
    pub add_to_attnum: Option<u16>,

    /// Per-column addInfo storage description
    add_attrs: Vec<Option<AttrInfo>>,
    rum_configs: Vec<RumConfig>,

    /// Cooperative cancellation flag, polled at tuple and page boundaries
    pub interrupt: Option<std::sync::Arc<std::sync::atomic::AtomicBool>>,
}

impl RumState {
    pub fn new(columns: Vec<ColumnDef>, config: Config) -> crate::Result<Self> {
        if columns.is_empty() {
            return Err(crate::Error::ConfigConflict("index needs a column"));
        }

        let find = |name: &Option<String>| -> crate::Result<Option<u16>> {
            let Some(name) = name else { return Ok(None) };
            columns
                .iter()
                .position(|c| &c.name == name)
                .map(|i| Some(i as u16 + 1))
                .ok_or(crate::Error::ConfigConflict(
                    "named column is not part of the index",
                ))
        };

        let attach_attnum = find(&config.options.attach)?;
        let add_to_attnum = find(&config.options.add_to)?;

        if attach_attnum.is_some() != add_to_attnum.is_some() {
            return Err(crate::Error::ConfigConflict(
                "attach and add-to columns must be defined together",
            ));
        }
        if config.options.order_by_attach && attach_attnum.is_none() {
            return Err(crate::Error::ConfigConflict(
                "order_by_attach requires attach and add-to columns",
            ));
        }
        if attach_attnum.is_some() && attach_attnum == add_to_attnum {
            return Err(crate::Error::ConfigConflict(
                "attach and add-to must name different columns",
            ));
        }

        let rum_configs: Vec<RumConfig> = columns.iter().map(|c| c.opclass.config()).collect();

        let mut add_attrs: Vec<Option<AttrInfo>> = rum_configs
            .iter()
            .map(|c| c.add_info_type)
            .collect();

        if let (Some(attach), Some(add_to)) = (attach_attnum, add_to_attnum) {
            let add_to_idx = add_to as usize - 1;
            if add_attrs[add_to_idx].is_some() {
                return Err(crate::Error::ConfigConflict(
                    "add-to column must not define its own addInfo",
                ));
            }

            let attach_attr = columns[attach as usize - 1].opclass.key_attr();
            if config.options.order_by_attach && !attach_attr.typbyval {
                return Err(crate::Error::ConfigConflict(
                    "alternative order requires a pass-by-value attach column",
                ));
            }
            add_attrs[add_to_idx] = Some(attach_attr);
        }

        Ok(Self {
            one_col: columns.len() == 1,
            use_alternative_order: config.options.order_by_attach,
            attach_attnum,
            add_to_attnum,
            add_attrs,
            rum_configs,
            columns,
            config,
            interrupt: None,
        })
    }

    /// Returns `Interrupted` when cancellation was requested.
    pub fn check_for_interrupts(&self) -> crate::Result<()> {
        if let Some(flag) = &self.interrupt {
            if flag.load(std::sync::atomic::Ordering::Relaxed) {
                return Err(crate::Error::Interrupted);
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn n_columns(&self) -> usize {
        self.columns.len()
    }

    #[must_use]
    pub fn opclass(&self, attnum: u16) -> &Arc<dyn Opclass> {
        &self.columns[attnum as usize - 1].opclass
    }

    #[must_use]
    pub fn key_attr(&self, attnum: u16) -> AttrInfo {
        self.columns[attnum as usize - 1].opclass.key_attr()
    }

    #[must_use]
    pub fn add_attr(&self, attnum: u16) -> Option<&AttrInfo> {
        self.add_attrs[attnum as usize - 1].as_ref()
    }

    #[must_use]
    pub fn rum_config(&self, attnum: u16) -> &RumConfig {
        &self.rum_configs[attnum as usize - 1]
    }

    /// True when `attnum` stores its posting trees in (addInfo, iptr) order.
    #[must_use]
    pub fn is_alt_order_column(&self, attnum: u16) -> bool {
        self.use_alternative_order && self.add_to_attnum == Some(attnum)
    }

    /// The posting-stream codec of one column.
    #[must_use]
    pub fn leaf_codec(&self, attnum: u16) -> LeafCodec {
        LeafCodec {
            alt_order: self.is_alt_order_column(attnum),
            add_attr: self.add_attrs[attnum as usize - 1],
        }
    }

    /// Compares two keys of the same column: category first, then the
    /// opclass comparator for two normal keys.
    #[must_use]
    pub fn compare_entries(
        &self,
        attnum: u16,
        a: Option<&Datum>,
        cat_a: NullCategory,
        b: Option<&Datum>,
        cat_b: NullCategory,
    ) -> Ordering {
        match cat_a.cmp(&cat_b) {
            Ordering::Equal => {}
            other => return other,
        }

        if !cat_a.is_norm() {
            return Ordering::Equal;
        }

        let (Some(a), Some(b)) = (a, b) else {
            // a normal-key category without a key is a corrupt tuple;
            // comparing conservatively keeps the search deterministic
            return Ordering::Equal;
        };
        self.opclass(attnum).compare(a, b)
    }

    /// Compares two keys of possibly different columns (attnum first).
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn compare_att_entries(
        &self,
        attnum_a: u16,
        a: Option<&Datum>,
        cat_a: NullCategory,
        attnum_b: u16,
        b: Option<&Datum>,
        cat_b: NullCategory,
    ) -> Ordering {
        match attnum_a.cmp(&attnum_b) {
            Ordering::Equal => self.compare_entries(attnum_a, a, cat_a, b, cat_b),
            other => other,
        }
    }

    /// Total order on occurrence records of one column.
    ///
    /// For the add-to column of an alternative-order index the attached
    /// addInfo compares first (null addInfo sorting as +infinity), the item
    /// pointer breaks ties. Everywhere else it is plain item-pointer order.
    #[must_use]
    pub fn compare_rum_item(&self, attnum: u16, a: &RumItem, b: &RumItem) -> Ordering {
        if self.is_alt_order_column(attnum) {
            let attach = self.attach_attnum.expect("alt order implies attach column");

            match (&a.add_info, &b.add_info) {
                (Some(va), Some(vb)) => {
                    let res = self.opclass(attach).compare(va, vb);
                    if res != Ordering::Equal {
                        return res;
                    }
                }
                (Some(_), None) => return Ordering::Less,
                (None, Some(_)) => return Ordering::Greater,
                (None, None) => {}
            }
        }

        compare_item_pointers(&a.iptr, &b.iptr)
    }

    /// The stored key and category of an entry tuple.
    pub fn tuple_key(
        &self,
        tuple: &EntryTuple<'_>,
    ) -> crate::Result<(Option<Datum>, NullCategory)> {
        let category = tuple.category()?;
        let key = tuple.key(&self.key_attr(tuple.attnum()))?;
        Ok((key, category))
    }

    /// Extracts the index keys for one column value, sorted and
    /// de-duplicated, with placeholder categories for null and empty items.
    pub fn extract_entries(&self, attnum: u16, value: Option<&Datum>) -> Vec<ExtractedEntry> {
        let Some(value) = value else {
            return vec![ExtractedEntry {
                key: None,
                category: NullCategory::NullItem,
                add_info: None,
            }];
        };

        let raw = self.opclass(attnum).extract_value(value);

        if raw.is_empty() {
            return vec![ExtractedEntry {
                key: None,
                category: NullCategory::EmptyItem,
                add_info: None,
            }];
        }

        let mut entries: Vec<ExtractedEntry> = raw
            .into_iter()
            .map(|e| ExtractedEntry {
                category: if e.is_null {
                    NullCategory::NullKey
                } else {
                    NullCategory::NormKey
                },
                key: if e.is_null { None } else { Some(e.key) },
                add_info: e.add_info,
            })
            .collect();

        entries.sort_by(|a, b| {
            self.compare_entries(attnum, a.key.as_ref(), a.category, b.key.as_ref(), b.category)
        });

        // the first occurrence's addInfo wins among duplicates
        entries.dedup_by(|b, a| {
            self.compare_entries(attnum, a.key.as_ref(), a.category, b.key.as_ref(), b.category)
                == Ordering::Equal
        });

        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::ItemPointer;
    use crate::opclasses::{Int64Ops, TextTermsOps};
    use test_log::test;

    fn two_col_state(order_by_attach: bool) -> RumState {
        let config = Config::new()
            .attach("ts", "tsv")
            .order_by_attach(order_by_attach);
        RumState::new(
            vec![
                ColumnDef::new("tsv", Arc::new(TextTermsOps)),
                ColumnDef::new("ts", Arc::new(Int64Ops)),
            ],
            config,
        )
        .unwrap()
    }

    #[test]
    fn state_resolves_attach_columns() {
        let state = two_col_state(true);
        assert_eq!(Some(2), state.attach_attnum);
        assert_eq!(Some(1), state.add_to_attnum);
        assert!(state.is_alt_order_column(1));
        assert!(!state.is_alt_order_column(2));
        assert!(state.add_attr(1).is_some());
        assert!(state.add_attr(2).is_none());
    }

    #[test]
    fn state_rejects_bad_options() {
        let config = Config::new().attach("nope", "tsv");
        assert!(RumState::new(
            vec![
                ColumnDef::new("tsv", Arc::new(TextTermsOps)),
                ColumnDef::new("ts", Arc::new(Int64Ops)),
            ],
            config,
        )
        .is_err());
    }

    #[test]
    fn alt_order_nulls_sort_last() {
        let state = two_col_state(true);

        let with_info = RumItem::new(ItemPointer::new(10, 1), Some(Datum::Inline(5)));
        let null_info = RumItem::new(ItemPointer::new(0, 1), None);

        assert_eq!(
            Ordering::Less,
            state.compare_rum_item(1, &with_info, &null_info)
        );
        assert_eq!(
            Ordering::Greater,
            state.compare_rum_item(1, &null_info, &with_info)
        );
    }

    #[test]
    fn extract_entries_dedups_and_sorts() {
        let state = two_col_state(false);
        let entries = state.extract_entries(1, Some(&Datum::from("b a b c a")));

        let keys: Vec<&[u8]> = entries
            .iter()
            .map(|e| e.key.as_ref().unwrap().bytes())
            .collect();
        assert_eq!(vec![b"a".as_slice(), b"b", b"c"], keys);
    }

    #[test]
    fn extract_entries_placeholders() {
        let state = two_col_state(false);

        let null = state.extract_entries(1, None);
        assert_eq!(1, null.len());
        assert_eq!(NullCategory::NullItem, null[0].category);

        let empty = state.extract_entries(1, Some(&Datum::from("")));
        assert_eq!(1, empty.len());
        assert_eq!(NullCategory::EmptyItem, empty[0].category);
    }
}
