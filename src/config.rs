// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// Index options, the reloptions equivalent
///
/// `attach` names the column whose value is carried as addInfo on the
/// occurrences of the `add_to` column; `order_by_attach` switches the
/// posting-tree comparator of that column to (addInfo, item pointer) order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct IndexOptions {
    pub attach: Option<String>,
    pub add_to: Option<String>,
    pub order_by_attach: bool,
}

/// Index configuration
///
/// No process-wide state: every long-lived operation receives its knobs
/// through this struct.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Config {
    /// Sort memory for scans (partial-match collection, ORDER BY), in KiB
    pub work_mem_kb: usize,

    /// Memory budget of the build accumulator, in KiB
    pub maintenance_work_mem_kb: usize,

    /// When > 0, exact-match scans over keys with a large predicted result
    /// randomly thin their output down to roughly this many items
    pub fuzzy_search_limit: u32,

    pub options: IndexOptions,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            work_mem_kb: 4 * 1024,
            maintenance_work_mem_kb: 64 * 1024,
            fuzzy_search_limit: 0,
            options: IndexOptions::default(),
        }
    }
}

impl Config {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn work_mem_kb(mut self, kb: usize) -> Self {
        self.work_mem_kb = kb;
        self
    }

    #[must_use]
    pub fn maintenance_work_mem_kb(mut self, kb: usize) -> Self {
        self.maintenance_work_mem_kb = kb;
        self
    }

    #[must_use]
    pub fn fuzzy_search_limit(mut self, limit: u32) -> Self {
        self.fuzzy_search_limit = limit;
        self
    }

    /// Attaches `attach_column`'s value as addInfo to `add_to_column`'s
    /// occurrences.
    #[must_use]
    pub fn attach(mut self, attach_column: &str, add_to_column: &str) -> Self {
        self.options.attach = Some(attach_column.into());
        self.options.add_to = Some(add_to_column.into());
        self
    }

    /// Stores the attached column's occurrences in (addInfo, item pointer)
    /// order instead of plain item-pointer order.
    #[must_use]
    pub fn order_by_attach(mut self, flag: bool) -> Self {
        self.options.order_by_attach = flag;
        self
    }
}
