// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicI64, Ordering},
};

use dashmap::DashMap;

use crate::api::error::{Result, SessionError};

/// Exported counter names are rooted here.
pub const COUNTER_PREFIX: &str = "fbnet.command_runner";

enum Cell {
    Value(AtomicI64),
    Func(Box<dyn Fn() -> i64 + Send + Sync>),
}

/// A bare minimum counters implementation: named integers plus nullary
/// callables evaluated at read time. Lookups by regex return a snapshot copy.
#[derive(Default)]
pub struct Counters {
    cells: DashMap<String, Cell>,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a plain counter if it does not exist yet.
    pub fn register(&self, name: &str, initial: i64) {
        self.cells
            .entry(name.to_string())
            .or_insert_with(|| Cell::Value(AtomicI64::new(initial)));
    }

    /// Registers a computed counter, replacing any previous definition.
    pub fn register_fn<F>(&self, name: &str, f: F)
    where F: Fn() -> i64 + Send + Sync + 'static {
        self.cells.insert(name.to_string(), Cell::Func(Box::new(f)));
    }

    pub fn increment(&self, name: &str) {
        self.increment_by(name, 1);
    }

    pub fn increment_by(&self, name: &str, amount: i64) {
        let entry = self
            .cells
            .entry(name.to_string())
            .or_insert_with(|| Cell::Value(AtomicI64::new(0)));
        if let Cell::Value(v) = entry.value() {
            v.fetch_add(amount, Ordering::Relaxed);
        }
    }

    pub fn reset(&self, name: &str, value: i64) {
        self.cells
            .insert(name.to_string(), Cell::Value(AtomicI64::new(value)));
    }

    /// Reads one counter, invoking the callable for computed entries.
    pub fn get(&self, name: &str) -> Option<i64> {
        self.cells.get(name).map(|cell| match cell.value() {
            Cell::Value(v) => v.load(Ordering::Relaxed),
            Cell::Func(f) => f(),
        })
    }

    /// Snapshot of every counter under the exported prefix.
    pub fn get_all(&self) -> BTreeMap<String, i64> {
        self.cells
            .iter()
            .map(|e| {
                let value = match e.value() {
                    Cell::Value(v) => v.load(Ordering::Relaxed),
                    Cell::Func(f) => f(),
                };
                (prefixed(e.key()), value)
            })
            .collect()
    }

    /// Snapshot of the counters whose exported name matches `pattern` at the
    /// start, mirroring an anchored match.
    pub fn get_matching(&self, pattern: &str) -> Result<BTreeMap<String, i64>> {
        let re = regex::Regex::new(pattern)
            .map_err(|e| SessionError::validation(format!("Invalid counter regex: {e}")))?;
        Ok(self
            .get_all()
            .into_iter()
            .filter(|(k, _)| re.find(k).is_some_and(|m| m.start() == 0))
            .collect())
    }
}

fn prefixed(name: &str) -> String {
    if name.starts_with(COUNTER_PREFIX) {
        name.to_string()
    } else {
        format!("{COUNTER_PREFIX}.{name}")
    }
}
