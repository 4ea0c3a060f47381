//! Append-then-compact log of graph edits on a shared query plan.
//!
//! Entries are keyed by a strictly increasing microsecond timestamp. The
//! placement phase reads entries up to "now", advances the processed
//! watermark, then compacts.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{SystemTime, UNIX_EPOCH};

use coplace_core::id::OperatorId;
use coplace_core::plan::QueryPlan;
use serde::{Deserialize, Serialize};

pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub upstream_operators: BTreeSet<OperatorId>,
    pub downstream_operators: BTreeSet<OperatorId>,
    /// Bounds plus every operator between them.
    pub po_set: BTreeSet<OperatorId>,
}

impl ChangeLogEntry {
    pub fn new(
        plan: &QueryPlan,
        upstream_operators: BTreeSet<OperatorId>,
        downstream_operators: BTreeSet<OperatorId>,
    ) -> Self {
        let mut po_set = plan.operators_between(&upstream_operators, &downstream_operators);
        po_set.extend(upstream_operators.iter().copied());
        po_set.extend(downstream_operators.iter().copied());
        Self {
            upstream_operators,
            downstream_operators,
            po_set,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeLog {
    entries: BTreeMap<u64, ChangeLogEntry>,
    processed_until: u64,
    last_timestamp: u64,
}

impl ChangeLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry; returns the timestamp it was stored under, which is
    /// bumped past the previous one when the clock did not advance.
    pub fn add_entry(&mut self, now: u64, entry: ChangeLogEntry) -> u64 {
        let ts = now
            .max(self.last_timestamp.saturating_add(1))
            .max(self.processed_until.saturating_add(1));
        self.entries.insert(ts, entry);
        self.last_timestamp = ts;
        ts
    }

    /// Unprocessed entries with a timestamp at or below `until`, oldest first.
    pub fn entries_until(&self, until: u64) -> Vec<(u64, ChangeLogEntry)> {
        if until <= self.processed_until {
            return Vec::new();
        }
        self.entries
            .range(self.processed_until.saturating_add(1)..=until)
            .map(|(ts, e)| (*ts, e.clone()))
            .collect()
    }

    /// Advance the watermark; it never moves backwards.
    pub fn update_processed_timestamp(&mut self, ts: u64) {
        self.processed_until = self.processed_until.max(ts);
    }

    /// Drop every entry at or below the watermark; returns how many went.
    pub fn compact(&mut self) -> usize {
        let keep = match self.processed_until.checked_add(1) {
            Some(first_unprocessed) => self.entries.split_off(&first_unprocessed),
            None => BTreeMap::new(),
        };
        let removed = self.entries.len();
        self.entries = keep;
        removed
    }

    /// Forget unprocessed entries.
    pub fn discard_pending(&mut self) {
        self.entries.clear();
        self.processed_until = self.processed_until.max(self.last_timestamp);
    }

    pub fn processed_until(&self) -> u64 {
        self.processed_until
    }

    pub fn last_timestamp(&self) -> u64 {
        self.last_timestamp
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
