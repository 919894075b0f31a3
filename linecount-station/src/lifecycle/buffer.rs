//! Produced-count deltas waiting to reach the remote store

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Delta for one plan and the units it came from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingIncrement {
    pub delta: i64,
    pub unit_ids: Vec<i64>,
}

/// plan_id -> pending delta
///
/// A push works on a snapshot; only the pushed part is removed on
/// confirmation, so completions recorded during the push stay pending.
#[derive(Debug, Default)]
pub struct IncrementBuffer {
    inner: Mutex<HashMap<i64, PendingIncrement>>,
}

impl IncrementBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<i64, PendingIncrement>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn add(&self, plan_id: i64, unit_id: i64, quantity: i64) {
        let mut entries = self.entries();
        let entry = entries.entry(plan_id).or_default();
        entry.delta += quantity;
        entry.unit_ids.push(unit_id);
    }

    pub fn snapshot(&self) -> Vec<(i64, PendingIncrement)> {
        let mut snapshot: Vec<(i64, PendingIncrement)> = self
            .entries()
            .iter()
            .filter(|(_, pending)| pending.delta > 0)
            .map(|(plan_id, pending)| (*plan_id, pending.clone()))
            .collect();
        snapshot.sort_by_key(|(plan_id, _)| *plan_id);
        snapshot
    }

    /// Remove what a successful push delivered
    pub fn confirm(&self, plan_id: i64, pushed: &PendingIncrement) {
        let mut entries = self.entries();
        if let Some(entry) = entries.get_mut(&plan_id) {
            entry.delta -= pushed.delta;
            entry.unit_ids.retain(|id| !pushed.unit_ids.contains(id));
            if entry.delta <= 0 && entry.unit_ids.is_empty() {
                entries.remove(&plan_id);
            }
        }
    }

    /// Drop a plan's pending delta (plan no longer exists remotely)
    pub fn discard(&self, plan_id: i64) -> Option<PendingIncrement> {
        self.entries().remove(&plan_id)
    }

    pub fn pending_deltas(&self) -> HashMap<i64, i64> {
        self.entries()
            .iter()
            .map(|(plan_id, pending)| (*plan_id, pending.delta))
            .collect()
    }

    pub fn total(&self) -> i64 {
        self.entries().values().map(|p| p.delta).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Replace contents from persisted (plan_id, unit_id, quantity) rows
    pub fn rebuild(&self, rows: &[(i64, i64, i64)]) {
        let mut entries = self.entries();
        entries.clear();
        for (plan_id, unit_id, quantity) in rows {
            let entry = entries.entry(*plan_id).or_default();
            entry.delta += quantity;
            entry.unit_ids.push(*unit_id);
        }
    }
}
