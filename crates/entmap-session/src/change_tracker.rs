//! Change tracking and dirty detection for the session.
//!
//! Two sources feed the set of pending changes for an instance:
//!
//! - explicit marks recorded by `Session::mark_dirty`
//! - a diff of the instance's current scalar row against the snapshot taken
//!   when it was materialized or last flushed
//!
//! All state is keyed by [`ObjectKey`], so nothing done to one instance can
//! touch what is tracked for another.

use crate::ObjectKey;
use entmap_core::{Result, Value};
use std::collections::{BTreeSet, HashMap};

/// Last-known-persisted scalar row of one instance.
#[derive(Debug)]
struct ObjectSnapshot {
    /// Serialized scalar row (JSON bytes).
    data: Vec<u8>,
}

impl ObjectSnapshot {
    /// Decode the stored row.
    #[allow(clippy::result_large_err)]
    fn columns(&self) -> Result<Vec<(String, Value)>> {
        Ok(serde_json::from_slice(&self.data)?)
    }
}

/// Tracks changes to objects in the session.
#[derive(Debug, Default)]
pub struct ChangeTracker {
    /// Last-known-persisted rows by object key.
    snapshots: HashMap<ObjectKey, ObjectSnapshot>,
    /// Fields explicitly marked dirty since the last snapshot.
    marks: HashMap<ObjectKey, BTreeSet<&'static str>>,
}

impl ChangeTracker {
    /// Empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `row` as the baseline for `key`.
    #[tracing::instrument(level = "trace", skip(self, row))]
    #[allow(clippy::result_large_err)]
    pub fn snapshot(&mut self, key: ObjectKey, row: &[(&'static str, Value)]) -> Result<()> {
        let data = serde_json::to_vec(row)?;
        tracing::trace!(
            columns = row.len(),
            snapshot_bytes = data.len(),
            "Taking object snapshot"
        );
        self.snapshots.insert(key, ObjectSnapshot { data });
        Ok(())
    }

    /// Record that `field` differs from its last-known-persisted value.
    pub fn mark(&mut self, key: ObjectKey, field: &'static str) {
        self.marks.entry(key).or_default().insert(field);
    }

    /// Fields of `row` that need writing.
    ///
    /// Without a snapshot every column is pending, as for a new instance.
    pub fn pending_changes(
        &self,
        key: &ObjectKey,
        row: &[(&'static str, Value)],
    ) -> BTreeSet<&'static str> {
        let mut changed: BTreeSet<&'static str> =
            self.marks.get(key).cloned().unwrap_or_default();

        let baseline = self
            .snapshots
            .get(key)
            .and_then(|snapshot| snapshot.columns().ok());
        match baseline {
            Some(baseline) => {
                for (column, value) in row {
                    let before = baseline.iter().find(|(name, _)| name.as_str() == *column);
                    if before.is_none_or(|(_, old)| old != value) {
                        changed.insert(*column);
                    }
                }
            }
            None => changed.extend(row.iter().map(|(column, _)| *column)),
        }
        changed
    }

    /// Does `row` differ from the baseline, or carry a mark?
    pub fn is_dirty(&self, key: &ObjectKey, row: &[(&'static str, Value)]) -> bool {
        !self.pending_changes(key, row).is_empty()
    }

    /// Is a baseline recorded for `key`?
    pub fn has_snapshot(&self, key: &ObjectKey) -> bool {
        self.snapshots.contains_key(key)
    }

    /// Install a new baseline after a successful write and drop the marks.
    #[allow(clippy::result_large_err)]
    pub fn refresh(&mut self, key: ObjectKey, row: &[(&'static str, Value)]) -> Result<()> {
        self.marks.remove(&key);
        self.snapshot(key, row)
    }

    /// Move tracked state to a new key.
    pub fn rekey(&mut self, old: &ObjectKey, new: ObjectKey) {
        if let Some(snapshot) = self.snapshots.remove(old) {
            self.snapshots.insert(new, snapshot);
        }
        if let Some(marks) = self.marks.remove(old) {
            self.marks.insert(new, marks);
        }
    }

    /// Forget everything tracked for `key`.
    pub fn clear(&mut self, key: &ObjectKey) {
        self.snapshots.remove(key);
        self.marks.remove(key);
    }

    /// Forget every baseline and mark.
    pub fn clear_all(&mut self) {
        self.snapshots.clear();
        self.marks.clear();
    }

    /// Number of snapshots held.
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    /// No snapshots held.
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}
