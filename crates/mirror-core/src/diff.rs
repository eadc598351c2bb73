//! # Snapshot Diffing
//!
//! When a full snapshot arrives for a cache name whose bootstrap has
//! already been delivered (a relay re-backfill after reconnect, or a
//! second subscription on an already-served cache name), it is routed
//! through incremental events. This module computes those events from
//! the cached state and the incoming snapshot.

use std::collections::{HashMap, HashSet};

use crate::event::{ChangeEvent, ChangeKind};
use crate::record::Record;

/// Incremental events equivalent to replacing `current` with `incoming`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotDiff {
    pub added: Vec<Record>,
    pub modified: Vec<Record>,
    pub removed: Vec<Record>,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    /// Events for `collection_name` in the order they are applied: added,
    /// modified, removed.
    pub fn into_events(self, collection_name: &str) -> [ChangeEvent; 3] {
        [
            ChangeEvent::new(collection_name, ChangeKind::Add, self.added),
            ChangeEvent::new(collection_name, ChangeKind::Modify, self.modified),
            ChangeEvent::new(collection_name, ChangeKind::Remove, self.removed),
        ]
    }
}

/// Compares two snapshots by `key_field`.
///
/// - incoming records with an unknown key are added
/// - incoming records whose cached copy differs are modified
/// - cached records whose key is absent from `incoming` are removed
///
/// Unchanged records produce nothing. Records without a key are ignored on
/// both sides: the default parsers would skip them anyway, and a keyless
/// record can never be matched against a later snapshot.
pub fn diff_snapshot(current: &[Record], incoming: &[Record], key_field: &str) -> SnapshotDiff {
    let cached: HashMap<String, &Record> = current
        .iter()
        .filter_map(|r| r.key(key_field).map(|k| (k, r)))
        .collect();

    let mut diff = SnapshotDiff::default();
    let mut seen = HashSet::with_capacity(incoming.len());

    for record in incoming {
        let Some(key) = record.key(key_field) else {
            continue;
        };

        match cached.get(&key) {
            Some(existing) if *existing == record => {}
            Some(_) => diff.modified.push(record.clone()),
            None => diff.added.push(record.clone()),
        }
        seen.insert(key);
    }

    diff.removed = current
        .iter()
        .filter(|r| matches!(r.key(key_field), Some(k) if !seen.contains(&k)))
        .cloned()
        .collect();

    diff
}
