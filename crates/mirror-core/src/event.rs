//! # Change Events
//!
//! Canonical representation of a collection mutation. Produced by a
//! transport, consumed by the dispatcher, never persisted.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::record::Record;

/// What happened to the records of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// Initial full snapshot for a cache name. Delivered at most once per
    /// process lifetime.
    FirstTime,
    Add,
    Modify,
    Remove,
}

impl ChangeKind {
    /// Incremental kinds in the order batched deltas are applied.
    pub const INCREMENTAL: [ChangeKind; 3] =
        [ChangeKind::Add, ChangeKind::Modify, ChangeKind::Remove];
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::FirstTime => write!(f, "first_time"),
            ChangeKind::Add => write!(f, "add"),
            ChangeKind::Modify => write!(f, "modify"),
            ChangeKind::Remove => write!(f, "remove"),
        }
    }
}

/// A batch of records tagged with a mutation kind.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub collection_name: String,
    pub kind: ChangeKind,
    pub records: Vec<Record>,
}

impl ChangeEvent {
    pub fn new(collection_name: impl Into<String>, kind: ChangeKind, records: Vec<Record>) -> Self {
        ChangeEvent {
            collection_name: collection_name.into(),
            kind,
            records,
        }
    }

    pub fn first_time(collection_name: impl Into<String>, records: Vec<Record>) -> Self {
        Self::new(collection_name, ChangeKind::FirstTime, records)
    }

    /// Single-record event, the shape relay messages arrive in.
    pub fn single(collection_name: impl Into<String>, kind: ChangeKind, record: Record) -> Self {
        Self::new(collection_name, kind, vec![record])
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}
