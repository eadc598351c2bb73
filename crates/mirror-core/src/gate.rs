//! # First-Time Gate
//!
//! Tracks which cache names have already received their bootstrap
//! snapshot during this process's lifetime. The set only grows; a
//! reconnecting transport consults it to route a repeated full snapshot
//! through incremental events instead of a second `first_time`.

use std::sync::Arc;

use dashmap::DashSet;

/// Membership set of cache names whose initial snapshot was delivered.
#[derive(Debug, Default)]
pub struct FirstTimeGate {
    delivered: DashSet<String>,
}

impl FirstTimeGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// True once `mark_delivered` has been called for `name`.
    pub fn has_delivered(&self, name: &str) -> bool {
        self.delivered.contains(name)
    }

    /// Records the bootstrap delivery for `name`.
    ///
    /// Returns `true` only for the call that actually inserted the name,
    /// which makes this usable as an atomic test-and-set.
    pub fn mark_delivered(&self, name: &str) -> bool {
        self.delivered.insert(name.to_string())
    }

    /// Sorted names that have been delivered.
    pub fn delivered(&self) -> Vec<String> {
        let mut names: Vec<String> = self.delivered.iter().map(|n| n.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.delivered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.delivered.is_empty()
    }
}
