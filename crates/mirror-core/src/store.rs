//! # Keyed Store
//!
//! Process-wide mapping from cache name to cached collection state. Pure
//! storage with no policy: what gets written is decided by the parsers in
//! [`crate::parser`] and by caller code.
//!
//! ## Cache Shapes
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Cache Entry Shapes                             │
//! │                                                                         │
//! │  ARRAY ("array")                    │  OBJECT ("object")                │
//! │  ────────────────                   │  ──────────────────               │
//! │  [ {id:a}, {id:b}, {id:c} ]         │  { a: {id:a}, b: {id:b} }         │
//! │  • insertion order preserved        │  • one entry per key              │
//! │  • add/modify: remove then append   │  • add/modify: upsert by key      │
//! │  • remove: filter out by key        │  • remove: delete key             │
//! │                                                                         │
//! │  A cache name keeps ONE shape for its whole lifetime.                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Concurrency
//! Entries live in a [`DashMap`]. `update_array` / `update_object` run the
//! whole read-modify-write inside one entry guard, so concurrent handlers
//! for different collections cannot lose each other's updates. Callers
//! must not invoke listeners while inside those closures.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::record::Record;

/// Map-shaped cache contents, keyed by the subscription's key field.
pub type ObjectCache = BTreeMap<String, Record>;

// =============================================================================
// Shape
// =============================================================================

/// Storage shape of a cache name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseAs {
    /// Ordered sequence of records.
    #[default]
    Array,
    /// Mapping of record key to record.
    Object,
}

impl fmt::Display for ParseAs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseAs::Array => write!(f, "array"),
            ParseAs::Object => write!(f, "object"),
        }
    }
}

impl std::str::FromStr for ParseAs {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "array" | "list" => Ok(ParseAs::Array),
            "object" | "map" => Ok(ParseAs::Object),
            other => Err(format!(
                "Unknown cache shape: '{}'. Valid options: array, object",
                other
            )),
        }
    }
}

/// Value stored under a cache name.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEntry {
    Array(Vec<Record>),
    Object(ObjectCache),
}

impl CacheEntry {
    pub fn shape(&self) -> ParseAs {
        match self {
            CacheEntry::Array(_) => ParseAs::Array,
            CacheEntry::Object(_) => ParseAs::Object,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            CacheEntry::Array(records) => records.len(),
            CacheEntry::Object(map) => map.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Keyed Store
// =============================================================================

/// Shared cache of mirrored collections.
///
/// One instance is created at process start and handed to every component
/// that needs it; tests build their own isolated instances.
#[derive(Debug, Default)]
pub struct KeyedStore {
    entries: DashMap<String, CacheEntry>,
}

impl KeyedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store wrapped in Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Replaces the array stored under `name`.
    pub fn set_array(&self, name: &str, records: Vec<Record>) -> CoreResult<()> {
        self.replace(name, CacheEntry::Array(records))
    }

    /// Returns a copy of the array under `name`.
    ///
    /// Absent names, and names holding a map, read as empty.
    pub fn get_array(&self, name: &str) -> Vec<Record> {
        match self.entries.get(name).as_deref() {
            Some(CacheEntry::Array(records)) => records.clone(),
            _ => Vec::new(),
        }
    }

    /// Replaces the map stored under `name`.
    pub fn set_object(&self, name: &str, map: ObjectCache) -> CoreResult<()> {
        self.replace(name, CacheEntry::Object(map))
    }

    /// Returns a copy of the map under `name`, or `default`.
    pub fn get_object(&self, name: &str, default: ObjectCache) -> ObjectCache {
        match self.entries.get(name).as_deref() {
            Some(CacheEntry::Object(map)) => map.clone(),
            _ => default,
        }
    }

    /// Every cached record under `name`, whatever its shape.
    pub fn records(&self, name: &str) -> Vec<Record> {
        match self.entries.get(name).as_deref() {
            Some(CacheEntry::Array(records)) => records.clone(),
            Some(CacheEntry::Object(map)) => map.values().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Read-modify-write of an array entry under a single guard.
    ///
    /// An absent entry starts out empty.
    pub fn update_array<F, R>(&self, name: &str, f: F) -> CoreResult<R>
    where
        F: FnOnce(&mut Vec<Record>) -> R,
    {
        let mut entry = self
            .entries
            .entry(name.to_string())
            .or_insert_with(|| CacheEntry::Array(Vec::new()));

        match entry.value_mut() {
            CacheEntry::Array(records) => Ok(f(records)),
            other => Err(mismatch(name, ParseAs::Array, other.shape())),
        }
    }

    /// Read-modify-write of a map entry under a single guard.
    pub fn update_object<F, R>(&self, name: &str, f: F) -> CoreResult<R>
    where
        F: FnOnce(&mut ObjectCache) -> R,
    {
        let mut entry = self
            .entries
            .entry(name.to_string())
            .or_insert_with(|| CacheEntry::Object(ObjectCache::new()));

        match entry.value_mut() {
            CacheEntry::Object(map) => Ok(f(map)),
            other => Err(mismatch(name, ParseAs::Object, other.shape())),
        }
    }

    /// Shape held by `name`, if it has been written.
    pub fn shape(&self, name: &str) -> Option<ParseAs> {
        self.entries.get(name).map(|e| e.shape())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Sorted list of cache names currently held.
    pub fn cache_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Number of cache names held.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn replace(&self, name: &str, value: CacheEntry) -> CoreResult<()> {
        match self.entries.entry(name.to_string()) {
            Entry::Occupied(mut occupied) => {
                let actual = occupied.get().shape();
                if actual != value.shape() {
                    return Err(mismatch(name, value.shape(), actual));
                }
                occupied.insert(value);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(value);
            }
        }
        Ok(())
    }
}

fn mismatch(name: &str, expected: ParseAs, actual: ParseAs) -> CoreError {
    CoreError::ShapeMismatch {
        cache_name: name.to_string(),
        expected,
        actual,
    }
}
