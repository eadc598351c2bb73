//! # Default Storage Parsers
//!
//! The shape-appropriate mutation applied to the [`KeyedStore`] for every
//! change event, before any listener sees it. Selection between the two
//! parsers happens in exactly one place, [`default_parser`].
//!
//! ## Mutation Table
//! ```text
//! ┌──────────────┬────────────────────────────┬────────────────────────────┐
//! │ kind         │ array                      │ object                     │
//! ├──────────────┼────────────────────────────┼────────────────────────────┤
//! │ first_time   │ replace with records       │ replace with keyed records │
//! │ add / modify │ remove same key, append    │ upsert by key              │
//! │              │ (unkeyed records skipped)  │ (unkeyed records skipped)  │
//! │ remove       │ filter out matching keys   │ delete keys                │
//! └──────────────┴────────────────────────────┴────────────────────────────┘
//! ```

use std::collections::HashSet;

use crate::error::CoreResult;
use crate::event::ChangeKind;
use crate::record::Record;
use crate::store::{KeyedStore, ObjectCache, ParseAs};

/// Where and how an event's records are stored.
#[derive(Debug, Clone, Copy)]
pub struct StorageTarget<'a> {
    pub cache_name: &'a str,
    pub key_field: &'a str,
    pub shape: ParseAs,
}

/// What a parser did with the records it was given.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Records written or removed.
    pub applied: usize,
    /// Records dropped because they had no usable key.
    pub skipped: usize,
}

/// Signature shared by the array and object parsers.
pub type DefaultParser =
    fn(&KeyedStore, &StorageTarget<'_>, ChangeKind, &[Record]) -> CoreResult<ApplyOutcome>;

/// Picks the parser for a cache shape.
pub fn default_parser(shape: ParseAs) -> DefaultParser {
    match shape {
        ParseAs::Array => apply_array,
        ParseAs::Object => apply_object,
    }
}

/// Applies `records` to the store according to `target.shape`.
pub fn apply_default(
    store: &KeyedStore,
    target: &StorageTarget<'_>,
    kind: ChangeKind,
    records: &[Record],
) -> CoreResult<ApplyOutcome> {
    default_parser(target.shape)(store, target, kind, records)
}

// =============================================================================
// Array Shape
// =============================================================================

fn apply_array(
    store: &KeyedStore,
    target: &StorageTarget<'_>,
    kind: ChangeKind,
    records: &[Record],
) -> CoreResult<ApplyOutcome> {
    let key_field = target.key_field;

    match kind {
        ChangeKind::FirstTime => {
            store.set_array(target.cache_name, records.to_vec())?;
            Ok(ApplyOutcome {
                applied: records.len(),
                skipped: 0,
            })
        }
        ChangeKind::Add | ChangeKind::Modify => store.update_array(target.cache_name, |cached| {
            let mut outcome = ApplyOutcome::default();
            for record in records {
                let Some(key) = record.key(key_field) else {
                    outcome.skipped += 1;
                    continue;
                };
                cached.retain(|existing| existing.key(key_field).as_deref() != Some(key.as_str()));
                cached.push(record.clone());
                outcome.applied += 1;
            }
            outcome
        }),
        ChangeKind::Remove => {
            let (keys, skipped) = collect_keys(records, key_field);
            store.update_array(target.cache_name, |cached| {
                let before = cached.len();
                cached.retain(|existing| match existing.key(key_field) {
                    Some(key) => !keys.contains(&key),
                    None => true,
                });
                ApplyOutcome {
                    applied: before - cached.len(),
                    skipped,
                }
            })
        }
    }
}

// =============================================================================
// Object Shape
// =============================================================================

fn apply_object(
    store: &KeyedStore,
    target: &StorageTarget<'_>,
    kind: ChangeKind,
    records: &[Record],
) -> CoreResult<ApplyOutcome> {
    let key_field = target.key_field;

    match kind {
        ChangeKind::FirstTime => {
            let mut map = ObjectCache::new();
            let mut skipped = 0;
            for record in records {
                match record.key(key_field) {
                    Some(key) => {
                        map.insert(key, record.clone());
                    }
                    None => skipped += 1,
                }
            }
            let applied = records.len() - skipped;
            store.set_object(target.cache_name, map)?;
            Ok(ApplyOutcome { applied, skipped })
        }
        ChangeKind::Add | ChangeKind::Modify => store.update_object(target.cache_name, |cached| {
            let mut outcome = ApplyOutcome::default();
            for record in records {
                match record.key(key_field) {
                    Some(key) => {
                        cached.insert(key, record.clone());
                        outcome.applied += 1;
                    }
                    None => outcome.skipped += 1,
                }
            }
            outcome
        }),
        ChangeKind::Remove => {
            let (keys, skipped) = collect_keys(records, key_field);
            store.update_object(target.cache_name, |cached| {
                let applied = keys.iter().filter(|key| cached.remove(*key).is_some()).count();
                ApplyOutcome { applied, skipped }
            })
        }
    }
}

fn collect_keys(records: &[Record], key_field: &str) -> (HashSet<String>, usize) {
    let mut skipped = 0;
    let keys = records
        .iter()
        .filter_map(|r| {
            let key = r.key(key_field);
            if key.is_none() {
                skipped += 1;
            }
            key
        })
        .collect();
    (keys, skipped)
}
