//! # Records and Timestamps
//!
//! A [`Record`] is one document of a remote collection: an opaque JSON
//! object that carries a unique key field (`id` unless configured
//! otherwise). Cached records are plain value copies.
//!
//! ## Timestamp Normalization
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Wire Timestamp → Canonical                           │
//! │                                                                         │
//! │  WIRE (serialized by the writer process)                               │
//! │  { "_seconds": 1700000000, "_nanoseconds": 0 }                         │
//! │                          │                                              │
//! │                          ▼  Timestamp::from_wire                        │
//! │  CANONICAL (stored in the cache)                                       │
//! │  "2023-11-14T22:13:20Z"   (RFC 3339, UTC)                              │
//! │                                                                         │
//! │  Record::timestamp(field) reads either form back as a Timestamp.       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{CoreError, CoreResult};

/// Field that identifies a record unless a subscription overrides it.
pub const DEFAULT_KEY_FIELD: &str = "id";

const WIRE_SECONDS: &str = "_seconds";
const WIRE_NANOS: &str = "_nanoseconds";

// =============================================================================
// Timestamp
// =============================================================================

/// Canonical timestamp type for normalized record fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Builds a timestamp from its wire parts.
    pub fn from_wire(seconds: i64, nanos: u32) -> CoreResult<Self> {
        Utc.timestamp_opt(seconds, nanos)
            .single()
            .map(Timestamp)
            .ok_or(CoreError::InvalidTimestamp { seconds, nanos })
    }

    /// Recognizes a `{ _seconds, _nanoseconds }` object.
    ///
    /// Returns `None` for anything else, including objects carrying extra
    /// fields next to the two wire keys.
    pub fn from_wire_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        if obj.len() != 2 {
            return None;
        }
        let seconds = number_as_i64(obj.get(WIRE_SECONDS)?)?;
        let nanos = number_as_i64(obj.get(WIRE_NANOS)?)?;
        let nanos = u32::try_from(nanos).ok()?;
        Self::from_wire(seconds, nanos).ok()
    }

    /// Parses the canonical RFC 3339 form.
    pub fn parse_canonical(s: &str) -> Option<Self> {
        DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| Timestamp(dt.with_timezone(&Utc)))
    }

    /// Milliseconds since the Unix epoch.
    pub fn millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    /// The canonical string form stored in cached records.
    pub fn to_canonical(&self) -> String {
        self.0.to_rfc3339_opts(SecondsFormat::AutoSi, true)
    }

    pub fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Timestamp(dt)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_canonical())
    }
}

fn number_as_i64(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64))
}

/// Rewrites every wire timestamp object inside `value` into canonical form.
///
/// Walks nested objects and arrays. Out-of-range wire timestamps are left
/// untouched.
pub fn normalize_timestamps(value: &mut Value) {
    if let Some(ts) = Timestamp::from_wire_value(value) {
        *value = Value::String(ts.to_canonical());
        return;
    }

    match value {
        Value::Object(map) => map.values_mut().for_each(normalize_timestamps),
        Value::Array(items) => items.iter_mut().for_each(normalize_timestamps),
        _ => {}
    }
}

// =============================================================================
// Record
// =============================================================================

/// One document of a collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    pub fn new() -> Self {
        Record(Map::new())
    }

    /// The record's `id`, stringified.
    pub fn id(&self) -> Option<String> {
        self.key(DEFAULT_KEY_FIELD)
    }

    /// Reads `field` as a cache key.
    ///
    /// Strings are used as-is and numbers are stringified; any other JSON
    /// type cannot key a record.
    pub fn key(&self, field: &str) -> Option<String> {
        match self.0.get(field)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(field.into(), value.into())
    }

    /// Reads a timestamp field in either canonical or wire form.
    pub fn timestamp(&self, field: &str) -> Option<Timestamp> {
        let value = self.0.get(field)?;
        match value {
            Value::String(s) => Timestamp::parse_canonical(s),
            other => Timestamp::from_wire_value(other),
        }
    }

    /// Converts all embedded wire timestamps into canonical form.
    pub fn normalize_timestamps(&mut self) {
        self.0.values_mut().for_each(normalize_timestamps);
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<Map<String, Value>> for Record {
    fn from(map: Map<String, Value>) -> Self {
        Record(map)
    }
}

impl TryFrom<Value> for Record {
    type Error = CoreError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(map) => Ok(Record(map)),
            other => Err(CoreError::NotAnObject(json_type_name(&other).to_string())),
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
