//! # Relay Wire Protocol
//!
//! Key layout and message format shared by the relay writer and the relay
//! transport.
//!
//! ## Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Redis Layout                                   │
//! │                                                                         │
//! │  KEYS       "{collection}:{id}"  ──►  {"data": {...record...}, ...}     │
//! │  SCAN       MATCH "{collection}:*"                                      │
//! │                                                                         │
//! │  CHANNELS   "{prefix}:{collection}"                                     │
//! │  PSUBSCRIBE "{prefix}*"                                                 │
//! │  PAYLOAD    {"collection_name": "...",                                  │
//! │              "update_type": "add" | "update" | "delete",                │
//! │              "data": {...record...}}                                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{SecondsFormat, Utc};
use mirror_core::{ChangeKind, Record};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{SyncError, SyncResult};

/// Default prefix of relay pub/sub channels.
pub const DEFAULT_CHANNEL_PREFIX: &str = "collection_updates";

// =============================================================================
// Keys and Channels
// =============================================================================

/// Key holding one record: `"{collection}:{id}"`.
pub fn record_key(collection: &str, id: &str) -> String {
    format!("{}:{}", collection, id)
}

/// SCAN pattern matching every record key of a collection.
///
/// Glob metacharacters in the collection name are escaped.
pub fn key_pattern(collection: &str) -> String {
    let mut pattern = String::with_capacity(collection.len() + 2);
    for c in collection.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push_str(":*");
    pattern
}

/// Channel a collection's updates are published on.
pub fn channel_name(prefix: &str, collection: &str) -> String {
    format!("{}:{}", prefix, collection)
}

/// Pattern the relay transport subscribes to.
pub fn channel_pattern(prefix: &str) -> String {
    format!("{}*", prefix)
}

// =============================================================================
// Messages
// =============================================================================

/// Update kind carried by a relay message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateType {
    Add,
    Update,
    Delete,
}

impl UpdateType {
    pub fn change_kind(&self) -> ChangeKind {
        match self {
            UpdateType::Add => ChangeKind::Add,
            UpdateType::Update => ChangeKind::Modify,
            UpdateType::Delete => ChangeKind::Remove,
        }
    }

    /// Inverse of [`change_kind`](Self::change_kind); `FirstTime` has no
    /// relay equivalent.
    pub fn from_change_kind(kind: ChangeKind) -> Option<Self> {
        match kind {
            ChangeKind::Add => Some(UpdateType::Add),
            ChangeKind::Modify => Some(UpdateType::Update),
            ChangeKind::Remove => Some(UpdateType::Delete),
            ChangeKind::FirstTime => None,
        }
    }
}

/// Pub/sub payload announcing one record change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayMessage {
    pub collection_name: String,
    pub update_type: UpdateType,
    pub data: Value,
}

impl RelayMessage {
    pub fn new(
        collection_name: impl Into<String>,
        update_type: UpdateType,
        record: &Record,
    ) -> Self {
        RelayMessage {
            collection_name: collection_name.into(),
            update_type,
            data: record.clone().into_value(),
        }
    }

    pub fn from_json(payload: &str) -> SyncResult<Self> {
        Ok(serde_json::from_str(payload)?)
    }

    pub fn to_json(&self) -> SyncResult<String> {
        serde_json::to_string(self).map_err(|e| SyncError::SerializationFailed(e.to_string()))
    }

    /// Converts the payload into the event it announces.
    ///
    /// Wire timestamps are normalized for `add` and `update`. `delete`
    /// payloads are passed through as sent.
    pub fn into_change(self) -> SyncResult<(ChangeKind, Record)> {
        let kind = self.update_type.change_kind();
        let mut record = Record::try_from(self.data).map_err(|e| {
            SyncError::InvalidMessage(format!(
                "{} payload for '{}': {}",
                kind, self.collection_name, e
            ))
        })?;

        if self.update_type != UpdateType::Delete {
            record.normalize_timestamps();
        }
        Ok((kind, record))
    }
}

// =============================================================================
// Stored Values
// =============================================================================

/// Value stored under a record key. Only `data` is read back; any other
/// fields written alongside it are kept but ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub data: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StoredRecord {
    /// Wraps a record with an `updated_at` stamp.
    pub fn new(record: &Record) -> Self {
        let mut extra = Map::new();
        extra.insert(
            "updated_at".to_string(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        StoredRecord {
            data: record.clone().into_value(),
            extra,
        }
    }

    pub fn to_json(&self) -> SyncResult<String> {
        serde_json::to_string(self).map_err(|e| SyncError::SerializationFailed(e.to_string()))
    }
}

/// Decodes a stored value into its record, with wire timestamps normalized.
pub fn decode_stored(key: &str, raw: &str) -> SyncResult<Record> {
    let stored: StoredRecord = serde_json::from_str(raw)
        .map_err(|e| SyncError::DeserializationFailed(format!("{}: {}", key, e)))?;

    let mut record = Record::try_from(stored.data)
        .map_err(|e| SyncError::InvalidMessage(format!("{}: {}", key, e)))?;
    record.normalize_timestamps();
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_and_channel_layout() {
        assert_eq!(record_key("users", "42"), "users:42");
        assert_eq!(key_pattern("users"), "users:*");
        assert_eq!(channel_name(DEFAULT_CHANNEL_PREFIX, "users"), "collection_updates:users");
        assert_eq!(channel_pattern(DEFAULT_CHANNEL_PREFIX), "collection_updates*");
    }

    #[test]
    fn test_key_pattern_escapes_glob_chars() {
        assert_eq!(key_pattern("a*b[1]"), "a\\*b\\[1\\]:*");
    }

    #[test]
    fn test_message_decodes() {
        let msg = RelayMessage::from_json(
            r#"{"collection_name":"users","update_type":"update","data":{"id":"1"}}"#,
        )
        .unwrap();
        assert_eq!(msg.collection_name, "users");
        assert_eq!(msg.update_type, UpdateType::Update);
    }

    #[test]
    fn test_unknown_update_type_is_rejected() {
        let err = RelayMessage::from_json(
            r#"{"collection_name":"users","update_type":"upsert","data":{}}"#,
        )
        .unwrap_err();
        assert!(err.is_protocol_error());
    }

    #[test]
    fn test_add_normalizes_timestamps() {
        let msg = RelayMessage {
            collection_name: "users".into(),
            update_type: UpdateType::Add,
            data: json!({"id": "1", "at": {"_seconds": 1700000000, "_nanoseconds": 0}}),
        };
        let (kind, record) = msg.into_change().unwrap();
        assert_eq!(kind, ChangeKind::Add);
        assert_eq!(record.timestamp("at").unwrap().millis(), 1_700_000_000_000);
    }

    #[test]
    fn test_delete_is_not_normalized() {
        let raw = json!({"id": "1", "at": {"_seconds": 1700000000, "_nanoseconds": 0}});
        let msg = RelayMessage {
            collection_name: "users".into(),
            update_type: UpdateType::Delete,
            data: raw.clone(),
        };
        let (kind, record) = msg.into_change().unwrap();
        assert_eq!(kind, ChangeKind::Remove);
        assert_eq!(record.into_value(), raw);
    }

    #[test]
    fn test_non_object_data_is_invalid() {
        let msg = RelayMessage {
            collection_name: "users".into(),
            update_type: UpdateType::Add,
            data: json!([1, 2]),
        };
        assert!(matches!(msg.into_change(), Err(SyncError::InvalidMessage(_))));
    }

    #[test]
    fn test_decode_stored_reads_data_only() {
        let raw = concat!(
            r#"{"data":{"id":"7","at":{"_seconds":1700000000,"_nanoseconds":0}},"#,
            r#""updated_at":"x"}"#
        );
        let record = decode_stored("users:7", raw).unwrap();
        assert_eq!(record.id().as_deref(), Some("7"));
        assert_eq!(record.timestamp("at").unwrap().millis(), 1_700_000_000_000);
    }

    #[test]
    fn test_stored_record_roundtrips_through_decode() {
        let record = Record::try_from(json!({"id": "9", "name": "n"})).unwrap();
        let raw = StoredRecord::new(&record).to_json().unwrap();
        assert_eq!(decode_stored("users:9", &raw).unwrap(), record);
    }
}
