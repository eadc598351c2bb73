//! # Relay Publisher
//!
//! Writer side of the relay: keeps the key/value namespace current and
//! announces every change on the collection's channel, so relay readers
//! can backfill from keys and follow deltas from pub/sub.
//!
//! ```text
//! ChangeFeedSource ──► mirror_feed() ──► publish() ──┬──► SET / DEL "{collection}:{id}"
//!                                                    └──► PUBLISH "{prefix}:{collection}"
//! ```

use std::sync::Arc;

use mirror_core::{ChangeKind, Record, DEFAULT_KEY_FIELD};
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::relay::protocol::{channel_name, record_key, RelayMessage, StoredRecord, UpdateType};
use crate::relay::KeyValueWriter;
use crate::transport::direct::{ChangeFeedSource, FeedEvent};

/// Publishes record changes into the relay.
pub struct RelayPublisher {
    writer: Arc<dyn KeyValueWriter>,
    channel_prefix: String,
    key_field: String,
}

impl RelayPublisher {
    pub fn new(writer: Arc<dyn KeyValueWriter>, channel_prefix: impl Into<String>) -> Self {
        RelayPublisher {
            writer,
            channel_prefix: channel_prefix.into(),
            key_field: DEFAULT_KEY_FIELD.to_string(),
        }
    }

    /// Field read to build record keys.
    pub fn with_key_field(mut self, key_field: impl Into<String>) -> Self {
        self.key_field = key_field.into();
        self
    }

    fn key_for(&self, collection: &str, record: &Record) -> SyncResult<String> {
        record
            .key(&self.key_field)
            .map(|id| record_key(collection, &id))
            .ok_or_else(|| {
                SyncError::InvalidMessage(format!(
                    "record for '{}' has no '{}' field",
                    collection, self.key_field
                ))
            })
    }

    /// Stores (or deletes) the record, then announces the change.
    pub async fn publish(
        &self,
        collection: &str,
        update_type: UpdateType,
        record: &Record,
    ) -> SyncResult<()> {
        let key = self.key_for(collection, record)?;

        match update_type {
            UpdateType::Delete => self.writer.delete(&key).await?,
            UpdateType::Add | UpdateType::Update => {
                self.writer.put(&key, StoredRecord::new(record).to_json()?).await?
            }
        }

        let message = RelayMessage::new(collection, update_type, record);
        self.writer
            .publish(&channel_name(&self.channel_prefix, collection), message.to_json()?)
            .await?;

        debug!(collection, key = %key, update_type = ?update_type, "Published change");
        Ok(())
    }

    /// Stores every record without announcing it. Used to seed the
    /// namespace before readers backfill.
    pub async fn write_snapshot(&self, collection: &str, records: &[Record]) -> SyncResult<usize> {
        let mut written = 0;
        for record in records {
            let key = self.key_for(collection, record)?;
            self.writer.put(&key, StoredRecord::new(record).to_json()?).await?;
            written += 1;
        }

        info!(collection, records = written, "Wrote relay snapshot");
        Ok(written)
    }

    /// Bridges a change feed into the relay until the feed closes.
    ///
    /// The first snapshot seeds the namespace; every later document change
    /// is published individually.
    pub async fn mirror_feed(
        &self,
        source: &dyn ChangeFeedSource,
        collection: &str,
    ) -> SyncResult<()> {
        let mut events = source.open_change_feed(collection).await?;
        let mut seeded = false;

        while let Some(event) = events.recv().await {
            match event {
                FeedEvent::Snapshot(snapshot) if !seeded => {
                    self.write_snapshot(collection, &snapshot.documents).await?;
                    seeded = true;
                }
                FeedEvent::Snapshot(snapshot) => {
                    for change in &snapshot.changes {
                        self.publish(collection, update_type_for(change.kind), &change.record)
                            .await?;
                    }
                }
                FeedEvent::Error(message) => {
                    warn!(collection, error = %message, "Change feed error while mirroring");
                }
            }
        }

        info!(collection, "Mirrored change feed closed");
        Ok(())
    }
}

/// Maps a document change kind onto the relay update it publishes as.
pub fn update_type_for(kind: ChangeKind) -> UpdateType {
    UpdateType::from_change_kind(kind).unwrap_or(UpdateType::Add)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;

    #[derive(Default)]
    struct Recording {
        ops: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl KeyValueWriter for Recording {
        async fn put(&self, key: &str, value: String) -> SyncResult<()> {
            self.ops.lock().unwrap().push(format!("SET {} {}", key, value.contains("\"data\"")));
            Ok(())
        }

        async fn delete(&self, key: &str) -> SyncResult<()> {
            self.ops.lock().unwrap().push(format!("DEL {}", key));
            Ok(())
        }

        async fn publish(&self, channel: &str, payload: String) -> SyncResult<()> {
            let msg = RelayMessage::from_json(&payload)?;
            self.ops
                .lock()
                .unwrap()
                .push(format!("PUBLISH {} {:?}", channel, msg.update_type));
            Ok(())
        }
    }

    fn record(value: serde_json::Value) -> Record {
        Record::try_from(value).unwrap()
    }

    #[tokio::test]
    async fn test_publish_sets_then_announces() {
        let writer = Arc::new(Recording::default());
        let publisher = RelayPublisher::new(writer.clone(), "collection_updates");

        publisher
            .publish("users", UpdateType::Add, &record(json!({"id": "1"})))
            .await
            .unwrap();
        publisher
            .publish("users", UpdateType::Delete, &record(json!({"id": "1"})))
            .await
            .unwrap();

        let ops = writer.ops.lock().unwrap().clone();
        assert_eq!(
            ops,
            vec![
                "SET users:1 true",
                "PUBLISH collection_updates:users Add",
                "DEL users:1",
                "PUBLISH collection_updates:users Delete",
            ]
        );
    }

    #[tokio::test]
    async fn test_publish_requires_key() {
        let publisher = RelayPublisher::new(Arc::new(Recording::default()), "p");
        let err = publisher
            .publish("users", UpdateType::Add, &record(json!({"name": "x"})))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidMessage(_)));
    }

    #[tokio::test]
    async fn test_custom_key_field() {
        let writer = Arc::new(Recording::default());
        let publisher = RelayPublisher::new(writer.clone(), "p").with_key_field("sku");

        let written = publisher
            .write_snapshot("items", &[record(json!({"sku": 10})), record(json!({"sku": "b"}))])
            .await
            .unwrap();

        assert_eq!(written, 2);
        let ops = writer.ops.lock().unwrap().clone();
        assert_eq!(ops, vec!["SET items:10 true", "SET items:b true"]);
    }

    #[test]
    fn test_update_type_for_kinds() {
        assert_eq!(update_type_for(ChangeKind::Modify), UpdateType::Update);
        assert_eq!(update_type_for(ChangeKind::FirstTime), UpdateType::Add);
    }
}
