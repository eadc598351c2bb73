//! # Event Dispatcher
//!
//! Single delivery path shared by every transport. For each event the
//! default storage mutation runs first, then the subscription's per-kind
//! callback, then its extra listeners in registration order.
//!
//! ## Delivery Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Dispatcher                                     │
//! │                                                                         │
//! │  snapshot ──► claim_first_time(cache)?                                  │
//! │                   │ yes                      │ no                       │
//! │                   ▼                          ▼                          │
//! │              first_time            add ─► modify ─► remove              │
//! │                   │                          │                          │
//! │                   └────────────┬─────────────┘                          │
//! │                                ▼                                        │
//! │                      deliver(config, kind, records)                     │
//! │                                │                                        │
//! │        ┌───────────────────────┼──────────────────────────┐             │
//! │        ▼                       ▼                          ▼             │
//! │  apply_default()      config.callback(kind)     config.listeners()     │
//! │  (KeyedStore)         first error aborts        in order               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use mirror_core::{
    apply_default, diff_snapshot, ApplyOutcome, ChangeEvent, ChangeKind, FirstTimeGate, KeyedStore,
    Record,
};
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};
use crate::subscription::{invoke_listener, ListenerError, SubscriptionConfig};

/// How a repeated full snapshot is reconciled against the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconcile {
    /// Emit adds and modifies only. Used when the cache name may hold
    /// records from other collections.
    Upsert,
    /// Also emit removals for cached records missing from the snapshot.
    Full,
}

/// Applies change events to the store and notifies listeners.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    store: Arc<KeyedStore>,
    gate: Arc<FirstTimeGate>,
}

impl Dispatcher {
    pub fn new(store: Arc<KeyedStore>, gate: Arc<FirstTimeGate>) -> Self {
        Dispatcher { store, gate }
    }

    pub fn store(&self) -> &Arc<KeyedStore> {
        &self.store
    }

    pub fn gate(&self) -> &Arc<FirstTimeGate> {
        &self.gate
    }

    /// Claims the bootstrap for the subscription's cache name.
    ///
    /// Returns `true` exactly once per cache name for the life of the gate;
    /// the caller must then deliver a `first_time` event.
    pub fn claim_first_time(&self, config: &SubscriptionConfig) -> bool {
        self.gate.mark_delivered(config.cache())
    }

    // =========================================================================
    // Delivery
    // =========================================================================

    /// Delivers one event: default mutation, callback, then listeners.
    ///
    /// The store mutation is complete before any listener runs. A listener
    /// error stops delivery to later listeners and is returned; the store
    /// mutation is not rolled back.
    pub fn deliver(
        &self,
        config: &SubscriptionConfig,
        kind: ChangeKind,
        records: &[Record],
    ) -> SyncResult<ApplyOutcome> {
        let target = config.storage_target();
        let outcome = apply_default(&self.store, &target, kind, records)?;

        if outcome.skipped > 0 {
            warn!(
                collection = %config.collection_name,
                cache = %config.cache(),
                kind = %kind,
                key_field = %config.key_field,
                skipped = outcome.skipped,
                "Records without a key were not stored"
            );
        }

        debug!(
            collection = %config.collection_name,
            cache = %config.cache(),
            kind = %kind,
            records = records.len(),
            applied = outcome.applied,
            "Delivered change event"
        );

        self.notify(config, kind, records)?;
        Ok(outcome)
    }

    /// Delivers a transport-built [`ChangeEvent`].
    pub fn deliver_event(
        &self,
        config: &SubscriptionConfig,
        event: &ChangeEvent,
    ) -> SyncResult<ApplyOutcome> {
        self.deliver(config, event.kind, &event.records)
    }

    /// Delivers a batch of incremental events in the given order. Empty
    /// batches are still delivered.
    pub fn deliver_batch(
        &self,
        config: &SubscriptionConfig,
        batch: impl IntoIterator<Item = ChangeEvent>,
    ) -> SyncResult<()> {
        for event in batch {
            self.deliver_event(config, &event)?;
        }
        Ok(())
    }

    /// Routes a full snapshot: `first_time` if the cache name has not been
    /// bootstrapped yet, otherwise the diff against the cached records.
    ///
    /// Returns the kind of delivery that happened.
    pub fn deliver_snapshot(
        &self,
        config: &SubscriptionConfig,
        records: Vec<Record>,
        reconcile: Reconcile,
    ) -> SyncResult<SnapshotDelivery> {
        if self.claim_first_time(config) {
            let event = ChangeEvent::first_time(config.collection_name.as_str(), records);
            self.deliver_event(config, &event)?;
            return Ok(SnapshotDelivery::FirstTime);
        }

        let current = self.store.records(config.cache());
        let mut diff = diff_snapshot(&current, &records, &config.key_field);
        if reconcile == Reconcile::Upsert {
            diff.removed.clear();
        }

        let changed = diff.added.len() + diff.modified.len() + diff.removed.len();
        self.deliver_batch(config, diff.into_events(&config.collection_name))?;
        Ok(SnapshotDelivery::Incremental { changed })
    }

    fn notify(
        &self,
        config: &SubscriptionConfig,
        kind: ChangeKind,
        records: &[Record],
    ) -> SyncResult<()> {
        if let Some(callback) = config.callback(kind) {
            callback(records, config).map_err(|e| listener_error(config, kind, e))?;
        }

        for listener in config.listeners() {
            invoke_listener(listener.as_ref(), kind, records, config)
                .map_err(|e| listener_error(config, kind, e))?;
        }

        Ok(())
    }
}

/// Result of [`Dispatcher::deliver_snapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotDelivery {
    FirstTime,
    Incremental { changed: usize },
}

fn listener_error(config: &SubscriptionConfig, kind: ChangeKind, err: ListenerError) -> SyncError {
    SyncError::Listener {
        collection: config.collection_name.clone(),
        kind,
        message: err.to_string(),
    }
}
