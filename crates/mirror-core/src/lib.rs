//! # mirror-core: Pure Cache Logic
//!
//! The I/O-free half of collection mirroring: where cached records live,
//! how change events mutate them, and when a snapshot counts as the
//! bootstrap.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Mirror Architecture                              │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │              mirror-sync (transports + engine)                  │   │
//! │  │   DirectFeedTransport ──┐                 ┌── RelayTransport    │   │
//! │  │                         ▼                 ▼                     │   │
//! │  │                      Dispatcher ──► listeners                   │   │
//! │  └─────────────────────────┬───────────────────────────────────────┘   │
//! │                            │                                            │
//! │  ┌─────────────────────────▼───────────────────────────────────────┐   │
//! │  │               ★ mirror-core (THIS CRATE) ★                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌────────────┐  │   │
//! │  │   │  store    │  │   gate    │  │  parser   │  │ connection │  │   │
//! │  │   │KeyedStore │  │FirstTime  │  │array/obj  │  │ Reconnect  │  │   │
//! │  │   │CacheEntry │  │  Gate     │  │ mutation  │  │  Policy    │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └────────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO NETWORK • NO TIMERS                               │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`record`] - Records and wire timestamp normalization
//! - [`event`] - Change kinds and change events
//! - [`store`] - The keyed cache store
//! - [`gate`] - First-time bootstrap gate
//! - [`parser`] - Default map/array storage mutations
//! - [`diff`] - Snapshot diffing for repeated full snapshots
//! - [`connection`] - Reconnect policy and connection state machine
//! - [`error`] - Core error types
//!
//! ## Example Usage
//!
//! ```rust
//! use mirror_core::{apply_default, ChangeKind, KeyedStore, ParseAs, Record, StorageTarget};
//! use serde_json::json;
//!
//! let store = KeyedStore::new();
//! let target = StorageTarget { cache_name: "items", key_field: "id", shape: ParseAs::Array };
//! let a = Record::try_from(json!({"id": "a"})).unwrap();
//! let b = Record::try_from(json!({"id": "b"})).unwrap();
//!
//! apply_default(&store, &target, ChangeKind::Add, &[a.clone(), b.clone()]).unwrap();
//! apply_default(&store, &target, ChangeKind::Remove, &[a]).unwrap();
//!
//! assert_eq!(store.get_array("items"), vec![b]);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod connection;
pub mod diff;
pub mod error;
pub mod event;
pub mod gate;
pub mod parser;
pub mod record;
pub mod store;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use connection::{ConnectionState, ReconnectPolicy, ReconnectTracker};
pub use diff::{diff_snapshot, SnapshotDiff};
pub use error::{CoreError, CoreResult};
pub use event::{ChangeEvent, ChangeKind};
pub use gate::FirstTimeGate;
pub use parser::{apply_default, default_parser, ApplyOutcome, StorageTarget};
pub use record::{normalize_timestamps, Record, Timestamp, DEFAULT_KEY_FIELD};
pub use store::{CacheEntry, KeyedStore, ObjectCache, ParseAs};
