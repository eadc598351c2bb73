//! # Subscription Configuration
//!
//! Declarative description of one collection's synchronization policy.
//! Built by the caller at startup, handed once to
//! [`SyncEngine::subscribe`](crate::engine::SyncEngine::subscribe), and
//! immutable afterwards.
//!
//! ## Example
//! ```rust
//! use mirror_core::ParseAs;
//! use mirror_sync::{SubscriptionConfig, TransportKind};
//!
//! let config = SubscriptionConfig::new("users")
//!     .cache_name("users_by_id")
//!     .parse_as(ParseAs::Object)
//!     .transport(TransportKind::Relay)
//!     .on_add(|records, config| {
//!         println!("{} new records in {}", records.len(), config.cache());
//!         Ok(())
//!     });
//!
//! assert_eq!(config.cache(), "users_by_id");
//! ```

use std::error::Error;
use std::fmt;
use std::sync::Arc;

use mirror_core::{ChangeKind, ParseAs, Record, StorageTarget, DEFAULT_KEY_FIELD};

use crate::transport::TransportKind;

// =============================================================================
// Listener Types
// =============================================================================

/// Error a listener may return; it aborts delivery to later listeners.
pub type ListenerError = Box<dyn Error + Send + Sync>;

/// Result returned by every listener.
pub type ListenerResult = Result<(), ListenerError>;

/// Per-kind callback: `(records, config)`.
pub type Callback = Arc<dyn Fn(&[Record], &SubscriptionConfig) -> ListenerResult + Send + Sync>;

/// Listener receiving every event kind of a subscription.
///
/// All methods default to no-ops, so implementors only override what they
/// care about.
pub trait ChangeListener: Send + Sync {
    fn on_first_time(&self, _records: &[Record], _config: &SubscriptionConfig) -> ListenerResult {
        Ok(())
    }

    fn on_add(&self, _records: &[Record], _config: &SubscriptionConfig) -> ListenerResult {
        Ok(())
    }

    fn on_modify(&self, _records: &[Record], _config: &SubscriptionConfig) -> ListenerResult {
        Ok(())
    }

    fn on_remove(&self, _records: &[Record], _config: &SubscriptionConfig) -> ListenerResult {
        Ok(())
    }
}

/// Routes one event to the matching method of a listener.
pub(crate) fn invoke_listener(
    listener: &dyn ChangeListener,
    kind: ChangeKind,
    records: &[Record],
    config: &SubscriptionConfig,
) -> ListenerResult {
    match kind {
        ChangeKind::FirstTime => listener.on_first_time(records, config),
        ChangeKind::Add => listener.on_add(records, config),
        ChangeKind::Modify => listener.on_modify(records, config),
        ChangeKind::Remove => listener.on_remove(records, config),
    }
}

#[derive(Clone, Default)]
struct Callbacks {
    on_first_time: Option<Callback>,
    on_add: Option<Callback>,
    on_modify: Option<Callback>,
    on_remove: Option<Callback>,
}

// =============================================================================
// Subscription Config
// =============================================================================

/// Synchronization policy for one collection.
#[derive(Clone)]
pub struct SubscriptionConfig {
    /// Upstream collection to mirror.
    pub collection_name: String,

    /// Cache name to store under. Defaults to `collection_name`.
    pub cache_name: Option<String>,

    /// Storage shape of the cache entry.
    pub parse_as: ParseAs,

    /// Field that keys records (map keys, array de-duplication).
    pub key_field: String,

    /// Transport to use. Defaults to the engine's default transport.
    pub transport: Option<TransportKind>,

    callbacks: Callbacks,

    listeners: Vec<Arc<dyn ChangeListener>>,
}

impl SubscriptionConfig {
    /// Creates an array-shaped subscription keyed by `id`.
    pub fn new(collection_name: impl Into<String>) -> Self {
        SubscriptionConfig {
            collection_name: collection_name.into(),
            cache_name: None,
            parse_as: ParseAs::default(),
            key_field: DEFAULT_KEY_FIELD.to_string(),
            transport: None,
            callbacks: Callbacks::default(),
            listeners: Vec::new(),
        }
    }

    /// Sets the cache name.
    pub fn cache_name(mut self, name: impl Into<String>) -> Self {
        self.cache_name = Some(name.into());
        self
    }

    /// Sets the storage shape.
    pub fn parse_as(mut self, shape: ParseAs) -> Self {
        self.parse_as = shape;
        self
    }

    /// Sets the key field.
    pub fn key_field(mut self, field: impl Into<String>) -> Self {
        self.key_field = field.into();
        self
    }

    /// Pins the subscription to a transport.
    pub fn transport(mut self, kind: TransportKind) -> Self {
        self.transport = Some(kind);
        self
    }

    pub fn on_first_time<F>(mut self, f: F) -> Self
    where
        F: Fn(&[Record], &SubscriptionConfig) -> ListenerResult + Send + Sync + 'static,
    {
        self.callbacks.on_first_time = Some(Arc::new(f));
        self
    }

    pub fn on_add<F>(mut self, f: F) -> Self
    where
        F: Fn(&[Record], &SubscriptionConfig) -> ListenerResult + Send + Sync + 'static,
    {
        self.callbacks.on_add = Some(Arc::new(f));
        self
    }

    pub fn on_modify<F>(mut self, f: F) -> Self
    where
        F: Fn(&[Record], &SubscriptionConfig) -> ListenerResult + Send + Sync + 'static,
    {
        self.callbacks.on_modify = Some(Arc::new(f));
        self
    }

    pub fn on_remove<F>(mut self, f: F) -> Self
    where
        F: Fn(&[Record], &SubscriptionConfig) -> ListenerResult + Send + Sync + 'static,
    {
        self.callbacks.on_remove = Some(Arc::new(f));
        self
    }

    /// Adds a listener to the extra listener set. Listeners run after the
    /// per-kind callback, in registration order.
    pub fn listener(mut self, listener: Arc<dyn ChangeListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Fills in the default cache name.
    pub fn resolved(mut self) -> Self {
        if self.cache_name.is_none() {
            self.cache_name = Some(self.collection_name.clone());
        }
        self
    }

    /// The cache name this subscription writes to.
    pub fn cache(&self) -> &str {
        self.cache_name.as_deref().unwrap_or(&self.collection_name)
    }

    pub fn storage_target(&self) -> StorageTarget<'_> {
        StorageTarget {
            cache_name: self.cache(),
            key_field: &self.key_field,
            shape: self.parse_as,
        }
    }

    /// Per-kind callback registered for `kind`, if any.
    pub fn callback(&self, kind: ChangeKind) -> Option<&Callback> {
        match kind {
            ChangeKind::FirstTime => self.callbacks.on_first_time.as_ref(),
            ChangeKind::Add => self.callbacks.on_add.as_ref(),
            ChangeKind::Modify => self.callbacks.on_modify.as_ref(),
            ChangeKind::Remove => self.callbacks.on_remove.as_ref(),
        }
    }

    pub fn listeners(&self) -> &[Arc<dyn ChangeListener>] {
        &self.listeners
    }
}

impl fmt::Debug for SubscriptionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionConfig")
            .field("collection_name", &self.collection_name)
            .field("cache_name", &self.cache())
            .field("parse_as", &self.parse_as)
            .field("key_field", &self.key_field)
            .field("transport", &self.transport)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;
    impl ChangeListener for Noop {}

    #[test]
    fn test_defaults() {
        let config = SubscriptionConfig::new("users");
        assert_eq!(config.cache(), "users");
        assert_eq!(config.parse_as, ParseAs::Array);
        assert_eq!(config.key_field, "id");
        assert!(config.transport.is_none());
        assert!(config.callback(ChangeKind::Add).is_none());
    }

    #[test]
    fn test_resolved_fills_cache_name() {
        let config = SubscriptionConfig::new("users").resolved();
        assert_eq!(config.cache_name.as_deref(), Some("users"));

        let config = SubscriptionConfig::new("users").cache_name("people").resolved();
        assert_eq!(config.cache_name.as_deref(), Some("people"));
    }

    #[test]
    fn test_callbacks_are_registered_per_kind() {
        let config = SubscriptionConfig::new("users")
            .on_remove(|_, _| Ok(()))
            .listener(Arc::new(Noop));

        assert!(config.callback(ChangeKind::Remove).is_some());
        assert!(config.callback(ChangeKind::Modify).is_none());
        assert_eq!(config.listeners().len(), 1);
    }

    #[test]
    fn test_debug_hides_callbacks() {
        let config = SubscriptionConfig::new("users").on_add(|_, _| Ok(()));
        let debug = format!("{:?}", config);
        assert!(debug.contains("users"));
    }
}
