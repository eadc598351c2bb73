//! # Mirror Configuration
//!
//! Configuration for the sync engine, the relay connections and the
//! declared collections.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     MIRROR_REDIS_URL=redis://cache:6379                                │
//! │     MIRROR_DEFAULT_TRANSPORT=relay                                     │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/mirror/sync.toml (Linux)                                 │
//! │     ~/Library/Application Support/dev.mirror.mirror/sync.toml (macOS)  │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     relay transport, local Redis, no collections                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # sync.toml
//! [engine]
//! default_transport = "relay"     # relay | direct_feed
//!
//! [relay]
//! redis_url = "redis://127.0.0.1:6379"
//! channel_prefix = "collection_updates"
//! scan_count = 500
//! fetch_batch_size = 500
//! max_reconnect_attempts = 5
//! initial_backoff_ms = 200
//! max_backoff_ms = 5000
//! rebackfill_on_reconnect = true
//!
//! [[collections]]
//! collection = "users"
//! cache_name = "users_by_id"
//! parse_as = "object"
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use mirror_core::{ParseAs, ReconnectPolicy, DEFAULT_KEY_FIELD};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::relay::protocol::DEFAULT_CHANNEL_PREFIX;
use crate::relay::RedisSettings;
use crate::subscription::SubscriptionConfig;
use crate::transport::{RelaySettings, TransportKind};

// =============================================================================
// Engine Settings
// =============================================================================

/// Engine-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Transport for collections that do not name one.
    #[serde(default = "default_transport")]
    pub default_transport: TransportKind,
}

fn default_transport() -> TransportKind {
    TransportKind::Relay
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            default_transport: default_transport(),
        }
    }
}

// =============================================================================
// Relay Settings
// =============================================================================

/// Redis relay settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Redis URL used by both the request and subscriber connections.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Pub/sub channel prefix.
    #[serde(default = "default_channel_prefix")]
    pub channel_prefix: String,

    /// COUNT hint per SCAN page.
    #[serde(default = "default_batch")]
    pub scan_count: usize,

    /// Keys per MGET.
    #[serde(default = "default_batch")]
    pub fetch_batch_size: usize,

    /// Reconnect attempts before a connection gives up for good.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// First reconnect delay (milliseconds). Doubles per attempt.
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Reconnect delay ceiling (milliseconds).
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    /// Connect attempt timeout (seconds).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Re-scan live subscriptions after the subscriber reconnects.
    #[serde(default = "default_true")]
    pub rebackfill_on_reconnect: bool,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_channel_prefix() -> String {
    DEFAULT_CHANNEL_PREFIX.to_string()
}

fn default_batch() -> usize {
    500
}

fn default_max_reconnect_attempts() -> u32 {
    mirror_core::connection::DEFAULT_MAX_ATTEMPTS
}

fn default_initial_backoff() -> u64 {
    200
}

fn default_max_backoff() -> u64 {
    5000
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            redis_url: default_redis_url(),
            channel_prefix: default_channel_prefix(),
            scan_count: default_batch(),
            fetch_batch_size: default_batch(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            connect_timeout_secs: default_connect_timeout(),
            rebackfill_on_reconnect: default_true(),
        }
    }
}

impl RelayConfig {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(self.initial_backoff_ms),
            max_delay: Duration::from_millis(self.max_backoff_ms),
            max_attempts: self.max_reconnect_attempts,
        }
    }

    pub fn redis_settings(&self) -> RedisSettings {
        RedisSettings {
            url: self.redis_url.clone(),
            scan_count: self.scan_count,
            fetch_batch_size: self.fetch_batch_size,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            reconnect: self.reconnect_policy(),
        }
    }

    pub fn relay_settings(&self) -> RelaySettings {
        RelaySettings {
            channel_prefix: self.channel_prefix.clone(),
            rebackfill_on_reconnect: self.rebackfill_on_reconnect,
        }
    }
}

// =============================================================================
// Collections
// =============================================================================

/// One `[[collections]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionEntry {
    /// Upstream collection name.
    pub collection: String,

    /// Cache name; defaults to the collection name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_name: Option<String>,

    #[serde(default)]
    pub parse_as: ParseAs,

    #[serde(default = "default_key_field")]
    pub key_field: String,

    /// Transport override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportKind>,
}

fn default_key_field() -> String {
    DEFAULT_KEY_FIELD.to_string()
}

impl CollectionEntry {
    pub fn new(collection: impl Into<String>) -> Self {
        CollectionEntry {
            collection: collection.into(),
            cache_name: None,
            parse_as: ParseAs::default(),
            key_field: default_key_field(),
            transport: None,
        }
    }

    pub fn cache(&self) -> &str {
        self.cache_name.as_deref().unwrap_or(&self.collection)
    }

    /// Builds a subscription without callbacks; attach them in code.
    pub fn to_subscription(&self) -> SubscriptionConfig {
        let mut config = SubscriptionConfig::new(self.collection.clone())
            .parse_as(self.parse_as)
            .key_field(self.key_field.clone());
        if let Some(name) = &self.cache_name {
            config = config.cache_name(name.clone());
        }
        if let Some(kind) = self.transport {
            config = config.transport(kind);
        }
        config
    }
}

// =============================================================================
// Main Configuration
// =============================================================================

/// Complete configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MirrorConfig {
    #[serde(default)]
    pub engine: EngineSettings,

    #[serde(default)]
    pub relay: RelayConfig,

    #[serde(default)]
    pub collections: Vec<CollectionEntry>,
}

impl MirrorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, then environment, then validates.
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading mirror config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load mirror config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents).map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;

        info!(?path, "Mirror config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        let url = &self.relay.redis_url;
        if !url.starts_with("redis://") && !url.starts_with("rediss://") {
            return Err(SyncError::InvalidConfig(format!(
                "Redis URL must start with redis:// or rediss://, got: {}",
                url
            )));
        }

        if self.relay.scan_count == 0 || self.relay.fetch_batch_size == 0 {
            return Err(SyncError::InvalidConfig(
                "scan_count and fetch_batch_size must be greater than 0".into(),
            ));
        }

        if self.relay.max_reconnect_attempts == 0 {
            return Err(SyncError::InvalidConfig(
                "max_reconnect_attempts must be greater than 0".into(),
            ));
        }

        let mut shapes: HashMap<&str, ParseAs> = HashMap::new();
        for entry in &self.collections {
            if entry.collection.trim().is_empty() {
                return Err(SyncError::InvalidConfig("collection name is empty".into()));
            }

            if let Some(previous) = shapes.insert(entry.cache(), entry.parse_as) {
                if previous != entry.parse_as {
                    return Err(SyncError::InvalidConfig(format!(
                        "cache '{}' is declared as both {} and {}",
                        entry.cache(),
                        previous,
                        entry.parse_as
                    )));
                }
            }
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("MIRROR_REDIS_URL") {
            debug!(url = %url, "Overriding Redis URL from environment");
            self.relay.redis_url = url;
        }

        if let Ok(prefix) = std::env::var("MIRROR_CHANNEL_PREFIX") {
            self.relay.channel_prefix = prefix;
        }

        if let Ok(kind) = std::env::var("MIRROR_DEFAULT_TRANSPORT") {
            match kind.parse() {
                Ok(parsed) => {
                    debug!(transport = %kind, "Overriding default transport from environment");
                    self.engine.default_transport = parsed;
                }
                Err(_) => warn!(transport = %kind, "Unknown transport in environment"),
            }
        }

        if let Ok(attempts) = std::env::var("MIRROR_MAX_RECONNECT_ATTEMPTS") {
            if let Ok(n) = attempts.parse::<u32>() {
                self.relay.max_reconnect_attempts = n;
            }
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("dev", "mirror", "mirror")
            .map(|dirs| dirs.config_dir().join("sync.toml"))
    }

    /// Subscriptions for every declared collection.
    pub fn subscriptions(&self) -> Vec<SubscriptionConfig> {
        self.collections
            .iter()
            .map(CollectionEntry::to_subscription)
            .collect()
    }
}
