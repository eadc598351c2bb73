//! # Sync Error Types
//!
//! Error types for transports, the dispatcher and the engine.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Transport     │  │     Protocol            │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Connection     │  │  InvalidMessage         │ │
//! │  │  ConfigLoad/Save│  │  Disconnected   │  │  Deserialization        │ │
//! │  │  TransportUnav. │  │  Redis          │  │  Serialization          │ │
//! │  │                 │  │  FeedClosed     │  │                         │ │
//! │  │                 │  │  ReconnectExh.  │  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────────────────────────────────┐  │
//! │  │     Apply       │  │               Internal                      │  │
//! │  │                 │  │                                             │  │
//! │  │  Core (store)   │  │  ChannelError                               │  │
//! │  │  Listener       │  │                                             │  │
//! │  └─────────────────┘  └─────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use mirror_core::{ChangeKind, CoreError};
use thiserror::Error;

use crate::transport::TransportKind;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all transport, dispatch and engine failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid engine or subscription configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    /// A subscription asked for a transport the engine was not built with.
    #[error("Transport not configured: {0}")]
    TransportUnavailable(TransportKind),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// Failed to establish a connection.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection dropped while in use.
    #[error("Disconnected: {0}")]
    Disconnected(String),

    /// Redis command failed.
    #[error("Redis error: {0}")]
    Redis(String),

    /// Change feed closed before delivering its first snapshot.
    #[error("Change feed for '{0}' closed before its first snapshot")]
    FeedClosed(String),

    /// Reconnect ceiling reached; the connection is degraded for good.
    #[error("Gave up reconnecting {connection} after {attempts} attempts")]
    ReconnectExhausted { connection: String, attempts: u32 },

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// Message decoded but semantically invalid.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Failed to serialize a message or record.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// Failed to deserialize a message or stored value.
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    // =========================================================================
    // Apply Errors
    // =========================================================================
    /// The default storage mutation failed.
    #[error("Cache error: {0}")]
    Core(#[from] CoreError),

    /// A listener returned an error; later listeners for the event were skipped.
    #[error("Listener failed for {collection} ({kind}): {message}")]
    Listener {
        collection: String,
        kind: ChangeKind,
        message: String,
    },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<redis::RedisError> for SyncError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_refusal() {
            SyncError::ConnectionFailed(err.to_string())
        } else if err.is_connection_dropped() || err.is_io_error() || err.is_timeout() {
            SyncError::Disconnected(err.to_string())
        } else {
            SyncError::Redis(err.to_string())
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_io() {
            SyncError::SerializationFailed(err.to_string())
        } else {
            SyncError::DeserializationFailed(err.to_string())
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true if the failure is a connection problem worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::ConnectionFailed(_) | SyncError::Disconnected(_)
        )
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
                | SyncError::TransportUnavailable(_)
        )
    }

    /// Returns true if this error indicates a malformed payload.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidMessage(_)
                | SyncError::SerializationFailed(_)
                | SyncError::DeserializationFailed(_)
        )
    }
}
