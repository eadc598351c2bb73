//! # Reconnect Policy
//!
//! Connection state machine used by the relay transport's two Redis
//! connections, kept free of any network types so it can be tested on
//! its own.
//!
//! ## State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Relay Connection States                              │
//! │                                                                         │
//! │  ┌────────────┐   success    ┌────────────┐                            │
//! │  │ Connecting │ ───────────► │ Connected  │                            │
//! │  └─────┬──────┘              └─────┬──────┘                            │
//! │        │ failure                   │ connection lost                    │
//! │        ▼                           ▼                                    │
//! │  ┌────────────┐  delay_for(n) = Some(d)                                │
//! │  │ BackingOff │ ◄──────────────────┘                                   │
//! │  └─────┬──────┘                                                         │
//! │        │ timer expired ──► Connecting                                   │
//! │        │                                                                │
//! │        │ delay_for(n) = None  (n > max_attempts)                        │
//! │        ▼                                                                │
//! │  ┌────────────┐                                                         │
//! │  │  GivenUp   │  terminal until process restart                        │
//! │  └────────────┘                                                         │
//! │                                                                         │
//! │  BACKOFF (defaults)                                                    │
//! │  Attempt 1: 200ms   Attempt 2: 400ms   Attempt 3: 800ms                │
//! │  Attempt 4: 1.6s    Attempt 5: 3.2s    Attempt 6: give up              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Fixed reconnect ceiling.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

// =============================================================================
// Connection State
// =============================================================================

/// Lifecycle state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    BackingOff,
    /// Retries exhausted; nothing further will be delivered.
    GivenUp,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::BackingOff => write!(f, "backing_off"),
            ConnectionState::GivenUp => write!(f, "given_up"),
        }
    }
}

// =============================================================================
// Policy
// =============================================================================

/// Maps a 1-based attempt number to a delay, or `None` past the ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt`.
    ///
    /// Doubles from `initial_delay`, capped at `max_delay`. Attempt 0 is
    /// treated as attempt 1.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        let attempt = attempt.max(1);
        if attempt > self.max_attempts {
            return None;
        }

        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        let delay = self
            .initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay);
        Some(delay.min(self.max_delay))
    }
}

// =============================================================================
// Tracker
// =============================================================================

/// Attempt counter plus current state for one connection.
#[derive(Debug, Clone)]
pub struct ReconnectTracker {
    policy: ReconnectPolicy,
    attempts: u32,
    state: ConnectionState,
}

impl ReconnectTracker {
    pub fn new(policy: ReconnectPolicy) -> Self {
        ReconnectTracker {
            policy,
            attempts: 0,
            state: ConnectionState::Connecting,
        }
    }

    /// Connection established; the attempt counter resets.
    pub fn connected(&mut self) {
        self.attempts = 0;
        self.state = ConnectionState::Connected;
    }

    /// Connect attempt failed or an open connection dropped.
    ///
    /// Returns the delay to wait before retrying, or `None` once the
    /// ceiling is passed (the tracker is then `GivenUp` for good).
    pub fn failed(&mut self) -> Option<Duration> {
        if self.state == ConnectionState::GivenUp {
            return None;
        }

        self.attempts += 1;
        match self.policy.delay_for(self.attempts) {
            Some(delay) => {
                self.state = ConnectionState::BackingOff;
                Some(delay)
            }
            None => {
                self.state = ConnectionState::GivenUp;
                None
            }
        }
    }

    /// Backoff elapsed; a new attempt begins.
    pub fn retrying(&mut self) {
        if self.state != ConnectionState::GivenUp {
            self.state = ConnectionState::Connecting;
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_given_up(&self) -> bool {
        self.state == ConnectionState::GivenUp
    }
}
