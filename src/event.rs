//! Event types
//!
//! [`NormalizedEvent`] is what the engine buffers and ships. [`HostMessage`]
//! is what a host process sends over the local socket: tracked events plus
//! the raw signals (input, visibility, unload) the engine derives sessions from.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event type emitted when a session ends.
pub const SESSION_END: &str = "session_end";
/// Event type carrying the tracker `collect()` snapshot at teardown.
pub const TRACKER_SNAPSHOT: &str = "tracker_snapshot";

/// A normalized telemetry event. Immutable once enqueued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedEvent {
    #[serde(rename = "type")]
    pub kind: String,
    /// Capture time, epoch millis.
    pub timestamp: u64,
    /// Assigned by the session manager at enqueue time.
    pub session_id: String,
    #[serde(default)]
    pub payload: Value,
}

impl NormalizedEvent {
    pub fn new(
        kind: impl Into<String>,
        timestamp: u64,
        session_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            kind: kind.into(),
            timestamp,
            session_id: session_id.into(),
            payload,
        }
    }

    pub fn is_session_end(&self) -> bool {
        self.kind == SESSION_END
    }
}

/// Raw user input signal observed by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivitySignal {
    PointerMove,
    KeyInput,
    Scroll,
    Touch,
}

/// Host-to-engine message, sent as newline-delimited JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    /// A signal source event to normalize and buffer
    Track {
        event: String,
        #[serde(default)]
        payload: Value,
    },
    /// User input was observed
    Activity { signal: ActivitySignal },
    /// Host visibility changed
    Visibility { hidden: bool },
    /// Request an immediate flush
    Flush,
    /// Host is being torn down
    Unload,
}
