//! Time source for the engine.
//!
//! Components take `now_ms` explicitly; only the engine reads a [`Clock`].

use chrono::{DateTime, Utc};
use std::time::{SystemTime, UNIX_EPOCH};

/// Epoch-millisecond time source.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Wall clock anchored at construction and advanced by the tokio clock.
///
/// Deriving elapsed time from `tokio::time::Instant` keeps timestamps and
/// timers consistent, including under a paused test runtime.
#[derive(Debug, Clone)]
pub struct SystemClock {
    base_epoch_ms: u64,
    base: tokio::time::Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        let base_epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self {
            base_epoch_ms,
            base: tokio::time::Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.base_epoch_ms + self.base.elapsed().as_millis() as u64
    }
}

/// Render an epoch-millisecond timestamp as RFC 3339 for log output.
pub fn format_epoch_ms(ms: u64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms as i64)
        .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
        .unwrap_or_else(|| ms.to_string())
}
