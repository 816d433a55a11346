//! Built-in signal sources
//!
//! - `heartbeat`: periodic engagement ping while the session is active.
//! - `environment`: static host description reported through `get_data`.

use crate::config::EngineConfig;
use crate::error::SourceError;
use crate::registry::{SignalSource, TrackHandle};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::trace;

/// Emits a `heartbeat` event every interval, skipping beats while idle.
#[derive(Debug)]
pub struct Heartbeat {
    interval: Duration,
    beats: Arc<AtomicU64>,
    task: Option<JoinHandle<()>>,
}

impl Heartbeat {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            beats: Arc::new(AtomicU64::new(0)),
            task: None,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(Duration::from_millis(config.heartbeat_interval_ms))
    }
}

#[async_trait]
impl SignalSource for Heartbeat {
    async fn init(&mut self, handle: TrackHandle) -> Result<(), SourceError> {
        if self.interval.is_zero() {
            return Err(SourceError::Init("heartbeat interval must be non-zero".into()));
        }
        let interval = self.interval;
        let beats = Arc::clone(&self.beats);
        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !handle.engaged() {
                    trace!("heartbeat skipped while idle");
                    continue;
                }
                let seq = beats.fetch_add(1, Ordering::Relaxed) + 1;
                handle.track("heartbeat", json!({ "seq": seq }));
            }
        }));
        Ok(())
    }

    fn cleanup(&mut self) -> Result<(), SourceError> {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        Ok(())
    }

    fn get_data(&self) -> Result<Option<Value>, SourceError> {
        Ok(Some(json!({ "beats": self.beats.load(Ordering::Relaxed) })))
    }
}

/// Reports the host platform. Emits no events.
#[derive(Debug, Default)]
pub struct Environment;

#[async_trait]
impl SignalSource for Environment {
    async fn init(&mut self, _handle: TrackHandle) -> Result<(), SourceError> {
        Ok(())
    }

    fn cleanup(&mut self) -> Result<(), SourceError> {
        Ok(())
    }

    fn get_data(&self) -> Result<Option<Value>, SourceError> {
        let locale = std::env::var("LC_ALL")
            .or_else(|_| std::env::var("LANG"))
            .ok()
            .filter(|v| !v.is_empty());
        Ok(Some(json!({
            "os": std::env::consts::OS,
            "arch": std::env::consts::ARCH,
            "family": std::env::consts::FAMILY,
            "locale": locale,
            "agentVersion": env!("CARGO_PKG_VERSION"),
        })))
    }
}
