//! Error taxonomy
//!
//! None of these ever reach the host: boundary operations log them and
//! degrade. They exist so internal seams can use `?` and so tests can match.

use thiserror::Error;

/// PersistenceStore failure (quota, disabled storage, bad record).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("record encoding failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// TransportClient failure for one delivery attempt.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("network error: {0}")]
    Network(String),
    #[error("endpoint returned status {0}")]
    Status(u16),
    #[error("payload encoding failed: {0}")]
    Encode(String),
    #[error("delivery cancelled")]
    Cancelled,
}

/// Signal source failure, isolated per source.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("init failed: {0}")]
    Init(String),
    #[error("data collection failed: {0}")]
    Collect(String),
    #[error("cleanup failed: {0}")]
    Cleanup(String),
    #[error("source panicked during {0}")]
    Panicked(&'static str),
}

/// Invalid or unreadable configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("config io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse failed: {0}")]
    Parse(#[from] serde_json::Error),
}
