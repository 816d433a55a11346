//! Trail - behavioral telemetry engine
//!
//! Manages session identity across restarts, derives idle/active state from
//! raw input signals, buffers events into ordered batches with at most one
//! delivery in flight, and ships them to an HTTP endpoint.

pub mod activity;
pub mod buffer;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
mod event;
pub mod ipc;
pub mod registry;
pub mod server;
pub mod session;
pub mod sources;
pub mod store;
pub mod transport;

pub use activity::{ActivityMonitor, ActivityStatus};
pub use buffer::{Batch, BatchKind, BatchState, DeliveryDiagnostic, EventBuffer};
pub use clock::{Clock, SystemClock};
pub use config::{EngineConfig, FailurePolicy};
pub use engine::{Engine, TeardownSummary};
pub use error::{ConfigError, DeliveryError, SourceError, StoreError};
pub use event::*;
pub use registry::{EventSink, SignalSource, SourceCatalog, TrackHandle, TrackerRegistry};
pub use session::{EndReason, Session, SessionManager, SessionState};
pub use store::{BestEffortStore, FileStore, MemoryStore, PersistenceStore};
pub use transport::{DiscardTransport, HttpTransport, Transport, WirePayload};
