//! Tracker registry - holds signal-source plugins and drives their lifecycle.
//!
//! Sources are held only through the [`SignalSource`] capability trait. Each
//! one is isolated: a failing or panicking `init`, `get_data` or `cleanup`
//! is logged and never reaches the other sources or the engine.

use crate::config::EngineConfig;
use crate::error::SourceError;
use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Narrow emission interface the engine exposes to sources.
pub trait EventSink: Send + Sync {
    fn track(&self, kind: &str, payload: Value);
    /// Whether a live session is currently active (not idle).
    fn engaged(&self) -> bool;
}

/// Event-emission handle given to each source at init.
#[derive(Clone)]
pub struct TrackHandle {
    sink: Arc<dyn EventSink>,
}

impl TrackHandle {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink }
    }

    pub fn track(&self, kind: &str, payload: Value) {
        self.sink.track(kind, payload);
    }

    pub fn engaged(&self) -> bool {
        self.sink.engaged()
    }
}

impl std::fmt::Debug for TrackHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackHandle").finish_non_exhaustive()
    }
}

/// Capability set every signal source implements.
#[async_trait]
pub trait SignalSource: Send {
    async fn init(&mut self, handle: TrackHandle) -> Result<(), SourceError>;

    fn cleanup(&mut self) -> Result<(), SourceError>;

    /// Point-in-time snapshot merged into [`TrackerRegistry::collect`].
    fn get_data(&self) -> Result<Option<Value>, SourceError> {
        Ok(None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerLifecycle {
    Uninitialized,
    Initializing,
    Active,
    /// Init failed; the source is skipped but still cleaned up
    Failed,
    CleanedUp,
}

struct Registration {
    name: String,
    source: Box<dyn SignalSource>,
    lifecycle: TrackerLifecycle,
}

#[derive(Default)]
pub struct TrackerRegistry {
    registrations: Vec<Registration>,
}

impl TrackerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry from the enabled-sources list. Unknown names are skipped.
    pub fn from_config(config: &EngineConfig, catalog: &SourceCatalog) -> Self {
        let mut registry = Self::new();
        for name in &config.enabled_signal_sources {
            match catalog.get(name) {
                Some(factory) => {
                    registry.register(name, || factory(config));
                }
                None => warn!(source = %name, "unknown signal source, skipping"),
            }
        }
        registry
    }

    /// Register a source under a unique name. Returns false on a duplicate.
    pub fn register<F>(&mut self, name: &str, factory: F) -> bool
    where
        F: FnOnce() -> Box<dyn SignalSource>,
    {
        if self.registrations.iter().any(|r| r.name == name) {
            warn!(source = %name, "signal source already registered");
            return false;
        }
        debug!(source = %name, "signal source registered");
        self.registrations.push(Registration {
            name: name.to_string(),
            source: factory(),
            lifecycle: TrackerLifecycle::Uninitialized,
        });
        true
    }

    /// Initialize every uninitialized source. Returns how many are active.
    pub async fn init_all(&mut self, handle: &TrackHandle) -> usize {
        for reg in &mut self.registrations {
            if reg.lifecycle != TrackerLifecycle::Uninitialized {
                continue;
            }
            reg.lifecycle = TrackerLifecycle::Initializing;
            let init = AssertUnwindSafe(reg.source.init(handle.clone()))
                .catch_unwind()
                .await
                .unwrap_or(Err(SourceError::Panicked("init")));
            match init {
                Ok(()) => {
                    info!(source = %reg.name, "signal source active");
                    reg.lifecycle = TrackerLifecycle::Active;
                }
                Err(e) => {
                    warn!(source = %reg.name, error = %e, "signal source init failed, skipping");
                    reg.lifecycle = TrackerLifecycle::Failed;
                }
            }
        }
        self.active_count()
    }

    /// Merge each active source's snapshot, keyed by name.
    pub fn collect(&self) -> BTreeMap<String, Value> {
        let mut out = BTreeMap::new();
        for reg in &self.registrations {
            if reg.lifecycle != TrackerLifecycle::Active {
                continue;
            }
            let result = catch_unwind(AssertUnwindSafe(|| reg.source.get_data()))
                .unwrap_or(Err(SourceError::Panicked("get_data")));
            match result {
                Ok(Some(data)) => {
                    out.insert(reg.name.clone(), data);
                }
                Ok(None) => {}
                Err(e) => warn!(source = %reg.name, error = %e, "signal source collection failed"),
            }
        }
        out
    }

    /// Clean up every source exactly once, including ones whose init failed.
    pub fn cleanup_all(&mut self) -> usize {
        let mut cleaned = 0;
        for reg in &mut self.registrations {
            if reg.lifecycle == TrackerLifecycle::CleanedUp {
                continue;
            }
            let result = catch_unwind(AssertUnwindSafe(|| reg.source.cleanup()))
                .unwrap_or(Err(SourceError::Panicked("cleanup")));
            if let Err(e) = result {
                warn!(source = %reg.name, error = %e, "signal source cleanup failed");
            }
            reg.lifecycle = TrackerLifecycle::CleanedUp;
            cleaned += 1;
        }
        cleaned
    }

    pub fn lifecycle(&self, name: &str) -> Option<TrackerLifecycle> {
        self.registrations
            .iter()
            .find(|r| r.name == name)
            .map(|r| r.lifecycle)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.registrations.iter().map(|r| r.name.as_str())
    }

    pub fn active_count(&self) -> usize {
        self.registrations
            .iter()
            .filter(|r| r.lifecycle == TrackerLifecycle::Active)
            .count()
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}

impl std::fmt::Debug for TrackerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.registrations.iter().map(|r| (&r.name, r.lifecycle)))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// SourceCatalog
// ---------------------------------------------------------------------------

pub type SourceFactory = Arc<dyn Fn(&EngineConfig) -> Box<dyn SignalSource> + Send + Sync>;

/// Static name → factory table consulted when building the registry.
#[derive(Clone, Default)]
pub struct SourceCatalog {
    factories: HashMap<String, SourceFactory>,
}

impl SourceCatalog {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Catalog with the built-in sources (`heartbeat`, `environment`).
    pub fn builtin() -> Self {
        Self::empty()
            .with("heartbeat", |config| {
                Box::new(crate::sources::Heartbeat::from_config(config))
            })
            .with("environment", |_| {
                Box::new(crate::sources::Environment::default())
            })
    }

    pub fn with<F>(mut self, name: &str, factory: F) -> Self
    where
        F: Fn(&EngineConfig) -> Box<dyn SignalSource> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Arc::new(factory));
        self
    }

    pub fn get(&self, name: &str) -> Option<&SourceFactory> {
        self.factories.get(name)
    }
}

impl std::fmt::Debug for SourceCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.factories.keys()).finish()
    }
}
