//! Engine - the explicit context object hosts construct once and share.
//!
//! Wires the session manager, activity monitor, event buffer, tracker
//! registry and transport together, and owns the three scheduled tasks
//! (activity poll, flush tick, session check). Every host-facing operation
//! is infallible: failures are logged and degrade functionality.
//!
//! State lives behind a `std::sync::Mutex` that is never held across an
//! `.await`; delivery runs on a spawned task that re-enters the lock to
//! report completion.

use crate::activity::{ActivityMonitor, ActivityStatus};
use crate::buffer::{Batch, Completion, DeliveryDiagnostic, EventBuffer};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::DeliveryError;
use crate::event::{ActivitySignal, NormalizedEvent, TRACKER_SNAPSHOT};
use crate::registry::{EventSink, TrackHandle, TrackerRegistry};
use crate::session::{EndReason, Session, SessionManager, SessionState, Transition};
use crate::store::BestEffortStore;
use crate::transport::{Transport, WirePayload};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

/// What the final unload-safe flush did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeardownSummary {
    /// Payloads handed to `send_beacon`
    pub payloads: usize,
    /// Whether every payload was queued
    pub all_queued: bool,
    pub sources_cleaned: usize,
}

struct Core {
    sessions: SessionManager,
    buffer: EventBuffer,
    monitor: ActivityMonitor,
    /// The session manager's subscription to the activity monitor
    activity_rx: watch::Receiver<ActivityStatus>,
    delivery: Option<JoinHandle<()>>,
}

struct Inner {
    config: EngineConfig,
    core: Mutex<Core>,
    trackers: tokio::sync::Mutex<TrackerRegistry>,
    transport: Arc<dyn Transport>,
    store: Arc<BestEffortStore>,
    clock: Arc<dyn Clock>,
    started: AtomicBool,
    torn_down: AtomicBool,
    timers: Mutex<Vec<JoinHandle<()>>>,
}

/// Cheaply cloneable handle to one engine instance.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        store: Arc<BestEffortStore>,
        clock: Arc<dyn Clock>,
        trackers: TrackerRegistry,
    ) -> Self {
        let now = clock.now_ms();
        let monitor = ActivityMonitor::new(config.idle_threshold_ms, now);
        let activity_rx = monitor.subscribe();
        let core = Core {
            sessions: SessionManager::new(config.session_timeout_ms, Arc::clone(&store)),
            buffer: EventBuffer::from_config(&config, Arc::clone(&store)),
            monitor,
            activity_rx,
            delivery: None,
        };
        Self {
            inner: Arc::new(Inner {
                config,
                core: Mutex::new(core),
                trackers: tokio::sync::Mutex::new(trackers),
                transport,
                store,
                clock,
                started: AtomicBool::new(false),
                torn_down: AtomicBool::new(false),
                timers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Restore persisted state, initialize signal sources and start the
    /// scheduled tasks. Calling it again is a no-op.
    pub async fn start(&self) {
        let inner = &self.inner;
        if inner.torn_down.load(Ordering::SeqCst) || inner.started.swap(true, Ordering::SeqCst) {
            debug!("engine already started");
            return;
        }

        let now = inner.clock.now_ms();
        inner.with_core(|core| {
            core.buffer.restore();
            if core.sessions.current().is_none() {
                for transition in core.sessions.start(now) {
                    inner.apply(core, Some(transition), now);
                }
            }
            inner.pump(core, now);
        });

        let handle = TrackHandle::new(Arc::new(EngineSink {
            inner: Arc::downgrade(inner),
        }));
        let active = inner.trackers.lock().await.init_all(&handle).await;

        let timers = vec![
            inner.spawn_timer(inner.config.activity_poll(), Inner::poll_activity),
            inner.spawn_timer(inner.config.flush_tick(), Inner::flush_tick),
            inner.spawn_timer(inner.config.session_check(), Inner::check_session),
        ];
        if let Ok(mut slot) = inner.timers.lock() {
            slot.extend(timers);
        }
        info!(
            sources = active,
            degraded_storage = inner.store.is_degraded(),
            "engine started"
        );
    }

    /// Normalize, tag and buffer an event.
    pub fn track(&self, kind: &str, payload: Value) {
        self.inner.track(kind, payload);
    }

    /// Feed a raw input signal. The session sees it on the next activity
    /// poll.
    pub fn record_activity(&self, signal: ActivitySignal) {
        let inner = &self.inner;
        if inner.is_torn_down() {
            return;
        }
        let now = inner.clock.now_ms();
        inner.with_core(|core| core.monitor.record(signal, now));
    }

    /// Feed a visibility change. Regaining visibility re-validates the
    /// session timeout before counting as activity.
    pub fn set_visibility(&self, hidden: bool) {
        let inner = &self.inner;
        if inner.is_torn_down() {
            return;
        }
        let now = inner.clock.now_ms();
        inner.with_core(|core| {
            let was_hidden = core.monitor.is_hidden();
            if was_hidden && !hidden {
                let transition = core.sessions.check_timeout(now);
                inner.apply(core, transition, now);
            }
            core.monitor.set_visibility(hidden, now);
            inner.refresh_activity(core, now);
        });
    }

    /// Seal everything pending and send it, ignoring thresholds.
    pub fn flush(&self) {
        let inner = &self.inner;
        if inner.is_torn_down() {
            return;
        }
        let now = inner.clock.now_ms();
        inner.with_core(|core| {
            if let Some(batch) = core.buffer.flush(now) {
                inner.dispatch(core, batch, now);
            }
        });
    }

    /// Current snapshot of every active signal source.
    pub async fn collect(&self) -> BTreeMap<String, Value> {
        self.inner.trackers.lock().await.collect()
    }

    /// End the session and hand everything unflushed to unload-safe
    /// delivery. Runs once; later calls return `None`.
    pub async fn teardown(&self, reason: EndReason) -> Option<TeardownSummary> {
        let inner = &self.inner;
        if inner.torn_down.swap(true, Ordering::SeqCst) {
            debug!("teardown already ran");
            return None;
        }
        info!(reason = reason.as_str(), "engine teardown");

        if let Ok(mut timers) = inner.timers.lock() {
            for timer in timers.drain(..) {
                timer.abort();
            }
        }

        let (snapshot, sources_cleaned) = {
            let mut trackers = inner.trackers.lock().await;
            let snapshot = trackers.collect();
            (snapshot, trackers.cleanup_all())
        };

        let now = inner.clock.now_ms();
        let batches = inner
            .with_core(|core| {
                if let Some(delivery) = core.delivery.take() {
                    debug!("aborting in-flight delivery");
                    delivery.abort();
                }
                if !snapshot.is_empty() && core.sessions.current().is_some() {
                    let (session_id, _) = core.sessions.tag_event(now);
                    let payload = serde_json::to_value(&snapshot).unwrap_or(Value::Null);
                    core.buffer.enqueue(
                        NormalizedEvent::new(TRACKER_SNAPSHOT, now, session_id, payload),
                        now,
                    );
                }
                let transition = core.sessions.end(reason, now);
                if let Some(Transition::Ended(event)) = transition {
                    core.buffer.enqueue_terminal(event, now);
                }
                core.buffer.drain_all()
            })
            .unwrap_or_default();

        let mut all_queued = true;
        for batch in &batches {
            let payload = WirePayload::from_batch(batch, now);
            if !inner.transport.send_beacon(&payload) {
                warn!(batch_id = batch.id, events = batch.len(), "beacon not queued");
                all_queued = false;
            }
        }
        if all_queued {
            inner.with_core(|core| core.buffer.clear_persisted());
        } else {
            warn!("unflushed events kept in storage for the next start");
        }

        let summary = TeardownSummary {
            payloads: batches.len(),
            all_queued,
            sources_cleaned,
        };
        info!(
            payloads = summary.payloads,
            all_queued, sources_cleaned, "engine torn down"
        );
        Some(summary)
    }

    /// Copy of the live session record.
    pub fn session(&self) -> Option<Session> {
        self.inner
            .with_core(|core| core.sessions.current().cloned())
            .flatten()
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner
            .with_core(|core| core.sessions.current_id().map(str::to_string))
            .flatten()
    }

    pub fn session_state(&self) -> Option<SessionState> {
        self.inner
            .with_core(|core| core.sessions.state())
            .flatten()
    }

    /// Last status published by the activity monitor.
    pub fn activity_status(&self) -> Option<ActivityStatus> {
        self.inner.with_core(|core| core.monitor.current())
    }

    /// Batches dropped after exhausting their delivery attempts.
    pub fn diagnostics(&self) -> Vec<DeliveryDiagnostic> {
        self.inner
            .with_core(|core| core.buffer.diagnostics().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_torn_down(&self) -> bool {
        self.inner.is_torn_down()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("started", &self.inner.started.load(Ordering::Relaxed))
            .field("torn_down", &self.inner.is_torn_down())
            .field("store", &self.inner.store)
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    fn with_core<R>(&self, f: impl FnOnce(&mut Core) -> R) -> Option<R> {
        match self.core.lock() {
            Ok(mut core) => Some(f(&mut core)),
            Err(_) => {
                warn!("engine state lock poisoned");
                None
            }
        }
    }

    fn track(self: &Arc<Self>, kind: &str, payload: Value) {
        if self.is_torn_down() {
            debug!(kind, "event after teardown dropped");
            return;
        }
        let now = self.clock.now_ms();
        self.with_core(|core| {
            let (session_id, started) = core.sessions.tag_event(now);
            if started.is_some() {
                // A lazily started session inherits the published idle state
                let status = core.monitor.current();
                core.sessions.observe(status, now);
            }
            core.buffer
                .enqueue(NormalizedEvent::new(kind, now, session_id, payload), now);
            self.pump(core, now);
        });
    }

    fn engaged(&self) -> bool {
        self.with_core(|core| core.sessions.state() == Some(SessionState::Active))
            .unwrap_or(false)
    }

    /// Recompute the activity status and feed any change to the session manager.
    fn refresh_activity(self: &Arc<Self>, core: &mut Core, now: u64) {
        core.monitor.poll(now);
        if !core.activity_rx.has_changed().unwrap_or(false) {
            return;
        }
        let status = *core.activity_rx.borrow_and_update();
        let transition = core.sessions.observe(status, now);
        self.apply(core, transition, now);
    }

    fn apply(self: &Arc<Self>, core: &mut Core, transition: Option<Transition>, now: u64) {
        if let Some(Transition::Ended(event)) = transition {
            core.buffer.enqueue_terminal(event, now);
            self.pump(core, now);
        }
    }

    fn pump(self: &Arc<Self>, core: &mut Core, now: u64) {
        if let Some(batch) = core.buffer.maybe_flush(now) {
            self.dispatch(core, batch, now);
        }
    }

    fn dispatch(self: &Arc<Self>, core: &mut Core, batch: Batch, now: u64) {
        let batch_id = batch.id;
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(batch_id, "no runtime available for delivery");
            core.buffer.release(batch_id);
            return;
        };
        let payload = WirePayload::from_batch(&batch, now);
        let transport = Arc::clone(&self.transport);
        let weak = Arc::downgrade(self);
        core.delivery = Some(runtime.spawn(async move {
            let result = transport.send(&payload).await;
            if let Some(inner) = weak.upgrade() {
                inner.on_delivered(batch_id, result);
            }
        }));
    }

    fn on_delivered(self: &Arc<Self>, batch_id: u64, result: Result<(), DeliveryError>) {
        let now = self.clock.now_ms();
        self.with_core(|core| {
            core.delivery = None;
            let (completion, next) = core.buffer.complete(batch_id, result, now);
            match &completion {
                Completion::Delivered(batch) => {
                    trace!(batch_id, events = batch.len(), "delivery confirmed");
                }
                Completion::Retrying { retry_at, .. } => {
                    debug!(batch_id, retry_in_ms = retry_at.saturating_sub(now), "retry scheduled");
                }
                Completion::Requeued { .. } | Completion::Dropped(_) | Completion::Stale => {}
            }
            if let Some(next) = next {
                self.dispatch(core, next, now);
            }
        });
    }

    fn poll_activity(self: &Arc<Self>) {
        let now = self.clock.now_ms();
        self.with_core(|core| self.refresh_activity(core, now));
    }

    fn flush_tick(self: &Arc<Self>) {
        let now = self.clock.now_ms();
        self.with_core(|core| self.pump(core, now));
    }

    fn check_session(self: &Arc<Self>) {
        let now = self.clock.now_ms();
        self.with_core(|core| {
            let transition = core.sessions.check_timeout(now);
            self.apply(core, transition, now);
        });
    }

    fn spawn_timer(self: &Arc<Self>, period: Duration, tick: fn(&Arc<Inner>)) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if inner.is_torn_down() {
                    break;
                }
                tick(&inner);
            }
        })
    }
}

/// Sink handed to signal sources. Holds the engine weakly so a source
/// never keeps a torn-down engine alive.
struct EngineSink {
    inner: Weak<Inner>,
}

impl EventSink for EngineSink {
    fn track(&self, kind: &str, payload: Value) {
        if let Some(inner) = self.inner.upgrade() {
            inner.track(kind, payload);
        }
    }

    fn engaged(&self) -> bool {
        self.inner.upgrade().is_some_and(|inner| inner.engaged())
    }
}
