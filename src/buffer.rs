//! Event buffer - accumulates normalized events and seals them into batches.
//!
//! Pending events are sealed when the batch reaches `max_batch_size`, when
//! the oldest pending event is older than `flush_interval_ms`, or on an
//! explicit flush. Sealed batches leave in the order they were sealed, one
//! at a time: a flush requested while a batch is in flight is remembered and
//! runs on the then-current pending events as soon as the batch completes.
//!
//! Failed batches go back to the front of the queue and wait out an
//! exponential backoff. Once attempts are exhausted they are dropped (with a
//! local diagnostic) or requeued, per [`FailurePolicy`].
//!
//! All unflushed events (in flight, sealed, pending) are mirrored to the
//! store under [`BATCH_KEY`] so a restart can pick them up.

use crate::config::{EngineConfig, FailurePolicy};
use crate::error::DeliveryError;
use crate::event::NormalizedEvent;
use crate::store::{BATCH_KEY, BestEffortStore};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Maximum number of delivery diagnostics kept in memory
const DIAGNOSTICS_MAX: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Pending,
    InFlight,
    Delivered,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BatchKind {
    #[default]
    Batch,
    SessionEnd,
}

impl BatchKind {
    /// `type` field of the wire payload
    pub fn wire_type(&self) -> &'static str {
        match self {
            Self::Batch => "batch",
            Self::SessionEnd => "session_end",
        }
    }
}

/// A sealed, ordered group of events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    pub id: u64,
    #[serde(default)]
    pub kind: BatchKind,
    pub events: Vec<NormalizedEvent>,
    pub state: BatchState,
    #[serde(default)]
    pub attempts: u32,
}

impl Batch {
    fn sealed(id: u64, kind: BatchKind, events: Vec<NormalizedEvent>) -> Self {
        Self {
            id,
            kind,
            events,
            state: BatchState::Pending,
            attempts: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub on_exhausted: FailurePolicy,
}

impl RetryPolicy {
    /// Delay before the next attempt, doubling per failed attempt.
    pub fn backoff_for(&self, attempts: u32) -> u64 {
        let exp = attempts.saturating_sub(1).min(20);
        self.backoff_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_backoff_ms)
    }
}

/// Local record of a batch dropped after exhausting its attempts. Never re-sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryDiagnostic {
    pub batch_id: u64,
    pub events: usize,
    pub attempts: u32,
    pub error: String,
    pub at: u64,
}

/// Result of completing the in-flight batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Delivered(Batch),
    Retrying {
        batch_id: u64,
        attempt: u32,
        retry_at: u64,
    },
    Requeued {
        batch_id: u64,
    },
    Dropped(DeliveryDiagnostic),
    /// The id did not match the in-flight batch
    Stale,
}

#[derive(Debug)]
pub struct EventBuffer {
    max_batch_size: usize,
    flush_interval_ms: u64,
    retry: RetryPolicy,
    pending: Vec<NormalizedEvent>,
    /// When the oldest pending event was enqueued
    oldest_at: Option<u64>,
    sealed: VecDeque<Batch>,
    in_flight: Option<Batch>,
    flush_requested: bool,
    retry_at: Option<u64>,
    next_id: u64,
    diagnostics: VecDeque<DeliveryDiagnostic>,
    store: Arc<BestEffortStore>,
}

impl EventBuffer {
    pub fn new(
        max_batch_size: usize,
        flush_interval_ms: u64,
        retry: RetryPolicy,
        store: Arc<BestEffortStore>,
    ) -> Self {
        Self {
            max_batch_size: max_batch_size.max(1),
            flush_interval_ms,
            retry,
            pending: Vec::new(),
            oldest_at: None,
            sealed: VecDeque::new(),
            in_flight: None,
            flush_requested: false,
            retry_at: None,
            next_id: 1,
            diagnostics: VecDeque::new(),
            store,
        }
    }

    pub fn from_config(config: &EngineConfig, store: Arc<BestEffortStore>) -> Self {
        let retry = RetryPolicy {
            max_attempts: config.max_delivery_attempts,
            backoff_ms: config.retry_backoff_ms,
            max_backoff_ms: config.max_retry_backoff_ms,
            on_exhausted: config.failure_policy,
        };
        Self::new(
            config.max_batch_size,
            config.flush_interval_ms,
            retry,
            store,
        )
    }

    /// Reload unflushed events persisted by a previous run.
    pub fn restore(&mut self) -> usize {
        let Some(record) = self.store.get_json::<Batch>(BATCH_KEY) else {
            return 0;
        };
        let count = record.events.len();
        if count > 0 {
            info!(events = count, "restored unflushed events");
            let batches = self.seal_events(record.events);
            self.sealed.extend(batches);
        }
        count
    }

    /// Append an event to the pending batch. Never blocks or drops.
    pub fn enqueue(&mut self, event: NormalizedEvent, now: u64) {
        trace!(kind = %event.kind, session_id = %event.session_id, "enqueue");
        if self.pending.is_empty() {
            self.oldest_at = Some(now);
        }
        self.pending.push(event);
        self.persist();
    }

    /// Append a terminal event and seal everything pending, so the events of
    /// the ending session leave ahead of the `session_end` batch.
    pub fn enqueue_terminal(&mut self, event: NormalizedEvent, now: u64) {
        if self.pending.is_empty() {
            self.oldest_at = Some(now);
        }
        self.pending.push(event);
        self.seal_pending();
        self.persist();
    }

    fn should_seal(&self, now: u64) -> bool {
        if self.pending.is_empty() {
            return false;
        }
        self.flush_requested
            || self.pending.len() >= self.max_batch_size
            || self
                .oldest_at
                .is_some_and(|t| now.saturating_sub(t) >= self.flush_interval_ms)
    }

    /// Evaluate the flush triggers. Returns the batch to send, if any; the
    /// returned batch is now in flight and must be passed to [`Self::complete`].
    pub fn maybe_flush(&mut self, now: u64) -> Option<Batch> {
        if self.in_flight.is_some() {
            if self.should_seal(now) && !self.flush_requested {
                debug!("flush requested while batch in flight");
                self.flush_requested = true;
            }
            return None;
        }
        if self.should_seal(now) {
            self.seal_pending();
        }
        self.dispatch(now)
    }

    /// Flush regardless of thresholds and retry backoff.
    pub fn flush(&mut self, now: u64) -> Option<Batch> {
        if self.in_flight.is_some() {
            self.flush_requested = true;
            return None;
        }
        self.seal_pending();
        self.retry_at = None;
        self.dispatch(now)
    }

    fn dispatch(&mut self, now: u64) -> Option<Batch> {
        if self.retry_at.is_some_and(|t| now < t) {
            return None;
        }
        let mut batch = self.sealed.pop_front()?;
        self.retry_at = None;
        batch.state = BatchState::InFlight;
        batch.attempts += 1;
        debug!(
            batch_id = batch.id,
            events = batch.len(),
            attempt = batch.attempts,
            "batch in flight"
        );
        self.in_flight = Some(batch.clone());
        Some(batch)
    }

    /// Record the outcome of the in-flight batch. Returns the next batch to
    /// send when a flush was queued behind it.
    pub fn complete(
        &mut self,
        batch_id: u64,
        result: Result<(), DeliveryError>,
        now: u64,
    ) -> (Completion, Option<Batch>) {
        let Some(mut batch) = self.in_flight.take_if(|b| b.id == batch_id) else {
            debug!(batch_id, "completion for unknown batch ignored");
            return (Completion::Stale, None);
        };

        let completion = match result {
            Ok(()) => {
                batch.state = BatchState::Delivered;
                debug!(batch_id, events = batch.len(), "batch delivered");
                Completion::Delivered(batch)
            }
            Err(e) if batch.attempts < self.retry.max_attempts => {
                let retry_at = now + self.retry.backoff_for(batch.attempts);
                debug!(batch_id, attempt = batch.attempts, error = %e, "delivery failed, will retry");
                let attempt = batch.attempts;
                batch.state = BatchState::Pending;
                self.sealed.push_front(batch);
                self.retry_at = Some(retry_at);
                Completion::Retrying {
                    batch_id,
                    attempt,
                    retry_at,
                }
            }
            Err(e) => {
                batch.state = BatchState::Failed;
                match self.retry.on_exhausted {
                    FailurePolicy::Drop => {
                        warn!(batch_id, events = batch.len(), attempts = batch.attempts, error = %e, "dropping batch");
                        let diagnostic = DeliveryDiagnostic {
                            batch_id,
                            events: batch.len(),
                            attempts: batch.attempts,
                            error: e.to_string(),
                            at: now,
                        };
                        self.diagnostics.push_back(diagnostic.clone());
                        while self.diagnostics.len() > DIAGNOSTICS_MAX {
                            self.diagnostics.pop_front();
                        }
                        Completion::Dropped(diagnostic)
                    }
                    FailurePolicy::Requeue => {
                        warn!(batch_id, error = %e, "requeueing batch after exhausted attempts");
                        batch.state = BatchState::Pending;
                        batch.attempts = 0;
                        self.sealed.push_front(batch);
                        self.retry_at = Some(now + self.retry.max_backoff_ms);
                        Completion::Requeued { batch_id }
                    }
                }
            }
        };

        let next = if matches!(completion, Completion::Delivered(_)) {
            if self.flush_requested {
                self.seal_pending();
            }
            self.dispatch(now)
        } else {
            None
        };
        self.persist();
        (completion, next)
    }

    /// Put the in-flight batch back at the front of the queue when it was
    /// never handed to the transport. The attempt it was charged is refunded
    /// and no backoff applies.
    pub fn release(&mut self, batch_id: u64) -> bool {
        let Some(mut batch) = self.in_flight.take_if(|b| b.id == batch_id) else {
            return false;
        };
        debug!(batch_id, "batch released unsent");
        batch.state = BatchState::Pending;
        batch.attempts = batch.attempts.saturating_sub(1);
        self.sealed.push_front(batch);
        true
    }

    /// Take every unflushed event out of the buffer, in delivery order.
    /// Used by teardown, which hands them to unload-safe delivery.
    pub fn drain_all(&mut self) -> Vec<Batch> {
        self.seal_pending();
        let mut out = Vec::with_capacity(self.sealed.len() + 1);
        if let Some(mut batch) = self.in_flight.take() {
            batch.state = BatchState::Pending;
            out.push(batch);
        }
        out.extend(self.sealed.drain(..));
        self.retry_at = None;
        out
    }

    /// Forget the persisted unflushed-events record.
    pub fn clear_persisted(&self) {
        self.store.remove(BATCH_KEY);
    }

    fn seal_pending(&mut self) {
        self.flush_requested = false;
        self.oldest_at = None;
        if self.pending.is_empty() {
            return;
        }
        let events = std::mem::take(&mut self.pending);
        let batches = self.seal_events(events);
        self.sealed.extend(batches);
    }

    /// Split events into batches of at most `max_batch_size`; each
    /// `session_end` event becomes its own batch.
    fn seal_events(&mut self, events: Vec<NormalizedEvent>) -> Vec<Batch> {
        let mut batches = Vec::new();
        let mut chunk = Vec::new();
        for event in events {
            if event.is_session_end() {
                if !chunk.is_empty() {
                    batches.push(self.new_batch(BatchKind::Batch, std::mem::take(&mut chunk)));
                }
                batches.push(self.new_batch(BatchKind::SessionEnd, vec![event]));
                continue;
            }
            chunk.push(event);
            if chunk.len() >= self.max_batch_size {
                batches.push(self.new_batch(BatchKind::Batch, std::mem::take(&mut chunk)));
            }
        }
        if !chunk.is_empty() {
            batches.push(self.new_batch(BatchKind::Batch, chunk));
        }
        batches
    }

    fn new_batch(&mut self, kind: BatchKind, events: Vec<NormalizedEvent>) -> Batch {
        let id = self.next_id;
        self.next_id += 1;
        trace!(batch_id = id, events = events.len(), "batch sealed");
        Batch::sealed(id, kind, events)
    }

    fn unflushed_events(&self) -> Vec<NormalizedEvent> {
        self.in_flight
            .iter()
            .chain(self.sealed.iter())
            .flat_map(|b| b.events.iter())
            .chain(self.pending.iter())
            .cloned()
            .collect()
    }

    fn persist(&self) {
        let events = self.unflushed_events();
        if events.is_empty() {
            self.store.remove(BATCH_KEY);
            return;
        }
        let record = Batch::sealed(0, BatchKind::Batch, events);
        self.store.set_json(BATCH_KEY, &record);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn sealed_len(&self) -> usize {
        self.sealed.len()
    }

    pub fn in_flight(&self) -> Option<&Batch> {
        self.in_flight.as_ref()
    }

    pub fn is_flush_requested(&self) -> bool {
        self.flush_requested
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.sealed.is_empty() && self.in_flight.is_none()
    }

    pub fn diagnostics(&self) -> impl Iterator<Item = &DeliveryDiagnostic> {
        self.diagnostics.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::SESSION_END;
    use crate::store::tests::BrokenStore;
    use serde_json::json;

    const INTERVAL: u64 = 10_000;

    fn policy(on_exhausted: FailurePolicy) -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            on_exhausted,
        }
    }

    fn buffer(max: usize) -> (EventBuffer, Arc<BestEffortStore>) {
        let store = Arc::new(BestEffortStore::in_memory());
        let buf = EventBuffer::new(max, INTERVAL, policy(FailurePolicy::Drop), Arc::clone(&store));
        (buf, store)
    }

    fn click(n: u64) -> NormalizedEvent {
        NormalizedEvent::new("click", n, "s1", json!({ "n": n }))
    }

    fn numbers(batch: &Batch) -> Vec<u64> {
        batch.events.iter().map(|e| e.timestamp).collect()
    }

    fn network() -> DeliveryError {
        DeliveryError::Network("connection refused".into())
    }

    #[test]
    fn size_threshold_flushes_immediately_in_order() {
        let (mut buf, _) = buffer(3);
        buf.enqueue(click(1), 0);
        assert!(buf.maybe_flush(0).is_none());
        buf.enqueue(click(2), 0);
        assert!(buf.maybe_flush(0).is_none());
        buf.enqueue(click(3), 0);

        let batch = buf.maybe_flush(0).unwrap();
        assert_eq!(batch.state, BatchState::InFlight);
        assert_eq!(batch.kind, BatchKind::Batch);
        assert_eq!(numbers(&batch), vec![1, 2, 3]);

        let (completion, next) = buf.complete(batch.id, Ok(()), 10);
        let Completion::Delivered(delivered) = completion else {
            panic!("expected delivery");
        };
        assert_eq!(delivered.state, BatchState::Delivered);
        assert!(next.is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn interval_flushes_below_threshold() {
        let (mut buf, _) = buffer(20);
        buf.enqueue(click(1), 1_000);
        buf.enqueue(click(2), 5_000);
        assert!(buf.maybe_flush(1_000 + INTERVAL - 1).is_none());

        let batch = buf.maybe_flush(1_000 + INTERVAL).unwrap();
        assert_eq!(numbers(&batch), vec![1, 2]);
    }

    #[test]
    fn at_most_one_batch_in_flight() {
        let (mut buf, _) = buffer(2);
        buf.enqueue(click(1), 0);
        buf.enqueue(click(2), 0);
        let first = buf.maybe_flush(0).unwrap();

        buf.enqueue(click(3), 0);
        buf.enqueue(click(4), 0);
        assert!(buf.maybe_flush(0).is_none());
        assert!(buf.flush(0).is_none());
        assert!(buf.is_flush_requested());

        // Arrives after the request: still included in the queued flush
        buf.enqueue(click(5), 1);

        let (_, next) = buf.complete(first.id, Ok(()), 2);
        let next = next.unwrap();
        assert_eq!(numbers(&next), vec![3, 4]);
        assert_eq!(buf.sealed_len(), 1);

        let (_, last) = buf.complete(next.id, Ok(()), 3);
        assert_eq!(numbers(&last.unwrap()), vec![5]);
    }

    #[test]
    fn failed_batch_retries_after_backoff() {
        let (mut buf, _) = buffer(1);
        buf.enqueue(click(1), 0);
        let batch = buf.maybe_flush(0).unwrap();
        assert_eq!(batch.attempts, 1);

        let (completion, next) = buf.complete(batch.id, Err(network()), 100);
        assert_eq!(
            completion,
            Completion::Retrying {
                batch_id: batch.id,
                attempt: 1,
                retry_at: 1_100
            }
        );
        assert!(next.is_none());

        // Newer events wait behind the retry
        buf.enqueue(click(2), 200);
        assert!(buf.maybe_flush(1_099).is_none());

        let retry = buf.maybe_flush(1_100).unwrap();
        assert_eq!(retry.id, batch.id);
        assert_eq!(retry.attempts, 2);
        assert_eq!(numbers(&retry), vec![1]);
    }

    #[test]
    fn exhausted_batch_is_dropped_with_diagnostic() {
        let (mut buf, _) = buffer(1);
        buf.enqueue(click(1), 0);
        let mut now = 0;
        let mut batch = buf.maybe_flush(now).unwrap();
        for _ in 1..3 {
            let (_, _) = buf.complete(batch.id, Err(DeliveryError::Status(503)), now);
            now += 100_000;
            batch = buf.maybe_flush(now).unwrap();
        }
        assert_eq!(batch.attempts, 3);

        let (completion, _) = buf.complete(batch.id, Err(DeliveryError::Status(503)), now);
        let Completion::Dropped(diag) = completion else {
            panic!("expected drop");
        };
        assert_eq!(diag.attempts, 3);
        assert_eq!(diag.events, 1);
        assert!(diag.error.contains("503"));
        assert!(buf.is_empty());
        assert_eq!(buf.diagnostics().count(), 1);
    }

    #[test]
    fn requeue_policy_keeps_batch_at_front() {
        let store = Arc::new(BestEffortStore::in_memory());
        let retry = RetryPolicy {
            max_attempts: 1,
            ..policy(FailurePolicy::Requeue)
        };
        let mut buf = EventBuffer::new(1, INTERVAL, retry, store);
        buf.enqueue(click(1), 0);
        let batch = buf.maybe_flush(0).unwrap();

        let (completion, _) = buf.complete(batch.id, Err(network()), 0);
        assert_eq!(completion, Completion::Requeued { batch_id: batch.id });

        let again = buf.maybe_flush(60_000).unwrap();
        assert_eq!(again.id, batch.id);
        assert_eq!(again.attempts, 1);
    }

    #[test]
    fn released_batch_keeps_its_attempts() {
        let (mut buf, _) = buffer(1);
        buf.enqueue(click(1), 0);
        buf.enqueue(click(2), 0);
        let batch = buf.maybe_flush(0).unwrap();
        assert_eq!(batch.attempts, 1);

        assert!(buf.release(batch.id));
        assert!(!buf.release(batch.id));
        assert!(buf.in_flight().is_none());

        // No backoff, same batch first, still on its first attempt
        let again = buf.maybe_flush(0).unwrap();
        assert_eq!(again.id, batch.id);
        assert_eq!(again.attempts, 1);
        assert_eq!(numbers(&again), vec![1]);
        assert_eq!(buf.diagnostics().count(), 0);
    }

    #[test]
    fn stale_completion_is_ignored() {
        let (mut buf, _) = buffer(1);
        buf.enqueue(click(1), 0);
        let batch = buf.maybe_flush(0).unwrap();
        let (completion, _) = buf.complete(batch.id + 99, Ok(()), 0);
        assert_eq!(completion, Completion::Stale);
        assert!(buf.in_flight().is_some());
    }

    #[test]
    fn terminal_event_gets_its_own_batch() {
        let (mut buf, _) = buffer(20);
        buf.enqueue(click(1), 0);
        buf.enqueue_terminal(NormalizedEvent::new(SESSION_END, 2, "s1", json!({})), 2);
        buf.enqueue(click(3), 3);

        let first = buf.maybe_flush(3).unwrap();
        assert_eq!(first.kind, BatchKind::Batch);
        assert_eq!(numbers(&first), vec![1]);

        let (_, second) = buf.complete(first.id, Ok(()), 4);
        let second = second.unwrap();
        assert_eq!(second.kind, BatchKind::SessionEnd);
        assert_eq!(buf.pending_len(), 1);
    }

    #[test]
    fn unflushed_events_survive_restart() {
        let (mut buf, store) = buffer(2);
        buf.enqueue(click(1), 0);
        buf.enqueue(click(2), 0);
        let _in_flight = buf.maybe_flush(0).unwrap();
        buf.enqueue(click(3), 1);
        buf.enqueue_terminal(NormalizedEvent::new(SESSION_END, 4, "s1", json!({})), 4);

        let mut restarted = EventBuffer::new(2, INTERVAL, policy(FailurePolicy::Drop), store);
        assert_eq!(restarted.restore(), 4);

        let all = restarted.drain_all();
        let kinds: Vec<_> = all.iter().map(|b| b.kind).collect();
        assert_eq!(
            kinds,
            vec![BatchKind::Batch, BatchKind::Batch, BatchKind::SessionEnd]
        );
        assert_eq!(numbers(&all[0]), vec![1, 2]);
        assert_eq!(numbers(&all[1]), vec![3]);
    }

    #[test]
    fn delivered_batches_are_cleared_from_store() {
        let (mut buf, store) = buffer(1);
        buf.enqueue(click(1), 0);
        assert!(store.get(BATCH_KEY).is_some());

        let batch = buf.maybe_flush(0).unwrap();
        buf.complete(batch.id, Ok(()), 1);
        assert!(store.get(BATCH_KEY).is_none());
    }

    #[test]
    fn drain_all_returns_everything_in_order() {
        let (mut buf, _) = buffer(2);
        for n in 1..=5 {
            buf.enqueue(click(n), 0);
        }
        let in_flight = buf.maybe_flush(0).unwrap();
        assert_eq!(numbers(&in_flight), vec![1, 2]);

        let drained = buf.drain_all();
        let flat: Vec<u64> = drained.iter().flat_map(numbers).collect();
        assert_eq!(flat, vec![1, 2, 3, 4, 5]);
        assert!(drained.iter().all(|b| b.state == BatchState::Pending));
        assert!(buf.is_empty());
    }

    #[test]
    fn broken_storage_still_buffers() {
        let store = Arc::new(BestEffortStore::new(BrokenStore));
        let mut buf = EventBuffer::new(2, INTERVAL, policy(FailurePolicy::Drop), store);
        assert_eq!(buf.restore(), 0);
        buf.enqueue(click(1), 0);
        buf.enqueue(click(2), 0);
        let batch = buf.maybe_flush(0).unwrap();
        assert_eq!(numbers(&batch), vec![1, 2]);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = policy(FailurePolicy::Drop);
        assert_eq!(p.backoff_for(1), 1_000);
        assert_eq!(p.backoff_for(2), 2_000);
        assert_eq!(p.backoff_for(3), 4_000);
        assert_eq!(p.backoff_for(40), 60_000);
    }
}
