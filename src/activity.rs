//! Activity monitor - merges raw input and visibility signals into an
//! idle/active status.
//!
//! Raw signals only update timestamps. The idle flag is recomputed on
//! [`ActivityMonitor::poll`], which the engine calls on a fixed interval, and
//! changes are published to subscribers through a `watch` channel. Dropping
//! the receiver unsubscribes.

use crate::event::ActivitySignal;
use tokio::sync::watch;
use tracing::trace;

/// Snapshot published to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivityStatus {
    pub idle: bool,
    pub hidden: bool,
    /// Epoch millis of the most recent activity signal
    pub last_activity_at: u64,
}

#[derive(Debug)]
pub struct ActivityMonitor {
    idle_threshold_ms: u64,
    last_activity_at: u64,
    hidden: bool,
    tx: watch::Sender<ActivityStatus>,
}

impl ActivityMonitor {
    pub fn new(idle_threshold_ms: u64, now: u64) -> Self {
        let initial = ActivityStatus {
            idle: false,
            hidden: false,
            last_activity_at: now,
        };
        let (tx, _rx) = watch::channel(initial);
        Self {
            idle_threshold_ms,
            last_activity_at: now,
            hidden: false,
            tx,
        }
    }

    /// Record a raw input signal.
    pub fn record(&mut self, signal: ActivitySignal, now: u64) {
        trace!(?signal, "activity signal");
        self.last_activity_at = self.last_activity_at.max(now);
    }

    /// Record a visibility change. Becoming visible counts as activity.
    pub fn set_visibility(&mut self, hidden: bool, now: u64) {
        self.hidden = hidden;
        if !hidden {
            self.last_activity_at = self.last_activity_at.max(now);
        }
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden
    }

    pub fn last_activity_at(&self) -> u64 {
        self.last_activity_at
    }

    /// Status as of `now`, without publishing.
    pub fn status_at(&self, now: u64) -> ActivityStatus {
        let quiet_for = now.saturating_sub(self.last_activity_at);
        ActivityStatus {
            idle: self.hidden || quiet_for >= self.idle_threshold_ms,
            hidden: self.hidden,
            last_activity_at: self.last_activity_at,
        }
    }

    /// Recompute the status and publish it if anything changed.
    ///
    /// Returns the new status when it differs from the last published one.
    pub fn poll(&mut self, now: u64) -> Option<ActivityStatus> {
        let next = self.status_at(now);
        let changed = self.tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        changed.then_some(next)
    }

    /// Last published status.
    pub fn current(&self) -> ActivityStatus {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ActivityStatus> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const THRESHOLD: u64 = 30_000;

    #[test]
    fn starts_active() {
        let monitor = ActivityMonitor::new(THRESHOLD, 1_000);
        let status = monitor.current();
        assert!(!status.idle);
        assert_eq!(status.last_activity_at, 1_000);
    }

    #[test]
    fn goes_idle_after_threshold() {
        let mut monitor = ActivityMonitor::new(THRESHOLD, 0);
        assert_eq!(monitor.poll(29_999), None);

        let status = monitor.poll(31_000).unwrap();
        assert!(status.idle);
        // Unchanged status is not republished
        assert_eq!(monitor.poll(32_000), None);
    }

    #[test]
    fn activity_returns_to_active() {
        let mut monitor = ActivityMonitor::new(THRESHOLD, 0);
        monitor.poll(31_000);
        monitor.record(ActivitySignal::KeyInput, 31_500);

        let status = monitor.poll(32_000).unwrap();
        assert!(!status.idle);
        assert_eq!(status.last_activity_at, 31_500);
    }

    #[test]
    fn signals_only_bookkeep_until_poll() {
        let mut monitor = ActivityMonitor::new(THRESHOLD, 0);
        monitor.poll(40_000);
        monitor.record(ActivitySignal::PointerMove, 40_100);
        assert!(monitor.current().idle);
        assert_eq!(monitor.last_activity_at(), 40_100);
    }

    #[test]
    fn activity_timestamp_never_moves_backwards() {
        let mut monitor = ActivityMonitor::new(THRESHOLD, 5_000);
        monitor.record(ActivitySignal::Scroll, 4_000);
        assert_eq!(monitor.last_activity_at(), 5_000);
    }

    #[test]
    fn hidden_is_idle_immediately() {
        let mut monitor = ActivityMonitor::new(THRESHOLD, 0);
        monitor.set_visibility(true, 1_000);
        let status = monitor.poll(1_000).unwrap();
        assert!(status.idle);
        assert!(status.hidden);

        monitor.set_visibility(false, 2_000);
        let status = monitor.poll(2_000).unwrap();
        assert!(!status.idle);
        assert_eq!(status.last_activity_at, 2_000);
    }

    #[test]
    fn subscribers_see_changes() {
        let mut monitor = ActivityMonitor::new(THRESHOLD, 0);
        let mut rx = monitor.subscribe();
        assert_eq!(monitor.subscriber_count(), 1);

        monitor.poll(31_000);
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().idle);

        drop(rx);
        assert_eq!(monitor.subscriber_count(), 0);
    }
}
