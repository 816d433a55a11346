//! Session identity and lifecycle.
//!
//! ```text
//!   start ──► Active ◄──activity── Idle
//!               │  ──no activity──►  │
//!               └──────┬─────────────┘
//!      timeout / unload / teardown
//!                      ▼
//!                    Ended (terminal)
//! ```
//!
//! The manager owns the live session record. Ending a session persists the
//! `Ended` record before clearing it, so a reload never resurrects it. After
//! a timeout the next activity signal or tracked event starts a new session.

use crate::activity::ActivityStatus;
use crate::clock::format_epoch_ms;
use crate::event::{NormalizedEvent, SESSION_END};
use crate::store::{BestEffortStore, SESSION_KEY};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Idle,
    /// Terminal; the record is never mutated again
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Inactivity exceeded the session timeout
    Timeout,
    /// Host page/process is unloading
    Unload,
    /// Explicit engine teardown
    Teardown,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Unload => "unload",
            Self::Teardown => "teardown",
        }
    }
}

/// Persisted session record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    pub started_at: u64,
    pub last_active_at: u64,
    pub state: SessionState,
    #[serde(default)]
    pub event_count: u64,
    #[serde(default)]
    pub activity_count: u64,
    #[serde(default)]
    pub idle_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<EndReason>,
}

impl Session {
    fn new(now: u64) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            started_at: now,
            last_active_at: now,
            state: SessionState::Active,
            event_count: 0,
            activity_count: 0,
            idle_count: 0,
            ended_at: None,
            end_reason: None,
        }
    }

    fn is_live(&self) -> bool {
        self.state != SessionState::Ended
    }

    fn expired_at(&self, now: u64, timeout_ms: u64) -> bool {
        now.saturating_sub(self.last_active_at) >= timeout_ms
    }
}

fn fresh_session(now: u64) -> (Session, Transition) {
    let session = Session::new(now);
    info!(session_id = %session.session_id, "session started");
    let transition = Transition::Started {
        session_id: session.session_id.clone(),
        resumed: false,
    };
    (session, transition)
}

/// Session state change, reported to the engine for logging and re-tagging.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Started { session_id: String, resumed: bool },
    BecameIdle,
    BecameActive,
    /// Carries the terminal `session_end` event
    Ended(NormalizedEvent),
}

#[derive(Debug)]
pub struct SessionManager {
    timeout_ms: u64,
    current: Option<Session>,
    store: Arc<BestEffortStore>,
}

impl SessionManager {
    pub fn new(timeout_ms: u64, store: Arc<BestEffortStore>) -> Self {
        Self {
            timeout_ms,
            current: None,
            store,
        }
    }

    /// Restore a persisted session if it is still within the timeout,
    /// otherwise create a new one. Either way the session is `Active`.
    ///
    /// A persisted live record that has expired (the host went away without
    /// ending it) is ended with [`EndReason::Timeout`] first, so the returned
    /// transitions are an optional `Ended` followed by `Started`.
    pub fn start(&mut self, now: u64) -> Vec<Transition> {
        let Some(mut restored) = self
            .store
            .get_json::<Session>(SESSION_KEY)
            .filter(Session::is_live)
        else {
            return vec![self.begin(now)];
        };

        if restored.expired_at(now, self.timeout_ms) {
            debug!(session_id = %restored.session_id, "persisted session expired");
            self.current = Some(restored);
            let ended = self.end(EndReason::Timeout, now);
            return ended.into_iter().chain([self.begin(now)]).collect();
        }

        info!(
            session_id = %restored.session_id,
            last_active = %format_epoch_ms(restored.last_active_at),
            "session resumed"
        );
        restored.state = SessionState::Active;
        restored.last_active_at = now;
        let session_id = restored.session_id.clone();
        self.current = Some(restored);
        self.persist();
        vec![Transition::Started {
            session_id,
            resumed: true,
        }]
    }

    fn begin(&mut self, now: u64) -> Transition {
        let (session, transition) = fresh_session(now);
        self.current = Some(session);
        self.persist();
        transition
    }

    fn persist(&self) {
        if let Some(session) = &self.current {
            self.store.set_json(SESSION_KEY, session);
        }
    }

    pub fn current(&self) -> Option<&Session> {
        self.current.as_ref()
    }

    pub fn current_id(&self) -> Option<&str> {
        self.current.as_ref().map(|s| s.session_id.as_str())
    }

    pub fn state(&self) -> Option<SessionState> {
        self.current.as_ref().map(|s| s.state)
    }

    /// Session id to stamp on a newly enqueued event, starting a session if
    /// none is live.
    pub fn tag_event(&mut self, now: u64) -> (String, Option<Transition>) {
        let mut started = None;
        let session = self.current.get_or_insert_with(|| {
            let (session, transition) = fresh_session(now);
            started = Some(transition);
            session
        });
        session.event_count += 1;
        let session_id = session.session_id.clone();
        self.persist();
        (session_id, started)
    }

    /// Apply an activity status published by the activity monitor.
    pub fn observe(&mut self, status: ActivityStatus, now: u64) -> Option<Transition> {
        let Some(session) = self.current.as_mut() else {
            if status.idle {
                return None;
            }
            return Some(self.begin(now));
        };

        let mut touched = false;
        if status.last_activity_at > session.last_active_at {
            session.last_active_at = status.last_activity_at;
            session.activity_count += 1;
            touched = true;
        }

        let transition = match (session.state, status.idle) {
            (SessionState::Active, true) => {
                session.state = SessionState::Idle;
                session.idle_count += 1;
                debug!(session_id = %session.session_id, "session idle");
                Some(Transition::BecameIdle)
            }
            (SessionState::Idle, false) => {
                session.state = SessionState::Active;
                debug!(session_id = %session.session_id, "session active");
                Some(Transition::BecameActive)
            }
            _ => None,
        };
        if touched || transition.is_some() {
            self.persist();
        }
        transition
    }

    /// End the session if it has been inactive past the timeout.
    pub fn check_timeout(&mut self, now: u64) -> Option<Transition> {
        let expired = self
            .current
            .as_ref()
            .is_some_and(|s| s.expired_at(now, self.timeout_ms));
        if expired {
            self.end(EndReason::Timeout, now)
        } else {
            None
        }
    }

    /// End the live session, persisting the terminal record.
    pub fn end(&mut self, reason: EndReason, now: u64) -> Option<Transition> {
        let mut session = self.current.take()?;
        // A timed-out session ended when activity stopped, not when we noticed.
        let ended_at = match reason {
            EndReason::Timeout => session.last_active_at,
            EndReason::Unload | EndReason::Teardown => now.max(session.last_active_at),
        };
        session.state = SessionState::Ended;
        session.ended_at = Some(ended_at);
        session.end_reason = Some(reason);
        self.store.set_json(SESSION_KEY, &session);

        let duration_ms = ended_at.saturating_sub(session.started_at);
        info!(
            session_id = %session.session_id,
            reason = reason.as_str(),
            duration_ms,
            events = session.event_count,
            "session ended"
        );

        let event = NormalizedEvent::new(
            SESSION_END,
            now,
            session.session_id.clone(),
            json!({
                "reason": reason.as_str(),
                "startedAt": session.started_at,
                "endedAt": ended_at,
                "durationMs": duration_ms,
                "eventCount": session.event_count,
                "activityCount": session.activity_count,
                "idleCount": session.idle_count,
            }),
        );
        Some(Transition::Ended(event))
    }
}
