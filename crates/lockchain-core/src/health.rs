//! Aggregate health derived from unlock cycles.
//!
//! Starts `Degraded` until the first full policy pass succeeds. Any cycle
//! ending in `Failed` degrades it again; a clean pass restores `Ready`. A pass
//! that reached `Done` with partial unlocks leaves the current state alone.

use crate::events::{EventBus, EventCode};
use crate::service::{UnlockReport, WorkflowFailure};
use crate::workflow::{event, WorkflowEvent, WorkflowLevel};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

const INITIAL_REASON: &str = "no unlock cycle completed yet";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthState {
    Ready,
    Degraded(String),
}

impl HealthState {
    pub fn is_ready(&self) -> bool {
        matches!(self, HealthState::Ready)
    }
}

impl Default for HealthState {
    fn default() -> Self {
        HealthState::Degraded(INITIAL_REASON.to_string())
    }
}

/// Renders the query surface body: `OK` or `DEGRADED: <reason>`.
impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthState::Ready => f.write_str("OK"),
            HealthState::Degraded(reason) => write!(f, "DEGRADED: {reason}"),
        }
    }
}

/// Answer to a health query.
#[derive(Debug, Clone, Default)]
pub struct HealthSnapshot {
    pub state: HealthState,
    /// Events from the most recent cycle.
    pub last_events: Vec<WorkflowEvent>,
    pub updated_at: Option<DateTime<Utc>>,
}

struct HealthInner {
    snapshot: Mutex<HealthSnapshot>,
    tx: watch::Sender<HealthState>,
    events: EventBus,
}

/// Shared handle used to record cycle outcomes and notify watchers on change.
#[derive(Clone)]
pub struct HealthReporter {
    inner: Arc<HealthInner>,
}

impl HealthReporter {
    pub fn new(events: EventBus) -> Self {
        let (tx, _) = watch::channel(HealthState::default());
        Self {
            inner: Arc::new(HealthInner {
                snapshot: Mutex::new(HealthSnapshot::default()),
                tx,
                events,
            }),
        }
    }

    pub fn state(&self) -> HealthState {
        self.lock().state.clone()
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        self.lock().clone()
    }

    /// Receiver that observes every state transition.
    pub fn subscribe(&self) -> watch::Receiver<HealthState> {
        self.inner.tx.subscribe()
    }

    /// Fold the outcome of one unlock invocation into the health state.
    pub fn record_unlock(&self, outcome: &Result<UnlockReport, WorkflowFailure>) -> HealthState {
        match outcome {
            Ok(report) if report.failed.is_empty() => self.apply(Some(HealthState::Ready), &report.events),
            Ok(report) => self.apply(None, &report.events),
            Err(failure) => self.apply(
                Some(HealthState::Degraded(failure.to_string())),
                &failure.events,
            ),
        }
    }

    /// Record a cycle that found every dataset already unlocked.
    pub fn record_steady(&self, events: Vec<WorkflowEvent>) -> HealthState {
        self.apply(Some(HealthState::Ready), &events)
    }

    pub fn degrade(&self, reason: impl Into<String>) -> HealthState {
        self.apply(Some(HealthState::Degraded(reason.into())), &[])
    }

    fn apply(&self, next: Option<HealthState>, events: &[WorkflowEvent]) -> HealthState {
        let mut snapshot = self.lock();
        snapshot.last_events = events.to_vec();
        snapshot.updated_at = Some(Utc::now());
        let Some(next) = next else {
            return snapshot.state.clone();
        };
        if snapshot.state == next {
            return next;
        }
        let previous = std::mem::replace(&mut snapshot.state, next.clone());
        drop(snapshot);

        let level = if next.is_ready() {
            WorkflowLevel::Success
        } else {
            WorkflowLevel::Warn
        };
        self.inner.events.publish(event(
            level,
            EventCode::HealthChanged,
            format!("health {previous} -> {next}"),
        ));
        self.inner.tx.send_replace(next.clone());
        next
    }

    fn lock(&self) -> MutexGuard<'_, HealthSnapshot> {
        self.inner
            .snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
