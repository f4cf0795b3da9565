//! Structured workflow events and their fan-out.
//!
//! Events are published on a bounded `tokio::sync::broadcast` ring. Publishing
//! never blocks: a subscriber that falls more than `capacity` events behind
//! loses the oldest ones and observes `RecvError::Lagged` on its next read.
//! Every event is also mirrored to the `log` facade.

use crate::workflow::{WorkflowEvent, WorkflowLevel};
use log::Level;
use serde::{Serialize, Serializer};
use std::fmt;
use tokio::sync::broadcast;

pub const DEFAULT_EVENT_CAPACITY: usize = 256;
const LOG_TARGET: &str = "lockchain::events";

/// Stable identifiers consumers key alert routing off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventCode {
    KeyLoaded,
    KeyNormalized,
    KeyFallbackUsed,
    KeyAcquisitionFailed,
    RootResolved,
    AlreadyUnlocked,
    DescendantsLocked,
    UnlockApplied,
    PartialUnlock,
    StatusConfirmed,
    UnlockSummary,
    UnlockFailed,
    ProviderRetry,
    ProviderExhausted,
    StatusReported,
    SelfTestCreated,
    SelfTestPassed,
    SelfTestFailed,
    SelfTestTeardown,
    SelfTestTeardownFailed,
    RecoveryRequested,
    RecoveryCompleted,
    RecoveryFailed,
    DoctorFinding,
    DoctorRemedy,
    DoctorSummary,
    SchedulerCycle,
    HealthChanged,
}

impl EventCode {
    pub fn as_str(self) -> &'static str {
        match self {
            EventCode::KeyLoaded => "key.loaded",
            EventCode::KeyNormalized => "key.normalized",
            EventCode::KeyFallbackUsed => "audit.fallback_used",
            EventCode::KeyAcquisitionFailed => "key.acquisition_failed",
            EventCode::RootResolved => "unlock.root_resolved",
            EventCode::AlreadyUnlocked => "unlock.already_unlocked",
            EventCode::DescendantsLocked => "unlock.descendants_locked",
            EventCode::UnlockApplied => "unlock.applied",
            EventCode::PartialUnlock => "unlock.partial",
            EventCode::StatusConfirmed => "unlock.status_confirmed",
            EventCode::UnlockSummary => "unlock.summary",
            EventCode::UnlockFailed => "unlock.failed",
            EventCode::ProviderRetry => "provider.retry",
            EventCode::ProviderExhausted => "provider.exhausted",
            EventCode::StatusReported => "status.reported",
            EventCode::SelfTestCreated => "selftest.created",
            EventCode::SelfTestPassed => "selftest.passed",
            EventCode::SelfTestFailed => "selftest.failed",
            EventCode::SelfTestTeardown => "selftest.teardown",
            EventCode::SelfTestTeardownFailed => "selftest.teardown_failed",
            EventCode::RecoveryRequested => "audit.recovery_requested",
            EventCode::RecoveryCompleted => "audit.recovery_completed",
            EventCode::RecoveryFailed => "audit.recovery_failed",
            EventCode::DoctorFinding => "doctor.finding",
            EventCode::DoctorRemedy => "doctor.remedy",
            EventCode::DoctorSummary => "doctor.summary",
            EventCode::SchedulerCycle => "scheduler.cycle",
            EventCode::HealthChanged => "health.changed",
        }
    }

    /// Leading namespace of the code (`unlock`, `provider`, `audit`, ...).
    pub fn class(self) -> &'static str {
        let code = self.as_str();
        code.split_once('.').map(|(class, _)| class).unwrap_or(code)
    }

    /// Audit-class codes record security-relevant actions.
    pub fn is_audit(self) -> bool {
        self.class() == "audit"
    }
}

impl fmt::Display for EventCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Append-only publisher shared by every workflow.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<WorkflowEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Register a new independent subscriber. It only sees events published
    /// after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: WorkflowEvent) {
        log::log!(
            target: LOG_TARGET,
            log_level(event.level),
            "[{}] {}{}",
            event.code,
            event
                .dataset
                .as_deref()
                .map(|ds| format!("{ds}: "))
                .unwrap_or_default(),
            event.message
        );
        // No subscribers is not an error for the producer.
        let _ = self.tx.send(event);
    }
}

fn log_level(level: WorkflowLevel) -> Level {
    match level {
        WorkflowLevel::Info | WorkflowLevel::Success => Level::Info,
        WorkflowLevel::Warn | WorkflowLevel::Security => Level::Warn,
        WorkflowLevel::Error => Level::Error,
    }
}

/// Collects the events of one workflow invocation while publishing each one.
#[derive(Debug)]
pub struct EventRecorder<'a> {
    bus: &'a EventBus,
    events: Vec<WorkflowEvent>,
}

impl<'a> EventRecorder<'a> {
    pub fn new(bus: &'a EventBus) -> Self {
        Self {
            bus,
            events: Vec::new(),
        }
    }

    pub fn emit(&mut self, event: WorkflowEvent) {
        self.bus.publish(event.clone());
        self.events.push(event);
    }

    pub fn events(&self) -> &[WorkflowEvent] {
        &self.events
    }

    pub fn into_events(self) -> Vec<WorkflowEvent> {
        self.events
    }
}
