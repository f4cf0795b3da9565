//! Named workflows built on top of the unlock engine: self-test drills,
//! break-glass recovery, and read-only diagnostics.

mod diagnostics;
mod recover;

use crate::events::EventCode;
use chrono::{DateTime, Utc};
use serde::Serialize;

pub use diagnostics::doctor;
pub use recover::{recover_key, RecoveryInput, RecoveryRequest, BREAKGLASS_CONFIRMATION};
pub use self_test::self_test;

/// Severity levels used when reporting workflow events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowLevel {
    Info,
    Success,
    Warn,
    Error,
    Security,
}

/// Single immutable record produced by a workflow step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowEvent {
    pub level: WorkflowLevel,
    pub code: EventCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataset: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl WorkflowEvent {
    pub fn with_dataset(mut self, dataset: impl Into<String>) -> Self {
        self.dataset = Some(dataset.into());
        self
    }
}

/// Aggregated report returned by the named workflows.
#[derive(Debug, Clone)]
pub struct WorkflowReport {
    pub title: String,
    pub events: Vec<WorkflowEvent>,
}

impl WorkflowReport {
    pub fn count(&self, level: WorkflowLevel) -> usize {
        self.events.iter().filter(|event| event.level == level).count()
    }

    pub fn has_code(&self, code: EventCode) -> bool {
        self.events.iter().any(|event| event.code == code)
    }
}

/// Convenience constructor that wraps the repeated boilerplate.
pub fn event(level: WorkflowLevel, code: EventCode, message: impl Into<String>) -> WorkflowEvent {
    WorkflowEvent {
        level,
        code,
        message: message.into(),
        dataset: None,
        timestamp: Utc::now(),
    }
}

#[cfg(test)]
mod tests;
