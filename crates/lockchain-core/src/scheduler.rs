//! Background loop that keeps the policy unlocked.
//!
//! Cycles run on a fixed interval and on external triggers (media presence
//! changes, manual requests). The blocking unlock engine runs on the tokio
//! blocking pool; every provider call it makes is bounded by the retry policy.

use crate::error::LockchainError;
use crate::events::{EventCode, EventRecorder};
use crate::health::{HealthReporter, HealthState};
use crate::provider::KeyProvider;
use crate::service::{LockchainService, UnlockOptions, UnlockReport, WorkflowFailure};
use crate::workflow::{event, WorkflowEvent, WorkflowLevel};
use log::{debug, info, warn};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};

/// Reason a cycle was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Interval,
    MediaInserted,
    MediaRemoved,
    Manual,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Trigger::Interval => "interval",
            Trigger::MediaInserted => "media-inserted",
            Trigger::MediaRemoved => "media-removed",
            Trigger::Manual => "manual",
        })
    }
}

enum CycleOutcome {
    /// Every policy dataset already reported unlocked; no key was checked out.
    Steady(Vec<WorkflowEvent>),
    Ran(Result<UnlockReport, WorkflowFailure>),
}

pub struct Scheduler<P> {
    service: Arc<LockchainService<P>>,
    health: HealthReporter,
    interval: Duration,
    options: UnlockOptions,
}

impl<P> Scheduler<P>
where
    P: KeyProvider<Error = LockchainError> + Send + Sync + 'static,
{
    pub fn new(service: Arc<LockchainService<P>>, health: HealthReporter) -> Self {
        let interval = service.config().scheduler_interval();
        let options = UnlockOptions {
            strict_usb: service.config().policy.strict_usb,
            ..UnlockOptions::default()
        };
        Self {
            service,
            health,
            interval,
            options,
        }
    }

    pub fn with_options(mut self, options: UnlockOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Drive cycles until `shutdown` flips to true or its sender is dropped.
    pub async fn run(
        self,
        mut triggers: mpsc::Receiver<Trigger>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("scheduler started (interval {:?})", self.interval);

        loop {
            let trigger = tokio::select! {
                _ = ticker.tick() => Trigger::Interval,
                Some(trigger) = triggers.recv() => trigger,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };
            self.run_cycle(trigger).await;
        }
        info!("scheduler stopped");
    }

    /// Run one cycle and fold the outcome into the health state.
    pub async fn run_cycle(&self, trigger: Trigger) -> HealthState {
        self.service.events().publish(event(
            WorkflowLevel::Info,
            EventCode::SchedulerCycle,
            format!("unlock cycle triggered by {trigger}"),
        ));

        let service = Arc::clone(&self.service);
        let options = self.options.clone();
        let skip_when_unlocked = trigger == Trigger::Interval;
        let outcome =
            tokio::task::spawn_blocking(move || cycle(&service, options, skip_when_unlocked)).await;

        match outcome {
            Ok(CycleOutcome::Steady(events)) => {
                debug!("all datasets already unlocked; skipped key checkout");
                self.health.record_steady(events)
            }
            Ok(CycleOutcome::Ran(result)) => {
                match &result {
                    Ok(report) => info!(
                        "unlock cycle done: requested={} unlocked={} failed={}",
                        report.summary.requested, report.summary.unlocked, report.summary.failed
                    ),
                    Err(failure) => warn!("unlock cycle failed: {failure}"),
                }
                self.health.record_unlock(&result)
            }
            Err(err) => {
                warn!("unlock cycle aborted: {err}");
                self.health.degrade(format!("unlock cycle aborted: {err}"))
            }
        }
    }
}

fn cycle<P>(
    service: &LockchainService<P>,
    options: UnlockOptions,
    skip_when_unlocked: bool,
) -> CycleOutcome
where
    P: KeyProvider<Error = LockchainError>,
{
    if skip_when_unlocked {
        match service.status_snapshot() {
            Ok(snapshot) if snapshot.iter().all(|entry| entry.state.is_unlocked()) => {
                let mut recorder = EventRecorder::new(service.events());
                recorder.emit(event(
                    WorkflowLevel::Info,
                    EventCode::StatusReported,
                    format!("all {} dataset(s) already unlocked", snapshot.len()),
                ));
                return CycleOutcome::Steady(recorder.into_events());
            }
            Ok(_) => {}
            Err(err) => debug!("status probe failed ({err}); running full unlock"),
        }
    }
    CycleOutcome::Ran(service.unlock(options))
}
