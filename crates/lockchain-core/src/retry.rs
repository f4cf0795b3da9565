//! Exponential backoff shared by every workflow that talks to a provider.

use crate::config::RetryCfg;
use crate::error::{LockchainError, LockchainResult};
use crate::events::{EventCode, EventRecorder};
use crate::workflow::{event, WorkflowLevel};
use log::debug;
use rand::Rng;
use std::thread::sleep;
use std::time::Duration;

/// Retry parameters: `max_attempts >= 1`, `jitter_ratio` in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryCfg::default())
    }
}

impl RetryPolicy {
    /// Build a policy from configuration, clamping values into their legal ranges.
    pub fn from_config(cfg: &RetryCfg) -> Self {
        let base_delay = Duration::from_millis(cfg.base_delay_ms.max(1));
        let max_delay = Duration::from_millis(cfg.max_delay_ms).max(base_delay);
        let jitter_ratio = if cfg.jitter_ratio.is_finite() {
            cfg.jitter_ratio.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_delay,
            max_delay,
            jitter_ratio,
        }
    }

    /// `min(base_delay * 2^(attempt-1), max_delay)`; attempts are 1-based.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63);
        let factor = 1u64 << exponent;
        let base_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms))
    }

    /// Backoff for `attempt` scaled by a uniform factor in
    /// `[1 - jitter_ratio, 1 + jitter_ratio]`.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::thread_rng())
    }

    pub fn delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay_for(attempt);
        if self.jitter_ratio <= 0.0 {
            return base;
        }
        let factor = rng.gen_range((1.0 - self.jitter_ratio)..=(1.0 + self.jitter_ratio));
        base.mul_f64(factor)
    }

    /// Run `call` until it succeeds, fails with a non-transient error, or the
    /// attempt budget is spent.
    ///
    /// Each failed attempt that will be retried records a Warning
    /// `provider.retry` event; exhausting the budget records an Error
    /// `provider.exhausted` event and returns the last error.
    pub fn run<T, F>(
        &self,
        operation: &str,
        dataset: Option<&str>,
        recorder: &mut EventRecorder<'_>,
        mut call: F,
    ) -> LockchainResult<T>
    where
        F: FnMut() -> LockchainResult<T>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match call() {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_transient() => return Err(err),
                Err(err) => err,
            };

            if attempt >= self.max_attempts {
                recorder.emit(scoped(
                    event(
                        WorkflowLevel::Error,
                        EventCode::ProviderExhausted,
                        format!("{operation} failed after {attempt} attempt(s): {err}"),
                    ),
                    dataset,
                ));
                return Err(exhausted(err, attempt));
            }

            let wait = self.delay(attempt);
            recorder.emit(scoped(
                event(
                    WorkflowLevel::Warn,
                    EventCode::ProviderRetry,
                    format!(
                        "{operation} attempt {attempt}/{} failed: {err}; retrying in {}ms",
                        self.max_attempts,
                        wait.as_millis()
                    ),
                ),
                dataset,
            ));
            debug!("sleeping {wait:?} before retrying {operation}");
            sleep(wait);
        }
    }
}

fn scoped(
    event: crate::workflow::WorkflowEvent,
    dataset: Option<&str>,
) -> crate::workflow::WorkflowEvent {
    match dataset {
        Some(ds) => event.with_dataset(ds),
        None => event,
    }
}

fn exhausted(err: LockchainError, attempts: u32) -> LockchainError {
    match err {
        LockchainError::Provider(message) if attempts > 1 => {
            LockchainError::Provider(format!("{message} (after {attempts} attempts)"))
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::cell::Cell;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::from_config(&RetryCfg {
            max_attempts,
            base_delay_ms: 1,
            max_delay_ms: 2,
            jitter_ratio: 0.0,
        })
    }

    #[test]
    fn doubles_until_capped() {
        let policy = RetryPolicy::from_config(&RetryCfg {
            max_attempts: 10,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter_ratio: 0.0,
        });
        let delays: Vec<u128> = (1..=6).map(|a| policy.delay(a).as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
    }

    #[test]
    fn jitter_stays_within_ratio() {
        let policy = RetryPolicy::from_config(&RetryCfg {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 1_000,
            jitter_ratio: 0.25,
        });
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let ms = policy.delay_with(1, &mut rng).as_millis();
            assert!((750..=1_250).contains(&ms), "{ms} outside jitter window");
        }
    }

    #[test]
    fn transient_errors_are_retried_until_success() {
        let bus = EventBus::default();
        let mut recorder = EventRecorder::new(&bus);
        let calls = Cell::new(0);
        let value = fast_policy(3)
            .run("load-key tank/b", Some("tank/b"), &mut recorder, || {
                calls.set(calls.get() + 1);
                if calls.get() < 3 {
                    Err(LockchainError::Provider("timed out".into()))
                } else {
                    Ok(42)
                }
            })
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(calls.get(), 3);
        let events = recorder.into_events();
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|e| e.level == WorkflowLevel::Warn && e.code == EventCode::ProviderRetry));
    }

    #[test]
    fn exhaustion_emits_one_event_per_attempt() {
        let bus = EventBus::default();
        let mut recorder = EventRecorder::new(&bus);
        let err = fast_policy(2)
            .run("describe", None, &mut recorder, || -> LockchainResult<()> {
                Err(LockchainError::Provider("timed out".into()))
            })
            .unwrap_err();
        assert!(matches!(err, LockchainError::Provider(ref m) if m.contains("after 2 attempts")));
        let events = recorder.into_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].level, WorkflowLevel::Warn);
        assert_eq!(events[1].level, WorkflowLevel::Error);
        assert_eq!(events[1].code, EventCode::ProviderExhausted);
    }

    #[test]
    fn permanent_errors_are_not_retried() {
        let bus = EventBus::default();
        let mut recorder = EventRecorder::new(&bus);
        let calls = Cell::new(0);
        let err = fast_policy(5)
            .run("encryption-root", Some("tank/x"), &mut recorder, || -> LockchainResult<()> {
                calls.set(calls.get() + 1);
                Err(LockchainError::DatasetNotFound("tank/x".into()))
            })
            .unwrap_err();
        assert!(matches!(err, LockchainError::DatasetNotFound(_)));
        assert_eq!(calls.get(), 1);
        assert!(recorder.events().is_empty());
    }

    proptest! {
        #[test]
        fn base_delay_is_monotonic_and_capped(
            base in 1u64..5_000,
            extra in 0u64..60_000,
            attempts in 1u32..40,
        ) {
            let max = base + extra;
            let policy = RetryPolicy::from_config(&RetryCfg {
                max_attempts: attempts,
                base_delay_ms: base,
                max_delay_ms: max,
                jitter_ratio: 0.5,
            });
            let mut previous = Duration::ZERO;
            for attempt in 1..=attempts {
                let delay = policy.base_delay_for(attempt);
                prop_assert!(delay >= previous);
                prop_assert!(delay <= Duration::from_millis(max));
                previous = delay;
            }
        }
    }
}
