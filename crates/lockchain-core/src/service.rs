//! Unlock service that coordinates config, providers, and key sources.
//!
//! A single invocation walks `Start -> KeyAcquired -> RootResolved ->
//! DescendantsEnumerated -> KeyApplied -> StatusConfirmed -> Done`, or ends in
//! `Failed(reason)`. Key material is checked out once per invocation and the
//! lease is dropped as soon as the last `load_key_tree` call returns.

use crate::config::LockchainConfig;
use crate::error::{KeySourceError, LockchainError, LockchainResult};
use crate::events::{EventBus, EventCode, EventRecorder};
use crate::key_source::{
    derive_configured, is_key_unavailable, verify_checksum, FallbackRequest, KeyLease,
    KeyMaterial, KeyOrigin, KeySlot, KeySource, UsbKeySource,
};
use crate::provider::{ensure_request_order, KeyProvider, KeyStatusSnapshot};
use crate::retry::RetryPolicy;
use crate::workflow::{event, WorkflowEvent, WorkflowLevel};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use zeroize::Zeroizing;

/// Options that tune the unlock workflow.
#[derive(Clone, Default)]
pub struct UnlockOptions {
    /// Refuse every key source other than removable media.
    pub strict_usb: bool,
    /// Explicit request to fall back to passphrase derivation when the USB key is missing.
    pub fallback: Option<FallbackRequest>,
    /// Raw key bytes supplied by the caller; bypasses every key source.
    pub key_override: Option<Zeroizing<Vec<u8>>>,
}

impl fmt::Debug for UnlockOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnlockOptions")
            .field("strict_usb", &self.strict_usb)
            .field("fallback", &self.fallback)
            .field("key_override", &self.key_override.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Position of a workflow invocation in the unlock state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowState {
    Start,
    KeyAcquired,
    RootResolved,
    DescendantsEnumerated,
    KeyApplied,
    StatusConfirmed,
    Done,
    Failed(String),
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowState::Start => f.write_str("start"),
            WorkflowState::KeyAcquired => f.write_str("key-acquired"),
            WorkflowState::RootResolved => f.write_str("root-resolved"),
            WorkflowState::DescendantsEnumerated => f.write_str("descendants-enumerated"),
            WorkflowState::KeyApplied => f.write_str("key-applied"),
            WorkflowState::StatusConfirmed => f.write_str("status-confirmed"),
            WorkflowState::Done => f.write_str("done"),
            WorkflowState::Failed(reason) => write!(f, "failed({reason})"),
        }
    }
}

/// Counts carried by the `unlock.summary` event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnlockSummary {
    pub requested: usize,
    pub unlocked: usize,
    pub failed: usize,
}

/// Result of an unlock invocation that reached `Done`.
#[derive(Debug, Clone)]
pub struct UnlockReport {
    /// Encryption roots in first-seen request order.
    pub roots: Vec<String>,
    /// Datasets this invocation unlocked.
    pub newly_unlocked: Vec<String>,
    /// Datasets that stayed locked after their key tree was applied.
    pub failed: Vec<String>,
    /// Final keystatus for the requested datasets, in request order.
    pub snapshot: KeyStatusSnapshot,
    pub summary: UnlockSummary,
    pub state: WorkflowState,
    pub events: Vec<WorkflowEvent>,
}

/// Terminal failure of a workflow invocation.
#[derive(Debug)]
pub struct WorkflowFailure {
    /// Always `WorkflowState::Failed`.
    pub state: WorkflowState,
    /// Last state reached before the failure.
    pub stage: WorkflowState,
    pub dataset: Option<String>,
    pub error: LockchainError,
    /// Final snapshot when status confirmation ran before the failure surfaced.
    pub snapshot: Option<KeyStatusSnapshot>,
    pub events: Vec<WorkflowEvent>,
}

impl WorkflowFailure {
    pub fn code(&self) -> &'static str {
        self.error.code()
    }

    pub fn into_error(self) -> LockchainError {
        self.error
    }
}

impl fmt::Display for WorkflowFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "workflow failed after {}", self.stage)?;
        if let Some(dataset) = &self.dataset {
            write!(f, " ({dataset})")?;
        }
        write!(f, ": {}", self.error)
    }
}

impl std::error::Error for WorkflowFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Current key status for a dataset and its encryption root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetStatus {
    pub dataset: String,
    pub encryption_root: String,
    pub root_locked: bool,
    pub locked_descendants: Vec<String>,
}

/// Outcome of a drive that reached `StatusConfirmed` cleanly.
pub(crate) struct Applied {
    roots: Vec<String>,
    newly_unlocked: Vec<String>,
    failed: Vec<String>,
    pub(crate) snapshot: KeyStatusSnapshot,
    summary: UnlockSummary,
}

impl Applied {
    fn into_report(self, recorder: EventRecorder<'_>) -> UnlockReport {
        UnlockReport {
            roots: self.roots,
            newly_unlocked: self.newly_unlocked,
            failed: self.failed,
            snapshot: self.snapshot,
            summary: self.summary,
            state: WorkflowState::Done,
            events: recorder.into_events(),
        }
    }
}

/// A drive that stopped short of `Done`.
#[derive(Debug)]
pub(crate) struct Stalled {
    stage: WorkflowState,
    dataset: Option<String>,
    error: LockchainError,
    snapshot: Option<KeyStatusSnapshot>,
}

impl Stalled {
    pub(crate) fn at(stage: WorkflowState, dataset: Option<&str>, error: LockchainError) -> Self {
        Self {
            stage,
            dataset: dataset.map(str::to_string),
            error,
            snapshot: None,
        }
    }

    /// Record the terminal event and close the invocation.
    pub(crate) fn into_failure(
        self,
        level: WorkflowLevel,
        code: EventCode,
        mut recorder: EventRecorder<'_>,
    ) -> WorkflowFailure {
        let reason = format!("[{}] {}", self.error.code(), self.error);
        let mut terminal = event(level, code, format!("failed after {}: {reason}", self.stage));
        if let Some(dataset) = &self.dataset {
            terminal = terminal.with_dataset(dataset.as_str());
        }
        recorder.emit(terminal);
        WorkflowFailure {
            state: WorkflowState::Failed(reason),
            stage: self.stage,
            dataset: self.dataset,
            error: self.error,
            snapshot: self.snapshot,
            events: recorder.into_events(),
        }
    }
}

/// Coordinates configuration, providers, and key sources to unlock datasets.
pub struct LockchainService<P> {
    config: Arc<LockchainConfig>,
    provider: P,
    key_source: Arc<dyn KeySource>,
    slot: KeySlot,
    events: EventBus,
    retry: RetryPolicy,
}

impl<P> LockchainService<P>
where
    P: KeyProvider<Error = LockchainError>,
{
    /// Build a service with shared configuration and a concrete provider implementation.
    pub fn new(config: Arc<LockchainConfig>, provider: P) -> Self {
        let key_source: Arc<dyn KeySource> = Arc::new(UsbKeySource::new(&config.fallback));
        let retry = config.retry_policy();
        Self {
            config,
            provider,
            key_source,
            slot: KeySlot::new(),
            events: EventBus::default(),
            retry,
        }
    }

    pub fn with_key_source(mut self, key_source: Arc<dyn KeySource>) -> Self {
        self.key_source = key_source;
        self
    }

    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &LockchainConfig {
        &self.config
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn key_slot(&self) -> &KeySlot {
        &self.slot
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Unlock every dataset named in the policy.
    pub fn unlock(&self, options: UnlockOptions) -> Result<UnlockReport, WorkflowFailure> {
        self.unlock_targets(&self.config.policy.datasets, options)
    }

    /// Unlock a subset of the policy, preserving the caller's order.
    pub fn unlock_targets(
        &self,
        targets: &[String],
        options: UnlockOptions,
    ) -> Result<UnlockReport, WorkflowFailure> {
        let mut recorder = EventRecorder::new(&self.events);
        let fail = |stalled: Stalled, recorder| {
            stalled.into_failure(WorkflowLevel::Error, EventCode::UnlockFailed, recorder)
        };

        if let Some(unknown) = targets.iter().find(|ds| !self.config.contains_dataset(ds)) {
            let error = LockchainError::DatasetNotConfigured(unknown.clone());
            return Err(fail(
                Stalled::at(WorkflowState::Start, Some(unknown.as_str()), error),
                recorder,
            ));
        }

        let lease = match self.checkout_key(&options, &mut recorder) {
            Ok(lease) => lease,
            Err(error) => {
                return Err(fail(
                    Stalled::at(WorkflowState::Start, None, error),
                    recorder,
                ))
            }
        };

        match self.drive(targets, lease, &mut recorder) {
            Ok(applied) => Ok(applied.into_report(recorder)),
            Err(stalled) => Err(fail(stalled, recorder)),
        }
    }

    /// Start -> KeyAcquired: check the key out of the slot and report where it came from.
    pub(crate) fn checkout_key(
        &self,
        options: &UnlockOptions,
        recorder: &mut EventRecorder<'_>,
    ) -> LockchainResult<KeyLease<'_>> {
        let lease = self.slot.checkout(|| self.acquire_key(options))?;
        let digest = lease.key().sha256_hex();
        let path = self.config.key_hex_path();
        match lease.origin() {
            KeyOrigin::Usb { normalized } => {
                if normalized {
                    recorder.emit(event(
                        WorkflowLevel::Warn,
                        EventCode::KeyNormalized,
                        format!(
                            "key material at {} was hex encoded; rewrote it as raw bytes (0o400)",
                            path.display()
                        ),
                    ));
                }
                recorder.emit(event(
                    WorkflowLevel::Info,
                    EventCode::KeyLoaded,
                    format!("loaded key from {} (SHA-256 {digest})", path.display()),
                ));
            }
            KeyOrigin::Fallback => recorder.emit(event(
                WorkflowLevel::Security,
                EventCode::KeyFallbackUsed,
                format!(
                    "USB key unavailable at {}; derived key via fallback passphrase (SHA-256 {digest})",
                    path.display()
                ),
            )),
            KeyOrigin::Override => recorder.emit(event(
                WorkflowLevel::Info,
                EventCode::KeyLoaded,
                format!("using caller-supplied key material (SHA-256 {digest})"),
            )),
        }
        Ok(lease)
    }

    fn acquire_key(&self, options: &UnlockOptions) -> LockchainResult<(KeyMaterial, KeyOrigin)> {
        if let Some(raw) = &options.key_override {
            let key = KeyMaterial::from_slice(Path::new("<key-override>"), raw)?;
            return Ok((key, KeyOrigin::Override));
        }

        let expected = self.config.usb.expected_sha256.as_deref();
        let usb_error = match self
            .key_source
            .load_usb_key(&self.config.key_hex_path(), expected)
        {
            Ok((key, normalized)) => return Ok((key, KeyOrigin::Usb { normalized })),
            Err(err) => err,
        };

        let strict = options.strict_usb || self.config.policy.strict_usb;
        if strict || !is_key_unavailable(&usb_error) {
            return Err(usb_error);
        }
        let Some(request) = &options.fallback else {
            return Err(usb_error);
        };
        if !self.config.fallback.enabled {
            return Err(KeySourceError::FallbackDisabled.into());
        }

        let passphrase = request.passphrase(&self.config.fallback)?;
        let key = derive_configured(self.key_source.as_ref(), &self.config.fallback, &passphrase)?;
        verify_checksum(&key, expected)?;
        Ok((key, KeyOrigin::Fallback))
    }

    /// KeyAcquired -> ... -> StatusConfirmed for `targets` using the checked-out key.
    pub(crate) fn drive(
        &self,
        targets: &[String],
        lease: KeyLease<'_>,
        recorder: &mut EventRecorder<'_>,
    ) -> Result<Applied, Stalled> {
        let retry = &self.retry;
        let provider = &self.provider;

        let mut roots: Vec<String> = Vec::new();
        for dataset in targets {
            let dataset = dataset.as_str();
            let root = retry
                .run("resolve encryption root", Some(dataset), recorder, || {
                    provider.encryption_root(dataset)
                })
                .map_err(|err| Stalled::at(WorkflowState::KeyAcquired, Some(dataset), err))?;
            recorder.emit(
                event(
                    WorkflowLevel::Info,
                    EventCode::RootResolved,
                    format!("encryption root is {root}"),
                )
                .with_dataset(dataset),
            );
            if !roots.contains(&root) {
                roots.push(root);
            }
        }

        let mut plan = Vec::with_capacity(roots.len());
        for root in &roots {
            let root = root.as_str();
            let locked = retry
                .run("enumerate locked datasets", Some(root), recorder, || {
                    provider.locked_descendants(root)
                })
                .map_err(|err| Stalled::at(WorkflowState::RootResolved, Some(root), err))?;
            if locked.is_empty() {
                recorder.emit(
                    event(
                        WorkflowLevel::Info,
                        EventCode::AlreadyUnlocked,
                        "encryption root already unlocked",
                    )
                    .with_dataset(root),
                );
            } else {
                recorder.emit(
                    event(
                        WorkflowLevel::Info,
                        EventCode::DescendantsLocked,
                        format!("{} locked: {}", locked.len(), locked.join(", ")),
                    )
                    .with_dataset(root),
                );
            }
            plan.push((root, locked));
        }

        let mut newly_unlocked = Vec::new();
        let mut failed = Vec::new();
        let mut first_error: Option<(String, LockchainError)> = None;
        for &(root, ref locked) in &plan {
            if locked.is_empty() {
                continue;
            }
            let outcome = retry.run("load key tree", Some(root), recorder, || {
                provider.load_key_tree(root, lease.key().as_bytes())
            });
            match outcome {
                Ok(unlocked) => {
                    recorder.emit(
                        event(
                            WorkflowLevel::Success,
                            EventCode::UnlockApplied,
                            format!("key loaded; {} dataset(s) unlocked", unlocked.len()),
                        )
                        .with_dataset(root),
                    );
                    for dataset in locked.iter().filter(|ds| !unlocked.contains(ds)) {
                        recorder.emit(
                            event(
                                WorkflowLevel::Warn,
                                EventCode::PartialUnlock,
                                format!("still locked after loading the key for {root}"),
                            )
                            .with_dataset(dataset.as_str()),
                        );
                        failed.push(dataset.clone());
                    }
                    newly_unlocked.extend(unlocked);
                }
                Err(err) => {
                    recorder.emit(
                        event(
                            WorkflowLevel::Error,
                            EventCode::UnlockFailed,
                            format!("[{}] key load failed: {err}", err.code()),
                        )
                        .with_dataset(root),
                    );
                    failed.extend(locked.iter().cloned());
                    if first_error.is_none() {
                        first_error = Some((root.to_string(), err));
                    }
                }
            }
        }
        drop(lease);

        let snapshot = retry
            .run("confirm keystatus", None, recorder, || {
                let snapshot = provider.describe_datasets(targets)?;
                ensure_request_order(targets, &snapshot)?;
                Ok(snapshot)
            })
            .map_err(|err| Stalled::at(WorkflowState::KeyApplied, None, err))?;
        let unlocked = snapshot
            .iter()
            .filter(|entry| entry.state.is_unlocked())
            .count();
        recorder.emit(event(
            WorkflowLevel::Info,
            EventCode::StatusConfirmed,
            format!("{unlocked} of {} requested dataset(s) report unlocked", targets.len()),
        ));

        let summary = UnlockSummary {
            requested: targets.len(),
            unlocked,
            failed: targets.len() - unlocked,
        };
        recorder.emit(event(
            if summary.failed == 0 {
                WorkflowLevel::Success
            } else {
                WorkflowLevel::Warn
            },
            EventCode::UnlockSummary,
            format!(
                "requested={} unlocked={} failed={}",
                summary.requested, summary.unlocked, summary.failed
            ),
        ));

        if let Some((root, error)) = first_error {
            return Err(Stalled {
                stage: WorkflowState::StatusConfirmed,
                dataset: Some(root),
                error,
                snapshot: Some(snapshot),
            });
        }

        Ok(Applied {
            roots,
            newly_unlocked,
            failed,
            snapshot,
            summary,
        })
    }

    /// Keystatus of every dataset declared in the policy, in policy order.
    pub fn status_snapshot(&self) -> LockchainResult<KeyStatusSnapshot> {
        let datasets = &self.config.policy.datasets;
        let mut recorder = EventRecorder::new(&self.events);
        let snapshot = self
            .retry
            .run("describe datasets", None, &mut recorder, || {
                let snapshot = self.provider.describe_datasets(datasets)?;
                ensure_request_order(datasets, &snapshot)?;
                Ok(snapshot)
            })?;
        let unlocked = snapshot
            .iter()
            .filter(|entry| entry.state.is_unlocked())
            .count();
        recorder.emit(event(
            WorkflowLevel::Info,
            EventCode::StatusReported,
            format!("{unlocked} of {} dataset(s) unlocked", snapshot.len()),
        ));
        Ok(snapshot)
    }

    /// Summarise the current keystatus for `dataset` and its encryption root.
    pub fn dataset_status(&self, dataset: &str) -> LockchainResult<DatasetStatus> {
        if !self.config.contains_dataset(dataset) {
            return Err(LockchainError::DatasetNotConfigured(dataset.to_string()));
        }

        let mut recorder = EventRecorder::new(&self.events);
        let root = self
            .retry
            .run("resolve encryption root", Some(dataset), &mut recorder, || {
                self.provider.encryption_root(dataset)
            })?;
        let locked = self
            .retry
            .run("enumerate locked datasets", Some(root.as_str()), &mut recorder, || {
                self.provider.locked_descendants(&root)
            })?;
        let root_locked = locked.iter().any(|ds| ds == &root);
        let locked_descendants = locked.into_iter().filter(|ds| ds != &root).collect();

        Ok(DatasetStatus {
            dataset: dataset.to_string(),
            encryption_root: root,
            root_locked,
            locked_descendants,
        })
    }

    /// Key tree status for every dataset declared in the policy.
    pub fn list_key_trees(&self) -> LockchainResult<Vec<DatasetStatus>> {
        self.config
            .policy
            .datasets
            .iter()
            .map(|dataset| self.dataset_status(dataset))
            .collect()
    }

    /// Derive key material from `passphrase` using the configured fallback scheme.
    pub fn derive_fallback(&self, passphrase: &[u8]) -> LockchainResult<KeyMaterial> {
        derive_configured(self.key_source.as_ref(), &self.config.fallback, passphrase)
    }
}
