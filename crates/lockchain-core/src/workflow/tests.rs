use super::*;
use crate::config::{Fallback, LockchainConfig, Policy, RetryCfg, Usb};
use crate::error::{KeySourceError, LockchainError, LockchainResult};
use crate::events::EventBus;
use crate::key_source::{FallbackRequest, KeyMaterial, KeySource, UsbKeySource};
use crate::keyfile::key_file_mode;
use crate::provider::{KeyProvider, KeyState, MemoryProvider, Operation};
use crate::service::{LockchainService, UnlockOptions, WorkflowState};
use pbkdf2::pbkdf2_hmac;
use proptest::prelude::*;
use sha2::{Digest, Sha256};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::{tempdir, TempDir};
use zeroize::Zeroizing;

const USB_KEY: [u8; 32] = [0x42; 32];
const PASSPHRASE: &[u8] = b"correct horse battery staple";

/// Wraps the production key source and counts derivation attempts.
struct SpyKeySource {
    inner: UsbKeySource,
    derivations: AtomicUsize,
}

impl SpyKeySource {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: UsbKeySource::new(&Fallback {
                enabled: true,
                ..Fallback::default()
            }),
            derivations: AtomicUsize::new(0),
        })
    }

    fn derivations(&self) -> usize {
        self.derivations.load(Ordering::SeqCst)
    }
}

impl KeySource for SpyKeySource {
    fn load_usb_key(
        &self,
        path: &Path,
        expected_checksum: Option<&str>,
    ) -> LockchainResult<(KeyMaterial, bool)> {
        self.inner.load_usb_key(path, expected_checksum)
    }

    fn derive_fallback_key(
        &self,
        passphrase: &[u8],
        salt: &[u8],
        xor_blob: &[u8],
        iterations: u32,
    ) -> LockchainResult<KeyMaterial> {
        self.derivations.fetch_add(1, Ordering::SeqCst);
        self.inner
            .derive_fallback_key(passphrase, salt, xor_blob, iterations)
    }
}

fn sample_config(dir: &Path, datasets: &[&str], max_attempts: u32) -> LockchainConfig {
    LockchainConfig {
        policy: Policy {
            datasets: datasets.iter().map(|ds| ds.to_string()).collect(),
            ..Policy::default()
        },
        usb: Usb {
            key_hex_path: dir.join("key.raw").display().to_string(),
            ..Usb::default()
        },
        retry: RetryCfg {
            max_attempts,
            base_delay_ms: 1,
            max_delay_ms: 2,
            jitter_ratio: 0.0,
        },
        path: dir.join("lockchain.toml"),
        ..LockchainConfig::default()
    }
}

/// Configure fallback so that `PASSPHRASE` derives `USB_KEY`.
fn enable_fallback(config: &mut LockchainConfig) {
    let salt = [0x11u8; 16];
    let mut stream = [0u8; 32];
    pbkdf2_hmac::<Sha256>(PASSPHRASE, &salt, 1, &mut stream);
    let xor: Vec<u8> = USB_KEY.iter().zip(stream.iter()).map(|(a, b)| a ^ b).collect();
    config.fallback = Fallback {
        enabled: true,
        passphrase_salt: Some(hex::encode(salt)),
        passphrase_xor: Some(hex::encode(xor)),
        passphrase_iters: 1,
        ..Fallback::default()
    };
}

fn write_usb_key(config: &LockchainConfig, contents: &[u8]) {
    let path = config.key_hex_path();
    fs::write(&path, contents).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o400)).unwrap();
}

fn service(config: LockchainConfig, provider: MemoryProvider) -> LockchainService<MemoryProvider> {
    LockchainService::new(Arc::new(config), provider)
}

fn two_roots() -> MemoryProvider {
    MemoryProvider::new()
        .with_dataset("tank/a", "tank/a", true)
        .with_dataset("tank/b", "tank/b", true)
}

fn setup(datasets: &[&str], max_attempts: u32) -> (TempDir, LockchainConfig) {
    let dir = tempdir().unwrap();
    let config = sample_config(dir.path(), datasets, max_attempts);
    write_usb_key(&config, &USB_KEY);
    (dir, config)
}

fn states(snapshot: &[crate::provider::DatasetKeyDescriptor]) -> Vec<KeyState> {
    snapshot.iter().map(|entry| entry.state.clone()).collect()
}

fn codes(events: &[WorkflowEvent]) -> Vec<EventCode> {
    events.iter().map(|event| event.code).collect()
}

#[test]
fn transient_key_load_failures_are_retried_to_success() {
    let (_dir, config) = setup(&["tank/a", "tank/b"], 3);
    let provider = two_roots();
    provider.fail_next(Operation::LoadKeyTree, Some("tank/b"), 2);
    let service = service(config, provider.clone());

    let report = service.unlock(UnlockOptions::default()).unwrap();

    assert_eq!(report.state, WorkflowState::Done);
    assert_eq!(states(&report.snapshot), vec![KeyState::Unlocked, KeyState::Unlocked]);
    assert_eq!(report.summary.requested, 2);
    assert_eq!(report.summary.unlocked, 2);
    assert_eq!(report.summary.failed, 0);

    let retries: Vec<&WorkflowEvent> = report
        .events
        .iter()
        .filter(|event| event.code == EventCode::ProviderRetry)
        .collect();
    assert_eq!(retries.len(), 2);
    assert!(retries
        .iter()
        .all(|event| event.level == WorkflowLevel::Warn && event.dataset.as_deref() == Some("tank/b")));
    assert!(report.events.iter().all(|event| event.level != WorkflowLevel::Error));
    assert_eq!(provider.calls(Operation::LoadKeyTree), 4);
    assert!(!service.key_slot().is_checked_out());
}

#[test]
fn provider_that_always_times_out_exhausts_the_budget() {
    let (_dir, config) = setup(&["tank/a", "tank/b"], 2);
    let provider = two_roots();
    for op in [
        Operation::EncryptionRoot,
        Operation::LockedDescendants,
        Operation::LoadKeyTree,
        Operation::DescribeDatasets,
    ] {
        provider.fail_always(op, None);
    }
    let service = service(config, provider.clone());

    let failure = service.unlock(UnlockOptions::default()).unwrap_err();

    assert!(matches!(failure.state, WorkflowState::Failed(_)));
    assert_eq!(failure.stage, WorkflowState::KeyAcquired);
    assert!(matches!(failure.error, LockchainError::Provider(_)));
    assert_eq!(failure.dataset.as_deref(), Some("tank/a"));
    let attempts: Vec<&WorkflowEvent> = failure
        .events
        .iter()
        .filter(|event| event.code.class() == "provider")
        .collect();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].level, WorkflowLevel::Warn);
    assert_eq!(attempts[1].level, WorkflowLevel::Error);
    assert_eq!(provider.calls(Operation::EncryptionRoot), 2);
    assert_eq!(provider.calls(Operation::LoadKeyTree), 0);
    assert!(!service.key_slot().is_checked_out());
}

#[test]
fn strict_mode_never_attempts_fallback() {
    let dir = tempdir().unwrap();
    let mut config = sample_config(dir.path(), &["tank/a"], 3);
    enable_fallback(&mut config);
    let spy = SpyKeySource::new();
    let provider = two_roots();
    let service = service(config, provider.clone()).with_key_source(spy.clone());

    let failure = service
        .unlock(UnlockOptions {
            strict_usb: true,
            fallback: Some(FallbackRequest::Passphrase(Zeroizing::new(
                String::from_utf8_lossy(PASSPHRASE).into_owned(),
            ))),
            key_override: None,
        })
        .unwrap_err();

    assert!(matches!(
        failure.error,
        LockchainError::KeySource(KeySourceError::KeyUnavailable { .. })
    ));
    assert_eq!(failure.stage, WorkflowState::Start);
    assert_eq!(spy.derivations(), 0);
    assert_eq!(provider.calls(Operation::EncryptionRoot), 0);
}

#[test]
fn requested_fallback_unlocks_when_media_is_missing() {
    let dir = tempdir().unwrap();
    let mut config = sample_config(dir.path(), &["tank/a"], 3);
    enable_fallback(&mut config);
    let spy = SpyKeySource::new();
    let provider = MemoryProvider::new()
        .with_dataset("tank/a", "tank/a", true)
        .with_root_key("tank/a", &USB_KEY);
    let service = service(config, provider.clone()).with_key_source(spy.clone());

    let report = service
        .unlock(UnlockOptions {
            fallback: Some(FallbackRequest::Passphrase(Zeroizing::new(
                String::from_utf8_lossy(PASSPHRASE).into_owned(),
            ))),
            ..UnlockOptions::default()
        })
        .unwrap();

    assert_eq!(spy.derivations(), 1);
    assert_eq!(states(&report.snapshot), vec![KeyState::Unlocked]);
    let audit = report
        .events
        .iter()
        .find(|event| event.code == EventCode::KeyFallbackUsed)
        .unwrap();
    assert_eq!(audit.level, WorkflowLevel::Security);
    assert_eq!(
        provider.observed_key_digests(),
        vec![hex::encode(Sha256::digest(USB_KEY))]
    );
}

#[test]
fn fallback_requires_an_explicit_request_and_policy_permission() {
    let dir = tempdir().unwrap();
    let config = sample_config(dir.path(), &["tank/a"], 3);
    let service = service(config.clone(), two_roots());
    let failure = service.unlock(UnlockOptions::default()).unwrap_err();
    assert!(matches!(
        failure.error,
        LockchainError::KeySource(KeySourceError::KeyUnavailable { .. })
    ));

    let failure = service
        .unlock(UnlockOptions {
            fallback: Some(FallbackRequest::Passphrase(Zeroizing::new("pw".into()))),
            ..UnlockOptions::default()
        })
        .unwrap_err();
    assert!(matches!(
        failure.error,
        LockchainError::KeySource(KeySourceError::FallbackDisabled)
    ));
}

#[test]
fn hex_key_is_normalised_during_unlock() {
    let dir = tempdir().unwrap();
    let config = sample_config(dir.path(), &["tank/a"], 3);
    write_usb_key(&config, hex::encode(USB_KEY).as_bytes());
    let service = service(config.clone(), two_roots());

    let report = service.unlock(UnlockOptions::default()).unwrap();

    assert!(codes(&report.events).contains(&EventCode::KeyNormalized));
    assert_eq!(fs::read(config.key_hex_path()).unwrap(), USB_KEY.to_vec());
    assert_eq!(key_file_mode(&config.key_hex_path()).unwrap(), 0o400);
}

#[test]
fn checksum_mismatch_stops_before_any_provider_call() {
    let (_dir, mut config) = setup(&["tank/a"], 3);
    config.usb.expected_sha256 = Some("0".repeat(64));
    let provider = two_roots();
    let service = service(config, provider.clone());

    let failure = service.unlock(UnlockOptions::default()).unwrap_err();

    assert!(matches!(
        failure.error,
        LockchainError::KeySource(KeySourceError::ChecksumMismatch { .. })
    ));
    assert_eq!(provider.calls(Operation::EncryptionRoot), 0);
    assert!(!service.key_slot().is_checked_out());
}

#[test]
fn descendant_refusal_is_a_partial_unlock() {
    let (_dir, config) = setup(&["tank/secure", "tank/secure/home"], 3);
    let provider = MemoryProvider::new()
        .with_dataset("tank/secure", "tank/secure", true)
        .with_dataset("tank/secure/db", "tank/secure", true)
        .with_dataset("tank/secure/home", "tank/secure", true)
        .refuse_key("tank/secure/home");
    let service = service(config, provider.clone());

    let report = service.unlock(UnlockOptions::default()).unwrap();

    assert_eq!(report.state, WorkflowState::Done);
    assert_eq!(report.roots, vec!["tank/secure"]);
    assert_eq!(report.newly_unlocked, vec!["tank/secure", "tank/secure/db"]);
    assert_eq!(report.failed, vec!["tank/secure/home"]);
    assert_eq!(states(&report.snapshot), vec![KeyState::Unlocked, KeyState::Locked]);
    assert_eq!(report.summary.failed, 1);
    let partial = report
        .events
        .iter()
        .find(|event| event.code == EventCode::PartialUnlock)
        .unwrap();
    assert_eq!(partial.level, WorkflowLevel::Warn);
    assert_eq!(partial.dataset.as_deref(), Some("tank/secure/home"));
    assert_eq!(provider.calls(Operation::LoadKeyTree), 1);
}

#[test]
fn exhausted_root_does_not_stop_other_roots() {
    let (_dir, config) = setup(&["tank/a", "tank/b"], 2);
    let provider = two_roots();
    provider.fail_always(Operation::LoadKeyTree, Some("tank/a"));
    let service = service(config, provider.clone());

    let failure = service.unlock(UnlockOptions::default()).unwrap_err();

    assert_eq!(failure.stage, WorkflowState::StatusConfirmed);
    assert_eq!(failure.dataset.as_deref(), Some("tank/a"));
    let snapshot = failure.snapshot.as_ref().unwrap();
    assert_eq!(states(snapshot), vec![KeyState::Locked, KeyState::Unlocked]);
    assert_eq!(provider.is_locked("tank/b"), Some(false));
    assert!(codes(&failure.events).contains(&EventCode::UnlockSummary));
}

#[test]
fn shared_roots_are_loaded_once_and_unlocked_roots_skipped() {
    let (_dir, config) = setup(&["tank/secure/db", "tank/secure/home", "tank/open"], 3);
    let provider = MemoryProvider::new()
        .with_dataset("tank/secure", "tank/secure", true)
        .with_dataset("tank/secure/db", "tank/secure", true)
        .with_dataset("tank/secure/home", "tank/secure", true)
        .with_dataset("tank/open", "tank/open", false);
    let service = service(config, provider.clone());

    let report = service.unlock(UnlockOptions::default()).unwrap();

    assert_eq!(report.roots, vec!["tank/secure", "tank/open"]);
    assert_eq!(provider.calls(Operation::LoadKeyTree), 1);
    assert_eq!(provider.calls(Operation::LockedDescendants), 2);
    assert!(report
        .events
        .iter()
        .any(|event| event.code == EventCode::AlreadyUnlocked
            && event.dataset.as_deref() == Some("tank/open")));
    assert_eq!(
        states(&report.snapshot),
        vec![KeyState::Unlocked, KeyState::Unlocked, KeyState::Unlocked]
    );
}

#[test]
fn unconfigured_targets_are_rejected_up_front() {
    let (_dir, config) = setup(&["tank/a"], 3);
    let provider = two_roots();
    let service = service(config, provider.clone());

    let failure = service
        .unlock_targets(&["tank/b".to_string()], UnlockOptions::default())
        .unwrap_err();

    assert!(matches!(failure.error, LockchainError::DatasetNotConfigured(_)));
    assert_eq!(failure.code(), "dataset.not_configured");
    assert_eq!(provider.calls(Operation::EncryptionRoot), 0);
}

#[test]
fn bus_subscribers_see_the_same_batch_as_the_report() {
    let (_dir, config) = setup(&["tank/a"], 3);
    let bus = EventBus::new(64);
    let mut rx = bus.subscribe();
    let service = service(config, two_roots()).with_event_bus(bus);

    let report = service.unlock(UnlockOptions::default()).unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        seen.push(event);
    }
    assert_eq!(seen, report.events);
    assert_eq!(report.events.last().map(|e| e.code), Some(EventCode::UnlockSummary));
}

#[test]
fn dataset_status_and_key_trees_are_read_only() {
    let (_dir, config) = setup(&["tank/secure", "tank/secure/db"], 3);
    let provider = MemoryProvider::new()
        .with_dataset("tank/secure", "tank/secure", true)
        .with_dataset("tank/secure/db", "tank/secure", true);
    let service = service(config, provider.clone());

    let status = service.dataset_status("tank/secure/db").unwrap();
    assert_eq!(status.encryption_root, "tank/secure");
    assert!(status.root_locked);
    assert_eq!(status.locked_descendants, vec!["tank/secure/db"]);

    let trees = service.list_key_trees().unwrap();
    assert_eq!(trees.len(), 2);
    assert!(matches!(
        service.dataset_status("tank/other"),
        Err(LockchainError::DatasetNotConfigured(_))
    ));
    assert_eq!(provider.calls(Operation::LoadKeyTree), 0);
}

#[test]
fn self_test_passes_and_tears_down() {
    let (_dir, config) = setup(&["tank/a"], 3);
    let provider = two_roots();
    let service = service(config, provider.clone());

    let report = self_test(&service, UnlockOptions::default()).unwrap();

    assert!(report.has_code(EventCode::SelfTestPassed));
    assert!(report.has_code(EventCode::SelfTestTeardown));
    assert_eq!(provider.calls(Operation::CreateEphemeral), 1);
    assert_eq!(provider.calls(Operation::DestroyEphemeral), 1);
    assert!(!provider.exists("lcscratch1/selftest"));
    assert_eq!(provider.is_locked("tank/a"), Some(true));
}

#[test]
fn self_test_tears_down_after_mid_way_failure() {
    let (_dir, config) = setup(&["tank/a"], 2);
    let provider = two_roots();
    provider.fail_always(Operation::LoadKeyTree, None);
    let service = service(config, provider.clone());

    let failure = self_test(&service, UnlockOptions::default()).unwrap_err();

    assert!(matches!(failure.error, LockchainError::Provider(_)));
    assert_eq!(provider.calls(Operation::CreateEphemeral), 1);
    assert_eq!(provider.calls(Operation::DestroyEphemeral), 1);
    assert!(!provider.exists("lcscratch1/selftest"));
    assert!(codes(&failure.events).contains(&EventCode::SelfTestTeardown));
    assert_eq!(failure.events.last().map(|e| e.code), Some(EventCode::SelfTestFailed));
    assert!(!service.key_slot().is_checked_out());
}

#[test]
fn self_test_without_key_creates_nothing() {
    let dir = tempdir().unwrap();
    let config = sample_config(dir.path(), &["tank/a"], 2);
    let provider = two_roots();
    let service = service(config, provider.clone());

    assert!(self_test(&service, UnlockOptions::default()).is_err());
    assert_eq!(provider.calls(Operation::CreateEphemeral), 0);
    assert_eq!(provider.calls(Operation::DestroyEphemeral), 0);
}

fn recovery_events(events: &[WorkflowEvent]) -> Vec<(WorkflowLevel, EventCode)> {
    events
        .iter()
        .filter(|event| event.code.is_audit())
        .map(|event| (event.level, event.code))
        .collect()
}

#[test]
fn recover_key_from_passphrase_writes_expected_material() {
    let dir = tempdir().unwrap();
    let mut config = sample_config(dir.path(), &["tank/secure"], 3);
    enable_fallback(&mut config);
    let service = service(config, MemoryProvider::new());
    let output = dir.path().join("recovered.key");

    let report = recover_key(
        &service,
        RecoveryRequest {
            dataset: "tank/secure",
            input: RecoveryInput::Passphrase(PASSPHRASE),
            confirmation: BREAKGLASS_CONFIRMATION,
            output_path: &output,
        },
    )
    .unwrap();

    assert_eq!(fs::read(&output).unwrap(), USB_KEY.to_vec());
    assert_eq!(key_file_mode(&output).unwrap(), 0o400);
    assert_eq!(
        recovery_events(&report.events),
        vec![
            (WorkflowLevel::Security, EventCode::RecoveryRequested),
            (WorkflowLevel::Security, EventCode::RecoveryCompleted),
        ]
    );
    let digest = hex::encode(Sha256::digest(USB_KEY));
    assert!(report.events.iter().any(|event| event.message.contains(&digest)));
    assert!(!service.key_slot().is_checked_out());
}

#[test]
fn recover_key_from_recorded_hex() {
    let dir = tempdir().unwrap();
    let config = sample_config(dir.path(), &["tank/secure"], 3);
    let service = service(config, MemoryProvider::new());
    let output = dir.path().join("nested").join("recovered.key");
    let recorded = hex::encode([0x24u8; 32]);

    recover_key(
        &service,
        RecoveryRequest {
            dataset: "tank/secure",
            input: RecoveryInput::Hex(&recorded),
            confirmation: BREAKGLASS_CONFIRMATION,
            output_path: &output,
        },
    )
    .unwrap();

    assert_eq!(fs::read(&output).unwrap(), vec![0x24u8; 32]);
}

#[test]
fn unconfirmed_recovery_is_audited_and_writes_nothing() {
    let dir = tempdir().unwrap();
    let mut config = sample_config(dir.path(), &["tank/secure"], 3);
    enable_fallback(&mut config);
    let service = service(config, MemoryProvider::new());
    let output = dir.path().join("recovered.key");

    let failure = recover_key(
        &service,
        RecoveryRequest {
            dataset: "tank/secure",
            input: RecoveryInput::Passphrase(PASSPHRASE),
            confirmation: "breakglass",
            output_path: &output,
        },
    )
    .unwrap_err();

    assert!(matches!(failure.error, LockchainError::RecoveryNotConfirmed { .. }));
    assert!(!output.exists());
    assert_eq!(
        recovery_events(&failure.events),
        vec![
            (WorkflowLevel::Security, EventCode::RecoveryRequested),
            (WorkflowLevel::Security, EventCode::RecoveryFailed),
        ]
    );
}

#[test]
fn recovery_with_disabled_fallback_fails_with_audit_trail() {
    let dir = tempdir().unwrap();
    let config = sample_config(dir.path(), &["tank/secure"], 3);
    let service = service(config, MemoryProvider::new());
    let output = dir.path().join("recovered.key");

    let failure = recover_key(
        &service,
        RecoveryRequest {
            dataset: "tank/secure",
            input: RecoveryInput::Passphrase(PASSPHRASE),
            confirmation: BREAKGLASS_CONFIRMATION,
            output_path: &output,
        },
    )
    .unwrap_err();

    assert_eq!(failure.code(), "key.fallback_disabled");
    assert!(!output.exists());
    assert_eq!(recovery_events(&failure.events).len(), 2);
}

#[test]
fn doctor_never_mutates_keys_or_datasets() {
    let dir = tempdir().unwrap();
    let config = sample_config(dir.path(), &["tank/a", "tank/missing"], 2);
    let hex_key = hex::encode(USB_KEY);
    write_usb_key(&config, hex_key.as_bytes());
    let provider = two_roots();
    let service = service(config.clone(), provider.clone());

    let report = doctor(&service).unwrap();

    assert_eq!(provider.calls(Operation::LoadKeyTree), 0);
    assert_eq!(provider.is_locked("tank/a"), Some(true));
    assert_eq!(fs::read_to_string(config.key_hex_path()).unwrap(), hex_key);
    assert!(report
        .events
        .iter()
        .any(|event| event.message.contains("hex encoded")));
    assert!(report.events.iter().any(|event| {
        event.level == WorkflowLevel::Error && event.dataset.as_deref() == Some("tank/missing")
    }));
    let summary = report.events.last().unwrap();
    assert_eq!(summary.code, EventCode::DoctorSummary);
    assert!(summary.message.starts_with("Doctor summary :: warnings="));
    assert!(report.has_code(EventCode::DoctorRemedy));
}

#[test]
fn doctor_flags_loose_key_permissions() {
    let (_dir, config) = setup(&["tank/a"], 2);
    fs::set_permissions(config.key_hex_path(), fs::Permissions::from_mode(0o644)).unwrap();
    let service = service(config, two_roots());

    let report = doctor(&service).unwrap();

    assert!(report.events.iter().any(|event| {
        event.level == WorkflowLevel::Error && event.message.contains("group/other")
    }));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn status_snapshot_preserves_policy_order(
        order in Just((0..8).map(|idx| format!("tank/d{idx}")).collect::<Vec<_>>()).prop_shuffle(),
        locked in proptest::collection::vec(any::<bool>(), 8),
    ) {
        let dir = tempdir().unwrap();
        let names: Vec<&str> = order.iter().map(String::as_str).collect();
        let config = sample_config(dir.path(), &names, 1);
        let mut provider = MemoryProvider::new();
        for (idx, name) in order.iter().enumerate() {
            provider = provider.with_dataset(name, name, locked[idx]);
        }
        let service = service(config, provider.clone());

        let snapshot = service.status_snapshot().unwrap();
        let datasets: Vec<String> = snapshot.iter().map(|entry| entry.dataset.clone()).collect();
        prop_assert_eq!(&datasets, &order);

        let direct = provider.describe_datasets(&order).unwrap();
        prop_assert_eq!(direct, snapshot);
    }
}
