//! Read-only diagnostics that keep LockChain deployments healthy.
//!
//! `doctor` inspects configuration, key material, fallback parameters, and the
//! provider's view of every configured dataset. It never loads keys, rewrites
//! files, or changes dataset state; it only reports findings and remedies.

use super::{event, WorkflowLevel, WorkflowReport};
use crate::config::{detect_zfs_binary_path, detect_zpool_binary_path, LockchainConfig};
use crate::error::{LockchainError, LockchainResult};
use crate::events::{EventCode, EventRecorder};
use crate::fallback::FallbackParams;
use crate::key_source::{verify_checksum, KeyMaterial};
use crate::keyfile::{read_key_file, KEY_FILE_MODE};
use crate::provider::{ensure_request_order, KeyProvider, KeyState};
use crate::service::LockchainService;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Findings collected during a doctor pass.
struct Findings<'a> {
    recorder: EventRecorder<'a>,
    warnings: usize,
    errors: usize,
    remedies: Vec<String>,
}

impl<'a> Findings<'a> {
    fn new(recorder: EventRecorder<'a>) -> Self {
        Self {
            recorder,
            warnings: 0,
            errors: 0,
            remedies: Vec::new(),
        }
    }

    fn record(&mut self, level: WorkflowLevel, dataset: Option<&str>, message: impl Into<String>) {
        match level {
            WorkflowLevel::Warn => self.warnings += 1,
            WorkflowLevel::Error => self.errors += 1,
            _ => {}
        }
        let mut finding = event(level, EventCode::DoctorFinding, message);
        if let Some(dataset) = dataset {
            finding = finding.with_dataset(dataset);
        }
        self.recorder.emit(finding);
    }

    fn remedy(&mut self, text: impl Into<String>) {
        let text = text.into();
        if !self.remedies.contains(&text) {
            self.remedies.push(text);
        }
    }

    fn finish(mut self, title: String) -> WorkflowReport {
        for remedy in std::mem::take(&mut self.remedies) {
            self.recorder.emit(event(
                WorkflowLevel::Info,
                EventCode::DoctorRemedy,
                format!("Remedy: {remedy}"),
            ));
        }
        let level = if self.errors > 0 {
            WorkflowLevel::Error
        } else if self.warnings > 0 {
            WorkflowLevel::Warn
        } else {
            WorkflowLevel::Success
        };
        self.recorder.emit(event(
            level,
            EventCode::DoctorSummary,
            format!(
                "Doctor summary :: warnings={} errors={}",
                self.warnings, self.errors
            ),
        ));
        WorkflowReport {
            title,
            events: self.recorder.into_events(),
        }
    }
}

/// Run every read-only check and report what an operator should fix.
pub fn doctor<P>(service: &LockchainService<P>) -> LockchainResult<WorkflowReport>
where
    P: KeyProvider<Error = LockchainError>,
{
    let config = service.config();
    let mut findings = Findings::new(EventRecorder::new(service.events()));

    check_config(config, &mut findings);
    check_key_file(config, &mut findings);
    check_fallback(config, &mut findings);
    check_binaries(config, &mut findings);
    check_datasets(service, &mut findings);

    Ok(findings.finish("Doctor report".to_string()))
}

fn check_config(config: &LockchainConfig, findings: &mut Findings<'_>) {
    let issues = config.validate();
    if issues.is_empty() {
        findings.record(
            WorkflowLevel::Info,
            None,
            format!(
                "Configuration valid ({} dataset(s), {:?})",
                config.policy.datasets.len(),
                config.format
            ),
        );
        return;
    }
    for issue in issues {
        findings.record(WorkflowLevel::Error, None, format!("Configuration: {issue}"));
    }
    findings.remedy(format!(
        "Correct the reported keys in {} and restart the daemon.",
        config.path.display()
    ));
}

fn check_key_file(config: &LockchainConfig, findings: &mut Findings<'_>) {
    let path = config.key_hex_path();
    let meta = match fs::metadata(&path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            let level = if config.fallback.enabled && !config.policy.strict_usb {
                WorkflowLevel::Warn
            } else {
                WorkflowLevel::Error
            };
            findings.record(
                level,
                None,
                format!("Key file {} is not present", path.display()),
            );
            findings.remedy(
                "Insert the USB key media or check usb.device_label / usb.device_uuid.",
            );
            return;
        }
        Err(err) => {
            findings.record(
                WorkflowLevel::Error,
                None,
                format!("Cannot stat key file {}: {err}", path.display()),
            );
            return;
        }
    };

    let mode = meta.permissions().mode() & 0o777;
    if mode & 0o077 != 0 {
        findings.record(
            WorkflowLevel::Error,
            None,
            format!(
                "Key file {} is accessible to group/other (mode {mode:o})",
                path.display()
            ),
        );
        findings.remedy(format!("chmod {KEY_FILE_MODE:o} {}", path.display()));
    } else if mode != KEY_FILE_MODE {
        findings.record(
            WorkflowLevel::Warn,
            None,
            format!(
                "Key file {} has mode {mode:o}; expected {KEY_FILE_MODE:o}",
                path.display()
            ),
        );
        findings.remedy(format!("chmod {KEY_FILE_MODE:o} {}", path.display()));
    }

    match read_key_file(&path) {
        Ok((raw, normalized)) => {
            let key = KeyMaterial::from_array(raw);
            if normalized {
                findings.record(
                    WorkflowLevel::Warn,
                    None,
                    format!(
                        "Key file {} is hex encoded; it is rewritten as raw bytes on the next unlock",
                        path.display()
                    ),
                );
            }
            match verify_checksum(&key, config.usb.expected_sha256.as_deref()) {
                Ok(()) => findings.record(
                    WorkflowLevel::Info,
                    None,
                    format!("Key file decodes to 32 bytes (SHA-256 {})", key.sha256_hex()),
                ),
                Err(err) => {
                    findings.record(WorkflowLevel::Error, None, format!("Key file: {err}"));
                    findings.remedy(
                        "Re-import the USB key material or update usb.expected_sha256.",
                    );
                }
            }
        }
        Err(err) => {
            findings.record(
                WorkflowLevel::Error,
                None,
                format!("Key file [{}]: {err}", err.code()),
            );
            findings.remedy("Re-import the USB key material (32 raw bytes or 64 hex digits).");
        }
    }
}

fn check_fallback(config: &LockchainConfig, findings: &mut Findings<'_>) {
    let fallback = &config.fallback;
    if !fallback.enabled {
        findings.record(WorkflowLevel::Info, None, "Fallback derivation disabled");
        return;
    }
    if config.policy.strict_usb {
        findings.record(
            WorkflowLevel::Warn,
            None,
            "policy.strict_usb is set; the enabled fallback path is never used",
        );
    }
    match FallbackParams::from_config(fallback) {
        Ok(params) => findings.record(
            WorkflowLevel::Info,
            None,
            format!(
                "Fallback parameters decoded ({} byte salt, {} iterations)",
                params.salt.len(),
                params.iterations
            ),
        ),
        Err(err) => {
            findings.record(WorkflowLevel::Error, None, format!("Fallback: {err}"));
            findings.remedy("Regenerate fallback.passphrase_salt and fallback.passphrase_xor.");
        }
    }
    if fallback.askpass {
        let helper = fallback.askpass_path.as_deref().unwrap_or_default();
        if !is_executable(Path::new(helper)) {
            findings.record(
                WorkflowLevel::Warn,
                None,
                format!("Askpass helper '{helper}' is not an executable file"),
            );
            findings.remedy("Install systemd-ask-password or set fallback.askpass_path.");
        }
    }
}

fn check_binaries(config: &LockchainConfig, findings: &mut Findings<'_>) {
    let candidates = [
        ("zfs", config.zfs_binary_path(), detect_zfs_binary_path()),
        ("zpool", config.zpool_binary_path(), detect_zpool_binary_path()),
    ];
    for (name, configured, detected) in candidates {
        let resolved = configured.or_else(|| detected.map(PathBuf::from));
        match resolved {
            Some(path) if is_executable(&path) => findings.record(
                WorkflowLevel::Info,
                None,
                format!("{name} binary at {}", path.display()),
            ),
            Some(path) => {
                findings.record(
                    WorkflowLevel::Warn,
                    None,
                    format!("{name} binary {} is not executable", path.display()),
                );
                findings.remedy(format!("Fix policy.{name}_path or install the {name} tools."));
            }
            None => {
                findings.record(
                    WorkflowLevel::Warn,
                    None,
                    format!("{name} binary not found in the usual locations"),
                );
                findings.remedy(format!("Set policy.{name}_path to the {name} binary."));
            }
        }
    }
}

fn check_datasets<P>(service: &LockchainService<P>, findings: &mut Findings<'_>)
where
    P: KeyProvider<Error = LockchainError>,
{
    let provider = service.provider();
    let retry = service.retry_policy();
    let datasets = &service.config().policy.datasets;

    for dataset in datasets {
        let dataset = dataset.as_str();
        let root = match retry.run(
            "resolve encryption root",
            Some(dataset),
            &mut findings.recorder,
            || provider.encryption_root(dataset),
        ) {
            Ok(root) => root,
            Err(err) => {
                findings.record(
                    WorkflowLevel::Error,
                    Some(dataset),
                    format!("Cannot resolve encryption root [{}]: {err}", err.code()),
                );
                findings.remedy(dataset_remedy(&err));
                continue;
            }
        };
        match retry.run(
            "enumerate locked datasets",
            Some(root.as_str()),
            &mut findings.recorder,
            || provider.locked_descendants(&root),
        ) {
            Ok(locked) if locked.is_empty() => findings.record(
                WorkflowLevel::Info,
                Some(dataset),
                format!("Encryption root {root} fully unlocked"),
            ),
            Ok(locked) => findings.record(
                WorkflowLevel::Info,
                Some(dataset),
                format!(
                    "Encryption root {root} has {} locked dataset(s): {}",
                    locked.len(),
                    locked.join(", ")
                ),
            ),
            Err(err) => {
                findings.record(
                    WorkflowLevel::Error,
                    Some(dataset),
                    format!("Cannot enumerate locked datasets [{}]: {err}", err.code()),
                );
                findings.remedy(dataset_remedy(&err));
            }
        }
    }

    let snapshot = retry.run("describe datasets", None, &mut findings.recorder, || {
        let snapshot = provider.describe_datasets(datasets)?;
        ensure_request_order(datasets, &snapshot)?;
        Ok(snapshot)
    });
    match snapshot {
        Ok(snapshot) => {
            for entry in snapshot {
                match &entry.state {
                    KeyState::Unavailable(reason) => findings.record(
                        WorkflowLevel::Warn,
                        Some(&entry.dataset),
                        format!("Keystatus unavailable: {reason}"),
                    ),
                    state => findings.record(
                        WorkflowLevel::Info,
                        Some(&entry.dataset),
                        format!("Keystatus {} (root {})", state.label(), entry.encryption_root),
                    ),
                }
            }
        }
        Err(err) => {
            findings.record(
                WorkflowLevel::Error,
                None,
                format!("Cannot describe datasets [{}]: {err}", err.code()),
            );
            findings.remedy(dataset_remedy(&err));
        }
    }
}

fn dataset_remedy(err: &LockchainError) -> &'static str {
    match err {
        LockchainError::DatasetNotFound(_) => {
            "Verify the dataset exists (zfs list) or remove it from policy.datasets."
        }
        _ => "Check pool health (zpool status) and the provider binaries.",
    }
}

fn is_executable(path: &Path) -> bool {
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
