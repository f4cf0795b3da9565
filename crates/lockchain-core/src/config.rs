//! Configuration model and helpers used by Lockchain services.
//!
//! A configuration is loaded exactly once per process, validated, and then
//! shared read-only (`Arc<LockchainConfig>`) with every component.

use crate::error::{LockchainError, LockchainResult};
use crate::retry::RetryPolicy;
use log::info;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/lockchain-zfs.toml";
pub const KEY_PATH_ENV: &str = "LOCKCHAIN_KEY_PATH";
pub(crate) const KNOWN_ZFS_PATHS: &[&str] = &[
    "/usr/sbin/zfs",
    "/sbin/zfs",
    "/bin/zfs",
    "/usr/local/sbin/zfs",
];
pub(crate) const KNOWN_ZPOOL_PATHS: &[&str] = &[
    "/usr/sbin/zpool",
    "/sbin/zpool",
    "/bin/zpool",
    "/usr/local/sbin/zpool",
];

/// Lightweight sanity check that a provided dataset name matches common ZFS patterns.
pub fn looks_like_dataset_name(name: &str) -> bool {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return false;
    }

    for segment in trimmed.split('/') {
        if segment.is_empty() {
            return false;
        }
        if segment.starts_with('-') {
            return false;
        }
        if !segment
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | ':' | '.'))
        {
            return false;
        }
    }

    true
}

pub(crate) fn detect_binary_path(candidates: &[&str]) -> Option<String> {
    candidates
        .iter()
        .map(Path::new)
        .find(|path| path.exists())
        .map(|path| path.to_string_lossy().into_owned())
}

pub fn detect_zfs_binary_path() -> Option<String> {
    detect_binary_path(KNOWN_ZFS_PATHS)
}

pub fn detect_zpool_binary_path() -> Option<String> {
    detect_binary_path(KNOWN_ZPOOL_PATHS)
}

/// Describes which datasets we manage and the paths to supporting tooling.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct Policy {
    /// Ordered list of datasets; order is preserved in every workflow output.
    pub datasets: Vec<String>,

    #[serde(default)]
    pub zfs_path: Option<String>,

    #[serde(default)]
    pub zpool_path: Option<String>,

    /// Forbid fallback key derivation for scheduled unlocks.
    #[serde(default)]
    pub strict_usb: bool,
}

/// Timeouts applied to every provider call.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CryptoCfg {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    10
}

impl Default for CryptoCfg {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// USB token expectations, including mount behaviour and checksum checks.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Usb {
    #[serde(default = "default_usb_key_path")]
    pub key_hex_path: String,

    #[serde(default)]
    pub expected_sha256: Option<String>,

    #[serde(default)]
    pub device_label: Option<String>,

    #[serde(default)]
    pub device_uuid: Option<String>,

    #[serde(default = "default_usb_mount_timeout_secs")]
    pub mount_timeout_secs: u64,
}

fn default_usb_key_path() -> String {
    "/run/lockchain/key.raw".to_string()
}

fn default_usb_mount_timeout_secs() -> u64 {
    10
}

impl Default for Usb {
    fn default() -> Self {
        Self {
            key_hex_path: default_usb_key_path(),
            expected_sha256: None,
            device_label: None,
            device_uuid: None,
            mount_timeout_secs: default_usb_mount_timeout_secs(),
        }
    }
}

/// Fallback passphrase tuning for emergency unlocks.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Fallback {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub askpass: bool,

    #[serde(default)]
    pub askpass_path: Option<String>,

    #[serde(default)]
    pub passphrase_salt: Option<String>,

    #[serde(default)]
    pub passphrase_xor: Option<String>,

    #[serde(default = "default_passphrase_iters")]
    pub passphrase_iters: u32,
}

fn default_passphrase_iters() -> u32 {
    250_000
}

impl Default for Fallback {
    fn default() -> Self {
        Self {
            enabled: false,
            askpass: false,
            askpass_path: Some("/usr/bin/systemd-ask-password".to_string()),
            passphrase_salt: None,
            passphrase_xor: None,
            passphrase_iters: default_passphrase_iters(),
        }
    }
}

/// Shared retry/backoff strategy used by higher level workflows.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RetryCfg {
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_base_delay")]
    pub base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay")]
    pub max_delay_ms: u64,

    #[serde(default = "default_retry_jitter")]
    pub jitter_ratio: f64,
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_base_delay() -> u64 {
    500
}

fn default_retry_max_delay() -> u64 {
    5_000
}

fn default_retry_jitter() -> f64 {
    0.1
}

impl Default for RetryCfg {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_attempts(),
            base_delay_ms: default_retry_base_delay(),
            max_delay_ms: default_retry_max_delay(),
            jitter_ratio: default_retry_jitter(),
        }
    }
}

/// Cadence of the background unlock loop.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SchedulerCfg {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

fn default_interval_secs() -> u64 {
    30
}

impl Default for SchedulerCfg {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
        }
    }
}

/// Where the health query endpoint listens.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct HealthCfg {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8787".to_string()
}

impl Default for HealthCfg {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

/// Top-level configuration snapshot loaded from disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct LockchainConfig {
    pub policy: Policy,

    #[serde(default)]
    pub crypto: CryptoCfg,

    #[serde(default)]
    pub usb: Usb,

    #[serde(default)]
    pub fallback: Fallback,

    #[serde(default)]
    pub retry: RetryCfg,

    #[serde(default)]
    pub scheduler: SchedulerCfg,

    #[serde(default)]
    pub health: HealthCfg,

    #[serde(skip)]
    pub path: PathBuf,

    #[serde(skip)]
    pub format: ConfigFormat,
}

/// Tracks whether we parsed TOML or YAML.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConfigFormat {
    #[default]
    Toml,
    Yaml,
}

impl LockchainConfig {
    /// Return the canonical system-wide configuration path.
    pub fn default_path() -> &'static Path {
        Path::new(DEFAULT_CONFIG_PATH)
    }

    /// Read a config file from disk, detect format, apply environment
    /// overrides, and reject it when validation reports any issue.
    pub fn load<P: AsRef<Path>>(path: P) -> LockchainResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let is_toml = matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some(ext) if ext.eq_ignore_ascii_case("toml")
        );
        let format = if is_toml {
            ConfigFormat::Toml
        } else {
            ConfigFormat::Yaml
        };
        let mut cfg = Self::parse(&contents, format)?;
        cfg.path = path.to_path_buf();
        cfg.apply_overrides(|key| env::var(key).ok());

        let issues = cfg.validate();
        if !issues.is_empty() {
            return Err(LockchainError::InvalidConfig(issues.join("; ")));
        }

        info!(
            "loaded configuration from {} ({} datasets)",
            path.display(),
            cfg.policy.datasets.len()
        );
        Ok(cfg)
    }

    /// Parse a configuration payload without touching the filesystem or environment.
    pub fn parse(contents: &str, format: ConfigFormat) -> LockchainResult<Self> {
        let mut cfg = match format {
            ConfigFormat::Toml => toml::from_str::<Self>(contents)?,
            ConfigFormat::Yaml => serde_yaml::from_str::<Self>(contents)?,
        };
        cfg.format = format;
        Ok(cfg)
    }

    /// Apply process-level overrides. Called once at load time so nothing deeper
    /// in the stack consults the environment.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(KEY_PATH_ENV).filter(|value| !value.trim().is_empty()) {
            self.usb.key_hex_path = path;
        }
    }

    /// JSON schema describing the on-disk format.
    pub fn json_schema() -> serde_json::Value {
        serde_json::to_value(schemars::schema_for!(LockchainConfig))
            .unwrap_or(serde_json::Value::Null)
    }

    /// Returns true when `dataset` is listed under `policy.datasets` or sits
    /// above/below a listed dataset.
    pub fn contains_dataset(&self, dataset: &str) -> bool {
        self.policy.datasets.iter().any(|configured| {
            configured == dataset
                || configured.starts_with(&format!("{dataset}/"))
                || dataset.starts_with(&format!("{configured}/"))
        })
    }

    /// Perform a validation pass and return human-readable issues.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        if self.policy.datasets.is_empty() {
            issues.push("policy.datasets must contain at least one dataset".to_string());
        }

        let mut seen = HashSet::new();
        for ds in &self.policy.datasets {
            let trimmed = ds.trim();
            if trimmed.is_empty() {
                issues.push("policy.datasets contains an empty dataset entry".to_string());
                continue;
            }
            if !looks_like_dataset_name(trimmed) {
                issues.push(format!(
                    "policy.datasets contains invalid dataset name: {trimmed}"
                ));
            }
            if !seen.insert(trimmed.to_string()) {
                issues.push(format!("duplicate dataset entry detected: {trimmed}"));
            }
        }

        if self.usb.key_hex_path.trim().is_empty() {
            issues.push("usb.key_hex_path must not be empty".to_string());
        }

        if let Some(expected) = &self.usb.expected_sha256 {
            if expected.len() != 64 || hex::decode(expected).is_err() {
                issues.push("usb.expected_sha256 must be a 64-character hex string".to_string());
            }
        }

        if self.fallback.enabled {
            match self.fallback.passphrase_salt.as_deref().map(str::trim) {
                None | Some("") => issues.push(
                    "fallback.enabled is true but fallback.passphrase_salt is missing".to_string(),
                ),
                Some(salt) if hex::decode(salt).is_err() => {
                    issues.push("fallback.passphrase_salt must be hex encoded".to_string())
                }
                Some(_) => {}
            }
            match self.fallback.passphrase_xor.as_deref().map(str::trim) {
                None | Some("") => issues.push(
                    "fallback.enabled is true but fallback.passphrase_xor is missing".to_string(),
                ),
                Some(xor) => match hex::decode(xor) {
                    Ok(bytes) if bytes.len() == 32 => {}
                    Ok(bytes) => issues.push(format!(
                        "fallback.passphrase_xor must decode to 32 bytes (got {})",
                        bytes.len()
                    )),
                    Err(_) => {
                        issues.push("fallback.passphrase_xor must be hex encoded".to_string())
                    }
                },
            }
            if self.fallback.passphrase_iters == 0 {
                issues.push("fallback.passphrase_iters must be at least 1".to_string());
            }
        }

        if self.retry.max_attempts == 0 {
            issues.push("retry.max_attempts must be at least 1".to_string());
        }
        if self.retry.base_delay_ms == 0 {
            issues.push("retry.base_delay_ms must be greater than 0".to_string());
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            issues.push(
                "retry.max_delay_ms must be greater than or equal to retry.base_delay_ms"
                    .to_string(),
            );
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_ratio) {
            issues.push("retry.jitter_ratio must be between 0.0 and 1.0".to_string());
        }

        if self.crypto.timeout_secs == 0 {
            issues.push("crypto.timeout_secs must be greater than 0".to_string());
        }
        if self.scheduler.interval_secs == 0 {
            issues.push("scheduler.interval_secs must be greater than 0".to_string());
        }
        if self.health.bind_addr.parse::<SocketAddr>().is_err() {
            issues.push(format!(
                "health.bind_addr is not a socket address: {}",
                self.health.bind_addr
            ));
        }

        issues
    }

    /// Path where the USB key material lives.
    pub fn key_hex_path(&self) -> PathBuf {
        PathBuf::from(&self.usb.key_hex_path)
    }

    /// Per-call timeout for provider commands.
    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.crypto.timeout_secs)
    }

    /// Optional override for the `zfs` CLI path.
    pub fn zfs_binary_path(&self) -> Option<PathBuf> {
        self.policy.zfs_path.as_ref().map(PathBuf::from)
    }

    /// Optional override for the `zpool` CLI path.
    pub fn zpool_binary_path(&self) -> Option<PathBuf> {
        self.policy.zpool_path.as_ref().map(PathBuf::from)
    }

    /// Backoff policy derived from the `[retry]` section.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_config(&self.retry)
    }

    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler.interval_secs)
    }
}
