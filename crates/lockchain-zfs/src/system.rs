//! System-backed `KeyProvider` implementation.
//!
//! Shells out to the host `zfs` and `zpool` binaries, gates key operations on
//! pool health, and hosts self-test scratch datasets on file-backed pools.

use crate::command::{CommandRunner, Output};
use crate::parse::{
    parse_encryption_root, parse_keystatus, parse_pairs, parse_rows, pool_from_dataset,
};
use lockchain_core::config::{detect_zfs_binary_path, detect_zpool_binary_path};
use lockchain_core::error::{LockchainError, LockchainResult};
use lockchain_core::LockchainConfig;
use lockchain_provider::{
    discovery_order, DatasetKeyDescriptor, EphemeralProvider, KeyProvider, KeyState,
    KeyStatusSnapshot,
};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tempfile::TempDir;

/// Prefix of every pool created for self-tests; nothing else is ever destroyed.
pub const SCRATCH_POOL_PREFIX: &str = "lcscratch";
const SCRATCH_DATASET: &str = "selftest";
const SCRATCH_VDEV_BYTES: u64 = 64 * 1024 * 1024;

struct ScratchPool {
    pool: String,
    // Removed (with its vdev image) after the pool is destroyed.
    _backing: TempDir,
}

/// Provider that manages dataset keys via the host `zfs`/`zpool` CLIs.
#[derive(Clone)]
pub struct SystemZfsProvider {
    zfs: CommandRunner,
    zpool: CommandRunner,
    scratch: Arc<Mutex<HashMap<String, ScratchPool>>>,
}

impl SystemZfsProvider {
    /// Build a provider from configuration, discovering binaries that are not configured.
    pub fn from_config(config: &LockchainConfig) -> LockchainResult<Self> {
        let zfs = resolve_binary("zfs", config.zfs_binary_path(), detect_zfs_binary_path)?;
        let zpool = resolve_binary("zpool", config.zpool_binary_path(), detect_zpool_binary_path)?;
        Self::with_paths(zfs, zpool, config.provider_timeout())
    }

    /// Construct a provider with explicit binaries and per-call timeout.
    pub fn with_paths(zfs: PathBuf, zpool: PathBuf, timeout: Duration) -> LockchainResult<Self> {
        for path in [&zfs, &zpool] {
            if !path.exists() {
                return Err(LockchainError::InvalidConfig(format!(
                    "binary not found at {}",
                    path.display()
                )));
            }
        }
        Ok(Self {
            zfs: CommandRunner::new(zfs, timeout),
            zpool: CommandRunner::new(zpool, timeout),
            scratch: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn run_checked(
        runner: &CommandRunner,
        args: &[&str],
        input: Option<&[u8]>,
        target: &str,
    ) -> LockchainResult<Output> {
        let out = runner.run(args, input)?;
        if !out.success() {
            return Err(classify_cli_error(runner.binary(), args, &out, target));
        }
        Ok(out)
    }

    fn zfs(&self, args: &[&str], target: &str) -> LockchainResult<Output> {
        Self::run_checked(&self.zfs, args, None, target)
    }

    fn zpool(&self, args: &[&str], target: &str) -> LockchainResult<Output> {
        Self::run_checked(&self.zpool, args, None, target)
    }

    /// Fail unless `zpool list` reports `pool` as ONLINE.
    fn ensure_pool_ready(&self, pool: &str) -> LockchainResult<()> {
        let out = self.zpool(&["list", "-H", "-o", "name,health", pool], pool)?;
        let health = parse_pairs(&out.stdout)
            .into_iter()
            .find(|(name, _)| name == pool)
            .map(|(_, health)| health)
            .ok_or_else(|| {
                LockchainError::Provider(format!("pool {pool} not reported by zpool list"))
            })?;
        if !health.eq_ignore_ascii_case("online") {
            return Err(LockchainError::Provider(format!(
                "pool {pool} is not healthy (reported state: {health})"
            )));
        }
        Ok(())
    }

    fn ensure_dataset_pool_ready(&self, dataset: &str) -> LockchainResult<()> {
        let pool = pool_from_dataset(dataset).ok_or_else(|| {
            LockchainError::InvalidConfig(format!(
                "dataset `{dataset}` does not map to a valid pool name"
            ))
        })?;
        self.ensure_pool_ready(pool)
    }

    /// Datasets under `root` that share its encryption root, with their keystatus,
    /// in discovery order.
    fn key_tree(&self, root: &str) -> LockchainResult<Vec<(String, KeyState)>> {
        let out = self.zfs(
            &["list", "-H", "-r", "-o", "name,encryptionroot,keystatus", root],
            root,
        )?;
        let mut members: Vec<(String, KeyState)> = parse_rows(&out.stdout, 3)
            .into_iter()
            .filter(|row| row[1] == root)
            .map(|row| (row[0].clone(), parse_keystatus(&row[2])))
            .collect();
        members.sort_by(|a, b| discovery_order(&a.0, &b.0));
        Ok(members)
    }

    /// `zfs load-key -L prompt`, treating "already loaded" as success.
    fn load_key(&self, dataset: &str, key: &[u8]) -> LockchainResult<()> {
        let args = ["load-key", "-L", "prompt", dataset];
        let out = self.zfs.run(&args, Some(key))?;
        if out.success() || out.diagnostic().contains("Key already loaded") {
            return Ok(());
        }
        Err(classify_cli_error(self.zfs.binary(), &args, &out, dataset))
    }

    fn describe_one(&self, dataset: &str) -> LockchainResult<DatasetKeyDescriptor> {
        let out = self.zfs(
            &["get", "-H", "-o", "property,value", "encryptionroot,keystatus", dataset],
            dataset,
        )?;
        let mut encryption_root = None;
        let mut state = KeyState::Unavailable("keystatus not reported".into());
        for (property, value) in parse_pairs(&out.stdout) {
            match property.as_str() {
                "encryptionroot" => encryption_root = parse_encryption_root(&value),
                "keystatus" => state = parse_keystatus(&value),
                _ => {}
            }
        }
        Ok(DatasetKeyDescriptor {
            dataset: dataset.to_string(),
            encryption_root: encryption_root.unwrap_or_else(|| "-".to_string()),
            state,
        })
    }

    fn scratch(&self) -> MutexGuard<'_, HashMap<String, ScratchPool>> {
        self.scratch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn destroy_pool(&self, pool: &str) -> LockchainResult<()> {
        self.zpool(&["destroy", "-f", pool], pool).map(|_| ())
    }
}

impl KeyProvider for SystemZfsProvider {
    type Error = LockchainError;

    fn encryption_root(&self, dataset: &str) -> LockchainResult<String> {
        let out = self.zfs(&["get", "-H", "-o", "value", "encryptionroot", dataset], dataset)?;
        parse_encryption_root(&out.stdout).ok_or_else(|| {
            LockchainError::InvalidConfig(format!("dataset `{dataset}` is not encrypted"))
        })
    }

    fn locked_descendants(&self, root: &str) -> LockchainResult<Vec<String>> {
        self.ensure_dataset_pool_ready(root)?;
        Ok(self
            .key_tree(root)?
            .into_iter()
            .filter(|(_, state)| *state == KeyState::Locked)
            .map(|(name, _)| name)
            .collect())
    }

    fn load_key_tree(&self, root: &str, key: &[u8]) -> LockchainResult<Vec<String>> {
        self.ensure_dataset_pool_ready(root)?;
        self.load_key(root, key)?;

        let mut unlocked = Vec::new();
        for (dataset, state) in self.key_tree(root)? {
            if state.is_unlocked() {
                unlocked.push(dataset);
                continue;
            }
            if dataset == root {
                return Err(LockchainError::Provider(format!(
                    "encryption root {root} remained locked after load-key"
                )));
            }
            match self.load_key(&dataset, key) {
                Ok(()) => unlocked.push(dataset),
                Err(err) => {
                    warn!("stopping key walk under {root}: {dataset} refused the key ({err})");
                    break;
                }
            }
        }
        Ok(unlocked)
    }

    fn describe_datasets(&self, datasets: &[String]) -> LockchainResult<KeyStatusSnapshot> {
        let mut snapshot = Vec::with_capacity(datasets.len());
        let mut pools: HashMap<String, Option<String>> = HashMap::new();

        for dataset in datasets {
            let Some(pool) = pool_from_dataset(dataset) else {
                snapshot.push(unavailable(dataset, "not a valid dataset name".into()));
                continue;
            };
            if !pools.contains_key(pool) {
                let gate = match self.ensure_pool_ready(pool) {
                    Ok(()) => None,
                    Err(LockchainError::DatasetNotFound(_)) => {
                        Some(format!("pool {pool} does not exist"))
                    }
                    Err(err) => return Err(err),
                };
                pools.insert(pool.to_string(), gate);
            }
            if let Some(Some(reason)) = pools.get(pool) {
                snapshot.push(unavailable(dataset, reason.clone()));
                continue;
            }
            match self.describe_one(dataset) {
                Ok(entry) => snapshot.push(entry),
                Err(LockchainError::DatasetNotFound(_)) => {
                    snapshot.push(unavailable(dataset, "dataset does not exist".into()))
                }
                Err(err) => return Err(err),
            }
        }
        Ok(snapshot)
    }
}

impl EphemeralProvider for SystemZfsProvider {
    fn create_ephemeral(&self, key: &[u8]) -> LockchainResult<String> {
        let backing = tempfile::Builder::new().prefix("lockchain-selftest").tempdir()?;
        let vdev = backing.path().join("vdev.img");
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&vdev)?
            .set_len(SCRATCH_VDEV_BYTES)?;

        let pool = format!("{SCRATCH_POOL_PREFIX}{:08x}", rand::random::<u32>());
        let vdev_arg = vdev.to_string_lossy().into_owned();
        self.zpool(
            &["create", "-f", "-O", "mountpoint=none", &pool, &vdev_arg],
            &pool,
        )?;
        let dataset = format!("{pool}/{SCRATCH_DATASET}");
        self.scratch().insert(
            dataset.clone(),
            ScratchPool {
                pool: pool.clone(),
                _backing: backing,
            },
        );

        let keyed = Self::run_checked(
            &self.zfs,
            &[
                "create",
                "-o",
                "encryption=on",
                "-o",
                "keyformat=raw",
                "-o",
                "keylocation=prompt",
                "-o",
                "mountpoint=none",
                &dataset,
            ],
            Some(key),
            &dataset,
        )
        .and_then(|_| self.zfs(&["unload-key", &dataset], &dataset));
        if let Err(err) = keyed {
            if let Err(cleanup) = self.destroy_ephemeral(&dataset) {
                warn!("failed to clean up scratch pool {pool}: {cleanup}");
            }
            return Err(err);
        }

        info!("created scratch dataset {dataset}");
        Ok(dataset)
    }

    fn destroy_ephemeral(&self, dataset: &str) -> LockchainResult<()> {
        let tracked = self.scratch().remove(dataset);
        let pool = match &tracked {
            Some(entry) => entry.pool.clone(),
            None => pool_from_dataset(dataset)
                .filter(|pool| pool.starts_with(SCRATCH_POOL_PREFIX))
                .map(str::to_string)
                .ok_or_else(|| {
                    LockchainError::InvalidConfig(format!(
                        "refusing to destroy `{dataset}`: not a self-test dataset"
                    ))
                })?,
        };
        self.destroy_pool(&pool)?;
        debug!("destroyed scratch pool {pool}");
        Ok(())
    }
}

fn unavailable(dataset: &str, reason: String) -> DatasetKeyDescriptor {
    DatasetKeyDescriptor {
        dataset: dataset.to_string(),
        encryption_root: "-".to_string(),
        state: KeyState::Unavailable(reason),
    }
}

fn resolve_binary(
    name: &str,
    configured: Option<PathBuf>,
    detect: fn() -> Option<String>,
) -> LockchainResult<PathBuf> {
    configured
        .or_else(|| detect().map(PathBuf::from))
        .ok_or_else(|| {
            LockchainError::InvalidConfig(format!(
                "unable to locate {name} binary; set policy.{name}_path"
            ))
        })
}

/// Missing datasets and pools map to `DatasetNotFound`; anything else is a
/// provider failure.
fn classify_cli_error(binary: &Path, args: &[&str], output: &Output, target: &str) -> LockchainError {
    let diagnostic = output.diagnostic();
    let lower = diagnostic.to_ascii_lowercase();

    if lower.contains("dataset does not exist")
        || lower.contains("no such pool")
        || lower.contains("pool does not exist")
    {
        debug!("{} {}: {diagnostic}", binary.display(), args.join(" "));
        return LockchainError::DatasetNotFound(target.to_string());
    }

    LockchainError::Provider(format!(
        "{} {} exited with code {}: {}",
        binary.display(),
        args.join(" "),
        output.status,
        if diagnostic.is_empty() {
            "no additional output"
        } else {
            diagnostic
        }
    ))
}
