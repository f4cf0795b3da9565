//! In-memory provider used by workflow tests and dry runs.
//!
//! Datasets live in a shared table guarded by a mutex, so clones observe the
//! same state. Faults can be queued per operation (optionally scoped to one
//! dataset) and surface as transient `Provider` timeouts.

use super::{sort_discovery_order, DatasetKeyDescriptor, EphemeralProvider, KeyProvider, KeyState};
use crate::error::{LockchainError, LockchainResult};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Provider operations that can be counted and faulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    EncryptionRoot,
    LockedDescendants,
    LoadKeyTree,
    DescribeDatasets,
    CreateEphemeral,
    DestroyEphemeral,
}

#[derive(Debug, Clone)]
struct Entry {
    root: String,
    locked: bool,
    key_digest: Option<[u8; 32]>,
}

#[derive(Debug)]
struct Fault {
    op: Operation,
    target: Option<String>,
    /// `None` fails forever.
    remaining: Option<u32>,
    message: String,
}

#[derive(Debug, Default)]
struct State {
    datasets: BTreeMap<String, Entry>,
    refuse: BTreeSet<String>,
    faults: Vec<Fault>,
    calls: HashMap<Operation, u32>,
    observed_keys: Vec<[u8; 32]>,
    scratch_seq: u32,
}

/// Thread-safe in-memory stand-in for a storage system.
#[derive(Debug, Clone, Default)]
pub struct MemoryProvider {
    state: Arc<Mutex<State>>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `dataset` under encryption root `root`.
    pub fn with_dataset(self, dataset: &str, root: &str, locked: bool) -> Self {
        self.state().datasets.insert(
            dataset.to_string(),
            Entry {
                root: root.to_string(),
                locked,
                key_digest: None,
            },
        );
        self
    }

    /// Require `key` for every dataset under encryption root `root`.
    pub fn with_root_key(self, root: &str, key: &[u8]) -> Self {
        let digest = digest(key);
        for entry in self.state().datasets.values_mut() {
            if entry.root == root {
                entry.key_digest = Some(digest);
            }
        }
        self
    }

    /// Make `dataset` refuse the key during a tree load, which stops the walk.
    pub fn refuse_key(self, dataset: &str) -> Self {
        self.state().refuse.insert(dataset.to_string());
        self
    }

    /// Fail the next `times` calls of `op` (touching `target`, when given) with a timeout.
    pub fn fail_next(&self, op: Operation, target: Option<&str>, times: u32) {
        self.push_fault(op, target, Some(times));
    }

    /// Fail every call of `op` (touching `target`, when given) with a timeout.
    pub fn fail_always(&self, op: Operation, target: Option<&str>) {
        self.push_fault(op, target, None);
    }

    pub fn calls(&self, op: Operation) -> u32 {
        self.state().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn is_locked(&self, dataset: &str) -> Option<bool> {
        self.state().datasets.get(dataset).map(|entry| entry.locked)
    }

    pub fn exists(&self, dataset: &str) -> bool {
        self.state().datasets.contains_key(dataset)
    }

    pub fn lock(&self, dataset: &str) {
        if let Some(entry) = self.state().datasets.get_mut(dataset) {
            entry.locked = true;
        }
    }

    /// SHA-256 digests of every key passed to `load_key_tree`, in call order.
    pub fn observed_key_digests(&self) -> Vec<String> {
        self.state().observed_keys.iter().map(hex::encode).collect()
    }

    fn push_fault(&self, op: Operation, target: Option<&str>, remaining: Option<u32>) {
        self.state().faults.push(Fault {
            op,
            target: target.map(str::to_string),
            remaining,
            message: format!("{op:?} timed out"),
        });
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count the call, then fire the first matching fault, if any.
    fn enter(&self, op: Operation, targets: &[&str]) -> LockchainResult<MutexGuard<'_, State>> {
        let mut state = self.state();
        *state.calls.entry(op).or_insert(0) += 1;

        let hit = state.faults.iter_mut().find(|fault| {
            fault.op == op
                && fault.remaining != Some(0)
                && fault
                    .target
                    .as_deref()
                    .map_or(true, |target| targets.contains(&target))
        });
        if let Some(fault) = hit {
            if let Some(remaining) = fault.remaining.as_mut() {
                *remaining -= 1;
            }
            return Err(LockchainError::Provider(fault.message.clone()));
        }
        Ok(state)
    }
}

fn digest(key: &[u8]) -> [u8; 32] {
    Sha256::digest(key).into()
}

fn is_under(dataset: &str, root: &str) -> bool {
    dataset == root
        || dataset
            .strip_prefix(root)
            .is_some_and(|rest| rest.starts_with('/'))
}

impl KeyProvider for MemoryProvider {
    type Error = LockchainError;

    fn encryption_root(&self, dataset: &str) -> LockchainResult<String> {
        let state = self.enter(Operation::EncryptionRoot, &[dataset])?;
        state
            .datasets
            .get(dataset)
            .map(|entry| entry.root.clone())
            .ok_or_else(|| LockchainError::DatasetNotFound(dataset.to_string()))
    }

    fn locked_descendants(&self, root: &str) -> LockchainResult<Vec<String>> {
        let state = self.enter(Operation::LockedDescendants, &[root])?;
        if !state.datasets.contains_key(root) {
            return Err(LockchainError::DatasetNotFound(root.to_string()));
        }
        let mut locked: Vec<String> = state
            .datasets
            .iter()
            .filter(|(name, entry)| entry.locked && entry.root == root && is_under(name, root))
            .map(|(name, _)| name.clone())
            .collect();
        sort_discovery_order(&mut locked);
        Ok(locked)
    }

    fn load_key_tree(&self, root: &str, key: &[u8]) -> LockchainResult<Vec<String>> {
        let mut state = self.enter(Operation::LoadKeyTree, &[root])?;
        let offered = digest(key);
        state.observed_keys.push(offered);

        let root_entry = state
            .datasets
            .get(root)
            .ok_or_else(|| LockchainError::DatasetNotFound(root.to_string()))?;
        if root_entry.key_digest.is_some_and(|want| want != offered) || state.refuse.contains(root)
        {
            return Err(LockchainError::Provider(format!(
                "Key load error: incorrect key provided for {root}"
            )));
        }

        let mut members: Vec<String> = state
            .datasets
            .iter()
            .filter(|(name, entry)| entry.root == root && is_under(name, root))
            .map(|(name, _)| name.clone())
            .collect();
        sort_discovery_order(&mut members);

        let mut unlocked = Vec::new();
        for name in members {
            if state.refuse.contains(&name) {
                break;
            }
            if let Some(entry) = state.datasets.get_mut(&name) {
                if entry.locked {
                    entry.locked = false;
                    unlocked.push(name);
                }
            }
        }
        Ok(unlocked)
    }

    fn describe_datasets(&self, datasets: &[String]) -> LockchainResult<Vec<DatasetKeyDescriptor>> {
        let targets: Vec<&str> = datasets.iter().map(String::as_str).collect();
        let state = self.enter(Operation::DescribeDatasets, &targets)?;
        Ok(datasets
            .iter()
            .map(|dataset| match state.datasets.get(dataset) {
                Some(entry) => DatasetKeyDescriptor {
                    dataset: dataset.clone(),
                    encryption_root: entry.root.clone(),
                    state: if entry.locked {
                        KeyState::Locked
                    } else {
                        KeyState::Unlocked
                    },
                },
                None => DatasetKeyDescriptor {
                    dataset: dataset.clone(),
                    encryption_root: "-".to_string(),
                    state: KeyState::Unavailable("dataset does not exist".to_string()),
                },
            })
            .collect())
    }
}

impl EphemeralProvider for MemoryProvider {
    fn create_ephemeral(&self, key: &[u8]) -> LockchainResult<String> {
        let mut state = self.enter(Operation::CreateEphemeral, &[])?;
        state.scratch_seq += 1;
        let name = format!("lcscratch{}/selftest", state.scratch_seq);
        state.datasets.insert(
            name.clone(),
            Entry {
                root: name.clone(),
                locked: true,
                key_digest: Some(digest(key)),
            },
        );
        Ok(name)
    }

    fn destroy_ephemeral(&self, dataset: &str) -> LockchainResult<()> {
        let mut state = self.enter(Operation::DestroyEphemeral, &[dataset])?;
        let before = state.datasets.len();
        state.datasets.retain(|name, _| !is_under(name, dataset));
        if state.datasets.len() == before {
            return Err(LockchainError::DatasetNotFound(dataset.to_string()));
        }
        Ok(())
    }
}
