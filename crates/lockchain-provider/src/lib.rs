#![forbid(unsafe_code)]

//! Provider contracts shared across LockChain.
//!
//! The rest of the workspace is free to define workflows and operator surfaces
//! without depending on concrete system integrations. Implementations (the
//! `zfs` shell-out adapter, the in-memory adapter used by tests, future RPC
//! backends) must honour the ordering and error-kind rules documented here.

use std::cmp::Ordering;
use std::error::Error;

/// Normalised keystatus for a dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyState {
    /// Key material is not loaded; contents are sealed.
    Locked,
    /// Key material is loaded; contents are accessible.
    Unlocked,
    /// The provider could not report a keystatus (unencrypted, unknown value, ...).
    Unavailable(String),
}

impl KeyState {
    pub fn is_unlocked(&self) -> bool {
        matches!(self, KeyState::Unlocked)
    }

    pub fn label(&self) -> &str {
        match self {
            KeyState::Locked => "locked",
            KeyState::Unlocked => "unlocked",
            KeyState::Unavailable(_) => "unavailable",
        }
    }
}

/// High-level descriptor for dataset encryption metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetKeyDescriptor {
    pub dataset: String,
    pub encryption_root: String,
    pub state: KeyState,
}

/// Snapshot of keystatus information for a group of datasets.
///
/// Entries follow the order of the request that produced the snapshot; they are
/// never reordered or deduplicated.
pub type KeyStatusSnapshot = Vec<DatasetKeyDescriptor>;

/// Abstraction over the encrypted-storage key-management surface.
///
/// Implementations are expected to provide a thin, testable surface over the
/// underlying system interface (CLI, RPC, etc.), so higher-level services can
/// be exercised without invoking real binaries.
pub trait KeyProvider {
    type Error: Error + Send + Sync + 'static;

    /// Resolve the encryption root responsible for `dataset`.
    ///
    /// Unknown datasets must fail with the implementation's "not found" error
    /// rather than a generic provider failure.
    fn encryption_root(&self, dataset: &str) -> Result<String, Self::Error>;

    /// Return datasets under `root` (including the root itself) that share its
    /// encryption root and still report a sealed keystatus, in discovery order
    /// (see [`discovery_order`]).
    fn locked_descendants(&self, root: &str) -> Result<Vec<String>, Self::Error>;

    /// Attempt to load a key for `root` and any descendants that share it.
    ///
    /// The root is always attempted first. A failing descendant stops the walk
    /// and the datasets confirmed so far are returned; only a root failure (or
    /// a failure of the underlying system) is reported as an error.
    fn load_key_tree(&self, root: &str, key: &[u8]) -> Result<Vec<String>, Self::Error>;

    /// Describe the keystatus for the provided dataset list, one entry per
    /// input element, preserving input order exactly.
    fn describe_datasets(&self, datasets: &[String]) -> Result<KeyStatusSnapshot, Self::Error>;
}

/// Providers that can host a throwaway encrypted unit for self-tests.
pub trait EphemeralProvider: KeyProvider {
    /// Create a new encrypted dataset keyed with `key`, leave it locked, and
    /// return its identifier.
    fn create_ephemeral(&self, key: &[u8]) -> Result<String, Self::Error>;

    /// Remove a dataset previously returned by [`EphemeralProvider::create_ephemeral`].
    fn destroy_ephemeral(&self, dataset: &str) -> Result<(), Self::Error>;
}

/// Compare two dataset identifiers in discovery order: parents before their
/// children, siblings lexically.
pub fn discovery_order(left: &str, right: &str) -> Ordering {
    left.split('/').cmp(right.split('/'))
}

/// Sort `datasets` in place using [`discovery_order`].
pub fn sort_discovery_order(datasets: &mut [String]) {
    datasets.sort_by(|a, b| discovery_order(a, b));
}
