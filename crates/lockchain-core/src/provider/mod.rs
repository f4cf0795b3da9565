//! Provider contracts used by `lockchain-core` workflows.
//!
//! The traits and types are sourced from `lockchain-provider`; the production
//! adapter lives in `lockchain-zfs`. [`memory::MemoryProvider`] is an in-process
//! adapter with fault injection for exercising the engine without real pools.

pub mod memory;

pub use lockchain_provider::{
    discovery_order, sort_discovery_order, DatasetKeyDescriptor, EphemeralProvider, KeyProvider,
    KeyState, KeyStatusSnapshot,
};
pub use memory::{MemoryProvider, Operation};

use crate::error::{LockchainError, LockchainResult};

/// Check that `snapshot` has exactly one entry per requested dataset, in
/// request order.
pub fn ensure_request_order(requested: &[String], snapshot: &KeyStatusSnapshot) -> LockchainResult<()> {
    if requested.len() != snapshot.len() {
        return Err(LockchainError::Provider(format!(
            "status snapshot returned {} entries for {} requested datasets",
            snapshot.len(),
            requested.len()
        )));
    }
    for (idx, (want, got)) in requested.iter().zip(snapshot.iter()).enumerate() {
        if want != &got.dataset {
            return Err(LockchainError::Provider(format!(
                "status snapshot entry {idx} is {} but {want} was requested",
                got.dataset
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(dataset: &str) -> DatasetKeyDescriptor {
        DatasetKeyDescriptor {
            dataset: dataset.to_string(),
            encryption_root: dataset.to_string(),
            state: KeyState::Locked,
        }
    }

    #[test]
    fn order_check_rejects_reordered_or_short_snapshots() {
        let requested = vec!["tank/a".to_string(), "tank/b".to_string()];
        assert!(ensure_request_order(&requested, &vec![entry("tank/a"), entry("tank/b")]).is_ok());
        assert!(ensure_request_order(&requested, &vec![entry("tank/b"), entry("tank/a")]).is_err());
        assert!(ensure_request_order(&requested, &vec![entry("tank/a")]).is_err());
    }
}
