//! ZFS provider integration.
//!
//! `system` implements `KeyProvider` and `EphemeralProvider` using the host
//! `zfs`/`zpool` CLIs. `command` and `parse` isolate shell execution and output
//! parsing so the provider stays testable against fake binaries.

mod command;
mod parse;
mod system;

pub use system::{SystemZfsProvider, SCRATCH_POOL_PREFIX};
