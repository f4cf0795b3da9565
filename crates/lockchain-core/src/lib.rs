//! Core building blocks shared by LockChain binaries.
//!
//! Configuration, key sources, the unlock engine, named workflows, and the
//! health/scheduler loop live here so downstream crates only supply a provider
//! and an operator surface.

pub mod config;
pub mod error;
pub mod events;
pub mod fallback;
pub mod health;
pub mod key_source;
pub mod keyfile;
pub mod logging;
pub mod provider;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod workflow;

pub use config::{ConfigFormat, CryptoCfg, Fallback, LockchainConfig, Policy, RetryCfg, Usb};
pub use error::{KeySourceError, LockchainError, LockchainResult};
pub use events::{EventBus, EventCode};
pub use fallback::derive_fallback_key;
pub use health::{HealthReporter, HealthSnapshot, HealthState};
pub use key_source::{FallbackRequest, KeyMaterial, KeySlot, KeySource, UsbKeySource};
pub use provider::{
    DatasetKeyDescriptor, EphemeralProvider, KeyProvider, KeyState, KeyStatusSnapshot,
};
pub use retry::RetryPolicy;
pub use scheduler::{Scheduler, Trigger};
pub use service::{
    DatasetStatus, LockchainService, UnlockOptions, UnlockReport, WorkflowFailure, WorkflowState,
};
pub use workflow::{WorkflowEvent, WorkflowLevel, WorkflowReport};
