use std::path::PathBuf;
use thiserror::Error;

/// Result alias for core operations.
pub type LockchainResult<T> = Result<T, LockchainError>;

#[derive(Error, Debug)]
pub enum LockchainError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("YAML config parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("configuration error: {0}")]
    InvalidConfig(String),

    #[error("dataset `{0}` is not declared in policy")]
    DatasetNotConfigured(String),

    #[error("dataset `{0}` does not exist")]
    DatasetNotFound(String),

    #[error(transparent)]
    KeySource(#[from] KeySourceError),

    #[error("recovery requires the confirmation token `{expected}`")]
    RecoveryNotConfirmed { expected: &'static str },

    #[error("provider error: {0}")]
    Provider(String),
}

/// Failures raised while acquiring key material. None of these are retried.
#[derive(Error, Debug)]
pub enum KeySourceError {
    #[error("key material unavailable at {path}: {reason}")]
    KeyUnavailable { path: PathBuf, reason: String },

    #[error("invalid key material at {path}: {reason}")]
    InvalidKeyFormat { path: PathBuf, reason: String },

    #[error("key checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("fallback key derivation is disabled by policy")]
    FallbackDisabled,

    #[error("fallback key derivation was not requested")]
    FallbackNotRequested,

    #[error("fallback key derivation failed: {0}")]
    DerivationFailed(String),
}

impl KeySourceError {
    pub fn code(&self) -> &'static str {
        match self {
            KeySourceError::KeyUnavailable { .. } => "key.unavailable",
            KeySourceError::InvalidKeyFormat { .. } => "key.invalid_format",
            KeySourceError::ChecksumMismatch { .. } => "key.checksum_mismatch",
            KeySourceError::FallbackDisabled => "key.fallback_disabled",
            KeySourceError::FallbackNotRequested => "key.fallback_not_requested",
            KeySourceError::DerivationFailed(_) => "key.derivation_failed",
        }
    }
}

impl LockchainError {
    /// Only provider failures are considered transient; everything else points
    /// at a misconfiguration that retrying cannot fix.
    pub fn is_transient(&self) -> bool {
        matches!(self, LockchainError::Provider(_))
    }

    /// Stable identifier consumers can key alert routing off.
    pub fn code(&self) -> &'static str {
        match self {
            LockchainError::Io(_) => "io.error",
            LockchainError::Toml(_) | LockchainError::Yaml(_) => "config.parse",
            LockchainError::InvalidConfig(_) => "config.invalid",
            LockchainError::DatasetNotConfigured(_) => "dataset.not_configured",
            LockchainError::DatasetNotFound(_) => "dataset.not_found",
            LockchainError::KeySource(err) => err.code(),
            LockchainError::RecoveryNotConfirmed { .. } => "audit.recovery_not_confirmed",
            LockchainError::Provider(_) => "provider.error",
        }
    }
}
