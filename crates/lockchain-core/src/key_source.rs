//! Key sources: removable-media key files and the emergency derivation path.
//!
//! `KeyMaterial` never leaves this module as anything but a borrowed slice, is
//! not `Clone`, redacts itself in `Debug`, and zeroes its buffer on drop.
//! Holders check it out through a [`KeySlot`], which admits one holder at a time.

use crate::config::Fallback;
use crate::error::{KeySourceError, LockchainError, LockchainResult};
use crate::fallback::{self, FallbackParams};
use crate::keyfile::{read_key_file, write_raw_key_file, KEY_LEN};
use log::{debug, info};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::{Mutex, MutexGuard};
use zeroize::Zeroizing;

/// Exactly 32 bytes of secret key material.
pub struct KeyMaterial {
    bytes: Zeroizing<[u8; KEY_LEN]>,
}

impl KeyMaterial {
    pub(crate) fn from_array(bytes: Zeroizing<[u8; KEY_LEN]>) -> Self {
        Self { bytes }
    }

    /// Copy `bytes` into a fresh key buffer; anything but 32 bytes is rejected.
    pub fn from_slice(origin: &Path, bytes: &[u8]) -> LockchainResult<Self> {
        if bytes.len() != KEY_LEN {
            return Err(KeySourceError::InvalidKeyFormat {
                path: origin.to_path_buf(),
                reason: format!("expected {KEY_LEN} bytes, got {}", bytes.len()),
            }
            .into());
        }
        let mut raw = Zeroizing::new([0u8; KEY_LEN]);
        raw.copy_from_slice(bytes);
        Ok(Self { bytes: raw })
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }

    /// Hex encoded SHA-256 of the key; safe to log.
    pub fn sha256_hex(&self) -> String {
        hex::encode(Sha256::digest(&self.bytes[..]))
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyMaterial(<redacted>)")
    }
}

/// Where a key came from, reported in workflow events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOrigin {
    Usb { normalized: bool },
    Fallback,
    Override,
}

/// Source of key material consumed by the workflow engine.
pub trait KeySource: Send + Sync {
    /// Read a key file from removable media.
    ///
    /// Hex content is decoded and the file is rewritten in raw form (mode 0400);
    /// raw content is passed through untouched. When `expected_checksum` is set
    /// the SHA-256 of the raw bytes must match it.
    fn load_usb_key(
        &self,
        path: &Path,
        expected_checksum: Option<&str>,
    ) -> LockchainResult<(KeyMaterial, bool)>;

    /// Derive the key from a passphrase via the configured fallback scheme.
    fn derive_fallback_key(
        &self,
        passphrase: &[u8],
        salt: &[u8],
        xor_blob: &[u8],
        iterations: u32,
    ) -> LockchainResult<KeyMaterial>;
}

/// Filesystem-backed key source used in production.
#[derive(Debug, Clone)]
pub struct UsbKeySource {
    fallback_enabled: bool,
}

impl UsbKeySource {
    pub fn new(fallback: &Fallback) -> Self {
        Self {
            fallback_enabled: fallback.enabled,
        }
    }
}

impl KeySource for UsbKeySource {
    fn load_usb_key(
        &self,
        path: &Path,
        expected_checksum: Option<&str>,
    ) -> LockchainResult<(KeyMaterial, bool)> {
        let (raw, normalized) = read_key_file(path)?;
        let key = KeyMaterial::from_array(raw);
        verify_checksum(&key, expected_checksum)?;
        if normalized {
            write_raw_key_file(path, key.as_bytes())?;
            info!(
                "normalised hex key material at {} to raw bytes (mode 0400)",
                path.display()
            );
        }
        Ok((key, normalized))
    }

    fn derive_fallback_key(
        &self,
        passphrase: &[u8],
        salt: &[u8],
        xor_blob: &[u8],
        iterations: u32,
    ) -> LockchainResult<KeyMaterial> {
        if !self.fallback_enabled {
            return Err(KeySourceError::FallbackDisabled.into());
        }
        fallback::derive_fallback_key(passphrase, salt, xor_blob, iterations)
    }
}

/// Compare the key digest against `expected` (case-insensitive hex).
pub fn verify_checksum(key: &KeyMaterial, expected: Option<&str>) -> LockchainResult<()> {
    let Some(expected) = expected.map(str::trim).filter(|value| !value.is_empty()) else {
        debug!("usb.expected_sha256 not configured; skipping checksum verification");
        return Ok(());
    };
    let actual = key.sha256_hex();
    if !expected.eq_ignore_ascii_case(&actual) {
        return Err(KeySourceError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        }
        .into());
    }
    Ok(())
}

/// How the fallback passphrase should be obtained when it is requested.
#[derive(Clone)]
pub enum FallbackRequest {
    /// Passphrase supplied by the caller.
    Passphrase(Zeroizing<String>),
    /// Ask the configured askpass helper for the passphrase.
    Askpass,
}

impl fmt::Debug for FallbackRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackRequest::Passphrase(_) => f.write_str("Passphrase(<redacted>)"),
            FallbackRequest::Askpass => f.write_str("Askpass"),
        }
    }
}

impl FallbackRequest {
    /// Resolve the request into passphrase bytes.
    pub fn passphrase(&self, fallback: &Fallback) -> LockchainResult<Zeroizing<Vec<u8>>> {
        match self {
            FallbackRequest::Passphrase(value) => Ok(Zeroizing::new(value.as_bytes().to_vec())),
            FallbackRequest::Askpass => run_askpass(fallback),
        }
    }
}

/// Decode configured fallback parameters and derive through `source`.
pub(crate) fn derive_configured(
    source: &dyn KeySource,
    fallback: &Fallback,
    passphrase: &[u8],
) -> LockchainResult<KeyMaterial> {
    let params = FallbackParams::from_config(fallback)?;
    source.derive_fallback_key(passphrase, &params.salt, &params.xor_blob, params.iterations)
}

fn run_askpass(fallback: &Fallback) -> LockchainResult<Zeroizing<Vec<u8>>> {
    if !fallback.askpass {
        return Err(KeySourceError::FallbackNotRequested.into());
    }
    let helper = fallback
        .askpass_path
        .as_deref()
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| {
            KeySourceError::DerivationFailed("fallback.askpass_path is not configured".into())
        })?;

    let output = Command::new(helper)
        .arg("LockChain fallback passphrase:")
        .stdin(Stdio::inherit())
        .stderr(Stdio::inherit())
        .output()
        .map_err(|err| KeySourceError::DerivationFailed(format!("askpass {helper}: {err}")))?;
    let mut stdout = Zeroizing::new(output.stdout);
    if !output.status.success() {
        return Err(KeySourceError::DerivationFailed(format!(
            "askpass {helper} exited with {}",
            output.status
        ))
        .into());
    }
    while matches!(stdout.last(), Some(b'\n' | b'\r')) {
        stdout.pop();
    }
    Ok(Zeroizing::new(std::mem::take(&mut *stdout)))
}

/// Single-checkout slot guarding decrypted key material.
///
/// Only one [`KeyLease`] can exist at a time; concurrent callers block until the
/// current holder drops its lease.
#[derive(Debug, Default)]
pub struct KeySlot {
    lock: Mutex<()>,
}

impl KeySlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the slot, then run `acquire` to produce the key it will hold.
    ///
    /// If `acquire` fails the slot is released and nothing is retained.
    pub fn checkout<F>(&self, acquire: F) -> LockchainResult<KeyLease<'_>>
    where
        F: FnOnce() -> LockchainResult<(KeyMaterial, KeyOrigin)>,
    {
        let guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let (key, origin) = acquire()?;
        Ok(KeyLease {
            key,
            origin,
            _guard: guard,
        })
    }

    /// True while a lease is outstanding.
    pub fn is_checked_out(&self) -> bool {
        matches!(self.lock.try_lock(), Err(std::sync::TryLockError::WouldBlock))
    }
}

/// Scoped ownership of checked-out key material. Dropping the lease zeroes the
/// key and frees the slot.
pub struct KeyLease<'a> {
    key: KeyMaterial,
    origin: KeyOrigin,
    _guard: MutexGuard<'a, ()>,
}

impl KeyLease<'_> {
    pub fn key(&self) -> &KeyMaterial {
        &self.key
    }

    pub fn origin(&self) -> KeyOrigin {
        self.origin
    }
}

impl fmt::Debug for KeyLease<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyLease")
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

/// Convenience used by callers that need to tell "no key on disk" apart from
/// other key-source failures.
pub fn is_key_unavailable(err: &LockchainError) -> bool {
    matches!(
        err,
        LockchainError::KeySource(KeySourceError::KeyUnavailable { .. })
    )
}
