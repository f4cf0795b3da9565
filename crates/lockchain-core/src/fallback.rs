//! Fallback key derivation helpers.
//!
//! Expands an operator passphrase into the 32-byte unlock key using PBKDF2-HMAC-SHA256
//! and the configured XOR mask. Used by break-glass recovery and by unlocks that
//! explicitly request the fallback path when USB key material is unavailable.

use crate::config::Fallback;
use crate::error::{KeySourceError, LockchainResult};
use crate::keyfile::KEY_LEN;
use crate::key_source::KeyMaterial;
use hex::FromHex;
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use zeroize::Zeroizing;

/// Salt, mask, and iteration count decoded from the `[fallback]` section.
pub struct FallbackParams {
    pub salt: Vec<u8>,
    pub xor_blob: Zeroizing<Vec<u8>>,
    pub iterations: u32,
}

impl FallbackParams {
    /// Decode the hex encoded material stored in configuration.
    ///
    /// # Errors
    /// `FallbackDisabled` when `fallback.enabled` is false, `DerivationFailed` when
    /// the salt or mask is missing or malformed.
    pub fn from_config(fallback: &Fallback) -> Result<Self, KeySourceError> {
        if !fallback.enabled {
            return Err(KeySourceError::FallbackDisabled);
        }
        let salt_hex = fallback
            .passphrase_salt
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| KeySourceError::DerivationFailed("fallback.passphrase_salt missing".into()))?;
        let xor_hex = fallback
            .passphrase_xor
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| KeySourceError::DerivationFailed("fallback.passphrase_xor missing".into()))?;

        let salt = Vec::from_hex(salt_hex).map_err(|err| {
            KeySourceError::DerivationFailed(format!("invalid fallback.passphrase_salt: {err}"))
        })?;
        let xor_blob = Vec::from_hex(xor_hex).map_err(|err| {
            KeySourceError::DerivationFailed(format!("invalid fallback.passphrase_xor: {err}"))
        })?;

        Ok(Self {
            salt,
            xor_blob: Zeroizing::new(xor_blob),
            iterations: fallback.passphrase_iters,
        })
    }
}

/// Derive the 32-byte key from `passphrase`: PBKDF2-HMAC-SHA256 over `salt` for
/// `iterations` rounds, XORed with `xor_blob`.
///
/// Deterministic for identical inputs.
///
/// # Errors
/// `DerivationFailed` when the salt is empty or the mask is not exactly 32 bytes.
pub fn derive_fallback_key(
    passphrase: &[u8],
    salt: &[u8],
    xor_blob: &[u8],
    iterations: u32,
) -> LockchainResult<KeyMaterial> {
    if salt.is_empty() {
        return Err(KeySourceError::DerivationFailed("salt must not be empty".into()).into());
    }
    if xor_blob.len() != KEY_LEN {
        return Err(KeySourceError::DerivationFailed(format!(
            "xor blob length must be {KEY_LEN} bytes, got {}",
            xor_blob.len()
        ))
        .into());
    }

    let mut derived = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2_hmac::<Sha256>(passphrase, salt, iterations.max(1), &mut derived[..]);

    let mut raw = Zeroizing::new([0u8; KEY_LEN]);
    for (out, (mask, stream)) in raw.iter_mut().zip(xor_blob.iter().zip(derived.iter())) {
        *out = mask ^ stream;
    }
    Ok(KeyMaterial::from_array(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LockchainError;
    use proptest::prelude::*;

    #[test]
    fn xor_blob_of_derived_stream_recovers_original_key() {
        let original = [0x5Au8; 32];
        let salt = [0x11u8; 16];
        let mut stream = [0u8; 32];
        pbkdf2_hmac::<Sha256>(b"open sesame", &salt, 10, &mut stream);
        let blob: Vec<u8> = original.iter().zip(stream.iter()).map(|(a, b)| a ^ b).collect();

        let key = derive_fallback_key(b"open sesame", &salt, &blob, 10).unwrap();
        assert_eq!(key.as_bytes(), &original);
    }

    #[test]
    fn malformed_lengths_fail_derivation() {
        let err = derive_fallback_key(b"pw", &[1u8; 16], &[0u8; 31], 1).unwrap_err();
        assert!(matches!(
            err,
            LockchainError::KeySource(KeySourceError::DerivationFailed(_))
        ));
        let err = derive_fallback_key(b"pw", &[], &[0u8; 32], 1).unwrap_err();
        assert!(matches!(
            err,
            LockchainError::KeySource(KeySourceError::DerivationFailed(_))
        ));
    }

    #[test]
    fn disabled_fallback_is_rejected_before_decoding() {
        let cfg = Fallback {
            enabled: false,
            passphrase_salt: Some("not hex".into()),
            ..Fallback::default()
        };
        assert!(matches!(
            FallbackParams::from_config(&cfg),
            Err(KeySourceError::FallbackDisabled)
        ));
    }

    #[test]
    fn params_decode_from_config() {
        let cfg = Fallback {
            enabled: true,
            passphrase_salt: Some(hex::encode([0x11u8; 16])),
            passphrase_xor: Some(hex::encode([0x22u8; 32])),
            passphrase_iters: 7,
            ..Fallback::default()
        };
        let params = FallbackParams::from_config(&cfg).unwrap();
        assert_eq!(params.salt, vec![0x11; 16]);
        assert_eq!(&params.xor_blob[..], &[0x22; 32]);
        assert_eq!(params.iterations, 7);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn derivation_is_deterministic(
            passphrase in proptest::collection::vec(any::<u8>(), 0..48),
            salt in proptest::collection::vec(any::<u8>(), 1..32),
            blob in proptest::array::uniform32(any::<u8>()),
            iterations in 1u32..16,
        ) {
            let first = derive_fallback_key(&passphrase, &salt, &blob, iterations).unwrap();
            let second = derive_fallback_key(&passphrase, &salt, &blob, iterations).unwrap();
            prop_assert_eq!(first.as_bytes(), second.as_bytes());
        }
    }
}
