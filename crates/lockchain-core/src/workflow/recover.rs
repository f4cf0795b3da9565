//! Break-glass recovery: rebuild key material without removable media.
//!
//! Every attempt is audit-logged, confirmed or not.

use super::{event, WorkflowLevel, WorkflowReport};
use crate::error::{KeySourceError, LockchainError};
use crate::events::{EventCode, EventRecorder};
use crate::key_source::{KeyMaterial, KeyOrigin};
use crate::keyfile::{write_raw_key_file, KEY_LEN};
use crate::provider::KeyProvider;
use crate::service::{LockchainService, Stalled, WorkflowFailure, WorkflowState};
use hex::FromHex;
use log::warn;
use std::path::Path;
use zeroize::Zeroizing;

/// Literal the operator must type to proceed with recovery.
pub const BREAKGLASS_CONFIRMATION: &str = "BREAKGLASS";

/// Source material for recovery workflows.
pub enum RecoveryInput<'a> {
    /// Raw 32-byte key recorded as hexadecimal at provisioning time.
    Hex(&'a str),
    /// Passphrase expanded through the configured fallback scheme.
    Passphrase(&'a [u8]),
}

impl RecoveryInput<'_> {
    fn describe(&self) -> &'static str {
        match self {
            RecoveryInput::Hex(_) => "recorded recovery key",
            RecoveryInput::Passphrase(_) => "fallback passphrase",
        }
    }
}

pub struct RecoveryRequest<'a> {
    pub dataset: &'a str,
    pub input: RecoveryInput<'a>,
    pub confirmation: &'a str,
    /// Where the recovered key is written (mode 0400); never the runtime key path.
    pub output_path: &'a Path,
}

/// Recover key material for `request.dataset` and write it to `request.output_path`.
pub fn recover_key<P>(
    service: &LockchainService<P>,
    request: RecoveryRequest<'_>,
) -> Result<WorkflowReport, WorkflowFailure>
where
    P: KeyProvider<Error = LockchainError>,
{
    let mut recorder = EventRecorder::new(service.events());
    let dataset = request.dataset;
    let fail = |stalled: Stalled, recorder| {
        stalled.into_failure(WorkflowLevel::Security, EventCode::RecoveryFailed, recorder)
    };

    recorder.emit(
        event(
            WorkflowLevel::Security,
            EventCode::RecoveryRequested,
            format!(
                "break-glass recovery requested via {} (output {})",
                request.input.describe(),
                request.output_path.display()
            ),
        )
        .with_dataset(dataset),
    );
    warn!("break-glass recovery requested for {dataset}");

    if request.confirmation != BREAKGLASS_CONFIRMATION {
        let error = LockchainError::RecoveryNotConfirmed {
            expected: BREAKGLASS_CONFIRMATION,
        };
        return Err(fail(
            Stalled::at(WorkflowState::Start, Some(dataset), error),
            recorder,
        ));
    }
    if !service.config().contains_dataset(dataset) {
        let error = LockchainError::DatasetNotConfigured(dataset.to_string());
        return Err(fail(
            Stalled::at(WorkflowState::Start, Some(dataset), error),
            recorder,
        ));
    }
    if request.output_path == service.config().key_hex_path() {
        let error = LockchainError::InvalidConfig(format!(
            "recovery output {} must differ from usb.key_hex_path",
            request.output_path.display()
        ));
        return Err(fail(
            Stalled::at(WorkflowState::Start, Some(dataset), error),
            recorder,
        ));
    }

    let lease = match service.key_slot().checkout(|| match &request.input {
        RecoveryInput::Hex(secret) => Ok((decode_recovery_hex(secret)?, KeyOrigin::Override)),
        RecoveryInput::Passphrase(passphrase) => {
            Ok((service.derive_fallback(passphrase)?, KeyOrigin::Fallback))
        }
    }) {
        Ok(lease) => lease,
        Err(error) => {
            return Err(fail(
                Stalled::at(WorkflowState::Start, Some(dataset), error),
                recorder,
            ))
        }
    };

    if let Err(error) = write_raw_key_file(request.output_path, lease.key().as_bytes()) {
        drop(lease);
        return Err(fail(
            Stalled::at(WorkflowState::KeyAcquired, Some(dataset), error),
            recorder,
        ));
    }
    let digest = lease.key().sha256_hex();
    drop(lease);

    recorder.emit(
        event(
            WorkflowLevel::Security,
            EventCode::RecoveryCompleted,
            format!(
                "recovered key via {} written to {} (SHA-256 {digest})",
                request.input.describe(),
                request.output_path.display()
            ),
        )
        .with_dataset(dataset),
    );

    Ok(WorkflowReport {
        title: format!("Recovered key material for {dataset}"),
        events: recorder.into_events(),
    })
}

fn decode_recovery_hex(secret: &str) -> Result<KeyMaterial, LockchainError> {
    let origin = Path::new("<recovery-key>");
    let invalid = |reason: String| KeySourceError::InvalidKeyFormat {
        path: origin.to_path_buf(),
        reason,
    };
    let cleaned: Zeroizing<String> =
        Zeroizing::new(secret.chars().filter(|c| !c.is_whitespace()).collect());
    if cleaned.len() != KEY_LEN * 2 {
        return Err(invalid(format!(
            "recovery key must be {} hexadecimal characters",
            KEY_LEN * 2
        ))
        .into());
    }
    let bytes = Zeroizing::new(
        <[u8; KEY_LEN]>::from_hex(cleaned.as_bytes())
            .map_err(|err| invalid(format!("invalid recovery key: {err}")))?,
    );
    KeyMaterial::from_slice(origin, &bytes[..])
}
