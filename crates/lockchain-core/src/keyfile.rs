//! Keyfile parsing and persistence helpers.
//!
//! A key file holds either 32 raw bytes or 64 hex digits (whitespace ignored).
//! Writes always land atomically with mode 0400.

use crate::error::{KeySourceError, LockchainError, LockchainResult};
use hex::FromHex;
use std::fs;
use std::io::{ErrorKind, Write};
use std::os::unix::fs::MetadataExt;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use zeroize::Zeroizing;

/// Length of raw key material in bytes.
pub const KEY_LEN: usize = 32;

/// Permission bits applied to every key file this crate writes.
pub const KEY_FILE_MODE: u32 = 0o400;

/// Result of decoding a key file or byte stream.
///
/// The boolean flag indicates whether the original material was hex encoded and
/// therefore required normalisation to raw bytes.
pub type DecodedKey = (Zeroizing<[u8; KEY_LEN]>, bool);

/// Read bytes from `path` and decode them into raw key material.
pub fn read_key_file(path: &Path) -> LockchainResult<DecodedKey> {
    let contents = Zeroizing::new(fs::read(path).map_err(|err| match err.kind() {
        ErrorKind::NotFound | ErrorKind::PermissionDenied => {
            LockchainError::KeySource(KeySourceError::KeyUnavailable {
                path: path.to_path_buf(),
                reason: err.to_string(),
            })
        }
        _ => LockchainError::Io(err),
    })?);
    decode_key_bytes(path, &contents)
}

/// Decode raw bytes into key material, accepting either a 32-byte binary key
/// or a 64-digit hex string (whitespace ignored).
pub fn decode_key_bytes(origin: &Path, bytes: &[u8]) -> LockchainResult<DecodedKey> {
    if bytes.len() == KEY_LEN {
        let mut raw = Zeroizing::new([0u8; KEY_LEN]);
        raw.copy_from_slice(bytes);
        return Ok((raw, false));
    }

    if bytes.is_empty() {
        return Err(invalid_key(origin, "file is empty"));
    }

    let mut filtered = Zeroizing::new(Vec::with_capacity(bytes.len()));
    for byte in bytes {
        if byte.is_ascii_whitespace() {
            continue;
        }
        if !byte.is_ascii_hexdigit() {
            return Err(invalid_key(
                origin,
                format!(
                    "expected 32 raw bytes or 64 hex digits ({} bytes, non-hex content)",
                    bytes.len()
                ),
            ));
        }
        filtered.push(*byte);
    }

    if filtered.len() != KEY_LEN * 2 {
        return Err(invalid_key(
            origin,
            format!(
                "hex key must contain exactly 64 hex digits (got {})",
                filtered.len()
            ),
        ));
    }

    let decoded = <[u8; KEY_LEN]>::from_hex(&filtered[..])
        .map_err(|err| invalid_key(origin, format!("hex decode failed: {err}")))?;
    Ok((Zeroizing::new(decoded), true))
}

/// Write raw key material to `path`, applying restrictive permissions.
///
/// The write goes through a temporary file in the destination directory and is
/// renamed into place, so readers never observe a partially written key.
pub fn write_raw_key_file(path: &Path, key: &[u8]) -> LockchainResult<()> {
    let dest = resolve_write_path(path)?;
    let parent = dest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    let ownership = fs::metadata(&dest)
        .ok()
        .map(|meta| (meta.uid(), meta.gid()));

    let mut temp = NamedTempFile::new_in(parent)?;
    temp.as_file_mut().write_all(key)?;
    temp.as_file_mut().flush()?;
    fs::set_permissions(temp.path(), fs::Permissions::from_mode(KEY_FILE_MODE))?;

    if let Some((uid, gid)) = ownership {
        // SAFETY: the descriptor is owned by `temp` and stays open for the call.
        let rc = unsafe { libc::fchown(temp.as_file().as_raw_fd(), uid, gid) };
        if rc != 0 {
            return Err(LockchainError::Io(std::io::Error::last_os_error()));
        }
    }

    let _ = temp.as_file().sync_all();
    temp.persist(&dest)
        .map_err(|err| LockchainError::Io(err.error))?;
    let _ = sync_parent_dir(parent);
    Ok(())
}

/// Permission bits currently set on `path`.
pub fn key_file_mode(path: &Path) -> LockchainResult<u32> {
    Ok(fs::metadata(path)?.permissions().mode() & 0o777)
}

fn resolve_write_path(path: &Path) -> LockchainResult<PathBuf> {
    let mut candidate = path.to_path_buf();
    for _ in 0..16 {
        let meta = match fs::symlink_metadata(&candidate) {
            Ok(meta) => meta,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(candidate),
            Err(err) => return Err(LockchainError::Io(err)),
        };

        if !meta.file_type().is_symlink() {
            return Ok(candidate);
        }

        let target = fs::read_link(&candidate)?;
        candidate = if target.is_absolute() {
            target
        } else {
            candidate
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."))
                .join(target)
        };
    }

    Err(LockchainError::InvalidConfig(format!(
        "symlink resolution depth exceeded for {}",
        path.display()
    )))
}

fn sync_parent_dir(dir: &Path) -> std::io::Result<()> {
    fs::File::open(dir).and_then(|file| file.sync_all())
}

fn invalid_key(path: &Path, reason: impl Into<String>) -> LockchainError {
    LockchainError::KeySource(KeySourceError::InvalidKeyFormat {
        path: PathBuf::from(path),
        reason: reason.into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::tempdir;

    #[test]
    fn decode_accepts_binary() {
        let bytes = [0x11u8; 32];
        let (decoded, converted) = decode_key_bytes(Path::new("dummy"), &bytes).unwrap();
        assert!(!converted);
        assert_eq!(&decoded[..], &bytes);
    }

    #[test]
    fn decode_accepts_hex_with_whitespace() {
        let base = hex::encode([0xABu8; 32]);
        let mut with_ws = Vec::new();
        for chunk in base.as_bytes().chunks(8) {
            with_ws.extend_from_slice(chunk);
            with_ws.push(b'\n');
        }
        let (decoded, converted) = decode_key_bytes(Path::new("dummy"), &with_ws).unwrap();
        assert!(converted);
        assert_eq!(&decoded[..], &[0xABu8; 32]);
    }

    #[test]
    fn decode_rejects_wrong_lengths() {
        for payload in [&b""[..], &b"00"[..], &[0u8; 31][..], &[0u8; 33][..]] {
            let err = decode_key_bytes(Path::new("/tmp/key"), payload).unwrap_err();
            match err {
                LockchainError::KeySource(KeySourceError::InvalidKeyFormat { path, .. }) => {
                    assert_eq!(path, PathBuf::from("/tmp/key"))
                }
                other => panic!("unexpected error: {other:?}"),
            }
        }
    }

    #[test]
    fn missing_file_is_key_unavailable() {
        let dir = tempdir().unwrap();
        let err = read_key_file(&dir.path().join("absent.key")).unwrap_err();
        assert!(matches!(
            err,
            LockchainError::KeySource(KeySourceError::KeyUnavailable { .. })
        ));
    }

    #[test]
    fn write_raw_key_file_sets_permissions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("key.bin");
        let key = vec![0x42; 32];
        write_raw_key_file(&path, &key).unwrap();
        assert_eq!(fs::read(&path).unwrap(), key);
        assert_eq!(key_file_mode(&path).unwrap(), KEY_FILE_MODE);
    }

    #[test]
    fn write_raw_key_file_creates_parent() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("nested").join("key.bin");
        write_raw_key_file(&nested, &[0x11; 32]).unwrap();
        assert!(nested.exists());
    }

    #[test]
    fn write_raw_key_file_follows_symlinks() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("real.key");
        let link = dir.path().join("link.key");
        fs::write(&target, b"placeholder").unwrap();
        std::os::unix::fs::symlink(&target, &link).unwrap();

        write_raw_key_file(&link, &[0x33; 32]).unwrap();
        assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert_eq!(fs::read(&target).unwrap(), vec![0x33; 32]);
    }

    proptest! {
        #[test]
        fn hex_and_raw_forms_decode_identically(bytes in proptest::array::uniform32(any::<u8>())) {
            let (from_raw, raw_converted) = decode_key_bytes(Path::new("raw"), &bytes).unwrap();
            let encoded = hex::encode(bytes);
            let (from_hex, hex_converted) =
                decode_key_bytes(Path::new("hex"), encoded.as_bytes()).unwrap();
            prop_assert!(!raw_converted);
            prop_assert!(hex_converted);
            prop_assert_eq!(&from_raw[..], &from_hex[..]);

            let (again, converted_again) = decode_key_bytes(Path::new("raw"), &from_hex[..]).unwrap();
            prop_assert!(!converted_again);
            prop_assert_eq!(&again[..], &bytes[..]);
        }
    }
}
