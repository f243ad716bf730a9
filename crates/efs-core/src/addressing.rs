//! Path derivation for EFS units.
//!
//! Every operation re-derives the lower directory, the key record and the
//! recovery scratch path from the canonical storage path, so nothing about
//! a unit is tracked in-process between calls.

use crate::config::EfsConfig;
use crate::error::{EfsError, EfsResult};
use sha2::{Digest, Sha512};
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

/// Longest derived path accepted, in bytes.
pub const MAX_PATH_LENGTH: usize = 1024;

/// Derived locations of a single unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitPaths {
    /// Canonical storage path (the plaintext view).
    pub storage: PathBuf,
    /// Hidden sibling holding ciphertext.
    pub lower: PathBuf,
    /// Content-addressed envelope file.
    pub key_record: PathBuf,
}

impl UnitPaths {
    /// Sanitize `raw` and derive every path the lifecycle engine needs.
    pub fn resolve(config: &EfsConfig, raw: &Path) -> EfsResult<Self> {
        let storage = sanitize(raw)?;
        let lower = private_dir_path(&storage)?;
        let key_record = key_record_path(
            &config.key_storage_dir(),
            &config.storage.key_file_prefix,
            &storage,
        )?;
        Ok(Self {
            storage,
            lower,
            key_record,
        })
    }
}

/// Canonicalize a storage path: absolute, no trailing `/`, not the root and
/// present on disk.
pub fn sanitize(raw: &Path) -> EfsResult<PathBuf> {
    let bytes = raw.as_os_str().as_bytes();
    if bytes.first() != Some(&b'/') {
        return Err(EfsError::Validation(format!(
            "storage path must be absolute: {}",
            raw.display()
        )));
    }

    let end = bytes
        .iter()
        .rposition(|b| *b != b'/')
        .map(|idx| idx + 1)
        .unwrap_or(0);
    if end == 0 {
        return Err(EfsError::Validation(
            "storage path cannot be the filesystem root".to_string(),
        ));
    }
    if end > MAX_PATH_LENGTH {
        return Err(EfsError::Validation(format!(
            "storage path exceeds {MAX_PATH_LENGTH} bytes"
        )));
    }

    let canonical = PathBuf::from(OsStr::from_bytes(&bytes[..end]));
    if !canonical.exists() {
        return Err(EfsError::NotFound(format!(
            "storage path {}",
            canonical.display()
        )));
    }
    Ok(canonical)
}

/// Insert a hidden-file marker before the final segment: `/a/b/c` becomes
/// `/a/b/.c`, and a bare `c` becomes `./.c`.
pub fn private_dir_path(storage: &Path) -> EfsResult<PathBuf> {
    let bytes = storage.as_os_str().as_bytes();
    let mut derived = Vec::with_capacity(bytes.len() + 2);
    match bytes.iter().rposition(|b| *b == b'/') {
        Some(idx) => {
            derived.extend_from_slice(&bytes[..=idx]);
            derived.push(b'.');
            derived.extend_from_slice(&bytes[idx + 1..]);
        }
        None => {
            derived.extend_from_slice(b"./.");
            derived.extend_from_slice(bytes);
        }
    }

    if derived.len() > MAX_PATH_LENGTH {
        return Err(EfsError::Validation(format!(
            "lower directory path for {} exceeds {MAX_PATH_LENGTH} bytes",
            storage.display()
        )));
    }
    Ok(PathBuf::from(OsStr::from_bytes(&derived)))
}

/// `{key_dir}/{prefix}.{hex(SHA-512(storage))}`.
pub fn key_record_path(key_dir: &Path, prefix: &str, storage: &Path) -> EfsResult<PathBuf> {
    let digest = Sha512::digest(storage.as_os_str().as_bytes());
    let record = key_dir.join(format!("{prefix}.{}", hex::encode(digest)));
    if record.as_os_str().len() > MAX_PATH_LENGTH {
        return Err(EfsError::Validation(format!(
            "key record path under {} exceeds {MAX_PATH_LENGTH} bytes",
            key_dir.display()
        )));
    }
    Ok(record)
}

/// Scratch mount point used while decrypting a unit back into place.
pub fn recovery_path(recovery_root: &Path, storage: &Path) -> EfsResult<PathBuf> {
    let name = storage.file_name().ok_or_else(|| {
        EfsError::Validation(format!(
            "storage path {} has no final segment",
            storage.display()
        ))
    })?;
    Ok(recovery_root.join(name))
}
