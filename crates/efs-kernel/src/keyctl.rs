//! `KeyringProvider` backed by the kernel key-retention service.

use crate::c_string;
use efs_core::error::{EfsError, EfsResult};
use efs_provider::{KeySerial, KeyringProvider, KeyringScope};
use log::debug;
use std::io;

const KEY_SPEC_SESSION_KEYRING: libc::c_long = -3;
const KEY_SPEC_USER_KEYRING: libc::c_long = -4;
const KEYCTL_UNLINK: libc::c_long = 9;
const KEYCTL_SEARCH: libc::c_long = 10;

/// Talks to the calling process's user or session keyring.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemKeyring;

fn keyring_id(scope: KeyringScope) -> libc::c_long {
    match scope {
        KeyringScope::User => KEY_SPEC_USER_KEYRING,
        KeyringScope::Session => KEY_SPEC_SESSION_KEYRING,
    }
}

fn keyring_error(op: &str, err: io::Error) -> EfsError {
    if err.raw_os_error() == Some(libc::EDQUOT) {
        EfsError::KeyringQuota(format!("{op}: {err}"))
    } else {
        EfsError::Keyring(format!("{op}: {err}"))
    }
}

impl KeyringProvider for SystemKeyring {
    type Error = EfsError;

    fn add_key(
        &self,
        scope: KeyringScope,
        key_type: &str,
        description: &str,
        payload: &[u8],
    ) -> EfsResult<KeySerial> {
        let key_type = c_string(key_type, "key type")?;
        let description = c_string(description, "key description")?;
        // SAFETY: both strings are NUL terminated and `payload` is valid for
        // `payload.len()` bytes for the duration of the call.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_add_key,
                key_type.as_ptr(),
                description.as_ptr(),
                payload.as_ptr().cast::<libc::c_void>(),
                payload.len(),
                keyring_id(scope),
            )
        };
        if rc < 0 {
            return Err(keyring_error("add_key", io::Error::last_os_error()));
        }
        debug!("add_key returned serial {rc}");
        Ok(rc as KeySerial)
    }

    fn search_key(
        &self,
        scope: KeyringScope,
        key_type: &str,
        description: &str,
    ) -> EfsResult<Option<KeySerial>> {
        let key_type = c_string(key_type, "key type")?;
        let description = c_string(description, "key description")?;
        // SAFETY: both strings are NUL terminated; destination keyring 0
        // means "do not link".
        let rc = unsafe {
            libc::syscall(
                libc::SYS_keyctl,
                KEYCTL_SEARCH,
                keyring_id(scope),
                key_type.as_ptr(),
                description.as_ptr(),
                0 as libc::c_long,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::ENOKEY) => Ok(None),
                _ => Err(keyring_error("keyctl search", err)),
            };
        }
        Ok(Some(rc as KeySerial))
    }

    fn unlink_key(&self, scope: KeyringScope, serial: KeySerial) -> EfsResult<()> {
        // SAFETY: plain integer arguments only.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_keyctl,
                KEYCTL_UNLINK,
                serial as libc::c_long,
                keyring_id(scope),
            )
        };
        if rc < 0 {
            return Err(keyring_error("keyctl unlink", io::Error::last_os_error()));
        }
        Ok(())
    }
}
