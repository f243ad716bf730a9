//! Host integration for EFS.
//!
//! `keyctl` implements `KeyringProvider` on top of the `add_key(2)` and
//! `keyctl(2)` syscalls. `mounts` implements `MountProvider` by reading the
//! live mount table and calling `mount(2)`/`umount(2)` directly.

mod keyctl;
mod mounts;

pub use keyctl::SystemKeyring;
pub use mounts::SystemMountProvider;

use efs_core::error::{EfsError, EfsResult};
use std::ffi::CString;

fn c_string(value: impl Into<Vec<u8>>, what: &str) -> EfsResult<CString> {
    CString::new(value).map_err(|_| EfsError::Validation(format!("{what} contains a NUL byte")))
}
