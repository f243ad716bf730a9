//! Provider contract for mount table inspection and (un)mount calls.

use std::error::Error;
use std::path::{Path, PathBuf};

/// Arguments of a single `mount(2)` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRequest {
    /// Device field of the new mount (the lower directory).
    pub source: PathBuf,
    /// Directory where the decrypted view appears.
    pub target: PathBuf,
    /// Filesystem type passed to the kernel.
    pub fs_type: String,
    /// Comma separated `key=value` option string.
    pub options: String,
}

/// Classified result of one unmount attempt.
#[derive(Debug)]
pub enum UnmountStatus {
    /// The filesystem was detached.
    Unmounted,
    /// The target is not a mount point (nothing to do).
    NotMounted,
    /// The attempt failed in a way that may clear up on retry (e.g. busy).
    Failed(std::io::Error),
}

/// Abstraction over the live mount table and the mount syscalls.
pub trait MountProvider {
    type Error: Error + Send + Sync + 'static;

    /// Return the raw, line-oriented mount table (`/proc/mounts` format).
    fn mount_table(&self) -> Result<String, Self::Error>;

    /// Attach a filesystem as described by `request`.
    fn mount(&self, request: &MountRequest) -> Result<(), Self::Error>;

    /// Make one attempt at detaching whatever is mounted at `target`.
    fn unmount(&self, target: &Path) -> Result<UnmountStatus, Self::Error>;
}
