//! `MountProvider` backed by `/proc/mounts` and the mount syscalls.

use crate::c_string;
use efs_core::error::{EfsError, EfsResult};
use efs_core::EfsConfig;
use efs_provider::{MountProvider, MountRequest, UnmountStatus};
use log::debug;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

/// Reads the configured mount table and issues real mount/umount calls.
#[derive(Debug, Clone)]
pub struct SystemMountProvider {
    mounts_path: PathBuf,
}

impl SystemMountProvider {
    /// Honours `mount.mounts_path` and the `EFS_MOUNTS_PATH` override.
    pub fn from_config(config: &EfsConfig) -> Self {
        Self::new(config.mounts_path())
    }

    pub fn new(mounts_path: impl Into<PathBuf>) -> Self {
        Self {
            mounts_path: mounts_path.into(),
        }
    }

    pub fn mounts_path(&self) -> &Path {
        &self.mounts_path
    }
}

impl MountProvider for SystemMountProvider {
    type Error = EfsError;

    fn mount_table(&self) -> EfsResult<String> {
        fs::read_to_string(&self.mounts_path).map_err(|err| {
            EfsError::Mount(format!(
                "read mount table {}: {err}",
                self.mounts_path.display()
            ))
        })
    }

    fn mount(&self, request: &MountRequest) -> EfsResult<()> {
        let source = c_string(request.source.as_os_str().as_bytes(), "mount source")?;
        let target = c_string(request.target.as_os_str().as_bytes(), "mount target")?;
        let fs_type = c_string(request.fs_type.as_str(), "filesystem type")?;
        let options = c_string(request.options.as_str(), "mount options")?;

        debug!(
            "mount -t {} {} {}",
            request.fs_type,
            request.source.display(),
            request.target.display()
        );
        // SAFETY: every pointer refers to a NUL terminated string that
        // outlives the call.
        let rc = unsafe {
            libc::mount(
                source.as_ptr(),
                target.as_ptr(),
                fs_type.as_ptr(),
                0,
                options.as_ptr().cast::<libc::c_void>(),
            )
        };
        if rc != 0 {
            let err = io::Error::last_os_error();
            return Err(EfsError::Mount(format!(
                "mount {} on {}: {err}",
                request.source.display(),
                request.target.display()
            )));
        }
        Ok(())
    }

    fn unmount(&self, target: &Path) -> EfsResult<UnmountStatus> {
        let c_target = c_string(target.as_os_str().as_bytes(), "unmount target")?;
        // SAFETY: `c_target` is NUL terminated.
        let rc = unsafe { libc::umount(c_target.as_ptr()) };
        if rc == 0 {
            return Ok(UnmountStatus::Unmounted);
        }

        let err = io::Error::last_os_error();
        Ok(match err.raw_os_error() {
            Some(libc::EINVAL) => UnmountStatus::NotMounted,
            _ => UnmountStatus::Failed(err),
        })
    }
}
