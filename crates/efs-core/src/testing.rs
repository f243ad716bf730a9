//! In-memory keyring and mount table used by unit tests.

use crate::config::EfsConfig;
use crate::error::{EfsError, EfsResult};
use crate::migration::{DataMigration, TreeMigrator};
use efs_provider::{
    KeySerial, KeyringProvider, KeyringScope, MountProvider, MountRequest, UnmountStatus,
};
use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};

pub(crate) fn fast_config() -> EfsConfig {
    let mut config = EfsConfig::default();
    config.mount.unmount_attempts = 3;
    config.mount.unmount_retry_delay_ms = 0;
    config.migration.preserve_security_label = false;
    config
}

#[derive(Default, Clone)]
pub(crate) struct FakeKeyring {
    keys: Arc<Mutex<HashMap<String, KeySerial>>>,
    next: Arc<Mutex<KeySerial>>,
}

impl FakeKeyring {
    pub(crate) fn len(&self) -> usize {
        self.keys.lock().unwrap().len()
    }

    pub(crate) fn clear(&self) {
        self.keys.lock().unwrap().clear();
    }
}

impl KeyringProvider for FakeKeyring {
    type Error = EfsError;

    fn add_key(
        &self,
        _scope: KeyringScope,
        _key_type: &str,
        description: &str,
        _payload: &[u8],
    ) -> EfsResult<KeySerial> {
        let mut keys = self.keys.lock().unwrap();
        if let Some(serial) = keys.get(description) {
            return Ok(*serial);
        }
        let mut next = self.next.lock().unwrap();
        *next += 1;
        keys.insert(description.to_string(), *next);
        Ok(*next)
    }

    fn search_key(
        &self,
        _scope: KeyringScope,
        _key_type: &str,
        description: &str,
    ) -> EfsResult<Option<KeySerial>> {
        Ok(self.keys.lock().unwrap().get(description).copied())
    }

    fn unlink_key(&self, _scope: KeyringScope, serial: KeySerial) -> EfsResult<()> {
        self.keys.lock().unwrap().retain(|_, value| *value != serial);
        Ok(())
    }
}

/// Mount table whose mounts behave like a bind of the lower directory:
/// mounting copies the lower content onto the target and unmounting moves
/// it back.
#[derive(Default, Clone)]
pub(crate) struct FakeMounts {
    table: Arc<Mutex<Vec<MountRequest>>>,
    busy: Arc<Mutex<usize>>,
    calls: Arc<Mutex<usize>>,
}

impl FakeMounts {
    pub(crate) fn set_busy(&self, attempts: usize) {
        *self.busy.lock().unwrap() = attempts;
    }

    pub(crate) fn mount_calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

impl MountProvider for FakeMounts {
    type Error = EfsError;

    fn mount_table(&self) -> EfsResult<String> {
        Ok(self
            .table
            .lock()
            .unwrap()
            .iter()
            .map(|m| {
                format!(
                    "{} {} {} rw,{} 0 0\n",
                    m.source.display(),
                    m.target.display(),
                    m.fs_type,
                    m.options
                )
            })
            .collect())
    }

    fn mount(&self, request: &MountRequest) -> EfsResult<()> {
        if request.source != request.target {
            TreeMigrator::new(false).copy_dir_content(&request.source, &request.target)?;
        }
        *self.calls.lock().unwrap() += 1;
        self.table.lock().unwrap().push(request.clone());
        Ok(())
    }

    fn unmount(&self, target: &Path) -> EfsResult<UnmountStatus> {
        {
            let mut busy = self.busy.lock().unwrap();
            if *busy > 0 {
                *busy -= 1;
                return Ok(UnmountStatus::Failed(io::Error::from_raw_os_error(
                    libc::EBUSY,
                )));
            }
        }

        let mut table = self.table.lock().unwrap();
        let Some(pos) = table.iter().position(|m| m.target == target) else {
            return Ok(UnmountStatus::NotMounted);
        };
        let request = table.remove(pos);
        if request.source != request.target {
            let migrator = TreeMigrator::new(false);
            migrator.remove_dir_content(&request.source)?;
            migrator.copy_dir_content(&request.target, &request.source)?;
            migrator.remove_dir_content(&request.target)?;
        }
        Ok(UnmountStatus::Unmounted)
    }
}
