#![allow(dead_code)]

use efs_core::{
    CopyProgress, DataMigration, EfsConfig, EfsError, EfsResult, StorageService, TreeMigrator,
};
use efs_provider::{
    KeySerial, KeyringProvider, KeyringScope, MountProvider, MountRequest, UnmountStatus,
};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Keyring keeping `(scope, description) -> (serial, payload)`.
#[derive(Default, Clone)]
pub struct MockKeyring {
    entries: Arc<Mutex<HashMap<(KeyringScope, String), (KeySerial, Vec<u8>)>>>,
    serial: Arc<Mutex<KeySerial>>,
}

impl MockKeyring {
    pub fn descriptions(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .entries
            .lock()
            .unwrap()
            .keys()
            .map(|(_, description)| description.clone())
            .collect();
        out.sort();
        out
    }

    pub fn payload(&self, description: &str) -> Option<Vec<u8>> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .find(|((_, d), _)| d == description)
            .map(|(_, (_, payload))| payload.clone())
    }
}

impl KeyringProvider for MockKeyring {
    type Error = EfsError;

    fn add_key(
        &self,
        scope: KeyringScope,
        key_type: &str,
        description: &str,
        payload: &[u8],
    ) -> EfsResult<KeySerial> {
        assert_eq!(key_type, "user");
        let mut entries = self.entries.lock().unwrap();
        let key = (scope, description.to_string());
        if let Some(entry) = entries.get_mut(&key) {
            entry.1 = payload.to_vec();
            return Ok(entry.0);
        }
        let mut serial = self.serial.lock().unwrap();
        *serial += 1;
        entries.insert(key, (*serial, payload.to_vec()));
        Ok(*serial)
    }

    fn search_key(
        &self,
        scope: KeyringScope,
        _key_type: &str,
        description: &str,
    ) -> EfsResult<Option<KeySerial>> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .get(&(scope, description.to_string()))
            .map(|entry| entry.0))
    }

    fn unlink_key(&self, scope: KeyringScope, serial: KeySerial) -> EfsResult<()> {
        self.entries
            .lock()
            .unwrap()
            .retain(|(s, _), entry| !(*s == scope && entry.0 == serial));
        Ok(())
    }
}

/// Mount table emulating the encrypting filesystem with plain copies: the
/// lower directory's content shows up at the mount point while mounted and
/// is written back on unmount.
#[derive(Default, Clone)]
pub struct MockMounts {
    active: Arc<Mutex<Vec<MountRequest>>>,
}

impl MockMounts {
    pub fn snapshot(&self) -> Vec<MountRequest> {
        self.active.lock().unwrap().clone()
    }
}

impl MountProvider for MockMounts {
    type Error = EfsError;

    fn mount_table(&self) -> EfsResult<String> {
        let mut table = String::from("/dev/root / ext4 rw,relatime 0 0\n");
        for request in self.active.lock().unwrap().iter() {
            table.push_str(&format!(
                "{} {} {} rw,relatime,{} 0 0\n",
                request.source.display(),
                request.target.display(),
                request.fs_type,
                request.options
            ));
        }
        Ok(table)
    }

    fn mount(&self, request: &MountRequest) -> EfsResult<()> {
        assert_eq!(request.fs_type, "ecryptfs");
        if request.source != request.target {
            TreeMigrator::new(false).copy_dir_content(&request.source, &request.target)?;
        }
        self.active.lock().unwrap().push(request.clone());
        Ok(())
    }

    fn unmount(&self, target: &Path) -> EfsResult<UnmountStatus> {
        let mut active = self.active.lock().unwrap();
        let Some(pos) = active.iter().position(|r| r.target == target) else {
            return Ok(UnmountStatus::NotMounted);
        };
        let request = active.remove(pos);
        if request.source != request.target {
            let migrator = TreeMigrator::new(false);
            migrator.remove_dir_content(&request.source)?;
            migrator.copy_dir_content(&request.target, &request.source)?;
            migrator.remove_dir_content(&request.target)?;
        }
        Ok(UnmountStatus::Unmounted)
    }
}

/// Tree migrator that can be told to fail specific steps.
#[derive(Clone)]
pub struct FaultyMigrator {
    inner: TreeMigrator,
    fail_copy_into: Option<PathBuf>,
    fail_remove_of: Option<PathBuf>,
}

impl FaultyMigrator {
    pub fn failing_copy_into(path: PathBuf) -> Self {
        Self {
            inner: TreeMigrator::new(false),
            fail_copy_into: Some(path),
            fail_remove_of: None,
        }
    }

    pub fn failing_removal_of(path: PathBuf) -> Self {
        Self {
            inner: TreeMigrator::new(false),
            fail_copy_into: None,
            fail_remove_of: Some(path),
        }
    }
}

impl DataMigration for FaultyMigrator {
    fn copy_dir_content(&self, src: &Path, dst: &Path) -> EfsResult<()> {
        self.inner.copy_dir_content(src, dst)?;
        if self.fail_copy_into.as_deref() == Some(dst) {
            return Err(EfsError::Io(io::Error::new(
                io::ErrorKind::Other,
                "disk full (injected)",
            )));
        }
        Ok(())
    }

    fn remove_dir_content(&self, dir: &Path) -> EfsResult<()> {
        if self.fail_remove_of.as_deref() == Some(dir) {
            return Err(EfsError::Io(io::Error::from(io::ErrorKind::PermissionDenied)));
        }
        self.inner.remove_dir_content(dir)
    }

    fn progress(&self) -> CopyProgress {
        self.inner.progress()
    }
}

/// A temporary root holding one unit directory plus private key storage.
pub struct Sandbox {
    pub root: TempDir,
    pub unit: PathBuf,
    pub config: Arc<EfsConfig>,
    pub keyring: MockKeyring,
    pub mounts: MockMounts,
}

impl Sandbox {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let unit = root.path().join("data").join("user").join("5");
        fs::create_dir_all(&unit).unwrap();

        let mut config = EfsConfig::default();
        config.storage.key_storage_dir = root.path().join("keystore").display().to_string();
        config.storage.recovery_root = root.path().join("lost+found").display().to_string();
        config.mount.unmount_attempts = 2;
        config.mount.unmount_retry_delay_ms = 0;
        config.migration.preserve_security_label = false;

        Self {
            root,
            unit,
            config: Arc::new(config),
            keyring: MockKeyring::default(),
            mounts: MockMounts::default(),
        }
    }

    pub fn service(&self) -> StorageService<MockKeyring, MockMounts, TreeMigrator> {
        self.service_with(TreeMigrator::new(false))
    }

    pub fn service_with<M: DataMigration>(
        &self,
        migrator: M,
    ) -> StorageService<MockKeyring, MockMounts, M> {
        StorageService::new(
            self.config.clone(),
            self.keyring.clone(),
            self.mounts.clone(),
            migrator,
        )
    }

    pub fn seed(&self, rel: &str, contents: &[u8]) -> PathBuf {
        let path = self.unit.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, contents).unwrap();
        path
    }

    pub fn lower(&self) -> PathBuf {
        self.unit.parent().unwrap().join(".5")
    }

    pub fn key_records(&self) -> Vec<PathBuf> {
        match fs::read_dir(self.root.path().join("keystore")) {
            Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn unit_entries(&self) -> usize {
        fs::read_dir(&self.unit).unwrap().count()
    }
}
