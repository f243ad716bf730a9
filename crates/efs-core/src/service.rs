//! Lifecycle engine for EFS units.
//!
//! Each call re-derives the unit's paths, consults the on-disk record and
//! the live mount table, and runs to completion on the calling thread.
//! Callers serialize operations against the same storage path.

use crate::addressing::{recovery_path, UnitPaths};
use crate::config::EfsConfig;
use crate::envelope::{check_password, CryptoEnvelope, LifecycleState};
use crate::error::{EfsError, EfsResult};
use crate::migration::{check_space, CopyProgress, DataMigration};
use crate::mount::{MountOrchestrator, UnmountOutcome};
use efs_provider::{KeyringProvider, MountProvider};
use log::{error, info, warn};
use std::fs::{self, DirBuilder};
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;
use std::sync::Arc;

/// Coordinates addressing, the envelope codec, mount orchestration and data
/// migration for each lifecycle operation.
pub struct StorageService<K, P, M> {
    config: Arc<EfsConfig>,
    keyring: K,
    mounts: P,
    migrator: M,
}

impl<K, P, M> StorageService<K, P, M>
where
    K: KeyringProvider<Error = EfsError>,
    P: MountProvider<Error = EfsError>,
    M: DataMigration,
{
    pub fn new(config: Arc<EfsConfig>, keyring: K, mounts: P, migrator: M) -> Self {
        Self {
            config,
            keyring,
            mounts,
            migrator,
        }
    }

    /// Bytes copied by the current or last data migration.
    pub fn progress(&self) -> CopyProgress {
        self.migrator.progress()
    }

    fn orchestrator(&self) -> MountOrchestrator<'_, K, P> {
        MountOrchestrator::new(&self.config, &self.keyring, &self.mounts)
    }

    /// Resolve the derived paths of the unit at `path`.
    pub fn paths(&self, path: &Path) -> EfsResult<UnitPaths> {
        UnitPaths::resolve(&self.config, path)
    }

    /// Encrypt the existing directory at `path` in place under `password`.
    pub fn create(&self, path: &Path, password: &str) -> EfsResult<()> {
        check_password(password)?;
        let paths = self.paths(path)?;
        if paths.lower.exists() {
            return Err(EfsError::AlreadyExists(paths.lower));
        }
        if self.config.migration.check_space {
            check_space(&paths.storage)?;
        }

        DirBuilder::new().mode(0o700).create(&paths.lower)?;

        let sealed = CryptoEnvelope::generate().and_then(|mut envelope| {
            envelope.wrap(password)?;
            envelope.persist(&paths.key_record)
        });
        if let Err(err) = sealed {
            self.discard_unit(&paths);
            return Err(err);
        }

        let orchestrator = self.orchestrator();
        let mounted = orchestrator.mount(&paths.lower, &paths.lower, password, &paths.key_record);
        if let Err(err) = mounted {
            self.discard_unit(&paths);
            return Err(err);
        }

        self.migrator.progress().reset();
        if let Err(err) = self.migrator.copy_dir_content(&paths.storage, &paths.lower) {
            warn!(
                "copy into {} failed; rolling back: {err}",
                paths.lower.display()
            );
            if let Err(cleanup) = self.migrator.remove_dir_content(&paths.lower) {
                warn!("failed to clear {}: {cleanup}", paths.lower.display());
            }
            if let Err(cleanup) = orchestrator.unmount(&paths.lower) {
                warn!("failed to unmount {}: {cleanup}", paths.lower.display());
            }
            self.discard_unit(&paths);
            return Err(err);
        }

        orchestrator.unmount(&paths.lower)?;
        CryptoEnvelope::update_state(&paths.key_record, LifecycleState::Completed)?;

        if let Err(err) = self.migrator.remove_dir_content(&paths.storage) {
            error!(
                "plaintext removal from {} failed after encryption completed: {err}",
                paths.storage.display()
            );
            return Err(EfsError::Irrecoverable {
                path: paths.storage,
                source: Box::new(err),
            });
        }

        info!("created encrypted storage for {}", paths.storage.display());
        Ok(())
    }

    /// Mount the decrypted view of a completed unit onto `path`.
    pub fn unlock(&self, path: &Path, password: &str) -> EfsResult<()> {
        check_password(password)?;
        let paths = self.existing(path)?;
        let state = CryptoEnvelope::load(&paths.key_record)?.state();
        if state != LifecycleState::Completed {
            return Err(EfsError::InconsistentState(format!(
                "{} is {state}, expected completed",
                paths.storage.display()
            )));
        }

        self.orchestrator()
            .mount(&paths.lower, &paths.storage, password, &paths.key_record)?;
        info!("unlocked {}", paths.storage.display());
        Ok(())
    }

    /// Unmount `path`. Succeeds when nothing is mounted there.
    pub fn lock(&self, path: &Path) -> EfsResult<UnmountOutcome> {
        let paths = self.paths(path)?;
        let outcome = self.orchestrator().unmount(&paths.storage)?;
        match &outcome {
            UnmountOutcome::NotMounted => info!("{} already locked", paths.storage.display()),
            UnmountOutcome::Unmounted { .. } => info!("locked {}", paths.storage.display()),
        }
        Ok(outcome)
    }

    /// Re-wrap the unit's keys under `new_password`.
    pub fn change_password(
        &self,
        path: &Path,
        old_password: &str,
        new_password: &str,
    ) -> EfsResult<()> {
        check_password(old_password)?;
        check_password(new_password)?;
        let paths = self.existing(path)?;

        let mut envelope = CryptoEnvelope::load(&paths.key_record)?;
        envelope.unwrap(old_password)?;
        envelope.wrap(new_password)?;
        envelope.persist(&paths.key_record)?;

        info!("changed password for {}", paths.storage.display());
        Ok(())
    }

    /// Delete the encrypted content and the key record of an unmounted unit.
    pub fn remove(&self, path: &Path) -> EfsResult<()> {
        let paths = self.existing(path)?;
        self.remove_unit(&paths)
    }

    /// Decrypt the unit back into `path`, then remove it.
    pub fn recover_and_remove(&self, path: &Path, password: &str) -> EfsResult<()> {
        check_password(password)?;
        let paths = self.existing(path)?;
        let orchestrator = self.orchestrator();
        if orchestrator.is_mounted(&paths.lower)? {
            return Err(EfsError::MountConflict(paths.lower));
        }

        let recovery = recovery_path(&self.config.recovery_root(), &paths.storage)?;
        self.prepare_recovery_dir(&orchestrator, &recovery)?;

        self.migrator.progress().reset();
        let mounted = orchestrator.mount(&paths.lower, &recovery, password, &paths.key_record);
        if let Err(err) = mounted {
            remove_scratch_dir(&recovery);
            return Err(err);
        }

        if let Err(err) = self.migrator.copy_dir_content(&recovery, &paths.storage) {
            if let Err(cleanup) = orchestrator.unmount(&recovery) {
                warn!("failed to unmount {}: {cleanup}", recovery.display());
            } else {
                remove_scratch_dir(&recovery);
            }
            return Err(err);
        }

        orchestrator.unmount(&recovery)?;
        fs::remove_dir(&recovery)?;
        info!(
            "restored plaintext of {} from encrypted storage",
            paths.storage.display()
        );

        self.remove_unit(&paths)
    }

    /// Whether the decrypted view is currently mounted at `path`.
    pub fn is_unlocked(&self, path: &Path) -> EfsResult<bool> {
        let paths = self.paths(path)?;
        self.orchestrator().is_mounted(&paths.storage)
    }

    /// Lifecycle state recorded for the unit at `path`.
    pub fn get_status(&self, path: &Path) -> EfsResult<LifecycleState> {
        let paths = self.paths(path)?;
        match (paths.lower.exists(), paths.key_record.exists()) {
            (true, true) => Ok(CryptoEnvelope::load(&paths.key_record)?.state()),
            (false, false) => Err(EfsError::NotFound(format!(
                "no encrypted storage for {}",
                paths.storage.display()
            ))),
            (lower, _) => {
                let (present, missing) = if lower {
                    (&paths.lower, &paths.key_record)
                } else {
                    (&paths.key_record, &paths.lower)
                };
                Err(EfsError::InconsistentState(format!(
                    "{} exists without {}",
                    present.display(),
                    missing.display()
                )))
            }
        }
    }

    fn existing(&self, path: &Path) -> EfsResult<UnitPaths> {
        let paths = self.paths(path)?;
        if !paths.lower.is_dir() {
            return Err(EfsError::NotFound(format!(
                "encrypted directory {}",
                paths.lower.display()
            )));
        }
        Ok(paths)
    }

    fn remove_unit(&self, paths: &UnitPaths) -> EfsResult<()> {
        if self.orchestrator().is_mounted(&paths.lower)? {
            return Err(EfsError::MountConflict(paths.lower.clone()));
        }

        self.migrator.remove_dir(&paths.lower)?;
        match fs::remove_file(&paths.key_record) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                warn!("key record {} was already gone", paths.key_record.display());
            }
            Err(err) => return Err(err.into()),
        }

        info!("removed encrypted storage for {}", paths.storage.display());
        Ok(())
    }

    fn prepare_recovery_dir(
        &self,
        orchestrator: &MountOrchestrator<'_, K, P>,
        recovery: &Path,
    ) -> EfsResult<()> {
        if recovery.exists() {
            if orchestrator.is_mounted(recovery)? {
                return Err(EfsError::MountConflict(recovery.to_path_buf()));
            }
            if fs::read_dir(recovery)?.next().is_some() {
                return Err(EfsError::AlreadyExists(recovery.to_path_buf()));
            }
            return Ok(());
        }
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(recovery)?;
        Ok(())
    }

    // Best-effort removal of a half-created unit.
    fn discard_unit(&self, paths: &UnitPaths) {
        if paths.lower.exists() {
            if let Err(err) = self.migrator.remove_dir(&paths.lower) {
                warn!("failed to remove {}: {err}", paths.lower.display());
            }
        }
        if let Err(err) = fs::remove_file(&paths.key_record) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(
                    "failed to remove key record {}: {err}",
                    paths.key_record.display()
                );
            }
        }
    }
}

fn remove_scratch_dir(dir: &Path) {
    if let Err(err) = fs::remove_dir(dir) {
        warn!("failed to remove {}: {err}", dir.display());
    }
}
