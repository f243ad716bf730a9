//! Mount orchestration for the encrypting filesystem.
//!
//! Mount state is never tracked in-process: every decision is taken from a
//! fresh scan of the live mount table returned by the [`MountProvider`].

use crate::config::EfsConfig;
use crate::envelope::{CryptoEnvelope, KEY_LEN};
use crate::error::{EfsError, EfsResult};
use crate::keyring::{self, key_signature};
use efs_provider::{KeyringProvider, KeyringScope, MountProvider, MountRequest, UnmountStatus};
use log::{debug, info, warn};
use std::fs;
use std::os::unix::fs::{chown, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

pub const FS_TYPE: &str = "ecryptfs";
const SIG_OPTION: &str = "ecryptfs_sig";
const FNEK_SIG_OPTION: &str = "ecryptfs_fnek_sig";

/// One parsed line of the mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub device: PathBuf,
    pub mount_point: PathBuf,
    pub fs_type: String,
    pub options: String,
}

impl MountEntry {
    fn matches(&self, path: &Path) -> bool {
        self.fs_type == FS_TYPE && (self.device == path || self.mount_point == path)
    }
}

/// Split a `/proc/mounts` style table into entries, skipping blank or
/// truncated lines.
pub fn parse_mount_table(table: &str) -> Vec<MountEntry> {
    let mut entries = Vec::new();
    for line in table.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let mut parts = line.split_whitespace();
        let (Some(device), Some(mount_point), Some(fs_type), Some(options)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        entries.push(MountEntry {
            device: PathBuf::from(unescape_mount_field(device)),
            mount_point: PathBuf::from(unescape_mount_field(mount_point)),
            fs_type: fs_type.to_string(),
            options: options.to_string(),
        });
    }
    entries
}

/// Decode the `\ooo` octal escapes the kernel uses for whitespace.
pub fn unescape_mount_field(input: &str) -> String {
    let mut chars = input.chars().peekable();
    let mut output = String::with_capacity(input.len());

    while let Some(ch) = chars.next() {
        if ch == '\\' {
            let mut oct = String::new();
            for _ in 0..3 {
                match chars.peek() {
                    Some(next) if next.is_digit(8) => oct.push(*next),
                    _ => break,
                }
                chars.next();
            }
            if oct.len() == 3 {
                if let Ok(value) = u8::from_str_radix(&oct, 8) {
                    output.push(value as char);
                    continue;
                }
            }
            output.push('\\');
            output.push_str(&oct);
        } else {
            output.push(ch);
        }
    }

    output
}

/// First encrypting-filesystem entry whose device or mount point is `path`.
pub fn find_entry(table: &str, path: &Path) -> Option<MountEntry> {
    parse_mount_table(table)
        .into_iter()
        .find(|entry| entry.matches(path))
}

/// Value of `key=value` in a comma separated option string.
pub fn option_value<'a>(options: &'a str, key: &str) -> Option<&'a str> {
    options.split(',').find_map(|option| {
        let (name, value) = option.split_once('=')?;
        (name == key).then_some(value)
    })
}

pub fn mount_options_for(file_key_sig: &str, filename_key_sig: &str) -> String {
    format!(
        "{SIG_OPTION}={file_key_sig},{FNEK_SIG_OPTION}={filename_key_sig},\
         ecryptfs_cipher=aes,ecryptfs_key_bytes={KEY_LEN}"
    )
}

/// Result of [`MountOrchestrator::unmount`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnmountOutcome {
    NotMounted,
    /// Detached. `key_failures` lists keys that could not be unbound.
    Unmounted { key_failures: Vec<String> },
}

/// Attaches and detaches the encrypting filesystem and keeps the kernel
/// keyring in step with it.
pub struct MountOrchestrator<'a, K, P> {
    keyring: &'a K,
    mounts: &'a P,
    scope: KeyringScope,
    attempts: u32,
    retry_delay: Duration,
}

impl<'a, K, P> MountOrchestrator<'a, K, P>
where
    K: KeyringProvider<Error = EfsError>,
    P: MountProvider<Error = EfsError>,
{
    pub fn new(config: &EfsConfig, keyring: &'a K, mounts: &'a P) -> Self {
        Self {
            keyring,
            mounts,
            scope: config.keyring_scope(),
            attempts: config.mount.unmount_attempts.max(1),
            retry_delay: config.unmount_retry_delay(),
        }
    }

    pub fn is_mounted(&self, path: &Path) -> EfsResult<bool> {
        Ok(self.mount_options(path)?.is_some())
    }

    /// Raw option string of the entry matching `path`, if mounted.
    pub fn mount_options(&self, path: &Path) -> EfsResult<Option<String>> {
        let table = self.mounts.mount_table()?;
        Ok(find_entry(&table, path).map(|entry| entry.options))
    }

    /// Unwrap the envelope at `key_record`, bind its keys and mount `lower`
    /// onto `mount_point`. A lower directory that is already a mount source
    /// is left alone.
    pub fn mount(
        &self,
        lower: &Path,
        mount_point: &Path,
        password: &str,
        key_record: &Path,
    ) -> EfsResult<()> {
        let table = self.mounts.mount_table()?;
        let already = parse_mount_table(&table)
            .into_iter()
            .any(|entry| entry.fs_type == FS_TYPE && entry.device == lower);
        if already {
            info!("{} is already mounted; skipping", lower.display());
            return Ok(());
        }

        let before = fs::metadata(mount_point)?;

        let mut envelope = CryptoEnvelope::load(key_record)?;
        envelope.unwrap(password)?;

        let file_key_sig = key_signature(envelope.file_key());
        let filename_key_sig = key_signature(envelope.filename_key());
        keyring::bind(
            self.keyring,
            self.scope,
            envelope.file_key(),
            &file_key_sig,
            envelope.salt(),
        )?;
        keyring::bind(
            self.keyring,
            self.scope,
            envelope.filename_key(),
            &filename_key_sig,
            envelope.salt(),
        )?;
        drop(envelope);

        let request = MountRequest {
            source: lower.to_path_buf(),
            target: mount_point.to_path_buf(),
            fs_type: FS_TYPE.to_string(),
            options: mount_options_for(&file_key_sig, &filename_key_sig),
        };
        self.mounts.mount(&request)?;

        chown(mount_point, Some(before.uid()), Some(before.gid()))?;
        fs::set_permissions(
            mount_point,
            fs::Permissions::from_mode(before.mode() & 0o7777),
        )?;

        info!(
            "mounted {} on {}",
            lower.display(),
            mount_point.display()
        );
        Ok(())
    }

    /// Detach whatever encrypting mount matches `path` and unbind its keys.
    pub fn unmount(&self, path: &Path) -> EfsResult<UnmountOutcome> {
        let table = self.mounts.mount_table()?;
        let Some(entry) = find_entry(&table, path) else {
            debug!("{} is not mounted", path.display());
            return Ok(UnmountOutcome::NotMounted);
        };

        let mut signatures = Vec::with_capacity(2);
        for key in [SIG_OPTION, FNEK_SIG_OPTION] {
            let Some(signature) = option_value(&entry.options, key) else {
                return Err(EfsError::Mount(format!(
                    "mount of {} carries no {key} option",
                    entry.mount_point.display()
                )));
            };
            signatures.push(signature.to_string());
        }

        self.detach(&entry.mount_point)?;

        let mut key_failures = Vec::new();
        for signature in &signatures {
            if let Err(err) = keyring::unbind(self.keyring, self.scope, signature) {
                warn!("failed to unbind key {signature}: {err}");
                key_failures.push(format!("{signature}: {err}"));
            }
        }

        info!("unmounted {}", entry.mount_point.display());
        Ok(UnmountOutcome::Unmounted { key_failures })
    }

    fn detach(&self, target: &Path) -> EfsResult<()> {
        let mut last_error = None;
        for attempt in 1..=self.attempts {
            match self.mounts.unmount(target)? {
                UnmountStatus::Unmounted | UnmountStatus::NotMounted => return Ok(()),
                UnmountStatus::Failed(err) => {
                    warn!(
                        "unmount of {} failed (attempt {attempt}/{}): {err}",
                        target.display(),
                        self.attempts
                    );
                    last_error = Some(err);
                }
            }
            if attempt < self.attempts {
                thread::sleep(self.retry_delay);
            }
        }

        Err(EfsError::Mount(format!(
            "unable to unmount {} after {} attempts: {}",
            target.display(),
            self.attempts,
            last_error.map_or_else(|| "unknown error".to_string(), |err| err.to_string())
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fast_config, FakeKeyring, FakeMounts};
    use tempfile::tempdir;

    fn sealed_record(dir: &Path, password: &str) -> PathBuf {
        let path = dir.join(".keys.test");
        let mut envelope = CryptoEnvelope::generate().unwrap();
        envelope.wrap(password).unwrap();
        envelope.persist(&path).unwrap();
        path
    }

    #[test]
    fn parse_mount_table_decodes_escapes() {
        let table = "/data/.a\\040b /data/a\\040b ecryptfs rw,ecryptfs_sig=00 0 0\n\nbroken line\n";
        let entries = parse_mount_table(table);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].mount_point, PathBuf::from("/data/a b"));
    }

    #[test]
    fn find_entry_matches_device_or_mount_point_of_ecryptfs_only() {
        let table = "/dev/sda1 /data ext4 rw 0 0\n/data/.u /data/u ecryptfs rw 0 0\n";
        assert!(find_entry(table, Path::new("/data/.u")).is_some());
        assert!(find_entry(table, Path::new("/data/u")).is_some());
        assert!(find_entry(table, Path::new("/data")).is_none());
    }

    #[test]
    fn option_value_extracts_signatures() {
        let opts = "rw,relatime,ecryptfs_fnek_sig=bbbb,ecryptfs_sig=aaaa,ecryptfs_unlink_sigs";
        assert_eq!(option_value(opts, SIG_OPTION), Some("aaaa"));
        assert_eq!(option_value(opts, FNEK_SIG_OPTION), Some("bbbb"));
        assert_eq!(option_value(opts, "ecryptfs_cipher"), None);
    }

    #[test]
    fn unescape_keeps_incomplete_sequences() {
        assert_eq!(unescape_mount_field("/mnt/a\\04"), "/mnt/a\\04");
        assert_eq!(unescape_mount_field("/mnt/plain"), "/mnt/plain");
    }

    #[test]
    fn mount_binds_keys_and_restores_mode() {
        let dir = tempdir().unwrap();
        let lower = dir.path().join(".u");
        let point = dir.path().join("u");
        fs::create_dir(&lower).unwrap();
        fs::create_dir(&point).unwrap();
        fs::set_permissions(&point, fs::Permissions::from_mode(0o751)).unwrap();
        let record = sealed_record(dir.path(), "pass1234");

        let config = fast_config();
        let keyring = FakeKeyring::default();
        let mounts = FakeMounts::default();
        let orchestrator = MountOrchestrator::new(&config, &keyring, &mounts);

        orchestrator.mount(&lower, &point, "pass1234", &record).unwrap();
        assert!(orchestrator.is_mounted(&point).unwrap());
        assert_eq!(keyring.len(), 2);
        let mode = fs::metadata(&point).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode, 0o751);

        let options = orchestrator.mount_options(&point).unwrap().unwrap();
        assert!(options.ends_with("ecryptfs_cipher=aes,ecryptfs_key_bytes=16"));

        orchestrator.mount(&lower, &point, "pass1234", &record).unwrap();
        assert_eq!(mounts.mount_calls(), 1);
    }

    #[test]
    fn wrong_password_leaves_table_untouched() {
        let dir = tempdir().unwrap();
        let lower = dir.path().join(".u");
        let point = dir.path().join("u");
        fs::create_dir(&lower).unwrap();
        fs::create_dir(&point).unwrap();
        let record = sealed_record(dir.path(), "pass1234");

        let config = fast_config();
        let keyring = FakeKeyring::default();
        let mounts = FakeMounts::default();
        let orchestrator = MountOrchestrator::new(&config, &keyring, &mounts);

        let err = orchestrator
            .mount(&lower, &point, "wrongpw", &record)
            .unwrap_err();
        assert!(matches!(err, EfsError::WrongPassword));
        assert_eq!(mounts.mount_table().unwrap(), "");
        assert_eq!(keyring.len(), 0);
    }

    #[test]
    fn unmount_retries_busy_targets_then_unbinds() {
        let dir = tempdir().unwrap();
        let lower = dir.path().join(".u");
        let point = dir.path().join("u");
        fs::create_dir(&lower).unwrap();
        fs::create_dir(&point).unwrap();
        let record = sealed_record(dir.path(), "pass1234");

        let config = fast_config();
        let keyring = FakeKeyring::default();
        let mounts = FakeMounts::default();
        let orchestrator = MountOrchestrator::new(&config, &keyring, &mounts);
        orchestrator.mount(&lower, &point, "pass1234", &record).unwrap();

        mounts.set_busy(2);
        let outcome = orchestrator.unmount(&point).unwrap();
        assert_eq!(
            outcome,
            UnmountOutcome::Unmounted {
                key_failures: Vec::new()
            }
        );
        assert_eq!(keyring.len(), 0);
        assert_eq!(
            orchestrator.unmount(&point).unwrap(),
            UnmountOutcome::NotMounted
        );
    }

    #[test]
    fn persistent_busy_is_fatal() {
        let dir = tempdir().unwrap();
        let lower = dir.path().join(".u");
        let point = dir.path().join("u");
        fs::create_dir(&lower).unwrap();
        fs::create_dir(&point).unwrap();
        let record = sealed_record(dir.path(), "pass1234");

        let config = fast_config();
        let keyring = FakeKeyring::default();
        let mounts = FakeMounts::default();
        let orchestrator = MountOrchestrator::new(&config, &keyring, &mounts);
        orchestrator.mount(&lower, &point, "pass1234", &record).unwrap();

        mounts.set_busy(config.mount.unmount_attempts as usize);
        let err = orchestrator.unmount(&point).unwrap_err();
        assert!(matches!(err, EfsError::Mount(_)));
        assert!(orchestrator.is_mounted(&point).unwrap());
    }

    #[test]
    fn unmount_without_signatures_fails_before_detaching() {
        let dir = tempdir().unwrap();
        let point = dir.path().join("u");
        fs::create_dir(&point).unwrap();

        let config = fast_config();
        let keyring = FakeKeyring::default();
        let mounts = FakeMounts::default();
        mounts
            .mount(&MountRequest {
                source: point.clone(),
                target: point.clone(),
                fs_type: FS_TYPE.to_string(),
                options: format!("{SIG_OPTION}=aaaa"),
            })
            .unwrap();
        let orchestrator = MountOrchestrator::new(&config, &keyring, &mounts);

        let err = orchestrator.unmount(&point).unwrap_err();
        assert!(matches!(err, EfsError::Mount(_)));
        assert!(orchestrator.is_mounted(&point).unwrap());
    }

    #[test]
    fn missing_keys_are_reported_not_fatal() {
        let dir = tempdir().unwrap();
        let lower = dir.path().join(".u");
        let point = dir.path().join("u");
        fs::create_dir(&lower).unwrap();
        fs::create_dir(&point).unwrap();
        let record = sealed_record(dir.path(), "pass1234");

        let config = fast_config();
        let keyring = FakeKeyring::default();
        let mounts = FakeMounts::default();
        let orchestrator = MountOrchestrator::new(&config, &keyring, &mounts);
        orchestrator.mount(&lower, &point, "pass1234", &record).unwrap();
        keyring.clear();

        match orchestrator.unmount(&point).unwrap() {
            UnmountOutcome::Unmounted { key_failures } => assert_eq!(key_failures.len(), 2),
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}
