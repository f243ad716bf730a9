//! Configuration model and helpers used by EFS services.

use crate::error::{EfsError, EfsResult};
use efs_provider::KeyringScope;
use log::info;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/efs/efs.toml";
pub const CONFIG_PATH_ENV: &str = "EFS_CONFIG";
const KEY_STORAGE_ENV: &str = "EFS_KEY_STORAGE_DIR";
const MOUNTS_PATH_ENV: &str = "EFS_MOUNTS_PATH";

/// Where key records and recovery scratch directories live.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StorageCfg {
    #[serde(default = "default_key_storage_dir")]
    pub key_storage_dir: String,

    #[serde(default = "default_key_file_prefix")]
    pub key_file_prefix: String,

    #[serde(default = "default_recovery_root")]
    pub recovery_root: String,
}

fn default_key_storage_dir() -> String {
    "/data/misc/keystore".to_string()
}

fn default_key_file_prefix() -> String {
    ".keys".to_string()
}

fn default_recovery_root() -> String {
    "/data/lost+found".to_string()
}

impl Default for StorageCfg {
    fn default() -> Self {
        Self {
            key_storage_dir: default_key_storage_dir(),
            key_file_prefix: default_key_file_prefix(),
            recovery_root: default_recovery_root(),
        }
    }
}

/// Mount table location and unmount retry policy.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MountCfg {
    #[serde(default = "default_mounts_path")]
    pub mounts_path: String,

    #[serde(default = "default_unmount_attempts")]
    pub unmount_attempts: u32,

    #[serde(default = "default_unmount_retry_delay_ms")]
    pub unmount_retry_delay_ms: u64,
}

fn default_mounts_path() -> String {
    "/proc/mounts".to_string()
}

fn default_unmount_attempts() -> u32 {
    5
}

fn default_unmount_retry_delay_ms() -> u64 {
    1_000
}

impl Default for MountCfg {
    fn default() -> Self {
        Self {
            mounts_path: default_mounts_path(),
            unmount_attempts: default_unmount_attempts(),
            unmount_retry_delay_ms: default_unmount_retry_delay_ms(),
        }
    }
}

/// Keyring selection for registered auth tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum KeyringTarget {
    #[default]
    User,
    Session,
}

impl From<KeyringTarget> for KeyringScope {
    fn from(target: KeyringTarget) -> Self {
        match target {
            KeyringTarget::User => KeyringScope::User,
            KeyringTarget::Session => KeyringScope::Session,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct KeyringCfg {
    #[serde(default)]
    pub scope: KeyringTarget,
}

/// Knobs for the plaintext <-> ciphertext copy step.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MigrationCfg {
    #[serde(default = "default_true")]
    pub check_space: bool,

    #[serde(default = "default_true")]
    pub preserve_security_label: bool,
}

fn default_true() -> bool {
    true
}

impl Default for MigrationCfg {
    fn default() -> Self {
        Self {
            check_space: true,
            preserve_security_label: true,
        }
    }
}

/// Top-level configuration snapshot loaded from disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct EfsConfig {
    #[serde(default)]
    pub storage: StorageCfg,

    #[serde(default)]
    pub mount: MountCfg,

    #[serde(default)]
    pub keyring: KeyringCfg,

    #[serde(default)]
    pub migration: MigrationCfg,

    #[serde(skip)]
    pub path: PathBuf,

    #[serde(skip)]
    pub format: ConfigFormat,
}

/// Tracks whether we parsed TOML or YAML so writes preserve format.
#[derive(Debug, Clone, Copy, Default)]
pub enum ConfigFormat {
    #[default]
    Toml,
    Yaml,
}

impl EfsConfig {
    /// Return the configuration path, honouring `EFS_CONFIG`.
    pub fn default_path() -> PathBuf {
        env::var(CONFIG_PATH_ENV)
            .ok()
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Load configuration from disk, falling back to built-in defaults when
    /// the file does not exist.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> EfsResult<Self> {
        let target = path.as_ref();
        if target.exists() {
            return Self::load(target);
        }

        info!(
            "configuration missing at {}; using built-in defaults",
            target.display()
        );
        Ok(Self {
            path: target.to_path_buf(),
            ..Self::default()
        })
    }

    /// Read a config file from disk, detect format, and validate basics.
    pub fn load<P: AsRef<Path>>(path: P) -> EfsResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let is_toml = matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some(ext) if ext.eq_ignore_ascii_case("toml")
        );
        let mut cfg = if is_toml {
            toml::from_str::<Self>(&contents)?
        } else {
            serde_yaml::from_str::<Self>(&contents)?
        };

        cfg.path = path.to_path_buf();
        cfg.format = if is_toml {
            ConfigFormat::Toml
        } else {
            ConfigFormat::Yaml
        };

        let issues = cfg.validate();
        if !issues.is_empty() {
            return Err(EfsError::InvalidConfig(issues.join("; ")));
        }

        Ok(cfg)
    }

    /// Perform a best-effort validation pass and return human-readable issues.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        for (field, value) in [
            ("storage.key_storage_dir", &self.storage.key_storage_dir),
            ("storage.recovery_root", &self.storage.recovery_root),
            ("mount.mounts_path", &self.mount.mounts_path),
        ] {
            if !value.starts_with('/') {
                issues.push(format!("{field} must be an absolute path (got `{value}`)"));
            }
        }

        let prefix = self.storage.key_file_prefix.trim();
        if prefix.is_empty() {
            issues.push("storage.key_file_prefix cannot be empty".to_string());
        } else if prefix.contains('/') {
            issues.push("storage.key_file_prefix cannot contain `/`".to_string());
        }

        if self.mount.unmount_attempts == 0 {
            issues.push("mount.unmount_attempts must be at least 1".to_string());
        }

        issues
    }

    /// Directory that holds the key records, honouring `EFS_KEY_STORAGE_DIR`.
    pub fn key_storage_dir(&self) -> PathBuf {
        if let Ok(override_path) = env::var(KEY_STORAGE_ENV) {
            if !override_path.is_empty() {
                return PathBuf::from(override_path);
            }
        }
        PathBuf::from(&self.storage.key_storage_dir)
    }

    pub fn recovery_root(&self) -> PathBuf {
        PathBuf::from(&self.storage.recovery_root)
    }

    /// Mount table to scan, honouring `EFS_MOUNTS_PATH`.
    pub fn mounts_path(&self) -> PathBuf {
        if let Ok(override_path) = env::var(MOUNTS_PATH_ENV) {
            if !override_path.is_empty() {
                return PathBuf::from(override_path);
            }
        }
        PathBuf::from(&self.mount.mounts_path)
    }

    pub fn unmount_retry_delay(&self) -> Duration {
        Duration::from_millis(self.mount.unmount_retry_delay_ms)
    }

    pub fn keyring_scope(&self) -> KeyringScope {
        self.keyring.scope.into()
    }

    /// Persist the configuration back to its original on-disk format.
    pub fn save(&self) -> EfsResult<()> {
        let payload = match self.format {
            ConfigFormat::Toml => toml::to_string_pretty(self)?,
            ConfigFormat::Yaml => serde_yaml::to_string(self)?,
        };
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&self.path, payload)?;
        Ok(())
    }
}
