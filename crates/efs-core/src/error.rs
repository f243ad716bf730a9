//! Error taxonomy shared by every EFS component.

use std::path::PathBuf;
use thiserror::Error;

pub type EfsResult<T> = Result<T, EfsError>;

/// Failure raised by any EFS operation. The first failure is propagated
/// unchanged up to the caller.
#[derive(Debug, Error)]
pub enum EfsError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("encrypted storage already exists for {}", .0.display())]
    AlreadyExists(PathBuf),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("wrong password")]
    WrongPassword,

    #[error("inconsistent storage state: {0}")]
    InconsistentState(String),

    #[error("{} is mounted", .0.display())]
    MountConflict(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed key record {}: {reason}", path.display())]
    MalformedRecord { path: PathBuf, reason: String },

    #[error("mount error: {0}")]
    Mount(String),

    #[error(
        "not enough free space to encrypt {}: {required} bytes needed, {available} available",
        path.display()
    )]
    InsufficientSpace {
        path: PathBuf,
        required: u64,
        available: u64,
    },

    #[error("keyring error: {0}")]
    Keyring(String),

    #[error("keyring quota exhausted: {0}")]
    KeyringQuota(String),

    #[error(
        "removing plaintext from {} failed after encryption; manual intervention required: {source}",
        path.display()
    )]
    Irrecoverable {
        path: PathBuf,
        #[source]
        source: Box<EfsError>,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to parse TOML configuration: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("failed to render TOML configuration: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("failed to process YAML configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Coarse failure classes surfaced to the command layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    AlreadyExists,
    NotFound,
    WrongPassword,
    InconsistentState,
    MountConflict,
    Io,
    Keyring,
    Irrecoverable,
    Config,
}

impl ErrorKind {
    /// Stable numeric status code for the command surface. `0` is success.
    pub fn code(self) -> i32 {
        match self {
            ErrorKind::Validation => 2,
            ErrorKind::AlreadyExists => 3,
            ErrorKind::NotFound => 4,
            ErrorKind::WrongPassword => 5,
            ErrorKind::InconsistentState => 6,
            ErrorKind::MountConflict => 7,
            ErrorKind::Io => 8,
            ErrorKind::Keyring => 9,
            ErrorKind::Irrecoverable => 10,
            ErrorKind::Config => 11,
        }
    }
}

impl EfsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EfsError::Validation(_) => ErrorKind::Validation,
            EfsError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            EfsError::NotFound(_) => ErrorKind::NotFound,
            EfsError::WrongPassword => ErrorKind::WrongPassword,
            EfsError::InconsistentState(_) => ErrorKind::InconsistentState,
            EfsError::MountConflict(_) => ErrorKind::MountConflict,
            EfsError::Io(_)
            | EfsError::MalformedRecord { .. }
            | EfsError::Mount(_)
            | EfsError::InsufficientSpace { .. } => ErrorKind::Io,
            EfsError::Keyring(_) | EfsError::KeyringQuota(_) => ErrorKind::Keyring,
            EfsError::Irrecoverable { .. } => ErrorKind::Irrecoverable,
            EfsError::InvalidConfig(_)
            | EfsError::TomlDe(_)
            | EfsError::TomlSer(_)
            | EfsError::Yaml(_) => ErrorKind::Config,
        }
    }

    pub fn code(&self) -> i32 {
        self.kind().code()
    }

    /// True when the keyring refused a key because the caller's quota is full.
    pub fn is_quota_exhausted(&self) -> bool {
        matches!(self, EfsError::KeyringQuota(_))
    }
}
