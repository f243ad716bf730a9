//! Core building blocks for encrypted file storage (EFS) units.
//!
//! An EFS unit is an ordinary directory whose content lives encrypted in a
//! hidden sibling "lower" directory and is exposed through a stacked
//! encrypting filesystem while unlocked. This crate owns the key envelope,
//! the key-record store, the keyring and mount orchestration, and the
//! lifecycle engine that ties them together. Kernel access goes through the
//! contracts in `efs-provider`.

pub mod addressing;
pub mod config;
pub mod envelope;
pub mod error;
pub mod keyring;
pub mod logging;
pub mod migration;
pub mod mount;
pub mod service;

#[cfg(test)]
mod testing;

pub use config::{ConfigFormat, EfsConfig, KeyringCfg, MigrationCfg, MountCfg, StorageCfg};
pub use envelope::{CryptoEnvelope, LifecycleState};
pub use error::{EfsError, EfsResult, ErrorKind};
pub use migration::{CopyProgress, DataMigration, TreeMigrator};
pub use mount::{MountOrchestrator, UnmountOutcome};
pub use service::StorageService;
