#![forbid(unsafe_code)]

//! Provider contracts shared across the EFS workspace.
//!
//! The kernel keyring and the mount table are machine-wide state. Core
//! workflows only talk to them through the traits in this crate so they can
//! run against in-memory fakes in tests.

pub mod keyring;
pub mod mount;

pub use keyring::{KeySerial, KeyringProvider, KeyringScope};
pub use mount::{MountProvider, MountRequest, UnmountStatus};
