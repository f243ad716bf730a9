//! Provider contract for the kernel key-retention facility.

use std::error::Error;

/// Serial number the kernel assigns to a key.
pub type KeySerial = i32;

/// Which keyring of the calling process receives registered keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum KeyringScope {
    /// Per-uid keyring shared by every process of the caller's user.
    #[default]
    User,
    /// Session keyring of the calling process.
    Session,
}

/// Abstraction over `add_key(2)` / `keyctl(2)`.
pub trait KeyringProvider {
    type Error: Error + Send + Sync + 'static;

    /// Register `payload` under `key_type`/`description` in `scope`.
    ///
    /// Adding a key whose type and description already exist in the target
    /// keyring replaces its payload; implementations must not treat that as
    /// an error.
    fn add_key(
        &self,
        scope: KeyringScope,
        key_type: &str,
        description: &str,
        payload: &[u8],
    ) -> Result<KeySerial, Self::Error>;

    /// Look up a key by type and description. `None` when absent.
    fn search_key(
        &self,
        scope: KeyringScope,
        key_type: &str,
        description: &str,
    ) -> Result<Option<KeySerial>, Self::Error>;

    /// Unlink a previously found key from `scope`.
    fn unlink_key(&self, scope: KeyringScope, serial: KeySerial) -> Result<(), Self::Error>;
}
