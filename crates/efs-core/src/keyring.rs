//! Binding decrypted keys into the kernel keyring.
//!
//! The encrypting filesystem looks keys up by signature in the caller's
//! keyring. Each key is registered as a packed password auth token under
//! key type [`KEY_TYPE`] and description equal to its signature.

use crate::envelope::KEY_LEN;
use crate::error::{EfsError, EfsResult};
use efs_provider::{KeySerial, KeyringProvider, KeyringScope};
use log::debug;
use sha2::{Digest, Sha512};
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const KEY_TYPE: &str = "user";

/// Hex characters in a key signature.
pub const SIGNATURE_HEX_LEN: usize = 16;

const TOKEN_VERSION: u16 = 0x0004;
const TOKEN_TYPE_PASSWORD: u16 = 0;
const PGP_HASH_SHA512: i32 = 10;
const SESSION_KEY_ENCRYPTION_KEY_SET: u32 = 0x02;

const MAX_ENCRYPTED_KEY_BYTES: usize = 512;
const MAX_KEY_BYTES: usize = 64;
const RESERVED_BYTES: usize = 32;
const SALT_BYTES: usize = 8;
const SESSION_KEY_BLOCK: usize = 12 + MAX_ENCRYPTED_KEY_BYTES + MAX_KEY_BYTES;
const PASSWORD_BLOCK: usize = 20 + MAX_KEY_BYTES + SIGNATURE_HEX_LEN + 1 + SALT_BYTES;

/// Size of the packed auth token payload.
pub const AUTH_TOKEN_LEN: usize = 8 + SESSION_KEY_BLOCK + RESERVED_BYTES + PASSWORD_BLOCK;

/// Lower-case hex encoding of `bytes`.
pub fn hex_signature(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

/// Signature of a raw key: the first 8 bytes of its SHA-512, hex encoded.
pub fn key_signature(key: &[u8]) -> String {
    let digest = Sha512::digest(key);
    hex_signature(&digest[..SIGNATURE_HEX_LEN / 2])
}

/// Packed password auth token as consumed by the encrypting filesystem.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct AuthToken {
    bytes: Vec<u8>,
}

impl AuthToken {
    pub fn password(key: &[u8; KEY_LEN], signature: &str, salt: &[u8]) -> EfsResult<Self> {
        if signature.len() != SIGNATURE_HEX_LEN || !signature.is_ascii() {
            return Err(EfsError::Validation(format!(
                "key signature must be {SIGNATURE_HEX_LEN} hex characters"
            )));
        }
        if salt.len() < SALT_BYTES {
            return Err(EfsError::Validation(format!(
                "auth token salt needs {SALT_BYTES} bytes, got {}",
                salt.len()
            )));
        }

        let mut bytes = Vec::with_capacity(AUTH_TOKEN_LEN);
        bytes.extend_from_slice(&TOKEN_VERSION.to_ne_bytes());
        bytes.extend_from_slice(&TOKEN_TYPE_PASSWORD.to_ne_bytes());
        bytes.extend_from_slice(&0u32.to_ne_bytes());

        // Session key block stays empty for password tokens.
        bytes.resize(bytes.len() + SESSION_KEY_BLOCK + RESERVED_BYTES, 0);

        bytes.extend_from_slice(&0u32.to_ne_bytes());
        bytes.extend_from_slice(&PGP_HASH_SHA512.to_ne_bytes());
        bytes.extend_from_slice(&0u32.to_ne_bytes());
        bytes.extend_from_slice(&(KEY_LEN as u32).to_ne_bytes());
        bytes.extend_from_slice(&SESSION_KEY_ENCRYPTION_KEY_SET.to_ne_bytes());

        let mut session_key = [0u8; MAX_KEY_BYTES];
        session_key[..KEY_LEN].copy_from_slice(key);
        bytes.extend_from_slice(&session_key);
        session_key.zeroize();

        bytes.extend_from_slice(signature.as_bytes());
        bytes.push(0);
        bytes.extend_from_slice(&salt[..SALT_BYTES]);

        debug_assert_eq!(bytes.len(), AUTH_TOKEN_LEN);
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Register `key` under `signature`. Re-binding an existing signature
/// replaces the payload.
pub fn bind<K>(
    keyring: &K,
    scope: KeyringScope,
    key: &[u8; KEY_LEN],
    signature: &str,
    salt: &[u8],
) -> EfsResult<KeySerial>
where
    K: KeyringProvider<Error = EfsError>,
{
    let token = AuthToken::password(key, signature, salt)?;
    let serial = keyring.add_key(scope, KEY_TYPE, signature, token.as_bytes())?;
    debug!("bound key {signature} as serial {serial}");
    Ok(serial)
}

/// Unlink the key registered under `signature`.
pub fn unbind<K>(keyring: &K, scope: KeyringScope, signature: &str) -> EfsResult<()>
where
    K: KeyringProvider<Error = EfsError>,
{
    let serial = keyring
        .search_key(scope, KEY_TYPE, signature)?
        .ok_or_else(|| EfsError::NotFound(format!("keyring entry {signature}")))?;
    keyring.unlink_key(scope, serial)?;
    debug!("unbound key {signature} (serial {serial})");
    Ok(())
}
