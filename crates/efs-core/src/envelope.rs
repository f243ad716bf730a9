//! Key envelope codec: generation, password wrapping and the on-disk record.
//!
//! A record is a fixed 116-byte structure:
//!
//! | offset | size | field |
//! |---|---|---|
//! | 0 | 16 | file key |
//! | 16 | 16 | filename key |
//! | 32 | 16 | salt |
//! | 48 | 64 | integrity signature |
//! | 112 | 4 | lifecycle state (native-endian `i32`) |
//!
//! The file key, filename key and signature are stored wrapped with
//! AES-128-CBC under material derived from the password with
//! PBKDF2-HMAC-SHA1. The salt and state are stored in the clear.

use crate::error::{EfsError, EfsResult};
use aes::Aes128;
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use log::debug;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Serialize;
use sha1::Sha1;
use sha2::{Digest, Sha512};
use std::fmt;
use std::fs::{self, DirBuilder, File};
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::Path;
use subtle::ConstantTimeEq;
use tempfile::NamedTempFile;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const KEY_LEN: usize = 16;
pub const SALT_LEN: usize = 16;
pub const SIGNATURE_LEN: usize = 64;
pub const RECORD_LEN: usize = 2 * KEY_LEN + SALT_LEN + SIGNATURE_LEN + 4;

pub const MIN_PASSWORD_LENGTH: usize = 4;
pub const KDF_ITERATIONS: u32 = 10_000;

type WrapEncryptor = cbc::Encryptor<Aes128>;
type WrapDecryptor = cbc::Decryptor<Aes128>;

/// Progress of the plaintext to ciphertext conversion, persisted in the
/// record. `InProgress` is never written by the current create flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(i32)]
pub enum LifecycleState {
    NotStarted = 1,
    InProgress = 2,
    Completed = 3,
}

impl LifecycleState {
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            1 => Some(Self::NotStarted),
            2 => Some(Self::InProgress),
            3 => Some(Self::Completed),
            _ => None,
        }
    }

    pub fn as_raw(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::NotStarted => "not-started",
            Self::InProgress => "in-progress",
            Self::Completed => "completed",
        };
        f.write_str(label)
    }
}

/// Reject passwords shorter than [`MIN_PASSWORD_LENGTH`] bytes.
pub fn check_password(password: &str) -> EfsResult<()> {
    if password.len() < MIN_PASSWORD_LENGTH {
        return Err(EfsError::Validation(format!(
            "password must be at least {MIN_PASSWORD_LENGTH} characters"
        )));
    }
    Ok(())
}

/// Cipher key and IV derived from a password and the record salt.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct WrapMaterial {
    key: [u8; KEY_LEN],
    iv: [u8; KEY_LEN],
}

/// PBKDF2-HMAC-SHA1 over `password`/`salt`, 32 bytes: the first half keys
/// the cipher, the second half is the IV.
pub fn derive_wrap_material(password: &str, salt: &[u8; SALT_LEN]) -> WrapMaterial {
    let mut derived = [0u8; 2 * KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha1>(password.as_bytes(), salt, KDF_ITERATIONS, &mut derived);

    let mut material = WrapMaterial {
        key: [0u8; KEY_LEN],
        iv: [0u8; KEY_LEN],
    };
    material.key.copy_from_slice(&derived[..KEY_LEN]);
    material.iv.copy_from_slice(&derived[KEY_LEN..]);
    derived.zeroize();
    material
}

impl WrapMaterial {
    // Each field starts its own CBC chain from the IV.
    fn encrypt(&self, field: &mut [u8]) -> EfsResult<()> {
        let len = field.len();
        WrapEncryptor::new_from_slices(&self.key, &self.iv)
            .map_err(|err| cipher_failure("encrypt", err))?
            .encrypt_padded_mut::<NoPadding>(field, len)
            .map_err(|err| cipher_failure("encrypt", err))?;
        Ok(())
    }

    fn decrypt(&self, field: &mut [u8]) -> EfsResult<()> {
        WrapDecryptor::new_from_slices(&self.key, &self.iv)
            .map_err(|err| cipher_failure("decrypt", err))?
            .decrypt_padded_mut::<NoPadding>(field)
            .map_err(|err| cipher_failure("decrypt", err))?;
        Ok(())
    }
}

fn sync_parent_dir(dir: &Path) -> io::Result<()> {
    File::open(dir).and_then(|file| file.sync_all())
}

fn cipher_failure(op: &str, err: impl fmt::Display) -> EfsError {
    EfsError::Io(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("failed to {op} envelope field: {err}"),
    ))
}

/// Key material of one unit. Fields hold plaintext between [`generate`] or
/// [`CryptoEnvelope::unwrap`] and the next [`CryptoEnvelope::wrap`], and
/// ciphertext otherwise. Memory is wiped on drop.
///
/// [`generate`]: CryptoEnvelope::generate
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CryptoEnvelope {
    file_key: [u8; KEY_LEN],
    filename_key: [u8; KEY_LEN],
    salt: [u8; SALT_LEN],
    signature: [u8; SIGNATURE_LEN],
    #[zeroize(skip)]
    state: LifecycleState,
}

impl fmt::Debug for CryptoEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoEnvelope")
            .field("salt", &hex::encode(self.salt))
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl CryptoEnvelope {
    /// Fresh random keys and salt, signed, in state `NotStarted`.
    pub fn generate() -> EfsResult<Self> {
        let mut envelope = Self {
            file_key: [0u8; KEY_LEN],
            filename_key: [0u8; KEY_LEN],
            salt: [0u8; SALT_LEN],
            signature: [0u8; SIGNATURE_LEN],
            state: LifecycleState::NotStarted,
        };
        for field in [
            &mut envelope.file_key[..],
            &mut envelope.filename_key[..],
            &mut envelope.salt[..],
        ] {
            OsRng
                .try_fill_bytes(field)
                .map_err(|err| EfsError::Io(io::Error::new(io::ErrorKind::Other, err)))?;
        }
        envelope.signature = envelope.compute_signature();
        Ok(envelope)
    }

    fn compute_signature(&self) -> [u8; SIGNATURE_LEN] {
        let mut hasher = Sha512::new();
        hasher.update(self.file_key);
        hasher.update(self.filename_key);
        hasher.update(self.salt);
        let digest = hasher.finalize();
        let mut signature = [0u8; SIGNATURE_LEN];
        signature.copy_from_slice(&digest);
        signature
    }

    /// Encrypt the keys and signature in place under `password`.
    pub fn wrap(&mut self, password: &str) -> EfsResult<()> {
        let material = derive_wrap_material(password, &self.salt);
        material.encrypt(&mut self.file_key)?;
        material.encrypt(&mut self.filename_key)?;
        material.encrypt(&mut self.signature)?;
        Ok(())
    }

    /// Decrypt in place and check the signature. A mismatch means the
    /// password was wrong and yields [`EfsError::WrongPassword`].
    pub fn unwrap(&mut self, password: &str) -> EfsResult<()> {
        let material = derive_wrap_material(password, &self.salt);
        material.decrypt(&mut self.file_key)?;
        material.decrypt(&mut self.filename_key)?;
        material.decrypt(&mut self.signature)?;
        self.verify()
    }

    /// Compare the stored signature against the current key fields.
    pub fn verify(&self) -> EfsResult<()> {
        let mut expected = self.compute_signature();
        let matches: bool = expected[..].ct_eq(&self.signature[..]).into();
        expected.zeroize();
        if matches {
            Ok(())
        } else {
            Err(EfsError::WrongPassword)
        }
    }

    pub fn file_key(&self) -> &[u8; KEY_LEN] {
        &self.file_key
    }

    pub fn filename_key(&self) -> &[u8; KEY_LEN] {
        &self.filename_key
    }

    pub fn salt(&self) -> &[u8; SALT_LEN] {
        &self.salt
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn set_state(&mut self, state: LifecycleState) {
        self.state = state;
    }

    pub fn to_bytes(&self) -> [u8; RECORD_LEN] {
        let mut out = [0u8; RECORD_LEN];
        let (keys, rest) = out.split_at_mut(2 * KEY_LEN);
        keys[..KEY_LEN].copy_from_slice(&self.file_key);
        keys[KEY_LEN..].copy_from_slice(&self.filename_key);
        let (salt, rest) = rest.split_at_mut(SALT_LEN);
        salt.copy_from_slice(&self.salt);
        let (signature, state) = rest.split_at_mut(SIGNATURE_LEN);
        signature.copy_from_slice(&self.signature);
        state.copy_from_slice(&self.state.as_raw().to_ne_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, String> {
        if bytes.len() != RECORD_LEN {
            return Err(format!(
                "expected {RECORD_LEN} bytes, found {}",
                bytes.len()
            ));
        }

        let mut state_raw = [0u8; 4];
        state_raw.copy_from_slice(&bytes[RECORD_LEN - 4..]);
        let raw = i32::from_ne_bytes(state_raw);
        let state =
            LifecycleState::from_raw(raw).ok_or_else(|| format!("unknown lifecycle state {raw}"))?;

        let mut envelope = Self {
            file_key: [0u8; KEY_LEN],
            filename_key: [0u8; KEY_LEN],
            salt: [0u8; SALT_LEN],
            signature: [0u8; SIGNATURE_LEN],
            state,
        };
        let mut offset = 0;
        for field in [
            &mut envelope.file_key[..],
            &mut envelope.filename_key[..],
            &mut envelope.salt[..],
            &mut envelope.signature[..],
        ] {
            let end = offset + field.len();
            field.copy_from_slice(&bytes[offset..end]);
            offset = end;
        }
        Ok(envelope)
    }

    /// Write the record to `path` (mode 0600), replacing any previous one.
    pub fn persist(&self, path: &Path) -> EfsResult<()> {
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        DirBuilder::new().recursive(true).mode(0o700).create(parent)?;

        let mut temp = NamedTempFile::new_in(parent)?;
        fs::set_permissions(temp.path(), fs::Permissions::from_mode(0o600))?;
        let mut bytes = self.to_bytes();
        let written = temp.as_file_mut().write_all(&bytes);
        bytes.zeroize();
        written?;
        temp.as_file().sync_all()?;

        temp.persist(path).map_err(|err| EfsError::Io(err.error))?;
        let _ = sync_parent_dir(parent);
        debug!("persisted key record {}", path.display());
        Ok(())
    }

    /// Read a whole record from `path`.
    pub fn load(path: &Path) -> EfsResult<Self> {
        let mut bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(EfsError::NotFound(format!("key record {}", path.display())))
            }
            Err(err) => return Err(err.into()),
        };
        let parsed = Self::from_bytes(&bytes);
        bytes.zeroize();
        parsed.map_err(|reason| EfsError::MalformedRecord {
            path: path.to_path_buf(),
            reason,
        })
    }

    /// Rewrite only the lifecycle state of the record at `path`.
    pub fn update_state(path: &Path, state: LifecycleState) -> EfsResult<()> {
        let mut envelope = Self::load(path)?;
        envelope.set_state(state);
        envelope.persist(path)
    }
}
