//! Key derivation: PBKDF2-HMAC-SHA256 password → 256-bit file key

use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use zeroize::Zeroize;

use fcrypt_core::{FcryptError, FcryptResult, IV_SIZE, SALT_SIZE};

use crate::KEY_SIZE;

/// Iteration count every new file key and verifier is derived with.
pub const DEFAULT_ITERATIONS: u32 = 100_000;

/// Lowest iteration count `derive_key` accepts.
pub const MIN_ITERATIONS: u32 = 10_000;

/// A 256-bit AES key derived from a password. Zeroized on drop.
pub struct FileKey {
    bytes: [u8; KEY_SIZE],
}

impl FileKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for FileKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for FileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Derive a 256-bit key from `password` and a 32-byte `salt`.
///
/// Rejects empty passwords, salts of the wrong length and iteration counts
/// below [`MIN_ITERATIONS`] with `InvalidParameter`.
pub fn derive_key(password: &SecretString, salt: &[u8], iterations: u32) -> FcryptResult<FileKey> {
    if password.expose_secret().is_empty() {
        return Err(FcryptError::InvalidParameter("password is empty".into()));
    }
    if salt.len() != SALT_SIZE {
        return Err(FcryptError::InvalidParameter(format!(
            "salt must be {SALT_SIZE} bytes (got {})",
            salt.len()
        )));
    }
    if iterations < MIN_ITERATIONS {
        return Err(FcryptError::InvalidParameter(format!(
            "iterations must be at least {MIN_ITERATIONS} (got {iterations})"
        )));
    }

    // derive straight into the zeroizing wrapper
    let mut key = FileKey::from_bytes([0u8; KEY_SIZE]);
    pbkdf2::pbkdf2_hmac::<Sha256>(
        password.expose_secret().as_bytes(),
        salt,
        iterations,
        &mut key.bytes,
    );
    Ok(key)
}

/// Generate a random 32-byte PBKDF2 salt.
pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Generate a random 12-byte GCM nonce.
pub fn generate_iv() -> [u8; IV_SIZE] {
    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);
    iv
}
