//! fcrypt-crypto: password-based file encryption primitives
//!
//! ```text
//! password ──PBKDF2-HMAC-SHA256 (per-file 32-byte salt, 100k rounds)──▶ FileKey (256-bit)
//! plaintext ──AES-256-GCM (random 96-bit IV, single frame)──▶ C || T
//! ```
//!
//! The IV and salt live in the file record, never in the ciphertext file.
//! Password verifiers are the same PBKDF2 construction with their own salt.

pub mod gcm;
pub mod kdf;
pub mod stream;
pub mod verifier;

pub use gcm::{DecryptingWriter, EncryptingWriter, MAX_FRAME_LEN};
pub use kdf::{derive_key, generate_iv, generate_salt, FileKey, DEFAULT_ITERATIONS, MIN_ITERATIONS};
pub use stream::{decrypt_stream, encrypt_stream, payload_error, pump, ChunkBuffer};
pub use verifier::{create_verifier, verify_password};

/// Size of an AES-256 key in bytes
pub const KEY_SIZE: usize = 32;

/// Size of a GCM authentication tag
pub const TAG_SIZE: usize = 16;
