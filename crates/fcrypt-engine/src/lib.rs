//! fcrypt-engine: password-based file encryption pipelines
//!
//! ```text
//! encrypt: plaintext ─▶ [gzip] ─▶ AES-256-GCM ─▶ storage_dir/{uuid}__{name}.encrypted
//!          then: insert record → secure-erase plaintext → audit
//! decrypt: ciphertext ─▶ AES-256-GCM ─▶ [gunzip] ─▶ output_dir/{name}
//!          then: secure-erase ciphertext → audit → delete record
//! rekey:   ciphertext ─▶ GCM open (old) ─▶ GCM seal (new) ─▶ temp ─rename─▶ ciphertext
//! ```
//!
//! All collaborators come in through [`Ports`]; all tunables through
//! [`EngineOptions`]. The engine keeps no global state.

pub mod compress;
pub mod encryptor;
pub mod erase;
pub mod options;
pub mod pipeline;
pub mod rekey;
pub mod vault;

pub use compress::{compress_stream, decompress_stream};
pub use encryptor::{FileEncryptor, Ports};
pub use erase::erase;
pub use options::{EncryptOptions, EngineOptions};
pub use pipeline::{sanitize_file_name, Hooks};
pub use rekey::{rekey_temp_path, REKEY_TEMP_SUFFIX};
pub use vault::Vault;
