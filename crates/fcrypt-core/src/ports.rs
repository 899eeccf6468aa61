//! Collaborator interfaces the engine consumes.
//!
//! Implementations live in `fcrypt-store` (file-backed and in-memory). All
//! methods take `&self`; implementations are shared across bulk worker
//! threads and synchronise internally.

use std::path::{Path, PathBuf};

use crate::types::{
    AuditEntry, FileId, FileRecord, NewFileRecord, UserId, UserKeyVerifier, IV_SIZE, SALT_SIZE,
};

/// Durable file-record store.
pub trait MetadataPort: Send + Sync {
    /// Persist a new record, assigning its `file_id` and `created_at`.
    fn insert(&self, record: NewFileRecord) -> anyhow::Result<FileRecord>;

    fn find_by_id(&self, file_id: FileId) -> anyhow::Result<Option<FileRecord>>;

    fn list_by_owner(&self, owner_id: UserId) -> anyhow::Result<Vec<FileRecord>>;

    fn exists_by_stored_name(&self, stored_name: &str) -> anyhow::Result<bool>;

    /// Replace the crypto parameters of an existing record after a rekey.
    fn update_crypto(
        &self,
        file_id: FileId,
        iv: [u8; IV_SIZE],
        salt: [u8; SALT_SIZE],
        algorithm: &str,
    ) -> anyhow::Result<()>;

    fn delete(&self, file_id: FileId) -> anyhow::Result<()>;
}

pub trait PasswordVerifierPort: Send + Sync {
    fn get_verifier(&self, owner_id: UserId) -> anyhow::Result<Option<UserKeyVerifier>>;

    fn put_verifier(&self, verifier: UserKeyVerifier) -> anyhow::Result<()>;
}

/// Best-effort audit sink. Failures are logged by the engine and never
/// change an operation's outcome.
pub trait AuditPort: Send + Sync {
    fn log(&self, entry: AuditEntry) -> anyhow::Result<()>;
}

/// Result of asking a backup source for a ciphertext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupFetch {
    /// The ciphertext was restored to this path
    Found(PathBuf),
    NotFound,
}

/// Optional source of ciphertexts missing from the storage directory.
pub trait BackupPort: Send + Sync {
    /// Restore `stored_name` into `dest_dir` if the backup holds a copy.
    fn fetch_by_stored_name(&self, stored_name: &str, dest_dir: &Path)
        -> anyhow::Result<BackupFetch>;
}
