use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::error::{FcryptError, FcryptResult};

/// AES-GCM nonce length in bytes
pub const IV_SIZE: usize = 12;

/// Per-file and per-verifier PBKDF2 salt length in bytes
pub const SALT_SIZE: usize = 32;

/// Suffix every ciphertext `stored_name` carries
pub const CIPHERTEXT_EXTENSION: &str = ".encrypted";

/// Identifier assigned by the metadata store
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(pub u64);

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Owner identity of a file record
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Ciphertext algorithms understood by the engine. There is exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    AesGcm256,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::AesGcm256 => "AES-GCM-256",
        }
    }

    /// Parse a stored algorithm label. Anything unrecognised is corruption.
    pub fn parse(label: &str) -> FcryptResult<Self> {
        match label {
            "AES-GCM-256" => Ok(Algorithm::AesGcm256),
            other => Err(FcryptError::Corrupted(format!(
                "unknown algorithm '{other}'"
            ))),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A file record before the metadata store has assigned an id and timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewFileRecord {
    pub owner_id: UserId,
    pub original_name: String,
    pub stored_name: String,
    pub path: PathBuf,
    pub original_size: u64,
    #[serde(with = "b64")]
    pub iv: [u8; IV_SIZE],
    #[serde(with = "b64")]
    pub salt: [u8; SALT_SIZE],
    pub algorithm: String,
    pub compressed: bool,
}

impl NewFileRecord {
    pub fn into_record(self, file_id: FileId, created_at: u64) -> FileRecord {
        FileRecord {
            file_id,
            owner_id: self.owner_id,
            original_name: self.original_name,
            stored_name: self.stored_name,
            path: self.path,
            original_size: self.original_size,
            iv: self.iv,
            salt: self.salt,
            algorithm: self.algorithm,
            compressed: self.compressed,
            created_at,
        }
    }
}

/// Durable metadata for one encrypted file.
///
/// `iv` and `salt` are the only fields that change after insertion (rekey).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub file_id: FileId,
    pub owner_id: UserId,
    /// Name of the plaintext file at encrypt time (single path component)
    pub original_name: String,
    /// On-disk ciphertext name: `{uuid}__{original_name}.encrypted`
    pub stored_name: String,
    /// Absolute path of the ciphertext inside the storage directory
    pub path: PathBuf,
    pub original_size: u64,
    #[serde(with = "b64")]
    pub iv: [u8; IV_SIZE],
    /// Salt the file key was derived with
    #[serde(with = "b64")]
    pub salt: [u8; SALT_SIZE],
    pub algorithm: String,
    pub compressed: bool,
    /// Unix epoch milliseconds, set by the metadata store
    pub created_at: u64,
}

impl FileRecord {
    pub fn algorithm(&self) -> FcryptResult<Algorithm> {
        Algorithm::parse(&self.algorithm)
    }
}

/// Password verifier for one user, owned by the external password store.
///
/// The tag is compared against a freshly derived candidate and is never used as a key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserKeyVerifier {
    pub owner_id: UserId,
    #[serde(with = "b64")]
    pub verifier_salt: [u8; SALT_SIZE],
    pub iteration_count: u32,
    #[serde(with = "b64")]
    pub verifier_tag: Vec<u8>,
}

impl fmt::Debug for UserKeyVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserKeyVerifier")
            .field("owner_id", &self.owner_id)
            .field("iteration_count", &self.iteration_count)
            .field("verifier_tag", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditOp {
    Encrypt,
    Decrypt,
    Rekey,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditStatus {
    Success,
    Failure,
    Cancelled,
}

/// One audit row. Timestamps are taken at emission time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub owner_id: UserId,
    pub file_id: Option<FileId>,
    pub op: AuditOp,
    pub status: AuditStatus,
    pub size: u64,
    pub duration_ms: u64,
    pub error_message: Option<String>,
    /// Unix epoch milliseconds
    pub timestamp: u64,
}

impl AuditEntry {
    pub fn new(owner_id: UserId, op: AuditOp, status: AuditStatus) -> Self {
        Self {
            owner_id,
            file_id: None,
            op,
            status,
            size: 0,
            duration_ms: 0,
            error_message: None,
            timestamp: now_epoch_ms(),
        }
    }

    pub fn file(mut self, file_id: Option<FileId>) -> Self {
        self.file_id = file_id;
        self
    }

    pub fn size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}

/// Outcome of a bulk rekey: never aborted by a single failure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RekeyReport {
    pub succeeded: Vec<FileId>,
    pub failed_with_reasons: Vec<(FileId, String)>,
}

impl RekeyReport {
    pub fn is_clean(&self) -> bool {
        self.failed_with_reasons.is_empty()
    }
}

/// Outcome of a bulk encrypt or decrypt, keyed by a human-readable item label
/// (input path for encrypt, file id for decrypt).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkReport {
    pub succeeded: Vec<String>,
    pub failed_with_reasons: Vec<(String, String)>,
}

impl BulkReport {
    pub fn is_clean(&self) -> bool {
        self.failed_with_reasons.is_empty()
    }
}

pub fn now_epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Base64 (standard alphabet) serde adapter for fixed and variable byte fields.
mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S, T>(bytes: &T, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: AsRef<[u8]>,
    {
        s.serialize_str(&STANDARD.encode(bytes.as_ref()))
    }

    pub fn deserialize<'de, D, T>(d: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: TryFrom<Vec<u8>>,
    {
        let encoded = String::deserialize(d)?;
        let bytes = STANDARD
            .decode(encoded.as_bytes())
            .map_err(de::Error::custom)?;
        let len = bytes.len();
        T::try_from(bytes).map_err(|_| de::Error::custom(format!("unexpected byte length {len}")))
    }
}
