//! JSON-file stores for file records and password verifiers.
//!
//! Each store loads its file entirely into memory and rewrites it on every
//! mutation with an atomic write (temp file, then rename). A failed write
//! leaves both the file and the in-memory view unchanged.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use fcrypt_core::{
    now_epoch_ms, FileId, FileRecord, MetadataPort, NewFileRecord, PasswordVerifierPort, UserId,
    UserKeyVerifier, IV_SIZE, SALT_SIZE,
};

/// Read `path` as JSON, or `T::default()` when it does not exist yet.
pub(crate) fn load_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
}

/// Atomic write: write to a temp file next to `path`, then rename over it.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating state dir: {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(value).context("serializing store")?;
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, &json)
        .with_context(|| format!("writing store temp: {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("renaming store: {}", path.display()))?;
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| anyhow::anyhow!("store lock poisoned"))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct MetadataFile {
    next_id: u64,
    records: BTreeMap<u64, FileRecord>,
}

/// File records persisted as one JSON document.
pub struct JsonMetadataStore {
    path: PathBuf,
    state: Mutex<MetadataFile>,
}

impl JsonMetadataStore {
    pub fn open(path: &Path) -> Result<Self> {
        let state: MetadataFile = load_json(path)?;
        tracing::debug!(path = %path.display(), records = state.records.len(), "metadata store opened");
        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply `change` to a copy of the state and persist it; commit only on success.
    fn mutate<R>(&self, change: impl FnOnce(&mut MetadataFile) -> Result<R>) -> Result<R> {
        let mut state = lock(&self.state)?;
        let mut next = state.clone();
        let out = change(&mut next)?;
        write_json_atomic(&self.path, &next)?;
        *state = next;
        Ok(out)
    }
}

impl MetadataPort for JsonMetadataStore {
    fn insert(&self, record: NewFileRecord) -> Result<FileRecord> {
        self.mutate(|state| {
            state.next_id += 1;
            let file_id = FileId(state.next_id);
            let stored = record.into_record(file_id, now_epoch_ms());
            state.records.insert(file_id.0, stored.clone());
            Ok(stored)
        })
    }

    fn find_by_id(&self, file_id: FileId) -> Result<Option<FileRecord>> {
        Ok(lock(&self.state)?.records.get(&file_id.0).cloned())
    }

    fn list_by_owner(&self, owner_id: UserId) -> Result<Vec<FileRecord>> {
        Ok(lock(&self.state)?
            .records
            .values()
            .filter(|r| r.owner_id == owner_id)
            .cloned()
            .collect())
    }

    fn exists_by_stored_name(&self, stored_name: &str) -> Result<bool> {
        Ok(lock(&self.state)?
            .records
            .values()
            .any(|r| r.stored_name == stored_name))
    }

    fn update_crypto(
        &self,
        file_id: FileId,
        iv: [u8; IV_SIZE],
        salt: [u8; SALT_SIZE],
        algorithm: &str,
    ) -> Result<()> {
        self.mutate(|state| {
            let record = state
                .records
                .get_mut(&file_id.0)
                .with_context(|| format!("no file record {file_id}"))?;
            record.iv = iv;
            record.salt = salt;
            record.algorithm = algorithm.to_owned();
            Ok(())
        })
    }

    fn delete(&self, file_id: FileId) -> Result<()> {
        self.mutate(|state| {
            state
                .records
                .remove(&file_id.0)
                .map(|_| ())
                .with_context(|| format!("no file record {file_id}"))
        })
    }
}

/// Password verifiers persisted as one JSON document keyed by owner.
pub struct JsonVerifierStore {
    path: PathBuf,
    verifiers: Mutex<BTreeMap<u64, UserKeyVerifier>>,
}

impl JsonVerifierStore {
    pub fn open(path: &Path) -> Result<Self> {
        let verifiers = load_json(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            verifiers: Mutex::new(verifiers),
        })
    }
}

impl PasswordVerifierPort for JsonVerifierStore {
    fn get_verifier(&self, owner_id: UserId) -> Result<Option<UserKeyVerifier>> {
        Ok(lock(&self.verifiers)?.get(&owner_id.0).cloned())
    }

    fn put_verifier(&self, verifier: UserKeyVerifier) -> Result<()> {
        let mut verifiers = lock(&self.verifiers)?;
        let mut next = verifiers.clone();
        next.insert(verifier.owner_id.0, verifier);
        write_json_atomic(&self.path, &next)?;
        *verifiers = next;
        Ok(())
    }
}
