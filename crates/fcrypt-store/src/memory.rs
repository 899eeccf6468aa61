//! In-memory collaborators for tests and embedding.
//!
//! Each store can be told to fail specific calls so callers can exercise
//! their error paths.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use anyhow::{bail, Result};

use fcrypt_core::{
    now_epoch_ms, AuditEntry, AuditPort, BackupFetch, BackupPort, FileId, FileRecord,
    MetadataPort, NewFileRecord, PasswordVerifierPort, UserId, UserKeyVerifier, IV_SIZE,
    SALT_SIZE,
};

fn poisoned() -> anyhow::Error {
    anyhow::anyhow!("memory store lock poisoned")
}

#[derive(Default)]
struct Records {
    next_id: u64,
    by_id: BTreeMap<u64, FileRecord>,
}

#[derive(Default)]
pub struct MemoryMetadataStore {
    records: Mutex<Records>,
    fail_insert: AtomicBool,
    fail_update: AtomicBool,
    fail_delete: AtomicBool,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_inserts(&self, fail: bool) {
        self.fail_insert.store(fail, Ordering::SeqCst);
    }

    pub fn fail_updates(&self, fail: bool) {
        self.fail_update.store(fail, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_delete.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.by_id.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overwrite a stored record as-is, bypassing validation.
    pub fn put_raw(&self, record: FileRecord) -> Result<()> {
        let mut records = self.records.lock().map_err(|_| poisoned())?;
        records.next_id = records.next_id.max(record.file_id.0);
        records.by_id.insert(record.file_id.0, record);
        Ok(())
    }
}

impl MetadataPort for MemoryMetadataStore {
    fn insert(&self, record: NewFileRecord) -> Result<FileRecord> {
        if self.fail_insert.load(Ordering::SeqCst) {
            bail!("injected insert failure");
        }
        let mut records = self.records.lock().map_err(|_| poisoned())?;
        records.next_id += 1;
        let file_id = FileId(records.next_id);
        let stored = record.into_record(file_id, now_epoch_ms());
        records.by_id.insert(file_id.0, stored.clone());
        Ok(stored)
    }

    fn find_by_id(&self, file_id: FileId) -> Result<Option<FileRecord>> {
        let records = self.records.lock().map_err(|_| poisoned())?;
        Ok(records.by_id.get(&file_id.0).cloned())
    }

    fn list_by_owner(&self, owner_id: UserId) -> Result<Vec<FileRecord>> {
        let records = self.records.lock().map_err(|_| poisoned())?;
        Ok(records
            .by_id
            .values()
            .filter(|r| r.owner_id == owner_id)
            .cloned()
            .collect())
    }

    fn exists_by_stored_name(&self, stored_name: &str) -> Result<bool> {
        let records = self.records.lock().map_err(|_| poisoned())?;
        Ok(records.by_id.values().any(|r| r.stored_name == stored_name))
    }

    fn update_crypto(
        &self,
        file_id: FileId,
        iv: [u8; IV_SIZE],
        salt: [u8; SALT_SIZE],
        algorithm: &str,
    ) -> Result<()> {
        if self.fail_update.load(Ordering::SeqCst) {
            bail!("injected update failure");
        }
        let mut records = self.records.lock().map_err(|_| poisoned())?;
        let Some(record) = records.by_id.get_mut(&file_id.0) else {
            bail!("no file record {file_id}");
        };
        record.iv = iv;
        record.salt = salt;
        record.algorithm = algorithm.to_owned();
        Ok(())
    }

    fn delete(&self, file_id: FileId) -> Result<()> {
        if self.fail_delete.load(Ordering::SeqCst) {
            bail!("injected delete failure");
        }
        let mut records = self.records.lock().map_err(|_| poisoned())?;
        match records.by_id.remove(&file_id.0) {
            Some(_) => Ok(()),
            None => bail!("no file record {file_id}"),
        }
    }
}

#[derive(Default)]
pub struct MemoryVerifierStore {
    verifiers: Mutex<HashMap<UserId, UserKeyVerifier>>,
}

impl MemoryVerifierStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PasswordVerifierPort for MemoryVerifierStore {
    fn get_verifier(&self, owner_id: UserId) -> Result<Option<UserKeyVerifier>> {
        let verifiers = self.verifiers.lock().map_err(|_| poisoned())?;
        Ok(verifiers.get(&owner_id).cloned())
    }

    fn put_verifier(&self, verifier: UserKeyVerifier) -> Result<()> {
        let mut verifiers = self.verifiers.lock().map_err(|_| poisoned())?;
        verifiers.insert(verifier.owner_id, verifier);
        Ok(())
    }
}

/// Records every entry it is given; can be switched to reject them.
#[derive(Default)]
pub struct MemoryAuditLog {
    entries: Mutex<Vec<AuditEntry>>,
    failing: AtomicBool,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A log whose every `log` call fails.
    pub fn failing() -> Self {
        let log = Self::default();
        log.failing.store(true, Ordering::SeqCst);
        log
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl AuditPort for MemoryAuditLog {
    fn log(&self, entry: AuditEntry) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("audit sink unavailable");
        }
        self.entries.lock().map_err(|_| poisoned())?.push(entry);
        Ok(())
    }
}

/// Backup holding ciphertext bytes by stored name.
#[derive(Default)]
pub struct MemoryBackup {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBackup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, stored_name: &str, bytes: Vec<u8>) {
        if let Ok(mut blobs) = self.blobs.lock() {
            blobs.insert(stored_name.to_owned(), bytes);
        }
    }
}

impl BackupPort for MemoryBackup {
    fn fetch_by_stored_name(&self, stored_name: &str, dest_dir: &Path) -> Result<BackupFetch> {
        let blobs = self.blobs.lock().map_err(|_| poisoned())?;
        let Some(bytes) = blobs.get(stored_name) else {
            return Ok(BackupFetch::NotFound);
        };
        std::fs::create_dir_all(dest_dir)?;
        let dest = dest_dir.join(stored_name);
        std::fs::write(&dest, bytes)?;
        Ok(BackupFetch::Found(dest))
    }
}
