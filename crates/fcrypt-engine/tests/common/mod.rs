//! Shared harness: an encryptor over in-memory stores in a temp directory.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use secrecy::SecretString;
use tempfile::TempDir;

use fcrypt_core::{ProgressPort, UserId};
use fcrypt_engine::{EngineOptions, FileEncryptor, Ports};
use fcrypt_store::{MemoryAuditLog, MemoryMetadataStore, MemoryVerifierStore};

pub const OWNER: UserId = UserId(1);
pub const OTHER: UserId = UserId(2);

pub fn pw(s: &str) -> SecretString {
    SecretString::from(s)
}

pub struct Harness {
    pub dir: TempDir,
    pub metadata: Arc<MemoryMetadataStore>,
    pub verifiers: Arc<MemoryVerifierStore>,
    pub audit: Arc<MemoryAuditLog>,
    pub encryptor: FileEncryptor,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(|o| o, Arc::new(MemoryAuditLog::new()), None)
    }

    pub fn with_options(tune: impl FnOnce(EngineOptions) -> EngineOptions) -> Self {
        Self::build(tune, Arc::new(MemoryAuditLog::new()), None)
    }

    pub fn build(
        tune: impl FnOnce(EngineOptions) -> EngineOptions,
        audit: Arc<MemoryAuditLog>,
        backup: Option<Arc<dyn fcrypt_core::BackupPort>>,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let metadata = Arc::new(MemoryMetadataStore::new());
        let verifiers = Arc::new(MemoryVerifierStore::new());
        let ports = Ports {
            metadata: metadata.clone(),
            verifiers: verifiers.clone(),
            audit: audit.clone(),
            backup,
        };
        let options = tune(EngineOptions::new(dir.path().join("store")));
        let encryptor = FileEncryptor::new(ports, options).unwrap();
        Self {
            dir,
            metadata,
            verifiers,
            audit,
            encryptor,
        }
    }

    /// Register `password` as the owner's verifier.
    pub fn set_password(&self, owner: UserId, password: &str) {
        use fcrypt_core::PasswordVerifierPort;
        let verifier = fcrypt_crypto::create_verifier(owner, &pw(password)).unwrap();
        self.verifiers.put_verifier(verifier).unwrap();
    }

    /// Write a plaintext file under `plain/`.
    pub fn plaintext(&self, name: &str, bytes: &[u8]) -> PathBuf {
        let dir = self.dir.path().join("plain");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    pub fn out_dir(&self) -> PathBuf {
        self.dir.path().join("out")
    }

    pub fn storage_dir(&self) -> PathBuf {
        self.dir.path().join("store")
    }
}

/// Names of everything directly inside `dir` (empty if it does not exist).
pub fn list_dir(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect(),
        Err(_) => Vec::new(),
    };
    names.sort();
    names
}

/// Deterministic incompressible-looking bytes.
pub fn noise(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 24) as u8
        })
        .collect()
}

/// Progress sink remembering every report.
#[derive(Default)]
pub struct ProgressLog(pub Mutex<Vec<(f64, u64, u64)>>);

impl ProgressLog {
    pub fn fractions(&self) -> Vec<f64> {
        self.0.lock().unwrap().iter().map(|(f, _, _)| *f).collect()
    }
}

impl ProgressPort for ProgressLog {
    fn on_progress(&self, fraction: f64, done: u64, total: u64) {
        self.0.lock().unwrap().push((fraction, done, total));
    }
}
