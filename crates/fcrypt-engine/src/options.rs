use std::path::{Path, PathBuf};

use fcrypt_core::config::{
    expand_home, FcryptConfig, MAX_DELETE_PASSES, MAX_PARALLEL_JOBS, MAX_STREAM_BUFFER_MB,
    MIN_DELETE_PASSES, MIN_PARALLEL_JOBS,
};
use fcrypt_core::{DeleteMode, FcryptError, FcryptResult};

const MIB: usize = 1024 * 1024;

/// Everything an engine call needs besides its collaborators.
///
/// Built once from [`FcryptConfig`] (or by hand in tests) and handed to
/// [`FileEncryptor::new`](crate::FileEncryptor::new).
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Directory ciphertext files are written to
    pub storage_dir: PathBuf,
    /// Default decrypt output directory; `None` writes next to the ciphertext
    pub decrypt_dir: Option<PathBuf>,
    /// Chunk buffer size `B` in bytes
    pub buffer_size: usize,
    pub delete_mode: DeleteMode,
    pub delete_passes: u8,
    /// Worker bound for bulk flows
    pub parallel_jobs: usize,
}

/// Per-file choices for `encrypt`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EncryptOptions {
    /// GZIP the plaintext before encrypting it
    pub compress: bool,
}

impl EngineOptions {
    pub fn new(storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            decrypt_dir: None,
            buffer_size: 4 * MIB,
            delete_mode: DeleteMode::Fast,
            delete_passes: 1,
            parallel_jobs: 2,
        }
    }

    pub fn from_config(config: &FcryptConfig) -> FcryptResult<Self> {
        config.validate()?;
        Ok(Self {
            storage_dir: expand_home(&config.storage.storage_dir),
            decrypt_dir: config.storage.decrypt_dir.as_deref().map(expand_home),
            buffer_size: config.engine.stream_buffer_mb * MIB,
            delete_mode: config.engine.delete_mode,
            delete_passes: config.engine.delete_passes,
            parallel_jobs: config.engine.parallel_jobs,
        })
    }

    pub fn with_decrypt_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.decrypt_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn with_buffer_size(mut self, bytes: usize) -> Self {
        self.buffer_size = bytes;
        self
    }

    pub fn with_delete_mode(mut self, mode: DeleteMode, passes: u8) -> Self {
        self.delete_mode = mode;
        self.delete_passes = passes;
        self
    }

    pub fn with_parallel_jobs(mut self, jobs: usize) -> Self {
        self.parallel_jobs = jobs;
        self
    }

    pub fn validate(&self) -> FcryptResult<()> {
        if self.buffer_size == 0 || self.buffer_size > MAX_STREAM_BUFFER_MB * MIB {
            return Err(FcryptError::InvalidParameter(format!(
                "buffer size must be 1 byte to {MAX_STREAM_BUFFER_MB} MiB (got {})",
                self.buffer_size
            )));
        }
        if !(MIN_DELETE_PASSES..=MAX_DELETE_PASSES).contains(&self.delete_passes) {
            return Err(FcryptError::InvalidParameter(format!(
                "delete passes must be {MIN_DELETE_PASSES}-{MAX_DELETE_PASSES} (got {})",
                self.delete_passes
            )));
        }
        if !(MIN_PARALLEL_JOBS..=MAX_PARALLEL_JOBS).contains(&self.parallel_jobs) {
            return Err(FcryptError::InvalidParameter(format!(
                "parallel jobs must be {MIN_PARALLEL_JOBS}-{MAX_PARALLEL_JOBS} (got {})",
                self.parallel_jobs
            )));
        }
        Ok(())
    }
}
