use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{FcryptError, FcryptResult};

pub const MIN_STREAM_BUFFER_MB: usize = 1;
pub const MAX_STREAM_BUFFER_MB: usize = 64;
pub const MIN_DELETE_PASSES: u8 = 1;
pub const MAX_DELETE_PASSES: u8 = 5;
pub const MIN_PARALLEL_JOBS: usize = 1;
pub const MAX_PARALLEL_JOBS: usize = 8;

/// Top-level configuration (loaded from fcrypt.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FcryptConfig {
    pub storage: StorageConfig,
    pub engine: EngineConfig,
    pub state: StateConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding ciphertext files (created if missing)
    pub storage_dir: PathBuf,
    /// Default output directory for decrypt; unset means next to the ciphertext
    pub decrypt_dir: Option<PathBuf>,
}

/// Secure-eraser policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeleteMode {
    /// Unlink without overwriting
    Fast,
    /// Overwrite the logical extent `delete_passes` times, then unlink
    Overwrite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Chunk buffer size in MiB (1-64, default: 4)
    pub stream_buffer_mb: usize,
    pub delete_mode: DeleteMode,
    /// Overwrite passes when `delete_mode = "overwrite"` (1-5, default: 1)
    pub delete_passes: u8,
    /// Max concurrent per-file operations in bulk flows (1-8, default: 2)
    pub parallel_jobs: usize,
}

/// Locations of the file-backed collaborator stores
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub metadata_file: PathBuf,
    pub verifier_file: PathBuf,
    /// JSON-lines audit log
    pub audit_file: PathBuf,
    /// Directory mirror consulted when a ciphertext is missing locally
    pub backup_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("encrypted_files"),
            decrypt_dir: None,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stream_buffer_mb: 4,
            delete_mode: DeleteMode::Fast,
            delete_passes: 1,
            parallel_jobs: 2,
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            metadata_file: PathBuf::from("~/.local/share/fcrypt/metadata.json"),
            verifier_file: PathBuf::from("~/.local/share/fcrypt/verifiers.json"),
            audit_file: PathBuf::from("~/.local/share/fcrypt/audit.jsonl"),
            backup_dir: None,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl FcryptConfig {
    /// Load from a TOML file, falling back to defaults when the file is absent.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;

        if !path.exists() {
            tracing::warn!(
                "config file not found: {}  (using defaults)",
                path.display()
            );
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: FcryptConfig = toml::from_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> FcryptResult<()> {
        self.engine.validate()
    }
}

impl EngineConfig {
    pub fn validate(&self) -> FcryptResult<()> {
        if !(MIN_STREAM_BUFFER_MB..=MAX_STREAM_BUFFER_MB).contains(&self.stream_buffer_mb) {
            return Err(FcryptError::InvalidParameter(format!(
                "stream_buffer_mb must be {MIN_STREAM_BUFFER_MB}-{MAX_STREAM_BUFFER_MB} (got {})",
                self.stream_buffer_mb
            )));
        }
        if !(MIN_DELETE_PASSES..=MAX_DELETE_PASSES).contains(&self.delete_passes) {
            return Err(FcryptError::InvalidParameter(format!(
                "delete_passes must be {MIN_DELETE_PASSES}-{MAX_DELETE_PASSES} (got {})",
                self.delete_passes
            )));
        }
        if !(MIN_PARALLEL_JOBS..=MAX_PARALLEL_JOBS).contains(&self.parallel_jobs) {
            return Err(FcryptError::InvalidParameter(format!(
                "parallel_jobs must be {MIN_PARALLEL_JOBS}-{MAX_PARALLEL_JOBS} (got {})",
                self.parallel_jobs
            )));
        }
        Ok(())
    }
}

/// Expand a leading `~/` against `$HOME`.
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}
