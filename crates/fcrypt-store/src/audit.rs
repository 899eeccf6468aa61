//! Append-only JSON-lines audit log.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};

use fcrypt_core::{AuditEntry, AuditPort, UserId};

/// One JSON object per line, appended under a lock.
pub struct JsonlAuditLog {
    path: PathBuf,
    append: Mutex<()>,
}

impl JsonlAuditLog {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            append: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Entries for `owner` with `from_ms <= timestamp <= to_ms`, oldest first.
    ///
    /// Lines that do not parse are skipped with a warning.
    pub fn history(&self, owner: UserId, from_ms: u64, to_ms: u64) -> Result<Vec<AuditEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = std::fs::File::open(&self.path)
            .with_context(|| format!("opening audit log: {}", self.path.display()))?;

        let mut entries = Vec::new();
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line.with_context(|| format!("reading audit log: {}", self.path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AuditEntry>(&line) {
                Ok(entry)
                    if entry.owner_id == owner
                        && entry.timestamp >= from_ms
                        && entry.timestamp <= to_ms =>
                {
                    entries.push(entry)
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(
                    path = %self.path.display(),
                    line = lineno + 1,
                    "skipping malformed audit line: {e}"
                ),
            }
        }
        Ok(entries)
    }
}

impl AuditPort for JsonlAuditLog {
    fn log(&self, entry: AuditEntry) -> Result<()> {
        let mut line = serde_json::to_string(&entry).context("serializing audit entry")?;
        line.push('\n');

        let _guard = self
            .append
            .lock()
            .map_err(|_| anyhow::anyhow!("audit lock poisoned"))?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating audit dir: {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening audit log: {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("appending audit log: {}", self.path.display()))?;
        Ok(())
    }
}
