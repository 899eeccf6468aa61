//! Mirror-directory backup of ciphertexts.
//!
//! The mirror is a flat directory holding copies of `*.encrypted` files by
//! stored name. Restores copy into the destination through a temp name so a
//! half-copied file never appears under the real name.

use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};

use fcrypt_core::{BackupFetch, BackupPort, CIPHERTEXT_EXTENSION};

pub struct DirectoryBackup {
    mirror_dir: PathBuf,
}

impl DirectoryBackup {
    pub fn new(mirror_dir: &Path) -> Self {
        Self {
            mirror_dir: mirror_dir.to_path_buf(),
        }
    }

    pub fn mirror_dir(&self) -> &Path {
        &self.mirror_dir
    }

    /// Copy every ciphertext in `storage_dir` the mirror lacks (or holds at a
    /// different size). Returns how many files were copied.
    pub fn mirror(&self, storage_dir: &Path) -> Result<usize> {
        fs::create_dir_all(&self.mirror_dir)
            .with_context(|| format!("creating backup dir: {}", self.mirror_dir.display()))?;

        let mut copied = 0;
        let entries = fs::read_dir(storage_dir)
            .with_context(|| format!("listing storage dir: {}", storage_dir.display()))?;
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.ends_with(CIPHERTEXT_EXTENSION) || !entry.file_type()?.is_file() {
                continue;
            }

            let target = self.mirror_dir.join(name);
            let len = entry.metadata()?.len();
            if fs::metadata(&target).map(|m| m.len() == len).unwrap_or(false) {
                continue;
            }
            copy_via_temp(&entry.path(), &target)?;
            tracing::debug!(file = name, bytes = len, "ciphertext mirrored");
            copied += 1;
        }
        tracing::info!(
            storage = %storage_dir.display(),
            backup = %self.mirror_dir.display(),
            copied,
            "backup mirror complete"
        );
        Ok(copied)
    }
}

/// A stored name must be one plain path component.
fn is_plain_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

fn copy_via_temp(from: &Path, to: &Path) -> Result<()> {
    let tmp = to.with_extension("partial");
    fs::copy(from, &tmp)
        .with_context(|| format!("copying {} to {}", from.display(), tmp.display()))?;
    fs::rename(&tmp, to).with_context(|| format!("renaming {}", to.display()))?;
    Ok(())
}

impl BackupPort for DirectoryBackup {
    fn fetch_by_stored_name(&self, stored_name: &str, dest_dir: &Path) -> Result<BackupFetch> {
        if !is_plain_name(stored_name) {
            anyhow::bail!("refusing backup lookup for '{stored_name}'");
        }
        let source = self.mirror_dir.join(stored_name);
        if !source.is_file() {
            return Ok(BackupFetch::NotFound);
        }

        fs::create_dir_all(dest_dir)
            .with_context(|| format!("creating restore dir: {}", dest_dir.display()))?;
        let dest = dest_dir.join(stored_name);
        copy_via_temp(&source, &dest)?;
        tracing::info!(file = stored_name, dest = %dest.display(), "ciphertext restored from backup");
        Ok(BackupFetch::Found(dest))
    }
}
