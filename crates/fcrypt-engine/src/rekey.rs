//! Rekey: decrypt-then-encrypt through a temp file, atomically swapped in.
//!
//! ```text
//! path ──GCM open (old key, old iv)──▶ GCM seal (new key, new iv) ──▶ path.tmp.reenc
//! keep original as path.tmp.orig → rename temp over path → update record → drop original
//! ```
//!
//! Any failure before the record update leaves the original ciphertext and
//! record untouched and removes the temp file.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use secrecy::SecretString;
use tracing::{debug, info, warn};

use fcrypt_core::{
    Algorithm, AuditEntry, AuditOp, AuditStatus, FcryptError, FcryptResult, FileId, FileRecord,
    RekeyReport, UserId,
};
use fcrypt_crypto::{
    derive_key, generate_iv, generate_salt, pump, ChunkBuffer, DecryptingWriter, EncryptingWriter,
    DEFAULT_ITERATIONS,
};

use crate::encryptor::{elapsed_ms, FileEncryptor};
use crate::pipeline::{create_exclusive, remove_partial, BatchProgress, ChunkObserver, Hooks};
use crate::vault::run_bounded;

/// Suffix of the re-encryption temp file next to the ciphertext.
pub const REKEY_TEMP_SUFFIX: &str = ".tmp.reenc";

const ORIGINAL_KEEP_SUFFIX: &str = ".tmp.orig";

/// Where the re-encrypted frame is written before it replaces the original.
pub(crate) trait TempSink: Write {
    fn sync(&mut self) -> io::Result<()>;
}

impl TempSink for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_all()
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Path of the temp file a rekey of `ciphertext` writes to.
pub fn rekey_temp_path(ciphertext: &Path) -> PathBuf {
    sibling(ciphertext, REKEY_TEMP_SUFFIX)
}

impl FileEncryptor {
    /// Re-encrypt one file under `new_password` with a fresh salt and IV.
    ///
    /// Returns the updated record. Errors other than `Cancelled` come back
    /// wrapped in `RekeyFailed`.
    pub fn rekey(
        &self,
        record: &FileRecord,
        old_password: &SecretString,
        new_password: &SecretString,
        hooks: &Hooks,
    ) -> FcryptResult<FileRecord> {
        self.rekey_through(record, old_password, new_password, hooks, create_exclusive)
    }

    /// `rekey` with the temp file opened by `open_temp`.
    pub(crate) fn rekey_through<S, F>(
        &self,
        record: &FileRecord,
        old_password: &SecretString,
        new_password: &SecretString,
        hooks: &Hooks,
        open_temp: F,
    ) -> FcryptResult<FileRecord>
    where
        S: TempSink,
        F: FnOnce(&Path) -> io::Result<S>,
    {
        let started = Instant::now();
        let result = self
            .rekey_inner(record, old_password, new_password, hooks, open_temp)
            .map_err(FcryptError::rekey);
        match &result {
            Ok(_) => self.audit(
                AuditEntry::new(record.owner_id, AuditOp::Rekey, AuditStatus::Success)
                    .file(Some(record.file_id))
                    .size(record.original_size)
                    .duration_ms(elapsed_ms(started)),
            ),
            Err(err) => {
                self.audit_failure(record.owner_id, Some(record), AuditOp::Rekey, err, started)
            }
        }
        result
    }

    fn rekey_inner<S, F>(
        &self,
        record: &FileRecord,
        old_password: &SecretString,
        new_password: &SecretString,
        hooks: &Hooks,
        open_temp: F,
    ) -> FcryptResult<FileRecord>
    where
        S: TempSink,
        F: FnOnce(&Path) -> io::Result<S>,
    {
        record.algorithm()?;
        self.check_stored_location(record)?;
        let path = &record.path;
        if !path.is_file() {
            return Err(FcryptError::CiphertextMissing(path.clone()));
        }

        let temp = rekey_temp_path(path);
        if temp.exists() {
            warn!(path = %temp.display(), file_id = %record.file_id, "removing stale rekey temp file");
            fs::remove_file(&temp)?;
        }
        hooks.check_cancelled()?;

        let old_key = derive_key(old_password, &record.salt, DEFAULT_ITERATIONS)?;
        let new_salt = generate_salt();
        let new_iv = generate_iv();
        let new_key = derive_key(new_password, &new_salt, DEFAULT_ITERATIONS)?;

        let mut buf = ChunkBuffer::new(self.options().buffer_size)?;
        let reencrypted = (|| -> FcryptResult<()> {
            let mut src = File::open(path)?;
            let total = src.metadata()?.len();
            let out = open_temp(&temp)?;
            let mut observer = ChunkObserver::start(hooks, total)?;

            let mut opener = DecryptingWriter::new(
                &old_key,
                &record.iv,
                EncryptingWriter::new(&new_key, &new_iv, out),
            );
            let done = pump(&mut src, &mut opener, &mut buf, |done| observer.on_chunk(done))?;
            let (sealer, _) = opener.finish()?;
            let (mut out, _) = sealer.finish()?;
            out.sync()?;
            observer.finish(done);
            Ok(())
        })();
        if let Err(err) = reencrypted {
            remove_partial(&temp);
            return Err(err);
        }
        debug!(file_id = %record.file_id, path = %temp.display(), "re-encrypted into temp file");

        // keys stay live until the new parameters are persisted
        self.commit_rekey(record, &temp, new_iv, new_salt)?;
        drop(old_key);
        drop(new_key);

        info!(file_id = %record.file_id, owner = %record.owner_id, "rekeyed");
        Ok(FileRecord {
            iv: new_iv,
            salt: new_salt,
            algorithm: Algorithm::AesGcm256.as_str().to_owned(),
            ..record.clone()
        })
    }

    /// Swap the temp file in and persist the new parameters, undoing the swap
    /// if the record update fails.
    fn commit_rekey(
        &self,
        record: &FileRecord,
        temp: &Path,
        new_iv: [u8; fcrypt_core::IV_SIZE],
        new_salt: [u8; fcrypt_core::SALT_SIZE],
    ) -> FcryptResult<()> {
        let path = &record.path;
        let keep = sibling(path, ORIGINAL_KEEP_SUFFIX);
        remove_partial(&keep);
        if let Err(err) = keep_original(path, &keep) {
            remove_partial(temp);
            return Err(err.into());
        }

        swap_in(temp, path, &keep, |from, to| fs::rename(from, to))?;

        if let Err(err) = self.ports().metadata.update_crypto(
            record.file_id,
            new_iv,
            new_salt,
            Algorithm::AesGcm256.as_str(),
        ) {
            match restore_original(&keep, path, |from, to| fs::rename(from, to)) {
                Ok(()) => debug!(file_id = %record.file_id, "original ciphertext restored"),
                Err(restore) => warn!(
                    file_id = %record.file_id,
                    path = %keep.display(),
                    "could not restore original ciphertext: {restore}"
                ),
            }
            return Err(FcryptError::metadata(err));
        }
        remove_partial(&keep);
        Ok(())
    }

    /// Rekey every file of `owner`, continuing past per-file failures.
    ///
    /// Files run on up to `parallel_jobs` workers. Only a failure to list the
    /// owner's records fails the call as a whole.
    /// Progress is reported per finished file.
    pub fn bulk_rekey(
        &self,
        owner: UserId,
        old_password: &SecretString,
        new_password: &SecretString,
        hooks: &Hooks,
    ) -> FcryptResult<RekeyReport> {
        let records = self
            .ports()
            .metadata
            .list_by_owner(owner)
            .map_err(FcryptError::metadata)?;
        info!(owner = %owner, files = records.len(), "bulk rekey starting");

        let batch = BatchProgress::start(hooks, records.len());
        let outcomes = run_bounded(self.options().parallel_jobs, &records, &hooks.cancel, |record| {
            let outcome = self.rekey(record, old_password, new_password, batch.item_hooks());
            batch.item_done();
            outcome
        })?;

        let mut report = RekeyReport::default();
        for (record, outcome) in records.iter().zip(outcomes) {
            match outcome {
                Ok(_) => report.succeeded.push(record.file_id),
                Err(err) => {
                    warn!(file_id = %record.file_id, "rekey failed: {err}");
                    report.failed_with_reasons.push((record.file_id, err.to_string()));
                }
            }
        }
        sort_report(&mut report);
        info!(
            owner = %owner,
            succeeded = report.succeeded.len(),
            failed = report.failed_with_reasons.len(),
            "bulk rekey finished"
        );
        Ok(report)
    }
}

fn sort_report(report: &mut RekeyReport) {
    report.succeeded.sort_unstable();
    report
        .failed_with_reasons
        .sort_unstable_by_key(|(id, _): &(FileId, String)| *id);
}

/// Keep a second name for the original so it survives the swap.
fn keep_original(path: &Path, keep: &Path) -> io::Result<()> {
    match fs::hard_link(path, keep) {
        Ok(()) => Ok(()),
        Err(e) => {
            debug!(path = %path.display(), "hard link unavailable ({e}), copying");
            fs::copy(path, keep).map(|_| ())
        }
    }
}

/// Rename `from` over `to`, falling back to remove-then-rename.
fn replace_file<R>(from: &Path, to: &Path, rename: R) -> io::Result<()>
where
    R: Fn(&Path, &Path) -> io::Result<()>,
{
    match rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) => {
            warn!(path = %to.display(), "atomic replace failed ({e}), replacing non-atomically");
            match fs::remove_file(to) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
            rename(from, to)
        }
    }
}

/// Put the copy kept at `keep` back at `path`, by rename or else by copy.
///
/// `keep` is removed only once `path` holds the original again.
fn restore_original<R>(keep: &Path, path: &Path, rename: R) -> io::Result<()>
where
    R: Fn(&Path, &Path) -> io::Result<()>,
{
    if let Err(e) = replace_file(keep, path, &rename) {
        debug!(path = %path.display(), "restore by rename failed ({e}), copying");
        fs::copy(keep, path)?;
    }
    remove_partial(keep);
    Ok(())
}

/// Move `temp` over `path`. On failure the temp file is gone and `path`
/// holds the original again; the kept copy survives only if that restore
/// failed too.
fn swap_in<R>(temp: &Path, path: &Path, keep: &Path, rename: R) -> io::Result<()>
where
    R: Fn(&Path, &Path) -> io::Result<()>,
{
    let err = match replace_file(temp, path, &rename) {
        Ok(()) => return Ok(()),
        Err(err) => err,
    };
    remove_partial(temp);
    if path.is_file() {
        remove_partial(keep);
    } else if let Err(restore) = restore_original(keep, path, &rename) {
        warn!(
            path = %keep.display(),
            "could not restore original ciphertext: {restore}"
        );
    }
    Err(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use fcrypt_core::MetadataPort;
    use fcrypt_store::{MemoryAuditLog, MemoryMetadataStore, MemoryVerifierStore};

    use crate::encryptor::Ports;
    use crate::options::{EncryptOptions, EngineOptions};

    fn refuse_rename(_from: &Path, _to: &Path) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Other, "rename refused"))
    }

    #[test]
    fn test_temp_path_is_sibling() {
        let temp = rekey_temp_path(Path::new("/store/abc__a.txt.encrypted"));
        assert_eq!(temp, PathBuf::from("/store/abc__a.txt.encrypted.tmp.reenc"));
    }

    #[test]
    fn test_replace_file_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("new");
        let to = dir.path().join("old");
        fs::write(&from, b"new").unwrap();
        fs::write(&to, b"old").unwrap();
        replace_file(&from, &to, |a, b| fs::rename(a, b)).unwrap();
        assert_eq!(fs::read(&to).unwrap(), b"new");
        assert!(!from.exists());
    }

    #[test]
    fn test_keep_original_survives_replace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cipher");
        let keep = dir.path().join("cipher.keep");
        let temp = dir.path().join("cipher.tmp");
        fs::write(&path, b"original").unwrap();
        fs::write(&temp, b"replacement").unwrap();

        keep_original(&path, &keep).unwrap();
        swap_in(&temp, &path, &keep, |a, b| fs::rename(a, b)).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"replacement");
        assert_eq!(fs::read(&keep).unwrap(), b"original");

        restore_original(&keep, &path, |a, b| fs::rename(a, b)).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"original");
        assert!(!keep.exists());
    }

    #[test]
    fn test_failed_swap_puts_original_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cipher");
        let keep = dir.path().join("cipher.keep");
        let temp = dir.path().join("cipher.tmp");
        fs::write(&path, b"original").unwrap();
        fs::write(&temp, b"replacement").unwrap();
        keep_original(&path, &keep).unwrap();

        // both renames fail after the fallback has already unlinked `path`
        assert!(swap_in(&temp, &path, &keep, refuse_rename).is_err());

        assert_eq!(fs::read(&path).unwrap(), b"original");
        assert!(!temp.exists());
        assert!(!keep.exists());
    }

    #[test]
    fn test_restore_falls_back_to_copy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cipher");
        let keep = dir.path().join("cipher.keep");
        fs::write(&path, b"rekeyed").unwrap();
        fs::write(&keep, b"original").unwrap();

        restore_original(&keep, &path, refuse_rename).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"original");
        assert!(!keep.exists());
    }

    /// Temp target that runs out of room after `room` bytes.
    struct ShortDisk {
        file: File,
        room: usize,
        written: Arc<AtomicUsize>,
    }

    impl Write for ShortDisk {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let used = self.written.load(Ordering::SeqCst);
            if used >= self.room {
                return Err(io::Error::new(io::ErrorKind::Other, "no space left on device"));
            }
            let n = self.file.write(&buf[..buf.len().min(self.room - used)])?;
            self.written.fetch_add(n, Ordering::SeqCst);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            self.file.flush()
        }
    }

    impl TempSink for ShortDisk {
        fn sync(&mut self) -> io::Result<()> {
            self.file.sync_all()
        }
    }

    #[test]
    fn test_temp_write_failure_mid_stream_keeps_original() {
        let dir = tempfile::tempdir().unwrap();
        let metadata = Arc::new(MemoryMetadataStore::new());
        let audit = Arc::new(MemoryAuditLog::new());
        let ports = Ports {
            metadata: metadata.clone(),
            verifiers: Arc::new(MemoryVerifierStore::new()),
            audit: audit.clone(),
            backup: None,
        };
        let options = EngineOptions::new(dir.path().join("store")).with_buffer_size(8192);
        let encryptor = FileEncryptor::new(ports, options).unwrap();

        let input = dir.path().join("big.bin");
        let data: Vec<u8> = (0..100_000u32)
            .map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8)
            .collect();
        fs::write(&input, &data).unwrap();
        let old = SecretString::from("pw1");
        let record = encryptor
            .encrypt_verified(
                &input,
                UserId(1),
                &old,
                EncryptOptions::default(),
                &Hooks::default(),
                Instant::now(),
            )
            .unwrap();
        let before = fs::read(&record.path).unwrap();

        let written = Arc::new(AtomicUsize::new(0));
        let counter = written.clone();
        let err = encryptor
            .rekey_through(
                &record,
                &old,
                &SecretString::from("pw2"),
                &Hooks::default(),
                |temp: &Path| -> io::Result<ShortDisk> {
                    Ok(ShortDisk {
                        file: create_exclusive(temp)?,
                        room: 20_000,
                        written: counter,
                    })
                },
            )
            .unwrap_err();

        match err {
            FcryptError::RekeyFailed(inner) => {
                assert!(matches!(*inner, FcryptError::Io(_)), "got {inner:?}")
            }
            other => panic!("expected RekeyFailed, got {other:?}"),
        }
        // failed after several chunks had reached the temp file
        assert_eq!(written.load(Ordering::SeqCst), 20_000);
        assert_eq!(fs::read(&record.path).unwrap(), before);
        assert!(!rekey_temp_path(&record.path).exists());
        assert_eq!(metadata.find_by_id(record.file_id).unwrap().unwrap(), record);

        let last = audit.entries().pop().unwrap();
        assert_eq!((last.op, last.status), (AuditOp::Rekey, AuditStatus::Failure));
    }

    #[test]
    fn test_sort_report() {
        let mut report = RekeyReport {
            succeeded: vec![FileId(3), FileId(1)],
            failed_with_reasons: vec![(FileId(9), "b".into()), (FileId(2), "a".into())],
        };
        sort_report(&mut report);
        assert_eq!(report.succeeded, vec![FileId(1), FileId(3)]);
        assert_eq!(report.failed_with_reasons[0].0, FileId(2));
    }
}
