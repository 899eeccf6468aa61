//! FileEncryptor: single-file encrypt, decrypt and delete.
//!
//! Durable side effects are ordered so that a file record exists only while
//! its ciphertext is usable:
//!
//! - encrypt: write + sync ciphertext → insert record → erase plaintext → audit
//! - decrypt: write + sync plaintext → erase ciphertext → audit → delete record
//! - delete:  erase ciphertext → audit → delete record

use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use secrecy::SecretString;
use tracing::{debug, info, warn};

use fcrypt_core::{
    Algorithm, AuditEntry, AuditOp, AuditPort, AuditStatus, BackupFetch, BackupPort, FcryptError,
    FcryptResult, FileRecord, MetadataPort, NewFileRecord, PasswordVerifierPort, UserId,
    CIPHERTEXT_EXTENSION, IV_SIZE, SALT_SIZE,
};
use fcrypt_crypto::{
    derive_key, generate_iv, generate_salt, pump, verify_password, ChunkBuffer, DecryptingWriter,
    EncryptingWriter, FileKey, DEFAULT_ITERATIONS,
};

use crate::compress::{gunzip_writer, gzip_writer};
use crate::erase::erase;
use crate::options::{EncryptOptions, EngineOptions};
use crate::pipeline::{create_exclusive, remove_partial, sanitize_file_name, ChunkObserver, Hooks};

/// Attempts at picking an unused `stored_name` before giving up.
const STORED_NAME_ATTEMPTS: usize = 3;

/// The collaborator set every engine call runs against.
#[derive(Clone)]
pub struct Ports {
    pub metadata: Arc<dyn MetadataPort>,
    pub verifiers: Arc<dyn PasswordVerifierPort>,
    pub audit: Arc<dyn AuditPort>,
    /// Consulted only by decrypt when a ciphertext is missing locally
    pub backup: Option<Arc<dyn BackupPort>>,
}

pub struct FileEncryptor {
    ports: Ports,
    options: EngineOptions,
}

impl FileEncryptor {
    pub fn new(ports: Ports, options: EngineOptions) -> FcryptResult<Self> {
        options.validate()?;
        Ok(Self { ports, options })
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn ports(&self) -> &Ports {
        &self.ports
    }

    /// Encrypt `input` into the storage directory and erase the plaintext.
    pub fn encrypt(
        &self,
        input: &Path,
        owner: UserId,
        password: &SecretString,
        opts: EncryptOptions,
        hooks: &Hooks,
    ) -> FcryptResult<FileRecord> {
        let started = Instant::now();
        let result = self
            .verify_password(owner, password)
            .and_then(|()| self.encrypt_verified(input, owner, password, opts, hooks, started));
        if let Err(err) = &result {
            self.audit_failure(owner, None, AuditOp::Encrypt, err, started);
        }
        result
    }

    /// Check `password` against the owner's stored verifier.
    pub fn verify_password(&self, owner: UserId, password: &SecretString) -> FcryptResult<()> {
        let verifier = self
            .ports
            .verifiers
            .get_verifier(owner)
            .map_err(FcryptError::metadata)?
            .ok_or_else(|| {
                FcryptError::InvalidParameter(format!("no password is set for owner {owner}"))
            })?;
        verify_password(&verifier, password)
    }

    /// Encrypt without consulting the verifier store. Failures are not audited.
    pub(crate) fn encrypt_verified(
        &self,
        input: &Path,
        owner: UserId,
        password: &SecretString,
        opts: EncryptOptions,
        hooks: &Hooks,
        started: Instant,
    ) -> FcryptResult<FileRecord> {
        let meta = fs::symlink_metadata(input)?;
        if !meta.is_file() {
            return Err(FcryptError::InvalidParameter(format!(
                "{} is not a regular file",
                input.display()
            )));
        }
        let original_name = input
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                FcryptError::InvalidParameter(format!(
                    "{} has no UTF-8 file name",
                    input.display()
                ))
            })
            .and_then(sanitize_file_name)?;
        hooks.check_cancelled()?;

        let salt = generate_salt();
        let iv = generate_iv();
        let key = derive_key(password, &salt, DEFAULT_ITERATIONS)?;

        fs::create_dir_all(&self.options.storage_dir)?;
        let storage_dir = fs::canonicalize(&self.options.storage_dir)?;
        let (stored_name, ciphertext_path, out) = self.allocate_ciphertext(&storage_dir, &original_name)?;
        debug!(path = %ciphertext_path.display(), owner = %owner, "encrypting");

        let mut buf = ChunkBuffer::new(self.options.buffer_size)?;
        let bytes_in = match seal_file(input, out, &key, &iv, opts.compress, meta.len(), &mut buf, hooks) {
            Ok(n) => n,
            Err(err) => {
                remove_partial(&ciphertext_path);
                if matches!(err, FcryptError::Cancelled) {
                    info!(path = %input.display(), "encrypt cancelled");
                }
                return Err(err);
            }
        };
        drop(key);

        let record = match self.ports.metadata.insert(NewFileRecord {
            owner_id: owner,
            original_name,
            stored_name,
            path: ciphertext_path.clone(),
            original_size: bytes_in,
            iv,
            salt,
            algorithm: Algorithm::AesGcm256.as_str().to_owned(),
            compressed: opts.compress,
        }) {
            Ok(record) => record,
            Err(err) => {
                remove_partial(&ciphertext_path);
                return Err(FcryptError::metadata(err));
            }
        };

        let erase_warning = match erase(input, self.options.delete_mode, self.options.delete_passes) {
            Ok(()) => None,
            Err(err) => {
                warn!(path = %input.display(), file_id = %record.file_id, "secure erase of plaintext failed: {err}");
                Some(format!("secure erase failed: {err}"))
            }
        };

        let mut entry = AuditEntry::new(owner, AuditOp::Encrypt, AuditStatus::Success)
            .file(Some(record.file_id))
            .size(bytes_in)
            .duration_ms(elapsed_ms(started));
        if let Some(warning) = erase_warning {
            entry = entry.error(warning);
        }
        self.audit(entry);

        info!(
            file_id = %record.file_id,
            owner = %owner,
            bytes = bytes_in,
            compressed = opts.compress,
            path = %record.path.display(),
            "encrypted"
        );
        Ok(record)
    }

    /// Pick a fresh `{uuid}__{name}.encrypted` and create it exclusively.
    fn allocate_ciphertext(
        &self,
        storage_dir: &Path,
        original_name: &str,
    ) -> FcryptResult<(String, PathBuf, File)> {
        for _ in 0..STORED_NAME_ATTEMPTS {
            let stored_name = format!(
                "{}__{}{}",
                uuid::Uuid::new_v4(),
                original_name,
                CIPHERTEXT_EXTENSION
            );
            if self
                .ports
                .metadata
                .exists_by_stored_name(&stored_name)
                .map_err(FcryptError::metadata)?
            {
                continue;
            }
            let path = storage_dir.join(&stored_name);
            match create_exclusive(&path) {
                Ok(file) => return Ok((stored_name, path, file)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(FcryptError::Io(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "could not allocate an unused ciphertext name",
        )))
    }

    /// Decrypt `record` for `owner`, returning the plaintext path.
    ///
    /// On success the ciphertext is erased and the record deleted.
    pub fn decrypt(
        &self,
        record: &FileRecord,
        owner: UserId,
        password: &SecretString,
        output_dir: Option<&Path>,
        hooks: &Hooks,
    ) -> FcryptResult<PathBuf> {
        if record.owner_id != owner {
            warn!(file_id = %record.file_id, owner = %owner, "decrypt refused: not the owner");
            return Err(FcryptError::NotOwner);
        }
        let started = Instant::now();
        let out_path = match self.decrypt_owned(record, password, output_dir, hooks, started) {
            Ok(path) => path,
            Err(err) => {
                self.audit_failure(owner, Some(record), AuditOp::Decrypt, &err, started);
                return Err(err);
            }
        };
        // success is already audited; a failed record delete is only reported
        self.forget(record)?;

        info!(
            file_id = %record.file_id,
            owner = %record.owner_id,
            bytes = record.original_size,
            path = %out_path.display(),
            "decrypted"
        );
        Ok(out_path)
    }

    fn decrypt_owned(
        &self,
        record: &FileRecord,
        password: &SecretString,
        output_dir: Option<&Path>,
        hooks: &Hooks,
        started: Instant,
    ) -> FcryptResult<PathBuf> {
        record.algorithm()?;
        self.check_stored_location(record)?;
        let output_name = sanitize_file_name(&record.original_name)?;
        let ciphertext = self.locate_ciphertext(record)?;

        let out_dir = match output_dir.or(self.options.decrypt_dir.as_deref()) {
            Some(dir) => dir.to_path_buf(),
            None => ciphertext
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
        };
        fs::create_dir_all(&out_dir)?;
        let out_path = out_dir.join(output_name);

        let mut buf = ChunkBuffer::new(self.options.buffer_size)?;
        let mut salt = record.salt;
        // per-file salt first, then one retry with the owner's current verifier salt
        for attempt in 0..2 {
            let key = derive_key(password, &salt, DEFAULT_ITERATIONS)?;
            let out = match create_exclusive(&out_path) {
                Ok(file) => file,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    return Err(FcryptError::InvalidParameter(format!(
                        "output {} already exists",
                        out_path.display()
                    )));
                }
                Err(e) => return Err(e.into()),
            };

            match open_file(&ciphertext, out, &key, &record.iv, record.compressed, &mut buf, hooks) {
                Ok(()) => break,
                Err(FcryptError::AuthenticationFailed) if attempt == 0 => {
                    remove_partial(&out_path);
                    match self.legacy_salt(record)? {
                        Some(fallback) => {
                            debug!(file_id = %record.file_id, "retrying with current verifier salt");
                            salt = fallback;
                        }
                        None => return Err(FcryptError::AuthenticationFailed),
                    }
                }
                Err(err) => {
                    remove_partial(&out_path);
                    return Err(err);
                }
            }
        }

        if let Err(err) = erase(&ciphertext, self.options.delete_mode, self.options.delete_passes) {
            warn!(path = %ciphertext.display(), file_id = %record.file_id, "secure erase of ciphertext failed: {err}");
        }
        self.audit(
            AuditEntry::new(record.owner_id, AuditOp::Decrypt, AuditStatus::Success)
                .file(Some(record.file_id))
                .size(record.original_size)
                .duration_ms(elapsed_ms(started)),
        );
        Ok(out_path)
    }

    /// The owner's current verifier salt, when it differs from the record's.
    fn legacy_salt(&self, record: &FileRecord) -> FcryptResult<Option<[u8; SALT_SIZE]>> {
        let verifier = self
            .ports
            .verifiers
            .get_verifier(record.owner_id)
            .map_err(FcryptError::metadata)?;
        Ok(verifier
            .map(|v| v.verifier_salt)
            .filter(|salt| *salt != record.salt))
    }

    /// Resolve the ciphertext path, restoring it from backup when missing.
    fn locate_ciphertext(&self, record: &FileRecord) -> FcryptResult<PathBuf> {
        if record.path.is_file() {
            return Ok(record.path.clone());
        }
        let missing = || FcryptError::CiphertextMissing(record.path.clone());
        let Some(backup) = &self.ports.backup else {
            return Err(missing());
        };
        match backup.fetch_by_stored_name(&record.stored_name, &self.options.storage_dir) {
            Ok(BackupFetch::Found(path)) => {
                info!(file_id = %record.file_id, path = %path.display(), "ciphertext restored from backup");
                Ok(path)
            }
            Ok(BackupFetch::NotFound) => Err(missing()),
            Err(err) => {
                warn!(file_id = %record.file_id, "backup fetch failed: {err:#}");
                Err(missing())
            }
        }
    }

    /// Erase the ciphertext of `record` and forget it.
    pub fn delete(&self, record: &FileRecord, owner: UserId) -> FcryptResult<()> {
        if record.owner_id != owner {
            warn!(file_id = %record.file_id, owner = %owner, "delete refused: not the owner");
            return Err(FcryptError::NotOwner);
        }
        let started = Instant::now();
        if let Err(err) = self.delete_owned(record, started) {
            self.audit_failure(owner, Some(record), AuditOp::Delete, &err, started);
            return Err(err);
        }
        self.forget(record)?;
        info!(file_id = %record.file_id, owner = %record.owner_id, "deleted");
        Ok(())
    }

    fn delete_owned(&self, record: &FileRecord, started: Instant) -> FcryptResult<()> {
        self.check_stored_location(record)?;
        if record.path.exists() {
            erase(&record.path, self.options.delete_mode, self.options.delete_passes)?;
        } else {
            warn!(path = %record.path.display(), file_id = %record.file_id, "ciphertext already gone");
        }
        self.audit(
            AuditEntry::new(record.owner_id, AuditOp::Delete, AuditStatus::Success)
                .file(Some(record.file_id))
                .size(record.original_size)
                .duration_ms(elapsed_ms(started)),
        );
        Ok(())
    }

    /// Drop the record of a file whose ciphertext is already gone.
    fn forget(&self, record: &FileRecord) -> FcryptResult<()> {
        self.ports.metadata.delete(record.file_id).map_err(|err| {
            warn!(file_id = %record.file_id, "ciphertext erased but record delete failed: {err:#}");
            FcryptError::metadata(err)
        })
    }

    /// The record must name a `.encrypted` file directly inside the storage directory.
    pub(crate) fn check_stored_location(&self, record: &FileRecord) -> FcryptResult<()> {
        let unexpected = || {
            FcryptError::Corrupted(format!(
                "record {} points at an unexpected location {}",
                record.file_id,
                record.path.display()
            ))
        };
        let name_matches =
            record.path.file_name().and_then(|n| n.to_str()) == Some(record.stored_name.as_str());
        if !record.stored_name.ends_with(CIPHERTEXT_EXTENSION)
            || !name_matches
            || record.path.components().any(|c| c == Component::ParentDir)
        {
            return Err(unexpected());
        }

        fs::create_dir_all(&self.options.storage_dir)?;
        let storage_dir = fs::canonicalize(&self.options.storage_dir)?;
        let parent = record
            .path
            .parent()
            .and_then(|p| fs::canonicalize(p).ok())
            .ok_or_else(unexpected)?;
        if parent != storage_dir {
            warn!(
                file_id = %record.file_id,
                path = %record.path.display(),
                storage_dir = %storage_dir.display(),
                "record path is outside the storage directory"
            );
            return Err(unexpected());
        }
        Ok(())
    }

    pub(crate) fn audit(&self, entry: AuditEntry) {
        let (op, file_id) = (entry.op, entry.file_id);
        if let Err(err) = self.ports.audit.log(entry) {
            warn!(?op, ?file_id, "audit write failed: {err:#}");
        }
    }

    pub(crate) fn audit_failure(
        &self,
        owner: UserId,
        record: Option<&FileRecord>,
        op: AuditOp,
        err: &FcryptError,
        started: Instant,
    ) {
        let status = if matches!(err, FcryptError::Cancelled) {
            AuditStatus::Cancelled
        } else {
            AuditStatus::Failure
        };
        let mut entry = AuditEntry::new(owner, op, status)
            .file(record.map(|r| r.file_id))
            .size(record.map_or(0, |r| r.original_size))
            .duration_ms(elapsed_ms(started));
        if status == AuditStatus::Failure {
            entry = entry.error(err.to_string());
        }
        self.audit(entry);
    }
}

/// Stream `input` → optional gzip → AES-GCM into `out`, then sync it.
#[allow(clippy::too_many_arguments)]
fn seal_file(
    input: &Path,
    out: File,
    key: &FileKey,
    iv: &[u8; IV_SIZE],
    compress: bool,
    total: u64,
    buf: &mut ChunkBuffer,
    hooks: &Hooks,
) -> FcryptResult<u64> {
    let mut src = File::open(input)?;
    let mut observer = ChunkObserver::start(hooks, total)?;
    let sealer = EncryptingWriter::new(key, iv, out);

    let (bytes_in, sealer) = if compress {
        let mut gz = gzip_writer(sealer);
        let n = pump(&mut src, &mut gz, buf, |done| observer.on_chunk(done))?;
        (n, gz.finish()?)
    } else {
        let mut sealer = sealer;
        let n = pump(&mut src, &mut sealer, buf, |done| observer.on_chunk(done))?;
        (n, sealer)
    };
    let (out, _) = sealer.finish()?;
    out.sync_all()?;
    observer.finish(bytes_in);
    Ok(bytes_in)
}

/// Stream `ciphertext` → AES-GCM → optional gunzip into `out`, then sync it.
fn open_file(
    ciphertext: &Path,
    out: File,
    key: &FileKey,
    iv: &[u8; IV_SIZE],
    compressed: bool,
    buf: &mut ChunkBuffer,
    hooks: &Hooks,
) -> FcryptResult<()> {
    let mut src = File::open(ciphertext)?;
    let total = src.metadata()?.len();
    let mut observer = ChunkObserver::start(hooks, total)?;

    let out = if compressed {
        let mut opener = DecryptingWriter::new(key, iv, gunzip_writer(out));
        let done = pump(&mut src, &mut opener, buf, |done| observer.on_chunk(done))?;
        let (gz, _) = opener.finish()?;
        observer.finish(done);
        gz.finish().map_err(fcrypt_crypto::payload_error)?
    } else {
        let mut opener = DecryptingWriter::new(key, iv, out);
        let done = pump(&mut src, &mut opener, buf, |done| observer.on_chunk(done))?;
        let (out, _) = opener.finish()?;
        observer.finish(done);
        out
    };
    out.sync_all()?;
    Ok(())
}

pub(crate) fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
