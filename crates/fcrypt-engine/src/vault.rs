//! Vault: per-user password management and bulk flows over many files.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;
use secrecy::SecretString;
use tracing::{info, warn};

use fcrypt_core::config::{MAX_PARALLEL_JOBS, MIN_PARALLEL_JOBS};
use fcrypt_core::{
    AuditOp, BulkReport, CancellationToken, FcryptError, FcryptResult, FileRecord, RekeyReport,
    UserId,
};
use fcrypt_crypto::create_verifier;

use crate::encryptor::FileEncryptor;
use crate::options::EncryptOptions;
use crate::pipeline::{BatchProgress, Hooks};

/// Run `job` over `items` on a pool of at most `jobs` threads.
///
/// Items not yet started when `cancel` fires come back as `Cancelled`.
/// Outcomes are returned in item order.
pub(crate) fn run_bounded<T, R, F>(
    jobs: usize,
    items: &[T],
    cancel: &CancellationToken,
    job: F,
) -> FcryptResult<Vec<FcryptResult<R>>>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> FcryptResult<R> + Sync,
{
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(jobs.clamp(MIN_PARALLEL_JOBS, MAX_PARALLEL_JOBS))
        .thread_name(|i| format!("fcrypt-worker-{i}"))
        .build()
        .map_err(|e| FcryptError::Io(std::io::Error::other(e)))?;

    Ok(pool.install(|| {
        items
            .par_iter()
            .map(|item| {
                if cancel.is_cancelled() {
                    Err(FcryptError::Cancelled)
                } else {
                    job(item)
                }
            })
            .collect()
    }))
}

/// Front door for multi-file work on top of a [`FileEncryptor`].
#[derive(Clone)]
pub struct Vault {
    encryptor: Arc<FileEncryptor>,
}

impl Vault {
    pub fn new(encryptor: FileEncryptor) -> Self {
        Self {
            encryptor: Arc::new(encryptor),
        }
    }

    pub fn encryptor(&self) -> &FileEncryptor {
        &self.encryptor
    }

    /// Create the first password verifier for `owner`.
    ///
    /// Refuses with `InvalidParameter` when a verifier already exists; use
    /// [`Vault::change_password`] to replace one.
    pub fn set_password(&self, owner: UserId, password: &SecretString) -> FcryptResult<()> {
        let verifiers = &self.encryptor.ports().verifiers;
        if verifiers
            .get_verifier(owner)
            .map_err(FcryptError::metadata)?
            .is_some()
        {
            return Err(FcryptError::InvalidParameter(format!(
                "owner {owner} already has a password"
            )));
        }
        let verifier = create_verifier(owner, password)?;
        verifiers
            .put_verifier(verifier)
            .map_err(FcryptError::metadata)?;
        info!(owner = %owner, "password set");
        Ok(())
    }

    /// Replace the owner's password and rekey every file they own.
    ///
    /// The old password is verified once; the new verifier is persisted
    /// before any file is touched, so new encryptions already use it.
    pub fn change_password(
        &self,
        owner: UserId,
        old_password: &SecretString,
        new_password: &SecretString,
        hooks: &Hooks,
    ) -> FcryptResult<RekeyReport> {
        self.encryptor.verify_password(owner, old_password)?;
        let verifier = create_verifier(owner, new_password)?;
        self.encryptor
            .ports()
            .verifiers
            .put_verifier(verifier)
            .map_err(FcryptError::metadata)?;
        info!(owner = %owner, "password changed, rekeying files");
        self.encryptor
            .bulk_rekey(owner, old_password, new_password, hooks)
    }

    pub fn bulk_rekey(
        &self,
        owner: UserId,
        old_password: &SecretString,
        new_password: &SecretString,
        hooks: &Hooks,
    ) -> FcryptResult<RekeyReport> {
        self.encryptor
            .bulk_rekey(owner, old_password, new_password, hooks)
    }

    /// Encrypt every path in `inputs`. The password is verified once up front.
    ///
    /// `hooks.progress` sees one report per finished file, not byte progress.
    pub fn encrypt_all(
        &self,
        owner: UserId,
        inputs: &[PathBuf],
        password: &SecretString,
        opts: EncryptOptions,
        hooks: &Hooks,
    ) -> FcryptResult<BulkReport> {
        self.encryptor.verify_password(owner, password)?;

        let batch = BatchProgress::start(hooks, inputs.len());
        let outcomes = run_bounded(
            self.encryptor.options().parallel_jobs,
            inputs,
            &hooks.cancel,
            |input: &PathBuf| {
                let started = Instant::now();
                let result = self.encryptor.encrypt_verified(
                    input,
                    owner,
                    password,
                    opts,
                    batch.item_hooks(),
                    started,
                );
                if let Err(err) = &result {
                    self.encryptor
                        .audit_failure(owner, None, AuditOp::Encrypt, err, started);
                }
                batch.item_done();
                result
            },
        )?;

        let labels = inputs.iter().map(|p| p.display().to_string());
        Ok(collect_report("encrypt", labels, outcomes))
    }

    /// Decrypt every file `owner` has into `output_dir` (or the configured default).
    ///
    /// Progress is reported per finished file, as for [`Vault::encrypt_all`].
    pub fn decrypt_all(
        &self,
        owner: UserId,
        password: &SecretString,
        output_dir: Option<&Path>,
        hooks: &Hooks,
    ) -> FcryptResult<BulkReport> {
        let records = self
            .encryptor
            .ports()
            .metadata
            .list_by_owner(owner)
            .map_err(FcryptError::metadata)?;

        let batch = BatchProgress::start(hooks, records.len());
        let outcomes = run_bounded(
            self.encryptor.options().parallel_jobs,
            &records,
            &hooks.cancel,
            |record: &FileRecord| {
                let outcome = self.encryptor.decrypt(
                    record,
                    owner,
                    password,
                    output_dir,
                    batch.item_hooks(),
                );
                batch.item_done();
                outcome
            },
        )?;

        let labels = records
            .iter()
            .map(|r| format!("{} ({})", r.file_id, r.original_name));
        Ok(collect_report("decrypt", labels, outcomes))
    }
}

fn collect_report<R>(
    op: &str,
    labels: impl Iterator<Item = String>,
    outcomes: Vec<FcryptResult<R>>,
) -> BulkReport {
    let mut report = BulkReport::default();
    for (label, outcome) in labels.zip(outcomes) {
        match outcome {
            Ok(_) => report.succeeded.push(label),
            Err(err) => {
                warn!(item = %label, "{op} failed: {err}");
                report.failed_with_reasons.push((label, err.to_string()));
            }
        }
    }
    info!(
        op,
        succeeded = report.succeeded.len(),
        failed = report.failed_with_reasons.len(),
        "bulk operation finished"
    );
    report
}
