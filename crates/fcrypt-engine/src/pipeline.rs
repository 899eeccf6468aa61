//! Shared plumbing for the encrypt, decrypt and rekey pipelines.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Component, Path};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::warn;

use fcrypt_core::{CancellationToken, FcryptError, FcryptResult, NoProgress, ProgressPort};

/// Per-call observers: where progress goes and which token cancels the call.
#[derive(Clone)]
pub struct Hooks {
    pub progress: Arc<dyn ProgressPort>,
    pub cancel: CancellationToken,
}

impl Hooks {
    pub fn new(progress: Arc<dyn ProgressPort>, cancel: CancellationToken) -> Self {
        Self { progress, cancel }
    }

    pub fn with_progress(progress: Arc<dyn ProgressPort>) -> Self {
        Self::new(progress, CancellationToken::new())
    }

    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self::new(Arc::new(NoProgress), cancel)
    }

    pub(crate) fn check_cancelled(&self) -> FcryptResult<()> {
        if self.cancel.is_cancelled() {
            Err(FcryptError::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl Default for Hooks {
    fn default() -> Self {
        Self::new(Arc::new(NoProgress), CancellationToken::new())
    }
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Turns pump callbacks into progress reports and cancellation checks.
///
/// Reports `0.0` on start, one report per chunk, and `1.0` on finish unless
/// the last chunk already reached it.
pub(crate) struct ChunkObserver<'a> {
    hooks: &'a Hooks,
    total: u64,
    last_fraction: f64,
}

impl<'a> ChunkObserver<'a> {
    pub(crate) fn start(hooks: &'a Hooks, total: u64) -> FcryptResult<Self> {
        hooks.check_cancelled()?;
        hooks.progress.on_progress(0.0, 0, total);
        Ok(Self {
            hooks,
            total,
            last_fraction: 0.0,
        })
    }

    pub(crate) fn on_chunk(&mut self, done: u64) -> FcryptResult<()> {
        let fraction = if self.total == 0 {
            0.0
        } else {
            (done as f64 / self.total as f64).min(1.0)
        };
        self.hooks.progress.on_progress(fraction, done, self.total);
        self.last_fraction = fraction;
        self.hooks.check_cancelled()
    }

    pub(crate) fn finish(&mut self, done: u64) {
        if self.last_fraction < 1.0 {
            self.hooks
                .progress
                .on_progress(1.0, done, self.total.max(done));
            self.last_fraction = 1.0;
        }
    }
}

/// Progress for a batch of files running on several workers.
///
/// Per-file byte progress is not forwarded; the caller's sink sees one
/// report per finished item, counted in items, so fractions only grow.
pub(crate) struct BatchProgress<'a> {
    hooks: &'a Hooks,
    item_hooks: Hooks,
    total: u64,
    done: Mutex<u64>,
}

impl<'a> BatchProgress<'a> {
    pub(crate) fn start(hooks: &'a Hooks, items: usize) -> Self {
        let total = items as u64;
        hooks.progress.on_progress(0.0, 0, total);
        Self {
            hooks,
            item_hooks: Hooks::with_cancel(hooks.cancel.clone()),
            total,
            done: Mutex::new(0),
        }
    }

    /// Hooks for one item: the batch's cancellation token, no progress.
    pub(crate) fn item_hooks(&self) -> &Hooks {
        &self.item_hooks
    }

    pub(crate) fn item_done(&self) {
        // report under the lock so reports arrive in counting order
        let mut done = self.done.lock().unwrap_or_else(PoisonError::into_inner);
        *done += 1;
        let fraction = (*done as f64 / self.total.max(1) as f64).min(1.0);
        self.hooks.progress.on_progress(fraction, *done, self.total);
    }
}

/// Create `path`, failing if anything already exists there.
pub(crate) fn create_exclusive(path: &Path) -> io::Result<File> {
    OpenOptions::new().write(true).create_new(true).open(path)
}

/// Best-effort removal of a partial output. Missing files are fine.
pub(crate) fn remove_partial(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), "failed to remove partial output: {e}"),
    }
}

/// Reduce a stored original name to one safe path component.
///
/// Directory parts are dropped; empty, `.` and `..` names are rejected.
pub fn sanitize_file_name(name: &str) -> FcryptResult<String> {
    let last = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let mut components = Path::new(last).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(part)), None) => part
            .to_str()
            .map(str::to_owned)
            .ok_or_else(|| FcryptError::InvalidParameter(format!("file name {name:?} is not UTF-8"))),
        _ => Err(FcryptError::InvalidParameter(format!(
            "file name {name:?} is not usable"
        ))),
    }
}
