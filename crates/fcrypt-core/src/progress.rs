use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Progress sink, called at most once per processed chunk.
///
/// `fraction` is in `[0, 1]`; `total` is the byte count of the source
/// when known, otherwise 0 (and `fraction` stays 0 until completion).
pub trait ProgressPort: Send + Sync {
    fn on_progress(&self, fraction: f64, bytes_done: u64, bytes_total: u64);
}

/// Sink that discards progress.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressPort for NoProgress {
    fn on_progress(&self, _fraction: f64, _bytes_done: u64, _bytes_total: u64) {}
}

impl<F> ProgressPort for F
where
    F: Fn(f64, u64, u64) + Send + Sync,
{
    fn on_progress(&self, fraction: f64, bytes_done: u64, bytes_total: u64) {
        self(fraction, bytes_done, bytes_total)
    }
}

/// Cooperative cancellation flag shared between a caller and running operations.
///
/// Clones observe the same flag. Cancellation is one-way.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
