//! Progress reporting for uploads.
//!
//! Defines a [`ProgressCallback`] trait that decouples progress reporting
//! from any specific rendering backend (e.g., `indicatif` progress bars,
//! log-only reporting, or silence), and a [`ProgressFactory`] that hands
//! out one callback per file.

use std::sync::Arc;

/// Trait for reporting progress of one file's upload, in bytes.
///
/// Implementations must be `Send + Sync` because parts complete on
/// spawned tokio tasks.
pub trait ProgressCallback: Send + Sync {
    /// Advance progress by `delta` bytes.
    fn inc(&self, delta: u64);

    /// Mark progress as complete with a final message.
    fn finish(&self, msg: String);

    /// Mark progress as complete and remove the progress indicator.
    fn finish_and_clear(&self);
}

/// Creates a [`ProgressCallback`] for each file in a batch.
pub trait ProgressFactory: Send + Sync {
    /// Returns a callback for `name`, which will upload `total_bytes`.
    fn for_file(&self, name: &str, total_bytes: u64) -> Arc<dyn ProgressCallback>;
}

/// A no-op implementation of [`ProgressCallback`] and [`ProgressFactory`].
pub struct NullProgress;

impl ProgressCallback for NullProgress {
    fn inc(&self, _delta: u64) {}
    fn finish(&self, _msg: String) {}
    fn finish_and_clear(&self) {}
}

impl ProgressFactory for NullProgress {
    fn for_file(&self, _name: &str, _total_bytes: u64) -> Arc<dyn ProgressCallback> {
        null_progress()
    }
}

/// Returns a shared [`NullProgress`] instance for convenient use.
#[must_use]
pub fn null_progress() -> Arc<dyn ProgressCallback> {
    Arc::new(NullProgress)
}
