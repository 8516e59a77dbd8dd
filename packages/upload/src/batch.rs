//! Uploads every eligible file of a source directory, one file at a time.

use std::path::PathBuf;
use std::sync::Arc;

use chunkpush_upload_models::{
    BatchReport, FailurePolicy, SessionState, UploadConfig, UploadTarget,
};
use tokio_util::sync::CancellationToken;

use crate::UploadError;
use crate::progress::{NullProgress, ProgressFactory};
use crate::session::UploadSession;
use crate::store::ObjectStore;

/// Drives one [`UploadSession`] per eligible file, sequentially.
///
/// Concurrency only applies to the parts of the file currently uploading.
pub struct BatchDriver {
    store: Arc<dyn ObjectStore>,
    config: Arc<UploadConfig>,
    cancel: CancellationToken,
    progress: Arc<dyn ProgressFactory>,
}

impl BatchDriver {
    /// Creates a driver that stops at the next safe point once `cancel`
    /// fires.
    #[must_use]
    pub fn new(
        store: Arc<dyn ObjectStore>,
        config: Arc<UploadConfig>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            config,
            cancel,
            progress: Arc::new(NullProgress),
        }
    }

    /// Reports per-file progress through `progress`.
    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressFactory>) -> Self {
        self.progress = progress;
        self
    }

    /// Opens the bucket, then uploads each eligible file in name order.
    ///
    /// An aborted file does not stop the batch unless the configured
    /// [`FailurePolicy`] is [`FailurePolicy::Stop`]. Cancellation stops
    /// the batch after the in-progress session has been aborted.
    ///
    /// # Errors
    ///
    /// * [`UploadError::BackendUnreachable`] if the bucket cannot be opened
    /// * [`UploadError::SessionInit`] if a multipart session cannot be
    ///   opened for some file
    /// * [`UploadError::Io`] if the source directory cannot be listed or a
    ///   file cannot be inspected
    pub async fn run(&self) -> Result<BatchReport, UploadError> {
        let target = &self.config.target;

        self.store
            .open_bucket(&target.bucket)
            .await
            .map_err(|source| UploadError::BackendUnreachable {
                bucket: target.bucket.clone(),
                source,
            })?;
        log::info!("Opened bucket {}", target.bucket);

        let files = eligible_files(target).await?;
        if files.is_empty() {
            log::info!(
                "No .{} files to upload in {}",
                target.extension,
                target.source_dir.display()
            );
            return Ok(BatchReport::default());
        }
        log::info!(
            "Found {} .{} file(s) in {}",
            files.len(),
            target.extension,
            target.source_dir.display()
        );

        let mut report = BatchReport {
            eligible: files.len(),
            ..BatchReport::default()
        };

        for (file_name, path) in files {
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let key = target.key_for(&file_name);
            let mut session =
                UploadSession::open(Arc::clone(&self.store), Arc::clone(&self.config), &path, key)
                    .await?;
            let progress = self.progress.for_file(&file_name, session.size());
            let session_report = session.run(&self.cancel, progress).await;

            let aborted = session_report.state == SessionState::Aborted;
            let cancelled = session_report.cancelled;
            report.sessions.push(session_report);

            if cancelled {
                report.cancelled = true;
                break;
            }
            if aborted && self.config.on_failure == FailurePolicy::Stop {
                log::error!("Stopping after failed upload of {file_name}");
                report.halted = true;
                break;
            }
        }

        log::info!("Batch finished: {report}");
        Ok(report)
    }
}

/// Regular files in `target.source_dir` matching the extension filter,
/// sorted by name.
async fn eligible_files(target: &UploadTarget) -> Result<Vec<(String, PathBuf)>, UploadError> {
    let mut entries = tokio::fs::read_dir(&target.source_dir).await?;
    let mut files = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let Some(file_name) = entry.file_name().to_str().map(str::to_string) else {
            log::warn!("Skipping non-UTF-8 file name {}", path.display());
            continue;
        };
        if !target.matches(&file_name) {
            continue;
        }
        match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => {}
            Ok(_) => {
                log::debug!("Skipping {} (not a regular file)", path.display());
                continue;
            }
            // Dangling symlink, or removed since the directory was listed.
            Err(e) => {
                log::warn!("Skipping {}: {e}", path.display());
                continue;
            }
        }
        files.push((file_name, path));
    }

    files.sort();
    Ok(files)
}
