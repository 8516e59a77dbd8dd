//! Uploads a single byte range as one part, retrying transient failures.

use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;

use chunkpush_upload_models::{
    ChunkPlanEntry, MultipartSession, PartFailure, PartFailureKind, PartOutcome, PartResult,
    RetryPolicy,
};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;

use crate::store::ObjectStore;

/// Uploads plan entries of one session.
///
/// Holds no per-part state, so a single instance can be shared by every
/// worker of a pool.
#[derive(Clone)]
pub struct PartUploader {
    store: Arc<dyn ObjectStore>,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl PartUploader {
    /// Creates an uploader that retries according to `retry`.
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>, retry: RetryPolicy) -> Self {
        Self {
            store,
            retry,
            cancel: CancellationToken::new(),
        }
    }

    /// Gives up with [`PartFailureKind::Cancelled`] instead of starting
    /// another attempt, or waiting out a retry delay, once `cancel` fires.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Reads `entry`'s byte range from `path` and stores it as one part.
    ///
    /// Transient backend failures are retried up to `max_retries` more
    /// times, re-reading the range from disk on every attempt. Anything
    /// else fails on the spot. Never returns an error: failures come back
    /// as [`PartOutcome::Failed`].
    pub async fn upload(
        &self,
        session: &MultipartSession,
        entry: ChunkPlanEntry,
        path: &Path,
    ) -> PartResult {
        let part_number = entry.part_number;
        let max_attempts = self.retry.max_retries.saturating_add(1);
        let mut attempt = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                log::warn!("  part #{part_number} of {} cancelled", session.key);
                return failed(
                    part_number,
                    PartFailureKind::Cancelled,
                    attempt,
                    &std::io::Error::other("upload cancelled"),
                );
            }
            attempt += 1;
            log::info!(
                "Start uploading part #{part_number} of {} ({} bytes, attempt {attempt}/{max_attempts})",
                session.key,
                entry.length,
            );

            let body = match read_range(path, entry.offset, entry.length).await {
                Ok(body) => body,
                Err(e) => {
                    log::error!(
                        "  part #{part_number}: cannot read {} bytes at offset {} of {}: {e}",
                        entry.length,
                        entry.offset,
                        path.display(),
                    );
                    return failed(part_number, PartFailureKind::LocalRead, attempt, &e);
                }
            };

            match self.store.upload_part(session, part_number, body).await {
                Ok(part) => {
                    log::info!("  ... uploaded part #{part_number} of {}", session.key);
                    return PartResult {
                        part_number,
                        outcome: PartOutcome::Success(part),
                    };
                }
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    log::warn!(
                        "  part #{part_number} attempt {attempt}/{max_attempts} failed: {e}; \
                         retrying in {delay:.1?}"
                    );
                    if !delay.is_zero() {
                        tokio::select! {
                            () = self.cancel.cancelled() => {}
                            () = tokio::time::sleep(delay) => {}
                        }
                    }
                }
                Err(e) => {
                    let kind = if e.is_transient() {
                        PartFailureKind::Exhausted
                    } else {
                        PartFailureKind::NonRetryable
                    };
                    log::error!(
                        "  failed uploading part #{part_number} of {} after {attempt} attempt(s): {e}",
                        session.key,
                    );
                    return failed(part_number, kind, attempt, &e);
                }
            }
        }
    }
}

fn failed(
    part_number: u32,
    kind: PartFailureKind,
    attempts: u32,
    error: &dyn std::error::Error,
) -> PartResult {
    PartResult {
        part_number,
        outcome: PartOutcome::Failed(PartFailure {
            kind,
            attempts,
            message: error.to_string(),
        }),
    }
}

/// Reads exactly `length` bytes starting at `offset`.
async fn read_range(path: &Path, offset: u64, length: u64) -> std::io::Result<Vec<u8>> {
    let len = usize::try_from(length).map_err(std::io::Error::other)?;
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}
