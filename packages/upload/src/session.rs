//! One file's multipart upload, from initiation to commit or abort.
//!
//! ```text
//! Initiated -> Uploading -> Verifying -> Completed
//!                                     \-> Aborted
//! ```
//!
//! Only part uploads are retried. Once a session reaches a terminal state
//! it is never retried as a whole.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chunkpush_upload_models::{
    ChunkPlanEntry, MultipartSession, PartOutcome, PartResult, SessionReport, SessionState,
    UploadConfig, UploadedPart,
};
use tokio_util::sync::CancellationToken;

use crate::UploadError;
use crate::part::PartUploader;
use crate::planner;
use crate::pool::WorkerPool;
use crate::progress::ProgressCallback;
use crate::store::ObjectStore;

/// Outcome of comparing part results against the plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    /// Every planned part, and nothing else, succeeded. Sorted by part
    /// number, ready to commit.
    Complete(Vec<UploadedPart>),
    /// Some planned parts are missing or failed.
    Incomplete {
        /// Planned part numbers without a successful result.
        missing: Vec<u32>,
    },
}

/// Compares the successful part numbers in `results` with `plan`.
///
/// Completion order is irrelevant; only set equality counts.
#[must_use]
pub fn verify(plan: &[ChunkPlanEntry], results: &[PartResult]) -> Verification {
    let succeeded: BTreeMap<u32, &UploadedPart> = results
        .iter()
        .filter_map(|r| match &r.outcome {
            PartOutcome::Success(part) => Some((r.part_number, part)),
            PartOutcome::Failed(_) => None,
        })
        .collect();
    let planned: BTreeSet<u32> = plan.iter().map(|e| e.part_number).collect();

    let missing: Vec<u32> = planned
        .iter()
        .copied()
        .filter(|n| !succeeded.contains_key(n))
        .collect();
    let unexpected = succeeded.keys().any(|n| !planned.contains(n));

    if missing.is_empty() && !unexpected {
        Verification::Complete(succeeded.into_values().cloned().collect())
    } else {
        Verification::Incomplete { missing }
    }
}

/// A single file's upload against an open remote multipart session.
pub struct UploadSession {
    store: Arc<dyn ObjectStore>,
    config: Arc<UploadConfig>,
    remote: MultipartSession,
    path: PathBuf,
    size: u64,
    plan: Vec<ChunkPlanEntry>,
    state: SessionState,
    remote_aborted: bool,
}

impl UploadSession {
    /// Plans `path` and opens a remote multipart session for `key`.
    ///
    /// # Errors
    ///
    /// * [`UploadError::Io`] if the file cannot be inspected
    /// * [`UploadError::Plan`] if the file cannot be split with the
    ///   configured chunk size
    /// * [`UploadError::SessionInit`] if the backend refuses to open a
    ///   session; nothing remote exists to clean up in that case
    pub async fn open(
        store: Arc<dyn ObjectStore>,
        config: Arc<UploadConfig>,
        path: &Path,
        key: String,
    ) -> Result<Self, UploadError> {
        let size = tokio::fs::metadata(path).await?.len();
        let plan = planner::plan(size, config.chunk_size)?;

        let remote = store
            .initiate_multipart(&config.target.bucket, &key)
            .await
            .map_err(|source| UploadError::SessionInit {
                key: key.clone(),
                source,
            })?;

        log::info!(
            "Uploading {} to {}/{key} now ({size} bytes in {} part(s), upload id {})",
            path.display(),
            config.target.bucket,
            plan.len(),
            remote.upload_id,
        );

        Ok(Self {
            store,
            config,
            remote,
            path: path.to_path_buf(),
            size,
            plan,
            state: SessionState::Initiated,
            remote_aborted: false,
        })
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// The remote multipart session handle.
    #[must_use]
    pub const fn remote(&self) -> &MultipartSession {
        &self.remote
    }

    /// Size of the source file in bytes.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// The part ranges this session uploads.
    #[must_use]
    pub fn plan(&self) -> &[ChunkPlanEntry] {
        &self.plan
    }

    /// Uploads every part, then commits or aborts.
    ///
    /// Cancelling `cancel` stops dispatch, tears down in-flight parts, and
    /// always ends in [`SessionState::Aborted`].
    pub async fn run(
        &mut self,
        cancel: &CancellationToken,
        progress: Arc<dyn ProgressCallback>,
    ) -> SessionReport {
        if self.state.is_terminal() {
            return self.report(Vec::new(), false, false);
        }

        self.transition(SessionState::Uploading);
        let run = self.dispatch(cancel, Arc::clone(&progress)).await;

        self.transition(SessionState::Verifying);
        let cancelled = run.cancelled || cancel.is_cancelled();
        let verification = verify(&self.plan, &run.results);

        let parts = match verification {
            Verification::Complete(parts) if !cancelled => parts,
            Verification::Complete(_) => {
                log::warn!("Upload of {} interrupted, aborting", self.remote.key);
                return self.fail(&progress, Vec::new(), true).await;
            }
            Verification::Incomplete { missing } => {
                if cancelled {
                    log::warn!(
                        "Upload of {} interrupted with {} part(s) outstanding, aborting",
                        self.remote.key,
                        missing.len(),
                    );
                } else {
                    log::error!(
                        "Upload of {} is missing part(s) {missing:?}, aborting",
                        self.remote.key,
                    );
                }
                return self.fail(&progress, missing, cancelled).await;
            }
        };

        if !self.remote_matches_plan().await {
            return self.fail(&progress, Vec::new(), false).await;
        }

        if let Err(e) = self.store.complete_multipart(&self.remote, &parts).await {
            log::error!("Completing upload of {} failed: {e}", self.remote.key);
            return self.fail(&progress, Vec::new(), false).await;
        }

        self.transition(SessionState::Completed);
        log::info!("Upload {} Successfully", self.path.display());
        progress.finish(format!("{} uploaded", self.remote.key));

        let source_removed = self.config.remove_source && self.remove_source().await;
        self.report(Vec::new(), false, source_removed)
    }

    /// Aborts the remote session. Only the first call reaches the backend.
    pub async fn abort(&mut self) {
        if self.remote_aborted {
            return;
        }
        self.remote_aborted = true;

        match self.store.abort_multipart(&self.remote).await {
            Ok(()) => log::info!(
                "Aborted multipart upload {} for {}",
                self.remote.upload_id,
                self.remote.key,
            ),
            Err(e) => log::error!(
                "Failed to abort multipart upload {} for {}, orphaned parts may remain: {e}",
                self.remote.upload_id,
                self.remote.key,
            ),
        }
        self.transition(SessionState::Aborted);
    }

    async fn dispatch(
        &self,
        cancel: &CancellationToken,
        progress: Arc<dyn ProgressCallback>,
    ) -> crate::pool::PoolRun<PartResult> {
        let uploader = PartUploader::new(Arc::clone(&self.store), self.config.retry)
            .with_cancel(cancel.clone());

        let jobs: Vec<_> = self
            .plan
            .iter()
            .map(|&entry| {
                let uploader = uploader.clone();
                let remote = self.remote.clone();
                let path = self.path.clone();
                let progress = Arc::clone(&progress);
                move || async move {
                    let result = uploader.upload(&remote, entry, &path).await;
                    if result.is_success() {
                        progress.inc(entry.length);
                    }
                    result
                }
            })
            .collect();

        WorkerPool::new(self.config.concurrency, cancel.clone())
            .run(jobs)
            .await
    }

    async fn remote_matches_plan(&self) -> bool {
        if !self.config.verify_remote {
            return true;
        }

        let planned: BTreeSet<u32> = self.plan.iter().map(|e| e.part_number).collect();
        match self.store.list_parts(&self.remote).await {
            Ok(listed) if listed == planned => true,
            Ok(listed) => {
                log::error!(
                    "Backend lists {} part(s) for {} but {} were planned",
                    listed.len(),
                    self.remote.key,
                    planned.len(),
                );
                false
            }
            Err(e) => {
                log::error!("Listing parts of {} failed: {e}", self.remote.key);
                false
            }
        }
    }

    async fn fail(
        &mut self,
        progress: &Arc<dyn ProgressCallback>,
        failed_parts: Vec<u32>,
        cancelled: bool,
    ) -> SessionReport {
        self.abort().await;
        log::error!("Uploading {} failed", self.path.display());
        progress.finish_and_clear();
        self.report(failed_parts, cancelled, false)
    }

    async fn remove_source(&self) -> bool {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                log::info!("Removed uploaded file {}", self.path.display());
                true
            }
            Err(e) => {
                log::warn!(
                    "Uploaded {} but could not remove it: {e}",
                    self.path.display()
                );
                false
            }
        }
    }

    fn transition(&mut self, next: SessionState) {
        log::debug!("{}: {} -> {next}", self.remote.key, self.state);
        self.state = next;
    }

    fn report(&self, failed_parts: Vec<u32>, cancelled: bool, source_removed: bool) -> SessionReport {
        SessionReport {
            path: self.path.clone(),
            key: self.remote.key.clone(),
            size: self.size,
            parts_planned: self.plan.len(),
            state: self.state,
            failed_parts,
            cancelled,
            source_removed,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chunkpush_upload_models::{
        PartFailure, PartFailureKind, RetryPolicy, UploadTarget,
    };

    use super::*;
    use crate::progress::null_progress;
    use crate::test_utils::{FailureMode, MemoryStore, TestDir, payload};

    fn config(dir: &Path, chunk_size: u64) -> Arc<UploadConfig> {
        let mut config = UploadConfig::new(UploadTarget::new("bucket", "logs/", dir, "bin"));
        config.chunk_size = chunk_size;
        config.retry = RetryPolicy::immediate(2);
        Arc::new(config)
    }

    fn success(part_number: u32) -> PartResult {
        PartResult {
            part_number,
            outcome: PartOutcome::Success(UploadedPart {
                part_number,
                e_tag: None,
            }),
        }
    }

    fn failure(part_number: u32) -> PartResult {
        PartResult {
            part_number,
            outcome: PartOutcome::Failed(PartFailure {
                kind: PartFailureKind::Exhausted,
                attempts: 3,
                message: "reset".to_string(),
            }),
        }
    }

    #[test]
    fn verify_ignores_completion_order() {
        let plan = planner::plan(30, 10).unwrap();
        let results = vec![success(3), success(1), success(2)];
        let Verification::Complete(parts) = verify(&plan, &results) else {
            panic!("expected complete");
        };
        let numbers: Vec<u32> = parts.iter().map(|p| p.part_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[test]
    fn verify_reports_failed_and_missing_parts() {
        let plan = planner::plan(40, 10).unwrap();
        let results = vec![success(1), failure(2), success(4)];
        assert_eq!(
            verify(&plan, &results),
            Verification::Incomplete {
                missing: vec![2, 3]
            }
        );
    }

    #[test]
    fn verify_rejects_parts_outside_the_plan() {
        let plan = planner::plan(20, 10).unwrap();
        let results = vec![success(1), success(2), success(3)];
        assert_eq!(
            verify(&plan, &results),
            Verification::Incomplete { missing: vec![] }
        );
    }

    #[tokio::test]
    async fn all_parts_succeed_commits_and_removes_source() {
        let dir = TestDir::new("session_commit");
        let data = payload(120);
        let path = dir.write("a.bin", &data);
        let store = Arc::new(MemoryStore::new());

        let mut session = UploadSession::open(
            store.clone(),
            config(dir.path(), 50),
            &path,
            "logs/a.bin".to_string(),
        )
        .await
        .unwrap();
        assert_eq!(session.state(), SessionState::Initiated);
        let lengths: Vec<u64> = session.plan().iter().map(|e| e.length).collect();
        assert_eq!(lengths, vec![50, 50, 20]);

        let report = session.run(&CancellationToken::new(), null_progress()).await;

        assert_eq!(report.state, SessionState::Completed);
        assert_eq!(report.parts_planned, 3);
        assert!(report.source_removed);
        assert!(!path.exists());
        assert_eq!(store.object("logs/a.bin").unwrap(), data);
        assert_eq!(store.abort_calls(), 0);
    }

    #[tokio::test]
    async fn exhausted_part_aborts_and_keeps_source() {
        let dir = TestDir::new("session_abort");
        let path = dir.write("a.bin", &payload(120));
        let store = Arc::new(MemoryStore::new().fail_part(2, FailureMode::AlwaysTransient));

        let mut session = UploadSession::open(
            store.clone(),
            config(dir.path(), 50),
            &path,
            "logs/a.bin".to_string(),
        )
        .await
        .unwrap();
        let report = session.run(&CancellationToken::new(), null_progress()).await;

        assert_eq!(report.state, SessionState::Aborted);
        assert_eq!(report.failed_parts, vec![2]);
        assert!(!report.source_removed);
        assert!(path.exists());
        assert!(store.is_aborted(session.remote()));
        assert!(store.object("logs/a.bin").is_none());
        assert_eq!(store.attempts(2), 3);
    }

    #[tokio::test]
    async fn empty_file_uploads_one_empty_part() {
        let dir = TestDir::new("session_empty");
        let path = dir.write("empty.bin", b"");
        let store = Arc::new(MemoryStore::new());

        let mut session = UploadSession::open(
            store.clone(),
            config(dir.path(), 50),
            &path,
            "logs/empty.bin".to_string(),
        )
        .await
        .unwrap();
        let report = session.run(&CancellationToken::new(), null_progress()).await;

        assert_eq!(report.state, SessionState::Completed);
        assert_eq!(report.parts_planned, 1);
        assert_eq!(store.object("logs/empty.bin").unwrap(), Vec::<u8>::new());
    }

    #[tokio::test]
    async fn cancellation_always_aborts() {
        let dir = TestDir::new("session_cancel");
        let path = dir.write("a.bin", &payload(100));
        let store = Arc::new(MemoryStore::new().with_delay(Duration::from_secs(30)));
        let cancel = CancellationToken::new();

        let mut session = UploadSession::open(
            store.clone(),
            config(dir.path(), 10),
            &path,
            "logs/a.bin".to_string(),
        )
        .await
        .unwrap();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let report = session.run(&cancel, null_progress()).await;

        assert_eq!(report.state, SessionState::Aborted);
        assert!(report.cancelled);
        assert_eq!(report.failed_parts.len(), 10);
        assert!(path.exists());
        assert!(store.is_aborted(session.remote()));
        assert!(store.max_in_flight() <= 4);

        session.abort().await;
        assert_eq!(store.abort_calls(), 1);
    }

    #[tokio::test]
    async fn remote_listing_mismatch_aborts() {
        let dir = TestDir::new("session_listing");
        let path = dir.write("a.bin", &payload(30));
        let store = Arc::new(MemoryStore::new().hide_part(2));

        let mut session = UploadSession::open(
            store.clone(),
            config(dir.path(), 10),
            &path,
            "logs/a.bin".to_string(),
        )
        .await
        .unwrap();
        let report = session.run(&CancellationToken::new(), null_progress()).await;

        assert_eq!(report.state, SessionState::Aborted);
        assert!(path.exists());
        assert_eq!(store.aborted_count(), 1);
    }

    #[tokio::test]
    async fn remote_listing_is_skipped_when_disabled() {
        let dir = TestDir::new("session_no_listing");
        let path = dir.write("a.bin", &payload(30));
        let store = Arc::new(MemoryStore::new().hide_part(2));
        let mut config = (*config(dir.path(), 10)).clone();
        config.verify_remote = false;
        config.remove_source = false;

        let mut session = UploadSession::open(
            store.clone(),
            Arc::new(config),
            &path,
            "logs/a.bin".to_string(),
        )
        .await
        .unwrap();
        let report = session.run(&CancellationToken::new(), null_progress()).await;

        assert_eq!(report.state, SessionState::Completed);
        assert!(!report.source_removed);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn failed_commit_aborts() {
        let dir = TestDir::new("session_commit_fail");
        let path = dir.write("a.bin", &payload(30));
        let store = Arc::new(MemoryStore::new().failing_complete());

        let mut session = UploadSession::open(
            store.clone(),
            config(dir.path(), 10),
            &path,
            "logs/a.bin".to_string(),
        )
        .await
        .unwrap();
        let report = session.run(&CancellationToken::new(), null_progress()).await;

        assert_eq!(report.state, SessionState::Aborted);
        assert!(path.exists());
        assert!(store.is_aborted(session.remote()));
    }

    #[tokio::test]
    async fn initiate_failure_is_reported() {
        let dir = TestDir::new("session_init_fail");
        let path = dir.write("a.bin", &payload(30));
        let store = Arc::new(MemoryStore::new().failing_initiate());

        let result = UploadSession::open(
            store.clone(),
            config(dir.path(), 10),
            &path,
            "logs/a.bin".to_string(),
        )
        .await;

        assert!(matches!(result, Err(UploadError::SessionInit { .. })));
        assert_eq!(store.open_sessions(), 0);
    }
}
