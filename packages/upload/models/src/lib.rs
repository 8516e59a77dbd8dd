#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Configuration, plan, and result types for chunked multipart uploads.
//!
//! Everything in this crate is plain data: the engine in `chunkpush_upload`
//! consumes [`UploadConfig`] and [`ChunkPlanEntry`] values and produces
//! [`PartResult`], [`SessionReport`], and [`BatchReport`] values.

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Default chunk size: 50 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 50 * 1024 * 1024;

/// Default number of concurrent part uploads per file.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Default number of additional attempts after a transient part failure.
pub const DEFAULT_MAX_RETRIES: u32 = 10;

/// What to upload and where. Immutable for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTarget {
    /// Destination bucket name.
    pub bucket: String,
    /// Prepended verbatim to each file name to form the object key.
    pub key_prefix: String,
    /// Directory scanned for eligible files.
    pub source_dir: PathBuf,
    /// File extension filter, without the leading dot (e.g. `gz`).
    pub extension: String,
}

impl UploadTarget {
    /// Creates a target, stripping any leading `.` from `extension`.
    #[must_use]
    pub fn new(
        bucket: impl Into<String>,
        key_prefix: impl Into<String>,
        source_dir: impl Into<PathBuf>,
        extension: &str,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            key_prefix: key_prefix.into(),
            source_dir: source_dir.into(),
            extension: extension.trim_start_matches('.').to_string(),
        }
    }

    /// Returns `true` if `file_name` ends with `.{extension}`.
    #[must_use]
    pub fn matches(&self, file_name: &str) -> bool {
        file_name
            .strip_suffix(self.extension.as_str())
            .is_some_and(|stem| stem.ends_with('.'))
    }

    /// Builds the remote object key for a local file name.
    #[must_use]
    pub fn key_for(&self, file_name: &str) -> String {
        format!("{}{file_name}", self.key_prefix)
    }
}

/// How the delay between part retries grows.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Backoff {
    /// `base * 2^(n-1)` before retry `n`.
    #[default]
    Exponential,
    /// `base * n` before retry `n`.
    Linear,
}

/// Per-part retry budget and backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts allowed after the first one fails transiently.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Growth curve.
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff: Backoff::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Policy that retries `max_retries` times without sleeping.
    #[must_use]
    pub const fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff: Backoff::Exponential,
        }
    }

    /// Delay to wait before retry number `retry` (1-based).
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let retry = retry.max(1);
        let delay = match self.backoff {
            Backoff::Exponential => {
                let factor = 2u32.saturating_pow(retry - 1);
                self.base_delay.saturating_mul(factor)
            }
            Backoff::Linear => self.base_delay.saturating_mul(retry),
        };
        delay.min(self.max_delay)
    }
}

/// What the batch does after a file's session is aborted.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FailurePolicy {
    /// Move on to the next eligible file.
    #[default]
    Continue,
    /// Stop the batch after the first aborted file.
    Stop,
}

/// Immutable run configuration, built once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadConfig {
    /// What to upload and where.
    pub target: UploadTarget,
    /// Number of parts uploaded at once for a single file.
    pub concurrency: NonZeroUsize,
    /// Size of every part except possibly the last, in bytes.
    pub chunk_size: u64,
    /// Per-part retry budget.
    pub retry: RetryPolicy,
    /// Behaviour after an aborted session.
    pub on_failure: FailurePolicy,
    /// Delete the local file once its upload is committed.
    pub remove_source: bool,
    /// Cross-check the backend's part listing before committing.
    pub verify_remote: bool,
}

impl UploadConfig {
    /// Creates a configuration with default tuning for `target`.
    #[must_use]
    pub fn new(target: UploadTarget) -> Self {
        Self {
            target,
            concurrency: NonZeroUsize::new(DEFAULT_CONCURRENCY).unwrap_or(NonZeroUsize::MIN),
            chunk_size: DEFAULT_CHUNK_SIZE,
            retry: RetryPolicy::default(),
            on_failure: FailurePolicy::default(),
            remove_source: true,
            verify_remote: true,
        }
    }
}

/// One contiguous byte range of a file, uploaded as one part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkPlanEntry {
    /// 1-based part number.
    pub part_number: u32,
    /// Byte offset of the first byte in the file.
    pub offset: u64,
    /// Number of bytes in the part.
    pub length: u64,
}

impl ChunkPlanEntry {
    /// Offset one past the last byte of the part.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Remote handle for an open multipart upload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MultipartSession {
    /// Backend-assigned opaque upload id.
    pub upload_id: String,
    /// Bucket holding the upload.
    pub bucket: String,
    /// Object key being assembled.
    pub key: String,
}

/// Acknowledgement of one stored part, needed to commit the upload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UploadedPart {
    /// 1-based part number.
    pub part_number: u32,
    /// Entity tag returned by the backend, if any.
    pub e_tag: Option<String>,
}

/// Why a part ended up failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum PartFailureKind {
    /// Transient failures used up the retry budget.
    Exhausted,
    /// The backend reported a failure that retrying cannot fix.
    NonRetryable,
    /// The byte range could not be read from the local file.
    LocalRead,
    /// The upload was cancelled before the part finished.
    Cancelled,
}

/// Details of a failed part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartFailure {
    /// Classification of the failure.
    pub kind: PartFailureKind,
    /// Number of attempts made, including the first.
    pub attempts: u32,
    /// Last observed error message.
    pub message: String,
}

/// Outcome of uploading one part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartOutcome {
    /// The part is stored remotely.
    Success(UploadedPart),
    /// The part is not stored remotely.
    Failed(PartFailure),
}

/// Result of uploading one part, tagged with its part number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartResult {
    /// 1-based part number.
    pub part_number: u32,
    /// What happened.
    pub outcome: PartOutcome,
}

impl PartResult {
    /// Returns `true` if the part was stored.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.outcome, PartOutcome::Success(_))
    }
}

/// Lifecycle state of one file's upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr)]
pub enum SessionState {
    /// Remote session opened.
    Initiated,
    /// Parts are being dispatched.
    Uploading,
    /// Comparing stored parts against the plan.
    Verifying,
    /// Upload committed. Terminal.
    Completed,
    /// Upload discarded. Terminal.
    Aborted,
}

impl SessionState {
    /// Returns `true` for [`Self::Completed`] and [`Self::Aborted`].
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }
}

/// Summary of one file's upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    /// Local source file.
    pub path: PathBuf,
    /// Remote object key.
    pub key: String,
    /// File size in bytes.
    pub size: u64,
    /// Number of parts in the plan.
    pub parts_planned: usize,
    /// Terminal state reached.
    pub state: SessionState,
    /// Part numbers that did not succeed (failed or never ran).
    pub failed_parts: Vec<u32>,
    /// Whether the run was cancelled while this file was uploading.
    pub cancelled: bool,
    /// Whether the local file was deleted after commit.
    pub source_removed: bool,
}

/// Overall result of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr)]
pub enum BatchOutcome {
    /// No eligible files were found.
    NothingToDo,
    /// Every eligible file was committed.
    AllCompleted,
    /// At least one session was aborted.
    SomeAborted,
    /// The operator interrupted the run.
    Cancelled,
}

/// Summary of a whole batch run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Number of eligible files found.
    pub eligible: usize,
    /// One entry per file that was attempted, in processing order.
    pub sessions: Vec<SessionReport>,
    /// The operator interrupted the run.
    pub cancelled: bool,
    /// The batch stopped early because of [`FailurePolicy::Stop`].
    pub halted: bool,
}

impl BatchReport {
    /// Number of committed files.
    #[must_use]
    pub fn completed(&self) -> usize {
        self.sessions
            .iter()
            .filter(|s| s.state == SessionState::Completed)
            .count()
    }

    /// Number of aborted files.
    #[must_use]
    pub fn aborted(&self) -> usize {
        self.sessions
            .iter()
            .filter(|s| s.state == SessionState::Aborted)
            .count()
    }

    /// Classifies the run.
    #[must_use]
    pub fn outcome(&self) -> BatchOutcome {
        if self.cancelled {
            BatchOutcome::Cancelled
        } else if self.eligible == 0 {
            BatchOutcome::NothingToDo
        } else if self.aborted() > 0 || self.completed() < self.eligible {
            BatchOutcome::SomeAborted
        } else {
            BatchOutcome::AllCompleted
        }
    }
}

impl std::fmt::Display for BatchReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} eligible, {} completed, {} aborted, {} not attempted",
            self.eligible,
            self.completed(),
            self.aborted(),
            self.eligible.saturating_sub(self.sessions.len()),
        )
    }
}
