#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Chunked multipart upload engine.
//!
//! A file is split into fixed-size byte ranges ([`planner`]), each range is
//! uploaded as one part with bounded retry ([`part`]) on a bounded worker
//! pool ([`pool`]), and the session ([`session`]) commits the upload only
//! when every planned part landed, aborting it otherwise. [`batch`] runs
//! one session per eligible file of a directory.
//!
//! The engine talks to storage exclusively through the [`ObjectStore`]
//! trait, so any multipart-capable backend can be plugged in.

pub mod batch;
pub mod part;
pub mod planner;
pub mod pool;
pub mod progress;
pub mod session;
pub mod store;

#[cfg(test)]
pub(crate) mod test_utils;

pub use batch::BatchDriver;
pub use part::PartUploader;
pub use pool::{PoolRun, WorkerPool};
pub use progress::{NullProgress, ProgressCallback, ProgressFactory, null_progress};
pub use session::{UploadSession, Verification, verify};
pub use store::{BoxError, ObjectStore, StoreError};

/// Errors produced while planning a file.
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    /// The size/chunk combination cannot be planned.
    #[error("Invalid chunk plan input: {message}")]
    InvalidInput {
        /// Description of what went wrong.
        message: String,
    },
}

/// Run-level upload errors. Part failures never surface here; they end
/// the affected session in the `Aborted` state instead.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// The bucket could not be opened at the start of the run.
    #[error("Can't reach bucket {bucket}: {source}")]
    BackendUnreachable {
        /// Bucket name.
        bucket: String,
        /// Backend error.
        source: StoreError,
    },

    /// The backend refused to open a multipart session.
    #[error("Failed to open multipart upload for {key}: {source}")]
    SessionInit {
        /// Object key.
        key: String,
        /// Backend error.
        source: StoreError,
    },

    /// A file could not be planned.
    #[error(transparent)]
    Plan(#[from] PlanError),

    /// I/O error listing or inspecting local files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
