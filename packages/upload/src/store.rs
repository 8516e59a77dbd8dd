//! The object-store capability set the upload engine depends on.
//!
//! Backends implement [`ObjectStore`] and classify their failures into
//! [`StoreError`] variants; the engine only ever looks at
//! [`StoreError::is_transient`] to decide whether to retry.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chunkpush_upload_models::{MultipartSession, UploadedPart};

/// Boxed error source carried by [`StoreError`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors reported by an [`ObjectStore`] backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Network failure, timeout, throttling, or a backend-side 5xx.
    #[error("{operation} failed transiently: {source}")]
    Transient {
        /// Backend operation that failed.
        operation: &'static str,
        /// Underlying error.
        source: BoxError,
    },

    /// The multipart session was aborted or never existed.
    #[error("multipart upload {upload_id} no longer exists")]
    NoSuchUpload {
        /// Backend upload id.
        upload_id: String,
    },

    /// The bucket does not exist.
    #[error("bucket {bucket} does not exist")]
    NoSuchBucket {
        /// Bucket name.
        bucket: String,
    },

    /// Any other failure that retrying will not fix.
    #[error("{operation} failed: {source}")]
    Permanent {
        /// Backend operation that failed.
        operation: &'static str,
        /// Underlying error.
        source: BoxError,
    },
}

impl StoreError {
    /// Returns `true` if the same call may succeed when retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Multipart-capable object store.
///
/// Implementations must be safe to call concurrently for different parts
/// of the same session.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Checks that `bucket` exists and is reachable.
    async fn open_bucket(&self, bucket: &str) -> Result<(), StoreError>;

    /// Opens a multipart session for `key` in `bucket`.
    async fn initiate_multipart(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<MultipartSession, StoreError>;

    /// Stores `body` as part `part_number` of `session`.
    async fn upload_part(
        &self,
        session: &MultipartSession,
        part_number: u32,
        body: Vec<u8>,
    ) -> Result<UploadedPart, StoreError>;

    /// Lists the part numbers currently stored for `session`.
    async fn list_parts(&self, session: &MultipartSession) -> Result<BTreeSet<u32>, StoreError>;

    /// Assembles `parts` (sorted by part number) into the final object.
    async fn complete_multipart(
        &self,
        session: &MultipartSession,
        parts: &[UploadedPart],
    ) -> Result<(), StoreError>;

    /// Discards `session` and any stored parts.
    async fn abort_multipart(&self, session: &MultipartSession) -> Result<(), StoreError>;
}
