#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! S3-compatible [`ObjectStore`] backend built on the AWS SDK.
//!
//! Works against AWS S3 and any S3-compatible service (`MinIO`, R2, ...)
//! that supports the multipart upload API.
//!
//! # Configuration
//!
//! Credentials and the default region come from the standard AWS provider
//! chain (`AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY`, profiles, instance
//! metadata, ...). [`S3Options`] can override the region and endpoint.
//!
//! # Error classification
//!
//! Timeouts, dispatch failures, truncated responses, throttling, and 5xx
//! responses are [`StoreError::Transient`]. `NoSuchUpload` and
//! `NoSuchBucket` map to their dedicated variants; everything else is
//! [`StoreError::Permanent`].

use std::collections::BTreeSet;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::config::StalledStreamProtectionConfig;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::operation::head_bucket::HeadBucketError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use chunkpush_upload::{ObjectStore, StoreError};
use chunkpush_upload_models::{MultipartSession, UploadedPart};

/// Service error codes worth retrying regardless of HTTP status.
const TRANSIENT_CODES: &[&str] = &[
    "RequestTimeout",
    "SlowDown",
    "InternalError",
    "ServiceUnavailable",
    "Throttling",
    "ThrottlingException",
];

/// Overrides applied on top of the ambient AWS configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct S3Options {
    /// Region to use instead of the provider chain's.
    pub region: Option<String>,
    /// Custom endpoint for S3-compatible services.
    pub endpoint_url: Option<String>,
    /// Use path-style URLs (`endpoint/bucket/key`), needed by some
    /// S3-compatible services.
    pub force_path_style: bool,
}

/// [`ObjectStore`] over an `aws_sdk_s3::Client`.
#[derive(Debug, Clone)]
pub struct S3Store {
    client: aws_sdk_s3::Client,
}

impl S3Store {
    /// Loads the ambient AWS configuration and builds a client.
    ///
    /// No request is sent here; an unreachable endpoint only shows up on
    /// the first call, normally [`ObjectStore::open_bucket`].
    pub async fn connect(options: &S3Options) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &options.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(endpoint) = &options.endpoint_url {
            log::info!("Using S3 endpoint {endpoint}");
            loader = loader.endpoint_url(endpoint);
        }
        let shared = loader.load().await;

        let config = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(options.force_path_style)
            .stalled_stream_protection(StalledStreamProtectionConfig::disabled())
            .build();

        Self::from_client(aws_sdk_s3::Client::from_conf(config))
    }

    /// Wraps an existing client.
    #[must_use]
    pub const fn from_client(client: aws_sdk_s3::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn open_bucket(&self, bucket: &str) -> Result<(), StoreError> {
        match self.client.head_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(()),
            Err(err)
                if err
                    .as_service_error()
                    .is_some_and(HeadBucketError::is_not_found) =>
            {
                Err(StoreError::NoSuchBucket {
                    bucket: bucket.to_string(),
                })
            }
            Err(err) => Err(map_sdk_error("HeadBucket", bucket, None, err)),
        }
    }

    async fn initiate_multipart(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<MultipartSession, StoreError> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .content_type("application/octet-stream")
            .send()
            .await
            .map_err(|e| map_sdk_error("CreateMultipartUpload", bucket, None, e))?;

        let upload_id = output
            .upload_id()
            .ok_or_else(|| StoreError::Permanent {
                operation: "CreateMultipartUpload",
                source: "S3 did not return an upload id".into(),
            })?
            .to_string();

        Ok(MultipartSession {
            upload_id,
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
    }

    async fn upload_part(
        &self,
        session: &MultipartSession,
        part_number: u32,
        body: Vec<u8>,
    ) -> Result<UploadedPart, StoreError> {
        let output = self
            .client
            .upload_part()
            .bucket(&session.bucket)
            .key(&session.key)
            .upload_id(&session.upload_id)
            .part_number(to_sdk_part_number("UploadPart", part_number)?)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| {
                map_sdk_error("UploadPart", &session.bucket, Some(&session.upload_id), e)
            })?;

        Ok(UploadedPart {
            part_number,
            e_tag: output.e_tag().map(str::to_string),
        })
    }

    async fn list_parts(&self, session: &MultipartSession) -> Result<BTreeSet<u32>, StoreError> {
        let mut parts = BTreeSet::new();
        let mut marker: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_parts()
                .bucket(&session.bucket)
                .key(&session.key)
                .upload_id(&session.upload_id);

            if let Some(marker) = &marker {
                request = request.part_number_marker(marker);
            }

            let output = request.send().await.map_err(|e| {
                map_sdk_error("ListParts", &session.bucket, Some(&session.upload_id), e)
            })?;

            parts.extend(
                output
                    .parts()
                    .iter()
                    .filter_map(|p| p.part_number())
                    .filter_map(|n| u32::try_from(n).ok()),
            );

            if output.is_truncated() == Some(true) {
                marker = output.next_part_number_marker().map(String::from);
                if marker.is_none() {
                    break;
                }
            } else {
                break;
            }
        }

        Ok(parts)
    }

    async fn complete_multipart(
        &self,
        session: &MultipartSession,
        parts: &[UploadedPart],
    ) -> Result<(), StoreError> {
        let completed = parts
            .iter()
            .map(|part| {
                Ok(CompletedPart::builder()
                    .set_e_tag(part.e_tag.clone())
                    .part_number(to_sdk_part_number(
                        "CompleteMultipartUpload",
                        part.part_number,
                    )?)
                    .build())
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        let upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&session.bucket)
            .key(&session.key)
            .upload_id(&session.upload_id)
            .multipart_upload(upload)
            .send()
            .await
            .map_err(|e| {
                map_sdk_error(
                    "CompleteMultipartUpload",
                    &session.bucket,
                    Some(&session.upload_id),
                    e,
                )
            })?;

        Ok(())
    }

    async fn abort_multipart(&self, session: &MultipartSession) -> Result<(), StoreError> {
        let result = self
            .client
            .abort_multipart_upload()
            .bucket(&session.bucket)
            .key(&session.key)
            .upload_id(&session.upload_id)
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) => match map_sdk_error(
                "AbortMultipartUpload",
                &session.bucket,
                Some(&session.upload_id),
                err,
            ) {
                // Already aborted (or completed): nothing left to free.
                StoreError::NoSuchUpload { upload_id } => {
                    log::debug!("multipart upload {upload_id} already gone");
                    Ok(())
                }
                other => Err(other),
            },
        }
    }
}

/// How a backend failure should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorClass {
    Transient,
    NoSuchUpload,
    NoSuchBucket,
    Permanent,
}

/// Classifies a service error response by its error code and HTTP status.
fn classify_service(status: Option<u16>, code: Option<&str>) -> ErrorClass {
    match code {
        Some("NoSuchUpload") => return ErrorClass::NoSuchUpload,
        Some("NoSuchBucket") => return ErrorClass::NoSuchBucket,
        Some(code) if TRANSIENT_CODES.contains(&code) => return ErrorClass::Transient,
        _ => {}
    }

    match status {
        Some(408 | 429 | 500..=599) => ErrorClass::Transient,
        _ => ErrorClass::Permanent,
    }
}

fn classify<E: ProvideErrorMetadata>(err: &SdkError<E>) -> ErrorClass {
    match err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            ErrorClass::Transient
        }
        SdkError::ConstructionFailure(_) => ErrorClass::Permanent,
        _ => classify_service(err.raw_response().map(|r| r.status().as_u16()), err.code()),
    }
}

fn map_sdk_error<E>(
    operation: &'static str,
    bucket: &str,
    upload_id: Option<&str>,
    err: SdkError<E>,
) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    match classify(&err) {
        ErrorClass::Transient => StoreError::Transient {
            operation,
            source: Box::new(err),
        },
        ErrorClass::NoSuchUpload => StoreError::NoSuchUpload {
            upload_id: upload_id.unwrap_or_default().to_string(),
        },
        ErrorClass::NoSuchBucket => StoreError::NoSuchBucket {
            bucket: bucket.to_string(),
        },
        ErrorClass::Permanent => StoreError::Permanent {
            operation,
            source: Box::new(err),
        },
    }
}

fn to_sdk_part_number(operation: &'static str, part_number: u32) -> Result<i32, StoreError> {
    i32::try_from(part_number).map_err(|e| StoreError::Permanent {
        operation,
        source: Box::new(e),
    })
}
