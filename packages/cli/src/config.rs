//! Run configuration: built-in defaults, an optional TOML settings file,
//! and command-line flags, in increasing order of precedence.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chunkpush_s3::S3Options;
use chunkpush_upload_models::{
    Backoff, DEFAULT_CHUNK_SIZE, DEFAULT_CONCURRENCY, FailurePolicy, RetryPolicy, UploadConfig,
    UploadTarget,
};
use serde::Deserialize;

use crate::Cli;

/// Default append-only log file.
pub const DEFAULT_LOG_FILE: &str = "/var/log/chunkpush.log";

const MIB: u64 = 1024 * 1024;

/// Smallest part size S3 accepts for every part but the last.
const S3_MIN_PART_SIZE: u64 = 5 * MIB;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Can't read settings file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid settings file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Contents of a `--config` TOML file. Every field is optional.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub concurrency: Option<usize>,
    pub chunk_size_mib: Option<u64>,
    pub max_retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub max_retry_delay_ms: Option<u64>,
    pub backoff: Option<Backoff>,
    pub on_failure: Option<FailurePolicy>,
    pub remove_source: Option<bool>,
    pub verify_remote: Option<bool>,
    pub lock_file: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub s3: S3Settings,
}

/// `[s3]` table of the settings file.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct S3Settings {
    pub region: Option<String>,
    pub endpoint_url: Option<String>,
    pub force_path_style: Option<bool>,
}

impl Settings {
    /// Reads and parses a settings file.
    ///
    /// # Errors
    ///
    /// * [`ConfigError::Read`] if the file cannot be read
    /// * [`ConfigError::Parse`] if it is not valid settings TOML
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Everything the upload run needs, after merging and validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub upload: UploadConfig,
    pub s3: S3Options,
}

#[must_use]
pub fn log_file(cli: &Cli, settings: &Settings) -> PathBuf {
    cli.log_file
        .clone()
        .or_else(|| settings.log_file.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_FILE))
}

#[must_use]
pub fn lock_file(cli: &Cli, settings: &Settings) -> PathBuf {
    cli.lock_file
        .clone()
        .or_else(|| settings.lock_file.clone())
        .unwrap_or_else(chunkpush_run_lock::default_lock_path)
}

/// Merges `settings` under the command-line flags and validates the
/// result.
///
/// # Errors
///
/// * [`ConfigError::Invalid`] if concurrency or chunk size is zero, the
///   chunk size overflows, or the source path is not a directory
pub fn resolve(cli: &Cli, settings: Settings) -> Result<Resolved, ConfigError> {
    let concurrency = cli
        .concurrency
        .or(settings.concurrency)
        .unwrap_or(DEFAULT_CONCURRENCY);
    let concurrency = NonZeroUsize::new(concurrency)
        .ok_or_else(|| ConfigError::Invalid("concurrency must be at least 1".to_string()))?;

    let chunk_size = match cli.chunk_size_mib.or(settings.chunk_size_mib) {
        Some(0) => {
            return Err(ConfigError::Invalid(
                "chunk size must be at least 1 MiB".to_string(),
            ));
        }
        Some(mib) => mib
            .checked_mul(MIB)
            .ok_or_else(|| ConfigError::Invalid(format!("chunk size of {mib} MiB is too large")))?,
        None => DEFAULT_CHUNK_SIZE,
    };
    if chunk_size < S3_MIN_PART_SIZE {
        log::warn!(
            "Chunk size {} MiB is below the 5 MiB minimum S3 accepts for non-final parts",
            chunk_size / MIB
        );
    }

    if !cli.source_path.is_dir() {
        return Err(ConfigError::Invalid(format!(
            "source path {} is not a directory",
            cli.source_path.display()
        )));
    }

    let defaults = RetryPolicy::default();
    let retry = RetryPolicy {
        max_retries: cli
            .max_retries
            .or(settings.max_retries)
            .unwrap_or(defaults.max_retries),
        base_delay: cli
            .retry_delay_ms
            .or(settings.retry_delay_ms)
            .map_or(defaults.base_delay, Duration::from_millis),
        max_delay: cli
            .max_retry_delay_ms
            .or(settings.max_retry_delay_ms)
            .map_or(defaults.max_delay, Duration::from_millis),
        backoff: cli.backoff.or(settings.backoff).unwrap_or_default(),
    };

    let mut upload = UploadConfig::new(UploadTarget::new(
        cli.bucket.clone(),
        cli.key_prefix.clone(),
        cli.source_path.clone(),
        &cli.file_extension,
    ));
    upload.concurrency = concurrency;
    upload.chunk_size = chunk_size;
    upload.retry = retry;
    upload.on_failure = cli.on_failure.or(settings.on_failure).unwrap_or_default();
    upload.remove_source = !cli.keep_source && settings.remove_source.unwrap_or(true);
    upload.verify_remote = !cli.no_verify_remote && settings.verify_remote.unwrap_or(true);

    if upload.target.extension.is_empty() {
        return Err(ConfigError::Invalid(
            "file extension must not be empty".to_string(),
        ));
    }

    let s3 = S3Options {
        region: cli.region.clone().or(settings.s3.region),
        endpoint_url: cli.endpoint_url.clone().or(settings.s3.endpoint_url),
        force_path_style: cli.force_path_style || settings.s3.force_path_style.unwrap_or(false),
    };

    Ok(Resolved { upload, s3 })
}
