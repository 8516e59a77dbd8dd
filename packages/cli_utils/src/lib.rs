#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Shared CLI utilities for chunkpush.
//!
//! Provides `indicatif`-backed byte progress bars behind the upload
//! engine's [`ProgressCallback`] / [`ProgressFactory`] traits, plus
//! [`init_logger`] which sets up `indicatif-log-bridge` so that
//! `log::info!` and friends are suspended while progress bars redraw.
//! Log records can additionally be appended to a log file.

use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use chunkpush_upload::{ProgressCallback, ProgressFactory};
use indicatif::{ProgressBar, ProgressStyle};

pub use indicatif::{MultiProgress, ProgressDrawTarget};

/// An `indicatif` [`ProgressBar`] that implements [`ProgressCallback`].
pub struct IndicatifProgress {
    bar: ProgressBar,
}

impl IndicatifProgress {
    /// Creates a byte-count bar for one file upload of `total` bytes.
    #[must_use]
    pub fn bytes_bar(multi: &MultiProgress, message: &str, total: u64) -> Arc<dyn ProgressCallback> {
        let bar = multi.add(ProgressBar::new(total));
        bar.set_style(
            ProgressStyle::with_template(
                "{msg} {wide_bar:.green/dim} {bytes}/{total_bytes} {binary_bytes_per_sec} [{eta}]",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-"),
        );
        bar.set_message(message.to_string());

        Arc::new(Self { bar })
    }
}

impl ProgressCallback for IndicatifProgress {
    fn inc(&self, delta: u64) {
        self.bar.inc(delta);
    }

    fn finish(&self, msg: String) {
        self.bar.finish_with_message(msg);
    }

    fn finish_and_clear(&self) {
        self.bar.finish_and_clear();
    }
}

/// Hands out one [`IndicatifProgress`] bar per file.
#[derive(Clone)]
pub struct IndicatifProgressFactory {
    multi: MultiProgress,
}

impl IndicatifProgressFactory {
    #[must_use]
    pub const fn new(multi: MultiProgress) -> Self {
        Self { multi }
    }
}

impl ProgressFactory for IndicatifProgressFactory {
    fn for_file(&self, name: &str, total_bytes: u64) -> Arc<dyn ProgressCallback> {
        IndicatifProgress::bytes_bar(&self.multi, name, total_bytes)
    }
}

/// Forwards every record to `inner` and appends a plain-text copy to a
/// file.
struct TeeLogger<L> {
    inner: L,
    file: Mutex<File>,
}

impl<L: log::Log> log::Log for TeeLogger<L> {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        self.inner.enabled(metadata)
    }

    fn log(&self, record: &log::Record<'_>) {
        if !self.inner.enabled(record.metadata()) {
            return;
        }
        self.inner.log(record);

        let line = format_file_line(
            &chrono::Local::now().to_rfc3339(),
            record.level(),
            record.target(),
            record.args(),
        );
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        // Nowhere left to report a failing log sink.
        let _ = file.write_all(line.as_bytes());
    }

    fn flush(&self) {
        self.inner.flush();
        let _ = self
            .file
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush();
    }
}

fn format_file_line(
    timestamp: &str,
    level: log::Level,
    target: &str,
    message: &std::fmt::Arguments<'_>,
) -> String {
    format!("{timestamp} {level} {target}: {message}\n")
}

/// Initializes the global logger wrapped in `indicatif-log-bridge` so that
/// `log::info!` and friends are suspended while progress bars redraw.
///
/// The console filter comes from `RUST_LOG` and defaults to `info`. When
/// `log_file` is given, records passing the filter are also appended to
/// it; if the file cannot be opened a warning is logged and only the
/// console receives output.
///
/// Returns the [`MultiProgress`] that all progress bars must be added to.
#[must_use]
pub fn init_logger(log_file: Option<&Path>) -> MultiProgress {
    let multi = MultiProgress::new();

    // Build the pretty-env-logger logger manually so we can wrap it.
    let mut builder = pretty_env_logger::formatted_builder();
    builder
        .filter_level(log::LevelFilter::Info)
        .parse_env("RUST_LOG");
    let logger = builder.build();
    let level = logger.filter();

    let file = log_file.map(|path| {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| (path, e))
    });

    let mut open_error = None;
    let installed = match file {
        Some(Ok(file)) => {
            let tee = TeeLogger {
                inner: logger,
                file: Mutex::new(file),
            };
            indicatif_log_bridge::LogWrapper::new(multi.clone(), tee).try_init()
        }
        Some(Err((path, e))) => {
            open_error = Some(format!("Can't open log file {}: {e}", path.display()));
            indicatif_log_bridge::LogWrapper::new(multi.clone(), logger).try_init()
        }
        None => indicatif_log_bridge::LogWrapper::new(multi.clone(), logger).try_init(),
    };
    installed.ok(); // Ignore error if logger was already set (e.g., in tests)

    log::set_max_level(level);

    if let Some(message) = open_error {
        log::warn!("{message}; logging to the console only");
    }

    multi
}
