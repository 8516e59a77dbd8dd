#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! `chunkpush`: uploads every file with a given extension from a local
//! directory to an S3-compatible bucket using chunked multipart uploads.
//!
//! Only one instance runs at a time (guarded by a PID lock file). Each
//! file is uploaded in parallel parts with bounded retries, committed
//! only when every part landed, and removed locally once committed.
//!
//! Exit codes:
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0    | every matching file was uploaded |
//! | 1    | an upload was aborted or the run failed |
//! | 2    | invalid arguments or settings |
//! | 3    | another instance is running |
//! | 4    | no matching files |
//! | 130  | interrupted |

mod config;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use chunkpush_cli_utils::{IndicatifProgressFactory, MultiProgress};
use chunkpush_run_lock::{LockError, RunLock};
use chunkpush_s3::S3Store;
use chunkpush_upload::BatchDriver;
use chunkpush_upload_models::{Backoff, BatchOutcome, BatchReport, FailurePolicy};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use crate::config::Settings;

const EXIT_SUCCESS: u8 = 0;
const EXIT_FAILURE: u8 = 1;
const EXIT_USAGE: u8 = 2;
const EXIT_LOCK_CONFLICT: u8 = 3;
const EXIT_NOTHING_TO_DO: u8 = 4;
const EXIT_CANCELLED: u8 = 130;

#[derive(Parser, Debug)]
#[command(
    name = "chunkpush",
    version,
    about = "Upload files to an S3-compatible bucket with chunked multipart uploads"
)]
pub struct Cli {
    /// Destination bucket
    pub bucket: String,
    /// Prepended verbatim to each file name to form its object key
    pub key_prefix: String,
    /// Directory containing the files to upload
    pub source_path: PathBuf,
    /// Upload only files ending in `.<ext>` (a leading dot is ignored)
    pub file_extension: String,
    /// Parts uploaded in parallel per file [default: 4]
    pub concurrency: Option<usize>,

    /// Part size in MiB [default: 50]
    #[arg(long)]
    pub chunk_size_mib: Option<u64>,
    /// Retries per part after a transient failure [default: 10]
    #[arg(long)]
    pub max_retries: Option<u32>,
    /// Delay before the first retry, in milliseconds [default: 1000]
    #[arg(long)]
    pub retry_delay_ms: Option<u64>,
    /// Upper bound for a single retry delay, in milliseconds [default: 30000]
    #[arg(long)]
    pub max_retry_delay_ms: Option<u64>,
    /// Retry delay growth: `exponential` or `linear`
    #[arg(long)]
    pub backoff: Option<Backoff>,
    /// After an aborted upload: `continue` with the next file or `stop`
    #[arg(long)]
    pub on_failure: Option<FailurePolicy>,
    /// Keep local files after they are uploaded
    #[arg(long)]
    pub keep_source: bool,
    /// Skip the remote part listing check before committing
    #[arg(long)]
    pub no_verify_remote: bool,
    /// PID lock file [default: <temp dir>/chunkpush.pid]
    #[arg(long)]
    pub lock_file: Option<PathBuf>,
    /// Append-only log file [default: /var/log/chunkpush.log]
    #[arg(long)]
    pub log_file: Option<PathBuf>,
    /// TOML settings file; command-line flags take precedence
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Custom S3 endpoint (`MinIO`, R2, ...)
    #[arg(long)]
    pub endpoint_url: Option<String>,
    /// AWS region, overriding the provider chain
    #[arg(long)]
    pub region: Option<String>,
    /// Use path-style bucket addressing
    #[arg(long)]
    pub force_path_style: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            if !e.use_stderr() {
                // --help / --version
                return ExitCode::SUCCESS;
            }
            let _multi = chunkpush_cli_utils::init_logger(Some(Path::new(config::DEFAULT_LOG_FILE)));
            log::error!("Invalid arguments: {}", e.to_string().trim_end());
            return ExitCode::from(EXIT_USAGE);
        }
    };

    let (settings, settings_error) = match cli.config.as_deref().map(Settings::load).transpose() {
        Ok(settings) => (settings.unwrap_or_default(), None),
        Err(e) => (Settings::default(), Some(e)),
    };

    let multi = chunkpush_cli_utils::init_logger(Some(&config::log_file(&cli, &settings)));

    if let Some(e) = settings_error {
        log::error!("{e}");
        return ExitCode::from(EXIT_USAGE);
    }

    let lock = match RunLock::acquire(config::lock_file(&cli, &settings)) {
        Ok(lock) => lock,
        Err(e @ LockError::Conflict { .. }) => {
            log::error!("{e}");
            return ExitCode::from(EXIT_LOCK_CONFLICT);
        }
        Err(e) => {
            log::error!("{e}");
            return ExitCode::from(EXIT_FAILURE);
        }
    };
    log::info!("Acquired lock {}", lock.path().display());

    let cancel = CancellationToken::new();
    let code = tokio::select! {
        code = run(&cli, settings, multi, cancel.clone()) => code,
        () = watch_interrupt(cancel.clone(), tokio::signal::ctrl_c) => EXIT_CANCELLED,
    };

    if let Err(e) = lock.release() {
        log::warn!("Failed to release lock: {e}");
    }
    log::info!("chunkpush finished with exit code {code}");

    ExitCode::from(code)
}

async fn run(
    cli: &Cli,
    settings: Settings,
    multi: MultiProgress,
    cancel: CancellationToken,
) -> u8 {
    let resolved = match config::resolve(cli, settings) {
        Ok(resolved) => resolved,
        Err(e) => {
            log::error!("{e}");
            return EXIT_USAGE;
        }
    };
    if cancel.is_cancelled() {
        log::warn!("Interrupted before the upload started");
        return EXIT_CANCELLED;
    }

    let target = &resolved.upload.target;
    log::info!(
        "Uploading .{} files from {} to {}/{} ({} parts in parallel, {} byte chunks)",
        target.extension,
        target.source_dir.display(),
        target.bucket,
        target.key_prefix,
        resolved.upload.concurrency,
        resolved.upload.chunk_size,
    );

    // Credential lookup can take a while; stay interruptible.
    let store = tokio::select! {
        biased;
        () = cancel.cancelled() => {
            log::warn!("Interrupted before the upload started");
            return EXIT_CANCELLED;
        }
        store = S3Store::connect(&resolved.s3) => Arc::new(store),
    };

    let driver = BatchDriver::new(store, Arc::new(resolved.upload), cancel)
        .with_progress(Arc::new(IndicatifProgressFactory::new(multi)));
    let result = driver.run().await;

    match result {
        Ok(report) => {
            log::info!("Summary: {report}");
            exit_code(&report)
        }
        Err(e) => {
            log::error!("{e}");
            EXIT_FAILURE
        }
    }
}

/// Cancels `cancel` on the first interrupt and returns on the second.
///
/// Only this future listens for the signal; the upload workers only see
/// the token. Returning makes `main` drop the run, so a cleanup stuck in
/// backend retries cannot keep the process (and its lock) alive.
async fn watch_interrupt<F, Fut>(cancel: CancellationToken, mut interrupt: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<()>>,
{
    if let Err(e) = interrupt().await {
        log::error!("Can't listen for interrupts: {e}");
        return std::future::pending().await;
    }
    log::warn!("Interrupt received, aborting the upload in progress (interrupt again to exit now)");
    cancel.cancel();

    if let Err(e) = interrupt().await {
        log::error!("Can't listen for interrupts: {e}");
        return std::future::pending().await;
    }
    log::error!("Second interrupt received, exiting without waiting for cleanup");
}

fn exit_code(report: &BatchReport) -> u8 {
    match report.outcome() {
        BatchOutcome::AllCompleted => EXIT_SUCCESS,
        BatchOutcome::NothingToDo => EXIT_NOTHING_TO_DO,
        BatchOutcome::SomeAborted => EXIT_FAILURE,
        BatchOutcome::Cancelled => EXIT_CANCELLED,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chunkpush_upload_models::{SessionReport, SessionState};

    use super::*;

    fn session(state: SessionState) -> SessionReport {
        SessionReport {
            path: PathBuf::from("/data/a.gz"),
            key: "p/a.gz".to_string(),
            size: 10,
            parts_planned: 1,
            state,
            failed_parts: Vec::new(),
            cancelled: false,
            source_removed: state == SessionState::Completed,
        }
    }

    #[test]
    fn exit_codes_are_distinct_per_outcome() {
        let nothing = BatchReport::default();
        let done = BatchReport {
            eligible: 1,
            sessions: vec![session(SessionState::Completed)],
            ..BatchReport::default()
        };
        let aborted = BatchReport {
            eligible: 2,
            sessions: vec![
                session(SessionState::Aborted),
                session(SessionState::Completed),
            ],
            ..BatchReport::default()
        };
        let cancelled = BatchReport {
            eligible: 2,
            sessions: vec![session(SessionState::Aborted)],
            cancelled: true,
            ..BatchReport::default()
        };

        assert_eq!(exit_code(&nothing), EXIT_NOTHING_TO_DO);
        assert_eq!(exit_code(&done), EXIT_SUCCESS);
        assert_eq!(exit_code(&aborted), EXIT_FAILURE);
        assert_eq!(exit_code(&cancelled), EXIT_CANCELLED);
    }

    /// Interrupts delivered on demand through a channel.
    fn scripted_interrupts() -> (
        tokio::sync::mpsc::UnboundedSender<()>,
        impl FnMut() -> std::pin::Pin<Box<dyn Future<Output = std::io::Result<()>> + Send>>,
    ) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<()>();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let next = move || {
            let rx = Arc::clone(&rx);
            Box::pin(async move {
                rx.lock().await.recv().await;
                Ok(())
            }) as std::pin::Pin<Box<dyn Future<Output = std::io::Result<()>> + Send>>
        };
        (tx, next)
    }

    #[tokio::test]
    async fn first_interrupt_cancels_second_ends_the_watch() {
        let cancel = CancellationToken::new();
        let (tx, next) = scripted_interrupts();
        let watch = tokio::spawn(watch_interrupt(cancel.clone(), next));

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), cancel.cancelled())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!watch.is_finished());

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), watch)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn interrupt_before_connect_exits_cancelled() {
        let dir = std::env::temp_dir().join(format!("chunkpush_cli_early_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let cli = Cli::try_parse_from(["chunkpush", "bucket", "p/", dir.to_str().unwrap(), "gz"])
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let multi = MultiProgress::with_draw_target(chunkpush_cli_utils::ProgressDrawTarget::hidden());

        let code = run(&cli, Settings::default(), multi, cancel).await;

        assert_eq!(code, EXIT_CANCELLED);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn fewer_than_four_positionals_is_a_usage_error() {
        let err = Cli::try_parse_from(["chunkpush", "bucket", "prefix/", "/data"]).unwrap_err();
        assert!(err.use_stderr());
    }

    #[test]
    fn parses_policies_by_name() {
        let cli = Cli::try_parse_from([
            "chunkpush",
            "bucket",
            "prefix/",
            "/data",
            "gz",
            "--backoff",
            "linear",
            "--on-failure",
            "stop",
        ])
        .unwrap();

        assert_eq!(cli.backoff, Some(Backoff::Linear));
        assert_eq!(cli.on_failure, Some(FailurePolicy::Stop));
        assert_eq!(cli.concurrency, None);
    }
}
