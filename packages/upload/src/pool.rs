//! Bounded-concurrency task executor with cooperative cancellation.
//!
//! A fixed number of worker tasks pull jobs from a shared queue and run
//! each to completion before taking the next. Workers never observe
//! process signals; the pool owner cancels them through a
//! [`CancellationToken`].

use std::collections::VecDeque;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Results collected by [`WorkerPool::run`].
#[derive(Debug)]
pub struct PoolRun<T> {
    /// Results in completion order. Incomplete if `cancelled` is set or a
    /// task panicked.
    pub results: Vec<T>,
    /// The run was cut short by cancellation.
    pub cancelled: bool,
}

/// Runs jobs on at most `concurrency` workers at once.
pub struct WorkerPool {
    concurrency: NonZeroUsize,
    cancel: CancellationToken,
}

impl WorkerPool {
    /// Creates a pool that stops when `cancel` is triggered.
    #[must_use]
    pub const fn new(concurrency: NonZeroUsize, cancel: CancellationToken) -> Self {
        Self {
            concurrency,
            cancel,
        }
    }

    /// Runs every job and blocks until all have finished or the pool is
    /// cancelled.
    ///
    /// On cancellation no further jobs are started, in-flight jobs are
    /// aborted, and whatever results were already produced are returned.
    pub async fn run<T, F, Fut>(&self, jobs: Vec<F>) -> PoolRun<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let total = jobs.len();
        let queue = Arc::new(Mutex::new(jobs.into_iter().collect::<VecDeque<_>>()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut workers = JoinSet::new();

        for worker in 0..self.concurrency.get().min(total) {
            let queue = Arc::clone(&queue);
            let tx = tx.clone();
            let cancel = self.cancel.clone();

            workers.spawn(async move {
                loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let Some(job) = next_job(&queue) else {
                        break;
                    };
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => break,
                        result = job() => {
                            if tx.send(result).is_err() {
                                break;
                            }
                        }
                    }
                }
                log::debug!("worker {worker} exiting");
            });
        }
        drop(tx);

        let mut results = Vec::with_capacity(total);
        let cancelled = loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    log::warn!("Cancelling {} in-flight upload worker(s)", workers.len());
                    workers.abort_all();
                    break true;
                }
                received = rx.recv() => match received {
                    Some(result) => results.push(result),
                    None => break false,
                },
            }
        };

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined
                && e.is_panic()
            {
                log::error!("upload worker panicked: {e}");
            }
        }
        while let Ok(result) = rx.try_recv() {
            results.push(result);
        }

        PoolRun { results, cancelled }
    }
}

fn next_job<F>(queue: &Mutex<VecDeque<F>>) -> Option<F> {
    queue
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .pop_front()
}
