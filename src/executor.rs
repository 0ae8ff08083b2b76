// src/executor.rs

use crate::error::{TransferError, UploadError};
use crate::models::{ChunkDescriptor, QueuedFile, UploadObserver};
use crate::progress::ProgressAggregator;
use crate::service::UploadService;
use crate::source::ChunkSource;
use futures_util::future::join_all;
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Retry, backoff and concurrency settings for one file's transfer.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Chunk requests in flight simultaneously for one file.
    pub concurrency: usize,
    pub chunk_size: u32,
    /// Transient failures per chunk before the session fails.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            chunk_size: 4 * 1024 * 1024,
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// How a transfer run ended when it did not fail outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Every chunk in the plan is confirmed stored.
    Completed,
    /// Stopped on the pause flag; the session record stays behind.
    Paused,
    /// Stopped on the cancellation token; the caller discards the session.
    Cancelled,
    /// The server no longer knows this session; a fresh one is required.
    SessionExpired,
}

enum ChunkAttempt {
    Done,
    /// Pause or cancel was noticed mid-chunk; the worker winds down.
    Interrupted,
}

/// Transfers all not-yet-uploaded chunks of one file with a fixed-size
/// worker pool. Workers pull from a shared pending queue, so completion
/// order is unordered; only the set of uploaded indices matters.
pub struct ChunkTransferExecutor {
    service: Arc<dyn UploadService>,
    source: Arc<dyn ChunkSource>,
    config: TransferConfig,
}

struct Shared {
    service: Arc<dyn UploadService>,
    source: Arc<dyn ChunkSource>,
    config: TransferConfig,
    session_id: String,
    pending: Mutex<VecDeque<ChunkDescriptor>>,
    uploaded: Arc<Mutex<BTreeSet<usize>>>,
    progress: Arc<Mutex<ProgressAggregator>>,
    entry: Arc<Mutex<QueuedFile>>,
    observer: Arc<dyn UploadObserver>,
    pause_flag: Arc<AtomicBool>,
    cancel_token: CancellationToken,
    /// Internal brake: set on failure or expiry so the other workers
    /// stop dispatching.
    stop: CancellationToken,
    failure: Mutex<Option<UploadError>>,
    expired: AtomicBool,
}

impl ChunkTransferExecutor {
    pub fn new(
        service: Arc<dyn UploadService>,
        source: Arc<dyn ChunkSource>,
        config: TransferConfig,
    ) -> Self {
        Self {
            service,
            source,
            config,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        &self,
        session_id: &str,
        plan: &[ChunkDescriptor],
        uploaded: Arc<Mutex<BTreeSet<usize>>>,
        progress: Arc<Mutex<ProgressAggregator>>,
        entry: Arc<Mutex<QueuedFile>>,
        observer: Arc<dyn UploadObserver>,
        pause_flag: Arc<AtomicBool>,
        cancel_token: CancellationToken,
    ) -> Result<TransferOutcome, UploadError> {
        let total = plan.len();
        let pending: VecDeque<ChunkDescriptor> = {
            let done = uploaded.lock().await;
            plan.iter()
                .filter(|c| !done.contains(&c.index))
                .copied()
                .collect()
        };

        if pending.is_empty() {
            // Resumed with everything already stored server-side.
            return Ok(TransferOutcome::Completed);
        }

        debug!(
            session_id,
            total,
            pending = pending.len(),
            concurrency = self.config.concurrency,
            "starting chunk transfer"
        );

        let worker_count = self.config.concurrency.max(1).min(pending.len());
        let shared = Arc::new(Shared {
            service: self.service.clone(),
            source: self.source.clone(),
            config: self.config.clone(),
            session_id: session_id.to_string(),
            pending: Mutex::new(pending),
            uploaded: uploaded.clone(),
            progress,
            entry,
            observer,
            pause_flag: pause_flag.clone(),
            cancel_token: cancel_token.clone(),
            stop: CancellationToken::new(),
            failure: Mutex::new(None),
            expired: AtomicBool::new(false),
        });

        let handles: Vec<JoinHandle<()>> = (0..worker_count)
            .map(|_| {
                let shared = shared.clone();
                tokio::spawn(Self::worker(shared))
            })
            .collect();
        for result in join_all(handles).await {
            if let Err(err) = result {
                warn!(error = %err, "chunk worker aborted");
            }
        }

        if shared.expired.load(Ordering::SeqCst) {
            return Ok(TransferOutcome::SessionExpired);
        }
        if let Some(err) = shared.failure.lock().await.take() {
            return Err(err);
        }
        if uploaded.lock().await.len() >= total {
            return Ok(TransferOutcome::Completed);
        }
        if cancel_token.is_cancelled() {
            return Ok(TransferOutcome::Cancelled);
        }
        Ok(TransferOutcome::Paused)
    }

    async fn worker(shared: Arc<Shared>) {
        loop {
            if shared.cancel_token.is_cancelled()
                || shared.stop.is_cancelled()
                || shared.pause_flag.load(Ordering::SeqCst)
            {
                break;
            }
            let chunk = { shared.pending.lock().await.pop_front() };
            let Some(chunk) = chunk else { break };

            match Self::transfer_chunk(&shared, chunk).await {
                Ok(ChunkAttempt::Done) => {
                    shared.uploaded.lock().await.insert(chunk.index);
                    // Record and notify under one lock so observers see a
                    // monotonic snapshot sequence.
                    let mut progress = shared.progress.lock().await;
                    let snapshot = progress.record_chunk(chunk.length);
                    shared.entry.lock().await.progress = snapshot;
                    shared.observer.on_progress(&snapshot);
                }
                Ok(ChunkAttempt::Interrupted) => break,
                Err(err) => {
                    if matches!(
                        err,
                        UploadError::Transfer {
                            source: TransferError::SessionExpired,
                            ..
                        }
                    ) {
                        shared.expired.store(true, Ordering::SeqCst);
                    } else {
                        let mut failure = shared.failure.lock().await;
                        if failure.is_none() {
                            *failure = Some(err);
                        }
                    }
                    shared.stop.cancel();
                    break;
                }
            }
        }
    }

    /// One chunk, including its whole retry budget. A hard cancel aborts
    /// the in-flight request at the transport layer; a pause lets it
    /// finish and stops before the next dispatch.
    async fn transfer_chunk(
        shared: &Shared,
        chunk: ChunkDescriptor,
    ) -> Result<ChunkAttempt, UploadError> {
        let payload = shared.source.read_chunk(&chunk).await?;
        let mut attempt: u32 = 0;
        loop {
            let result = tokio::select! {
                res = shared.service.upload_chunk(
                    &shared.session_id,
                    chunk.index,
                    chunk.offset,
                    payload.clone(),
                ) => res,
                _ = shared.cancel_token.cancelled() => return Ok(ChunkAttempt::Interrupted),
            };
            match result {
                Ok(()) => return Ok(ChunkAttempt::Done),
                Err(e) if e.is_transient() && attempt < shared.config.max_retries => {
                    attempt += 1;
                    warn!(
                        index = chunk.index,
                        attempt,
                        max_retries = shared.config.max_retries,
                        error = %e,
                        "transient chunk failure, backing off"
                    );
                    shared
                        .observer
                        .on_retry(chunk.index, attempt, shared.config.max_retries, &e);
                    shared.progress.lock().await.record_retry();
                    let delay = backoff_delay(&shared.config, attempt);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shared.cancel_token.cancelled() => return Ok(ChunkAttempt::Interrupted),
                        _ = shared.stop.cancelled() => return Ok(ChunkAttempt::Interrupted),
                    }
                    if shared.pause_flag.load(Ordering::SeqCst) {
                        return Ok(ChunkAttempt::Interrupted);
                    }
                }
                Err(e) => {
                    return Err(UploadError::Transfer {
                        index: chunk.index,
                        attempts: attempt + 1,
                        source: e,
                    });
                }
            }
        }
    }
}

/// `base * 2^(attempt-1)`, capped. `attempt` starts at 1.
fn backoff_delay(config: &TransferConfig, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    config
        .base_delay
        .saturating_mul(1u32 << exp)
        .min(config.max_delay)
}
