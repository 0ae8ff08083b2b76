// src/session.rs

use crate::error::{TransferError, UploadError};
use crate::executor::{ChunkTransferExecutor, TransferConfig, TransferOutcome};
use crate::models::{
    ChunkDescriptor, FileFingerprint, QueuedFile, UploadObserver, UploadResult,
    UploadSessionRecord, UploadState,
};
use crate::planner::plan_chunks;
use crate::progress::ProgressAggregator;
use crate::service::{NewSessionRequest, UploadService};
use crate::source::ChunkSource;
use crate::store::SessionStore;
use std::collections::BTreeSet;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How one full `run` of a file ended. Failure is the `Err` side.
#[derive(Debug)]
pub enum UploadOutcome {
    Completed(UploadResult),
    /// Chunk progress and the local session record are preserved.
    Paused,
    /// The local record was dropped and a server-side discard requested.
    Cancelled,
}

struct Prepared {
    session_id: String,
    plan: Vec<ChunkDescriptor>,
    uploaded: BTreeSet<usize>,
}

/// Drives one file through
/// `Preparing -> Uploading -> Completing -> Completed`, resuming a prior
/// session when the local store holds one and the server still knows it.
/// The server's uploaded-chunk set is authoritative; the local record is
/// only a hint.
pub struct UploadSession {
    service: Arc<dyn UploadService>,
    store: Arc<SessionStore>,
    config: TransferConfig,
    observer: Arc<dyn UploadObserver>,
}

impl UploadSession {
    pub fn new(
        service: Arc<dyn UploadService>,
        store: Arc<SessionStore>,
        config: TransferConfig,
        observer: Arc<dyn UploadObserver>,
    ) -> Self {
        Self {
            service,
            store,
            config,
            observer,
        }
    }

    /// Runs the file to a settled outcome, updating `entry` at every
    /// state transition. The pause flag stops new dispatch and keeps the
    /// session; the cancellation token aborts in-flight requests and
    /// discards it.
    pub async fn run(
        &self,
        source: Arc<dyn ChunkSource>,
        entry: Arc<Mutex<QueuedFile>>,
        pause_flag: Arc<AtomicBool>,
        cancel_token: CancellationToken,
    ) -> Result<UploadOutcome, UploadError> {
        let fingerprint = source.fingerprint();
        set_state(&entry, UploadState::Preparing).await;

        let mut restarted = false;
        loop {
            let prepared = match self.prepare(&source, &fingerprint).await {
                Ok(prepared) => prepared,
                Err(err) => return self.fail(&entry, err).await,
            };

            let resumed_chunks = prepared.uploaded.len();
            let baseline: u64 = prepared
                .plan
                .iter()
                .filter(|c| prepared.uploaded.contains(&c.index))
                .map(|c| c.length as u64)
                .sum();
            let aggregator =
                ProgressAggregator::resume_from(source.size(), baseline, resumed_chunks);
            {
                let mut file = entry.lock().await;
                file.session_id = Some(prepared.session_id.clone());
                file.state = UploadState::Uploading;
                file.progress = aggregator.snapshot();
            }

            let uploaded = Arc::new(Mutex::new(prepared.uploaded));
            let progress = Arc::new(Mutex::new(aggregator));
            let executor = ChunkTransferExecutor::new(
                self.service.clone(),
                source.clone(),
                self.config.clone(),
            );
            let outcome = executor
                .run(
                    &prepared.session_id,
                    &prepared.plan,
                    uploaded,
                    progress,
                    entry.clone(),
                    self.observer.clone(),
                    pause_flag.clone(),
                    cancel_token.clone(),
                )
                .await;

            match outcome {
                Ok(TransferOutcome::Completed) => {
                    return self
                        .complete(&entry, &fingerprint, &prepared.session_id)
                        .await;
                }
                Ok(TransferOutcome::Paused) => {
                    info!(name = %fingerprint.name, "upload paused, progress preserved");
                    set_state(&entry, UploadState::Paused).await;
                    return Ok(UploadOutcome::Paused);
                }
                Ok(TransferOutcome::Cancelled) => {
                    self.store.delete(&fingerprint).await?;
                    if let Err(err) = self.service.cancel_session(&prepared.session_id).await {
                        debug!(error = %err, "server-side session discard failed");
                    }
                    let mut file = entry.lock().await;
                    file.state = UploadState::Idle;
                    file.session_id = None;
                    return Ok(UploadOutcome::Cancelled);
                }
                Ok(TransferOutcome::SessionExpired) => {
                    self.store.delete(&fingerprint).await?;
                    if restarted {
                        let err = UploadError::Session(TransferError::SessionExpired);
                        return self.fail(&entry, err).await;
                    }
                    restarted = true;
                    warn!(name = %fingerprint.name, "server discarded the session, starting fresh");
                    let mut file = entry.lock().await;
                    file.state = UploadState::Preparing;
                    file.session_id = None;
                }
                Err(err) => return self.fail(&entry, err).await,
            }
        }
    }

    /// Resume a known session if the server still has it, otherwise open
    /// a fresh one and persist the record before any chunk I/O.
    async fn prepare(
        &self,
        source: &Arc<dyn ChunkSource>,
        fingerprint: &FileFingerprint,
    ) -> Result<Prepared, UploadError> {
        if let Some(record) = self.store.get(fingerprint).await? {
            let plan = plan_chunks(source.size(), record.chunk_size);
            if plan.len() == record.total_chunks {
                match self.service.session_status(&record.session_id).await {
                    Ok(status) => {
                        let uploaded: BTreeSet<usize> = status
                            .uploaded_chunk_indices
                            .into_iter()
                            .filter(|i| *i < plan.len())
                            .collect();
                        debug!(
                            session_id = %record.session_id,
                            stored = uploaded.len(),
                            total = plan.len(),
                            "resuming prior session"
                        );
                        return Ok(Prepared {
                            session_id: record.session_id,
                            plan,
                            uploaded,
                        });
                    }
                    Err(TransferError::SessionExpired) => {
                        self.store.delete(fingerprint).await?;
                    }
                    Err(err) => return Err(UploadError::Session(err)),
                }
            } else {
                // Record no longer matches the file; treat as absent.
                self.store.delete(fingerprint).await?;
            }
        }

        let chunk_size = self.config.chunk_size;
        let plan = plan_chunks(source.size(), chunk_size);
        let request = NewSessionRequest {
            fingerprint: fingerprint.clone(),
            total_size: source.size(),
            chunk_size,
            mime_type: source.mime_type().to_string(),
            filename: source.name().to_string(),
        };
        let handle = self
            .service
            .create_session(&request)
            .await
            .map_err(UploadError::Session)?;
        let record = UploadSessionRecord::new(
            fingerprint.clone(),
            handle.session_id.clone(),
            chunk_size,
            plan.len(),
        );
        self.store.put(&record).await?;
        let uploaded = handle
            .uploaded_chunk_indices
            .into_iter()
            .filter(|i| *i < plan.len())
            .collect();
        Ok(Prepared {
            session_id: handle.session_id,
            plan,
            uploaded,
        })
    }

    async fn complete(
        &self,
        entry: &Arc<Mutex<QueuedFile>>,
        fingerprint: &FileFingerprint,
        session_id: &str,
    ) -> Result<UploadOutcome, UploadError> {
        set_state(entry, UploadState::Completing).await;
        match self.service.finalize(session_id).await {
            Ok(result) => {
                self.store.delete(fingerprint).await?;
                info!(name = %fingerprint.name, url = %result.url, "upload completed");
                let mut file = entry.lock().await;
                file.state = UploadState::Completed;
                file.result = Some(result.clone());
                Ok(UploadOutcome::Completed(result))
            }
            // Record retained: a retry re-enters Preparing, finds every
            // chunk stored and runs finalize alone.
            Err(err) => self.fail(entry, UploadError::Finalize(err)).await,
        }
    }

    async fn fail(
        &self,
        entry: &Arc<Mutex<QueuedFile>>,
        err: UploadError,
    ) -> Result<UploadOutcome, UploadError> {
        warn!(error = %err, "upload failed");
        self.observer.on_error(&err);
        let mut file = entry.lock().await;
        file.state = UploadState::Error;
        file.last_error = Some(err.to_string());
        Err(err)
    }
}

async fn set_state(entry: &Arc<Mutex<QueuedFile>>, state: UploadState) {
    entry.lock().await.state = state;
}
