// src/queue.rs

use crate::error::UploadError;
use crate::executor::TransferConfig;
use crate::models::{NoopObserver, QueuedFile, UploadObserver, UploadState};
use crate::service::UploadService;
use crate::session::{UploadOutcome, UploadSession};
use crate::source::ChunkSource;
use crate::store::{SessionStore, StoreError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("file with id {0} not found in queue")]
    NotFound(u64),
    #[error("session store error: {0}")]
    Store(#[from] StoreError),
}

/// Enqueue-time validation rules plus the per-file transfer settings.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_file_size: u64,
    /// Lowercased extensions accepted at enqueue time. HEIC/HEIF are
    /// accepted client-side; the post-processing service converts them.
    pub accepted_extensions: Vec<String>,
    pub transfer: TransferConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        let accepted = [
            "jpg", "jpeg", "png", "gif", "webp", "heic", "heif", "mp4", "mov", "webm", "avi",
            "mkv",
        ];
        Self {
            max_file_size: 2 * 1024 * 1024 * 1024,
            accepted_extensions: accepted.iter().map(|s| s.to_string()).collect(),
            transfer: TransferConfig::default(),
        }
    }
}

impl QueueConfig {
    fn validate(&self, name: &str, size: u64) -> Result<(), UploadError> {
        if size == 0 {
            return Err(UploadError::Validation("file is empty".to_string()));
        }
        if size > self.max_file_size {
            return Err(UploadError::Validation(format!(
                "file is {size} bytes, maximum is {}",
                self.max_file_size
            )));
        }
        let ext = name.rsplit_once('.').map(|(_, e)| e).unwrap_or_default();
        if !self
            .accepted_extensions
            .iter()
            .any(|a| a.eq_ignore_ascii_case(ext))
        {
            return Err(UploadError::Validation(format!(
                "unsupported file type: {name:?}"
            )));
        }
        Ok(())
    }
}

/// Aggregate view of one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QueueStats {
    pub total: usize,
    pub pending: usize,
    pub uploading: usize,
    pub completed: usize,
    pub failed: usize,
    /// Weighted average: completed files count 100%, others their
    /// fractional percent.
    pub overall_percent: f64,
}

struct QueueEntry {
    file: Arc<Mutex<QueuedFile>>,
    source: Arc<dyn ChunkSource>,
}

/// Ordered collection of files with independent lifecycles. Files are
/// processed one at a time; concurrency lives inside a single file's
/// chunk transfer. One file failing never halts the rest.
pub struct UploadQueue {
    service: Arc<dyn UploadService>,
    store: Arc<SessionStore>,
    config: QueueConfig,
    observer: Arc<dyn UploadObserver>,
    entries: Mutex<Vec<QueueEntry>>,
    pause_flags: Mutex<HashMap<u64, Arc<AtomicBool>>>,
    cancel_tokens: Mutex<HashMap<u64, CancellationToken>>,
    next_id: AtomicU64,
    // Held while draining so only one file transfers at a time.
    drain_lock: Mutex<()>,
}

impl UploadQueue {
    pub fn new(
        service: Arc<dyn UploadService>,
        store: Arc<SessionStore>,
        config: QueueConfig,
    ) -> Self {
        Self::with_observer(service, store, config, Arc::new(NoopObserver))
    }

    pub fn with_observer(
        service: Arc<dyn UploadService>,
        store: Arc<SessionStore>,
        config: QueueConfig,
        observer: Arc<dyn UploadObserver>,
    ) -> Self {
        Self {
            service,
            store,
            config,
            observer,
            entries: Mutex::new(Vec::new()),
            pause_flags: Mutex::new(HashMap::new()),
            cancel_tokens: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            drain_lock: Mutex::new(()),
        }
    }

    /// Adds a file, validating synchronously. A file failing validation
    /// lands directly in `Error` state and never consumes a processing
    /// turn or a network call.
    pub async fn enqueue(&self, source: Arc<dyn ChunkSource>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut file = QueuedFile::new(
            id,
            source.name().to_string(),
            source.size(),
            source.mime_type().to_string(),
        );
        if let Err(err) = self.config.validate(source.name(), source.size()) {
            warn!(id, name = %file.name, error = %err, "rejected at enqueue");
            self.observer.on_error(&err);
            file.state = UploadState::Error;
            file.last_error = Some(err.to_string());
        } else {
            info!(id, name = %file.name, size = file.size, "queued for upload");
        }
        self.entries.lock().await.push(QueueEntry {
            file: Arc::new(Mutex::new(file)),
            source,
        });
        id
    }

    /// Drains every idle entry in order, one file at a time, and returns
    /// the resulting aggregate stats. Each file's outcome is recorded on
    /// its own entry; the loop never aborts early.
    pub async fn process(&self) -> QueueStats {
        let _guard = self.drain_lock.lock().await;
        loop {
            let next = {
                let entries = self.entries.lock().await;
                let mut found = None;
                for entry in entries.iter() {
                    let file = entry.file.lock().await;
                    if file.state == UploadState::Idle {
                        found = Some((file.id, entry.file.clone(), entry.source.clone()));
                        break;
                    }
                }
                found
            };
            let Some((id, file, source)) = next else { break };
            self.process_one(id, file, source).await;
        }
        self.stats().await
    }

    /// Background drain loop in the style of a long-lived manager task:
    /// spawn it once and entries enqueued (or resumed) later get picked
    /// up automatically. Returns once `shutdown` is cancelled; the file
    /// being transferred at that moment finishes its drain first.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            self.process().await;
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
                _ = shutdown.cancelled() => {
                    info!("queue drain loop stopping");
                    return;
                }
            }
        }
    }

    async fn process_one(
        &self,
        id: u64,
        file: Arc<Mutex<QueuedFile>>,
        source: Arc<dyn ChunkSource>,
    ) {
        let pause_flag = Arc::new(AtomicBool::new(false));
        let cancel_token = CancellationToken::new();
        self.pause_flags.lock().await.insert(id, pause_flag.clone());
        self.cancel_tokens
            .lock()
            .await
            .insert(id, cancel_token.clone());

        let session = UploadSession::new(
            self.service.clone(),
            self.store.clone(),
            self.config.transfer.clone(),
            self.observer.clone(),
        );
        match session.run(source, file, pause_flag, cancel_token).await {
            Ok(UploadOutcome::Completed(result)) => {
                info!(id, url = %result.url, "queue item completed")
            }
            Ok(UploadOutcome::Paused) => info!(id, "queue item paused"),
            Ok(UploadOutcome::Cancelled) => info!(id, "queue item cancelled"),
            Err(err) => warn!(id, error = %err, "queue item failed"),
        }

        self.pause_flags.lock().await.remove(&id);
        self.cancel_tokens.lock().await.remove(&id);
    }

    /// Pause with progress preserved. An actively transferring file
    /// stops dispatching new chunks; an idle one is parked directly.
    pub async fn pause(&self, id: u64) -> Result<(), QueueError> {
        if let Some(flag) = self.pause_flags.lock().await.get(&id) {
            flag.store(true, Ordering::SeqCst);
            return Ok(());
        }
        let (file, _) = self.lookup(id).await?;
        let mut file = file.lock().await;
        if file.state == UploadState::Idle {
            file.state = UploadState::Paused;
        }
        Ok(())
    }

    /// Returns a paused file to the idle pool; the next drain resumes
    /// its session where it left off.
    pub async fn resume(&self, id: u64) -> Result<(), QueueError> {
        let (file, _) = self.lookup(id).await?;
        let mut file = file.lock().await;
        if file.state == UploadState::Paused {
            file.state = UploadState::Idle;
        } else {
            debug!(id, state = ?file.state, "resume ignored");
        }
        Ok(())
    }

    /// Resubmits a single failed item without restarting the queue. Any
    /// still-valid session is reused, so completed chunks are not
    /// re-uploaded; a finalize-only failure re-runs finalize alone.
    pub async fn retry(&self, id: u64) -> Result<(), QueueError> {
        let (file, source) = self.lookup(id).await?;
        let mut file = file.lock().await;
        if file.state != UploadState::Error {
            return Ok(());
        }
        // A file that failed validation stays failed.
        if let Err(err) = self.config.validate(source.name(), source.size()) {
            file.last_error = Some(err.to_string());
            return Ok(());
        }
        file.state = UploadState::Idle;
        file.last_error = None;
        Ok(())
    }

    /// Removes an item. In-flight items are hard-cancelled, which also
    /// discards local and server-side session state; parked items with a
    /// leftover session get the same cleanup here. Validation-failed and
    /// completed items only touch local queue state.
    pub async fn remove(&self, id: u64) -> Result<(), QueueError> {
        let was_active = if let Some(token) = self.cancel_tokens.lock().await.remove(&id) {
            token.cancel();
            true
        } else {
            false
        };
        self.pause_flags.lock().await.remove(&id);

        let entry = {
            let mut entries = self.entries.lock().await;
            let mut index = None;
            for (i, entry) in entries.iter().enumerate() {
                if entry.file.lock().await.id == id {
                    index = Some(i);
                    break;
                }
            }
            match index {
                Some(i) => entries.remove(i),
                None => return Err(QueueError::NotFound(id)),
            }
        };

        let file = entry.file.lock().await.clone();
        if !was_active && file.state != UploadState::Completed {
            if let Some(session_id) = file.session_id {
                self.store.delete(&entry.source.fingerprint()).await?;
                if let Err(err) = self.service.cancel_session(&session_id).await {
                    debug!(id, error = %err, "server-side session discard failed");
                }
            }
        }
        info!(id, "removed from queue");
        Ok(())
    }

    /// Drops completed entries, keeping failures and work in progress.
    pub async fn clear_completed(&self) {
        let mut entries = self.entries.lock().await;
        let mut kept = Vec::with_capacity(entries.len());
        for entry in entries.drain(..) {
            if entry.file.lock().await.state != UploadState::Completed {
                kept.push(entry);
            }
        }
        *entries = kept;
    }

    /// Flips every failed entry back to idle for the next drain.
    /// Validation failures are terminal and stay put.
    pub async fn retry_failed(&self) {
        let entries = self.entries.lock().await;
        for entry in entries.iter() {
            let mut file = entry.file.lock().await;
            if file.state == UploadState::Error
                && self
                    .config
                    .validate(entry.source.name(), entry.source.size())
                    .is_ok()
            {
                file.state = UploadState::Idle;
                file.last_error = None;
            }
        }
    }

    pub async fn stats(&self) -> QueueStats {
        let entries = self.entries.lock().await;
        let mut stats = QueueStats::default();
        let mut percent_sum = 0.0;
        for entry in entries.iter() {
            let file = entry.file.lock().await;
            stats.total += 1;
            match file.state {
                UploadState::Idle | UploadState::Paused => stats.pending += 1,
                UploadState::Preparing | UploadState::Uploading | UploadState::Completing => {
                    stats.uploading += 1
                }
                UploadState::Completed => stats.completed += 1,
                UploadState::Error => stats.failed += 1,
            }
            percent_sum += match file.state {
                UploadState::Completed => 100.0,
                _ => file.progress.percent,
            };
        }
        if stats.total > 0 {
            stats.overall_percent = percent_sum / stats.total as f64;
        }
        stats
    }

    /// Snapshot of every entry, in queue order.
    pub async fn files(&self) -> Vec<QueuedFile> {
        let entries = self.entries.lock().await;
        let mut result = Vec::with_capacity(entries.len());
        for entry in entries.iter() {
            result.push(entry.file.lock().await.clone());
        }
        result
    }

    pub async fn file(&self, id: u64) -> Result<QueuedFile, QueueError> {
        let (file, _) = self.lookup(id).await?;
        let file = file.lock().await.clone();
        Ok(file)
    }

    async fn lookup(
        &self,
        id: u64,
    ) -> Result<(Arc<Mutex<QueuedFile>>, Arc<dyn ChunkSource>), QueueError> {
        let entries = self.entries.lock().await;
        for entry in entries.iter() {
            if entry.file.lock().await.id == id {
                return Ok((entry.file.clone(), entry.source.clone()));
            }
        }
        Err(QueueError::NotFound(id))
    }
}

/// Explicit registry for processes with several independent upload
/// surfaces: queues are looked up by a logical name, created on first
/// use and torn down with `reset`.
pub struct QueueRegistry {
    service: Arc<dyn UploadService>,
    store: Arc<SessionStore>,
    config: QueueConfig,
    queues: Mutex<HashMap<String, Arc<UploadQueue>>>,
}

impl QueueRegistry {
    pub fn new(
        service: Arc<dyn UploadService>,
        store: Arc<SessionStore>,
        config: QueueConfig,
    ) -> Self {
        Self {
            service,
            store,
            config,
            queues: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get_or_create(&self, name: &str) -> Arc<UploadQueue> {
        let mut queues = self.queues.lock().await;
        queues
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(UploadQueue::new(
                    self.service.clone(),
                    self.store.clone(),
                    self.config.clone(),
                ))
            })
            .clone()
    }

    /// Drops the named queue; a later `get_or_create` starts fresh.
    pub async fn reset(&self, name: &str) -> bool {
        self.queues.lock().await.remove(name).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_rejects_oversize_and_unknown_types() {
        let config = QueueConfig {
            max_file_size: 1000,
            ..QueueConfig::default()
        };
        assert!(config.validate("ok.jpg", 1000).is_ok());
        assert!(config.validate("big.jpg", 1001).is_err());
        assert!(config.validate("empty.jpg", 0).is_err());
        assert!(config.validate("script.exe", 10).is_err());
        assert!(config.validate("noextension", 10).is_err());
    }

    #[test]
    fn heic_is_accepted_client_side() {
        let config = QueueConfig::default();
        assert!(config.validate("IMG_0100.HEIC", 1024).is_ok());
        assert!(config.validate("IMG_0100.heif", 1024).is_ok());
    }
}
