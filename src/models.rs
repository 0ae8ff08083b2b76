// src/models.rs

use crate::error::{TransferError, UploadError};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Best-effort identity for a file, used to locate a resumable session
/// across restarts. Two distinct files sharing a name and size will
/// collide; callers that need collision resistance should key on
/// [`crate::source::FsSource::content_fingerprint`] instead.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileFingerprint {
    pub name: String,
    pub size: u64,
}

impl FileFingerprint {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
        }
    }

    /// Key under which the session record is persisted locally.
    pub fn storage_key(&self) -> String {
        format!("upload_session_{}_{}", self.name, self.size)
    }
}

/// One contiguous byte range of the file, transferred as a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkDescriptor {
    pub index: usize,
    pub offset: u64,
    pub length: u32,
}

/// The locally persisted half of an upload session. Written before the
/// first chunk is sent so that a crash prior to any network I/O still
/// leaves a resumable record; deleted on successful finalize or explicit
/// cancel, retained on pause.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSessionRecord {
    pub fingerprint: FileFingerprint,
    pub session_id: String,
    pub chunk_size: u32,
    pub total_chunks: usize,
    /// Unix seconds.
    pub created_at: u64,
}

impl UploadSessionRecord {
    pub fn new(
        fingerprint: FileFingerprint,
        session_id: String,
        chunk_size: u32,
        total_chunks: usize,
    ) -> Self {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            fingerprint,
            session_id,
            chunk_size,
            total_chunks,
            created_at,
        }
    }
}

/// Point-in-time view of one file's transfer. Recomputed after every
/// chunk completion, never persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProgressSnapshot {
    pub bytes_uploaded: u64,
    pub total_bytes: u64,
    pub percent: f64,
    pub speed_bytes_per_sec: f64,
    /// None until enough throughput history exists to estimate.
    pub eta_seconds: Option<f64>,
    pub uploaded_chunk_count: usize,
    pub retry_count: u32,
}

/// Produced once per file by a successful finalize call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResult {
    pub url: String,
    pub filename: String,
    pub file_size: u64,
    pub mime_type: String,
    pub thumbnail_url: Option<String>,
    pub post_processing_job_id: Option<String>,
}

/// Lifecycle of one file in an upload queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadState {
    Idle,
    Preparing,
    Uploading,
    Paused,
    Completing,
    Completed,
    Error,
}

/// One file tracked by a queue. Owned by the queue for its lifetime;
/// snapshots handed to callers are clones.
#[derive(Debug, Clone)]
pub struct QueuedFile {
    pub id: u64,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    pub state: UploadState,
    pub progress: ProgressSnapshot,
    pub last_error: Option<String>,
    pub result: Option<UploadResult>,
    pub session_id: Option<String>,
}

impl QueuedFile {
    pub fn new(id: u64, name: String, size: u64, mime_type: String) -> Self {
        Self {
            id,
            name,
            size,
            mime_type,
            state: UploadState::Idle,
            progress: ProgressSnapshot {
                total_bytes: size,
                ..ProgressSnapshot::default()
            },
            last_error: None,
            result: None,
            session_id: None,
        }
    }
}

/// Observation hooks for a transfer, passed as one bundle. These are
/// side-channel reporting only and must never be relied on for control
/// flow.
pub trait UploadObserver: Send + Sync {
    fn on_progress(&self, _snapshot: &ProgressSnapshot) {}
    fn on_retry(&self, _index: usize, _attempt: u32, _max_retries: u32, _error: &TransferError) {}
    fn on_error(&self, _error: &UploadError) {}
}

/// Observer that ignores every event.
pub struct NoopObserver;

impl UploadObserver for NoopObserver {}
