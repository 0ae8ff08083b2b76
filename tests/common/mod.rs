// Shared test doubles: an in-memory upload service with scriptable
// failures, an in-memory chunk source, and a recording observer.

use async_trait::async_trait;
use bytes::Bytes;
use chunklift::prelude::*;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[allow(dead_code)]
#[derive(Clone, Copy)]
pub enum Scripted {
    Transient,
    NonRetryable,
    Expired,
}

#[derive(Default)]
struct MockSession {
    uploaded: BTreeSet<usize>,
}

/// In-memory stand-in for the remote upload service. Chunk uploads are
/// idempotent per index, like the real contract.
pub struct MockService {
    latency: Duration,
    sessions: Mutex<HashMap<String, MockSession>>,
    next_session: AtomicUsize,
    pub create_calls: AtomicUsize,
    pub chunk_calls: AtomicUsize,
    pub status_calls: AtomicUsize,
    pub finalize_calls: AtomicUsize,
    pub cancel_calls: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    chunk_failures: Mutex<HashMap<usize, VecDeque<Scripted>>>,
    finalize_failures: Mutex<u32>,
    pub put_indices: Mutex<Vec<usize>>,
}

impl MockService {
    pub fn new() -> Arc<Self> {
        Self::with_latency(Duration::ZERO)
    }

    pub fn with_latency(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            latency,
            sessions: Mutex::new(HashMap::new()),
            next_session: AtomicUsize::new(1),
            create_calls: AtomicUsize::new(0),
            chunk_calls: AtomicUsize::new(0),
            status_calls: AtomicUsize::new(0),
            finalize_calls: AtomicUsize::new(0),
            cancel_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            chunk_failures: Mutex::new(HashMap::new()),
            finalize_failures: Mutex::new(0),
            put_indices: Mutex::new(Vec::new()),
        })
    }

    /// The next `times` uploads of chunk `index` fail as scripted.
    pub async fn script_chunk_failures(&self, index: usize, failure: Scripted, times: u32) {
        let mut failures = self.chunk_failures.lock().await;
        let queue = failures.entry(index).or_default();
        for _ in 0..times {
            queue.push_back(failure);
        }
    }

    pub async fn script_finalize_failures(&self, times: u32) {
        *self.finalize_failures.lock().await = times;
    }

    /// Installs a session that already holds the given chunk indices, as
    /// if a previous run stored them.
    pub async fn seed_session(&self, session_id: &str, uploaded: impl IntoIterator<Item = usize>) {
        self.sessions.lock().await.insert(
            session_id.to_string(),
            MockSession {
                uploaded: uploaded.into_iter().collect(),
            },
        );
    }

    pub async fn session_exists(&self, session_id: &str) -> bool {
        self.sessions.lock().await.contains_key(session_id)
    }
}

#[async_trait]
impl UploadService for MockService {
    async fn create_session(
        &self,
        _request: &NewSessionRequest,
    ) -> Result<SessionHandle, TransferError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let session_id = format!("mock-{}", self.next_session.fetch_add(1, Ordering::SeqCst));
        self.sessions
            .lock()
            .await
            .insert(session_id.clone(), MockSession::default());
        Ok(SessionHandle {
            session_id,
            uploaded_chunk_indices: Vec::new(),
        })
    }

    async fn upload_chunk(
        &self,
        session_id: &str,
        index: usize,
        _offset: u64,
        _payload: Bytes,
    ) -> Result<(), TransferError> {
        self.chunk_calls.fetch_add(1, Ordering::SeqCst);
        self.put_indices.lock().await.push(index);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let scripted = {
            let mut failures = self.chunk_failures.lock().await;
            failures.get_mut(&index).and_then(|q| q.pop_front())
        };
        if let Some(failure) = scripted {
            return Err(match failure {
                Scripted::Transient => TransferError::Server { status: 503 },
                Scripted::NonRetryable => TransferError::Rejected {
                    status: 422,
                    message: "malformed chunk".to_string(),
                },
                Scripted::Expired => TransferError::SessionExpired,
            });
        }

        let mut sessions = self.sessions.lock().await;
        let Some(session) = sessions.get_mut(session_id) else {
            return Err(TransferError::SessionExpired);
        };
        session.uploaded.insert(index);
        Ok(())
    }

    async fn session_status(&self, session_id: &str) -> Result<SessionStatus, TransferError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let sessions = self.sessions.lock().await;
        let Some(session) = sessions.get(session_id) else {
            return Err(TransferError::SessionExpired);
        };
        Ok(SessionStatus {
            status: "active".to_string(),
            uploaded_chunk_indices: session.uploaded.iter().copied().collect(),
        })
    }

    async fn finalize(&self, session_id: &str) -> Result<UploadResult, TransferError> {
        self.finalize_calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut failures = self.finalize_failures.lock().await;
            if *failures > 0 {
                *failures -= 1;
                return Err(TransferError::Server { status: 500 });
            }
        }
        let mut sessions = self.sessions.lock().await;
        let Some(session) = sessions.remove(session_id) else {
            return Err(TransferError::SessionExpired);
        };
        Ok(UploadResult {
            url: format!("https://cdn.example.test/{session_id}"),
            filename: "uploaded".to_string(),
            file_size: session.uploaded.len() as u64,
            mime_type: "application/octet-stream".to_string(),
            thumbnail_url: None,
            post_processing_job_id: Some(format!("job-{session_id}")),
        })
    }

    async fn cancel_session(&self, session_id: &str) -> Result<(), TransferError> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        self.sessions.lock().await.remove(session_id);
        Ok(())
    }
}

/// An in-memory file.
pub struct MemSource {
    name: String,
    mime_type: String,
    data: Bytes,
}

impl MemSource {
    pub fn new(name: &str, size: usize) -> Arc<Self> {
        let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        Arc::new(Self {
            name: name.to_string(),
            mime_type: "application/octet-stream".to_string(),
            data: Bytes::from(data),
        })
    }
}

#[async_trait]
impl ChunkSource for MemSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn mime_type(&self) -> &str {
        &self.mime_type
    }

    async fn read_chunk(&self, chunk: &ChunkDescriptor) -> std::io::Result<Bytes> {
        let start = chunk.offset as usize;
        let end = start + chunk.length as usize;
        Ok(self.data.slice(start..end))
    }
}

/// Observer that records everything it sees.
#[derive(Default)]
pub struct Recorder {
    pub retries: AtomicUsize,
    pub errors: AtomicUsize,
    pub snapshots: std::sync::Mutex<Vec<ProgressSnapshot>>,
}

impl UploadObserver for Recorder {
    fn on_progress(&self, snapshot: &ProgressSnapshot) {
        self.snapshots.lock().unwrap().push(*snapshot);
    }

    fn on_retry(&self, _index: usize, _attempt: u32, _max_retries: u32, _error: &TransferError) {
        self.retries.fetch_add(1, Ordering::SeqCst);
    }

    fn on_error(&self, _error: &UploadError) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }
}

/// Observer that requests a pause once `after` chunks have completed.
pub struct PauseAfter {
    after: usize,
    seen: AtomicUsize,
    flag: Arc<AtomicBool>,
}

impl PauseAfter {
    pub fn new(after: usize, flag: Arc<AtomicBool>) -> Self {
        Self {
            after,
            seen: AtomicUsize::new(0),
            flag,
        }
    }
}

impl UploadObserver for PauseAfter {
    fn on_progress(&self, _snapshot: &ProgressSnapshot) {
        if self.seen.fetch_add(1, Ordering::SeqCst) + 1 >= self.after {
            self.flag.store(true, Ordering::SeqCst);
        }
    }
}

/// Transfer settings tuned so retry backoff does not slow tests down.
#[allow(dead_code)]
pub fn fast_config(chunk_size: u32) -> TransferConfig {
    TransferConfig {
        concurrency: 3,
        chunk_size,
        max_retries: 5,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
    }
}
