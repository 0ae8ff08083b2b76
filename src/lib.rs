//! Resumable chunked-upload orchestration: chunk planning, a
//! bounded-concurrency transfer executor with retry/backoff, durable
//! session records for resume-after-restart, and a queue coordinating
//! many files with independent lifecycles.

pub mod error;
pub mod executor;
pub mod models;
pub mod planner;
pub mod progress;
pub mod queue;
pub mod service;
pub mod session;
pub mod source;
pub mod store;

/// Convenient re-exports of the common surface.
pub mod prelude {
    pub use crate::error::{TransferError, UploadError};
    pub use crate::executor::{ChunkTransferExecutor, TransferConfig, TransferOutcome};
    pub use crate::models::{
        ChunkDescriptor, FileFingerprint, NoopObserver, ProgressSnapshot, QueuedFile,
        UploadObserver, UploadResult, UploadSessionRecord, UploadState,
    };
    pub use crate::planner::plan_chunks;
    pub use crate::progress::ProgressAggregator;
    pub use crate::queue::{QueueConfig, QueueError, QueueRegistry, QueueStats, UploadQueue};
    pub use crate::service::{
        HttpUploadService, NewSessionRequest, SessionHandle, SessionStatus, UploadService,
    };
    pub use crate::session::{UploadOutcome, UploadSession};
    pub use crate::source::{ChunkSource, FsSource};
    pub use crate::store::{SessionStore, StoreError};
}
