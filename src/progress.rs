// src/progress.rs

use crate::models::ProgressSnapshot;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Throughput is smoothed over deltas from the last few seconds.
const SPEED_WINDOW: Duration = Duration::from_secs(8);
/// Below this much history the speed estimate is too noisy to report.
const MIN_ELAPSED: Duration = Duration::from_millis(200);

/// Derives bytes-uploaded, smoothed throughput and ETA from chunk
/// completion events. `bytes_uploaded` is monotonically non-decreasing
/// for the life of one run; a resume re-derives the baseline from the
/// authoritative uploaded-chunk set but restarts the speed window.
pub struct ProgressAggregator {
    total_bytes: u64,
    bytes_uploaded: u64,
    uploaded_chunks: usize,
    retry_count: u32,
    window: VecDeque<(Instant, u64)>,
}

impl ProgressAggregator {
    pub fn new(total_bytes: u64) -> Self {
        Self::resume_from(total_bytes, 0, 0)
    }

    /// Starts with a baseline of already-stored chunks (resume path).
    pub fn resume_from(total_bytes: u64, bytes_uploaded: u64, uploaded_chunks: usize) -> Self {
        Self {
            total_bytes,
            bytes_uploaded,
            uploaded_chunks,
            retry_count: 0,
            window: VecDeque::new(),
        }
    }

    /// Records one confirmed chunk and returns the fresh snapshot.
    pub fn record_chunk(&mut self, bytes: u32) -> ProgressSnapshot {
        self.bytes_uploaded += bytes as u64;
        self.uploaded_chunks += 1;
        self.window.push_back((Instant::now(), bytes as u64));
        self.prune();
        self.snapshot()
    }

    pub fn record_retry(&mut self) {
        self.retry_count += 1;
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let speed = self.speed();
        let remaining = self.total_bytes.saturating_sub(self.bytes_uploaded);
        let eta_seconds = if speed > 0.0 {
            Some((remaining as f64 / speed).max(0.0))
        } else {
            None
        };
        let percent = if self.total_bytes == 0 {
            0.0
        } else {
            (self.bytes_uploaded as f64 / self.total_bytes as f64 * 100.0).min(100.0)
        };
        ProgressSnapshot {
            bytes_uploaded: self.bytes_uploaded,
            total_bytes: self.total_bytes,
            percent,
            speed_bytes_per_sec: speed,
            eta_seconds,
            uploaded_chunk_count: self.uploaded_chunks,
            retry_count: self.retry_count,
        }
    }

    fn prune(&mut self) {
        let Some(cutoff) = Instant::now().checked_sub(SPEED_WINDOW) else {
            return;
        };
        while self
            .window
            .front()
            .map(|(at, _)| *at < cutoff)
            .unwrap_or(false)
        {
            self.window.pop_front();
        }
    }

    fn speed(&self) -> f64 {
        let Some((oldest, _)) = self.window.front() else {
            return 0.0;
        };
        let elapsed = oldest.elapsed();
        if elapsed < MIN_ELAPSED {
            return 0.0;
        }
        let bytes: u64 = self.window.iter().map(|(_, b)| *b).sum();
        bytes as f64 / elapsed.as_secs_f64()
    }
}
