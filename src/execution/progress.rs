//! Progress tracking for pipeline runs.

use crate::core::chunked::ChunkRange;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// A progress update event.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressUpdate {
    /// The run has started.
    Started {
        total_stages: usize,
    },
    /// A stage has started.
    StageStarted {
        name: String,
        index: usize,
        total: usize,
        /// Number of chunks the stage was split into, 1 for in-process runs.
        chunks: usize,
    },
    /// One chunk of a dispatched stage finished.
    ChunkCompleted {
        stage: String,
        chunk: ChunkRange,
    },
    /// A stage has completed.
    StageCompleted {
        name: String,
        duration_ms: u64,
    },
    /// A stage was not run.
    StageSkipped {
        name: String,
        reason: SkipReason,
    },
    /// Overall progress percentage.
    Progress {
        percent: f32,
        elapsed_ms: u64,
        estimated_remaining_ms: Option<u64>,
    },
    /// The run has completed.
    Completed {
        total_duration_ms: u64,
        stages_run: usize,
        stages_skipped: usize,
    },
    /// A stage failed.
    Error {
        stage: Option<String>,
        message: String,
    },
}

/// Reason why a stage was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Stage is disabled.
    Disabled,
    /// The stage's run condition does not hold for this stack.
    ConditionNotMet,
    /// The stage that produces a value it consumes was skipped.
    ProducerSkipped,
}

/// Callback type for progress updates.
pub type ProgressCallback = Arc<dyn Fn(ProgressUpdate) + Send + Sync>;

/// Tracks the progress of one run.
pub struct ProgressTracker {
    total_stages: usize,
    completed_stages: AtomicU64,
    skipped_stages: AtomicU64,
    start_time: Option<Instant>,
    callback: Option<ProgressCallback>,
    stage_times: parking_lot::Mutex<Vec<u64>>,
}

impl ProgressTracker {
    /// Create a new progress tracker.
    pub fn new(total_stages: usize) -> Self {
        Self {
            total_stages,
            completed_stages: AtomicU64::new(0),
            skipped_stages: AtomicU64::new(0),
            start_time: None,
            callback: None,
            stage_times: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Set a callback for progress updates.
    pub fn with_callback(mut self, callback: Option<ProgressCallback>) -> Self {
        self.callback = callback;
        self
    }

    /// Start tracking.
    pub fn start(&mut self) {
        self.start_time = Some(Instant::now());
        self.send_update(ProgressUpdate::Started {
            total_stages: self.total_stages,
        });
    }

    /// Report that a stage has started.
    pub fn stage_started(&self, name: &str, chunks: usize) {
        let done = self.completed_stages.load(Ordering::Relaxed)
            + self.skipped_stages.load(Ordering::Relaxed);
        self.send_update(ProgressUpdate::StageStarted {
            name: name.to_string(),
            index: done as usize,
            total: self.total_stages,
            chunks,
        });
    }

    /// Report that one chunk of a stage finished.
    pub fn chunk_completed(&self, stage: &str, chunk: ChunkRange) {
        self.send_update(ProgressUpdate::ChunkCompleted {
            stage: stage.to_string(),
            chunk,
        });
    }

    /// Report that a stage has completed.
    pub fn stage_completed(&self, name: &str, duration_ms: u64) {
        self.completed_stages.fetch_add(1, Ordering::Relaxed);
        self.stage_times.lock().push(duration_ms);

        self.send_update(ProgressUpdate::StageCompleted {
            name: name.to_string(),
            duration_ms,
        });
        self.send_progress_update();
    }

    /// Report that a stage was skipped.
    pub fn stage_skipped(&self, name: &str, reason: SkipReason) {
        self.skipped_stages.fetch_add(1, Ordering::Relaxed);
        self.send_update(ProgressUpdate::StageSkipped {
            name: name.to_string(),
            reason,
        });
    }

    /// Report an error.
    pub fn report_error(&self, stage: Option<&str>, message: String) {
        self.send_update(ProgressUpdate::Error {
            stage: stage.map(str::to_string),
            message,
        });
    }

    /// Complete tracking.
    pub fn complete(&self) {
        let duration = self
            .start_time
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);

        self.send_update(ProgressUpdate::Completed {
            total_duration_ms: duration,
            stages_run: self.completed_stages.load(Ordering::Relaxed) as usize,
            stages_skipped: self.skipped_stages.load(Ordering::Relaxed) as usize,
        });
    }

    /// Get current progress percentage.
    pub fn progress_percent(&self) -> f32 {
        if self.total_stages == 0 {
            return 100.0;
        }
        let completed = self.completed_stages.load(Ordering::Relaxed);
        let skipped = self.skipped_stages.load(Ordering::Relaxed);
        ((completed + skipped) as f32 / self.total_stages as f32) * 100.0
    }

    /// Estimate remaining time in milliseconds.
    pub fn estimated_remaining_ms(&self) -> Option<u64> {
        let times = self.stage_times.lock();
        if times.is_empty() {
            return None;
        }

        let avg_time: u64 = times.iter().sum::<u64>() / times.len() as u64;
        let done = self.completed_stages.load(Ordering::Relaxed)
            + self.skipped_stages.load(Ordering::Relaxed);
        let remaining = self.total_stages.saturating_sub(done as usize);

        Some(avg_time * remaining as u64)
    }

    fn send_update(&self, update: ProgressUpdate) {
        if let Some(ref callback) = self.callback {
            callback(update);
        }
    }

    fn send_progress_update(&self) {
        let elapsed = self
            .start_time
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);

        self.send_update(ProgressUpdate::Progress {
            percent: self.progress_percent(),
            elapsed_ms: elapsed,
            estimated_remaining_ms: self.estimated_remaining_ms(),
        });
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(0)
    }
}
