//! Error types for tomoflow.
//!
//! Uses thiserror for structured errors with context. Errors are designed to:
//! - Carry enough context to point at the stage, chunk or segment involved
//! - Never be silently downgraded; every failure reaches the caller of `run`
//! - Convert into the umbrella [`EngineError`] with `?`

use crate::core::chunked::ChunkRange;
use crate::core::types::Dtype;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for tomoflow.
///
/// This enum encompasses all error categories and enables automatic
/// conversion between specific error types.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Chunk planning error: {0}")]
    ChunkPlanning(#[from] ChunkPlanningError),

    #[error("Worker failure: {0}")]
    Worker(#[from] WorkerFailure),

    #[error("Shared memory error: {0}")]
    SharedMemory(#[from] SharedMemoryError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Stage error: {0}")]
    Stage(#[from] StageError),

    #[error("A worker pool of {running} workers is already running (requested {requested})")]
    PoolAlreadyRunning { running: usize, requested: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Invalid resource or pipeline configuration.
///
/// Raised before any pool is started and never retried.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error("max_ratio must be in (0, 1], got {0}")]
    InvalidRatio(f64),

    #[error("max_memory must not be negative, got {0}")]
    NegativeMemory(i64),

    #[error("chunksize must be at least 1")]
    ZeroChunksize,

    #[error("{which} stack pixel plane {got:?} does not match sample plane {expected:?}")]
    ReferenceShapeMismatch {
        which: &'static str,
        expected: (usize, usize),
        got: (usize, usize),
    },

    #[error("Stage '{0}' is not registered")]
    UnknownStage(String),

    #[error("Failed to read config file {path}: {error}")]
    Read { path: PathBuf, error: String },

    #[error("Failed to parse config: {0}")]
    Parse(String),
}

/// The chunk scheduler could not produce a valid split.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChunkPlanningError {
    #[error("Axis {axis} is outside a shape of {dims} dimensions")]
    AxisOutOfRange { axis: usize, dims: usize },

    #[error("Memory budget of {budget} bytes with ratio {max_ratio} cannot be planned against")]
    InvalidBudget { budget: u64, max_ratio: f64 },

    #[error("Axis {0} has zero length")]
    EmptyAxis(usize),

    #[error("A single slab of {slab_bytes} bytes exceeds {max_ratio} of the {budget} byte budget")]
    SlabExceedsBudget {
        slab_bytes: u64,
        budget: u64,
        max_ratio: f64,
    },
}

/// A failure raised while executing a stage through the worker pool.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkerFailure {
    #[error("Stage '{stage}' failed on frames {chunk}: {message}")]
    Transform {
        stage: String,
        chunk: ChunkRange,
        message: String,
    },

    #[error("Failed to spawn worker: {0}")]
    Spawn(String),

    #[error("Worker {pid} exited unexpectedly")]
    Crashed { pid: u32 },

    #[error("Worker {pid} sent an unexpected message: {message}")]
    Protocol { pid: u32, message: String },

    #[error("Worker {pid} is missing stages after initialisation: {missing:?}")]
    MissingStages { pid: u32, missing: Vec<String> },

    #[error("Worker pool has been stopped")]
    PoolStopped,
}

/// Allocation, mapping or deallocation of a shared-memory segment failed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SharedMemoryError {
    #[error("Failed to create segment '{name}': {error}")]
    Create { name: String, error: String },

    #[error("Segment '{name}' needs {requested} bytes but only {available} are available")]
    InsufficientMemory {
        name: String,
        requested: u64,
        available: u64,
    },

    #[error("Failed to open segment '{name}': {error}")]
    Open { name: String, error: String },

    #[error("Failed to map segment '{name}': {error}")]
    Map { name: String, error: String },

    #[error("Failed to free segment '{name}': {error}")]
    Unlink { name: String, error: String },

    #[error("Failed to enumerate segments: {0}")]
    List(String),

    #[error("Segment '{name}' holds {actual} bytes, expected {expected}")]
    SizeMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("Segment '{name}' holds {expected} data, got {got}")]
    DtypeMismatch {
        name: String,
        expected: Dtype,
        got: Dtype,
    },

    #[error("Segment name '{0}' does not follow the naming convention")]
    InvalidName(String),
}

/// The stage list violates an ordering or dependency rule.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error("Stage '{stage}' is not part of the {kind} order")]
    UnknownStage { stage: String, kind: &'static str },

    #[error("Stage '{stage}' must run before '{previous}'")]
    OutOfOrder { stage: String, previous: String },

    #[error("Stage '{stage}' consumes '{key}' which no earlier enabled stage produces")]
    MissingSideValue { stage: String, key: String },

    #[error("Stage '{stage}' returns values but declares {declared} produced keys")]
    AmbiguousProduct { stage: String, declared: usize },

    #[error("Parallel stage '{stage}' changed the frame count from {expected} to {got}")]
    FrameCountChanged {
        stage: String,
        expected: usize,
        got: usize,
    },

    #[error("Stage '{stage}' returned shape {got:?}, expected {expected:?}")]
    OutputShapeMismatch {
        stage: String,
        expected: [usize; 3],
        got: [usize; 3],
    },
}

/// Errors raised by a stage transform itself.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StageError {
    #[error("Missing parameter '{0}'")]
    MissingParameter(String),

    #[error("Invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("Stage requires flat and dark references")]
    MissingReferences,

    #[error("Stage requires side value '{0}'")]
    MissingSideValue(String),

    #[error("{0}")]
    Other(String),
}

impl EngineError {
    /// Whether this error came from a worker process or transform.
    pub fn is_worker_failure(&self) -> bool {
        matches!(self, EngineError::Worker(_))
    }
}

impl WorkerFailure {
    /// Name of the stage that failed, if the failure is a transform error.
    pub fn stage(&self) -> Option<&str> {
        match self {
            WorkerFailure::Transform { stage, .. } => Some(stage),
            _ => None,
        }
    }
}

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Result type alias for shared-memory operations.
pub type ShmResult<T> = Result<T, SharedMemoryError>;

/// Result type alias for stage transforms.
pub type StageResult<T> = Result<T, StageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transform_failure_display() {
        let failure = WorkerFailure::Transform {
            stage: "median_filter".to_string(),
            chunk: ChunkRange::new(10, 20),
            message: "window must be odd".to_string(),
        };
        let text = failure.to_string();
        assert!(text.contains("median_filter"));
        assert!(text.contains("[10, 20)"));
        assert_eq!(failure.stage(), Some("median_filter"));
    }

    #[test]
    fn test_conversion_into_engine_error() {
        let err: EngineError = WorkerFailure::PoolStopped.into();
        assert!(err.is_worker_failure());

        let err: EngineError = ConfigurationError::InvalidRatio(0.0).into();
        assert!(!err.is_worker_failure());
        assert!(err.to_string().contains("max_ratio"));
    }
}
