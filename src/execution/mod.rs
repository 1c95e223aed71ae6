//! Execution module.
//!
//! Runs pipelines: the executor, the worker pool and its process protocol,
//! and progress reporting.

pub mod engine;
pub mod pool;
pub mod progress;
pub mod protocol;
pub mod worker;

pub use engine::{Engine, PipelineExecutor};
pub use pool::{ChunkDispatcher, InProcessDispatcher, WorkerCommand, WorkerPool};
pub use progress::{ProgressCallback, ProgressTracker, ProgressUpdate, SkipReason};
pub use protocol::{ChunkTask, TaskOutcome, WorkerRequest, WorkerResponse};
pub use worker::{execute_task, serve, serve_stdio};
