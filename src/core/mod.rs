//! Core types for the tomoflow execution engine.
//!
//! This module contains the foundational pieces the engine is built from:
//! - Array types (Volume, ImageStack)
//! - Memory footprint estimates and chunk planning
//! - Resource and pipeline configuration
//! - Error types

pub mod types;
pub mod memory;
pub mod chunked;
pub mod config;
pub mod error;

// Re-export commonly used types
pub use types::{Dtype, ImageStack, Pixel, Volume, VolumeView};
pub use chunked::{plan_split, ChunkRange, SplitPlan};
pub use config::{EngineConfig, ResourceConfig, StageSettings};
pub use error::{
    ChunkPlanningError, ConfigurationError, EngineError, EngineResult, PipelineError,
    SharedMemoryError, StageError, WorkerFailure,
};
