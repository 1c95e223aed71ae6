//! # Tomoflow - Parallel Tomography Pre-processing
//!
//! Tomoflow runs ordered chains of stages over 3-D image stacks (projections
//! or sinograms) and spreads each parallel stage across a pool of worker
//! processes. Arrays are handed to workers through named shared-memory
//! segments; only small control messages travel over the worker pipes.
//!
//! ## Features
//!
//! - **Memory-aware chunking**: stacks are split along the frame axis so each
//!   chunk fits a configurable fraction of the memory budget
//! - **Process pool**: cold-started worker processes with an explicit
//!   initialisation handshake
//! - **Fixed stage orders**: pre- and post-processing chains are validated
//!   before any work starts
//! - **Orphan cleanup**: shared segments left by dead processes can be found
//!   and freed
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tomoflow::prelude::*;
//!
//! let registry = StageRegistry::with_builtins();
//! let config = EngineConfig::from_file("pipeline.toml")?;
//! let stages = config.build_stages(PipelineKind::PreProcessing, &registry)?;
//!
//! let mut engine = Engine::new(registry);
//! let stack = ImageStack::new(load_projections()?);
//! let result = engine.run(stack, PipelineKind::PreProcessing, &stages, &config.resources)?;
//! engine.stop_pool()?;
//! ```
//!
//! Binaries that start an [`execution::Engine`] with more than one core must
//! route a `worker` argument to [`execution::serve_stdio`], because workers
//! are launched by re-executing the current binary.
//!
//! ## Architecture
//!
//! - [`core`]: array types, memory estimates, chunk planning, configuration, errors
//! - [`shm`]: shared-memory segments, their naming, and orphan detection
//! - [`filters`]: stage trait, registry, ordering rules, built-in stages
//! - [`execution`]: executor, worker pool, worker protocol, progress

#![warn(clippy::all)]

pub mod core;
pub mod execution;
pub mod filters;
pub mod shm;

/// Prelude module for convenient imports.
///
/// ```rust,ignore
/// use tomoflow::prelude::*;
/// ```
pub mod prelude {
    // Core types
    pub use crate::core::types::{Dtype, ImageStack, Pixel, Volume, VolumeView};
    pub use crate::core::chunked::{plan_split, ChunkRange, SplitPlan};
    pub use crate::core::config::{EngineConfig, ResourceConfig, StageSettings};

    // Errors
    pub use crate::core::error::{
        ChunkPlanningError, ConfigurationError, EngineError, EngineResult, PipelineError,
        SharedMemoryError, StageError, WorkerFailure,
    };

    // Shared memory
    pub use crate::shm::{SegmentRegistry, SharedArray, SharedMemoryBlock};

    // Stages
    pub use crate::filters::pipeline::{PipelineKind, PipelineStage};
    pub use crate::filters::registry::StageRegistry;
    pub use crate::filters::stage::{
        Category, SideValues, StageChunk, StageContext, StageDescriptor, StageOutput,
        StageParams, StageTransform,
    };

    // Execution
    pub use crate::execution::engine::{Engine, PipelineExecutor};
    pub use crate::execution::pool::{
        ChunkDispatcher, InProcessDispatcher, WorkerCommand, WorkerPool,
    };
    pub use crate::execution::progress::{ProgressCallback, ProgressUpdate, SkipReason};
}

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name.
pub const NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::prelude::*;

    #[test]
    fn test_version() {
        assert!(!super::VERSION.is_empty());
        assert_eq!(super::NAME, "tomoflow");
    }

    #[test]
    fn test_registry_with_builtins() {
        let registry = StageRegistry::with_builtins();
        for kind in [PipelineKind::PreProcessing, PipelineKind::PostProcessing] {
            for name in kind.order() {
                assert!(registry.contains(name), "missing built-in stage {}", name);
            }
        }
    }

    #[test]
    fn test_default_config_builds_no_stages() {
        let registry = StageRegistry::with_builtins();
        let stages = EngineConfig::default()
            .build_stages(PipelineKind::PreProcessing, &registry)
            .unwrap();
        assert!(stages.is_empty());
    }
}
