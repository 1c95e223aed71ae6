//! Stage module.
//!
//! Contains the stage trait, the stage registry, pipeline ordering rules and
//! the built-in stage implementations.

pub mod stage;
pub mod registry;
pub mod pipeline;
pub mod builtin;

pub use stage::{
    Category, SideValues, StageChunk, StageCondition, StageContext, StageDescriptor, StageOutput,
    StageParams, StageTransform,
};
pub use registry::StageRegistry;
pub use pipeline::{validate_stages, PipelineKind, PipelineStage};
