//! Ordered stage lists and the rules they must satisfy.

use crate::core::error::PipelineError;
use crate::filters::stage::{StageCondition, StageParams, StageTransform};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Canonical pre-processing order.
pub const PRE_PROCESSING_ORDER: &[&str] = &[
    "rotate",
    "compute_scale_factors",
    "flat_dark_normalisation",
    "air_region_normalisation",
    "apply_scale_factors",
    "crop",
    "rebin",
    "stripe_removal",
    "outlier_removal",
    "median_filter",
    "gaussian_filter",
    "cut_off",
    "minus_log",
];

/// Canonical post-processing order.
pub const POST_PROCESSING_ORDER: &[&str] = &[
    "outlier_removal",
    "ring_removal",
    "median_filter",
    "gaussian_filter",
    "circular_mask",
];

/// Stage enabled alongside `compute_scale_factors` when no references exist.
pub const AIR_REGION_STAGE: &str = "air_region_normalisation";

/// Which fixed stage order a pipeline follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineKind {
    PreProcessing,
    PostProcessing,
}

impl PipelineKind {
    /// The stage order for this kind.
    pub fn order(&self) -> &'static [&'static str] {
        match self {
            PipelineKind::PreProcessing => PRE_PROCESSING_ORDER,
            PipelineKind::PostProcessing => POST_PROCESSING_ORDER,
        }
    }

    /// Name used in config files and messages.
    pub fn name(&self) -> &'static str {
        match self {
            PipelineKind::PreProcessing => "pre_processing",
            PipelineKind::PostProcessing => "post_processing",
        }
    }

    /// Position of a stage in the order.
    pub fn position(&self, stage: &str) -> Option<usize> {
        self.order().iter().position(|s| *s == stage)
    }
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One configured stage in a pipeline.
#[derive(Clone)]
pub struct PipelineStage {
    name: String,
    pub transform: Arc<dyn StageTransform>,
    pub parallel: bool,
    pub enabled: bool,
    pub params: StageParams,
    pub produces: Vec<String>,
    pub consumes: Vec<String>,
    pub condition: StageCondition,
    pub uses_references: bool,
    pub applies_to_references: bool,
}

impl PipelineStage {
    /// Configure a stage with the defaults its descriptor declares.
    pub fn new(transform: Arc<dyn StageTransform>) -> Self {
        let descriptor = transform.descriptor();
        Self {
            name: descriptor.name,
            transform,
            parallel: descriptor.parallel,
            enabled: true,
            params: StageParams::new(),
            produces: descriptor.produces,
            consumes: descriptor.consumes,
            condition: descriptor.condition,
            uses_references: descriptor.uses_references,
            applies_to_references: descriptor.applies_to_references,
        }
    }

    /// Stage name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Set parameters.
    pub fn with_params(mut self, params: StageParams) -> Self {
        self.params = params;
        self
    }

    /// Override parallelism.
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Enable or disable.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Whether the stage replaces frames rather than producing values.
    pub fn produces_frames(&self) -> bool {
        self.transform.produces_frames()
    }
}

impl fmt::Debug for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineStage")
            .field("name", &self.name)
            .field("parallel", &self.parallel)
            .field("enabled", &self.enabled)
            .field("params", &self.params)
            .finish()
    }
}

/// Check a stage list against the ordering and dependency rules.
///
/// Every stage must belong to `kind`'s order and appear at most once, in
/// order. Every consumed side value must be produced by an earlier enabled
/// stage. A values-producing stage must declare exactly one key.
pub fn validate_stages(kind: PipelineKind, stages: &[PipelineStage]) -> Result<(), PipelineError> {
    let mut previous: Option<(usize, &str)> = None;
    let mut produced: HashSet<&str> = HashSet::new();

    for stage in stages {
        let position = kind
            .position(stage.name())
            .ok_or_else(|| PipelineError::UnknownStage {
                stage: stage.name().to_string(),
                kind: kind.name(),
            })?;

        if let Some((prev_position, prev_name)) = previous {
            if position <= prev_position {
                return Err(PipelineError::OutOfOrder {
                    stage: stage.name().to_string(),
                    previous: prev_name.to_string(),
                });
            }
        }
        previous = Some((position, stage.name()));

        if !stage.enabled {
            continue;
        }

        if !stage.produces_frames() && stage.produces.len() != 1 {
            return Err(PipelineError::AmbiguousProduct {
                stage: stage.name().to_string(),
                declared: stage.produces.len(),
            });
        }

        for key in &stage.consumes {
            if !produced.contains(key.as_str()) {
                return Err(PipelineError::MissingSideValue {
                    stage: stage.name().to_string(),
                    key: key.clone(),
                });
            }
        }
        produced.extend(stage.produces.iter().map(|k| k.as_str()));
    }

    Ok(())
}
