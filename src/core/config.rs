//! Resource and pipeline configuration.
//!
//! `ResourceConfig` bounds how much memory and how many cores a run may use.
//! `EngineConfig` is the on-disk form, loaded from TOML:
//!
//! ```toml
//! [resources]
//! cores = 4
//! max_memory = 2_000_000_000
//! max_ratio = 0.5
//!
//! [pre_processing.median_filter]
//! size = 3
//!
//! [pre_processing.minus_log]
//! parallel = false
//! ```

use crate::core::error::{ConfigurationError, EngineResult};
use crate::filters::pipeline::{PipelineKind, PipelineStage};
use crate::filters::registry::StageRegistry;
use crate::filters::stage::StageParams;
use indexmap::IndexMap;
use log::debug;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default fraction of the budget a single chunk may occupy.
pub const DEFAULT_MAX_RATIO: f64 = 1.0;

/// Limits applied to one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Worker count; 0 means one per available core.
    pub cores: usize,
    /// Explicit frames per chunk, bypassing the scheduler.
    pub chunksize: Option<usize>,
    /// Memory budget in bytes; `None` or 0 uses the available system memory.
    pub max_memory: Option<u64>,
    /// Fraction of the budget a single chunk may use, in `(0, 1]`.
    pub max_ratio: f64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            cores: 0,
            chunksize: None,
            max_memory: None,
            max_ratio: DEFAULT_MAX_RATIO,
        }
    }
}

impl ResourceConfig {
    /// Create a config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker count.
    pub fn with_cores(mut self, cores: usize) -> Self {
        self.cores = cores;
        self
    }

    /// Force a fixed chunk size.
    pub fn with_chunksize(mut self, chunksize: usize) -> Self {
        self.chunksize = Some(chunksize);
        self
    }

    /// Set the memory budget in bytes.
    pub fn with_max_memory(mut self, bytes: u64) -> Self {
        self.max_memory = Some(bytes);
        self
    }

    /// Set the memory budget in mebibytes.
    pub fn with_max_memory_mb(self, mb: u64) -> Self {
        self.with_max_memory(mb * 1024 * 1024)
    }

    /// Set the per-chunk ratio.
    pub fn with_max_ratio(mut self, ratio: f64) -> Self {
        self.max_ratio = ratio;
        self
    }

    /// Check the config for values the scheduler cannot work with.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if !self.max_ratio.is_finite() || self.max_ratio <= 0.0 || self.max_ratio > 1.0 {
            return Err(ConfigurationError::InvalidRatio(self.max_ratio));
        }
        if self.chunksize == Some(0) {
            return Err(ConfigurationError::ZeroChunksize);
        }
        Ok(())
    }

    /// Worker count with 0 resolved to the number of available cores.
    pub fn resolved_cores(&self) -> usize {
        resolve_cores(self.cores)
    }

    /// Memory budget in bytes.
    pub fn memory_budget(&self) -> u64 {
        match self.max_memory {
            Some(bytes) if bytes > 0 => bytes,
            _ => available_memory(),
        }
    }
}

/// Resolve a requested worker count, treating 0 as "all cores".
pub fn resolve_cores(requested: usize) -> usize {
    if requested > 0 {
        return requested;
    }
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Memory currently available to new allocations, in bytes.
pub fn available_memory() -> u64 {
    let mut sys = sysinfo::System::new();
    sys.refresh_memory();
    let available = sys.available_memory();
    debug!("Available system memory: {} bytes", available);
    available
}

/// Per-stage settings from a config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSettings {
    /// Whether the stage runs.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Override the stage's default parallelism.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel: Option<bool>,
    /// Everything else is passed to the stage as parameters.
    #[serde(flatten)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

fn default_enabled() -> bool {
    true
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            parallel: None,
            params: serde_json::Map::new(),
        }
    }
}

/// Raw `[resources]` table; memory is signed so negatives can be reported.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawResources {
    cores: Option<usize>,
    chunksize: Option<usize>,
    max_memory: Option<i64>,
    max_memory_mb: Option<i64>,
    max_ratio: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    resources: RawResources,
    #[serde(default)]
    pre_processing: IndexMap<String, StageSettings>,
    #[serde(default)]
    post_processing: IndexMap<String, StageSettings>,
}

impl TryFrom<RawResources> for ResourceConfig {
    type Error = ConfigurationError;

    fn try_from(raw: RawResources) -> Result<Self, Self::Error> {
        let mut config = ResourceConfig::default();
        if let Some(cores) = raw.cores {
            config.cores = cores;
        }
        config.chunksize = raw.chunksize;
        if let Some(ratio) = raw.max_ratio {
            config.max_ratio = ratio;
        }

        let max_memory = match (raw.max_memory, raw.max_memory_mb) {
            (Some(bytes), _) => Some(bytes),
            (None, Some(mb)) => Some(mb.saturating_mul(1024 * 1024)),
            (None, None) => None,
        };
        if let Some(bytes) = max_memory {
            if bytes < 0 {
                return Err(ConfigurationError::NegativeMemory(bytes));
            }
            // 0 means the same as leaving it out
            config.max_memory = (bytes > 0).then_some(bytes as u64);
        }

        config.validate()?;
        Ok(config)
    }
}

/// A complete run configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineConfig {
    /// Resource limits.
    pub resources: ResourceConfig,
    /// Pre-processing stage settings keyed by stage name.
    pub pre_processing: IndexMap<String, StageSettings>,
    /// Post-processing stage settings keyed by stage name.
    pub post_processing: IndexMap<String, StageSettings>,
}

impl EngineConfig {
    /// Parse a config from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigurationError> {
        let raw: RawConfig =
            toml::from_str(text).map_err(|e| ConfigurationError::Parse(e.to_string()))?;
        Ok(Self {
            resources: raw.resources.try_into()?,
            pre_processing: raw.pre_processing,
            post_processing: raw.post_processing,
        })
    }

    /// Load a config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigurationError::Read {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        Self::from_toml_str(&text)
    }

    /// Settings for one pipeline kind.
    pub fn settings(&self, kind: PipelineKind) -> &IndexMap<String, StageSettings> {
        match kind {
            PipelineKind::PreProcessing => &self.pre_processing,
            PipelineKind::PostProcessing => &self.post_processing,
        }
    }

    /// Build the ordered stage list for one pipeline kind.
    ///
    /// Stages are emitted in the pipeline's fixed order regardless of the
    /// order they appear in the file. Stage names missing from the registry
    /// are rejected.
    pub fn build_stages(
        &self,
        kind: PipelineKind,
        registry: &StageRegistry,
    ) -> EngineResult<Vec<PipelineStage>> {
        let settings = self.settings(kind);
        for name in settings.keys() {
            if !kind.order().contains(&name.as_str()) {
                return Err(crate::core::error::PipelineError::UnknownStage {
                    stage: name.clone(),
                    kind: kind.name(),
                }
                .into());
            }
        }

        let mut stages = Vec::new();
        for name in kind.order() {
            let Some(stage_settings) = settings.get(*name) else {
                continue;
            };
            let transform = registry
                .get(name)
                .ok_or_else(|| ConfigurationError::UnknownStage(name.to_string()))?;
            let mut stage = PipelineStage::new(transform)
                .with_params(StageParams::from_map(stage_settings.params.clone()))
                .enabled(stage_settings.enabled);
            if let Some(parallel) = stage_settings.parallel {
                stage = stage.with_parallel(parallel);
            }
            stages.push(stage);
        }
        Ok(stages)
    }
}
