//! StageTransform trait and stage descriptors.
//!
//! A stage is a pure function from a block of frames (plus optional flat and
//! dark references and side values from earlier stages) to either a new block
//! of frames or one value per frame. Stages never see how the stack was
//! chunked: the same transform runs on the whole stack in-process and on
//! frame ranges inside worker processes, and must give the same result.

use crate::core::chunked::ChunkRange;
use crate::core::error::{StageError, StageResult};
use crate::core::types::{Pixel, Volume, VolumeView};
use indexmap::IndexMap;
use ndarray::{Array2, ArrayView2, ArrayView3, Axis};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Category for grouping stages in listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Rotation, cropping, binning, masking
    Geometry,
    /// Flat/dark and intensity normalisation
    Normalisation,
    /// Noise, outlier and artefact removal
    Denoise,
    /// Pointwise intensity mapping
    Intensity,
}

impl Category {
    /// Get the display name for this category.
    pub fn display_name(&self) -> &'static str {
        match self {
            Category::Geometry => "Geometry",
            Category::Normalisation => "Normalisation",
            Category::Denoise => "Denoise",
            Category::Intensity => "Intensity",
        }
    }

    /// Get all categories in display order.
    pub fn all() -> &'static [Category] {
        &[
            Category::Geometry,
            Category::Normalisation,
            Category::Denoise,
            Category::Intensity,
        ]
    }
}

/// When a stage runs, beyond being enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageCondition {
    /// Always runs.
    #[default]
    Always,
    /// Runs only if the stack has flat and dark references, or the
    /// air-region normalisation stage is enabled in the same pipeline.
    ReferencesOrAirRegion,
}

/// Static description of a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDescriptor {
    /// Unique stage name, as used in pipeline orders and config files.
    pub name: String,
    /// Human-readable name.
    pub display_name: String,
    /// Listing category.
    pub category: Category,
    /// What the stage does.
    pub description: String,
    /// Whether the stage runs chunked by default.
    pub parallel: bool,
    /// Whether the stage reads the flat and dark references.
    pub uses_references: bool,
    /// Whether the stage is also applied to flat and dark, so they keep the
    /// sample's pixel plane.
    pub applies_to_references: bool,
    /// Side-value keys this stage produces.
    pub produces: Vec<String>,
    /// Side-value keys this stage reads.
    pub consumes: Vec<String>,
    /// Extra condition on running.
    pub condition: StageCondition,
}

impl StageDescriptor {
    /// Create a new descriptor builder.
    pub fn builder(
        name: impl Into<String>,
        display_name: impl Into<String>,
    ) -> StageDescriptorBuilder {
        StageDescriptorBuilder::new(name, display_name)
    }
}

/// Builder for StageDescriptor.
pub struct StageDescriptorBuilder {
    descriptor: StageDescriptor,
}

impl StageDescriptorBuilder {
    /// Create a new builder with required fields.
    pub fn new(name: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            descriptor: StageDescriptor {
                name: name.into(),
                display_name: display_name.into(),
                category: Category::Intensity,
                description: String::new(),
                parallel: true,
                uses_references: false,
                applies_to_references: false,
                produces: Vec::new(),
                consumes: Vec::new(),
                condition: StageCondition::Always,
            },
        }
    }

    /// Set the category.
    pub fn category(mut self, category: Category) -> Self {
        self.descriptor.category = category;
        self
    }

    /// Set the description.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.descriptor.description = description.into();
        self
    }

    /// Set the default parallelism.
    pub fn parallel(mut self, parallel: bool) -> Self {
        self.descriptor.parallel = parallel;
        self
    }

    /// Mark the stage as reading flat and dark.
    pub fn uses_references(mut self) -> Self {
        self.descriptor.uses_references = true;
        self
    }

    /// Mark the stage as also applying to flat and dark.
    pub fn applies_to_references(mut self) -> Self {
        self.descriptor.applies_to_references = true;
        self
    }

    /// Declare a produced side value.
    pub fn produces(mut self, key: impl Into<String>) -> Self {
        self.descriptor.produces.push(key.into());
        self
    }

    /// Declare a consumed side value.
    pub fn consumes(mut self, key: impl Into<String>) -> Self {
        self.descriptor.consumes.push(key.into());
        self
    }

    /// Set the run condition.
    pub fn condition(mut self, condition: StageCondition) -> Self {
        self.descriptor.condition = condition;
        self
    }

    /// Build the descriptor.
    pub fn build(self) -> StageDescriptor {
        self.descriptor
    }
}

/// Rectangle in pixel coordinates, `[left, top, right, bottom)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub left: usize,
    pub top: usize,
    pub right: usize,
    pub bottom: usize,
}

impl Region {
    /// Width in pixels.
    pub fn width(&self) -> usize {
        self.right.saturating_sub(self.left)
    }

    /// Height in pixels.
    pub fn height(&self) -> usize {
        self.bottom.saturating_sub(self.top)
    }

    /// Check that the region is non-empty and inside a `(rows, cols)` plane.
    pub fn check_within(&self, plane: (usize, usize), name: &str) -> StageResult<()> {
        if self.width() == 0 || self.height() == 0 {
            return Err(StageError::InvalidParameter {
                name: name.to_string(),
                reason: format!("region {:?} is empty", self),
            });
        }
        if self.bottom > plane.0 || self.right > plane.1 {
            return Err(StageError::InvalidParameter {
                name: name.to_string(),
                reason: format!("region {:?} exceeds image of {}x{}", self, plane.0, plane.1),
            });
        }
        Ok(())
    }

    /// Borrow the region of a frame.
    pub fn of<'a, T>(&self, frame: &ArrayView2<'a, T>) -> ArrayView2<'a, T> {
        frame
            .clone()
            .slice_move(ndarray::s![self.top..self.bottom, self.left..self.right])
    }
}

/// Free-form stage parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageParams(serde_json::Map<String, serde_json::Value>);

impl StageParams {
    /// Create empty parameters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing map.
    pub fn from_map(map: serde_json::Map<String, serde_json::Value>) -> Self {
        Self(map)
    }

    /// Add a parameter.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Raw parameter value.
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    /// Whether no parameters are set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn invalid(key: &str, expected: &str, value: &serde_json::Value) -> StageError {
        StageError::InvalidParameter {
            name: key.to_string(),
            reason: format!("expected {}, got {}", expected, value),
        }
    }

    /// Float parameter with a default.
    pub fn f64_or(&self, key: &str, default: f64) -> StageResult<f64> {
        match self.0.get(key) {
            None => Ok(default),
            Some(value) => value.as_f64().ok_or_else(|| Self::invalid(key, "a number", value)),
        }
    }

    /// Unsigned integer parameter with a default.
    pub fn usize_or(&self, key: &str, default: usize) -> StageResult<usize> {
        match self.0.get(key) {
            None => Ok(default),
            Some(value) => value
                .as_u64()
                .map(|v| v as usize)
                .ok_or_else(|| Self::invalid(key, "a non-negative integer", value)),
        }
    }

    /// Signed integer parameter with a default.
    pub fn i64_or(&self, key: &str, default: i64) -> StageResult<i64> {
        match self.0.get(key) {
            None => Ok(default),
            Some(value) => value.as_i64().ok_or_else(|| Self::invalid(key, "an integer", value)),
        }
    }

    /// String parameter with a default.
    pub fn str_or<'a>(&'a self, key: &str, default: &'a str) -> StageResult<&'a str> {
        match self.0.get(key) {
            None => Ok(default),
            Some(value) => value.as_str().ok_or_else(|| Self::invalid(key, "a string", value)),
        }
    }

    /// Region parameter given as `[left, top, right, bottom]`.
    pub fn region(&self, key: &str) -> StageResult<Option<Region>> {
        let Some(value) = self.0.get(key) else {
            return Ok(None);
        };
        let bounds: Option<Vec<usize>> = value
            .as_array()
            .map(|items| items.iter().map(|v| v.as_u64().map(|n| n as usize)).collect())
            .and_then(|bounds: Option<Vec<usize>>| bounds);
        match bounds.as_deref() {
            Some(&[left, top, right, bottom]) => Ok(Some(Region {
                left,
                top,
                right,
                bottom,
            })),
            _ => Err(Self::invalid(key, "[left, top, right, bottom]", value)),
        }
    }

    /// Region parameter that must be present.
    pub fn require_region(&self, key: &str) -> StageResult<Region> {
        self.region(key)?
            .ok_or_else(|| StageError::MissingParameter(key.to_string()))
    }
}

/// Per-frame values produced by earlier stages, keyed by name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SideValues(IndexMap<String, Vec<f64>>);

impl SideValues {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store values under `key`, replacing any previous ones.
    pub fn insert(&mut self, key: impl Into<String>, values: Vec<f64>) {
        self.0.insert(key.into(), values);
    }

    /// Values under `key`.
    pub fn get(&self, key: &str) -> Option<&[f64]> {
        self.0.get(key).map(|v| v.as_slice())
    }

    /// Values under `key`, or a stage error naming the missing key.
    pub fn require(&self, key: &str) -> StageResult<&[f64]> {
        self.get(key)
            .ok_or_else(|| StageError::MissingSideValue(key.to_string()))
    }

    /// Whether `key` is present.
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Copy out the named keys that are present.
    pub fn subset<S: AsRef<str>>(&self, keys: &[S]) -> SideValues {
        let mut out = SideValues::new();
        for key in keys {
            if let Some(values) = self.0.get(key.as_ref()) {
                out.insert(key.as_ref(), values.clone());
            }
        }
        out
    }

    /// Iterate over keys and values.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[f64])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no keys are present.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The frames a stage operates on in one call.
#[derive(Debug, Clone)]
pub struct StageChunk<'a> {
    /// Sample frames `range.start..range.stop`.
    pub sample: VolumeView<'a>,
    /// Whole flat stack, when the stage uses references.
    pub flat: Option<VolumeView<'a>>,
    /// Whole dark stack, when the stage uses references.
    pub dark: Option<VolumeView<'a>>,
    /// Absolute frame indices of `sample` within the full stack.
    pub range: ChunkRange,
}

impl<'a> StageChunk<'a> {
    /// A chunk covering a whole stack with no references.
    pub fn whole(sample: VolumeView<'a>) -> Self {
        let frames = sample.frames();
        Self {
            sample,
            flat: None,
            dark: None,
            range: ChunkRange::new(0, frames),
        }
    }

    /// Flat and dark, or an error if either is missing.
    pub fn references(&self) -> StageResult<(&VolumeView<'a>, &VolumeView<'a>)> {
        match (&self.flat, &self.dark) {
            (Some(flat), Some(dark)) => Ok((flat, dark)),
            _ => Err(StageError::MissingReferences),
        }
    }
}

/// Parameters and side values passed to a stage.
#[derive(Debug, Clone, Copy)]
pub struct StageContext<'a> {
    pub params: &'a StageParams,
    pub side_values: &'a SideValues,
}

/// What a stage returns.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutput {
    /// Replacement frames, same count as the input chunk.
    Frames(Volume),
    /// One value per input frame.
    Values(Vec<f64>),
}

/// The core trait every stage implements.
///
/// # Thread Safety
///
/// Stages must be `Send + Sync`; in-process dispatch calls `apply` from
/// several threads at once.
pub trait StageTransform: Send + Sync {
    /// Static description of the stage.
    fn descriptor(&self) -> StageDescriptor;

    /// Pixel plane of the output for an input plane.
    ///
    /// Only meaningful for frame-producing stages.
    fn output_plane(
        &self,
        plane: (usize, usize),
        _params: &StageParams,
    ) -> StageResult<(usize, usize)> {
        Ok(plane)
    }

    /// Whether `apply` returns frames (as opposed to per-frame values).
    fn produces_frames(&self) -> bool {
        true
    }

    /// Run the stage on one chunk.
    fn apply(&self, chunk: &StageChunk<'_>, ctx: &StageContext<'_>) -> StageResult<StageOutput>;
}

impl fmt::Debug for dyn StageTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StageTransform({})", self.descriptor().name)
    }
}

/// Per-frame image operation, monomorphised for each pixel type.
pub trait FrameKernel: Sync {
    /// Transform one frame. `index` is the absolute frame index.
    fn process<T: Pixel>(&self, frame: ArrayView2<'_, T>, index: usize) -> StageResult<Array2<T>>;
}

/// Per-frame reduction to a single value.
pub trait FrameReducer: Sync {
    /// Reduce one frame. `index` is the absolute frame index.
    fn reduce<T: Pixel>(&self, frame: ArrayView2<'_, T>, index: usize) -> StageResult<f64>;
}

/// Apply a kernel to every frame of a chunk.
pub fn map_frames<K: FrameKernel>(kernel: &K, chunk: &StageChunk<'_>) -> StageResult<Volume> {
    match &chunk.sample {
        VolumeView::F32(view) => map_typed(kernel, view, chunk.range.start),
        VolumeView::F64(view) => map_typed(kernel, view, chunk.range.start),
    }
}

fn map_typed<T: Pixel, K: FrameKernel>(
    kernel: &K,
    view: &ArrayView3<'_, T>,
    first: usize,
) -> StageResult<Volume> {
    let frames = view
        .outer_iter()
        .enumerate()
        .map(|(i, frame)| kernel.process(frame, first + i))
        .collect::<StageResult<Vec<_>>>()?;
    stack_frames(frames, view.dim())
}

/// Stack equally shaped frames along a new axis 0.
pub fn stack_frames<T: Pixel>(
    frames: Vec<Array2<T>>,
    input_dim: (usize, usize, usize),
) -> StageResult<Volume> {
    if frames.is_empty() {
        return Ok(T::wrap(ndarray::Array3::zeros((0, input_dim.1, input_dim.2))));
    }
    let views: Vec<_> = frames.iter().map(|f| f.view()).collect();
    let stacked = ndarray::stack(Axis(0), &views)
        .map_err(|e| StageError::Other(format!("frames differ in shape: {}", e)))?;
    Ok(T::wrap(stacked))
}

/// Reduce every frame of a chunk to one value.
pub fn reduce_frames<R: FrameReducer>(
    reducer: &R,
    chunk: &StageChunk<'_>,
) -> StageResult<Vec<f64>> {
    let first = chunk.range.start;
    match &chunk.sample {
        VolumeView::F32(view) => view
            .outer_iter()
            .enumerate()
            .map(|(i, frame)| reducer.reduce(frame, first + i))
            .collect(),
        VolumeView::F64(view) => view
            .outer_iter()
            .enumerate()
            .map(|(i, frame)| reducer.reduce(frame, first + i))
            .collect(),
    }
}

/// Average a stack of frames into one `f64` frame.
pub fn mean_frame(view: &VolumeView<'_>) -> StageResult<Array2<f64>> {
    let mean = match view {
        VolumeView::F32(v) => v.mapv(|x| x as f64).mean_axis(Axis(0)),
        VolumeView::F64(v) => v.mean_axis(Axis(0)),
    };
    mean.ok_or_else(|| StageError::Other("cannot average an empty stack".to_string()))
}

/// Mean of a frame widened to `f64`.
pub fn frame_mean<T: Pixel>(frame: &ArrayView2<'_, T>) -> f64 {
    let count = frame.len();
    if count == 0 {
        return 0.0;
    }
    frame.iter().map(|v| v.as_f64()).sum::<f64>() / count as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Dtype;
    use serde_json::json;

    struct AddIndex;

    impl FrameKernel for AddIndex {
        fn process<T: Pixel>(
            &self,
            frame: ArrayView2<'_, T>,
            index: usize,
        ) -> StageResult<Array2<T>> {
            Ok(frame.mapv(|v| v + T::of(index as f64)))
        }
    }

    struct Sum;

    impl FrameReducer for Sum {
        fn reduce<T: Pixel>(&self, frame: ArrayView2<'_, T>, _index: usize) -> StageResult<f64> {
            Ok(frame.iter().map(|v| v.as_f64()).sum())
        }
    }

    #[test]
    fn test_descriptor_builder() {
        let descriptor = StageDescriptor::builder("compute_scale_factors", "Compute Scale Factors")
            .category(Category::Normalisation)
            .produces("scale_factors")
            .condition(StageCondition::ReferencesOrAirRegion)
            .build();
        assert!(descriptor.parallel);
        assert_eq!(descriptor.produces, vec!["scale_factors"]);
        assert_eq!(descriptor.condition, StageCondition::ReferencesOrAirRegion);
    }

    #[test]
    fn test_params() {
        let params = StageParams::new()
            .with("size", 5)
            .with("threshold", 0.5)
            .with("mode", "bright")
            .with("roi", json!([1, 2, 5, 6]));

        assert_eq!(params.usize_or("size", 3).unwrap(), 5);
        assert_eq!(params.usize_or("missing", 3).unwrap(), 3);
        assert_eq!(params.f64_or("threshold", 1.0).unwrap(), 0.5);
        assert_eq!(params.str_or("mode", "dark").unwrap(), "bright");
        assert_eq!(
            params.require_region("roi").unwrap(),
            Region { left: 1, top: 2, right: 5, bottom: 6 }
        );
        assert!(params.usize_or("mode", 3).is_err());
        assert!(matches!(
            params.require_region("air"),
            Err(StageError::MissingParameter(_))
        ));
    }

    #[test]
    fn test_bad_region() {
        let params = StageParams::new().with("roi", json!([1, 2, 3]));
        assert!(matches!(
            params.region("roi"),
            Err(StageError::InvalidParameter { .. })
        ));

        let region = Region { left: 0, top: 0, right: 5, bottom: 2 };
        assert!(region.check_within((4, 4), "roi").is_err());
        assert!(region.check_within((4, 8), "roi").is_ok());
    }

    #[test]
    fn test_map_frames_uses_absolute_index() {
        let volume = Volume::zeros(Dtype::Float32, [6, 2, 2]);
        let range = ChunkRange::new(2, 5);
        let chunk = StageChunk {
            sample: volume.slice_frames(range),
            flat: None,
            dark: None,
            range,
        };
        let out = map_frames(&AddIndex, &chunk).unwrap();
        assert_eq!(out.shape(), [3, 2, 2]);
        assert_eq!(out.get([0, 0, 0]), Some(2.0));
        assert_eq!(out.get([2, 1, 1]), Some(4.0));
    }

    #[test]
    fn test_reduce_frames() {
        let volume = Volume::from_fn(Dtype::Float64, [3, 2, 2], |z, _, _| z as f64);
        let values = reduce_frames(&Sum, &StageChunk::whole(volume.view())).unwrap();
        assert_eq!(values, vec![0.0, 4.0, 8.0]);
    }

    #[test]
    fn test_mean_frame() {
        let volume = Volume::from_fn(Dtype::Float32, [4, 1, 2], |z, _, x| (z + x) as f64);
        let mean = mean_frame(&volume.view()).unwrap();
        assert_eq!(mean[[0, 0]], 1.5);
        assert_eq!(mean[[0, 1]], 2.5);
    }

    #[test]
    fn test_side_values_subset() {
        let mut values = SideValues::new();
        values.insert("a", vec![1.0]);
        values.insert("b", vec![2.0]);
        let subset = values.subset(&["b", "c"]);
        assert_eq!(subset.len(), 1);
        assert_eq!(subset.get("b"), Some(&[2.0][..]));
        assert!(matches!(
            subset.require("a"),
            Err(StageError::MissingSideValue(_))
        ));
    }
}
