//! Normalisation stages: flat/dark, air region and scale factors

use crate::core::error::{StageError, StageResult};
use crate::core::types::Pixel;
use crate::filters::registry::StageRegistry;
use crate::filters::stage::{
    frame_mean, map_frames, mean_frame, reduce_frames, Category, FrameKernel, FrameReducer,
    Region, StageChunk, StageCondition, StageContext, StageDescriptor, StageOutput,
    StageTransform,
};
use ndarray::{Array2, ArrayView2, Zip};

/// Smallest denominator used when dividing by reference intensities.
pub const MINIMUM_PIXEL_VALUE: f64 = 1e-6;

/// Side-value key holding per-frame scale factors.
pub const SCALE_FACTORS: &str = "scale_factors";

/// Register normalisation stages.
pub fn register(registry: &mut StageRegistry) {
    registry.register(ComputeScaleFactors);
    registry.register(FlatDarkNormalisation);
    registry.register(AirRegionNormalisation);
    registry.register(ApplyScaleFactors);
}

/// Records the mean of a region of every frame, before normalisation
/// changes the intensities.
#[derive(Debug, Clone)]
pub struct ComputeScaleFactors;

struct RegionMean {
    region: Option<Region>,
}

impl FrameReducer for RegionMean {
    fn reduce<T: Pixel>(&self, frame: ArrayView2<'_, T>, _index: usize) -> StageResult<f64> {
        Ok(match &self.region {
            Some(region) => frame_mean(&region.of(&frame)),
            None => frame_mean(&frame),
        })
    }
}

impl StageTransform for ComputeScaleFactors {
    fn descriptor(&self) -> StageDescriptor {
        StageDescriptor::builder("compute_scale_factors", "Compute Scale Factors")
            .description("Mean of a region of interest in every frame")
            .category(Category::Normalisation)
            .produces(SCALE_FACTORS)
            .condition(StageCondition::ReferencesOrAirRegion)
            .build()
    }

    fn produces_frames(&self) -> bool {
        false
    }

    fn apply(&self, chunk: &StageChunk<'_>, ctx: &StageContext<'_>) -> StageResult<StageOutput> {
        let region = ctx.params.region("roi")?;
        if let Some(region) = &region {
            region.check_within(chunk.sample.plane(), "roi")?;
        }
        Ok(StageOutput::Values(reduce_frames(&RegionMean { region }, chunk)?))
    }
}

/// Normalises by the averaged flat and dark references:
/// `(sample - dark) / (flat - dark)`.
#[derive(Debug, Clone)]
pub struct FlatDarkNormalisation;

struct FlatDarkKernel {
    dark: Array2<f64>,
    denominator: Array2<f64>,
}

impl FrameKernel for FlatDarkKernel {
    fn process<T: Pixel>(&self, frame: ArrayView2<'_, T>, _index: usize) -> StageResult<Array2<T>> {
        if frame.dim() != self.dark.dim() {
            return Err(StageError::Other(format!(
                "frame {:?} does not match references {:?}",
                frame.dim(),
                self.dark.dim()
            )));
        }
        Ok(Zip::from(&frame)
            .and(&self.dark)
            .and(&self.denominator)
            .map_collect(|s, d, den| T::of((s.as_f64() - d) / den)))
    }
}

impl StageTransform for FlatDarkNormalisation {
    fn descriptor(&self) -> StageDescriptor {
        StageDescriptor::builder("flat_dark_normalisation", "Flat/Dark Normalisation")
            .description("Background correction with averaged flat and dark fields")
            .category(Category::Normalisation)
            .uses_references()
            .build()
    }

    fn apply(&self, chunk: &StageChunk<'_>, _ctx: &StageContext<'_>) -> StageResult<StageOutput> {
        let (flat, dark) = chunk.references()?;
        let flat = mean_frame(flat)?;
        let dark = mean_frame(dark)?;
        let denominator = (&flat - &dark).mapv(|v| v.max(MINIMUM_PIXEL_VALUE));
        let kernel = FlatDarkKernel { dark, denominator };
        Ok(StageOutput::Frames(map_frames(&kernel, chunk)?))
    }
}

/// Divides every frame by the mean of a region known to contain only air.
#[derive(Debug, Clone)]
pub struct AirRegionNormalisation;

struct AirRegionKernel {
    region: Region,
}

impl FrameKernel for AirRegionKernel {
    fn process<T: Pixel>(&self, frame: ArrayView2<'_, T>, _index: usize) -> StageResult<Array2<T>> {
        let air = frame_mean(&self.region.of(&frame));
        let divisor = if air.abs() < MINIMUM_PIXEL_VALUE {
            MINIMUM_PIXEL_VALUE
        } else {
            air
        };
        Ok(frame.mapv(|v| T::of(v.as_f64() / divisor)))
    }
}

impl StageTransform for AirRegionNormalisation {
    fn descriptor(&self) -> StageDescriptor {
        StageDescriptor::builder("air_region_normalisation", "Air Region Normalisation")
            .description("Normalise every frame by the mean of an air region")
            .category(Category::Normalisation)
            .build()
    }

    fn apply(&self, chunk: &StageChunk<'_>, ctx: &StageContext<'_>) -> StageResult<StageOutput> {
        let region = ctx.params.require_region("air")?;
        region.check_within(chunk.sample.plane(), "air")?;
        Ok(StageOutput::Frames(map_frames(&AirRegionKernel { region }, chunk)?))
    }
}

/// Multiplies every frame by the mean of the recorded scale factors, which
/// restores the contrast of the region they were measured in.
#[derive(Debug, Clone)]
pub struct ApplyScaleFactors;

struct ScaleKernel {
    scale: f64,
}

impl FrameKernel for ScaleKernel {
    fn process<T: Pixel>(&self, frame: ArrayView2<'_, T>, _index: usize) -> StageResult<Array2<T>> {
        Ok(frame.mapv(|v| T::of(v.as_f64() * self.scale)))
    }
}

impl StageTransform for ApplyScaleFactors {
    fn descriptor(&self) -> StageDescriptor {
        StageDescriptor::builder("apply_scale_factors", "Apply Scale Factors")
            .description("Scale every frame by the mean of the recorded scale factors")
            .category(Category::Normalisation)
            .consumes(SCALE_FACTORS)
            .build()
    }

    fn apply(&self, chunk: &StageChunk<'_>, ctx: &StageContext<'_>) -> StageResult<StageOutput> {
        let factors = ctx.side_values.require(SCALE_FACTORS)?;
        if factors.is_empty() {
            return Err(StageError::MissingSideValue(SCALE_FACTORS.to_string()));
        }
        let scale = factors.iter().sum::<f64>() / factors.len() as f64;
        Ok(StageOutput::Frames(map_frames(&ScaleKernel { scale }, chunk)?))
    }
}
