//! Intensity stages: CutOff, MinusLog

use crate::core::error::{StageError, StageResult};
use crate::core::types::Pixel;
use crate::filters::builtin::normalise::MINIMUM_PIXEL_VALUE;
use crate::filters::registry::StageRegistry;
use crate::filters::stage::{
    map_frames, Category, FrameKernel, StageChunk, StageContext, StageDescriptor, StageOutput,
    StageTransform,
};
use ndarray::{Array2, ArrayView2};

/// Register intensity stages.
pub fn register(registry: &mut StageRegistry) {
    registry.register(CutOff);
    registry.register(MinusLog);
}

/// Clamps every pixel to a fraction of its frame's maximum.
#[derive(Debug, Clone)]
pub struct CutOff;

struct CutOffKernel {
    level: f64,
}

impl FrameKernel for CutOffKernel {
    fn process<T: Pixel>(&self, frame: ArrayView2<'_, T>, _index: usize) -> StageResult<Array2<T>> {
        let max = frame
            .iter()
            .map(|v| v.as_f64())
            .fold(f64::NEG_INFINITY, f64::max);
        let limit = max * self.level;
        Ok(frame.mapv(|v| if v.as_f64() > limit { T::of(limit) } else { v }))
    }
}

impl StageTransform for CutOff {
    fn descriptor(&self) -> StageDescriptor {
        StageDescriptor::builder("cut_off", "Cut Off")
            .description("Clamp pixels above level * frame maximum")
            .category(Category::Intensity)
            .parallel(false)
            .build()
    }

    fn apply(&self, chunk: &StageChunk<'_>, ctx: &StageContext<'_>) -> StageResult<StageOutput> {
        let level = ctx
            .params
            .get("level")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| StageError::MissingParameter("level".to_string()))?;
        if !(level > 0.0 && level <= 1.0) {
            return Err(StageError::InvalidParameter {
                name: "level".to_string(),
                reason: format!("must be within (0, 1], got {}", level),
            });
        }
        Ok(StageOutput::Frames(map_frames(&CutOffKernel { level }, chunk)?))
    }
}

/// Converts transmission to attenuation: `-ln(x)`.
#[derive(Debug, Clone)]
pub struct MinusLog;

struct MinusLogKernel;

impl FrameKernel for MinusLogKernel {
    fn process<T: Pixel>(&self, frame: ArrayView2<'_, T>, _index: usize) -> StageResult<Array2<T>> {
        Ok(frame.mapv(|v| T::of(-v.as_f64().max(MINIMUM_PIXEL_VALUE).ln())))
    }
}

impl StageTransform for MinusLog {
    fn descriptor(&self) -> StageDescriptor {
        StageDescriptor::builder("minus_log", "Minus Log")
            .description("Take -ln of every pixel; must be the last pre-processing stage")
            .category(Category::Intensity)
            .parallel(false)
            .build()
    }

    fn apply(&self, chunk: &StageChunk<'_>, _ctx: &StageContext<'_>) -> StageResult<StageOutput> {
        Ok(StageOutput::Frames(map_frames(&MinusLogKernel, chunk)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Dtype, Volume};
    use crate::filters::stage::{SideValues, StageParams};

    fn run(
        stage: &dyn StageTransform,
        volume: &Volume,
        params: StageParams,
    ) -> StageResult<Volume> {
        let side = SideValues::new();
        let ctx = StageContext {
            params: &params,
            side_values: &side,
        };
        match stage.apply(&StageChunk::whole(volume.view()), &ctx)? {
            StageOutput::Frames(v) => Ok(v),
            StageOutput::Values(_) => panic!("expected frames"),
        }
    }

    #[test]
    fn test_cut_off() {
        let volume = Volume::from_fn(Dtype::Float64, [1, 1, 4], |_, _, x| x as f64 * 10.0);
        let out = run(&CutOff, &volume, StageParams::new().with("level", 0.5)).unwrap();
        assert_eq!(out.get([0, 0, 1]), Some(10.0));
        assert_eq!(out.get([0, 0, 3]), Some(15.0));
        assert!(run(&CutOff, &volume, StageParams::new()).is_err());
        assert!(run(&CutOff, &volume, StageParams::new().with("level", 2.0)).is_err());
    }

    #[test]
    fn test_minus_log() {
        let volume = Volume::from_fn(Dtype::Float64, [1, 1, 3], |_, _, x| {
            [1.0, std::f64::consts::E, 0.0][x]
        });
        let out = run(&MinusLog, &volume, StageParams::new()).unwrap();
        assert_eq!(out.get([0, 0, 0]), Some(0.0));
        assert!((out.get([0, 0, 1]).unwrap() + 1.0).abs() < 1e-12);
        assert!(out.get([0, 0, 2]).unwrap().is_finite());
    }
}
