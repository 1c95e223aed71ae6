//! Geometry stages: Rotate, Crop, Rebin, CircularMask

use crate::core::error::{StageError, StageResult};
use crate::core::types::Pixel;
use crate::filters::registry::StageRegistry;
use crate::filters::stage::{
    map_frames, Category, FrameKernel, Region, StageChunk, StageContext, StageDescriptor,
    StageOutput, StageParams, StageTransform,
};
use ndarray::{Array2, ArrayView2};

/// Register geometry stages.
pub fn register(registry: &mut StageRegistry) {
    registry.register(Rotate);
    registry.register(Crop);
    registry.register(Rebin);
    registry.register(CircularMask);
}

/// Rotates every frame by a multiple of 90 degrees, counter-clockwise.
#[derive(Debug, Clone)]
pub struct Rotate;

impl Rotate {
    fn quarter_turns(params: &StageParams) -> StageResult<usize> {
        Ok(params.i64_or("quarter_turns", 1)?.rem_euclid(4) as usize)
    }
}

struct RotateKernel {
    turns: usize,
}

impl FrameKernel for RotateKernel {
    fn process<T: Pixel>(&self, frame: ArrayView2<'_, T>, _index: usize) -> StageResult<Array2<T>> {
        let (rows, cols) = frame.dim();
        Ok(match self.turns {
            1 => Array2::from_shape_fn((cols, rows), |(i, j)| frame[[j, cols - 1 - i]]),
            2 => Array2::from_shape_fn((rows, cols), |(i, j)| frame[[rows - 1 - i, cols - 1 - j]]),
            3 => Array2::from_shape_fn((cols, rows), |(i, j)| frame[[rows - 1 - j, i]]),
            _ => frame.to_owned(),
        })
    }
}

impl StageTransform for Rotate {
    fn descriptor(&self) -> StageDescriptor {
        StageDescriptor::builder("rotate", "Rotate")
            .description("Rotate every frame by quarter turns counter-clockwise")
            .category(Category::Geometry)
            .applies_to_references()
            .build()
    }

    fn output_plane(
        &self,
        plane: (usize, usize),
        params: &StageParams,
    ) -> StageResult<(usize, usize)> {
        Ok(if Self::quarter_turns(params)? % 2 == 1 {
            (plane.1, plane.0)
        } else {
            plane
        })
    }

    fn apply(&self, chunk: &StageChunk<'_>, ctx: &StageContext<'_>) -> StageResult<StageOutput> {
        let kernel = RotateKernel {
            turns: Self::quarter_turns(ctx.params)?,
        };
        Ok(StageOutput::Frames(map_frames(&kernel, chunk)?))
    }
}

/// Crops every frame to a region of interest.
#[derive(Debug, Clone)]
pub struct Crop;

impl Crop {
    fn region(params: &StageParams, plane: (usize, usize)) -> StageResult<Region> {
        let region = params.require_region("roi")?;
        region.check_within(plane, "roi")?;
        Ok(region)
    }
}

struct CropKernel {
    region: Region,
}

impl FrameKernel for CropKernel {
    fn process<T: Pixel>(&self, frame: ArrayView2<'_, T>, _index: usize) -> StageResult<Array2<T>> {
        Ok(self.region.of(&frame).to_owned())
    }
}

impl StageTransform for Crop {
    fn descriptor(&self) -> StageDescriptor {
        StageDescriptor::builder("crop", "Crop Coordinates")
            .description("Keep only the [left, top, right, bottom) region of every frame")
            .category(Category::Geometry)
            .applies_to_references()
            .build()
    }

    fn output_plane(
        &self,
        plane: (usize, usize),
        params: &StageParams,
    ) -> StageResult<(usize, usize)> {
        let region = Self::region(params, plane)?;
        Ok((region.height(), region.width()))
    }

    fn apply(&self, chunk: &StageChunk<'_>, ctx: &StageContext<'_>) -> StageResult<StageOutput> {
        let kernel = CropKernel {
            region: Self::region(ctx.params, chunk.sample.plane())?,
        };
        Ok(StageOutput::Frames(map_frames(&kernel, chunk)?))
    }
}

/// Bins every frame down by an integer factor, averaging each block.
#[derive(Debug, Clone)]
pub struct Rebin;

impl Rebin {
    fn factor(params: &StageParams) -> StageResult<usize> {
        let factor = params.usize_or("factor", 2)?;
        if factor == 0 {
            return Err(StageError::InvalidParameter {
                name: "factor".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(factor)
    }
}

struct RebinKernel {
    factor: usize,
}

impl FrameKernel for RebinKernel {
    fn process<T: Pixel>(&self, frame: ArrayView2<'_, T>, _index: usize) -> StageResult<Array2<T>> {
        let f = self.factor;
        let (rows, cols) = frame.dim();
        let block = (f * f) as f64;
        Ok(Array2::from_shape_fn((rows / f, cols / f), |(i, j)| {
            let mut sum = 0.0;
            for y in i * f..(i + 1) * f {
                for x in j * f..(j + 1) * f {
                    sum += frame[[y, x]].as_f64();
                }
            }
            T::of(sum / block)
        }))
    }
}

impl StageTransform for Rebin {
    fn descriptor(&self) -> StageDescriptor {
        StageDescriptor::builder("rebin", "Rebin")
            .description("Reduce resolution by averaging factor x factor pixel blocks")
            .category(Category::Geometry)
            .applies_to_references()
            .build()
    }

    fn output_plane(
        &self,
        plane: (usize, usize),
        params: &StageParams,
    ) -> StageResult<(usize, usize)> {
        let factor = Self::factor(params)?;
        let out = (plane.0 / factor, plane.1 / factor);
        if out.0 == 0 || out.1 == 0 {
            return Err(StageError::InvalidParameter {
                name: "factor".to_string(),
                reason: format!("{} leaves no pixels of a {}x{} image", factor, plane.0, plane.1),
            });
        }
        Ok(out)
    }

    fn apply(&self, chunk: &StageChunk<'_>, ctx: &StageContext<'_>) -> StageResult<StageOutput> {
        self.output_plane(chunk.sample.plane(), ctx.params)?;
        let kernel = RebinKernel {
            factor: Self::factor(ctx.params)?,
        };
        Ok(StageOutput::Frames(map_frames(&kernel, chunk)?))
    }
}

/// Sets every pixel outside a centred circle to a constant.
#[derive(Debug, Clone)]
pub struct CircularMask;

struct CircularMaskKernel {
    ratio: f64,
    value: f64,
}

impl FrameKernel for CircularMaskKernel {
    fn process<T: Pixel>(&self, frame: ArrayView2<'_, T>, _index: usize) -> StageResult<Array2<T>> {
        let (rows, cols) = frame.dim();
        let cy = (rows as f64 - 1.0) / 2.0;
        let cx = (cols as f64 - 1.0) / 2.0;
        let radius = self.ratio * rows.min(cols) as f64 / 2.0;
        let fill = T::of(self.value);

        let mut out = frame.to_owned();
        for ((y, x), v) in out.indexed_iter_mut() {
            let dy = y as f64 - cy;
            let dx = x as f64 - cx;
            if (dy * dy + dx * dx).sqrt() > radius {
                *v = fill;
            }
        }
        Ok(out)
    }
}

impl StageTransform for CircularMask {
    fn descriptor(&self) -> StageDescriptor {
        StageDescriptor::builder("circular_mask", "Circular Mask")
            .description("Set pixels outside radius * min(rows, cols) / 2 to a value")
            .category(Category::Geometry)
            .parallel(false)
            .build()
    }

    fn apply(&self, chunk: &StageChunk<'_>, ctx: &StageContext<'_>) -> StageResult<StageOutput> {
        let ratio = ctx.params.f64_or("radius", 0.95)?;
        if !(0.0..=1.0).contains(&ratio) {
            return Err(StageError::InvalidParameter {
                name: "radius".to_string(),
                reason: format!("must be within [0, 1], got {}", ratio),
            });
        }
        let kernel = CircularMaskKernel {
            ratio,
            value: ctx.params.f64_or("value", 0.0)?,
        };
        Ok(StageOutput::Frames(map_frames(&kernel, chunk)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Dtype, Volume};
    use crate::filters::stage::SideValues;
    use serde_json::json;

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

    fn numbered(rows: usize, cols: usize) -> Volume {
        Volume::from_fn(Dtype::Float32, [1, rows, cols], |_, y, x| (y * cols + x) as f64)
    }

    #[test]
    fn test_rotate_quarter_turn() {
        // [[0, 1, 2],
        //  [3, 4, 5]] -> [[2, 5], [1, 4], [0, 3]]
        let out = run(&Rotate, &numbered(2, 3), StageParams::new()).unwrap();
        assert_eq!(out.shape(), [1, 3, 2]);
        assert_eq!(out.get([0, 0, 0]), Some(2.0));
        assert_eq!(out.get([0, 0, 1]), Some(5.0));
        assert_eq!(out.get([0, 2, 0]), Some(0.0));
        assert_eq!(Rotate.output_plane((2, 3), &StageParams::new()).unwrap(), (3, 2));
    }

    #[test]
    fn test_rotate_full_circle() {
        let input = numbered(3, 4);
        let mut out = input.clone();
        for _ in 0..4 {
            out = run(&Rotate, &out, StageParams::new()).unwrap();
        }
        assert!(out.bitwise_eq(&input));

        let half = run(&Rotate, &input, StageParams::new().with("quarter_turns", -2)).unwrap();
        assert_eq!(half.get([0, 0, 0]), Some(11.0));
    }

    #[test]
    fn test_crop() {
        let params = StageParams::new().with("roi", json!([1, 0, 3, 2]));
        let out = run(&Crop, &numbered(3, 4), params.clone()).unwrap();
        assert_eq!(out.shape(), [1, 2, 2]);
        assert_eq!(out.get([0, 0, 0]), Some(1.0));
        assert_eq!(out.get([0, 1, 1]), Some(6.0));
        assert_eq!(Crop.output_plane((3, 4), &params).unwrap(), (2, 2));
    }

    #[test]
    fn test_crop_outside_image_fails() {
        let params = StageParams::new().with("roi", json!([0, 0, 10, 10]));
        assert!(run(&Crop, &numbered(3, 4), params).is_err());
        assert!(matches!(
            run(&Crop, &numbered(3, 4), StageParams::new()),
            Err(StageError::MissingParameter(_))
        ));
    }

    #[test]
    fn test_rebin_averages_blocks() {
        let out = run(&Rebin, &numbered(4, 4), StageParams::new()).unwrap();
        assert_eq!(out.shape(), [1, 2, 2]);
        // (0 + 1 + 4 + 5) / 4
        assert_eq!(out.get([0, 0, 0]), Some(2.5));
        assert!(Rebin.output_plane((1, 1), &StageParams::new()).is_err());
    }

    #[test]
    fn test_circular_mask() {
        let volume = Volume::from_fn(Dtype::Float64, [1, 5, 5], |_, _, _| 1.0);
        let params = StageParams::new().with("radius", 1.0).with("value", -1.0);
        let out = run(&CircularMask, &volume, params).unwrap();
        assert_eq!(out.get([0, 2, 2]), Some(1.0));
        assert_eq!(out.get([0, 0, 0]), Some(-1.0));
        assert_eq!(out.get([0, 0, 2]), Some(1.0));
    }
}
