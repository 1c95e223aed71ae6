//! Denoising stages: StripeRemoval, OutlierRemoval, MedianFilter, GaussianFilter, RingRemoval

use crate::core::error::{StageError, StageResult};
use crate::core::types::Pixel;
use crate::filters::registry::StageRegistry;
use crate::filters::stage::{
    frame_mean, map_frames, Category, FrameKernel, StageChunk, StageContext, StageDescriptor,
    StageOutput, StageParams, StageTransform,
};
use ndarray::{Array2, ArrayView2, Axis};

/// Register denoising stages.
pub fn register(registry: &mut StageRegistry) {
    registry.register(StripeRemoval);
    registry.register(OutlierRemoval);
    registry.register(MedianFilter);
    registry.register(GaussianFilter);
    registry.register(RingRemoval);
}

/// Clamp an index into `0..len`.
fn clamp_index(i: isize, len: usize) -> usize {
    i.clamp(0, len as isize - 1) as usize
}

/// Reflect an index into `0..len`, mirroring about the edges
/// (`d c b a | a b c d | d c b a`).
fn reflect_index(mut i: isize, len: usize) -> usize {
    let n = len as isize;
    if n == 1 {
        return 0;
    }
    let period = 2 * n;
    i = i.rem_euclid(period);
    if i >= n {
        i = period - 1 - i;
    }
    i as usize
}

/// Median of a square window around every pixel, with clamped edges.
fn median_of<T: Pixel>(frame: &ArrayView2<'_, T>, size: usize) -> Array2<f64> {
    let (rows, cols) = frame.dim();
    let radius = (size / 2) as isize;
    let mut window = Vec::with_capacity(size * size);
    Array2::from_shape_fn((rows, cols), |(y, x)| {
        window.clear();
        for dy in -radius..=radius {
            let yy = clamp_index(y as isize + dy, rows);
            for dx in -radius..=radius {
                let xx = clamp_index(x as isize + dx, cols);
                window.push(frame[[yy, xx]].as_f64());
            }
        }
        window.sort_by(|a, b| a.total_cmp(b));
        window[window.len() / 2]
    })
}

fn odd_size(params: &StageParams, key: &str, default: usize) -> StageResult<usize> {
    let size = params.usize_or(key, default)?;
    if size == 0 || size % 2 == 0 {
        return Err(StageError::InvalidParameter {
            name: key.to_string(),
            reason: format!("window size must be odd, got {}", size),
        });
    }
    Ok(size)
}

/// Removes vertical stripes by flattening each column's mean to the frame mean.
#[derive(Debug, Clone)]
pub struct StripeRemoval;

struct StripeKernel {
    strength: f64,
}

impl FrameKernel for StripeKernel {
    fn process<T: Pixel>(&self, frame: ArrayView2<'_, T>, _index: usize) -> StageResult<Array2<T>> {
        if frame.is_empty() {
            return Ok(frame.to_owned());
        }
        let mean = frame_mean(&frame);
        let column_means: Vec<f64> = frame
            .axis_iter(Axis(1))
            .map(|column| frame_mean_1d(column.iter().map(|v| v.as_f64())))
            .collect();
        Ok(Array2::from_shape_fn(frame.dim(), |(y, x)| {
            let offset = (column_means[x] - mean) * self.strength;
            T::of(frame[[y, x]].as_f64() - offset)
        }))
    }
}

fn frame_mean_1d(values: impl ExactSizeIterator<Item = f64>) -> f64 {
    let count = values.len();
    if count == 0 {
        return 0.0;
    }
    values.sum::<f64>() / count as f64
}

impl StageTransform for StripeRemoval {
    fn descriptor(&self) -> StageDescriptor {
        StageDescriptor::builder("stripe_removal", "Stripe Removal")
            .description("Subtract each column's deviation from the frame mean")
            .category(Category::Denoise)
            .build()
    }

    fn apply(&self, chunk: &StageChunk<'_>, ctx: &StageContext<'_>) -> StageResult<StageOutput> {
        let kernel = StripeKernel {
            strength: ctx.params.f64_or("strength", 1.0)?,
        };
        Ok(StageOutput::Frames(map_frames(&kernel, chunk)?))
    }
}

/// Replaces pixels that differ from their local median by more than a threshold.
#[derive(Debug, Clone)]
pub struct OutlierRemoval;

/// Which side of the median counts as an outlier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutlierMode {
    Bright,
    Dark,
}

struct OutlierKernel {
    threshold: f64,
    size: usize,
    mode: OutlierMode,
}

impl FrameKernel for OutlierKernel {
    fn process<T: Pixel>(&self, frame: ArrayView2<'_, T>, _index: usize) -> StageResult<Array2<T>> {
        let median = median_of(&frame, self.size);
        Ok(Array2::from_shape_fn(frame.dim(), |(y, x)| {
            let v = frame[[y, x]];
            let m = median[[y, x]];
            let diff = match self.mode {
                OutlierMode::Bright => v.as_f64() - m,
                OutlierMode::Dark => m - v.as_f64(),
            };
            if diff > self.threshold {
                T::of(m)
            } else {
                v
            }
        }))
    }
}

impl StageTransform for OutlierRemoval {
    fn descriptor(&self) -> StageDescriptor {
        StageDescriptor::builder("outlier_removal", "Outlier Removal")
            .description("Replace bright or dark outliers with the local median")
            .category(Category::Denoise)
            .build()
    }

    fn apply(&self, chunk: &StageChunk<'_>, ctx: &StageContext<'_>) -> StageResult<StageOutput> {
        let threshold = ctx
            .params
            .get("threshold")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| StageError::MissingParameter("threshold".to_string()))?;
        let mode = match ctx.params.str_or("mode", "bright")? {
            "bright" => OutlierMode::Bright,
            "dark" => OutlierMode::Dark,
            other => {
                return Err(StageError::InvalidParameter {
                    name: "mode".to_string(),
                    reason: format!("expected 'bright' or 'dark', got '{}'", other),
                })
            }
        };
        let kernel = OutlierKernel {
            threshold,
            size: odd_size(ctx.params, "radius", 3)?,
            mode,
        };
        Ok(StageOutput::Frames(map_frames(&kernel, chunk)?))
    }
}

/// Median filter over a square window.
#[derive(Debug, Clone)]
pub struct MedianFilter;

struct MedianKernel {
    size: usize,
}

impl FrameKernel for MedianKernel {
    fn process<T: Pixel>(&self, frame: ArrayView2<'_, T>, _index: usize) -> StageResult<Array2<T>> {
        Ok(median_of(&frame, self.size).mapv(T::of))
    }
}

impl StageTransform for MedianFilter {
    fn descriptor(&self) -> StageDescriptor {
        StageDescriptor::builder("median_filter", "Median Filter")
            .description("Median of an odd-sized square window")
            .category(Category::Denoise)
            .build()
    }

    fn apply(&self, chunk: &StageChunk<'_>, ctx: &StageContext<'_>) -> StageResult<StageOutput> {
        let kernel = MedianKernel {
            size: odd_size(ctx.params, "size", 3)?,
        };
        Ok(StageOutput::Frames(map_frames(&kernel, chunk)?))
    }
}

/// Separable Gaussian blur with reflected edges.
#[derive(Debug, Clone)]
pub struct GaussianFilter;

struct GaussianKernel {
    weights: Vec<f64>,
}

impl GaussianKernel {
    fn new(sigma: f64, truncate: f64) -> Self {
        let radius = (truncate * sigma + 0.5) as isize;
        let mut weights: Vec<f64> = (-radius..=radius)
            .map(|i| (-0.5 * (i as f64 / sigma).powi(2)).exp())
            .collect();
        let total: f64 = weights.iter().sum();
        for w in &mut weights {
            *w /= total;
        }
        Self { weights }
    }

    fn radius(&self) -> isize {
        (self.weights.len() / 2) as isize
    }
}

impl FrameKernel for GaussianKernel {
    fn process<T: Pixel>(&self, frame: ArrayView2<'_, T>, _index: usize) -> StageResult<Array2<T>> {
        let (rows, cols) = frame.dim();
        let r = self.radius();

        let horizontal = Array2::from_shape_fn((rows, cols), |(y, x)| {
            self.weights
                .iter()
                .zip(-r..=r)
                .map(|(w, d)| w * frame[[y, reflect_index(x as isize + d, cols)]].as_f64())
                .sum::<f64>()
        });
        Ok(Array2::from_shape_fn((rows, cols), |(y, x)| {
            let v = self
                .weights
                .iter()
                .zip(-r..=r)
                .map(|(w, d)| w * horizontal[[reflect_index(y as isize + d, rows), x]])
                .sum::<f64>();
            T::of(v)
        }))
    }
}

impl StageTransform for GaussianFilter {
    fn descriptor(&self) -> StageDescriptor {
        StageDescriptor::builder("gaussian_filter", "Gaussian Filter")
            .description("Separable Gaussian blur")
            .category(Category::Denoise)
            .build()
    }

    fn apply(&self, chunk: &StageChunk<'_>, ctx: &StageContext<'_>) -> StageResult<StageOutput> {
        let sigma = ctx.params.f64_or("sigma", 1.0)?;
        let truncate = ctx.params.f64_or("truncate", 4.0)?;
        if !(sigma > 0.0 && sigma.is_finite()) || !(truncate > 0.0 && truncate.is_finite()) {
            return Err(StageError::InvalidParameter {
                name: "sigma".to_string(),
                reason: format!(
                    "sigma and truncate must be positive, got {} and {}",
                    sigma, truncate
                ),
            });
        }
        let kernel = GaussianKernel::new(sigma, truncate);
        Ok(StageOutput::Frames(map_frames(&kernel, chunk)?))
    }
}

/// Subtracts the deviation of each concentric ring's mean from the frame mean.
#[derive(Debug, Clone)]
pub struct RingRemoval;

struct RingKernel {
    center: Option<(f64, f64)>,
    strength: f64,
}

impl FrameKernel for RingKernel {
    fn process<T: Pixel>(&self, frame: ArrayView2<'_, T>, _index: usize) -> StageResult<Array2<T>> {
        let (rows, cols) = frame.dim();
        if frame.is_empty() {
            return Ok(frame.to_owned());
        }
        let (cx, cy) = self
            .center
            .unwrap_or(((cols as f64 - 1.0) / 2.0, (rows as f64 - 1.0) / 2.0));
        let ring_of = |y: usize, x: usize| {
            let dx = x as f64 - cx;
            let dy = y as f64 - cy;
            (dx * dx + dy * dy).sqrt().round() as usize
        };

        let max_ring = frame
            .indexed_iter()
            .map(|((y, x), _)| ring_of(y, x))
            .max()
            .unwrap_or(0);
        let mut sums = vec![0.0; max_ring + 1];
        let mut counts = vec![0usize; max_ring + 1];
        for ((y, x), v) in frame.indexed_iter() {
            let ring = ring_of(y, x);
            sums[ring] += v.as_f64();
            counts[ring] += 1;
        }

        let mean = frame_mean(&frame);
        Ok(Array2::from_shape_fn((rows, cols), |(y, x)| {
            let ring = ring_of(y, x);
            let ring_mean = sums[ring] / counts[ring] as f64;
            T::of(frame[[y, x]].as_f64() - (ring_mean - mean) * self.strength)
        }))
    }
}

impl StageTransform for RingRemoval {
    fn descriptor(&self) -> StageDescriptor {
        StageDescriptor::builder("ring_removal", "Ring Removal")
            .description("Flatten the radial mean profile about a centre")
            .category(Category::Denoise)
            .build()
    }

    fn apply(&self, chunk: &StageChunk<'_>, ctx: &StageContext<'_>) -> StageResult<StageOutput> {
        let center = match (ctx.params.get("center_x"), ctx.params.get("center_y")) {
            (None, None) => None,
            _ => Some((
                ctx.params.f64_or("center_x", 0.0)?,
                ctx.params.f64_or("center_y", 0.0)?,
            )),
        };
        let kernel = RingKernel {
            center,
            strength: ctx.params.f64_or("strength", 1.0)?,
        };
        Ok(StageOutput::Frames(map_frames(&kernel, chunk)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Dtype, Volume};
    use crate::filters::stage::SideValues;

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

    fn spike() -> Volume {
        Volume::from_fn(Dtype::Float32, [2, 5, 5], |_, y, x| {
            if (y, x) == (2, 2) {
                100.0
            } else {
                1.0
            }
        })
    }

    #[test]
    fn test_reflect_index() {
        assert_eq!(reflect_index(-1, 4), 0);
        assert_eq!(reflect_index(-2, 4), 1);
        assert_eq!(reflect_index(4, 4), 3);
        assert_eq!(reflect_index(5, 4), 2);
        assert_eq!(reflect_index(3, 1), 0);
    }

    #[test]
    fn test_median_removes_spike() {
        let out = run(&MedianFilter, &spike(), StageParams::new()).unwrap();
        assert_eq!(out.get([1, 2, 2]), Some(1.0));
        assert!(run(&MedianFilter, &spike(), StageParams::new().with("size", 4)).is_err());
    }

    #[test]
    fn test_outliers_bright_and_dark() {
        let params = StageParams::new().with("threshold", 10.0);
        let out = run(&OutlierRemoval, &spike(), params.clone()).unwrap();
        assert_eq!(out.get([0, 2, 2]), Some(1.0));

        let dark = run(&OutlierRemoval, &spike(), params.with("mode", "dark")).unwrap();
        assert_eq!(dark.get([0, 2, 2]), Some(100.0));

        assert!(matches!(
            run(&OutlierRemoval, &spike(), StageParams::new()),
            Err(StageError::MissingParameter(_))
        ));
    }

    #[test]
    fn test_gaussian_preserves_constant() {
        let volume = Volume::from_fn(Dtype::Float64, [1, 6, 7], |_, _, _| 3.0);
        let out = run(&GaussianFilter, &volume, StageParams::new().with("sigma", 1.5)).unwrap();
        for v in out.iter_f64() {
            assert!((v - 3.0).abs() < 1e-12);
        }
        assert!(run(&GaussianFilter, &volume, StageParams::new().with("sigma", 0.0)).is_err());
    }

    #[test]
    fn test_gaussian_spreads_spike() {
        let out = run(&GaussianFilter, &spike(), StageParams::new()).unwrap();
        let centre = out.get([0, 2, 2]).unwrap();
        let neighbour = out.get([0, 2, 3]).unwrap();
        assert!(centre < 100.0);
        assert!(neighbour > 1.0);
        assert!(centre > neighbour);
    }

    #[test]
    fn test_stripe_removal_flattens_columns() {
        let volume =
            Volume::from_fn(Dtype::Float64, [1, 4, 3], |_, _, x| if x == 1 { 5.0 } else { 2.0 });
        let out = run(&StripeRemoval, &volume, StageParams::new()).unwrap();
        let first = out.get([0, 0, 0]).unwrap();
        for v in out.iter_f64() {
            assert!((v - first).abs() < 1e-12);
        }
    }

    #[test]
    fn test_ring_removal_flattens_rings() {
        let volume = Volume::from_fn(Dtype::Float64, [1, 5, 5], |_, y, x| {
            let r = ((y as f64 - 2.0).powi(2) + (x as f64 - 2.0).powi(2)).sqrt().round();
            if r == 1.0 { 9.0 } else { 1.0 }
        });
        let out = run(&RingRemoval, &volume, StageParams::new()).unwrap();
        // Every ring is constant, so flattening leaves only the frame mean.
        let mean = volume.iter_f64().sum::<f64>() / 25.0;
        for v in out.iter_f64() {
            assert!((v - mean).abs() < 1e-12);
        }
    }
}
