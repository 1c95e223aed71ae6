//! Core array types that flow through the pipeline.
//!
//! The type system uses an enum-based approach for several reasons:
//! - Closed set of element types: stacks are either `f32` or `f64`
//! - Zero-cost pattern matching: stage kernels are monomorphised per element type
//! - Serialization: serde handles the dtype tag natively
//! - Type safety: exhaustive matching catches missing cases at compile time

use crate::core::chunked::ChunkRange;
use crate::core::error::ConfigurationError;
use indexmap::IndexMap;
use ndarray::{s, Array3, ArrayView3};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Element type of a stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dtype {
    /// 32-bit float, element width 4.
    Float32,
    /// 64-bit float, element width 8.
    Float64,
}

impl Dtype {
    /// Element width in bytes.
    pub fn width(&self) -> u64 {
        match self {
            Dtype::Float32 => 4,
            Dtype::Float64 => 8,
        }
    }

    /// Parse a numpy-style dtype name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "float32" | "f32" | "32" => Some(Dtype::Float32),
            "float64" | "f64" | "64" => Some(Dtype::Float64),
            _ => None,
        }
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dtype::Float32 => write!(f, "float32"),
            Dtype::Float64 => write!(f, "float64"),
        }
    }
}

/// Numeric element stored in a [`Volume`].
pub trait Pixel:
    num_traits::Float + bytemuck::Pod + Send + Sync + fmt::Debug + Default + 'static
{
    /// Tag for this element type.
    const DTYPE: Dtype;

    /// Convert from `f64`, rounding to the element precision.
    fn of(value: f64) -> Self;

    /// Widen to `f64`.
    fn as_f64(self) -> f64;

    /// Wrap an owned array of this element type.
    fn wrap(array: Array3<Self>) -> Volume;

    /// Borrow a view of this element type, if the volume holds it.
    fn view_of<'a>(view: &VolumeView<'a>) -> Option<ArrayView3<'a, Self>>;
}

impl Pixel for f32 {
    const DTYPE: Dtype = Dtype::Float32;

    fn of(value: f64) -> Self {
        value as f32
    }

    fn as_f64(self) -> f64 {
        self as f64
    }

    fn wrap(array: Array3<Self>) -> Volume {
        Volume::F32(array)
    }

    fn view_of<'a>(view: &VolumeView<'a>) -> Option<ArrayView3<'a, Self>> {
        match view {
            VolumeView::F32(v) => Some(v.clone()),
            VolumeView::F64(_) => None,
        }
    }
}

impl Pixel for f64 {
    const DTYPE: Dtype = Dtype::Float64;

    fn of(value: f64) -> Self {
        value
    }

    fn as_f64(self) -> f64 {
        self
    }

    fn wrap(array: Array3<Self>) -> Volume {
        Volume::F64(array)
    }

    fn view_of<'a>(view: &VolumeView<'a>) -> Option<ArrayView3<'a, Self>> {
        match view {
            VolumeView::F64(v) => Some(v.clone()),
            VolumeView::F32(_) => None,
        }
    }
}

/// An owned 3-D array; axis 0 is the frame index.
#[derive(Debug, Clone, PartialEq)]
pub enum Volume {
    /// Single precision data.
    F32(Array3<f32>),
    /// Double precision data.
    F64(Array3<f64>),
}

/// A borrowed 3-D array; axis 0 is the frame index.
#[derive(Debug, Clone)]
pub enum VolumeView<'a> {
    /// Single precision data.
    F32(ArrayView3<'a, f32>),
    /// Double precision data.
    F64(ArrayView3<'a, f64>),
}

impl Volume {
    /// Create a zero-filled volume.
    pub fn zeros(dtype: Dtype, shape: [usize; 3]) -> Self {
        match dtype {
            Dtype::Float32 => Volume::F32(Array3::zeros(shape)),
            Dtype::Float64 => Volume::F64(Array3::zeros(shape)),
        }
    }

    /// Create a volume by evaluating `f(frame, row, col)` for every element.
    pub fn from_fn<F>(dtype: Dtype, shape: [usize; 3], f: F) -> Self
    where
        F: Fn(usize, usize, usize) -> f64,
    {
        match dtype {
            Dtype::Float32 => {
                Volume::F32(Array3::from_shape_fn(shape, |(z, y, x)| f(z, y, x) as f32))
            }
            Dtype::Float64 => Volume::F64(Array3::from_shape_fn(shape, |(z, y, x)| f(z, y, x))),
        }
    }

    /// Shape as `[frames, rows, cols]`.
    pub fn shape(&self) -> [usize; 3] {
        self.view().shape()
    }

    /// Element type.
    pub fn dtype(&self) -> Dtype {
        match self {
            Volume::F32(_) => Dtype::Float32,
            Volume::F64(_) => Dtype::Float64,
        }
    }

    /// Number of frames (axis 0).
    pub fn frames(&self) -> usize {
        self.shape()[0]
    }

    /// Pixel plane `(rows, cols)`.
    pub fn plane(&self) -> (usize, usize) {
        let shape = self.shape();
        (shape[1], shape[2])
    }

    /// Size of the data in bytes.
    pub fn nbytes(&self) -> u64 {
        let [z, y, x] = self.shape();
        (z * y * x) as u64 * self.dtype().width()
    }

    /// Borrow the whole volume.
    pub fn view(&self) -> VolumeView<'_> {
        match self {
            Volume::F32(a) => VolumeView::F32(a.view()),
            Volume::F64(a) => VolumeView::F64(a.view()),
        }
    }

    /// Borrow a range of frames.
    pub fn slice_frames(&self, range: ChunkRange) -> VolumeView<'_> {
        self.view().slice_frames(range)
    }

    /// Element at `(frame, row, col)` widened to `f64`.
    pub fn get(&self, index: [usize; 3]) -> Option<f64> {
        match self {
            Volume::F32(a) => a.get(index).map(|v| *v as f64),
            Volume::F64(a) => a.get(index).copied(),
        }
    }

    /// Iterate every element widened to `f64`, in logical order.
    pub fn iter_f64(&self) -> Box<dyn Iterator<Item = f64> + '_> {
        match self {
            Volume::F32(a) => Box::new(a.iter().map(|v| *v as f64)),
            Volume::F64(a) => Box::new(a.iter().copied()),
        }
    }

    /// Check bit-for-bit equality, treating NaNs with equal payloads as equal.
    pub fn bitwise_eq(&self, other: &Volume) -> bool {
        match (self, other) {
            (Volume::F32(a), Volume::F32(b)) => {
                a.shape() == b.shape()
                    && a.iter().zip(b.iter()).all(|(x, y)| x.to_bits() == y.to_bits())
            }
            (Volume::F64(a), Volume::F64(b)) => {
                a.shape() == b.shape()
                    && a.iter().zip(b.iter()).all(|(x, y)| x.to_bits() == y.to_bits())
            }
            _ => false,
        }
    }
}

impl<'a> VolumeView<'a> {
    /// Shape as `[frames, rows, cols]`.
    pub fn shape(&self) -> [usize; 3] {
        let dims = match self {
            VolumeView::F32(v) => v.dim(),
            VolumeView::F64(v) => v.dim(),
        };
        [dims.0, dims.1, dims.2]
    }

    /// Element type.
    pub fn dtype(&self) -> Dtype {
        match self {
            VolumeView::F32(_) => Dtype::Float32,
            VolumeView::F64(_) => Dtype::Float64,
        }
    }

    /// Number of frames (axis 0).
    pub fn frames(&self) -> usize {
        self.shape()[0]
    }

    /// Pixel plane `(rows, cols)`.
    pub fn plane(&self) -> (usize, usize) {
        let shape = self.shape();
        (shape[1], shape[2])
    }

    /// Narrow to a range of frames.
    pub fn slice_frames(&self, range: ChunkRange) -> VolumeView<'a> {
        let frames = s![range.start..range.stop, .., ..];
        match self {
            VolumeView::F32(v) => VolumeView::F32(v.clone().slice_move(frames)),
            VolumeView::F64(v) => VolumeView::F64(v.clone().slice_move(frames)),
        }
    }

    /// Copy into an owned volume with standard layout.
    pub fn to_owned(&self) -> Volume {
        match self {
            VolumeView::F32(v) => Volume::F32(v.to_owned()),
            VolumeView::F64(v) => Volume::F64(v.to_owned()),
        }
    }
}

/// A sample stack with optional flat-field and dark-field references.
///
/// Flat and dark must share the sample's pixel plane; their frame counts may
/// differ (they are usually averaged down to one frame before use).
#[derive(Debug, Clone)]
pub struct ImageStack {
    sample: Volume,
    flat: Option<Volume>,
    dark: Option<Volume>,
    /// Whether axis 0 indexes sinograms rather than projections.
    pub is_sinogram: bool,
    /// Free-form metadata carried alongside the data.
    pub metadata: IndexMap<String, serde_json::Value>,
}

impl ImageStack {
    /// Create a stack with no references.
    pub fn new(sample: Volume) -> Self {
        Self {
            sample,
            flat: None,
            dark: None,
            is_sinogram: false,
            metadata: IndexMap::new(),
        }
    }

    /// Attach flat and dark references, validating their pixel planes.
    pub fn with_references(
        mut self,
        flat: Volume,
        dark: Volume,
    ) -> Result<Self, ConfigurationError> {
        check_plane("flat", self.sample.plane(), flat.plane())?;
        check_plane("dark", self.sample.plane(), dark.plane())?;
        self.flat = Some(flat);
        self.dark = Some(dark);
        Ok(self)
    }

    /// Mark the stack as sinograms.
    pub fn as_sinograms(mut self) -> Self {
        self.is_sinogram = true;
        self
    }

    /// The sample data.
    pub fn sample(&self) -> &Volume {
        &self.sample
    }

    /// The flat-field reference, if any.
    pub fn flat(&self) -> Option<&Volume> {
        self.flat.as_ref()
    }

    /// The dark-field reference, if any.
    pub fn dark(&self) -> Option<&Volume> {
        self.dark.as_ref()
    }

    /// Whether both flat and dark are present.
    pub fn has_references(&self) -> bool {
        self.flat.is_some() && self.dark.is_some()
    }

    /// Shape of the sample.
    pub fn shape(&self) -> [usize; 3] {
        self.sample.shape()
    }

    /// Element type of the sample.
    pub fn dtype(&self) -> Dtype {
        self.sample.dtype()
    }

    /// Axis that indexes the rotation angle.
    pub fn rotation_axis(&self) -> usize {
        if self.is_sinogram {
            1
        } else {
            0
        }
    }

    /// Replace the sample's backing array.
    pub fn replace_sample(&mut self, sample: Volume) {
        self.sample = sample;
    }

    /// Replace both references, validating them against the current sample.
    pub fn replace_references(
        &mut self,
        flat: Option<Volume>,
        dark: Option<Volume>,
    ) -> Result<(), ConfigurationError> {
        if let Some(f) = &flat {
            check_plane("flat", self.sample.plane(), f.plane())?;
        }
        if let Some(d) = &dark {
            check_plane("dark", self.sample.plane(), d.plane())?;
        }
        self.flat = flat;
        self.dark = dark;
        Ok(())
    }

    /// Take the sample and references apart.
    pub fn into_parts(self) -> (Volume, Option<Volume>, Option<Volume>) {
        (self.sample, self.flat, self.dark)
    }
}

fn check_plane(
    which: &'static str,
    expected: (usize, usize),
    got: (usize, usize),
) -> Result<(), ConfigurationError> {
    if expected != got {
        return Err(ConfigurationError::ReferenceShapeMismatch {
            which,
            expected,
            got,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_width() {
        assert_eq!(Dtype::Float32.width(), 4);
        assert_eq!(Dtype::Float64.width(), 8);
        assert_eq!(Dtype::from_name("float64"), Some(Dtype::Float64));
        assert_eq!(Dtype::from_name("int16"), None);
    }

    #[test]
    fn test_volume_shape_and_slice() {
        let volume = Volume::from_fn(Dtype::Float32, [6, 3, 4], |z, y, x| {
            (z * 100 + y * 10 + x) as f64
        });
        assert_eq!(volume.shape(), [6, 3, 4]);
        assert_eq!(volume.nbytes(), 6 * 3 * 4 * 4);

        let chunk = volume.slice_frames(ChunkRange::new(2, 5));
        assert_eq!(chunk.shape(), [3, 3, 4]);
        let owned = chunk.to_owned();
        assert_eq!(owned.get([0, 1, 2]), Some(212.0));
    }

    #[test]
    fn test_references_must_match_plane() {
        let sample = Volume::zeros(Dtype::Float32, [10, 4, 4]);
        let flat = Volume::zeros(Dtype::Float32, [1, 4, 4]);
        let dark = Volume::zeros(Dtype::Float32, [3, 4, 5]);

        let result = ImageStack::new(sample).with_references(flat, dark);
        assert!(matches!(
            result,
            Err(ConfigurationError::ReferenceShapeMismatch { which: "dark", .. })
        ));
    }

    #[test]
    fn test_rotation_axis() {
        let stack = ImageStack::new(Volume::zeros(Dtype::Float64, [2, 2, 2]));
        assert_eq!(stack.rotation_axis(), 0);
        assert_eq!(stack.as_sinograms().rotation_axis(), 1);
    }

    #[test]
    fn test_bitwise_eq() {
        let a = Volume::from_fn(Dtype::Float64, [2, 2, 2], |z, _, _| z as f64);
        let b = a.clone();
        let c = Volume::from_fn(Dtype::Float32, [2, 2, 2], |z, _, _| z as f64);
        assert!(a.bitwise_eq(&b));
        assert!(!a.bitwise_eq(&c));
    }
}
