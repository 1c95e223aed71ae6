//! Typed 3-D arrays living in shared-memory segments.

use crate::core::chunked::ChunkRange;
use crate::core::error::{SharedMemoryError, ShmResult};
use crate::core::types::{Dtype, Pixel, Volume, VolumeView};
use crate::shm::store::SegmentStore;
use log::warn;
use memmap2::MmapMut;
use ndarray::ArrayView3;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Everything a process needs to attach to a shared array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentRef {
    /// Segment name in the store.
    pub name: String,
    /// Array shape `[frames, rows, cols]`.
    pub shape: [usize; 3],
    /// Element type.
    pub dtype: Dtype,
}

impl SegmentRef {
    /// Number of data bytes the array occupies.
    pub fn data_len(&self) -> usize {
        self.shape.iter().product::<usize>() * self.dtype.width() as usize
    }
}

/// A memory-mapped array in a named segment.
///
/// The process that creates the segment owns it and unlinks it when the
/// array is dropped. Processes that attach by name never unlink.
pub struct SharedArray {
    segment: SegmentRef,
    map: MmapMut,
    owner: Option<Arc<dyn SegmentStore>>,
}

impl SharedArray {
    /// Create a zero-filled segment and take ownership of it.
    pub(crate) fn create(
        store: Arc<dyn SegmentStore>,
        name: String,
        shape: [usize; 3],
        dtype: Dtype,
    ) -> ShmResult<Self> {
        let segment = SegmentRef { name, shape, dtype };
        // Zero-length mappings are rejected by the OS.
        let len = segment.data_len().max(1);
        let file = store.create(&segment.name, len)?;
        let map = match unsafe { MmapMut::map_mut(&file) } {
            Ok(map) => map,
            Err(e) => {
                let _ = store.unlink(&segment.name);
                return Err(SharedMemoryError::Map {
                    name: segment.name,
                    error: e.to_string(),
                });
            }
        };
        Ok(Self {
            segment,
            map,
            owner: Some(store),
        })
    }

    /// Attach to a segment another process created.
    pub fn attach(store: &dyn SegmentStore, segment: &SegmentRef) -> ShmResult<Self> {
        let file = store.open(&segment.name)?;
        let map = unsafe { MmapMut::map_mut(&file) }.map_err(|e| SharedMemoryError::Map {
            name: segment.name.clone(),
            error: e.to_string(),
        })?;
        if map.len() < segment.data_len() {
            return Err(SharedMemoryError::SizeMismatch {
                name: segment.name.clone(),
                expected: segment.data_len(),
                actual: map.len(),
            });
        }
        Ok(Self {
            segment: segment.clone(),
            map,
            owner: None,
        })
    }

    /// Descriptor for sending to another process.
    pub fn segment(&self) -> &SegmentRef {
        &self.segment
    }

    /// Segment name.
    pub fn name(&self) -> &str {
        &self.segment.name
    }

    /// Array shape.
    pub fn shape(&self) -> [usize; 3] {
        self.segment.shape
    }

    /// Element type.
    pub fn dtype(&self) -> Dtype {
        self.segment.dtype
    }

    /// Whether dropping this array unlinks the segment.
    pub fn is_owner(&self) -> bool {
        self.owner.is_some()
    }

    fn typed<T: Pixel>(&self) -> ShmResult<&[T]> {
        let bytes = &self.map[..self.segment.data_len()];
        bytemuck::try_cast_slice(bytes).map_err(|e| self.map_error(e))
    }

    fn typed_mut<T: Pixel>(&mut self) -> ShmResult<&mut [T]> {
        let len = self.segment.data_len();
        let name = self.segment.name.clone();
        bytemuck::try_cast_slice_mut(&mut self.map[..len]).map_err(|e| {
            SharedMemoryError::Map {
                name,
                error: format!("{:?}", e),
            }
        })
    }

    fn map_error(&self, e: impl fmt::Debug) -> SharedMemoryError {
        SharedMemoryError::Map {
            name: self.segment.name.clone(),
            error: format!("{:?}", e),
        }
    }

    fn typed_view<T: Pixel>(&self) -> ShmResult<ArrayView3<'_, T>> {
        let data = self.typed::<T>()?;
        ArrayView3::from_shape(self.segment.shape, data).map_err(|e| self.map_error(e))
    }

    /// Borrow the whole array.
    pub fn view(&self) -> ShmResult<VolumeView<'_>> {
        Ok(match self.segment.dtype {
            Dtype::Float32 => VolumeView::F32(self.typed_view::<f32>()?),
            Dtype::Float64 => VolumeView::F64(self.typed_view::<f64>()?),
        })
    }

    /// Borrow a range of frames.
    pub fn view_frames(&self, range: ChunkRange) -> ShmResult<VolumeView<'_>> {
        if range.stop > self.segment.shape[0] || range.start > range.stop {
            return Err(self.map_error(format!(
                "frames {} outside {} frames",
                range, self.segment.shape[0]
            )));
        }
        Ok(self.view()?.slice_frames(range))
    }

    /// Copy the array out into an owned volume.
    pub fn to_volume(&self) -> ShmResult<Volume> {
        Ok(self.view()?.to_owned())
    }

    /// Copy a whole volume into the array. Shapes and dtypes must match.
    pub fn store(&mut self, source: &VolumeView<'_>) -> ShmResult<()> {
        if source.shape() != self.segment.shape {
            return Err(SharedMemoryError::SizeMismatch {
                name: self.segment.name.clone(),
                expected: self.segment.data_len(),
                actual: source.shape().iter().product::<usize>() * source.dtype().width() as usize,
            });
        }
        self.write_frames(0, source)
    }

    /// Copy frames into the array starting at frame `start`.
    pub fn write_frames(&mut self, start: usize, source: &VolumeView<'_>) -> ShmResult<()> {
        let [frames, rows, cols] = self.segment.shape;
        let [n, src_rows, src_cols] = source.shape();
        if source.dtype() != self.segment.dtype {
            return Err(SharedMemoryError::DtypeMismatch {
                name: self.segment.name.clone(),
                expected: self.segment.dtype,
                got: source.dtype(),
            });
        }
        if (src_rows, src_cols) != (rows, cols) || start + n > frames {
            return Err(SharedMemoryError::SizeMismatch {
                name: self.segment.name.clone(),
                expected: frames * rows * cols,
                actual: (start + n) * src_rows * src_cols,
            });
        }

        let frame_len = rows * cols;
        let range = start * frame_len..(start + n) * frame_len;
        match source {
            VolumeView::F32(src) => copy_into(&mut self.typed_mut::<f32>()?[range], src),
            VolumeView::F64(src) => copy_into(&mut self.typed_mut::<f64>()?[range], src),
        }
        Ok(())
    }

    /// Unlink the segment now, surfacing any error.
    pub fn free(mut self) -> ShmResult<()> {
        match self.owner.take() {
            Some(store) => store.unlink(&self.segment.name),
            None => Ok(()),
        }
    }
}

fn copy_into<T: Copy>(dst: &mut [T], src: &ArrayView3<'_, T>) {
    match src.as_slice() {
        Some(contiguous) => dst.copy_from_slice(contiguous),
        None => {
            for (d, s) in dst.iter_mut().zip(src.iter()) {
                *d = *s;
            }
        }
    }
}

impl Drop for SharedArray {
    fn drop(&mut self) {
        if let Some(store) = self.owner.take() {
            if let Err(e) = store.unlink(&self.segment.name) {
                warn!("Failed to release shared array: {}", e);
            }
        }
    }
}

impl fmt::Debug for SharedArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedArray")
            .field("segment", &self.segment)
            .field("owner", &self.is_owner())
            .finish()
    }
}
