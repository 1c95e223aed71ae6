//! Chunk planning for stacks that do not fit the memory budget in one piece.
//!
//! The scheduler partitions one axis of an array into split points a fixed
//! step apart so that every chunk's materialised footprint stays under a
//! fraction of the configured budget.
//!
//! # Example
//!
//! ```
//! use tomoflow::core::chunked::plan_split;
//!
//! // 100 frames of 10x10 float32, budget fits roughly a third of the stack.
//! let plan = plan_split(&[100, 10, 10], 0, 4, 11_765, 1.0, false).unwrap();
//! assert_eq!(plan.points.first(), Some(&0));
//! assert_eq!(plan.points.last(), Some(&100));
//! assert!(plan.chunks().all(|c| !c.is_empty()));
//! ```

use crate::core::error::ChunkPlanningError;
use crate::core::memory::{footprint_bytes, full_footprint};
use log::info;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Half-open range of indices `[start, stop)` along the traversal axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkRange {
    /// First index in the chunk.
    pub start: usize,
    /// One past the last index in the chunk.
    pub stop: usize,
}

impl ChunkRange {
    /// Create a new chunk range.
    pub fn new(start: usize, stop: usize) -> Self {
        Self { start, stop }
    }

    /// Number of indices covered.
    pub fn len(&self) -> usize {
        self.stop.saturating_sub(self.start)
    }

    /// Check if the range covers nothing.
    pub fn is_empty(&self) -> bool {
        self.stop <= self.start
    }

    /// Check if two ranges share any index.
    pub fn overlaps(&self, other: &ChunkRange) -> bool {
        self.start < other.stop && other.start < self.stop
    }
}

impl fmt::Display for ChunkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.stop)
    }
}

/// Result of planning a split: points `0, step, 2 * step, ..., length`.
///
/// Points are traversed two at a time. Every chunk is `step` long except the
/// final one, which holds the remainder and is never longer than `step`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitPlan {
    /// Split points, starting at 0 and ending at the axis length.
    pub points: Vec<u64>,
    /// Integer distance between consecutive points.
    pub step: u64,
}

impl SplitPlan {
    /// Build a plan with an explicit step, e.g. from a `chunksize` override.
    pub fn with_step(length: u64, step: u64) -> Self {
        let step = step.max(1);
        let mut points: Vec<u64> = (0..length).step_by(step as usize).collect();
        points.push(length);
        if points.len() == 1 {
            points.insert(0, 0);
        }
        Self { points, step }
    }

    /// Iterate the chunks described by consecutive pairs of points.
    pub fn chunks(&self) -> impl Iterator<Item = ChunkRange> + '_ {
        self.points
            .windows(2)
            .map(|pair| ChunkRange::new(pair[0] as usize, pair[1] as usize))
            .filter(|chunk| !chunk.is_empty())
    }

    /// Number of non-empty chunks.
    pub fn chunk_count(&self) -> usize {
        self.chunks().count()
    }
}

/// Compute a partition of `shape[axis]` whose chunks fit the memory budget.
///
/// * `element_width` - bytes per element
/// * `memory_budget` - budget in bytes
/// * `max_ratio` - fraction of the budget a single chunk may use
/// * `doubles_for_reconstruction` - the stage materialises an output as large
///   as its input, so the working set is twice the chunk
///
/// # Errors
///
/// Fails fast on an out-of-range axis, a zero budget, a non-positive ratio, an
/// empty axis, or a single slab that cannot fit under `max_ratio * budget`.
pub fn plan_split(
    shape: &[usize],
    axis: usize,
    element_width: u64,
    memory_budget: u64,
    max_ratio: f64,
    doubles_for_reconstruction: bool,
) -> Result<SplitPlan, ChunkPlanningError> {
    if axis >= shape.len() {
        return Err(ChunkPlanningError::AxisOutOfRange {
            axis,
            dims: shape.len(),
        });
    }
    if memory_budget == 0 || !max_ratio.is_finite() || max_ratio <= 0.0 {
        return Err(ChunkPlanningError::InvalidBudget {
            budget: memory_budget,
            max_ratio,
        });
    }

    let length = shape[axis] as u64;
    if length == 0 {
        return Err(ChunkPlanningError::EmptyAxis(axis));
    }

    let factor = if doubles_for_reconstruction { 2.0 } else { 1.0 };
    let ratio = |size: u64| size as f64 * factor / memory_budget as f64;

    let mut chunk_shape = shape.to_vec();
    let full = full_footprint(shape, element_width);

    // A single split point would give a zero step.
    let mut splits = (ratio(full).ceil() as u64).max(2).min(length + 1);

    // Round the step up so no chunk is longer than the one that was checked.
    let step = loop {
        let step = length.div_ceil(splits - 1);
        chunk_shape[axis] = step as usize;
        if ratio(full_footprint(&chunk_shape, element_width)) <= max_ratio {
            break step;
        }
        if splits - 1 >= length {
            return Err(ChunkPlanningError::SlabExceedsBudget {
                slab_bytes: footprint_bytes(shape, axis, element_width),
                budget: memory_budget,
                max_ratio,
            });
        }
        splits += 1;
    };

    let plan = SplitPlan::with_step(length, step);
    info!(
        "Data step: {}, with a ratio to memory: {:.3}, indices: {:?}",
        step,
        ratio(full_footprint(&chunk_shape, element_width)),
        plan.points
    );

    Ok(plan)
}
