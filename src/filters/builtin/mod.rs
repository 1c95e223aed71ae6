//! Built-in stage implementations.
//!
//! These are simple, deterministic reference implementations. Every one
//! works frame by frame, so its output does not depend on how the stack was
//! chunked.

mod geometry;
mod normalise;
mod denoise;
mod intensity;

use crate::filters::registry::StageRegistry;

/// Register all built-in stages.
pub fn register_all(registry: &mut StageRegistry) {
    geometry::register(registry);
    normalise::register(registry);
    denoise::register(registry);
    intensity::register(registry);
}

// Re-export for direct access
pub use geometry::{CircularMask, Crop, Rebin, Rotate};
pub use normalise::{
    AirRegionNormalisation, ApplyScaleFactors, ComputeScaleFactors, FlatDarkNormalisation,
    MINIMUM_PIXEL_VALUE, SCALE_FACTORS,
};
pub use denoise::{
    GaussianFilter, MedianFilter, OutlierMode, OutlierRemoval, RingRemoval, StripeRemoval,
};
pub use intensity::{CutOff, MinusLog};
