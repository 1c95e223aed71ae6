//! Memory footprint estimates for array shapes.
//!
//! All functions are pure. Shapes are validated by the caller.

use log::debug;

const KIB: f64 = 1024.0;

/// Bytes held by one slab perpendicular to `axis`: the product of every other
/// dimension times the element width.
pub fn footprint_bytes(shape: &[usize], axis: usize, element_width: u64) -> u64 {
    let slab: u64 = shape
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != axis)
        .map(|(_, &len)| len as u64)
        .product();
    slab * element_width
}

/// Bytes held by the whole array.
pub fn full_footprint(shape: &[usize], element_width: u64) -> u64 {
    shape.iter().map(|&len| len as u64).product::<u64>() * element_width
}

/// Convert bytes to kibibytes.
pub fn to_kb(bytes: u64) -> f64 {
    bytes as f64 / KIB
}

/// Convert bytes to mebibytes.
pub fn to_mb(bytes: u64) -> f64 {
    bytes as f64 / KIB / KIB
}

/// Convert bytes to gibibytes.
pub fn to_gb(bytes: u64) -> f64 {
    bytes as f64 / KIB / KIB / KIB
}

/// Element width in bytes for a declared numeric kind.
///
/// Accepts bit counts (`"16"`, `"32"`, `"64"`) and numpy-style names
/// (`"float32"`, `"int64"`, ...). Unrecognised kinds return 1, so budgets
/// computed from them are underestimates; correctness-critical callers should
/// use [`Dtype`](crate::core::types::Dtype) instead.
pub fn element_width(kind: &str) -> u64 {
    let kind = kind.trim().trim_start_matches("np.").to_ascii_lowercase();
    match kind.as_str() {
        "16" | "int16" | "uint16" | "float16" => 2,
        "32" | "int32" | "uint32" | "float32" => 4,
        "64" | "int64" | "uint64" | "float64" => 8,
        other => {
            debug!("Unrecognised element kind '{}', assuming width 1", other);
            1
        }
    }
}
