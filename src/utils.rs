//! Geometry helpers shared by format negotiation and the acquisition worker.

use crate::capture::format::Geometry;
use crate::capture::frame::FrameMetadata;

/// Frames at or above this size are candidates for down-scaling when interlaced.
pub const DOWNSCALE_MIN_WIDTH: u32 = 1920;
pub const DOWNSCALE_MIN_HEIGHT: u32 = 1080;

/// Round `value` to the nearest multiple of `step`, clamped to `[min, max]`.
///
/// `min` and `max` are themselves expected to be multiples of `step`.
pub fn bound_align(value: u32, min: u32, max: u32, step: u32) -> u32 {
    let step = step.max(1);
    let clamped = value.clamp(min, max);
    let rounded = (clamped + step / 2) / step * step;
    rounded.clamp(min, max)
}

/// Output geometry the worker aims for given a source frame.
///
/// Interlaced frames of at least 1920x1080 are scaled by `percent`; anything
/// else keeps its native size.
pub fn target_geometry(meta: &FrameMetadata, percent: u32) -> Geometry {
    let percent = percent.clamp(1, 100);
    if meta.kind.is_interlaced()
        && meta.width >= DOWNSCALE_MIN_WIDTH
        && meta.height >= DOWNSCALE_MIN_HEIGHT
    {
        Geometry::new(meta.width * percent / 100, meta.height * percent / 100)
    } else {
        Geometry::new(meta.width, meta.height)
    }
}
