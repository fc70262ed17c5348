//! Pixel-format table and geometry negotiation.

use serde::{Deserialize, Serialize};

use crate::error::{CaptureError, Result};
use crate::utils::bound_align;

pub const MIN_WIDTH: u32 = 64;
pub const MAX_WIDTH: u32 = 1920;
pub const WIDTH_STEP: u32 = 32;
pub const MIN_HEIGHT: u32 = 32;
pub const MAX_HEIGHT: u32 = 1080;
pub const HEIGHT_STEP: u32 = 2;

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    Nv21,
    Nv12,
    Rgb24,
    Bgr24,
    Yuyv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatDescriptor {
    pub name: &'static str,
    pub fourcc: [u8; 4],
    pub format: PixelFormat,
    /// Bits per pixel
    pub depth: u32,
    /// Planar formats have a luma stride of one byte per pixel
    pub planar: bool,
}

pub const FORMATS: [FormatDescriptor; 5] = [
    FormatDescriptor {
        name: "4:2:0, packed, YVU",
        fourcc: *b"NV21",
        format: PixelFormat::Nv21,
        depth: 12,
        planar: true,
    },
    FormatDescriptor {
        name: "4:2:0, packed, UV",
        fourcc: *b"NV12",
        format: PixelFormat::Nv12,
        depth: 12,
        planar: true,
    },
    FormatDescriptor {
        name: "RGB888 (24)",
        fourcc: *b"RGB3",
        format: PixelFormat::Rgb24,
        depth: 24,
        planar: false,
    },
    FormatDescriptor {
        name: "BGR888 (24)",
        fourcc: *b"BGR3",
        format: PixelFormat::Bgr24,
        depth: 24,
        planar: false,
    },
    FormatDescriptor {
        name: "4:2:2, packed, YUYV",
        fourcc: *b"YUYV",
        format: PixelFormat::Yuyv,
        depth: 16,
        planar: false,
    },
];

impl PixelFormat {
    pub fn descriptor(self) -> &'static FormatDescriptor {
        // FORMATS carries every variant
        FORMATS
            .iter()
            .find(|d| d.format == self)
            .unwrap_or(&FORMATS[0])
    }

    pub fn from_fourcc(fourcc: [u8; 4]) -> Option<Self> {
        FORMATS.iter().find(|d| d.fourcc == fourcc).map(|d| d.format)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Geometry {
    pub width: u32,
    pub height: u32,
}

impl Geometry {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Clamp to the supported bounds and snap each axis to its step.
    pub fn aligned(self) -> Self {
        Self {
            width: bound_align(self.width, MIN_WIDTH, MAX_WIDTH, WIDTH_STEP),
            height: bound_align(self.height, MIN_HEIGHT, MAX_HEIGHT, HEIGHT_STEP),
        }
    }
}

/// Stepwise frame-size bounds for one pixel format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSizes {
    pub min_width: u32,
    pub max_width: u32,
    pub step_width: u32,
    pub min_height: u32,
    pub max_height: u32,
    pub step_height: u32,
}

/// A caller's format request, as it arrives over the control surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatRequest {
    pub fourcc: [u8; 4],
    pub width: u32,
    pub height: u32,
}

/// The negotiated capture format of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureFormat {
    pub pixel_format: PixelFormat,
    /// What the caller asked for
    pub requested: Geometry,
    /// What the endpoint will produce after alignment
    pub capture: Geometry,
    pub bytes_per_line: u32,
    pub size_image: usize,
}

impl FormatRequest {
    pub fn new(format: PixelFormat, width: u32, height: u32) -> Self {
        Self {
            fourcc: format.descriptor().fourcc,
            width,
            height,
        }
    }
}

impl CaptureFormat {
    pub fn new(pixel_format: PixelFormat, requested: Geometry) -> Self {
        let capture = requested.aligned();
        let desc = pixel_format.descriptor();
        let bytes_per_line = if desc.planar {
            capture.width
        } else {
            capture.width * desc.depth / 8
        };
        let size_image = capture.width as usize * capture.height as usize * desc.depth as usize / 8;
        Self {
            pixel_format,
            requested,
            capture,
            bytes_per_line,
            size_image,
        }
    }
}

pub fn enumerate_formats(index: usize) -> Result<&'static FormatDescriptor> {
    FORMATS.get(index).ok_or(CaptureError::OutOfRange(index))
}

pub fn enumerate_frame_sizes(fourcc: [u8; 4]) -> Result<FrameSizes> {
    PixelFormat::from_fourcc(fourcc).ok_or_else(|| unknown_fourcc(fourcc))?;
    Ok(FrameSizes {
        min_width: MIN_WIDTH,
        max_width: MAX_WIDTH,
        step_width: WIDTH_STEP,
        min_height: MIN_HEIGHT,
        max_height: MAX_HEIGHT,
        step_height: HEIGHT_STEP,
    })
}

/// Validate a request and compute the format the endpoint would apply.
pub fn negotiate(request: &FormatRequest) -> Result<CaptureFormat> {
    let pixel_format =
        PixelFormat::from_fourcc(request.fourcc).ok_or_else(|| unknown_fourcc(request.fourcc))?;
    if request.width == 0 || request.height == 0 {
        return Err(CaptureError::InvalidArgument(format!(
            "geometry {}x{} has a zero dimension",
            request.width, request.height
        )));
    }
    Ok(CaptureFormat::new(
        pixel_format,
        Geometry::new(request.width, request.height),
    ))
}

fn unknown_fourcc(fourcc: [u8; 4]) -> CaptureError {
    CaptureError::InvalidArgument(format!(
        "unsupported pixel format {}",
        String::from_utf8_lossy(&fourcc)
    ))
}
