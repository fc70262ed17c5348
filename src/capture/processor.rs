//! Seam to the external image-processing stage.
//!
//! Conversion, scaling, rotation and mirroring live outside this crate. The
//! acquisition worker only needs something that writes a frame into a
//! buffer at a given layout.

use crate::capture::format::{Geometry, PixelFormat};
use crate::capture::frame::Frame;
use crate::error::{CaptureError, Result};

/// Layout of the buffer the processor writes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputTarget {
    pub format: PixelFormat,
    pub geometry: Geometry,
    pub bytes_per_line: u32,
}

pub trait FrameProcessor: Send + Sync {
    /// Render `frame` into `out`, returning the number of bytes written.
    fn render(&self, frame: &Frame, target: &OutputTarget, out: &mut [u8]) -> Result<usize>;
}

/// Copies the payload as-is.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughProcessor;

impl FrameProcessor for PassthroughProcessor {
    fn render(&self, frame: &Frame, _target: &OutputTarget, out: &mut [u8]) -> Result<usize> {
        let len = frame.data.len();
        let capacity = out.len();
        let dst = out.get_mut(..len).ok_or_else(|| {
            CaptureError::Processing(format!(
                "frame {} needs {} bytes, buffer holds {}",
                frame.meta.sequence, len, capacity
            ))
        })?;
        dst.copy_from_slice(&frame.data);
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::FrameMetadata;
    use bytes::Bytes;

    #[test]
    fn oversized_payload_is_rejected() {
        let frame = Frame::new(
            Bytes::from_static(&[7u8; 8]),
            FrameMetadata::progressive(1, 64, 32, 0, 0),
        );
        let target = OutputTarget {
            format: PixelFormat::Nv21,
            geometry: Geometry::new(64, 32),
            bytes_per_line: 64,
        };
        let mut out = [0u8; 4];
        assert!(matches!(
            PassthroughProcessor.render(&frame, &target, &mut out),
            Err(CaptureError::Processing(_))
        ));

        let mut out = [0u8; 16];
        assert_eq!(PassthroughProcessor.render(&frame, &target, &mut out).unwrap(), 8);
        assert_eq!(&out[..9], &[7, 7, 7, 7, 7, 7, 7, 7, 0]);
    }
}
