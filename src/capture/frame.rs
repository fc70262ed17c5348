use bytes::Bytes;
use std::time::Instant;

/// A decoded frame handed over by the upstream pipeline.
///
/// The frame stays owned by its [`FrameSource`](super::FrameSource); the
/// acquisition worker borrows it for one tick and always `put`s it back.
#[derive(Clone)]
pub struct Frame {
    /// Pixel payload as produced upstream
    pub data: Bytes,

    /// Frame metadata
    pub meta: FrameMetadata,

    /// When the frame was posted, for latency tracking
    pub timestamp: Instant,
}

/// Frame metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub kind: FrameKind,
    pub width: u32,
    pub height: u32,
    /// Presentation timestamp in microseconds, 0 when unset
    pub pts_us: u64,
    pub duration_us: u32,
    /// Still being switched upstream; not yet safe to consume
    pub fence: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Progressive,
    /// One field of an interlaced pair
    Interlaced(FieldParity),
}

/// Which field of an interlaced pair a frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldParity {
    Top,
    Bottom,
}

impl FrameKind {
    pub fn is_interlaced(self) -> bool {
        matches!(self, FrameKind::Interlaced(_))
    }

    pub fn field(self) -> Option<FieldParity> {
        match self {
            FrameKind::Progressive => None,
            FrameKind::Interlaced(parity) => Some(parity),
        }
    }
}

impl Frame {
    pub fn new(data: Bytes, meta: FrameMetadata) -> Self {
        Self {
            data,
            meta,
            timestamp: Instant::now(),
        }
    }
}

impl FrameMetadata {
    pub fn progressive(sequence: u64, width: u32, height: u32, pts_us: u64, duration_us: u32) -> Self {
        Self {
            sequence,
            kind: FrameKind::Progressive,
            width,
            height,
            pts_us,
            duration_us,
            fence: false,
        }
    }

    pub fn field(
        sequence: u64,
        parity: FieldParity,
        width: u32,
        height: u32,
        pts_us: u64,
        duration_us: u32,
    ) -> Self {
        Self {
            kind: FrameKind::Interlaced(parity),
            ..Self::progressive(sequence, width, height, pts_us, duration_us)
        }
    }
}
