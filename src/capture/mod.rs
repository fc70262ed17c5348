pub mod format;
pub mod frame;
pub mod processor;
pub mod source;

pub use format::{CaptureFormat, FormatRequest, Geometry, PixelFormat};
pub use frame::{FieldParity, Frame, FrameKind, FrameMetadata};
pub use processor::{FrameProcessor, OutputTarget, PassthroughProcessor};
pub use source::{EventReply, FrameReceiver, FrameSource, SlotSource, SourceEvent, SourceHub};
