//! State shared between a session's control surface and its worker.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use tracing::{debug, info};

use crate::capture::format::CaptureFormat;
use crate::capture::processor::FrameProcessor;
use crate::capture::source::{EventReply, FrameReceiver, FrameSource, SourceEvent};
use crate::pipeline::clock::PresentationClock;
use crate::pipeline::pool::CapturePool;
use crate::session::registry::Assignment;
use crate::Config;

/// The upstream currently feeding a session.
pub(crate) struct BoundSource(pub(crate) Arc<dyn FrameSource>);

pub(crate) struct SessionShared {
    pub(crate) instance: u32,
    pub(crate) name: String,
    pub(crate) config: Arc<ArcSwap<Config>>,
    pub(crate) pool: CapturePool,
    pub(crate) source: ArcSwapOption<BoundSource>,
    pub(crate) format: ArcSwap<CaptureFormat>,
    pub(crate) clock: Arc<dyn PresentationClock>,
    pub(crate) processor: Arc<dyn FrameProcessor>,
    /// Consecutive ticks without a usable frame
    pub(crate) no_frame_ticks: AtomicU32,
    pub(crate) skipped: AtomicU64,
    /// Frames the processor could not render into a buffer
    pub(crate) render_failures: AtomicU64,
    /// Set on unregistration, consumed by the next retrieval
    pub(crate) unregistered: AtomicBool,
    /// Set on unregistration, consumed by the worker's next tick
    pub(crate) relatch: AtomicBool,
    pub(crate) rate_hint_us: AtomicU32,
}

impl SessionShared {
    pub(crate) fn new(
        assignment: Assignment,
        format: CaptureFormat,
        config: Arc<ArcSwap<Config>>,
        clock: Arc<dyn PresentationClock>,
        processor: Arc<dyn FrameProcessor>,
    ) -> Self {
        Self {
            instance: assignment.id,
            name: assignment.name,
            config,
            pool: CapturePool::new(),
            source: ArcSwapOption::empty(),
            format: ArcSwap::from_pointee(format),
            clock,
            processor,
            no_frame_ticks: AtomicU32::new(0),
            skipped: AtomicU64::new(0),
            render_failures: AtomicU64::new(0),
            unregistered: AtomicBool::new(false),
            relatch: AtomicBool::new(false),
            rate_hint_us: AtomicU32::new(0),
        }
    }
}

impl FrameReceiver for SessionShared {
    fn on_event(&self, event: SourceEvent) -> EventReply {
        match event {
            SourceEvent::Registered(source) => {
                self.source.store(Some(Arc::new(BoundSource(source))));
                self.no_frame_ticks.store(0, Ordering::Release);
                info!("Instance {} attached to upstream {}", self.instance, self.name);
                EventReply::Ack
            }
            SourceEvent::Unregistered => {
                self.source.store(None);
                self.unregistered.store(true, Ordering::Release);
                self.relatch.store(true, Ordering::Release);
                info!("Instance {} lost upstream {}", self.instance, self.name);
                EventReply::Ack
            }
            SourceEvent::QueryActive => {
                if self.no_frame_ticks.load(Ordering::Acquire) > 1 {
                    EventReply::Inactive
                } else {
                    EventReply::Active
                }
            }
            SourceEvent::FrameRateHint { duration_us } => {
                if self.config.load().capture.seek_suppress {
                    debug!(duration_us, "Frame-rate hint suppressed while seeking");
                    return EventReply::Ignored;
                }
                self.rate_hint_us.store(duration_us, Ordering::Release);
                EventReply::Ack
            }
            SourceEvent::FrameRateHintEnd => {
                self.rate_hint_us.store(0, Ordering::Release);
                EventReply::Ack
            }
        }
    }
}
