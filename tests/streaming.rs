use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use bytes::Bytes;

use vcapture::capture::{
    EventReply, FieldParity, Frame, FrameMetadata, FormatRequest, SlotSource, SourceEvent,
    SourceHub,
};
use vcapture::pipeline::clock::ClockEvent;
use vcapture::pipeline::{BufferStatus, ManualClock};
use vcapture::session::{
    CaptureEndpoint, CaptureSession, DeliveredBuffer, Dequeue, InstanceRegistry, SessionState,
};
use vcapture::{CaptureError, Config, DeliveryMode, PixelFormat, RegistryConfig};

const FRAME_US: u64 = 33_333;

struct Rig {
    hub: Arc<SourceHub>,
    registry: Arc<InstanceRegistry>,
    clock: Arc<ManualClock>,
    endpoint: CaptureEndpoint,
    source: Arc<SlotSource>,
}

impl Rig {
    fn new() -> Self {
        Self::with_config(Config::default())
    }

    fn with_config(config: Config) -> Self {
        let hub = Arc::new(SourceHub::new());
        let registry = Arc::new(InstanceRegistry::from_config(&RegistryConfig {
            instances: 1,
            name_prefix: "it".into(),
        }));
        let clock = Arc::new(ManualClock::new(5_000));
        let endpoint = CaptureEndpoint::builder(hub.clone())
            .registry(registry.clone())
            .config(Arc::new(ArcSwap::from_pointee(config)))
            .clock(clock.clone())
            .build();
        Self {
            hub,
            registry,
            clock,
            endpoint,
            source: Arc::new(SlotSource::new()),
        }
    }

    fn register(&self) {
        self.hub.register("it.0", self.source.clone());
    }

    /// Post frames one at a time, waiting for the worker to take each.
    fn feed(&self, frames: impl IntoIterator<Item = Frame>) {
        for frame in frames {
            assert!(wait_for(|| self.source.is_empty()), "worker stalled");
            self.source.post(frame);
        }
        assert!(wait_for(|| self.source.is_empty()), "worker stalled");
    }
}

fn wait_for(mut ready: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if ready() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    false
}

fn frame(seq: u64, pts_us: u64) -> Frame {
    Frame::new(
        Bytes::from(vec![seq as u8; 64]),
        FrameMetadata::progressive(seq, 640, 480, pts_us, FRAME_US as u32),
    )
}

fn streaming(rig: &Rig, mode: DeliveryMode, buffers: usize) -> CaptureSession {
    let mut session = rig.endpoint.open().unwrap();
    session.set_mode(mode).unwrap();
    session.request_buffers(buffers).unwrap();
    for index in 0..buffers {
        session.submit_buffer(index).unwrap();
    }
    session.start_streaming().unwrap();
    session
}

fn ready(session: &CaptureSession) -> DeliveredBuffer {
    match session.retrieve_buffer().unwrap() {
        Dequeue::Ready(buffer) => buffer,
        Dequeue::TryAgain => panic!("expected a completed buffer"),
    }
}

fn is_try_again(session: &CaptureSession) -> bool {
    matches!(session.retrieve_buffer().unwrap(), Dequeue::TryAgain)
}

#[test]
fn freerun_is_fifo_with_running_timestamps() {
    let rig = Rig::new();
    let mut session = streaming(&rig, DeliveryMode::Freerun, 3);
    // upstream shows up after streaming started
    rig.register();

    rig.feed((0..3).map(|seq| frame(seq, 1_000 + seq * FRAME_US)));
    assert!(wait_for(|| session.stats().pool.available == 3));

    let delivered: Vec<_> = (0..3).map(|_| ready(&session)).collect();
    assert_eq!(
        delivered.iter().map(|b| b.index).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );
    for (seq, buffer) in delivered.iter().enumerate() {
        assert_eq!(buffer.sequence, seq as u64);
        assert_eq!(buffer.pts_us, 5_000 + seq as u64 * FRAME_US);
        assert_eq!(buffer.timestamp, Duration::from_micros(seq as u64 * FRAME_US));
        assert_eq!(buffer.drift_us, 0);
        assert_eq!(buffer.data.len(), 64);
        assert_eq!(session.buffer_status(buffer.index).unwrap(), BufferStatus::Done);
    }
    assert!(is_try_again(&session));

    // resubmitted buffers are refilled
    session.submit_buffer(1).unwrap();
    rig.feed([frame(3, 1_000 + 3 * FRAME_US)]);
    assert!(wait_for(|| session.stats().pool.available == 1));
    assert_eq!(ready(&session).index, 1);

    session.stop_streaming().unwrap();
    session.close().unwrap();
}

#[test]
fn synchronized_delivery_defers_and_catches_up() {
    let rig = Rig::new();
    rig.register();
    let mut session = streaming(&rig, DeliveryMode::Synchronized, 4);

    let base = 1_000_000;
    rig.feed((0..4).map(|seq| frame(seq, base + seq * FRAME_US)));
    assert!(wait_for(|| session.stats().pool.available == 4));

    let first = ready(&session);
    assert_eq!((first.index, first.drift_us), (0, 0));
    assert_eq!(rig.clock.events(), vec![ClockEvent::StreamStart(base)]);

    // one frame ahead of the clock
    assert!(is_try_again(&session));
    assert_eq!(session.stats().pool.available, 3);

    rig.clock.advance(FRAME_US);
    let second = ready(&session);
    assert_eq!((second.index, second.drift_us), (1, 0));
    assert_eq!(first.timestamp, Duration::ZERO);
    assert_eq!(second.timestamp, Duration::from_micros(FRAME_US));
    assert_eq!(rig.clock.video_pts(), base + FRAME_US);

    // fall far behind: the stale buffer is recycled in favour of the next one
    rig.clock.advance(500_000);
    let caught_up = ready(&session);
    assert_eq!(caught_up.index, 3);
    assert!(caught_up.drift_us < -100_000);
    assert_eq!(session.skipped_frames(), 1);
    assert_eq!(session.buffer_status(2).unwrap(), BufferStatus::Queued);

    session.stop_streaming().unwrap();
}

#[test]
fn timestamp_jump_signals_discontinuity() {
    let rig = Rig::new();
    rig.register();
    let session = streaming(&rig, DeliveryMode::Synchronized, 2);

    let base = 2_000_000;
    let jumped = base + 10_000_000;
    rig.feed([frame(0, base), frame(1, jumped)]);
    assert!(wait_for(|| session.stats().pool.available == 2));

    ready(&session);
    assert!(is_try_again(&session));
    assert!(rig
        .clock
        .events()
        .contains(&ClockEvent::Discontinuity(jumped)));
    assert_eq!(rig.clock.video_pts(), base);
}

#[test]
fn unregistration_reoffers_completed_buffers() {
    let rig = Rig::new();
    rig.register();
    let session = streaming(&rig, DeliveryMode::Synchronized, 2);
    rig.feed([frame(0, 1_000_000), frame(1, 1_000_000 + FRAME_US)]);
    assert!(wait_for(|| session.stats().pool.available == 2));

    rig.hub.unregister("it.0");
    assert!(is_try_again(&session));
    let stats = session.stats();
    assert_eq!(stats.pool.available, 0);
    assert_eq!(stats.pool.free, 2);
    assert_eq!(stats.pool.recycled, 2);

    // the stream restarts from the next upstream
    rig.register();
    rig.feed([frame(2, 7_000_000)]);
    assert!(wait_for(|| session.stats().pool.available == 1));
    assert_eq!(ready(&session).pts_us, 7_000_000);
    assert!(rig
        .clock
        .events()
        .contains(&ClockEvent::StreamStart(7_000_000)));
}

#[test]
fn mismatched_field_parity_is_skipped() {
    let rig = Rig::new();
    rig.register();
    let session = streaming(&rig, DeliveryMode::Freerun, 2);

    let field = |seq: u64, parity| {
        Frame::new(
            Bytes::from_static(&[0u8; 32]),
            FrameMetadata::field(seq, parity, 640, 480, seq * 20_000, 20_000),
        )
    };
    rig.feed([
        field(1, FieldParity::Top),
        field(2, FieldParity::Bottom),
        field(3, FieldParity::Top),
    ]);
    assert!(wait_for(|| session.stats().pool.available == 2));

    let a = ready(&session);
    let b = ready(&session);
    assert_eq!((a.sequence, b.sequence), (1, 3));
    assert_eq!(a.field, Some(FieldParity::Top));
    assert_eq!(b.field, Some(FieldParity::Top));
}

#[test]
fn format_change_is_rejected_while_streaming() {
    let rig = Rig::new();
    let mut session = rig.endpoint.open().unwrap();
    session.start_streaming().unwrap();

    let request = FormatRequest::new(PixelFormat::Nv12, 1280, 720);
    assert!(matches!(
        session.set_format(&request),
        Err(CaptureError::Busy(_))
    ));
    assert!(matches!(
        session.set_mode(DeliveryMode::Synchronized),
        Err(CaptureError::Busy(_))
    ));

    session.stop_streaming().unwrap();
    let applied = session.set_format(&request).unwrap();
    assert_eq!(applied.pixel_format, PixelFormat::Nv12);
    assert_eq!(session.get_format(), applied);
}

#[test]
fn stop_is_idempotent_and_fails_pending_buffers() {
    let rig = Rig::new();
    let mut session = streaming(&rig, DeliveryMode::Freerun, 4);

    session.stop_streaming().unwrap();
    let statuses: Vec<_> = (0..4).map(|i| session.buffer_status(i).unwrap()).collect();
    assert_eq!(statuses, vec![BufferStatus::Error; 4]);
    assert_eq!(session.state(), SessionState::Stopped);

    session.stop_streaming().unwrap();
    assert_eq!(session.state(), SessionState::Stopped);
    assert!(session.stats().pool.free == 0 && session.stats().pool.available == 0);

    // buffers can be resubmitted for a new stream
    session.submit_buffer(0).unwrap();
    session.start_streaming().unwrap();
    assert_eq!(session.state(), SessionState::Streaming);
}

#[test]
fn query_active_reflects_frame_starvation() {
    let rig = Rig::new();
    assert_eq!(rig.hub.notify("it.0", SourceEvent::QueryActive), None);

    let mut session = rig.endpoint.open().unwrap();
    assert_eq!(
        rig.hub.notify("it.0", SourceEvent::QueryActive),
        Some(EventReply::Active)
    );

    // streaming with no upstream starves the worker
    session.start_streaming().unwrap();
    assert!(wait_for(|| {
        rig.hub.notify("it.0", SourceEvent::QueryActive) == Some(EventReply::Inactive)
    }));
    assert!(rig.registry.is_mapped(0));
}

#[test]
fn frame_rate_hint_respects_seek_suppression() {
    let mut config = Config::default();
    config.capture.seek_suppress = true;
    let rig = Rig::with_config(config);
    let _session = rig.endpoint.open().unwrap();

    assert_eq!(
        rig.hub
            .notify("it.0", SourceEvent::FrameRateHint { duration_us: 40_000 }),
        Some(EventReply::Ignored)
    );
    assert_eq!(
        rig.hub.notify("it.0", SourceEvent::FrameRateHintEnd),
        Some(EventReply::Ack)
    );
}
