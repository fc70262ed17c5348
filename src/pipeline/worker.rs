//! Background acquisition: pulls frames from the bound source and completes
//! the head buffer of the pool, one tick at a time, until cancelled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use metrics::counter;
use tracing::{debug, trace, warn};

use crate::capture::format::{CaptureFormat, Geometry};
use crate::capture::frame::{FieldParity, Frame, FrameMetadata};
use crate::capture::processor::OutputTarget;
use crate::error::Result;
use crate::pipeline::pool::CaptureBuffer;
use crate::session::state::SessionShared;
use crate::utils::target_geometry;
use crate::{DeliveryMode, WorkerConfig};

/// What a single tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    NoFrame,
    /// Frame still switching upstream; released unused
    Fenced,
    /// Field of the wrong parity; released unused
    FieldSkipped,
    /// Source geometry does not match the negotiated one yet
    GeometryPending,
    PoolEmpty,
    RenderFailed,
    Filled { index: usize },
}

impl Tick {
    fn backoff(self, config: &WorkerConfig) -> Option<Duration> {
        match self {
            Tick::NoFrame | Tick::Fenced | Tick::FieldSkipped => Some(config.no_frame_backoff()),
            Tick::GeometryPending => Some(config.geometry_backoff()),
            Tick::PoolEmpty | Tick::RenderFailed => Some(config.pool_empty_backoff()),
            Tick::Filled { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RunningPts {
    last_us: u64,
    /// Maps source timestamps onto the session timeline once known
    offset_us: Option<i64>,
}

/// Per-stream fill state, reset on start and on upstream unregistration.
#[derive(Debug, Default)]
struct FillState {
    parity: Option<FieldParity>,
    running: Option<RunningPts>,
}

pub(crate) struct AcquisitionWorker {
    shared: Arc<SessionShared>,
    mode: DeliveryMode,
    baseline_us: u64,
    fill: FillState,
}

impl AcquisitionWorker {
    pub(crate) fn new(shared: Arc<SessionShared>, mode: DeliveryMode, baseline_us: u64) -> Self {
        Self {
            shared,
            mode,
            baseline_us,
            fill: FillState::default(),
        }
    }

    pub(crate) fn tick(&mut self) -> Tick {
        if self.shared.relatch.swap(false, Ordering::AcqRel) {
            self.fill = FillState::default();
        }

        let Some(bound) = self.shared.source.load_full() else {
            return self.no_frame();
        };
        let source = &bound.0;
        let Some(meta) = source.peek() else {
            return self.no_frame();
        };

        let config = self.shared.config.load();
        let format = self.shared.format.load();
        let percent = config.capture.downscale_percent;

        if let Err(tick) = self.screen(&meta, &format, percent) {
            // pending geometry leaves the frame for a later tick
            if tick != Tick::GeometryPending {
                if let Ok(frame) = source.get() {
                    source.put(frame);
                }
            }
            return self.rejected(tick, &meta);
        }

        let Some(mut buffer) = self.shared.pool.take_head() else {
            return Tick::PoolEmpty;
        };

        let frame = match source.get() {
            Ok(frame) => frame,
            Err(_) => {
                self.shared.pool.restore_head(buffer);
                return self.no_frame();
            }
        };

        // The slot may have been replaced since the peek.
        let target = match self.screen(&frame.meta, &format, percent) {
            Ok(target) => target,
            Err(tick) => {
                let taken = frame.meta;
                source.put(frame);
                self.shared.pool.restore_head(buffer);
                return self.rejected(tick, &taken);
            }
        };

        let rendered = self.fill(&mut buffer, &frame, target, &format);
        let sequence = frame.meta.sequence;
        source.put(frame);

        match rendered {
            Ok(()) => {
                let index = buffer.index;
                self.shared.pool.complete(buffer);
                self.shared.no_frame_ticks.store(0, Ordering::Release);
                counter!("vcapture_frames_filled_total").increment(1);
                Tick::Filled { index }
            }
            Err(err) => {
                warn!("Failed to render frame {}: {}", sequence, err);
                self.shared.render_failures.fetch_add(1, Ordering::AcqRel);
                self.shared.pool.restore_head(buffer);
                Tick::RenderFailed
            }
        }
    }

    /// Fence, parity and geometry checks a frame must pass before it fills a
    /// buffer. Yields the target geometry on success.
    fn screen(
        &self,
        meta: &FrameMetadata,
        format: &CaptureFormat,
        percent: u32,
    ) -> Result<Geometry, Tick> {
        if meta.fence {
            return Err(Tick::Fenced);
        }
        if let (Some(latched), Some(field)) = (self.fill.parity, meta.kind.field()) {
            if latched != field {
                return Err(Tick::FieldSkipped);
            }
        }
        let target = target_geometry(meta, percent).aligned();
        if self.mode == DeliveryMode::Synchronized && target != format.capture {
            return Err(Tick::GeometryPending);
        }
        Ok(target)
    }

    fn rejected(&self, tick: Tick, meta: &FrameMetadata) -> Tick {
        match tick {
            Tick::Fenced => {
                trace!(sequence = meta.sequence, "Dropped fenced frame");
                self.no_frame();
            }
            Tick::FieldSkipped => {
                trace!(
                    sequence = meta.sequence,
                    field = ?meta.kind.field(),
                    "Skipped field of other parity"
                );
            }
            Tick::GeometryPending => {
                let format = self.shared.format.load();
                trace!(
                    sequence = meta.sequence,
                    negotiated = ?format.capture,
                    "Waiting for geometry to settle"
                );
            }
            _ => {}
        }
        tick
    }

    fn no_frame(&self) -> Tick {
        self.shared.no_frame_ticks.fetch_add(1, Ordering::AcqRel);
        counter!("vcapture_no_frame_ticks_total").increment(1);
        Tick::NoFrame
    }

    fn fill(
        &mut self,
        buffer: &mut CaptureBuffer,
        frame: &Frame,
        geometry: Geometry,
        format: &CaptureFormat,
    ) -> Result<()> {
        buffer.bind_once(format);
        let pixel_format = buffer.layout.map_or(format.pixel_format, |l| l.pixel_format);
        let target = OutputTarget {
            format: pixel_format,
            geometry,
            bytes_per_line: CaptureFormat::new(pixel_format, geometry).bytes_per_line,
        };
        buffer.bytes_used = self.shared.processor.render(frame, &target, &mut buffer.data)?;
        buffer.geometry = geometry;

        let meta = &frame.meta;
        let field = meta.kind.field();
        if self.fill.parity.is_none() && field.is_some() {
            debug!(?field, "Latched field parity");
            self.fill.parity = field;
        }
        buffer.field = field;
        buffer.sequence = meta.sequence;
        buffer.duration_us = meta.duration_us;
        buffer.pts_us = match self.mode {
            DeliveryMode::Freerun => self.freerun_pts(meta),
            DeliveryMode::Synchronized => meta.pts_us,
        };
        Ok(())
    }

    fn freerun_pts(&mut self, meta: &FrameMetadata) -> u64 {
        let duration = u64::from(meta.duration_us);
        let (pts, offset_us) = match (self.fill.running, meta.pts_us) {
            (None, source_pts) => {
                let extra = if meta.kind.is_interlaced() { duration } else { 0 };
                let seed = self.baseline_us + extra;
                (seed, (source_pts != 0).then(|| seed as i64 - source_pts as i64))
            }
            (Some(prev), 0) => (prev.last_us + duration, prev.offset_us),
            (Some(prev), source_pts) => match prev.offset_us {
                Some(offset) => ((source_pts as i64 + offset).max(0) as u64, Some(offset)),
                None => {
                    let pts = prev.last_us + duration;
                    (pts, Some(pts as i64 - source_pts as i64))
                }
            },
        };
        self.fill.running = Some(RunningPts {
            last_us: pts,
            offset_us,
        });
        pts
    }

    pub(crate) fn run(mut self, cancel: Arc<AtomicBool>, exited: flume::Sender<()>) {
        debug!("Acquisition worker started for instance {}", self.shared.instance);
        while !cancel.load(Ordering::Acquire) {
            let tick = self.tick();
            let delay = tick.backoff(&self.shared.config.load().worker);
            if let Some(delay) = delay {
                thread::sleep(delay);
            }
        }
        debug!("Acquisition worker exiting for instance {}", self.shared.instance);
        let _ = exited.send(());
    }
}

/// Owner-side handle: cooperative cancel plus bounded join.
pub(crate) struct WorkerHandle {
    cancel: Arc<AtomicBool>,
    exited: flume::Receiver<()>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub(crate) fn spawn(worker: AcquisitionWorker) -> Result<Self> {
        let cancel = Arc::new(AtomicBool::new(false));
        let (exited_tx, exited) = flume::bounded(1);
        let name = format!("vcapture-acq-{}", worker.shared.instance);
        let flag = cancel.clone();
        let thread = thread::Builder::new()
            .name(name)
            .spawn(move || worker.run(flag, exited_tx))?;
        Ok(Self {
            cancel,
            exited,
            thread: Some(thread),
        })
    }

    /// Signal cancellation and wait up to `timeout` for the worker to exit.
    /// Returns `false` if it did not acknowledge in time.
    pub(crate) fn stop(mut self, timeout: Duration) -> bool {
        self.cancel.store(true, Ordering::Release);
        match self.exited.recv_timeout(timeout) {
            Ok(()) | Err(flume::RecvTimeoutError::Disconnected) => {
                if let Some(thread) = self.thread.take() {
                    let _ = thread.join();
                }
                true
            }
            Err(flume::RecvTimeoutError::Timeout) => {
                warn!("Acquisition worker did not exit within {:?}", timeout);
                false
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Release);
    }
}
