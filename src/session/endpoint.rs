//! Capture endpoints and the per-open session control surface.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwap;
use bytes::Bytes;
use tracing::{debug, info, instrument, warn};

use crate::admin::SessionStats;
use crate::capture::format::{self, CaptureFormat, FormatDescriptor, FormatRequest, FrameSizes, Geometry};
use crate::capture::frame::FieldParity;
use crate::capture::processor::{FrameProcessor, PassthroughProcessor};
use crate::capture::source::{FrameReceiver, SourceHub};
use crate::error::{CaptureError, Result};
use crate::pipeline::clock::{PresentationClock, SystemClock};
use crate::pipeline::pool::{BufferStatus, CaptureBuffer};
use crate::pipeline::sync::{SyncController, SyncOutcome};
use crate::pipeline::worker::{AcquisitionWorker, WorkerHandle};
use crate::session::registry::{InstanceRegistry, REGISTRY};
use crate::session::state::SessionShared;
use crate::{Config, DeliveryMode, CONFIG};

pub const MAX_BUFFERS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Opened,
    Streaming,
    Stopped,
}

/// Result of a retrieval request.
#[derive(Debug)]
pub enum Dequeue {
    Ready(DeliveredBuffer),
    /// Nothing to hand out right now; ask again later
    TryAgain,
}

/// A completed buffer as seen by the consumer.
#[derive(Debug, Clone)]
pub struct DeliveredBuffer {
    pub index: usize,
    pub data: Bytes,
    pub geometry: Geometry,
    pub sequence: u64,
    pub field: Option<FieldParity>,
    pub pts_us: u64,
    pub duration_us: u32,
    /// Time since the stream's presentation origin
    pub timestamp: Duration,
    /// Offset from the presentation clock at delivery; 0 in freerun
    pub drift_us: i64,
}

struct EndpointInner {
    registry: Arc<InstanceRegistry>,
    hub: Arc<SourceHub>,
    config: Arc<ArcSwap<Config>>,
    clock: Arc<dyn PresentationClock>,
    processor: Arc<dyn FrameProcessor>,
    instance: Option<u32>,
    open: AtomicBool,
}

/// One capture endpoint; at most one session may be open on it at a time.
#[derive(Clone)]
pub struct CaptureEndpoint {
    inner: Arc<EndpointInner>,
}

pub struct EndpointBuilder {
    hub: Arc<SourceHub>,
    registry: Arc<InstanceRegistry>,
    config: Arc<ArcSwap<Config>>,
    clock: Arc<dyn PresentationClock>,
    processor: Arc<dyn FrameProcessor>,
    instance: Option<u32>,
}

impl EndpointBuilder {
    pub fn registry(mut self, registry: Arc<InstanceRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn config(mut self, config: Arc<ArcSwap<Config>>) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn PresentationClock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn processor(mut self, processor: Arc<dyn FrameProcessor>) -> Self {
        self.processor = processor;
        self
    }

    /// Always bind this registry instance rather than the first free one.
    pub fn instance(mut self, id: u32) -> Self {
        self.instance = Some(id);
        self
    }

    pub fn build(self) -> CaptureEndpoint {
        CaptureEndpoint {
            inner: Arc::new(EndpointInner {
                registry: self.registry,
                hub: self.hub,
                config: self.config,
                clock: self.clock,
                processor: self.processor,
                instance: self.instance,
                open: AtomicBool::new(false),
            }),
        }
    }
}

impl CaptureEndpoint {
    pub fn builder(hub: Arc<SourceHub>) -> EndpointBuilder {
        EndpointBuilder {
            hub,
            registry: REGISTRY.clone(),
            config: CONFIG.clone(),
            clock: Arc::new(SystemClock::new()),
            processor: Arc::new(PassthroughProcessor),
            instance: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    /// Open a session: map a registry instance and bind its upstream name.
    #[instrument(skip(self))]
    pub fn open(&self) -> Result<CaptureSession> {
        if self
            .inner
            .open
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CaptureError::Busy("endpoint already open"));
        }
        let session = self.bind();
        if session.is_err() {
            self.inner.open.store(false, Ordering::Release);
        }
        session
    }

    fn bind(&self) -> Result<CaptureSession> {
        let inner = &self.inner;
        let config = inner.config.load_full();
        let assignment = match inner.instance.or(config.capture.instance) {
            Some(id) => inner.registry.assign(id)?,
            None => inner.registry.assign_any()?,
        };

        let format = CaptureFormat::new(
            config.capture.format,
            Geometry::new(config.capture.width, config.capture.height),
        );
        let shared = Arc::new(SessionShared::new(
            assignment.clone(),
            format,
            inner.config.clone(),
            inner.clock.clone(),
            inner.processor.clone(),
        ));
        let receiver: Arc<dyn FrameReceiver> = shared.clone();
        if let Err(err) = inner.hub.bind(&assignment.name, Arc::downgrade(&receiver)) {
            inner.registry.release(assignment.id);
            return Err(err);
        }

        info!("Opened capture instance {} ({})", assignment.id, assignment.name);
        Ok(CaptureSession {
            endpoint: inner.clone(),
            shared,
            state: SessionState::Opened,
            mode: config.capture.mode,
            slots: Mutex::new(Vec::new()),
            sync: Mutex::new(SyncController::new(config.sync.clone())),
            freerun_origin_us: 0,
            worker: None,
        })
    }
}

/// An open capture session.
pub struct CaptureSession {
    endpoint: Arc<EndpointInner>,
    shared: Arc<SessionShared>,
    state: SessionState,
    mode: DeliveryMode,
    /// Buffers currently owned by the caller, by index
    slots: Mutex<Vec<Option<CaptureBuffer>>>,
    sync: Mutex<SyncController>,
    /// Clock reading when freerun streaming started
    freerun_origin_us: u64,
    worker: Option<WorkerHandle>,
}

impl CaptureSession {
    fn slots(&self) -> MutexGuard<'_, Vec<Option<CaptureBuffer>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state == SessionState::Closed {
            return Err(CaptureError::InvalidState("session is closed"));
        }
        Ok(())
    }

    fn ensure_idle(&self) -> Result<()> {
        self.ensure_open()?;
        if self.state == SessionState::Streaming || !self.shared.pool.is_idle() {
            return Err(CaptureError::Busy("buffers outstanding"));
        }
        Ok(())
    }

    pub fn instance(&self) -> u32 {
        self.shared.instance
    }

    /// Upstream name this session is bound to.
    pub fn source_name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: DeliveryMode) -> Result<()> {
        self.ensure_open()?;
        if self.state == SessionState::Streaming {
            return Err(CaptureError::Busy("cannot change delivery mode while streaming"));
        }
        self.mode = mode;
        Ok(())
    }

    pub fn enumerate_formats(&self, index: usize) -> Result<&'static FormatDescriptor> {
        format::enumerate_formats(index)
    }

    pub fn enumerate_frame_sizes(&self, fourcc: [u8; 4]) -> Result<FrameSizes> {
        format::enumerate_frame_sizes(fourcc)
    }

    pub fn get_format(&self) -> CaptureFormat {
        **self.shared.format.load()
    }

    pub fn try_format(&self, request: &FormatRequest) -> Result<CaptureFormat> {
        format::negotiate(request)
    }

    /// Apply a new format. Only allowed with no buffer queued or completed.
    #[instrument(skip(self))]
    pub fn set_format(&mut self, request: &FormatRequest) -> Result<CaptureFormat> {
        self.ensure_idle()?;
        let negotiated = format::negotiate(request)?;
        self.shared.format.store(Arc::new(negotiated));
        for buffer in self.slots().iter_mut().flatten() {
            buffer.layout = None;
        }
        debug!(
            "Format set to {:?} {}x{}",
            negotiated.pixel_format, negotiated.capture.width, negotiated.capture.height
        );
        Ok(negotiated)
    }

    /// Allocate `count` buffer slots, replacing any previous set. Zero frees them.
    #[instrument(skip(self))]
    pub fn request_buffers(&mut self, count: usize) -> Result<usize> {
        self.ensure_idle()?;
        let count = count.min(MAX_BUFFERS);
        *self.slots() = (0..count).map(|index| Some(CaptureBuffer::new(index))).collect();
        self.shared.pool.set_size(count);
        Ok(count)
    }

    /// Hand an empty buffer to the pool.
    pub fn submit_buffer(&self, index: usize) -> Result<()> {
        self.ensure_open()?;
        let mut buffer = {
            let mut slots = self.slots();
            let slot = slots.get_mut(index).ok_or(CaptureError::OutOfRange(index))?;
            slot.take().ok_or_else(|| {
                CaptureError::InvalidArgument(format!("buffer {index} is already queued"))
            })?
        };
        buffer.bind_once(&self.shared.format.load());
        buffer.bytes_used = 0;
        self.shared.pool.enqueue(buffer);
        Ok(())
    }

    /// Take the next completed buffer, if the delivery discipline allows it.
    pub fn retrieve_buffer(&self) -> Result<Dequeue> {
        self.ensure_open()?;
        let unregistered = self.shared.unregistered.swap(false, Ordering::AcqRel);

        let (buffer, drift_us, origin_us) = match self.mode {
            DeliveryMode::Freerun => match self.shared.pool.pop_done() {
                Some(buffer) => (buffer, 0, self.freerun_origin_us),
                None => return Ok(Dequeue::TryAgain),
            },
            DeliveryMode::Synchronized => {
                let mut sync = self.sync.lock().unwrap_or_else(PoisonError::into_inner);
                let outcome = sync.retrieve(
                    &self.shared.pool,
                    self.shared.clock.as_ref(),
                    unregistered,
                    self.shared.rate_hint_us.load(Ordering::Acquire),
                );
                match outcome {
                    SyncOutcome::Deliver {
                        buffer,
                        drift_us,
                        skipped,
                    } => {
                        self.shared
                            .skipped
                            .fetch_add(u64::from(skipped), Ordering::AcqRel);
                        (buffer, drift_us, sync.origin_us())
                    }
                    SyncOutcome::TryAgain(_) => return Ok(Dequeue::TryAgain),
                }
            }
        };

        let delivered = DeliveredBuffer {
            index: buffer.index,
            data: Bytes::copy_from_slice(&buffer.data[..buffer.bytes_used]),
            geometry: buffer.geometry,
            sequence: buffer.sequence,
            field: buffer.field,
            pts_us: buffer.pts_us,
            duration_us: buffer.duration_us,
            timestamp: Duration::from_micros(buffer.pts_us.saturating_sub(origin_us)),
            drift_us,
        };
        self.return_to_caller(buffer);
        Ok(Dequeue::Ready(delivered))
    }

    fn return_to_caller(&self, buffer: CaptureBuffer) {
        let mut slots = self.slots();
        let index = buffer.index;
        if let Some(slot) = slots.get_mut(index) {
            *slot = Some(buffer);
        }
    }

    /// Spawn the acquisition worker.
    #[instrument(skip(self))]
    pub fn start_streaming(&mut self) -> Result<()> {
        match self.state {
            SessionState::Closed => return Err(CaptureError::InvalidState("session is closed")),
            SessionState::Streaming => return Err(CaptureError::InvalidState("already streaming")),
            SessionState::Opened | SessionState::Stopped => {}
        }

        self.shared.pool.reset_ready();
        self.shared.no_frame_ticks.store(0, Ordering::Release);
        self.shared.unregistered.store(false, Ordering::Release);
        self.sync
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reset();

        let baseline_us = self.shared.clock.now();
        self.freerun_origin_us = baseline_us;
        let worker = AcquisitionWorker::new(self.shared.clone(), self.mode, baseline_us);
        self.worker = Some(WorkerHandle::spawn(worker)?);
        self.state = SessionState::Streaming;
        info!("Instance {} streaming ({:?})", self.shared.instance, self.mode);
        Ok(())
    }

    /// Cancel the worker, wait for it (bounded), then fail every buffer still
    /// in the pool. Safe to call repeatedly.
    #[instrument(skip(self))]
    pub fn stop_streaming(&mut self) -> Result<()> {
        self.ensure_open()?;
        if let Some(worker) = self.worker.take() {
            let timeout = self.endpoint.config.load().worker.stop_timeout();
            if !worker.stop(timeout) {
                warn!("Draining instance {} without worker exit", self.shared.instance);
            }
        }

        let drained = self.shared.pool.drain_all();
        let count = drained.len();
        for buffer in drained {
            self.return_to_caller(buffer);
        }
        if self.state == SessionState::Streaming {
            self.state = SessionState::Stopped;
            info!("Instance {} stopped, {} buffers returned", self.shared.instance, count);
        }
        Ok(())
    }

    /// Unbind the upstream and release the registry mapping.
    #[instrument(skip(self))]
    pub fn close(&mut self) -> Result<()> {
        match self.state {
            SessionState::Closed => return Ok(()),
            SessionState::Streaming => {
                return Err(CaptureError::Busy("stop streaming before closing"))
            }
            SessionState::Opened | SessionState::Stopped => {}
        }

        self.shared.pool.drain_all();
        self.endpoint.hub.unbind(&self.shared.name);
        self.shared.source.store(None);
        self.endpoint.registry.release(self.shared.instance);
        self.endpoint.open.store(false, Ordering::Release);
        self.state = SessionState::Closed;
        info!("Closed capture instance {}", self.shared.instance);
        Ok(())
    }

    pub fn buffer_status(&self, index: usize) -> Result<BufferStatus> {
        let slots = self.slots();
        match slots.get(index) {
            None => Err(CaptureError::OutOfRange(index)),
            Some(Some(buffer)) => Ok(buffer.status),
            // detached for filling counts as queued
            Some(None) => Ok(self
                .shared
                .pool
                .status_of(index)
                .unwrap_or(BufferStatus::Queued)),
        }
    }

    pub fn skipped_frames(&self) -> u64 {
        self.shared.skipped.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            pool: self.shared.pool.stats(),
            skipped: self.skipped_frames(),
            render_failures: self.shared.render_failures.load(Ordering::Acquire),
            no_frame_ticks: self.shared.no_frame_ticks.load(Ordering::Acquire),
            state: self.state,
            mode: self.mode,
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        if self.state != SessionState::Closed {
            let _ = self.stop_streaming();
            let _ = self.close();
        }
    }
}
