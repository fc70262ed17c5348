//! Capture buffer pool shared by the acquisition worker and the caller.
//!
//! Two FIFO queues behind one short-held lock: `queued` holds empty buffers
//! waiting for a frame, `done` holds completed buffers waiting for the
//! consumer. The lock only ever guards a splice; frames are rendered with the
//! buffer detached from both queues.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::BytesMut;
use crossbeam::utils::CachePadded;

use crate::capture::format::{CaptureFormat, Geometry};
use crate::capture::frame::FieldParity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferStatus {
    /// Owned by the caller
    Idle,
    /// Waiting for a frame
    Queued,
    /// Filled, waiting to be retrieved
    Done,
    /// Returned without a frame when streaming stopped
    Error,
}

/// An output buffer supplied by the caller.
#[derive(Debug)]
pub struct CaptureBuffer {
    pub(crate) index: usize,
    pub(crate) status: BufferStatus,
    /// Format bound at first submission with resolved storage
    pub(crate) layout: Option<CaptureFormat>,
    pub(crate) data: BytesMut,
    pub(crate) bytes_used: usize,
    pub(crate) geometry: Geometry,
    pub(crate) pts_us: u64,
    pub(crate) duration_us: u32,
    pub(crate) field: Option<FieldParity>,
    pub(crate) sequence: u64,
}

impl CaptureBuffer {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            status: BufferStatus::Idle,
            layout: None,
            data: BytesMut::new(),
            bytes_used: 0,
            geometry: Geometry::default(),
            pts_us: 0,
            duration_us: 0,
            field: None,
            sequence: 0,
        }
    }

    /// Resolve storage and bind `format` unless already bound.
    pub(crate) fn bind_once(&mut self, format: &CaptureFormat) {
        if self.layout.is_none() {
            self.data = BytesMut::zeroed(format.size_image);
            self.geometry = format.capture;
            self.layout = Some(*format);
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn status(&self) -> BufferStatus {
        self.status
    }

    pub fn pts_us(&self) -> u64 {
        self.pts_us
    }

    pub fn duration_us(&self) -> u32 {
        self.duration_us
    }

    pub fn field(&self) -> Option<FieldParity> {
        self.field
    }
}

#[derive(Debug, Default)]
struct Queues {
    queued: VecDeque<CaptureBuffer>,
    done: VecDeque<CaptureBuffer>,
}

#[derive(Default)]
struct Stats {
    size: AtomicUsize,
    recycled: AtomicU64,
    ready: AtomicU64,
}

/// Read-only pool statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Buffers allocated for the session
    pub size: usize,
    /// Buffers waiting for a frame
    pub free: usize,
    /// Completed buffers sent back for refill without delivery
    pub recycled: u64,
    /// Completed buffers waiting to be retrieved
    pub available: usize,
    /// Completions since streaming started
    pub ready: u64,
}

#[derive(Default)]
pub struct CapturePool {
    queues: Mutex<Queues>,

    /// Statistics
    stats: CachePadded<Stats>,
}

impl CapturePool {
    pub fn new() -> Self {
        Self::default()
    }

    fn queues(&self) -> MutexGuard<'_, Queues> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_size(&self, size: usize) {
        self.stats.size.store(size, Ordering::Relaxed);
    }

    pub(crate) fn reset_ready(&self) {
        self.stats.ready.store(0, Ordering::Relaxed);
    }

    /// Append an empty buffer to the tail.
    pub fn enqueue(&self, mut buffer: CaptureBuffer) {
        buffer.status = BufferStatus::Queued;
        self.queues().queued.push_back(buffer);
    }

    /// Detach the head empty buffer for filling.
    pub(crate) fn take_head(&self) -> Option<CaptureBuffer> {
        self.queues().queued.pop_front()
    }

    /// Put a buffer that could not be filled back at the head.
    pub(crate) fn restore_head(&self, buffer: CaptureBuffer) {
        self.queues().queued.push_front(buffer);
    }

    pub(crate) fn complete(&self, mut buffer: CaptureBuffer) {
        buffer.status = BufferStatus::Done;
        self.queues().done.push_back(buffer);
        self.stats.ready.fetch_add(1, Ordering::Relaxed);
    }

    /// Oldest completed buffer.
    pub fn pop_done(&self) -> Option<CaptureBuffer> {
        self.queues().done.pop_front()
    }

    /// Undo a [`pop_done`](Self::pop_done) without losing its position.
    pub(crate) fn unpop_done(&self, buffer: CaptureBuffer) {
        self.queues().done.push_front(buffer);
    }

    /// Send a completed buffer straight back for refill.
    pub(crate) fn recycle(&self, buffer: CaptureBuffer) {
        self.enqueue(buffer);
        self.stats.recycled.fetch_add(1, Ordering::Relaxed);
    }

    /// Move every completed buffer back to the refill queue.
    pub(crate) fn reoffer_done(&self) -> usize {
        let mut queues = self.queues();
        let Queues { queued, done } = &mut *queues;
        let count = done.len();
        for mut buffer in done.drain(..) {
            buffer.status = BufferStatus::Queued;
            queued.push_back(buffer);
        }
        self.stats.recycled.fetch_add(count as u64, Ordering::Relaxed);
        count
    }

    /// Remove everything, marking each buffer as completed with error.
    pub(crate) fn drain_all(&self) -> Vec<CaptureBuffer> {
        let mut queues = self.queues();
        let Queues { queued, done } = &mut *queues;
        queued
            .drain(..)
            .chain(done.drain(..))
            .map(|mut buffer| {
                buffer.status = BufferStatus::Error;
                buffer
            })
            .collect()
    }

    pub fn status_of(&self, index: usize) -> Option<BufferStatus> {
        let queues = self.queues();
        queues
            .queued
            .iter()
            .chain(queues.done.iter())
            .find(|buffer| buffer.index == index)
            .map(|buffer| buffer.status)
    }

    pub fn is_idle(&self) -> bool {
        let queues = self.queues();
        queues.queued.is_empty() && queues.done.is_empty()
    }

    pub fn stats(&self) -> PoolStats {
        let (free, available) = {
            let queues = self.queues();
            (queues.queued.len(), queues.done.len())
        };
        PoolStats {
            size: self.stats.size.load(Ordering::Relaxed),
            free,
            recycled: self.stats.recycled.load(Ordering::Relaxed),
            available,
            ready: self.stats.ready.load(Ordering::Relaxed),
        }
    }
}
