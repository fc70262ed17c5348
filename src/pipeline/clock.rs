//! Presentation clock consumed by synchronized delivery.
//!
//! All values are microseconds. `now` is the running system presentation time;
//! `set_video_pts` records the position of the last presented video buffer.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use tracing::{info, warn};

pub trait PresentationClock: Send + Sync {
    fn now(&self) -> u64;

    fn set_video_pts(&self, pts_us: u64);

    /// First buffer of a synchronized stream is about to be presented.
    fn stream_start(&self, pts_us: u64);

    /// A buffer's timestamp jumped beyond the discontinuity margin. The clock
    /// may re-anchor on `pts_us`.
    fn discontinuity(&self, pts_us: u64);
}

/// Monotonic clock that starts at the first buffer's timestamp.
pub struct SystemClock {
    origin: Instant,
    offset_us: AtomicI64,
    video_pts: AtomicU64,
    started: AtomicBool,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset_us: AtomicI64::new(0),
            video_pts: AtomicU64::new(0),
            started: AtomicBool::new(false),
        }
    }

    fn elapsed_us(&self) -> i64 {
        self.origin.elapsed().as_micros() as i64
    }

    pub fn video_pts(&self) -> u64 {
        self.video_pts.load(Ordering::Acquire)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl PresentationClock for SystemClock {
    fn now(&self) -> u64 {
        (self.elapsed_us() + self.offset_us.load(Ordering::Acquire)).max(0) as u64
    }

    fn set_video_pts(&self, pts_us: u64) {
        self.video_pts.store(pts_us, Ordering::Release);
    }

    fn stream_start(&self, pts_us: u64) {
        self.offset_us
            .store(pts_us as i64 - self.elapsed_us(), Ordering::Release);
        self.video_pts.store(pts_us, Ordering::Release);
        self.started.store(true, Ordering::Release);
        info!(pts_us, "Presentation clock started");
    }

    /// Re-anchors the clock on the jumped timestamp.
    fn discontinuity(&self, pts_us: u64) {
        warn!(pts_us, now_us = self.now(), "Video timestamp discontinuity");
        self.offset_us
            .store(pts_us as i64 - self.elapsed_us(), Ordering::Release);
        self.video_pts.store(pts_us, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockEvent {
    StreamStart(u64),
    Discontinuity(u64),
}

/// Hand-driven clock for deterministic pacing.
#[derive(Default)]
pub struct ManualClock {
    now_us: AtomicU64,
    video_pts: AtomicU64,
    events: Mutex<Vec<ClockEvent>>,
}

impl ManualClock {
    pub fn new(now_us: u64) -> Self {
        Self {
            now_us: AtomicU64::new(now_us),
            ..Self::default()
        }
    }

    pub fn set_now(&self, now_us: u64) {
        self.now_us.store(now_us, Ordering::Release);
    }

    pub fn advance(&self, delta_us: u64) {
        self.now_us.fetch_add(delta_us, Ordering::AcqRel);
    }

    pub fn video_pts(&self) -> u64 {
        self.video_pts.load(Ordering::Acquire)
    }

    pub fn events(&self) -> Vec<ClockEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, event: ClockEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

impl PresentationClock for ManualClock {
    fn now(&self) -> u64 {
        self.now_us.load(Ordering::Acquire)
    }

    fn set_video_pts(&self, pts_us: u64) {
        self.video_pts.store(pts_us, Ordering::Release);
    }

    fn stream_start(&self, pts_us: u64) {
        self.now_us.store(pts_us, Ordering::Release);
        self.video_pts.store(pts_us, Ordering::Release);
        self.record(ClockEvent::StreamStart(pts_us));
    }

    fn discontinuity(&self, pts_us: u64) {
        self.record(ClockEvent::Discontinuity(pts_us));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_starts_at_first_pts() {
        let clock = SystemClock::new();
        assert!(!clock.is_started());
        clock.stream_start(10_000_000);
        assert!(clock.is_started());
        let now = clock.now();
        assert!(now >= 10_000_000 && now < 11_000_000);
        assert_eq!(clock.video_pts(), 10_000_000);
    }

    #[test]
    fn system_clock_reanchors_on_discontinuity() {
        let clock = SystemClock::new();
        clock.stream_start(10_000_000);
        clock.discontinuity(1_000_000);
        let now = clock.now();
        assert!(now >= 1_000_000 && now < 1_500_000);
        assert_eq!(clock.video_pts(), 1_000_000);
    }

    #[test]
    fn manual_clock_records_events() {
        let clock = ManualClock::new(5);
        clock.stream_start(100);
        clock.advance(10);
        clock.discontinuity(9_999);
        assert_eq!(clock.now(), 110);
        assert_eq!(
            clock.events(),
            vec![ClockEvent::StreamStart(100), ClockEvent::Discontinuity(9_999)]
        );
    }
}
