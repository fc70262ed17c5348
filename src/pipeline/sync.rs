//! Synchronized dequeue: decides per retrieval whether the oldest completed
//! buffer is delivered, deferred, or skipped past to catch up with the
//! presentation clock.

use metrics::counter;
use tracing::{debug, trace};

use crate::pipeline::clock::PresentationClock;
use crate::pipeline::pool::{CaptureBuffer, CapturePool};
use crate::SyncConfig;

/// Synthesized timestamps use this fraction of the buffer duration.
const SYNTH_DURATION_NUM: u64 = 15;
const SYNTH_DURATION_DEN: u64 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncState {
    #[default]
    NotStarted,
    Started,
}

/// Why a retrieval produced nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deferral {
    /// Upstream went away; completed buffers were sent back for refill
    Reset { reoffered: usize },
    /// Nothing completed yet
    Empty,
    /// Oldest buffer is ahead of the clock by `drift_us`
    Ahead { drift_us: i64 },
}

#[derive(Debug)]
pub enum SyncOutcome {
    Deliver {
        buffer: CaptureBuffer,
        drift_us: i64,
        /// Buffers skipped by catch-up during this retrieval
        skipped: u32,
    },
    TryAgain(Deferral),
}

/// Per-session synchronized delivery state.
#[derive(Debug, Clone)]
pub struct SyncController {
    state: SyncState,
    /// Timestamp the presentation clock was started at
    origin_us: u64,
    config: SyncConfig,
}

impl SyncController {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            state: SyncState::NotStarted,
            origin_us: 0,
            config,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn origin_us(&self) -> u64 {
        self.origin_us
    }

    pub fn reset(&mut self) {
        self.state = SyncState::NotStarted;
    }

    /// Decide what a retrieval request returns.
    ///
    /// `unregistered` reports that the upstream binding was torn down since the
    /// previous call. `fallback_duration_us` stands in for buffers that carry
    /// no duration when a timestamp has to be synthesized.
    pub fn retrieve(
        &mut self,
        pool: &CapturePool,
        clock: &dyn PresentationClock,
        unregistered: bool,
        fallback_duration_us: u32,
    ) -> SyncOutcome {
        if unregistered {
            let reoffered = pool.reoffer_done();
            self.state = SyncState::NotStarted;
            debug!(reoffered, "Upstream unregistered, synchronized stream reset");
            return SyncOutcome::TryAgain(Deferral::Reset { reoffered });
        }

        let Some(mut buffer) = pool.pop_done() else {
            return SyncOutcome::TryAgain(Deferral::Empty);
        };

        let mut drift_us = match self.state {
            SyncState::NotStarted => {
                let pts = if buffer.pts_us == 0 {
                    clock.now()
                } else {
                    buffer.pts_us
                };
                clock.stream_start(pts);
                self.origin_us = pts;
                self.state = SyncState::Started;
                0
            }
            SyncState::Started => self.reconcile(&mut buffer, clock, fallback_duration_us),
        };

        if drift_us > self.config.ahead_us {
            trace!(index = buffer.index, drift_us, "Buffer ahead of clock");
            pool.unpop_done(buffer);
            return SyncOutcome::TryAgain(Deferral::Ahead { drift_us });
        }

        let mut skipped = 0u32;
        if drift_us < self.config.behind_us {
            while (skipped as usize) < self.config.catch_up_limit {
                let Some(next) = pool.pop_done() else {
                    break;
                };
                pool.recycle(buffer);
                skipped += 1;
                buffer = next;
                drift_us = self.reconcile(&mut buffer, clock, fallback_duration_us);
                if drift_us >= self.config.behind_us {
                    break;
                }
            }
            if skipped > 0 {
                counter!("vcapture_sync_skipped_total").increment(u64::from(skipped));
                debug!(skipped, drift_us, "Caught up with presentation clock");
            }
        }

        SyncOutcome::Deliver {
            buffer,
            drift_us,
            skipped,
        }
    }

    /// Fill in a missing timestamp, apply the discontinuity check and return
    /// the buffer's drift against the clock.
    fn reconcile(
        &mut self,
        buffer: &mut CaptureBuffer,
        clock: &dyn PresentationClock,
        fallback_duration_us: u32,
    ) -> i64 {
        if buffer.pts_us == 0 {
            let duration = match buffer.duration_us {
                0 => fallback_duration_us,
                d => d,
            };
            buffer.pts_us =
                clock.now() + u64::from(duration) * SYNTH_DURATION_NUM / SYNTH_DURATION_DEN;
        }

        let before = clock.now();
        if buffer.pts_us.abs_diff(before) > self.config.discontinuity_us {
            counter!("vcapture_discontinuities_total").increment(1);
            clock.discontinuity(buffer.pts_us);
            // keep relative timestamps continuous if the clock re-anchored
            let jump = clock.now() as i64 - before as i64;
            self.origin_us = self.origin_us.saturating_add_signed(jump);
        } else {
            clock.set_video_pts(buffer.pts_us);
        }

        buffer.pts_us as i64 - clock.now() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::clock::{ClockEvent, ManualClock, SystemClock};
    use std::time::{Duration, Instant};

    const FRAME_US: u64 = 16_666;

    fn pool_with(pts: &[u64]) -> CapturePool {
        let pool = CapturePool::new();
        for (index, &pts_us) in pts.iter().enumerate() {
            let mut buffer = CaptureBuffer::new(index);
            buffer.pts_us = pts_us;
            buffer.duration_us = FRAME_US as u32;
            pool.complete(buffer);
        }
        pool
    }

    fn delivered(outcome: SyncOutcome) -> (CaptureBuffer, i64, u32) {
        match outcome {
            SyncOutcome::Deliver {
                buffer,
                drift_us,
                skipped,
            } => (buffer, drift_us, skipped),
            SyncOutcome::TryAgain(why) => panic!("expected delivery, got {why:?}"),
        }
    }

    #[test]
    fn first_retrieval_starts_the_clock() {
        let pool = pool_with(&[1_000_000]);
        let clock = ManualClock::new(0);
        let mut sync = SyncController::new(SyncConfig::default());

        let (buffer, drift, skipped) = delivered(sync.retrieve(&pool, &clock, false, 0));
        assert_eq!(buffer.index, 0);
        assert_eq!((drift, skipped), (0, 0));
        assert_eq!(sync.state(), SyncState::Started);
        assert_eq!(clock.events(), vec![ClockEvent::StreamStart(1_000_000)]);
    }

    #[test]
    fn unset_first_timestamp_starts_at_clock() {
        let pool = pool_with(&[0]);
        let clock = ManualClock::new(42_000);
        let mut sync = SyncController::new(SyncConfig::default());
        delivered(sync.retrieve(&pool, &clock, false, 0));
        assert_eq!(clock.events(), vec![ClockEvent::StreamStart(42_000)]);
    }

    #[test]
    fn empty_pool_is_try_again() {
        let pool = CapturePool::new();
        let clock = ManualClock::new(0);
        let mut sync = SyncController::new(SyncConfig::default());
        assert!(matches!(
            sync.retrieve(&pool, &clock, false, 0),
            SyncOutcome::TryAgain(Deferral::Empty)
        ));
        assert_eq!(sync.state(), SyncState::NotStarted);
    }

    #[test]
    fn buffer_ahead_of_clock_is_deferred_in_place() {
        let pool = pool_with(&[1_000_000, 1_000_000 + 3 * FRAME_US]);
        let clock = ManualClock::new(0);
        let mut sync = SyncController::new(SyncConfig::default());
        delivered(sync.retrieve(&pool, &clock, false, 0));

        let outcome = sync.retrieve(&pool, &clock, false, 0);
        assert!(matches!(
            outcome,
            SyncOutcome::TryAgain(Deferral::Ahead { drift_us }) if drift_us == 3 * FRAME_US as i64
        ));
        assert_eq!(pool.stats().available, 1);

        clock.advance(3 * FRAME_US);
        let (buffer, drift, _) = delivered(sync.retrieve(&pool, &clock, false, 0));
        assert_eq!((buffer.index, drift), (1, 0));
    }

    #[test]
    fn steady_stream_tracks_frame_period() {
        let base = 2_000_000;
        let pts: Vec<u64> = (0..10).map(|i| base + i * FRAME_US).collect();
        let pool = pool_with(&pts);
        let clock = ManualClock::new(0);
        let mut sync = SyncController::new(SyncConfig::default());

        let mut last = None;
        for _ in 0..10 {
            let (buffer, drift, skipped) = delivered(sync.retrieve(&pool, &clock, false, 0));
            assert_eq!((drift, skipped), (0, 0));
            if let Some(prev) = last {
                assert_eq!(buffer.pts_us - prev, FRAME_US);
            }
            last = Some(buffer.pts_us);
            clock.advance(FRAME_US);
        }
        assert_eq!(clock.events(), vec![ClockEvent::StreamStart(base)]);
        assert_eq!(clock.video_pts(), base + 9 * FRAME_US);
    }

    #[test]
    fn jump_beyond_margin_signals_discontinuity_without_touching_clock() {
        let pool = pool_with(&[1_000_000, 1_000_000 + FRAME_US, 6_000_000 + 2 * FRAME_US]);
        let clock = ManualClock::new(0);
        let mut sync = SyncController::new(SyncConfig::default());
        delivered(sync.retrieve(&pool, &clock, false, 0));
        clock.advance(FRAME_US);
        delivered(sync.retrieve(&pool, &clock, false, 0));
        let video_pts = clock.video_pts();

        clock.advance(FRAME_US);
        let outcome = sync.retrieve(&pool, &clock, false, 0);
        assert!(matches!(outcome, SyncOutcome::TryAgain(Deferral::Ahead { .. })));
        assert_eq!(
            clock.events().last(),
            Some(&ClockEvent::Discontinuity(6_000_000 + 2 * FRAME_US))
        );
        assert_eq!(clock.video_pts(), video_pts);
        assert_eq!(clock.now(), 1_000_000 + 2 * FRAME_US);
    }

    #[test]
    fn backward_jump_recovers_without_skipping() {
        let mut pts = vec![10_000_000];
        pts.extend((0..8).map(|i| 1_000_000 + i * FRAME_US));
        let pool = pool_with(&pts);
        let clock = SystemClock::new();
        let mut sync = SyncController::new(SyncConfig::default());
        delivered(sync.retrieve(&pool, &clock, false, 0));
        assert_eq!(sync.origin_us(), 10_000_000);

        let deadline = Instant::now() + Duration::from_secs(5);
        let (mut count, mut skipped_total) = (0, 0);
        while count < 8 && Instant::now() < deadline {
            match sync.retrieve(&pool, &clock, false, 0) {
                SyncOutcome::Deliver { skipped, .. } => {
                    count += 1;
                    skipped_total += skipped;
                }
                SyncOutcome::TryAgain(_) => std::thread::sleep(Duration::from_millis(1)),
            }
        }
        assert_eq!((count, skipped_total), (8, 0));
        assert!(clock.now() < 2_000_000);
        // the origin followed the clock back
        assert!(sync.origin_us() < 1_100_000);
    }

    #[test]
    fn catch_up_skips_at_most_the_limit() {
        let pool = pool_with(&[1_000, 1_000, 2_000, 3_000, 4_000, 5_000, 6_000]);
        let clock = ManualClock::new(0);
        let mut sync = SyncController::new(SyncConfig::default());
        delivered(sync.retrieve(&pool, &clock, false, 0));

        clock.set_now(30_000_000);
        let (buffer, drift, skipped) = delivered(sync.retrieve(&pool, &clock, false, 0));
        assert_eq!(skipped, 3);
        assert_eq!(buffer.index, 4);
        assert!(drift < SyncConfig::default().behind_us);

        let stats = pool.stats();
        assert_eq!(stats.recycled, 3);
        assert_eq!(stats.free, 3);
        assert_eq!(stats.available, 2);
    }

    #[test]
    fn catch_up_stops_once_back_in_range() {
        let pool = pool_with(&[1_000_000, 1_000_000, 1_500_000, 1_900_000, 1_950_000]);
        let clock = ManualClock::new(0);
        let mut sync = SyncController::new(SyncConfig::default());
        delivered(sync.retrieve(&pool, &clock, false, 0));

        clock.set_now(1_960_000);
        let (buffer, drift, skipped) = delivered(sync.retrieve(&pool, &clock, false, 0));
        assert_eq!(skipped, 2);
        assert_eq!(buffer.pts_us, 1_900_000);
        assert_eq!(drift, -60_000);
        assert_eq!(pool.stats().available, 1);
    }

    #[test]
    fn catch_up_with_single_buffer_delivers_it() {
        let pool = pool_with(&[1_000_000, 1_000_000]);
        let clock = ManualClock::new(0);
        let mut sync = SyncController::new(SyncConfig::default());
        delivered(sync.retrieve(&pool, &clock, false, 0));

        clock.set_now(1_500_000);
        let (buffer, _, skipped) = delivered(sync.retrieve(&pool, &clock, false, 0));
        assert_eq!((buffer.index, skipped), (1, 0));
    }

    #[test]
    fn unregister_reoffers_completed_buffers() {
        let pool = pool_with(&[1_000_000, 1_016_666, 1_033_333]);
        let clock = ManualClock::new(0);
        let mut sync = SyncController::new(SyncConfig::default());
        delivered(sync.retrieve(&pool, &clock, false, 0));

        let outcome = sync.retrieve(&pool, &clock, true, 0);
        assert!(matches!(
            outcome,
            SyncOutcome::TryAgain(Deferral::Reset { reoffered: 2 })
        ));
        assert_eq!(sync.state(), SyncState::NotStarted);
        let stats = pool.stats();
        assert_eq!((stats.available, stats.free), (0, 2));
    }

    #[test]
    fn missing_timestamp_is_synthesized_from_clock() {
        let pool = pool_with(&[1_000_000]);
        let mut untimed = CaptureBuffer::new(7);
        untimed.duration_us = 0;
        pool.complete(untimed);

        let clock = ManualClock::new(0);
        let mut sync = SyncController::new(SyncConfig::default());
        delivered(sync.retrieve(&pool, &clock, false, 0));

        let outcome = sync.retrieve(&pool, &clock, false, 1_600);
        let (buffer, drift, _) = delivered(outcome);
        assert_eq!(buffer.pts_us, 1_000_000 + 1_500);
        assert_eq!(drift, 1_500);
    }
}
