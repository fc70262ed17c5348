//! Administrative surface: statistics readback and runtime knobs.

use arc_swap::ArcSwap;
use tracing::info;

use crate::error::{CaptureError, Result};
use crate::pipeline::pool::PoolStats;
use crate::session::SessionState;
use crate::{Config, DeliveryMode};

/// Snapshot of one session's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    pub pool: PoolStats,
    /// Buffers dropped by synchronized catch-up
    pub skipped: u64,
    /// Frames that did not fit the bound buffer layout
    pub render_failures: u64,
    /// Consecutive worker ticks without a usable frame
    pub no_frame_ticks: u32,
    pub state: SessionState,
    pub mode: DeliveryMode,
}

/// Set the down-scale applied to interlaced full-HD frames.
pub fn set_downscale_percent(config: &ArcSwap<Config>, percent: u32) -> Result<()> {
    if !(1..=100).contains(&percent) {
        return Err(CaptureError::InvalidArgument(format!(
            "down-scale percentage {percent} outside 1..=100"
        )));
    }
    config.rcu(|current| {
        let mut next = Config::clone(current);
        next.capture.downscale_percent = percent;
        next
    });
    info!("Down-scale set to {}%", percent);
    Ok(())
}

/// Suppress frame-rate hints while the upstream is seeking.
pub fn set_seek_suppress(config: &ArcSwap<Config>, suppress: bool) {
    config.rcu(|current| {
        let mut next = Config::clone(current);
        next.capture.seek_suppress = suppress;
        next
    });
    info!("Seek suppression {}", if suppress { "on" } else { "off" });
}
