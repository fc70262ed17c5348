pub mod admin;
pub mod capture;
pub mod error;
pub mod pipeline;
pub mod session;
pub mod utils;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

pub use capture::{Frame, PixelFormat};
pub use error::{CaptureError, Result};

/// Global configuration that can be atomically swapped at runtime.
///
/// Endpoints hold a clone of this handle unless built with their own, so
/// [`admin`] knob changes reach running workers on their next tick.
pub static CONFIG: once_cell::sync::Lazy<Arc<ArcSwap<Config>>> =
    once_cell::sync::Lazy::new(|| Arc::new(ArcSwap::from_pointee(Config::default())));

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub sync: SyncConfig,
    pub worker: WorkerConfig,
    pub registry: RegistryConfig,
}

/// How completed buffers are handed to the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Paced by the source's own cadence.
    #[default]
    Freerun,
    /// Paced against the presentation clock with drift correction.
    Synchronized,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub buffer_count: u32,
    pub mode: DeliveryMode,
    /// Applied to interlaced high-resolution frames, 1..=100.
    pub downscale_percent: u32,
    /// Ignore frame-rate hints while the upstream is seeking.
    pub seek_suppress: bool,
    /// Bind a specific registry instance instead of the first free one.
    pub instance: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Buffers further ahead of the clock than this are deferred.
    pub ahead_us: i64,
    /// Buffers further behind the clock than this trigger catch-up.
    pub behind_us: i64,
    pub discontinuity_us: u64,
    pub catch_up_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub no_frame_backoff_ms: u64,
    pub geometry_backoff_ms: u64,
    pub pool_empty_backoff_ms: u64,
    pub stop_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub instances: u32,
    pub name_prefix: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            format: PixelFormat::Nv21,
            width: 640,
            height: 480,
            buffer_count: 4,
            mode: DeliveryMode::Freerun,
            downscale_percent: 100,
            seek_suppress: false,
            instance: None,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            ahead_us: 2_000,
            behind_us: -100_000,
            discontinuity_us: 1_000_000,
            catch_up_limit: 3,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            no_frame_backoff_ms: 1,
            geometry_backoff_ms: 2,
            pool_empty_backoff_ms: 5,
            stop_timeout_ms: 500,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            instances: 8,
            name_prefix: "vcapture".into(),
        }
    }
}

impl WorkerConfig {
    pub fn no_frame_backoff(&self) -> Duration {
        Duration::from_millis(self.no_frame_backoff_ms)
    }

    pub fn geometry_backoff(&self) -> Duration {
        Duration::from_millis(self.geometry_backoff_ms)
    }

    pub fn pool_empty_backoff(&self) -> Duration {
        Duration::from_millis(self.pool_empty_backoff_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

impl Config {
    /// Layer an optional TOML file and `VCAPTURE__*` environment variables
    /// over the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()).required(false))
            .add_source(
                config::Environment::with_prefix("VCAPTURE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}
