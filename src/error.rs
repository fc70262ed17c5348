use thiserror::Error;

/// Errors surfaced by the capture control surface.
///
/// Transient conditions (no frame yet, nothing completed) are not errors; they
/// are reported through [`crate::session::Dequeue::TryAgain`] and the worker's
/// per-tick outcome instead.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("device or resource busy: {0}")]
    Busy(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("index {0} out of range")]
    OutOfRange(usize),

    #[error("operation not permitted in current state: {0}")]
    InvalidState(&'static str),

    #[error("frame processing failed: {0}")]
    Processing(String),

    #[error("failed to spawn acquisition worker: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

pub type Result<T, E = CaptureError> = std::result::Result<T, E>;
