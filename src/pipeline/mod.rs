pub mod clock;
pub mod pool;
pub mod sync;
pub mod worker;

pub use clock::{ManualClock, PresentationClock, SystemClock};
pub use pool::{BufferStatus, CapturePool, PoolStats};
pub use sync::{Deferral, SyncController, SyncOutcome, SyncState};
pub use worker::Tick;
