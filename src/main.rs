//! vcapture demo: a synthetic provider feeding one capture session.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use color_eyre::Result;
use tracing::{info, warn};

use vcapture::capture::{Frame, FrameMetadata, SlotSource, SourceHub};
use vcapture::session::{CaptureEndpoint, Dequeue, REGISTRY};
use vcapture::{Config, CONFIG};

const FRAME_DURATION_US: u32 = 33_333;
const FRAMES: usize = 120;

fn init_tracing() {
    use tracing_subscriber::fmt::time::uptime;
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vcapture=debug"));

    #[cfg(feature = "profiling")]
    {
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;

        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_timer(uptime()))
            .with(tracing_tracy::TracyLayer::default())
            .init();
    }

    #[cfg(not(feature = "profiling"))]
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(uptime())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    init_tracing();

    info!("vcapture launching...");

    let config = Config::load("vcapture.toml")?;
    CONFIG.store(Arc::new(config.clone()));

    let instance = config.capture.instance.unwrap_or(0);
    let name = REGISTRY.alloc(instance)?;

    // Publish the synthetic provider before the session binds
    let hub = Arc::new(SourceHub::new());
    let source = Arc::new(SlotSource::new());
    hub.register(&name, source.clone());

    let (width, height) = (config.capture.width, config.capture.height);
    let provider = {
        let source = source.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_micros(u64::from(FRAME_DURATION_US)));
            let frame_len = (width * height * 3 / 2) as usize;
            for sequence in 0u64.. {
                interval.tick().await;
                let meta = FrameMetadata::progressive(
                    sequence,
                    width,
                    height,
                    sequence * u64::from(FRAME_DURATION_US),
                    FRAME_DURATION_US,
                );
                let data = Bytes::from(vec![(sequence & 0xff) as u8; frame_len]);
                if source.post(Frame::new(data, meta)) {
                    warn!("Provider overran the capture slot at frame {}", sequence);
                }
            }
        })
    };

    // Capture session
    let endpoint = CaptureEndpoint::builder(hub.clone())
        .instance(instance)
        .build();
    let mut session = endpoint.open()?;
    let count = session.request_buffers(config.capture.buffer_count as usize)?;
    for index in 0..count {
        session.submit_buffer(index)?;
    }
    session.start_streaming()?;

    let mut delivered = 0;
    while delivered < FRAMES {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(2)) => {}
        }
        match session.retrieve_buffer()? {
            Dequeue::Ready(buffer) => {
                delivered += 1;
                if delivered % 30 == 0 {
                    info!(
                        "Frame {} in buffer {} ({} bytes, pts {} µs, drift {} µs)",
                        buffer.sequence,
                        buffer.index,
                        buffer.data.len(),
                        buffer.pts_us,
                        buffer.drift_us
                    );
                }
                session.submit_buffer(buffer.index)?;
            }
            Dequeue::TryAgain => {}
        }
    }

    session.stop_streaming()?;
    info!("Session stats: {:?}", session.stats());
    session.close()?;

    provider.abort();
    hub.unregister(&name);
    info!(
        "vcapture shutting down ({} delivered, {} replaced upstream)",
        delivered,
        source.replaced()
    );
    Ok(())
}
