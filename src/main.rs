//! shmcam: publish camera frames as I420 and ARGB into shared memory

use std::path::PathBuf;
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

use shmcam::capture::pattern::PATTERN_SCHEME;
use shmcam::capture::{FrameSource, PatternSource, V4l2Source};
use shmcam::pipeline::{CancellationToken, CaptureLoop, LoopCounters, LoopOptions, Segments};
use shmcam::telemetry::LogSink;
use shmcam::{utils, Config};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    init_tracing();

    info!("shmcam launching...");

    // Load configuration; first argument is an optional TOML file
    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let mut config = Config::load(config_path.as_deref())?;

    if config.capture.device.is_empty() {
        let found = utils::auto_detect_device(config.capture.format)?;
        config.capture.device = found.path;
        config.capture.format = found.format;
    }
    info!("Using capture device: {}", config.capture.device);

    let (i420_name, argb_name) = config.shared_memory.names();
    let segments = Segments::create(
        &i420_name,
        &argb_name,
        config.capture.width,
        config.capture.height,
    )?;

    let source: Box<dyn FrameSource + Send> =
        if config.capture.device.starts_with(PATTERN_SCHEME) {
            Box::new(PatternSource::new(&config.capture, config.telemetry.enabled))
        } else {
            Box::new(V4l2Source::new(config.capture.clone(), &config.telemetry)?)
        };

    let options = LoopOptions {
        width: config.capture.width,
        height: config.capture.height,
        grab_timeout: config.capture.timeout(),
        skip_argb: config.pipeline.skip_argb,
    };
    let mut capture = CaptureLoop::new(source, segments, options)?;
    if config.telemetry.enabled {
        capture = capture.with_telemetry(Box::new(LogSink::new(config.telemetry.sender_id)));
    }

    let cancel = CancellationToken::new();
    let counters = capture.counters();

    // Spawn the capture thread
    let affinity = config.pipeline.cpu_affinity;
    let loop_cancel = cancel.clone();
    let capture_handle = tokio::task::spawn_blocking(move || {
        if let Some(core) = affinity {
            utils::pin_current_thread(core);
        }
        capture.run(&loop_cancel)
    });

    if config.pipeline.stats_interval_secs > 0 {
        tokio::spawn(log_throughput(
            counters,
            Duration::from_secs(config.pipeline.stats_interval_secs),
        ));
    }

    let mut terminate = signal(SignalKind::terminate())?;
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Interrupt received"),
            _ = terminate.recv() => info!("Termination requested"),
        }
        shutdown.cancel();
    });

    match capture_handle.await? {
        Ok(stats) => {
            info!(
                "shmcam shutting down after {} frames ({} timeouts)",
                stats.frames_grabbed, stats.grab_timeouts
            );
            Ok(())
        }
        Err(e) => {
            error!("Capture failed: {}", e);
            Err(eyre!(e))
        }
    }
}

fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("shmcam=info"));
    let fmt_layer = fmt::layer().with_timer(fmt::time::uptime());
    let registry = tracing_subscriber::registry().with(filter).with(fmt_layer);

    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());

    registry.init();
}

async fn log_throughput(counters: std::sync::Arc<LoopCounters>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    let mut last = counters.snapshot();
    loop {
        ticker.tick().await;
        let now = counters.snapshot();
        let frames = now.published_i420 - last.published_i420;
        info!(
            "{:.1} fps published, {} timeouts, {} telemetry samples",
            frames as f64 / every.as_secs_f64(),
            now.grab_timeouts - last.grab_timeouts,
            now.telemetry_published - last.telemetry_published
        );
        last = now;
    }
}
