use anyhow::{Context, Result};
use balltrack_app::run_consumer;
use balltrack_core::SessionConfig;
use balltrack_renderer::{FrameSink, NullSink, PngSnapshotSink};
use balltrack_signaling::{SignalingRole, TcpSignaling};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Directory for PNG snapshots of received frames. Frames are discarded when unset.
const SNAPSHOT_DIR_ENV: &str = "BALLTRACK_SNAPSHOT_DIR";
/// Write one snapshot every N frames (default 30).
const SNAPSHOT_EVERY_ENV: &str = "BALLTRACK_SNAPSHOT_EVERY";

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG=debug for per-frame detail
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .with_thread_ids(false)
        .init();

    info!("BallTrack Consumer v{}", env!("CARGO_PKG_VERSION"));

    match run().await {
        Ok(()) => {
            info!("BallTrack Consumer exited cleanly.");
            Ok(())
        }
        Err(e) => {
            error!("Fatal error: {:#}", e);
            Err(e)
        }
    }
}

fn make_sink() -> Result<Box<dyn FrameSink>> {
    let Ok(dir) = std::env::var(SNAPSHOT_DIR_ENV) else {
        return Ok(Box::new(NullSink::new()));
    };
    let every = match std::env::var(SNAPSHOT_EVERY_ENV) {
        Ok(n) => n.parse().with_context(|| format!("{SNAPSHOT_EVERY_ENV}={n} is not a frame count"))?,
        Err(_) => 30,
    };
    Ok(Box::new(PngSnapshotSink::new(dir, every)?))
}

async fn run() -> Result<()> {
    let config = SessionConfig::load().context("loading configuration")?;
    let signaling = TcpSignaling::from_config(SignalingRole::Answerer, &config.signaling);
    let sink = make_sink()?;

    let (stop_tx, stop) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl-C received, stopping");
                let _ = stop_tx.send(true);
            }
            Err(e) => warn!("Ctrl-C handler unavailable: {}", e),
        }
    });

    let report = run_consumer(&config, signaling, sink, stop).await?;
    match report.pipeline {
        Some(p) => info!(
            "Pipeline: frames={} sent={} dropped={} sink_errors={} exit={}",
            p.frames, p.coordinates_sent, p.coordinates_dropped, p.sink_errors, p.exit
        ),
        None => info!("No video was received"),
    }
    info!(
        "Analysis: frames={} detections={} misses={} failures={}",
        report.worker.frames, report.worker.detections, report.worker.misses, report.worker.failures
    );
    Ok(())
}
