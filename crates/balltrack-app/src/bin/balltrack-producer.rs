use anyhow::{Context, Result};
use balltrack_app::{run_producer, LogFeedbackSink};
use balltrack_core::SessionConfig;
use balltrack_signaling::{SignalingRole, TcpSignaling};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

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

    info!("BallTrack Producer v{}", env!("CARGO_PKG_VERSION"));

    match run().await {
        Ok(()) => {
            info!("BallTrack Producer exited cleanly.");
            Ok(())
        }
        Err(e) => {
            error!("Fatal error: {:#}", e);
            Err(e)
        }
    }
}

async fn run() -> Result<()> {
    let config = SessionConfig::load().context("loading configuration")?;
    let signaling = TcpSignaling::from_config(SignalingRole::Offerer, &config.signaling);

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

    let report = run_producer(&config, signaling, LogFeedbackSink, stop).await?;
    info!("Sent {} frames; {}", report.ticks, report.summary);
    Ok(())
}
