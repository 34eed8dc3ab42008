//! Consumer peer: answers the producer, shows and analyses the incoming
//! frames and reports the ball position back.

use anyhow::{Context, Result};
use balltrack_analysis::{AnalysisWorker, SharedEstimate, WorkerReport};
use balltrack_core::{SdpKind, SessionConfig};
use balltrack_renderer::FrameSink;
use balltrack_signaling::{Signaling, SignalingMessage};
use balltrack_transport::{PeerSession, SessionState};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tracing::{debug, info, warn};

use crate::feedback::CoordinateReporter;
use crate::pipeline::{FramePipeline, PipelineReport};
use crate::{stop_requested, COORDINATES_CHANNEL};

/// How long teardown waits for a running pipeline before aborting it.
const PIPELINE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerReport {
    /// `None` when no remote track ever arrived.
    pub pipeline: Option<PipelineReport>,
    pub worker: WorkerReport,
}

/// Runs the answering side until the remote track ends, the session closes
/// or `stop` fires. The analysis worker always gets its shutdown sentinel
/// and is joined before this returns.
pub async fn run_consumer<S, K>(
    config: &SessionConfig,
    mut signaling: S,
    sink: K,
    mut stop: watch::Receiver<bool>,
) -> Result<ConsumerReport>
where
    S: Signaling,
    K: FrameSink + 'static,
{
    // ── 1. Session and analysis worker ────────────────────────────────────
    let (session, mut events) = PeerSession::new(config.media.clone()).await.context("creating peer session")?;
    let estimate = SharedEstimate::new();
    let (queue, worker) =
        AnalysisWorker::spawn(&config.analysis, estimate.clone()).context("starting analysis worker")?;

    let mut pipeline: Option<JoinHandle<PipelineReport>> = None;
    let mut pipeline_report: Option<PipelineReport> = None;

    let result = async {
        // ── 2. Reach the producer ─────────────────────────────────────────
        info!("Connecting to the producer at {}", config.signaling.addr());
        tokio::select! {
            connected = signaling.connect() => connected.context("signaling connect failed")?,
            _ = stop_requested(&mut stop) => {
                info!("Stopped before reaching the producer");
                return Ok(());
            }
        }

        let channel = session.create_data_channel(COORDINATES_CHANNEL).await?;
        let mut sink = Some(sink);
        let mut state_rx = session.watch_state();
        let mut signaling_open = true;

        // ── 3. Event loop ─────────────────────────────────────────────────
        loop {
            tokio::select! {
                msg = signaling.receive(), if signaling_open => match msg {
                    Ok(Some(SignalingMessage::Description(desc))) if desc.kind == SdpKind::Offer => {
                        session.set_remote_description(&desc).await.context("applying offer")?;
                        let answer = session.create_answer().await?;
                        session.set_local_description(&answer).await?;
                        signaling.send(answer.into()).await.context("sending answer")?;
                        info!("Answer sent (session {})", session.session_id());
                    }
                    Ok(Some(SignalingMessage::Description(desc))) => {
                        warn!("Ignoring unexpected {} from the producer", desc.kind);
                    }
                    Ok(Some(SignalingMessage::Candidate(candidate))) => {
                        if let Err(e) = session.add_candidate(&candidate).await {
                            warn!("Skipping candidate: {}", e);
                        }
                    }
                    Ok(None) => {
                        // The producer only leaves signaling when it is done.
                        info!("Producer left; closing the session");
                        signaling_open = false;
                        session.close().await;
                    }
                    Err(e) => {
                        warn!("Signaling receive failed: {}", e);
                        signaling_open = false;
                    }
                },

                Some(candidate) = events.local_candidates.recv() => {
                    if let Err(e) = signaling.send(candidate.into()).await {
                        warn!("Could not trickle candidate: {}", e);
                    }
                }

                Some(track) = events.remote_tracks.recv() => match sink.take() {
                    Some(sink) => {
                        info!("Remote track '{}' arrived; starting pipeline", track.id());
                        let reporter = CoordinateReporter::new(channel.clone(), estimate.clone());
                        let mut frames = FramePipeline::new(sink, queue.clone(), reporter);
                        let stop = stop.clone();
                        pipeline = Some(tokio::spawn(async move { frames.run(track, stop).await }));
                    }
                    None => warn!("Ignoring extra remote track '{}'", track.id()),
                },

                report = async {
                    match pipeline.as_mut() {
                        Some(handle) => handle.await,
                        None => std::future::pending().await,
                    }
                }, if pipeline.is_some() => {
                    pipeline = None;
                    match report {
                        Ok(report) => pipeline_report = Some(report),
                        Err(e) => warn!("Frame pipeline task failed: {}", e),
                    }
                    break;
                }

                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *state_rx.borrow_and_update();
                    debug!("Session state: {}", state);
                    // With a pipeline running, the ended track brings us out.
                    if state == SessionState::Closed && pipeline.is_none() {
                        info!("Session closed before any video arrived");
                        break;
                    }
                }

                _ = stop_requested(&mut stop), if pipeline.is_none() => {
                    info!("Stop requested");
                    break;
                }
            }
        }
        Ok::<(), anyhow::Error>(())
    }
    .await;

    // ── 4. Teardown ───────────────────────────────────────────────────────
    if let Some(mut handle) = pipeline.take() {
        match time::timeout(PIPELINE_GRACE, &mut handle).await {
            Ok(Ok(report)) => pipeline_report = Some(report),
            Ok(Err(e)) => warn!("Frame pipeline task failed: {}", e),
            Err(_) => {
                warn!("Frame pipeline did not stop within {:?}; aborting", PIPELINE_GRACE);
                handle.abort();
            }
        }
    }
    if let Err(e) = queue.shutdown().await {
        debug!("Shutdown sentinel not delivered: {}", e);
    }
    let worker = worker.join().await;
    if let Err(e) = signaling.close().await {
        debug!("Signaling close: {}", e);
    }
    session.close().await;

    result?;
    let worker = worker.context("analysis worker")?;
    info!(
        "Consumer done: frames={} detections={}",
        pipeline_report.map_or(0, |p| p.frames),
        worker.detections
    );
    Ok(ConsumerReport { pipeline: pipeline_report, worker })
}
