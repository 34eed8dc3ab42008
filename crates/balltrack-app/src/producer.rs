//! Producer peer: offers a bouncing-ball video track and scores the
//! coordinates reported back against ground truth.

use anyhow::{Context, Result};
use balltrack_core::{Coordinate, SdpKind, SessionConfig};
use balltrack_scene::{BouncingBall, SceneGenerator};
use balltrack_signaling::{Signaling, SignalingMessage};
use balltrack_transport::{LocalVideoTrack, PeerSession, SessionState};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::feedback::{AccuracySummary, FeedbackSink, GroundTruthComparator};
use crate::{stop_requested, COORDINATES_CHANNEL};

/// How long to keep collecting feedback after the last tick.
const DRAIN: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProducerReport {
    pub ticks: u64,
    pub summary: AccuracySummary,
}

/// Runs the offering side until `max_ticks` are sent, the session closes or
/// `stop` fires. Signaling and session are closed on the way out.
pub async fn run_producer<S, F>(
    config: &SessionConfig,
    mut signaling: S,
    mut feedback: F,
    mut stop: watch::Receiver<bool>,
) -> Result<ProducerReport>
where
    S: Signaling,
    F: FeedbackSink,
{
    // ── 1. Wait for the consumer ──────────────────────────────────────────
    info!("Waiting for the consumer on {}", config.signaling.addr());
    tokio::select! {
        connected = signaling.connect() => connected.context("signaling connect failed")?,
        _ = stop_requested(&mut stop) => {
            info!("Stopped before a consumer connected");
            return Ok(ProducerReport { ticks: 0, summary: AccuracySummary::default() });
        }
    }

    let (session, mut events) = PeerSession::new(config.media.clone()).await.context("creating peer session")?;
    let mut ticker: Option<JoinHandle<u64>> = None;
    let mut summary = AccuracySummary::default();
    let mut ticks: u64 = 0;

    let result = async {
        // ── 2. Offer ──────────────────────────────────────────────────────
        let track = session.add_video_track().await?;
        // Gives the offer the SCTP section the consumer's channel rides on.
        session.create_data_channel(COORDINATES_CHANNEL).await?;
        let offer = session.create_offer().await?;
        session.set_local_description(&offer).await?;
        signaling.send(offer.into()).await.context("sending offer")?;
        info!("Offer sent (session {})", session.session_id());

        let scene = BouncingBall::new(&config.scene)?;
        let (truth_tx, truth_rx) = watch::channel(scene.current_ground_truth());
        let mut pending_scene = Some((scene, track, truth_tx));
        let (messages_tx, mut messages_rx) = mpsc::unbounded_channel::<String>();
        let mut state_rx = session.watch_state();
        let mut signaling_open = true;
        let mut drain_until: Option<time::Instant> = None;

        // ── 3. Event loop ─────────────────────────────────────────────────
        loop {
            tokio::select! {
                msg = signaling.receive(), if signaling_open => match msg {
                    Ok(Some(SignalingMessage::Description(desc))) if desc.kind == SdpKind::Answer => {
                        session.set_remote_description(&desc).await.context("applying answer")?;
                        info!("Answer applied");
                    }
                    Ok(Some(SignalingMessage::Description(desc))) => {
                        warn!("Ignoring unexpected {} from the consumer", desc.kind);
                    }
                    Ok(Some(SignalingMessage::Candidate(candidate))) => {
                        if let Err(e) = session.add_candidate(&candidate).await {
                            warn!("Skipping candidate: {}", e);
                        }
                    }
                    Ok(None) => {
                        info!("Consumer left");
                        break;
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

                Some(channel) = events.data_channels.recv() => {
                    if channel.label() != COORDINATES_CHANNEL {
                        warn!("Ignoring channel '{}'", channel.label());
                        continue;
                    }
                    info!("Consumer opened channel '{}'", channel.label());
                    let tx = messages_tx.clone();
                    tokio::spawn(async move {
                        while let Some(text) = channel.recv().await {
                            if tx.send(text).is_err() {
                                break;
                            }
                        }
                    });
                }

                Some(text) = messages_rx.recv() => {
                    let truth = *truth_rx.borrow();
                    match GroundTruthComparator::compare(&text, truth) {
                        Ok(sample) => {
                            feedback.record(&sample);
                            summary.record(&sample);
                        }
                        Err(e) => {
                            feedback.malformed(&e);
                            summary.malformed(&e);
                        }
                    }
                }

                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *state_rx.borrow_and_update();
                    match state {
                        SessionState::Connected => {
                            if let Some((scene, track, truth_tx)) = pending_scene.take() {
                                info!("Connected; streaming at {} fps", config.scene.fps);
                                let interval = Duration::from_micros(config.scene.frame_interval_us());
                                ticker = Some(tokio::spawn(tick_scene(
                                    scene, track, truth_tx, interval, config.scene.max_ticks,
                                )));
                            }
                        }
                        SessionState::Closed => {
                            info!("Session closed by the consumer");
                            break;
                        }
                        _ => {}
                    }
                }

                sent = async {
                    match ticker.as_mut() {
                        Some(handle) => handle.await,
                        None => std::future::pending().await,
                    }
                }, if ticker.is_some() => {
                    ticker = None;
                    ticks = sent.unwrap_or_default();
                    info!("Scene finished after {} ticks; draining feedback", ticks);
                    drain_until = Some(time::Instant::now() + DRAIN);
                }

                _ = async {
                    match drain_until {
                        Some(deadline) => time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                }, if drain_until.is_some() => break,

                _ = stop_requested(&mut stop) => {
                    info!("Stop requested");
                    break;
                }
            }
        }
        Ok::<(), anyhow::Error>(())
    }
    .await;

    // ── 4. Teardown ───────────────────────────────────────────────────────
    if let Some(handle) = ticker.take() {
        handle.abort();
        if let Ok(sent) = handle.await {
            ticks = sent;
        }
    }
    if let Err(e) = signaling.close().await {
        debug!("Signaling close: {}", e);
    }
    session.close().await;
    info!("Producer done: ticks={} {}", ticks, summary);

    result.map(|()| ProducerReport { ticks, summary })
}

/// Renders and sends one frame per `interval`. Returns the ticks sent.
async fn tick_scene(
    mut scene: BouncingBall,
    track: LocalVideoTrack,
    truth: watch::Sender<Coordinate>,
    interval: Duration,
    max_ticks: Option<u64>,
) -> u64 {
    let mut clock = time::interval(interval);
    clock.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut tick: u64 = 0;

    while max_ticks.map_or(true, |max| tick < max) {
        clock.tick().await;
        let frame = scene.next_frame(tick);
        truth.send_replace(scene.current_ground_truth());
        if track.write_frame(frame).await.is_err() {
            warn!("Video track closed after {} ticks", tick);
            break;
        }
        tick += 1;
        if tick % 300 == 0 {
            info!("Sent {} frames (ground truth {})", tick, scene.current_ground_truth());
        }
    }
    tick
}
