//! Both peers over loopback: signaling, the WebRTC session, analysis and feedback.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use balltrack_app::{run_consumer, run_producer, FeedbackSample, FeedbackSink, PipelineExit};
use balltrack_core::SessionConfig;
use balltrack_renderer::{NullSink, PngSnapshotSink};
use balltrack_signaling::TcpSignaling;
use tokio::net::TcpListener;
use tokio::sync::watch;

#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<FeedbackSample>>>);

impl FeedbackSink for Recorder {
    fn record(&mut self, sample: &FeedbackSample) {
        self.0.lock().unwrap().push(*sample);
    }
}

/// 640x480, ball from (320,240) moving (2,3) per tick at 30 fps.
fn scenario(ticks: u64) -> SessionConfig {
    let mut config = SessionConfig::default();
    config.scene.max_ticks = Some(ticks);
    config.analysis.queue_capacity = 2;
    config.media.frame_buffer = 2;
    config.validate().unwrap();
    config
}

async fn signaling_pair() -> (TcpSignaling, TcpSignaling) {
    let mut offerer = TcpSignaling::offerer("127.0.0.1:0");
    let addr = offerer.bind().await.unwrap();
    let answerer = TcpSignaling::answerer(addr.to_string()).with_retry(20, Duration::from_millis(50));
    (offerer, answerer)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn consumer_tracks_the_ball_and_producer_scores_it() {
    let config = scenario(100);
    let (offerer, answerer) = signaling_pair().await;
    let recorder = Recorder::default();
    let (_stop_tx, stop) = watch::channel(false);
    let snapshots = tempfile::tempdir().unwrap();
    let sink = PngSnapshotSink::new(snapshots.path(), 30).unwrap();

    let (produced, consumed) = tokio::time::timeout(Duration::from_secs(60), async {
        tokio::join!(
            run_producer(&config, offerer, recorder.clone(), stop.clone()),
            run_consumer(&config, answerer, sink, stop.clone()),
        )
    })
    .await
    .expect("peers did not finish");

    let produced = produced.unwrap();
    let consumed = consumed.unwrap();
    assert_eq!(produced.ticks, 100);

    let pipeline = consumed.pipeline.expect("no video reached the consumer");
    assert_eq!(pipeline.exit, PipelineExit::TrackEnded);
    assert!(pipeline.frames > 0 && pipeline.frames <= 100);
    assert_eq!(consumed.worker.frames, pipeline.frames);
    assert!(consumed.worker.detections > 0);
    assert_eq!(consumed.worker.failures, 0);

    let samples = recorder.0.lock().unwrap().clone();
    assert!(!samples.is_empty(), "no coordinates came back");
    assert_eq!(produced.summary.received, samples.len() as u64);
    assert_eq!(produced.summary.malformed, 0);
    // The first reports predate any detection.
    let close = samples
        .iter()
        .skip(5)
        .filter(|s| s.error.x.abs() <= 20 && s.error.y.abs() <= 20)
        .count();
    assert!(close > 0, "no report within 20px: {samples:?}");

    let written = std::fs::read_dir(snapshots.path()).unwrap().count();
    assert!(written >= 1);
}

#[tokio::test]
async fn producer_stops_while_waiting_for_a_consumer() {
    let config = scenario(10);
    let mut offerer = TcpSignaling::offerer("127.0.0.1:0");
    offerer.bind().await.unwrap();
    let (stop_tx, stop) = watch::channel(false);

    let run = tokio::spawn(async move { run_producer(&config, offerer, Recorder::default(), stop).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    stop_tx.send(true).unwrap();

    let report = tokio::time::timeout(Duration::from_secs(5), run).await.unwrap().unwrap().unwrap();
    assert_eq!(report.ticks, 0);
    assert_eq!(report.summary.received, 0);
}

#[tokio::test]
async fn consumer_stop_without_video_still_joins_the_worker() {
    let config = scenario(10);
    // Accepts at the TCP level but never speaks.
    let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let answerer = TcpSignaling::answerer(silent.local_addr().unwrap().to_string());
    let (stop_tx, stop) = watch::channel(false);

    let run = tokio::spawn(async move { run_consumer(&config, answerer, NullSink::new(), stop).await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    stop_tx.send(true).unwrap();

    let report = tokio::time::timeout(Duration::from_secs(5), run).await.unwrap().unwrap().unwrap();
    assert!(report.pipeline.is_none());
    assert_eq!(report.worker.frames, 0);
    drop(silent);
}
