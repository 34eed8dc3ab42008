//! The analysis worker thread.
//!
//! Runs detection off the async runtime on a dedicated, named OS thread fed
//! through [`FrameQueue`]. A panic inside detection costs one frame; the
//! thread keeps going until it dequeues the shutdown sentinel.

use std::panic::{self, AssertUnwindSafe};
use std::thread;

use balltrack_core::{AnalysisConfig, AnalysisError};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::detector::BallDetector;
use crate::estimate::SharedEstimate;
use crate::queue::{FrameQueue, FrameQueueReceiver, FrameQueueSender, WorkItem};

/// Per-run counters returned by [`AnalysisHandle::join`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub frames: u64,
    pub detections: u64,
    pub misses: u64,
    /// Frames whose analysis panicked.
    pub failures: u64,
}

pub struct AnalysisWorker;

impl AnalysisWorker {
    /// Starts the worker. Frames go in through the returned sender; results
    /// land in `estimate`.
    pub fn spawn(
        config: &AnalysisConfig,
        estimate: SharedEstimate,
    ) -> Result<(FrameQueueSender, AnalysisHandle), AnalysisError> {
        let (tx, rx) = FrameQueue::bounded(config.queue_capacity);
        let detector = BallDetector::new(config.min_area);
        let (done_tx, done_rx) = oneshot::channel();

        let thread = thread::Builder::new()
            .name("analysis-worker".into())
            .spawn(move || {
                let _ = done_tx.send(run(rx, &detector, &estimate));
            })
            .map_err(AnalysisError::Spawn)?;

        info!("Analysis worker started (queue capacity {})", config.queue_capacity);
        Ok((tx, AnalysisHandle { done: done_rx, thread: Some(thread) }))
    }
}

fn run(
    mut queue: FrameQueueReceiver,
    detector: &BallDetector,
    estimate: &SharedEstimate,
) -> Result<WorkerReport, AnalysisError> {
    let mut report = WorkerReport::default();

    loop {
        let frame = match queue.blocking_recv() {
            Some(WorkItem::Frame(frame)) => frame,
            Some(WorkItem::Shutdown) => {
                info!(
                    "Analysis worker exiting: frames={} detections={} misses={} failures={}",
                    report.frames, report.detections, report.misses, report.failures
                );
                return Ok(report);
            }
            None => {
                warn!("Frame queue closed without a shutdown sentinel");
                return Err(AnalysisError::AbortedWithoutSentinel);
            }
        };
        report.frames += 1;

        match panic::catch_unwind(AssertUnwindSafe(|| detector.detect(&frame))) {
            Ok(Some(detection)) => {
                let revision = estimate.publish(detection.center);
                report.detections += 1;
                if report.detections == 1 {
                    info!("First detection at {} (r={:.1})", detection.center, detection.radius);
                }
                debug!("Frame pts={} → {} (rev {})", frame.pts, detection.center, revision);
            }
            Ok(None) => {
                report.misses += 1;
                debug!("No ball in frame pts={}", frame.pts);
            }
            Err(_) => {
                report.failures += 1;
                warn!("Detection panicked on frame pts={}; skipped", frame.pts);
            }
        }

        if report.frames % 300 == 0 {
            info!(
                "Analysis stats: frames={} detections={} misses={}",
                report.frames, report.detections, report.misses
            );
        }
    }
}

/// Owner side of a running worker.
pub struct AnalysisHandle {
    done: oneshot::Receiver<Result<WorkerReport, AnalysisError>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl AnalysisHandle {
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Waits for the worker to exit. Send the sentinel first.
    pub async fn join(mut self) -> Result<WorkerReport, AnalysisError> {
        let outcome = (&mut self.done).await;
        if let Some(thread) = self.thread.take() {
            let _ = tokio::task::spawn_blocking(move || thread.join()).await;
        }
        outcome.map_err(|_| AnalysisError::WorkerPanicked)?
    }
}
