//! `FramePipeline`: the consumer's per-frame loop.
//!
//! For every frame from the remote track, in order:
//!
//! 1. present it on the [`FrameSink`] (a failure is logged, the loop goes on)
//! 2. enqueue it for the analysis worker (waits while the queue is full)
//! 3. report the latest estimate on the coordinate channel
//!
//! The estimate sent with frame N is whatever the worker last finished, which
//! may come from an earlier frame.

use std::fmt;

use balltrack_analysis::FrameQueueSender;
use balltrack_renderer::FrameSink;
use balltrack_transport::RemoteVideoTrack;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::feedback::{CoordinateReporter, ReportOutcome};
use crate::stop_requested;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineExit {
    /// The stop signal fired.
    Stopped,
    /// The sink asked to quit.
    QuitRequested,
    /// The remote track ended.
    TrackEnded,
    /// The analysis queue no longer accepts frames.
    WorkerGone,
}

impl fmt::Display for PipelineExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stopped => "stopped",
            Self::QuitRequested => "quit requested",
            Self::TrackEnded => "track ended",
            Self::WorkerGone => "analysis worker gone",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineReport {
    pub frames: u64,
    pub sink_errors: u64,
    pub coordinates_sent: u64,
    pub coordinates_dropped: u64,
    pub exit: PipelineExit,
}

pub struct FramePipeline<S: FrameSink> {
    sink: S,
    queue: FrameQueueSender,
    reporter: CoordinateReporter,
}

impl<S: FrameSink> FramePipeline<S> {
    pub fn new(sink: S, queue: FrameQueueSender, reporter: CoordinateReporter) -> Self {
        Self { sink, queue, reporter }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Runs until stopped, the sink quits, the track ends or the worker goes
    /// away. The shutdown sentinel is enqueued on every exit.
    pub async fn run(&mut self, mut track: RemoteVideoTrack, mut stop: watch::Receiver<bool>) -> PipelineReport {
        let mut frames: u64 = 0;
        let mut sink_errors: u64 = 0;
        let mut sent: u64 = 0;
        let mut dropped: u64 = 0;
        info!("Frame pipeline running on track {}", track.id());

        let exit = loop {
            let frame = tokio::select! {
                biased;
                _ = stop_requested(&mut stop) => break PipelineExit::Stopped,
                next = track.recv() => match next {
                    Some(frame) => frame,
                    None => break PipelineExit::TrackEnded,
                },
            };
            frames += 1;

            if let Err(e) = self.sink.present(&frame) {
                sink_errors += 1;
                if sink_errors <= 10 || sink_errors % 100 == 0 {
                    warn!("Sink error #{} (pts={}): {}", sink_errors, frame.pts, e);
                }
            }
            if self.sink.quit_requested() {
                break PipelineExit::QuitRequested;
            }

            if let Err(e) = self.queue.enqueue(frame).await {
                warn!("Analysis queue rejected frame #{}: {}", frames, e);
                break PipelineExit::WorkerGone;
            }

            match self.reporter.report().await {
                ReportOutcome::Sent(c) => {
                    sent += 1;
                    debug!("Reported {}", c);
                }
                ReportOutcome::Dropped => dropped += 1,
            }

            if frames % 300 == 0 {
                info!(
                    "Pipeline stats: frames={} sent={} dropped={} sink_errors={}",
                    frames, sent, dropped, sink_errors
                );
            }
        };

        self.sink.shutdown();
        if let Err(e) = self.queue.shutdown().await {
            debug!("Shutdown sentinel not delivered: {}", e);
        }
        info!("Frame pipeline exited ({}) after {} frames", exit, frames);

        PipelineReport { frames, sink_errors, coordinates_sent: sent, coordinates_dropped: dropped, exit }
    }
}
