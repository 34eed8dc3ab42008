//! balltrack-app
//!
//! The two peers and the pieces they are built from.
//!
//! ```text
//! producer (offerer)                         consumer (answerer)
//! BouncingBall ─► LocalVideoTrack ══ RTP ═══► RemoteVideoTrack ─► FramePipeline
//!                                                                   ├─► FrameSink
//!                                                                   ├─► FrameQueue ─► analysis worker
//!                                                                   │                      │
//! GroundTruthComparator ◄── "x,y" ══ ball_coordinates ◄── CoordinateReporter ◄─ SharedEstimate
//!        └─► FeedbackSink
//! ```

pub mod consumer;
pub mod feedback;
pub mod pipeline;
pub mod producer;

use tokio::sync::watch;

pub use consumer::{run_consumer, ConsumerReport};
pub use feedback::{
    AccuracySummary, CoordinateReporter, FeedbackSample, FeedbackSink, GroundTruthComparator, LogFeedbackSink,
    ReportOutcome,
};
pub use pipeline::{FramePipeline, PipelineExit, PipelineReport};
pub use producer::{run_producer, ProducerReport};

/// Label of the channel carrying coordinate reports.
pub const COORDINATES_CHANNEL: &str = "ball_coordinates";

/// Resolves once `stop` reads `true`. Never resolves if the sender is gone.
pub async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    if stop.wait_for(|stopped| *stopped).await.is_err() {
        std::future::pending::<()>().await;
    }
}
