//! balltrack-analysis
//!
//! The consumer's analysis side of the pipeline.
//!
//! ```text
//! FramePipeline ── FrameQueue (bounded, FIFO) ──► analysis-worker thread
//!                                                   BallDetector::detect
//!                                                        │ publish
//! CoordinateReporter ◄──────── SharedEstimate ◄──────────┘
//! ```
//!
//! The worker runs on its own OS thread and shares nothing with the async
//! side except the queue and the estimate. It stops on [`WorkItem::Shutdown`].

pub mod color;
pub mod detector;
pub mod estimate;
pub mod queue;
pub mod worker;

pub use color::{ColorModel, HsvRange};
pub use detector::{BallDetector, Detection};
pub use estimate::{EstimateSnapshot, SharedEstimate};
pub use queue::{FrameQueue, FrameQueueReceiver, FrameQueueSender, WorkItem};
pub use worker::{AnalysisHandle, AnalysisWorker, WorkerReport};
