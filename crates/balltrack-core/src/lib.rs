pub mod config;
pub mod errors;
pub mod types;

pub use config::{AnalysisConfig, MediaConfig, SceneConfig, SessionConfig, SignalingConfig};
pub use errors::{
    AnalysisError, BallTrackError, CoordinateParseError, FrameError, SignalingError, TransportError,
};
pub use types::*;
