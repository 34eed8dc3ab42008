use thiserror::Error;

#[derive(Error, Debug)]
pub enum BallTrackError {
    #[error("Configuration invalid: {reason}")]
    ConfigurationInvalid { reason: String },

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Analysis error: {0}")]
    Analysis(#[from] AnalysisError),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// MARK: - SignalingError

#[derive(Error, Debug)]
pub enum SignalingError {
    /// The link to the peer could not be established. Fatal at startup.
    #[error("Signaling peer unavailable at {addr}: {source}")]
    Unavailable {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The channel already terminated; no further sends are possible.
    #[error("Signaling channel closed")]
    Closed,

    #[error("Signaling protocol violation: {reason}")]
    Protocol { reason: String },

    #[error("Signaling IO error: {0}")]
    Io(#[from] std::io::Error),
}

// MARK: - TransportError

#[derive(Error, Debug)]
pub enum TransportError {
    /// The peer connection is not up yet. Outbound video waits in the track
    /// buffer instead of failing, so this never reaches application code.
    #[error("Transport not ready")]
    NotReady,

    #[error("Cannot {operation} in state {state}")]
    InvalidState { state: String, operation: &'static str },

    #[error("Candidate received before the remote description")]
    NoRemoteDescription,

    #[error("Malformed candidate: {reason}")]
    MalformedCandidate { reason: String },

    #[error("Negotiation failed: {reason}")]
    NegotiationFailed { reason: String },

    #[error("Data channel '{label}' is not open")]
    ChannelNotOpen { label: String },

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Send failed: {reason}")]
    SendFailed { reason: String },

    #[error("Receive failed: {reason}")]
    ReceiveFailed { reason: String },

    #[error("Timeout after {ms}ms")]
    Timeout { ms: u64 },
}

impl TransportError {
    /// Errors a signaling loop logs and moves past.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::NoRemoteDescription | Self::MalformedCandidate { .. } | Self::NotReady
        )
    }
}

// MARK: - AnalysisError

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("Frame queue closed")]
    QueueClosed,

    #[error("Frame queue saturated")]
    QueueSaturated,

    #[error("Analysis worker panicked")]
    WorkerPanicked,

    #[error("Frame queue dropped without a shutdown sentinel")]
    AbortedWithoutSentinel,

    #[error("Failed to spawn analysis worker: {0}")]
    Spawn(#[source] std::io::Error),
}

// MARK: - FrameError

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame buffer holds {actual} bytes, expected {expected}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("Frame geometry {width}x{height} does not fit in memory")]
    TooLarge { width: u32, height: u32 },

    #[error("Frame codec error: {reason}")]
    Codec { reason: String },
}

// MARK: - CoordinateParseError

/// A coordinate message that is not `"<x>,<y>"`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Malformed coordinate message {message:?}: {reason}")]
pub struct CoordinateParseError {
    pub message: String,
    pub reason: &'static str,
}
