use balltrack_core::{ConnectivityCandidate, SdpKind, SessionDescriptor};
use serde::{Deserialize, Serialize};

// MARK: - SignalingMessage

/// What one peer tells the other during negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingMessage {
    Description(SessionDescriptor),
    Candidate(ConnectivityCandidate),
}

impl From<SessionDescriptor> for SignalingMessage {
    fn from(descriptor: SessionDescriptor) -> Self {
        Self::Description(descriptor)
    }
}

impl From<ConnectivityCandidate> for SignalingMessage {
    fn from(candidate: ConnectivityCandidate) -> Self {
        Self::Candidate(candidate)
    }
}

// MARK: - Wire representation

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum WireMessage {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate(ConnectivityCandidate),
    /// End of session.
    Bye,
}

impl WireMessage {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Candidate(_) => "candidate",
            Self::Bye => "bye",
        }
    }

    /// `None` for the end-of-session marker.
    pub(crate) fn into_message(self) -> Option<SignalingMessage> {
        match self {
            Self::Offer { sdp } => Some(SessionDescriptor::offer(sdp).into()),
            Self::Answer { sdp } => Some(SessionDescriptor::answer(sdp).into()),
            Self::Candidate(candidate) => Some(candidate.into()),
            Self::Bye => None,
        }
    }
}

impl From<SignalingMessage> for WireMessage {
    fn from(message: SignalingMessage) -> Self {
        match message {
            SignalingMessage::Description(SessionDescriptor { kind: SdpKind::Offer, sdp }) => {
                Self::Offer { sdp }
            }
            SignalingMessage::Description(SessionDescriptor { kind: SdpKind::Answer, sdp }) => {
                Self::Answer { sdp }
            }
            SignalingMessage::Candidate(candidate) => Self::Candidate(candidate),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offer_wire_json() {
        let wire = WireMessage::from(SignalingMessage::from(SessionDescriptor::offer("v=0")));
        let json = serde_json::to_string(&wire).unwrap();
        assert_eq!(json, r#"{"type":"offer","sdp":"v=0"}"#);
    }

    #[test]
    fn candidate_wire_json_is_flat() {
        let json = r#"{"type":"candidate","candidate":"candidate:1 1 tcp 1 127.0.0.1 5000 typ host","sdpMid":"0"}"#;
        let wire: WireMessage = serde_json::from_str(json).unwrap();
        match wire.into_message() {
            Some(SignalingMessage::Candidate(c)) => {
                assert!(c.candidate.ends_with("typ host"));
                assert_eq!(c.sdp_mid.as_deref(), Some("0"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn bye_is_end_of_stream() {
        let wire: WireMessage = serde_json::from_str(r#"{"type":"bye"}"#).unwrap();
        assert_eq!(wire.kind(), "bye");
        assert!(wire.into_message().is_none());
    }
}
