//! balltrack-transport
//!
//! Point-to-point WebRTC session negotiated with an offer/answer exchange.
//! A session exposes an outbound video track, the inbound video track the
//! peer announced, and ordered text data channels.
//!
//! Descriptors and candidates are produced and consumed here only;
//! signaling carries them as opaque values.

mod channel;
mod media;
mod session;
mod track;

pub use channel::{ChannelState, DataChannel};
pub use session::{PeerSession, SessionEvents, SessionState};
pub use track::{remote_track, LocalVideoTrack, RemoteVideoTrack};
