//! balltrack-signaling
//!
//! Carries session descriptors and connectivity candidates between the two
//! peers before (and while) their transport session is live.
//!
//! # Roles
//!
//! ```text
//! Producer (offerer)                    Consumer (answerer)
//! ───────────────────────────           ───────────────────────────
//! TcpSignaling::offerer  ◄── TCP ────── TcpSignaling::answerer
//!   listen + accept one peer              connect (with retries)
//!   send(offer)            ──────────►    receive() → offer
//!   receive() → answer     ◄──────────    send(answer)
//!   send(candidate) …      ◄─────────►    … send(candidate)
//! ```
//!
//! # Wire format
//!
//! Every message is a 4-byte big-endian length followed by a JSON body:
//! `{"type":"offer","sdp":…}`, `{"type":"answer","sdp":…}`,
//! `{"type":"candidate","candidate":…}` or `{"type":"bye"}`.

pub mod message;
pub mod tcp;
pub mod wire;

use async_trait::async_trait;
use balltrack_core::SignalingError;

pub use message::SignalingMessage;
pub use tcp::{SignalingRole, TcpSignaling};

// MARK: - Signaling trait

/// Ordered, reliable point-to-point message channel between offerer and answerer.
#[async_trait]
pub trait Signaling: Send {
    /// Establishes the underlying link. Idempotent.
    ///
    /// Fails with [`SignalingError::Unavailable`] when the peer cannot be reached.
    async fn connect(&mut self) -> Result<(), SignalingError>;

    /// Sends a descriptor or candidate.
    ///
    /// Fails with [`SignalingError::Closed`] once the channel has terminated
    /// or the peer has left.
    async fn send(&mut self, message: SignalingMessage) -> Result<(), SignalingError>;

    /// Next message, or `None` at end of stream.
    async fn receive(&mut self) -> Result<Option<SignalingMessage>, SignalingError>;

    /// Releases the link. Idempotent.
    async fn close(&mut self) -> Result<(), SignalingError>;
}
