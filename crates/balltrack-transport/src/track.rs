//! Video track handles.

use balltrack_core::{Frame, TransportError};
use tokio::sync::mpsc;

/// Outbound video track. Frames wait in a bounded buffer until the session
/// connects, then are compressed and packetized onto the RTP track.
#[derive(Debug, Clone)]
pub struct LocalVideoTrack {
    tx: mpsc::Sender<Frame>,
}

impl LocalVideoTrack {
    pub(crate) fn new(tx: mpsc::Sender<Frame>) -> Self {
        Self { tx }
    }

    /// Queues `frame` for the peer. Waits while the buffer is full.
    pub async fn write_frame(&self, frame: Frame) -> Result<(), TransportError> {
        self.tx.send(frame).await.map_err(|_| TransportError::ConnectionClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Inbound video track, reassembled and decoded from the peer's RTP track.
/// `recv` returns `None` once the session closes.
#[derive(Debug)]
pub struct RemoteVideoTrack {
    id: String,
    rx: mpsc::Receiver<Frame>,
}

impl RemoteVideoTrack {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }
}

/// A remote track fed directly through the returned sender.
pub fn remote_track(id: impl Into<String>, capacity: usize) -> (mpsc::Sender<Frame>, RemoteVideoTrack) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (tx, RemoteVideoTrack { id: id.into(), rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use balltrack_core::{PixelFormat, Resolution};

    #[tokio::test]
    async fn local_track_reports_closed_link() {
        let (tx, rx) = mpsc::channel(1);
        let track = LocalVideoTrack::new(tx);
        drop(rx);
        let frame = Frame::blank(Resolution::new(2, 2), PixelFormat::Bgr24).unwrap();
        assert!(matches!(track.write_frame(frame).await, Err(TransportError::ConnectionClosed)));
        assert!(track.is_closed());
    }

    #[tokio::test]
    async fn remote_track_ends_with_its_sender() {
        let (tx, mut track) = remote_track("video0", 2);
        tx.send(Frame::blank(Resolution::new(2, 2), PixelFormat::Bgr24).unwrap()).await.unwrap();
        drop(tx);
        assert!(track.recv().await.is_some());
        assert!(track.recv().await.is_none());
        assert_eq!(track.id(), "video0");
    }
}
