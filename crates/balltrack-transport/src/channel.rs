//! Ordered text channels over the session's SCTP association.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use balltrack_core::TransportError;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tracing::{debug, warn};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ChannelState {
    fn from_rtc(state: RTCDataChannelState) -> Self {
        match state {
            RTCDataChannelState::Open => Self::Open,
            RTCDataChannelState::Closing => Self::Closing,
            RTCDataChannelState::Closed => Self::Closed,
            _ => Self::Connecting,
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        })
    }
}

/// Channel state as last reported by the peer connection. `Closed` is terminal.
struct Status {
    label: String,
    state: watch::Sender<ChannelState>,
    incoming: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

impl Status {
    fn set(&self, next: ChannelState) {
        self.state.send_if_modified(|current| {
            if *current == ChannelState::Closed || *current == next {
                return false;
            }
            debug!("Channel '{}' {} → {}", self.label, current, next);
            *current = next;
            true
        });
        if next == ChannelState::Closed {
            self.incoming.lock().unwrap_or_else(PoisonError::into_inner).take();
        }
    }

    fn deliver(&self, text: String) {
        if let Some(tx) = self.incoming.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            let _ = tx.send(text);
        }
    }
}

/// Handle to one data channel. Clones share the channel.
#[derive(Clone)]
pub struct DataChannel {
    rtc: Arc<RTCDataChannel>,
    status: Arc<Status>,
    incoming: Arc<AsyncMutex<mpsc::UnboundedReceiver<String>>>,
}

impl DataChannel {
    /// Wraps `rtc` and takes over its open, close and message callbacks.
    pub(crate) fn attach(rtc: Arc<RTCDataChannel>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ChannelState::from_rtc(rtc.ready_state()));
        let status = Arc::new(Status { label: rtc.label().to_owned(), state, incoming: Mutex::new(Some(tx)) });

        let on_open = Arc::clone(&status);
        rtc.on_open(Box::new(move || {
            on_open.set(ChannelState::Open);
            Box::pin(async {})
        }));
        let on_close = Arc::clone(&status);
        rtc.on_close(Box::new(move || {
            on_close.set(ChannelState::Closed);
            Box::pin(async {})
        }));
        let on_message = Arc::clone(&status);
        rtc.on_message(Box::new(move |msg: DataChannelMessage| {
            match String::from_utf8(msg.data.to_vec()) {
                Ok(text) => on_message.deliver(text),
                Err(_) => warn!("Channel '{}': dropping non-UTF-8 message", on_message.label),
            }
            Box::pin(async {})
        }));

        Self { rtc, status, incoming: Arc::new(AsyncMutex::new(rx)) }
    }

    pub fn id(&self) -> u16 {
        self.rtc.id()
    }

    pub fn label(&self) -> &str {
        &self.status.label
    }

    /// The peer connection's view, except that a channel closed with its
    /// session stays closed.
    pub fn ready_state(&self) -> ChannelState {
        if *self.status.state.borrow() == ChannelState::Closed {
            return ChannelState::Closed;
        }
        ChannelState::from_rtc(self.rtc.ready_state())
    }

    pub fn is_open(&self) -> bool {
        self.ready_state() == ChannelState::Open
    }

    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.status.state.subscribe()
    }

    /// Sends one message. Fails with `ChannelNotOpen` unless the channel is open.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ChannelNotOpen { label: self.status.label.clone() });
        }
        self.rtc
            .send_text(text.into())
            .await
            .map(|_| ())
            .map_err(|e| TransportError::SendFailed { reason: e.to_string() })
    }

    /// Next message from the peer; `None` once the channel is closed and drained.
    pub async fn recv(&self) -> Option<String> {
        self.incoming.lock().await.recv().await
    }

    /// Waits until the channel opens. Fails if it closes first.
    pub async fn wait_open(&self) -> Result<(), TransportError> {
        let mut rx = self.watch_state();
        let state = rx
            .wait_for(|s| matches!(s, ChannelState::Open | ChannelState::Closed))
            .await
            .map_err(|_| TransportError::ConnectionClosed)?;
        match *state {
            ChannelState::Open => Ok(()),
            _ => Err(TransportError::ConnectionClosed),
        }
    }

    pub async fn close(&self) {
        if *self.status.state.borrow() == ChannelState::Closed {
            return;
        }
        self.status.set(ChannelState::Closing);
        if let Err(e) = self.rtc.close().await {
            debug!("Channel '{}' close: {}", self.status.label, e);
        }
        self.mark_closed();
    }

    /// Final state. Pending messages stay readable, then `recv` yields `None`.
    pub(crate) fn mark_closed(&self) {
        self.status.set(ChannelState::Closed);
    }
}

impl fmt::Debug for DataChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataChannel")
            .field("id", &self.id())
            .field("label", &self.status.label)
            .field("state", &self.ready_state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtc_states_map_onto_channel_states() {
        assert_eq!(ChannelState::from_rtc(RTCDataChannelState::Unspecified), ChannelState::Connecting);
        assert_eq!(ChannelState::from_rtc(RTCDataChannelState::Connecting), ChannelState::Connecting);
        assert_eq!(ChannelState::from_rtc(RTCDataChannelState::Open), ChannelState::Open);
        assert_eq!(ChannelState::from_rtc(RTCDataChannelState::Closing), ChannelState::Closing);
        assert_eq!(ChannelState::from_rtc(RTCDataChannelState::Closed), ChannelState::Closed);
    }

    #[tokio::test]
    async fn closed_status_drains_then_ends() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ChannelState::Open);
        let status = Status { label: "ball_coordinates".into(), state, incoming: Mutex::new(Some(tx)) };

        status.deliver("5,6".into());
        status.set(ChannelState::Closed);
        status.deliver("lost".into());
        assert_eq!(rx.recv().await.as_deref(), Some("5,6"));
        assert_eq!(rx.recv().await, None);

        status.set(ChannelState::Open);
        assert_eq!(*status.state.borrow(), ChannelState::Closed);
    }
}
