//! `PeerSession`: a WebRTC peer connection carrying one video track and
//! ordered text data channels.
//!
//! ```text
//! offerer                                   answerer
//!   add_video_track / create_data_channel   create_data_channel
//!   create_offer / set_local  ── offer ──►  set_remote
//!                                           create_answer / set_local
//!   set_remote  ◄────────────── answer ──
//!   ◄─────────── candidates, both ways ──►  add_candidate
//!                     connected
//! ```
//!
//! The session keeps its own negotiation state machine on top of the peer
//! connection so out-of-order calls are refused before they reach it.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use balltrack_core::{ConnectivityCandidate, Frame, MediaConfig, SdpKind, SessionDescriptor, TransportError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice::mdns::MulticastDnsMode;
use webrtc::ice::network_type::NetworkType;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;

use crate::channel::DataChannel;
use crate::media::{self, FrameAssembler, Packetizer};
use crate::track::{remote_track, LocalVideoTrack, RemoteVideoTrack};

/// ICE reports `disconnected` after this much silence from the peer.
const DISCONNECTED_TIMEOUT: Duration = Duration::from_secs(2);
const KEEPALIVE_INTERVAL: Duration = Duration::from_millis(500);

// MARK: - SessionState

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    HaveLocalDescription,
    HaveRemoteDescription,
    Connected,
    Closed,
}

impl SessionState {
    /// Sessions only move forward; the two description states are peers.
    fn rank(self) -> u8 {
        match self {
            Self::New => 0,
            Self::HaveLocalDescription | Self::HaveRemoteDescription => 1,
            Self::Connected => 2,
            Self::Closed => 3,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::New => "new",
            Self::HaveLocalDescription => "have-local-description",
            Self::HaveRemoteDescription => "have-remote-description",
            Self::Connected => "connected",
            Self::Closed => "closed",
        })
    }
}

// MARK: - SessionEvents

/// Asynchronous session events, handed out once by [`PeerSession::new`].
#[derive(Debug)]
pub struct SessionEvents {
    /// Local candidates to trickle to the peer. An empty candidate marks the
    /// end of gathering.
    pub local_candidates: mpsc::UnboundedReceiver<ConnectivityCandidate>,
    /// Video tracks the peer sends, announced when their first packet arrives.
    pub remote_tracks: mpsc::UnboundedReceiver<RemoteVideoTrack>,
    /// Channels the peer opened.
    pub data_channels: mpsc::UnboundedReceiver<DataChannel>,
}

struct EventSenders {
    candidates: mpsc::UnboundedSender<ConnectivityCandidate>,
    tracks: mpsc::UnboundedSender<RemoteVideoTrack>,
    channels: mpsc::UnboundedSender<DataChannel>,
}

// MARK: - Internals

#[derive(Default)]
struct Negotiation {
    local: Option<SdpKind>,
    remote: Option<SdpKind>,
    local_ufrag: Option<String>,
    remote_ufrag: Option<String>,
    has_video: bool,
    remote_candidates: HashSet<String>,
}

struct Inner {
    config: MediaConfig,
    session_id: String,
    pc: Arc<RTCPeerConnection>,
    state: watch::Sender<SessionState>,
    negotiation: Mutex<Negotiation>,
    channels: Mutex<Vec<DataChannel>>,
    events: EventSenders,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn invalid_state(state: SessionState, operation: &'static str) -> TransportError {
    TransportError::InvalidState { state: state.to_string(), operation }
}

fn negotiation_failed(e: webrtc::Error) -> TransportError {
    TransportError::NegotiationFailed { reason: e.to_string() }
}

/// `a=ice-ufrag` of the first media section that has one.
fn ice_ufrag(sdp: &str) -> Option<String> {
    sdp.lines().find_map(|line| line.trim().strip_prefix("a=ice-ufrag:")).map(str::to_owned)
}

fn to_rtc(descriptor: &SessionDescriptor) -> Result<RTCSessionDescription, TransportError> {
    let sdp = descriptor.sdp.clone();
    match descriptor.kind {
        SdpKind::Offer => RTCSessionDescription::offer(sdp),
        SdpKind::Answer => RTCSessionDescription::answer(sdp),
    }
    .map_err(|e| TransportError::NegotiationFailed { reason: format!("unusable {}: {e}", descriptor.kind) })
}

fn candidate_from_init(init: RTCIceCandidateInit) -> ConnectivityCandidate {
    ConnectivityCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn candidate_to_init(candidate: &ConnectivityCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate.trim().to_owned(),
        sdp_mid: candidate.sdp_mid.clone(),
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment.clone(),
    }
}

async fn new_peer_connection(config: &MediaConfig) -> Result<RTCPeerConnection, TransportError> {
    let mut media = MediaEngine::default();
    media.register_codec(media::codec_parameters(), RTPCodecType::Video).map_err(negotiation_failed)?;

    let mut settings = SettingEngine::default();
    settings.set_network_types(vec![NetworkType::Udp4]);
    settings.set_include_loopback_candidate(config.include_loopback);
    settings.set_ice_multicast_dns_mode(MulticastDnsMode::Disabled);
    settings.set_ice_timeouts(Some(DISCONNECTED_TIMEOUT), Some(config.connect_timeout()), Some(KEEPALIVE_INTERVAL));
    if let Some(ip) = &config.nat_ip {
        settings.set_nat_1to1_ips(vec![ip.clone()], RTCIceCandidateType::Host);
    }

    let api = APIBuilder::new().with_media_engine(media).with_setting_engine(settings).build();
    let ice_servers = if config.ice_servers.is_empty() {
        Vec::new()
    } else {
        vec![RTCIceServer { urls: config.ice_servers.clone(), ..Default::default() }]
    };
    api.new_peer_connection(RTCConfiguration { ice_servers, ..Default::default() })
        .await
        .map_err(negotiation_failed)
}

// MARK: - PeerSession

/// One side of a point-to-point WebRTC session.
///
/// Dropping the session closes it.
pub struct PeerSession {
    inner: Arc<Inner>,
}

impl PeerSession {
    pub async fn new(config: MediaConfig) -> Result<(Self, SessionEvents), TransportError> {
        let pc = Arc::new(new_peer_connection(&config).await?);
        let (state, _) = watch::channel(SessionState::New);
        let (candidates, local_candidates) = mpsc::unbounded_channel();
        let (tracks, remote_tracks) = mpsc::unbounded_channel();
        let (channels, data_channels) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            config,
            session_id: Uuid::new_v4().simple().to_string(),
            pc,
            state,
            negotiation: Mutex::new(Negotiation::default()),
            channels: Mutex::new(Vec::new()),
            events: EventSenders { candidates, tracks, channels },
            tasks: Mutex::new(Vec::new()),
        });
        inner.install_callbacks();
        debug!("Session {} created", inner.session_id);

        Ok((Self { inner }, SessionEvents { local_candidates, remote_tracks, data_channels }))
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// ICE username fragment of the local description, once set.
    pub fn username_fragment(&self) -> Option<String> {
        lock(&self.inner.negotiation).local_ufrag.clone()
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Adds the outbound video track. Must precede negotiation.
    pub async fn add_video_track(&self) -> Result<LocalVideoTrack, TransportError> {
        let state = self.state();
        if state != SessionState::New {
            return Err(invalid_state(state, "add a video track"));
        }
        {
            let mut negotiation = lock(&self.inner.negotiation);
            if negotiation.has_video {
                return Err(invalid_state(state, "add a second video track"));
            }
            negotiation.has_video = true;
        }

        let rtp = Arc::new(TrackLocalStaticRTP::new(
            media::capability(),
            "video0".to_owned(),
            format!("balltrack-{}", &self.inner.session_id[..8]),
        ));
        let sender = self
            .inner
            .pc
            .add_track(Arc::clone(&rtp) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(negotiation_failed)?;

        // Receiver reports have to be read for the sender to keep running.
        self.inner.spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        let (tx, rx) = mpsc::channel(self.inner.config.frame_buffer.max(1));
        self.inner.spawn(send_video(self.watch_state(), rtp, rx));
        Ok(LocalVideoTrack::new(tx))
    }

    /// Opens a channel. It reports `open` once the peer connection is up.
    pub async fn create_data_channel(&self, label: impl Into<String>) -> Result<DataChannel, TransportError> {
        let state = self.state();
        if state == SessionState::Closed {
            return Err(invalid_state(state, "create a data channel"));
        }
        let label = label.into();
        let rtc = self.inner.pc.create_data_channel(&label, None).await.map_err(negotiation_failed)?;
        let channel = DataChannel::attach(rtc);
        lock(&self.inner.channels).push(channel.clone());
        Ok(channel)
    }

    pub async fn create_offer(&self) -> Result<SessionDescriptor, TransportError> {
        let state = self.state();
        if state != SessionState::New {
            return Err(invalid_state(state, "create an offer"));
        }
        let offer = self.inner.pc.create_offer(None).await.map_err(negotiation_failed)?;
        Ok(SessionDescriptor::offer(offer.sdp))
    }

    pub async fn create_answer(&self) -> Result<SessionDescriptor, TransportError> {
        let state = self.state();
        let ready = {
            let negotiation = lock(&self.inner.negotiation);
            negotiation.remote == Some(SdpKind::Offer) && negotiation.local.is_none()
        };
        if state != SessionState::HaveRemoteDescription || !ready {
            return Err(invalid_state(state, "create an answer"));
        }
        let answer = self.inner.pc.create_answer(None).await.map_err(negotiation_failed)?;
        Ok(SessionDescriptor::answer(answer.sdp))
    }

    pub async fn set_local_description(&self, descriptor: &SessionDescriptor) -> Result<(), TransportError> {
        let state = self.state();
        let remote = lock(&self.inner.negotiation).remote;
        let (allowed, operation) = match descriptor.kind {
            SdpKind::Offer => (state == SessionState::New, "set a local offer"),
            SdpKind::Answer => (
                state == SessionState::HaveRemoteDescription && remote == Some(SdpKind::Offer),
                "set a local answer",
            ),
        };
        if !allowed {
            return Err(invalid_state(state, operation));
        }

        self.inner.pc.set_local_description(to_rtc(descriptor)?).await.map_err(negotiation_failed)?;
        {
            let mut negotiation = lock(&self.inner.negotiation);
            negotiation.local = Some(descriptor.kind);
            negotiation.local_ufrag = ice_ufrag(&descriptor.sdp);
        }
        self.inner.set_state(SessionState::HaveLocalDescription);
        Ok(())
    }

    pub async fn set_remote_description(&self, descriptor: &SessionDescriptor) -> Result<(), TransportError> {
        let state = self.state();
        let local = lock(&self.inner.negotiation).local;
        let (allowed, operation) = match descriptor.kind {
            SdpKind::Offer => (state == SessionState::New, "set a remote offer"),
            SdpKind::Answer => (
                state == SessionState::HaveLocalDescription && local == Some(SdpKind::Offer),
                "set a remote answer",
            ),
        };
        if !allowed {
            return Err(invalid_state(state, operation));
        }

        self.inner.pc.set_remote_description(to_rtc(descriptor)?).await.map_err(negotiation_failed)?;
        {
            let mut negotiation = lock(&self.inner.negotiation);
            negotiation.remote = Some(descriptor.kind);
            negotiation.remote_ufrag = ice_ufrag(&descriptor.sdp);
        }
        self.inner.set_state(SessionState::HaveRemoteDescription);
        Ok(())
    }

    /// Applies one trickled candidate. Every error is recoverable: the session
    /// is unchanged and later candidates still apply.
    pub async fn add_candidate(&self, candidate: &ConnectivityCandidate) -> Result<(), TransportError> {
        let state = self.state();
        if state == SessionState::Closed {
            return Err(invalid_state(state, "add a candidate"));
        }
        let line = candidate.candidate.trim();
        {
            let mut negotiation = lock(&self.inner.negotiation);
            if negotiation.remote.is_none() {
                return Err(TransportError::NoRemoteDescription);
            }
            if line.is_empty() {
                debug!("Remote end-of-candidates");
                return Ok(());
            }
            if let (Some(ufrag), Some(expected)) =
                (candidate.username_fragment.as_deref(), negotiation.remote_ufrag.as_deref())
            {
                if ufrag != expected {
                    return Err(TransportError::MalformedCandidate {
                        reason: format!("username fragment {ufrag:?} does not belong to this session"),
                    });
                }
            }
            if !negotiation.remote_candidates.insert(line.to_owned()) {
                debug!("Duplicate candidate ignored: {}", line);
                return Ok(());
            }
        }

        if let Err(e) = self.inner.pc.add_ice_candidate(candidate_to_init(candidate)).await {
            lock(&self.inner.negotiation).remote_candidates.remove(line);
            return Err(TransportError::MalformedCandidate { reason: e.to_string() });
        }
        debug!("Remote candidate {}", line);
        Ok(())
    }

    /// Waits for `connected`. Fails if the session closes first.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<(), TransportError> {
        let mut rx = self.watch_state();
        let reached = tokio::time::timeout(
            timeout,
            rx.wait_for(|s| matches!(s, SessionState::Connected | SessionState::Closed)),
        )
        .await
        .map_err(|_| TransportError::Timeout { ms: timeout.as_millis() as u64 })?
        .map_err(|_| TransportError::ConnectionClosed)?;
        match *reached {
            SessionState::Connected => Ok(()),
            _ => Err(TransportError::ConnectionClosed),
        }
    }

    /// Closes the peer connection, its tracks and every channel. Idempotent.
    pub async fn close(&self) {
        self.inner.finish();
        if let Err(e) = self.inner.pc.close().await {
            debug!("Peer connection close: {}", e);
        }
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        if self.inner.finish() {
            self.inner.close_in_background();
        }
    }
}

impl fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSession")
            .field("session_id", &self.inner.session_id)
            .field("state", &self.state())
            .finish()
    }
}

// MARK: - Lifecycle

impl Inner {
    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Returns `false` if nothing changed. Never moves backwards.
    fn set_state(&self, next: SessionState) -> bool {
        self.state.send_if_modified(|current| {
            if *current == SessionState::Closed || *current == next || next.rank() < current.rank() {
                return false;
            }
            info!("Session {} {} → {}", &self.session_id[..8], current, next);
            *current = next;
            true
        })
    }

    /// Tracks `future` so that closing the session stops it.
    fn spawn<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        let mut tasks = lock(&self.tasks);
        if self.state() == SessionState::Closed {
            handle.abort();
        } else {
            tasks.push(handle);
        }
    }

    /// Moves to `closed`, stops the media tasks and closes every channel.
    /// Returns `false` if the session was already closed.
    fn finish(&self) -> bool {
        if !self.set_state(SessionState::Closed) {
            return false;
        }
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        for channel in lock(&self.channels).drain(..) {
            channel.mark_closed();
        }
        true
    }

    fn close_in_background(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let pc = Arc::clone(&self.pc);
        runtime.spawn(async move {
            if let Err(e) = pc.close().await {
                debug!("Peer connection close: {}", e);
            }
        });
    }

    fn on_connection_state(&self, state: RTCPeerConnectionState) {
        debug!("Peer connection {}: {}", &self.session_id[..8], state);
        match state {
            RTCPeerConnectionState::Connected => {
                self.set_state(SessionState::Connected);
            }
            RTCPeerConnectionState::Disconnected => warn!("Session {} lost contact with the peer", &self.session_id[..8]),
            RTCPeerConnectionState::Failed => {
                warn!("Session {} failed", &self.session_id[..8]);
                if self.finish() {
                    self.close_in_background();
                }
            }
            RTCPeerConnectionState::Closed => {
                self.finish();
            }
            _ => {}
        }
    }

    fn accept_track(&self, track: Arc<TrackRemote>) {
        if track.kind() != RTPCodecType::Video {
            debug!("Ignoring {} track", track.kind());
            return;
        }
        let id = track.id();
        info!("Peer video track '{}' arrived", id);
        let (tx, remote) = remote_track(id, self.config.frame_buffer);
        self.spawn(receive_video(track, tx));
        let _ = self.events.tracks.send(remote);
    }

    fn install_callbacks(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            if let Some(inner) = weak.upgrade() {
                inner.on_connection_state(state);
            }
            Box::pin(async {})
        }));

        let weak = Arc::downgrade(self);
        self.pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let candidate = match candidate {
                    Some(c) => match c.to_json() {
                        Ok(init) => candidate_from_init(init),
                        Err(e) => {
                            warn!("Local candidate not serializable: {}", e);
                            return;
                        }
                    },
                    None => ConnectivityCandidate::default(),
                };
                let _ = inner.events.candidates.send(candidate);
            })
        }));

        let weak = Arc::downgrade(self);
        self.pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
            if let Some(inner) = weak.upgrade() {
                inner.accept_track(track);
            }
            Box::pin(async {})
        }));

        let weak = Arc::downgrade(self);
        self.pc.on_data_channel(Box::new(move |rtc: Arc<RTCDataChannel>| {
            if let Some(inner) = weak.upgrade() {
                let channel = DataChannel::attach(rtc);
                info!("Peer opened channel '{}' ({})", channel.label(), channel.id());
                if inner.state() == SessionState::Closed {
                    channel.mark_closed();
                } else {
                    lock(&inner.channels).push(channel.clone());
                }
                let _ = inner.events.channels.send(channel);
            }
            Box::pin(async {})
        }));
    }
}

// ── Media tasks ───────────────────────────────────────────────────────────────

async fn send_video(
    mut state: watch::Receiver<SessionState>,
    rtp: Arc<TrackLocalStaticRTP>,
    mut frames: mpsc::Receiver<Frame>,
) {
    match state.wait_for(|s| matches!(s, SessionState::Connected | SessionState::Closed)).await {
        Ok(s) if *s == SessionState::Connected => {}
        _ => return,
    }
    let mut packetizer = Packetizer::default();
    let mut sent: u64 = 0;

    while let Some(frame) = frames.recv().await {
        let pts = frame.pts;
        let png = match tokio::task::spawn_blocking(move || media::encode_frame(&frame)).await {
            Ok(Ok(png)) => png,
            Ok(Err(e)) => {
                warn!("Frame {} not encoded: {}", pts, e);
                continue;
            }
            Err(e) => {
                warn!("Encoder task failed: {}", e);
                break;
            }
        };
        // RTP timestamps wrap; the 90 kHz clock makes that every 13 hours.
        for packet in packetizer.packetize(&png, pts as u32) {
            if let Err(e) = rtp.write_rtp(&packet).await {
                debug!("Frame {} write failed: {}", pts, e);
                break;
            }
        }
        sent += 1;
        if sent % 300 == 0 {
            debug!("Sent {} frames ({} bytes last)", sent, png.len());
        }
    }
}

async fn receive_video(track: Arc<TrackRemote>, frames: mpsc::Sender<Frame>) {
    let mut assembler = FrameAssembler::default();
    let mut received: u64 = 0;

    loop {
        let packet = match track.read_rtp().await {
            Ok((packet, _)) => packet,
            Err(e) => {
                info!("Peer video track ended: {}", e);
                break;
            }
        };
        let Some((timestamp, png)) = assembler.push(&packet) else {
            continue;
        };
        let pts = i64::from(timestamp);
        let frame = match tokio::task::spawn_blocking(move || media::decode_frame(&png, pts)).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(e)) => {
                warn!("Dropping undecodable frame {}: {}", pts, e);
                continue;
            }
            Err(e) => {
                warn!("Decoder task failed: {}", e);
                break;
            }
        };
        if frames.send(frame).await.is_err() {
            debug!("Remote track dropped by its reader");
            break;
        }
        received += 1;
        if received % 300 == 0 {
            debug!("Received {} frames", received);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use balltrack_core::{PixelFormat, Resolution};
    use bytes::Bytes;

    use crate::channel::ChannelState;

    const WAIT: Duration = Duration::from_secs(10);

    fn config() -> MediaConfig {
        MediaConfig { connect_timeout_ms: 2_000, ..MediaConfig::default() }
    }

    struct Pair {
        offerer: PeerSession,
        offerer_events: SessionEvents,
        answerer: PeerSession,
        answerer_events: SessionEvents,
        video: LocalVideoTrack,
        offerer_channel: DataChannel,
        channel: DataChannel,
        candidate: ConnectivityCandidate,
    }

    async fn connected_pair() -> Pair {
        let (offerer, mut offerer_events) = PeerSession::new(config()).await.unwrap();
        let (answerer, mut answerer_events) = PeerSession::new(config()).await.unwrap();

        let video = offerer.add_video_track().await.unwrap();
        let offerer_channel = offerer.create_data_channel("ball_coordinates").await.unwrap();
        let offer = offerer.create_offer().await.unwrap();
        offerer.set_local_description(&offer).await.unwrap();
        assert_eq!(offerer.state(), SessionState::HaveLocalDescription);
        assert!(offerer.username_fragment().is_some());

        let channel = answerer.create_data_channel("ball_coordinates").await.unwrap();
        answerer.set_remote_description(&offer).await.unwrap();
        assert_eq!(answerer.state(), SessionState::HaveRemoteDescription);
        let answer = answerer.create_answer().await.unwrap();
        answerer.set_local_description(&answer).await.unwrap();
        offerer.set_remote_description(&answer).await.unwrap();

        let mut candidate = None;
        {
            let both = async {
                offerer.wait_connected(WAIT).await?;
                answerer.wait_connected(WAIT).await
            };
            tokio::pin!(both);
            loop {
                tokio::select! {
                    connected = &mut both => {
                        connected.unwrap();
                        break;
                    }
                    Some(c) = offerer_events.local_candidates.recv() => {
                        answerer.add_candidate(&c).await.unwrap();
                        if !c.candidate.is_empty() {
                            candidate.get_or_insert(c);
                        }
                    }
                    Some(c) = answerer_events.local_candidates.recv() => {
                        offerer.add_candidate(&c).await.unwrap();
                    }
                }
            }
        }

        Pair {
            offerer,
            offerer_events,
            answerer,
            answerer_events,
            video,
            offerer_channel,
            channel,
            candidate: candidate.expect("offerer gathered no candidates"),
        }
    }

    fn marked_frame(pts: i64) -> Frame {
        let res = Resolution::new(32, 24);
        let mut data = vec![0u8; Frame::buffer_len(res.width, res.height, PixelFormat::Bgr24).unwrap()];
        let i = (10 * 32 + 7) * 3;
        data[i..i + 3].copy_from_slice(&[0, 0, 255]);
        Frame::new(Bytes::from(data), res.width, res.height, PixelFormat::Bgr24, pts, balltrack_core::TimeBase::VIDEO_CLOCK)
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn frames_and_messages_cross_the_session() {
        let mut pair = connected_pair().await;

        // The first packets can race the track binding, so keep sending.
        let video = pair.video.clone();
        let writer = tokio::spawn(async move {
            for tick in 1..=100 {
                if video.write_frame(marked_frame(tick * 3_000)).await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        });
        let mut track = tokio::time::timeout(WAIT, pair.answerer_events.remote_tracks.recv())
            .await
            .unwrap()
            .unwrap();
        let frame = tokio::time::timeout(WAIT, track.recv()).await.unwrap().unwrap();
        writer.abort();
        assert_eq!(frame.format, PixelFormat::Rgb24);
        assert_eq!(frame.resolution(), Resolution::new(32, 24));
        assert_eq!(frame.pts % 3_000, 0);
        assert_eq!(frame.bgr(7, 10), Some([0, 0, 255]));
        assert_eq!(frame.bgr(0, 0), Some([0, 0, 0]));

        pair.channel.wait_open().await.unwrap();
        assert!(pair.channel.is_open());
        pair.channel.send_text("42,17").await.unwrap();
        let remote = loop {
            let channel = tokio::time::timeout(WAIT, pair.offerer_events.data_channels.recv())
                .await
                .unwrap()
                .unwrap();
            if channel.label() == "ball_coordinates" {
                break channel;
            }
        };
        assert_eq!(remote.recv().await.as_deref(), Some("42,17"));

        remote.send_text("ack").await.unwrap();
        assert_eq!(pair.channel.recv().await.as_deref(), Some("ack"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn candidates_are_duplicate_tolerant() {
        let pair = connected_pair().await;
        pair.answerer.add_candidate(&pair.candidate).await.unwrap();
        pair.answerer.add_candidate(&pair.candidate).await.unwrap();
        assert_eq!(pair.answerer.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn bad_candidates_are_recoverable() {
        let (session, _events) = PeerSession::new(config()).await.unwrap();
        let candidate = ConnectivityCandidate {
            candidate: "candidate:1 1 udp 2130706431 127.0.0.1 9 typ host".into(),
            ..Default::default()
        };
        assert!(matches!(session.add_candidate(&candidate).await, Err(TransportError::NoRemoteDescription)));

        let (offerer, _offer_events) = PeerSession::new(config()).await.unwrap();
        offerer.create_data_channel("ball_coordinates").await.unwrap();
        let offer = offerer.create_offer().await.unwrap();
        session.set_remote_description(&offer).await.unwrap();

        let garbage = ConnectivityCandidate { candidate: "candidate:garbage".into(), ..Default::default() };
        assert!(matches!(session.add_candidate(&garbage).await, Err(TransportError::MalformedCandidate { .. })));
        // A rejected candidate is not remembered as seen.
        assert!(session.add_candidate(&garbage).await.is_err());

        let foreign = ConnectivityCandidate { username_fragment: Some("nope".into()), ..candidate.clone() };
        assert!(matches!(session.add_candidate(&foreign).await, Err(TransportError::MalformedCandidate { .. })));

        session.add_candidate(&ConnectivityCandidate::default()).await.unwrap();
        session.add_candidate(&candidate).await.unwrap();
        session.add_candidate(&candidate).await.unwrap();
        assert_eq!(session.state(), SessionState::HaveRemoteDescription);
    }

    #[tokio::test]
    async fn out_of_order_calls_are_rejected() {
        let (session, _events) = PeerSession::new(config()).await.unwrap();
        assert!(matches!(session.create_answer().await, Err(TransportError::InvalidState { .. })));
        let answer = SessionDescriptor::answer("v=0");
        assert!(matches!(
            session.set_remote_description(&answer).await,
            Err(TransportError::InvalidState { .. })
        ));
        assert!(matches!(
            session.set_local_description(&answer).await,
            Err(TransportError::InvalidState { .. })
        ));
        assert_eq!(session.state(), SessionState::New);

        session.add_video_track().await.unwrap();
        assert!(session.add_video_track().await.is_err());
        let offer = session.create_offer().await.unwrap();
        session.set_local_description(&offer).await.unwrap();
        assert!(matches!(session.create_offer().await, Err(TransportError::InvalidState { .. })));
        assert!(matches!(session.set_remote_description(&offer).await, Err(TransportError::InvalidState { .. })));
        assert_eq!(session.state(), SessionState::HaveLocalDescription);
    }

    #[tokio::test]
    async fn unparseable_descriptions_fail_negotiation() {
        let (session, _events) = PeerSession::new(config()).await.unwrap();
        let offer = SessionDescriptor::offer("not sdp");
        assert!(matches!(
            session.set_remote_description(&offer).await,
            Err(TransportError::NegotiationFailed { .. })
        ));
        assert_eq!(session.state(), SessionState::New);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn close_is_final_and_reaches_the_peer() {
        let pair = connected_pair().await;
        pair.channel.wait_open().await.unwrap();

        pair.offerer.close().await;
        assert_eq!(pair.offerer.state(), SessionState::Closed);
        assert_eq!(pair.offerer_channel.ready_state(), ChannelState::Closed);
        assert!(pair.video.write_frame(marked_frame(0)).await.is_err());
        assert!(matches!(
            pair.offerer.create_data_channel("late").await,
            Err(TransportError::InvalidState { .. })
        ));

        // The peer notices once ICE gives up on the silent side.
        let mut state = pair.answerer.watch_state();
        tokio::time::timeout(Duration::from_secs(20), state.wait_for(|s| *s == SessionState::Closed))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pair.channel.ready_state(), ChannelState::Closed);

        // Idempotent.
        pair.offerer.close().await;
        pair.answerer.close().await;
    }

    #[test]
    fn candidates_map_onto_ice_inits() {
        let candidate = ConnectivityCandidate {
            candidate: " candidate:1 1 udp 1 10.0.0.1 5000 typ host ".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: Some("abcd".into()),
        };
        let init = candidate_to_init(&candidate);
        assert_eq!(init.candidate, "candidate:1 1 udp 1 10.0.0.1 5000 typ host");
        let back = candidate_from_init(init);
        assert_eq!(back.sdp_mid.as_deref(), Some("0"));
        assert_eq!(back.sdp_mline_index, Some(0));
        assert_eq!(back.username_fragment.as_deref(), Some("abcd"));
    }

    #[test]
    fn ufrag_is_read_from_the_description() {
        let sdp = "v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\nm=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\na=ice-ufrag:XyZw\r\na=ice-pwd:p\r\n";
        assert_eq!(ice_ufrag(sdp).as_deref(), Some("XyZw"));
        assert_eq!(ice_ufrag("v=0\r\n"), None);
    }

    #[test]
    fn states_never_move_backwards() {
        assert!(SessionState::Connected.rank() > SessionState::HaveRemoteDescription.rank());
        assert_eq!(SessionState::HaveLocalDescription.rank(), SessionState::HaveRemoteDescription.rank());
        assert!(SessionState::Closed.rank() > SessionState::Connected.rank());
    }
}
