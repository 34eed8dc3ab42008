//! TCP signaling endpoint (both roles).
//!
//! # Lifecycle
//!
//! ```text
//! 1. TcpSignaling::offerer(addr) / TcpSignaling::answerer(addr)
//! 2. connect()         ← listener accepts one peer / connector dials with retries
//!       └─ spawns a reader task feeding an internal channel
//! 3. send(..) / receive() ← receive() is cancel-safe, usable inside select!
//! 4. close()           ← sends bye, shuts the write half down
//! ```
//!
//! Once the peer says bye or its stream ends, `send` fails with
//! `SignalingError::Closed`; messages already received stay readable.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use balltrack_core::{SignalingConfig, SignalingError};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::message::{SignalingMessage, WireMessage};
use crate::wire::{decode, read_frame, write_msg};
use crate::Signaling;

// MARK: - SignalingRole

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingRole {
    /// Listens and accepts exactly one peer.
    Offerer,
    /// Dials the offerer.
    Answerer,
}

// MARK: - TcpSignaling

pub struct TcpSignaling {
    role: SignalingRole,
    addr: String,
    connect_attempts: u32,
    retry_delay: Duration,
    listener: Option<TcpListener>,
    link: Option<Link>,
    closed: bool,
}

struct Link {
    writer: OwnedWriteHalf,
    incoming: mpsc::Receiver<SignalingMessage>,
    reader: JoinHandle<()>,
    peer: SocketAddr,
    /// Set by the reader on bye, end of stream or a read error.
    peer_gone: Arc<AtomicBool>,
}

impl TcpSignaling {
    pub fn offerer(addr: impl Into<String>) -> Self {
        Self::new(SignalingRole::Offerer, addr.into())
    }

    pub fn answerer(addr: impl Into<String>) -> Self {
        Self::new(SignalingRole::Answerer, addr.into())
    }

    /// Endpoint for `role` at the configured address, with its retry policy.
    pub fn from_config(role: SignalingRole, config: &SignalingConfig) -> Self {
        Self::new(role, config.addr()).with_retry(config.connect_attempts, config.retry_delay())
    }

    fn new(role: SignalingRole, addr: String) -> Self {
        Self {
            role,
            addr,
            connect_attempts: 1,
            retry_delay: Duration::from_millis(250),
            listener: None,
            link: None,
            closed: false,
        }
    }

    /// Answerer only: how many dials before giving up, and the pause between them.
    pub fn with_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.connect_attempts = attempts.max(1);
        self.retry_delay = delay;
        self
    }

    pub fn role(&self) -> SignalingRole {
        self.role
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.link.as_ref().map(|l| l.peer)
    }

    /// Offerer only: binds the listener ahead of `connect` and returns the
    /// bound address (useful with port 0).
    pub async fn bind(&mut self) -> Result<SocketAddr, SignalingError> {
        if self.role != SignalingRole::Offerer {
            return Err(SignalingError::Protocol { reason: "only the offerer listens".into() });
        }
        if let Some(listener) = &self.listener {
            return Ok(listener.local_addr()?);
        }
        let listener = TcpListener::bind(&self.addr)
            .await
            .map_err(|source| SignalingError::Unavailable { addr: self.addr.clone(), source })?;
        let local = listener.local_addr()?;
        info!("Signaling listening on {}", local);
        self.listener = Some(listener);
        Ok(local)
    }

    async fn accept(&mut self) -> Result<TcpStream, SignalingError> {
        self.bind().await?;
        let Some(listener) = self.listener.take() else {
            return Err(SignalingError::Protocol { reason: "listener not bound".into() });
        };
        let (stream, peer) = listener
            .accept()
            .await
            .map_err(|source| SignalingError::Unavailable { addr: self.addr.clone(), source })?;
        info!("Signaling peer connected from {}", peer);
        Ok(stream)
    }

    async fn dial(&self) -> Result<TcpStream, SignalingError> {
        let mut last_err = None;
        for attempt in 1..=self.connect_attempts {
            match TcpStream::connect(&self.addr).await {
                Ok(stream) => {
                    info!("Signaling connected to {} (attempt {})", self.addr, attempt);
                    return Ok(stream);
                }
                Err(e) => {
                    debug!("Signaling dial {} attempt {}/{}: {}", self.addr, attempt, self.connect_attempts, e);
                    last_err = Some(e);
                    if attempt < self.connect_attempts {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }
        let source = last_err
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no connect attempt made"));
        Err(SignalingError::Unavailable { addr: self.addr.clone(), source })
    }

    fn attach(&mut self, stream: TcpStream) -> Result<(), SignalingError> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel::<SignalingMessage>(64);
        let peer_gone = Arc::new(AtomicBool::new(false));
        let reader = tokio::spawn(recv_loop(read_half, tx, peer, Arc::clone(&peer_gone)));
        self.link = Some(Link { writer: write_half, incoming: rx, reader, peer, peer_gone });
        Ok(())
    }
}

#[async_trait]
impl Signaling for TcpSignaling {
    async fn connect(&mut self) -> Result<(), SignalingError> {
        if self.closed {
            return Err(SignalingError::Closed);
        }
        if self.link.is_some() {
            return Ok(());
        }
        let stream = match self.role {
            SignalingRole::Offerer => self.accept().await?,
            SignalingRole::Answerer => self.dial().await?,
        };
        self.attach(stream)
    }

    async fn send(&mut self, message: SignalingMessage) -> Result<(), SignalingError> {
        if self.closed {
            return Err(SignalingError::Closed);
        }
        self.connect().await?;
        let Some(link) = self.link.as_mut() else {
            return Err(SignalingError::Closed);
        };
        if link.peer_gone.load(Ordering::Acquire) {
            debug!("Not sending to {}: peer left", link.peer);
            return Err(SignalingError::Closed);
        }
        let wire = WireMessage::from(message);
        match write_msg(&mut link.writer, &wire).await {
            Ok(()) => Ok(()),
            Err(e) if is_disconnect(&e) => {
                warn!("Signaling peer {} went away: {}", link.peer, e);
                self.closed = true;
                Err(SignalingError::Closed)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn receive(&mut self) -> Result<Option<SignalingMessage>, SignalingError> {
        if self.closed {
            return Ok(None);
        }
        self.connect().await?;
        match self.link.as_mut() {
            Some(link) => Ok(link.incoming.recv().await),
            None => Ok(None),
        }
    }

    async fn close(&mut self) -> Result<(), SignalingError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.listener = None;
        if let Some(mut link) = self.link.take() {
            if let Err(e) = write_msg(&mut link.writer, &WireMessage::Bye).await {
                debug!("Signaling bye not delivered: {}", e);
            }
            let _ = link.writer.shutdown().await;
            link.reader.abort();
            info!("Signaling link to {} closed", link.peer);
        }
        Ok(())
    }
}

impl Drop for TcpSignaling {
    fn drop(&mut self) {
        if let Some(link) = &self.link {
            link.reader.abort();
        }
    }
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
    )
}

// MARK: - Background receive loop

async fn recv_loop(
    reader: OwnedReadHalf,
    tx: mpsc::Sender<SignalingMessage>,
    peer: SocketAddr,
    peer_gone: Arc<AtomicBool>,
) {
    // Flag before `tx` drops so a `receive` that sees the end also sees the flag.
    if read_messages(reader, &tx, peer).await {
        peer_gone.store(true, Ordering::Release);
    }
}

/// Returns `true` when the peer ended the conversation, `false` when the
/// local side stopped listening.
async fn read_messages(mut reader: OwnedReadHalf, tx: &mpsc::Sender<SignalingMessage>, peer: SocketAddr) -> bool {
    loop {
        let body = match read_frame(&mut reader).await {
            Ok(Some(body)) => body,
            Ok(None) => {
                debug!("Signaling peer {} closed the stream", peer);
                return true;
            }
            Err(e) => {
                warn!("Signaling receive error from {}: {}", peer, e);
                return true;
            }
        };
        let wire = match decode(&body) {
            Ok(wire) => wire,
            Err(e) => {
                warn!("Discarding undecodable signaling message from {}: {}", peer, e);
                continue;
            }
        };
        debug!("Received {} from {}", wire.kind(), peer);
        match wire.into_message() {
            Some(message) => {
                if tx.send(message).await.is_err() {
                    return false;
                }
            }
            None => {
                info!("Signaling peer {} sent bye", peer);
                return true;
            }
        }
    }
}
