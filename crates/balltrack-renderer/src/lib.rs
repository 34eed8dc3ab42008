//! balltrack-renderer
//!
//! Frame sinks for the consuming peer. A sink is handed every received frame
//! inline by the frame pipeline, so implementations keep `present` cheap and
//! push slow work (disk, display) elsewhere.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread;

use balltrack_core::Frame;
use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, info, warn};

// MARK: - FrameSink trait

/// Where the consumer shows received frames.
///
/// `present` must not block: the frame pipeline calls it inline for every
/// frame, and a failure is logged by the caller without stopping the stream.
pub trait FrameSink: Send {
    fn present(&mut self, frame: &Frame) -> Result<(), SinkError>;

    /// True once the viewer asked to stop (a window closed, a quit key).
    fn quit_requested(&self) -> bool {
        false
    }

    /// Releases display resources.
    fn shutdown(&mut self) {}
}

impl<S: FrameSink + ?Sized> FrameSink for Box<S> {
    fn present(&mut self, frame: &Frame) -> Result<(), SinkError> {
        (**self).present(frame)
    }

    fn quit_requested(&self) -> bool {
        (**self).quit_requested()
    }

    fn shutdown(&mut self) {
        (**self).shutdown()
    }
}

// MARK: - SinkError

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Failed to initialize sink: {0}")]
    InitializationFailed(String),

    #[error("Failed to present frame: {0}")]
    PresentFailed(String),
}

// MARK: - NullSink

/// Discards frames, counting them.
#[derive(Debug, Default)]
pub struct NullSink {
    presented: u64,
}

impl NullSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn presented(&self) -> u64 {
        self.presented
    }
}

impl FrameSink for NullSink {
    fn present(&mut self, frame: &Frame) -> Result<(), SinkError> {
        self.presented += 1;
        if self.presented == 1 {
            info!("First frame received: {}", frame.resolution());
        }
        if self.presented % 300 == 0 {
            info!("Presented {} frames", self.presented);
        }
        Ok(())
    }
}

// MARK: - Snapshot writer

/// Snapshots waiting for the writer thread beyond the one being written.
pub const SNAPSHOT_QUEUE_DEPTH: usize = 4;

struct Snapshot {
    path: PathBuf,
    width: u32,
    height: u32,
    rgb: Bytes,
}

/// Bounded hand-off to a named writer thread. A full queue refuses the
/// snapshot instead of waiting.
struct SnapshotWriter {
    tx: Option<SyncSender<Snapshot>>,
    thread: Option<thread::JoinHandle<()>>,
    written: Arc<AtomicU64>,
}

impl SnapshotWriter {
    fn spawn<W>(depth: usize, mut write: W) -> Result<Self, SinkError>
    where
        W: FnMut(&Snapshot) -> Result<(), String> + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel::<Snapshot>(depth);
        let written = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&written);
        let thread = thread::Builder::new()
            .name("png-snapshots".into())
            .spawn(move || {
                for snapshot in rx {
                    match write(&snapshot) {
                        Ok(()) => {
                            counter.fetch_add(1, Ordering::Relaxed);
                            debug!("Snapshot {}", snapshot.path.display());
                        }
                        Err(e) => warn!("Snapshot {} not written: {}", snapshot.path.display(), e),
                    }
                }
            })
            .map_err(|e| SinkError::InitializationFailed(format!("snapshot writer: {e}")))?;
        Ok(Self { tx: Some(tx), thread: Some(thread), written })
    }

    /// `Ok(false)` when the queue is full and the snapshot was dropped.
    fn offer(&self, snapshot: Snapshot) -> Result<bool, SinkError> {
        let Some(tx) = &self.tx else {
            return Err(SinkError::PresentFailed("snapshot writer stopped".into()));
        };
        match tx.try_send(snapshot) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(_)) => Ok(false),
            Err(TrySendError::Disconnected(_)) => Err(SinkError::PresentFailed("snapshot writer exited".into())),
        }
    }

    fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Lets the queued snapshots finish, then joins the thread.
    fn stop(&mut self) {
        self.tx.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Snapshot writer panicked");
            }
        }
    }
}

impl Drop for SnapshotWriter {
    fn drop(&mut self) {
        self.stop();
    }
}

fn save_png(snapshot: &Snapshot) -> Result<(), String> {
    let image = image::RgbImage::from_raw(snapshot.width, snapshot.height, snapshot.rgb.to_vec())
        .ok_or_else(|| "frame buffer does not match its size".to_owned())?;
    image.save(&snapshot.path).map_err(|e| e.to_string())
}

// MARK: - PngSnapshotSink

/// Writes every `every`-th frame to `<dir>/frame-<pts>.png` on a background
/// thread. Snapshots that find the writer backed up are dropped and counted.
pub struct PngSnapshotSink {
    dir: PathBuf,
    every: u64,
    seen: u64,
    dropped: u64,
    writer: SnapshotWriter,
}

impl PngSnapshotSink {
    pub fn new(dir: impl Into<PathBuf>, every: u64) -> Result<Self, SinkError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| SinkError::InitializationFailed(format!("{}: {e}", dir.display())))?;
        let writer = SnapshotWriter::spawn(SNAPSHOT_QUEUE_DEPTH, save_png)?;
        info!("Writing snapshots to {} (every {} frames)", dir.display(), every.max(1));
        Ok(Self::with_writer(dir, every, writer))
    }

    fn with_writer(dir: PathBuf, every: u64, writer: SnapshotWriter) -> Self {
        Self { dir, every: every.max(1), seen: 0, dropped: 0, writer }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Snapshots on disk so far. Final after `shutdown`.
    pub fn written(&self) -> u64 {
        self.writer.written()
    }

    /// Snapshots skipped because the writer was behind.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl FrameSink for PngSnapshotSink {
    fn present(&mut self, frame: &Frame) -> Result<(), SinkError> {
        self.seen += 1;
        if (self.seen - 1) % self.every != 0 {
            return Ok(());
        }

        let snapshot = Snapshot {
            path: self.dir.join(format!("frame-{:010}.png", frame.pts)),
            width: frame.width,
            height: frame.height,
            rgb: frame.to_rgb24(),
        };
        if !self.writer.offer(snapshot)? {
            self.dropped += 1;
            debug!("Snapshot writer behind; dropped frame {} ({} so far)", frame.pts, self.dropped);
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        self.writer.stop();
        info!("Snapshots: written={} dropped={}", self.writer.written(), self.dropped);
    }
}

impl std::fmt::Debug for PngSnapshotSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PngSnapshotSink")
            .field("dir", &self.dir)
            .field("every", &self.every)
            .field("written", &self.written())
            .field("dropped", &self.dropped)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use balltrack_core::{PixelFormat, Resolution, TimeBase};

    fn frame(pts: i64) -> Frame {
        // 2×1: one red pixel, one black pixel.
        let data = Bytes::from(vec![0u8, 0, 255, 0, 0, 0]);
        Frame::new(data, 2, 1, PixelFormat::Bgr24, pts, TimeBase::VIDEO_CLOCK).unwrap()
    }

    #[test]
    fn null_sink_counts() {
        let mut sink = NullSink::new();
        sink.present(&Frame::blank(Resolution::new(4, 4), PixelFormat::Bgr24).unwrap()).unwrap();
        sink.present(&Frame::blank(Resolution::new(4, 4), PixelFormat::Bgr24).unwrap()).unwrap();
        assert_eq!(sink.presented(), 2);
        assert!(!sink.quit_requested());
    }

    #[test]
    fn snapshot_sink_writes_every_nth_frame_as_rgb() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = PngSnapshotSink::new(dir.path(), 2).unwrap();
        for pts in 0..5 {
            sink.present(&frame(pts)).unwrap();
        }
        sink.shutdown();
        assert_eq!(sink.written() + sink.dropped(), 3);
        assert_eq!(sink.dropped(), 0);

        let img = image::open(dir.path().join("frame-0000000002.png")).unwrap().to_rgb8();
        assert_eq!(img.get_pixel(0, 0).0, [255, 0, 0]);
        assert_eq!(img.get_pixel(1, 0).0, [0, 0, 0]);
    }

    #[test]
    fn backed_up_writer_drops_instead_of_blocking() {
        let dir = tempfile::tempdir().unwrap();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        // The writer stalls on its first snapshot until the gate closes.
        let writer = SnapshotWriter::spawn(1, move |_| {
            let _ = gate_rx.recv();
            Ok(())
        })
        .unwrap();
        let mut sink = PngSnapshotSink::with_writer(dir.path().to_owned(), 1, writer);

        for pts in 0..6 {
            sink.present(&frame(pts)).unwrap();
        }
        // At most one snapshot in the writer and one queued.
        assert!(sink.dropped() >= 4, "dropped {}", sink.dropped());

        drop(gate_tx);
        sink.shutdown();
        assert_eq!(sink.written() + sink.dropped(), 6);
    }

    #[test]
    fn present_after_shutdown_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = PngSnapshotSink::new(dir.path(), 1).unwrap();
        sink.shutdown();
        assert!(matches!(sink.present(&frame(0)), Err(SinkError::PresentFailed(_))));
    }

    #[test]
    fn boxed_sink_delegates() {
        let mut sink: Box<dyn FrameSink> = Box::new(NullSink::new());
        assert!(sink.present(&frame(0)).is_ok());
        assert!(!sink.quit_requested());
    }
}
