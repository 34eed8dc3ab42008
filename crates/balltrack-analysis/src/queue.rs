//! FIFO frame conduit into the analysis worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use balltrack_core::{AnalysisError, Frame};
use tokio::sync::mpsc::{self, error::TrySendError};

#[derive(Debug)]
pub enum WorkItem {
    Frame(Frame),
    /// Terminal sentinel: the worker exits when it dequeues this.
    Shutdown,
}

pub struct FrameQueue;

impl FrameQueue {
    pub fn bounded(capacity: usize) -> (FrameQueueSender, FrameQueueReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            FrameQueueSender { tx, shut_down: Arc::new(AtomicBool::new(false)) },
            FrameQueueReceiver { rx },
        )
    }
}

#[derive(Debug, Clone)]
pub struct FrameQueueSender {
    tx: mpsc::Sender<WorkItem>,
    shut_down: Arc<AtomicBool>,
}

impl FrameQueueSender {
    /// Waits for room when the queue is full.
    pub async fn enqueue(&self, frame: Frame) -> Result<(), AnalysisError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(AnalysisError::QueueClosed);
        }
        self.tx.send(WorkItem::Frame(frame)).await.map_err(|_| AnalysisError::QueueClosed)
    }

    pub fn try_enqueue(&self, frame: Frame) -> Result<(), AnalysisError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(AnalysisError::QueueClosed);
        }
        self.tx.try_send(WorkItem::Frame(frame)).map_err(|e| match e {
            TrySendError::Full(_) => AnalysisError::QueueSaturated,
            TrySendError::Closed(_) => AnalysisError::QueueClosed,
        })
    }

    /// Enqueues the sentinel behind any pending frames. Later calls do nothing.
    pub async fn shutdown(&self) -> Result<(), AnalysisError> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.tx.send(WorkItem::Shutdown).await.map_err(|_| AnalysisError::QueueClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.shut_down.load(Ordering::Acquire) || self.tx.is_closed()
    }
}

#[derive(Debug)]
pub struct FrameQueueReceiver {
    rx: mpsc::Receiver<WorkItem>,
}

impl FrameQueueReceiver {
    /// For the worker thread. `None` means every sender is gone.
    pub fn blocking_recv(&mut self) -> Option<WorkItem> {
        self.rx.blocking_recv()
    }

    pub async fn recv(&mut self) -> Option<WorkItem> {
        self.rx.recv().await
    }
}
