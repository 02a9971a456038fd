//! Bounded task queue between the enumerator and the worker pool
//!
//! Producers wait for room instead of dropping tasks, so listing speed is
//! throttled by download throughput. Several workers share one receiver.

use civitdl_types::DownloadTask;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Why a task could not be enqueued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    /// The queue was closed for shutdown
    Closed,
    /// Cancellation fired while waiting for room
    Cancelled,
}

/// Create a queue holding at most `capacity` tasks
pub fn task_queue(capacity: usize) -> (TaskSender, TaskReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        TaskSender { tx },
        TaskReceiver {
            rx: Arc::new(Mutex::new(rx)),
        },
    )
}

/// Producer half. The queue ends once every sender is dropped.
#[derive(Clone, Debug)]
pub struct TaskSender {
    tx: mpsc::Sender<DownloadTask>,
}

impl TaskSender {
    /// Enqueue a task, waiting while the queue is full
    pub async fn push(
        &self,
        task: DownloadTask,
        cancel: &CancellationToken,
    ) -> Result<(), PushError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PushError::Cancelled),
            sent = self.tx.send(task) => sent.map_err(|_| PushError::Closed),
        }
    }
}

/// Consumer half, shared by all workers
#[derive(Clone, Debug)]
pub struct TaskReceiver {
    rx: Arc<Mutex<mpsc::Receiver<DownloadTask>>>,
}

impl TaskReceiver {
    /// Wait for the next task. Returns `None` once the queue is finished or
    /// cancellation fires.
    pub async fn pop(&self, cancel: &CancellationToken) -> Option<DownloadTask> {
        if cancel.is_cancelled() {
            return None;
        }
        let mut rx = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            rx = self.rx.lock() => rx,
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            task = rx.recv() => task,
        }
    }

    /// Stop accepting tasks and hand back everything still queued
    pub async fn close_and_drain(&self) -> Vec<DownloadTask> {
        let mut rx = self.rx.lock().await;
        rx.close();
        let mut remaining = Vec::new();
        while let Ok(task) = rx.try_recv() {
            remaining.push(task);
        }
        remaining
    }
}
