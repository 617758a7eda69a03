#![forbid(unsafe_code)]

// Per-connection inbound queue: one consumer task dispatches frames strictly
// in arrival order

use super::dispatcher::Dispatcher;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Frames buffered per connection before the reader is back-pressured
const QUEUE_CAPACITY: usize = 64;

pub struct InboundQueue {
    tx: mpsc::Sender<String>,
    worker: JoinHandle<()>,
}

impl InboundQueue {
    pub fn spawn(dispatcher: Arc<Dispatcher>, connection_id: String) -> Self {
        let (tx, mut rx) = mpsc::channel::<String>(QUEUE_CAPACITY);
        let worker = tokio::spawn(async move {
            while let Some(raw) = rx.recv().await {
                dispatcher.dispatch(&connection_id, &raw).await;
            }
            debug!("Inbound queue drained for connection {}", connection_id);
        });
        Self { tx, worker }
    }

    /// Enqueues a frame, waiting while the queue is full.
    /// Returns false once the consumer has stopped.
    pub async fn push(&self, raw: String) -> bool {
        self.tx.send(raw).await.is_ok()
    }

    /// Stops accepting frames and waits until every queued frame is handled
    pub async fn finish(self) {
        drop(self.tx);
        let _ = self.worker.await;
    }
}
