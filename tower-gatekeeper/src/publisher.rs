use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::metrics::GateMetrics;
use crate::transport::AccountingSink;
use crate::wire::AccountingEvent;
use crate::wire::resync_frames;

/// Fire-and-forget handle onto one governor's accounting channel.
///
/// Publishing never waits: when the queue is full or the forwarding task has
/// gone away the event is counted as dropped and the request carries on.
#[derive(Debug, Clone)]
pub struct AccountingPublisher {
    sender: mpsc::Sender<Vec<Bytes>>,
    metrics: GateMetrics,
}

impl AccountingPublisher {
    pub(crate) fn channel(capacity: usize) -> (Self, mpsc::Receiver<Vec<Bytes>>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let publisher = Self {
            sender,
            metrics: GateMetrics::new(),
        };
        (publisher, receiver)
    }

    /// Starts forwarding queued events to `sink` until `shutdown` fires.
    pub fn spawn<K: AccountingSink>(
        sink: K,
        capacity: usize,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (publisher, receiver) = Self::channel(capacity);
        let task = tokio::spawn(forward(sink, receiver, shutdown));
        (publisher, task)
    }

    /// Queues `event`; returns `false` if it was dropped.
    pub fn publish(&self, event: &AccountingEvent) -> bool {
        self.offer(event.to_frames())
    }

    /// Queues a request for the governor to re-push its delays for `domain`.
    pub fn request_resync(&self, domain: &str) -> bool {
        self.offer(resync_frames(domain))
    }

    fn offer(&self, frames: Vec<Bytes>) -> bool {
        match self.sender.try_send(frames) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.metrics.accounting_dropped("full");
                tracing::trace!("accounting queue full; dropping event");
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.metrics.accounting_dropped("closed");
                false
            }
        }
    }
}

async fn forward<K: AccountingSink>(
    mut sink: K,
    mut receiver: mpsc::Receiver<Vec<Bytes>>,
    shutdown: CancellationToken,
) {
    loop {
        let frames = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            frames = receiver.recv() => match frames {
                Some(frames) => frames,
                None => break,
            },
        };
        if let Err(err) = sink.send(frames).await {
            tracing::warn!(%err, "failed to publish accounting event");
        }
    }
    tracing::debug!("accounting publisher stopped");
}
