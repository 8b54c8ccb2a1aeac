use std::sync::Arc;

use delay_store::DelayKey;
use delay_store::DelayStore;
use delay_store::KeyError;
use delay_store::Merge;
use delay_store::StoreError;
use tokio_util::sync::CancellationToken;

use crate::metrics::GateMetrics;
use crate::registry::MasterEndpoint;
use crate::transport::ControlSource;
use crate::transport::TransportError;
use crate::wire::ControlMessage;
use crate::wire::DecodeError;
use crate::wire::decode_control;

/// Why a control message did not reach the store.
#[derive(Debug, thiserror::Error)]
pub enum ListenError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("domain '{0}' is not served by this governor")]
    Unserved(String),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Applies one governor's `DELAY_UNTIL` updates to the store.
#[derive(Debug)]
pub struct ControlListener<D>
where
    D: ?Sized,
{
    store: Arc<D>,
    endpoint: MasterEndpoint,
    metrics: GateMetrics,
}

impl<D> ControlListener<D>
where
    D: DelayStore + ?Sized,
{
    pub fn new(store: Arc<D>, endpoint: MasterEndpoint) -> Self {
        Self {
            store,
            endpoint,
            metrics: GateMetrics::new(),
        }
    }

    /// Decodes and applies one message. A rejected message changes nothing.
    pub fn handle<B: AsRef<[u8]>>(&self, frames: &[B]) -> Result<Merge, ListenError> {
        let ControlMessage::DelayUntil {
            domain,
            identifier,
            until,
        } = decode_control(frames)?;
        if !self.endpoint.serves(&domain) {
            return Err(ListenError::Unserved(domain));
        }
        let key = DelayKey::new(&domain, &identifier)?;
        Ok(self.store.upsert_max(&key, until)?)
    }

    /// Drains `source` until `shutdown` fires or the channel closes.
    pub async fn run<C: ControlSource>(self, mut source: C, shutdown: CancellationToken) {
        let address = self.endpoint.control_address().to_string();
        tracing::info!(%address, "control listener started");
        loop {
            let received = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                received = source.recv() => received,
            };
            match received {
                Ok(frames) => self.process(&frames),
                Err(TransportError::Closed) => {
                    tracing::info!(%address, "control channel closed");
                    break;
                }
                Err(err) => tracing::warn!(%address, %err, "control channel read failed"),
            }
        }
        tracing::debug!(%address, "control listener stopped");
    }

    fn process<B: AsRef<[u8]>>(&self, frames: &[B]) {
        match self.handle(frames) {
            Ok(merge) => {
                self.metrics.control_update(Some(merge));
                tracing::trace!(?merge, "applied control update");
            }
            Err(ListenError::Store(err)) => {
                self.metrics.store_error();
                self.metrics.control_update(None);
                tracing::error!(%err, "dropping control update");
            }
            Err(err) => {
                self.metrics.malformed_control();
                tracing::warn!(%err, parts = frames.len(), "discarding control message");
            }
        }
    }
}
