//! Pub/sub plumbing between the filter and its governors.
//!
//! Every master gets one [`ControlSource`] (subscribe side, designated worker
//! only) and one [`AccountingSink`] (publish side, every worker). A
//! [`Connector`] opens both; [`ZmqConnector`] speaks ZeroMQ and
//! [`MemoryBus`] keeps everything in process.

use std::future::Future;

use bytes::Bytes;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use zeromq::Socket;
use zeromq::SocketRecv;
use zeromq::SocketSend;
use zeromq::ZmqMessage;

use crate::registry::MasterEndpoint;
use crate::wire::topic;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("ZeroMQ error: {0}")]
    Zmq(#[from] zeromq::ZmqError),

    #[error("Channel closed")]
    Closed,

    #[error("Subscriber fell behind; {0} messages skipped")]
    Lagged(u64),

    #[error("Cannot encode message: {0}")]
    Encode(&'static str),
}

/// Subscribe side of a governor's control channel.
pub trait ControlSource: Send + 'static {
    /// Waits for the next complete multipart message.
    fn recv(&mut self) -> impl Future<Output = Result<Vec<Bytes>, TransportError>> + Send;
}

/// Publish side of a governor's accounting channel.
pub trait AccountingSink: Send + 'static {
    fn send(&mut self, frames: Vec<Bytes>)
    -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Opens the channels of a [`MasterEndpoint`].
pub trait Connector: Send + Sync + 'static {
    type Source: ControlSource;
    type Sink: AccountingSink;

    /// Subscribes to `topic(domain)` for every domain the endpoint serves.
    fn control(
        &self,
        endpoint: &MasterEndpoint,
    ) -> impl Future<Output = Result<Self::Source, TransportError>> + Send;

    fn accounting(
        &self,
        endpoint: &MasterEndpoint,
    ) -> impl Future<Output = Result<Self::Sink, TransportError>> + Send;
}

/// Connects to governors over ZeroMQ.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZmqConnector;

pub struct ZmqControl {
    socket: zeromq::SubSocket,
}

pub struct ZmqAccounting {
    socket: zeromq::PubSocket,
}

impl ControlSource for ZmqControl {
    async fn recv(&mut self) -> Result<Vec<Bytes>, TransportError> {
        let message = self.socket.recv().await?;
        Ok(message.into_vec())
    }
}

impl AccountingSink for ZmqAccounting {
    async fn send(&mut self, frames: Vec<Bytes>) -> Result<(), TransportError> {
        let message = ZmqMessage::try_from(frames)
            .map_err(|_| TransportError::Encode("Unable to construct an empty ZmqMessage"))?;
        self.socket.send(message).await?;
        Ok(())
    }
}

impl Connector for ZmqConnector {
    type Source = ZmqControl;
    type Sink = ZmqAccounting;

    async fn control(&self, endpoint: &MasterEndpoint) -> Result<ZmqControl, TransportError> {
        let mut socket = zeromq::SubSocket::new();
        socket.connect(endpoint.control_address()).await?;
        for domain in endpoint.domains() {
            socket.subscribe(&topic(domain)).await?;
        }
        tracing::info!(
            address = endpoint.control_address(),
            domains = endpoint.domains().len(),
            "subscribed to governor control channel"
        );
        Ok(ZmqControl { socket })
    }

    async fn accounting(&self, endpoint: &MasterEndpoint) -> Result<ZmqAccounting, TransportError> {
        let mut socket = zeromq::PubSocket::new();
        socket.connect(endpoint.accounting_address()).await?;
        tracing::debug!(
            address = endpoint.accounting_address(),
            "connected to governor accounting channel"
        );
        Ok(ZmqAccounting { socket })
    }
}

/// In-process stand-in for a governor's two channels.
///
/// Control messages are fanned out to every subscriber and filtered by
/// topic prefix on the receiving side, the way a SUB socket does. Accounting
/// messages are dropped when nobody is listening, the way a PUB socket does.
#[derive(Debug, Clone)]
pub struct MemoryBus {
    control: broadcast::Sender<Vec<Bytes>>,
    accounting: broadcast::Sender<Vec<Bytes>>,
}

impl MemoryBus {
    pub fn new(capacity: usize) -> Self {
        let (control, _) = broadcast::channel(capacity);
        let (accounting, _) = broadcast::channel(capacity);
        Self {
            control,
            accounting,
        }
    }

    /// Plays the governor: publishes a control message.
    ///
    /// Returns the number of subscribers that saw it.
    pub fn publish_control(&self, frames: Vec<Bytes>) -> usize {
        self.control.send(frames).unwrap_or(0)
    }

    /// Plays the governor: observes accounting traffic from now on.
    pub fn subscribe_accounting(&self) -> broadcast::Receiver<Vec<Bytes>> {
        self.accounting.subscribe()
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

pub struct MemoryControl {
    receiver: broadcast::Receiver<Vec<Bytes>>,
    topics: Vec<String>,
}

impl MemoryControl {
    fn wanted(&self, frames: &[Bytes]) -> bool {
        let Some(first) = frames.first() else {
            return false;
        };
        self.topics
            .iter()
            .any(|topic| first.starts_with(topic.as_bytes()))
    }
}

impl ControlSource for MemoryControl {
    async fn recv(&mut self) -> Result<Vec<Bytes>, TransportError> {
        loop {
            match self.receiver.recv().await {
                Ok(frames) if self.wanted(&frames) => return Ok(frames),
                Ok(_) => continue,
                Err(RecvError::Closed) => return Err(TransportError::Closed),
                Err(RecvError::Lagged(skipped)) => return Err(TransportError::Lagged(skipped)),
            }
        }
    }
}

pub struct MemoryAccounting {
    sender: broadcast::Sender<Vec<Bytes>>,
}

impl AccountingSink for MemoryAccounting {
    async fn send(&mut self, frames: Vec<Bytes>) -> Result<(), TransportError> {
        // No subscribers is not an error for a publisher.
        let _ = self.sender.send(frames);
        Ok(())
    }
}

impl Connector for MemoryBus {
    type Source = MemoryControl;
    type Sink = MemoryAccounting;

    async fn control(&self, endpoint: &MasterEndpoint) -> Result<MemoryControl, TransportError> {
        Ok(MemoryControl {
            receiver: self.control.subscribe(),
            topics: endpoint.domains().iter().map(|d| topic(d)).collect(),
        })
    }

    async fn accounting(
        &self,
        _endpoint: &MasterEndpoint,
    ) -> Result<MemoryAccounting, TransportError> {
        Ok(MemoryAccounting {
            sender: self.accounting.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MasterRegistry;
    use crate::wire::ControlMessage;

    fn endpoint(domains: &[&str]) -> MasterEndpoint {
        let mut registry = MasterRegistry::default();
        for domain in domains {
            registry.register("tcp://localhost:10004", domain).unwrap();
        }
        registry.endpoint(0).unwrap().clone()
    }

    fn update(domain: &str) -> Vec<Bytes> {
        ControlMessage::DelayUntil {
            domain: domain.into(),
            identifier: "k".into(),
            until: 1,
        }
        .to_frames()
    }

    #[tokio::test]
    async fn test_memory_control_filters_by_topic() {
        let bus = MemoryBus::new(16);
        let mut source = bus.control(&endpoint(&["api"])).await.unwrap();

        bus.publish_control(update("apiv2"));
        bus.publish_control(update("web"));
        bus.publish_control(update("api"));

        let frames = source.recv().await.unwrap();
        assert_eq!(frames, update("api"));
    }

    #[tokio::test]
    async fn test_memory_control_reports_lag() {
        let bus = MemoryBus::new(2);
        let mut source = bus.control(&endpoint(&["api"])).await.unwrap();

        for _ in 0..5 {
            bus.publish_control(update("api"));
        }

        assert!(matches!(source.recv().await, Err(TransportError::Lagged(3))));
        assert_eq!(source.recv().await.unwrap(), update("api"));
    }

    #[tokio::test]
    async fn test_memory_accounting_without_listener_is_ok() {
        let bus = MemoryBus::new(4);
        let mut sink = bus.accounting(&endpoint(&["api"])).await.unwrap();
        assert!(sink.send(vec![Bytes::from_static(b"x")]).await.is_ok());

        let mut observer = bus.subscribe_accounting();
        sink.send(vec![Bytes::from_static(b"y")]).await.unwrap();
        assert_eq!(observer.recv().await.unwrap(), vec![Bytes::from_static(b"y")]);
    }
}
