//! Host abstraction over the libp2p-style network: protocol streams,
//! connection notifications, and gossip publish/subscribe. The production
//! node binds this to a real swarm; tests use the in-memory implementation
//! from `pop-testutil`.

use async_trait::async_trait;
use futures::future::BoxFuture;
use libp2p::PeerId;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};

use crate::error::Result;

/// A raw bidirectional protocol stream.
pub trait WireStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> WireStream for T {}

/// Handler invoked for every inbound stream on a registered protocol.
pub type StreamHandler =
    Arc<dyn Fn(PeerId, Box<dyn WireStream>) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnEvent {
    Connected(PeerId),
    Disconnected(PeerId),
}

/// A message delivered from a gossip topic.
#[derive(Debug, Clone)]
pub struct GossipMessage {
    pub source: PeerId,
    pub data: Vec<u8>,
}

#[async_trait]
pub trait Net: Send + Sync {
    fn local_peer(&self) -> PeerId;

    /// Open an outbound stream to `to` speaking `protocol`.
    async fn open_stream(&self, to: PeerId, protocol: &str) -> Result<Box<dyn WireStream>>;

    /// Register the handler for inbound streams on `protocol`. A later
    /// registration for the same protocol replaces the previous one.
    async fn set_stream_handler(&self, protocol: &str, handler: StreamHandler);

    /// Currently connected peers.
    async fn connected_peers(&self) -> Vec<PeerId>;

    /// Connection lifecycle notifications.
    fn conn_events(&self) -> broadcast::Receiver<ConnEvent>;

    /// Publish `data` on a gossip topic.
    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<()>;

    /// Subscribe to a gossip topic.
    async fn subscribe(&self, topic: &str) -> mpsc::UnboundedReceiver<GossipMessage>;
}
