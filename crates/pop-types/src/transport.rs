//! Graph-transport abstraction: selector-driven block streaming between
//! peers, gated by typed vouchers. The core registers pull validators and
//! store configurers against voucher type ids and reacts to transfer events;
//! the actual block movement is the transport's business.

use async_trait::async_trait;
use libp2p::PeerId;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::amount::TokenAmount;
use crate::cbor;
use crate::content::{ContentId, StoreId};
use crate::error::Result;

/// Declarative description of which blocks of a DAG to traverse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Selector {
    /// Traverse every block reachable from the root.
    All,
    /// Traverse only the named path segments under the root.
    Path(Vec<String>),
}

impl Selector {
    pub fn all() -> Self {
        Selector::All
    }
}

/// Identifier of a transfer channel, unique per transport instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferChannelId(pub u64);

impl fmt::Display for TransferChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}

/// A typed voucher carried on a transfer channel. The payload is CBOR so the
/// transport stays agnostic of the concrete voucher shapes registered by the
/// replication and retrieval subsystems.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferVoucher {
    pub type_id: String,
    pub payload: Vec<u8>,
}

impl TransferVoucher {
    pub fn encode<T: Serialize>(type_id: &str, value: &T) -> Result<Self> {
        Ok(Self {
            type_id: type_id.to_string(),
            payload: cbor::to_vec(value)?,
        })
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        cbor::from_slice(&self.payload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStatus {
    Requested,
    Ongoing,
    Completed,
    Failed,
    Cancelled,
}

/// Snapshot of a channel's state delivered alongside every event.
#[derive(Debug, Clone)]
pub struct Transfer {
    pub channel: TransferChannelId,
    pub base: ContentId,
    /// Peer that opened the channel and receives the blocks.
    pub recipient: PeerId,
    /// Peer serving the blocks.
    pub sender: PeerId,
    pub received: u64,
    pub status: TransferStatus,
}

#[derive(Debug, Clone)]
pub enum TransferEventKind {
    Opened,
    Progress,
    /// The sender requests payment for bytes transferred so far.
    PaymentRequested(TokenAmount),
    /// The sender accepted a payment voucher.
    PaymentAcknowledged,
    Completed,
    Error(String),
}

#[derive(Debug, Clone)]
pub struct TransferEvent {
    pub kind: TransferEventKind,
    pub transfer: Transfer,
}

/// Validates that a peer may open a pull for the given root.
#[async_trait]
pub trait PullValidator: Send + Sync {
    async fn validate_pull(
        &self,
        receiver: PeerId,
        voucher: &TransferVoucher,
        base: ContentId,
        selector: &Selector,
    ) -> Result<()>;
}

/// Resolves the local store a transfer for `base` should read from or write
/// into, keyed by voucher type.
#[async_trait]
pub trait StoreConfigurer: Send + Sync {
    async fn store_for(&self, voucher: &TransferVoucher, base: ContentId) -> Option<StoreId>;
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a pull channel to `from`, asking it to stream the blocks selected
    /// under `base`. The voucher is presented to the remote's validator.
    async fn open_pull(
        &self,
        from: PeerId,
        voucher: TransferVoucher,
        base: ContentId,
        selector: Selector,
    ) -> Result<TransferChannelId>;

    /// Send an additional voucher (e.g. a payment) on an open channel.
    async fn send_voucher(&self, channel: TransferChannelId, voucher: TransferVoucher)
        -> Result<()>;

    /// Subscribe to transfer events for channels this node participates in.
    fn subscribe(&self) -> broadcast::Receiver<TransferEvent>;

    /// Register the pull validator for a voucher type id.
    async fn register_validator(&self, type_id: &str, validator: Arc<dyn PullValidator>);

    /// Register the store configurer for a voucher type id.
    async fn register_configurer(&self, type_id: &str, configurer: Arc<dyn StoreConfigurer>);
}
