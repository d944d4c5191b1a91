pub mod amount;
pub mod cbor;
pub mod content;
pub mod error;
pub mod net;
pub mod region;
pub mod transport;
pub mod wire;

pub use amount::{Address, TokenAmount};
pub use content::{ContentId, StoreId};
pub use error::{ExchangeError, Result};
pub use net::{ConnEvent, GossipMessage, Net, StreamHandler, WireStream};
pub use region::{Region, RegionCode};
pub use transport::{
    PullValidator, Selector, StoreConfigurer, Transfer, TransferChannelId, TransferEvent,
    TransferEventKind, TransferStatus, TransferVoucher, Transport,
};

/// Confidence parameter for on-chain message waits.
pub const MSG_CONFIDENCE: u64 = 5;
