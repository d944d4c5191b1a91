use libp2p::PeerId;
use serde::{Deserialize, Serialize};

use pop_types::{wire, ContentId, Result, WireStream};

/// Protocol for asking caches to store new content.
pub const REQUEST_PROTOCOL_ID: &str = "/myel/pop/request/1.0";

/// Voucher type presented on the reverse pull a request triggers.
pub const REQUEST_VOUCHER_TYPE: &str = "DispatchRequestVoucher";

/// Describes the content to pull. Exactly one request per stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub payload_cid: ContentId,
    pub size: u64,
}

/// Reads and writes framed CBOR request messages on a protocol stream.
pub struct RequestStream {
    peer: PeerId,
    stream: Box<dyn WireStream>,
}

impl RequestStream {
    pub fn new(peer: PeerId, stream: Box<dyn WireStream>) -> Self {
        Self { peer, stream }
    }

    pub async fn read_request(&mut self) -> Result<Request> {
        wire::read_framed(&mut self.stream).await
    }

    pub async fn write_request(&mut self, req: &Request) -> Result<()> {
        wire::write_framed(&mut self.stream, req).await
    }

    /// Peer at the other end of the stream.
    pub fn other_peer(&self) -> PeerId {
        self.peer
    }
}
