//! Blockchain RPC and wallet collaborator interfaces: message-pool
//! submission, state reads, and receipt waits. The manager only ever talks
//! to the chain through these traits.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use pop_types::{cbor, Address, ContentId, Result, TokenAmount};

/// Method numbers on the payment channel actor.
pub mod method {
    /// Plain value transfer, used by add-funds.
    pub const SEND: u64 = 0;
    /// Init actor constructor dispatch.
    pub const INIT_EXEC: u64 = 2;
    pub const PAYCH_UPDATE: u64 = 2;
    pub const PAYCH_SETTLE: u64 = 3;
    pub const PAYCH_COLLECT: u64 = 4;
}

/// Code id of the v1 payment channel actor. The state decoder is selected
/// from this tag.
pub const PAYCH_ACTOR_CODE_V1: &str = "paych/v1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub from: Address,
    pub to: Address,
    pub value: TokenAmount,
    pub method: u64,
    pub params: Vec<u8>,
    pub nonce: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signature(pub Vec<u8>);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedMessage {
    pub message: Message,
    pub signature: Signature,
}

impl SignedMessage {
    /// Digest identifying the message on chain.
    pub fn cid(&self) -> Result<ContentId> {
        let bytes = cbor::to_vec(self)?;
        Ok(ContentId::of_block(&bytes))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsgReceipt {
    pub exit_code: i64,
    pub return_data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsgLookup {
    pub receipt: MsgReceipt,
}

/// Constructor params carried by a channel-create message to the init actor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateChannelParams {
    pub from: Address,
    pub to: Address,
}

/// Return of a successful init-actor exec: the created actor's addresses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecReturn {
    pub id_address: Address,
    pub robust_address: Address,
}

/// Raw state of an on-chain actor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorState {
    /// Version tag selecting the state decoder.
    pub code: String,
    /// Actor balance (total funds held by the channel).
    pub balance: TokenAmount,
    /// Raw CBOR state bytes.
    pub state: Vec<u8>,
    pub nonce: u64,
}

#[async_trait]
pub trait Chain: Send + Sync {
    /// Submit a signed message to the message pool, returning its digest.
    async fn mpool_push(&self, msg: SignedMessage) -> Result<ContentId>;

    /// Block until the message lands with the given confidence.
    async fn state_wait_msg(&self, mcid: ContentId, confidence: u64) -> Result<MsgLookup>;

    /// Read the raw state of an actor.
    async fn state_read_actor(&self, addr: Address) -> Result<ActorState>;

    /// Read a raw object from the chain store.
    async fn chain_read_obj(&self, cid: ContentId) -> Result<Vec<u8>>;

    /// Next message nonce for an address.
    async fn next_nonce(&self, addr: Address) -> Result<u64>;
}

#[async_trait]
pub trait Wallet: Send + Sync {
    fn default_address(&self) -> Address;

    async fn sign(&self, from: Address, data: &[u8]) -> Result<Signature>;

    async fn verify(&self, signer: Address, data: &[u8], sig: &Signature) -> Result<bool>;
}
