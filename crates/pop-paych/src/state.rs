//! Chain actor-state reader. The payment channel actor's raw state is
//! decoded by a decoder selected from the actor code tag, so an actor
//! upgrade only adds a decoder; every version surfaces the same
//! `ChannelState` capability.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

use pop_types::{cbor, Address, ContentId, ExchangeError, Result, TokenAmount};

use crate::chain::{ActorState, Chain, PAYCH_ACTOR_CODE_V1};

/// State of a single lane.
pub trait LaneState: Send + Sync {
    /// Amount successfully redeemed through the lane.
    fn redeemed(&self) -> TokenAmount;

    fn nonce(&self) -> u64;
}

/// Abstract payment-channel actor state, stable across actor versions.
#[async_trait]
pub trait ChannelState: Send + Sync {
    /// Channel owner, who has funded the actor.
    fn from(&self) -> Address;

    /// Recipient of payouts from the channel.
    fn to(&self) -> Address;

    /// Epoch at which the channel can be collected.
    fn settling_at(&self) -> i64;

    /// Amount redeemed so far, paid out on collect.
    fn to_send(&self) -> TokenAmount;

    async fn lane_count(&self) -> Result<u64>;

    async fn for_each_lane_state(
        &self,
        cb: &mut (dyn for<'a> FnMut(u64, &'a dyn LaneState) -> Result<()> + Send),
    ) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct RawStateV1 {
    from: Address,
    to: Address,
    settling_at: i64,
    to_send: TokenAmount,
    /// Chain object holding the lane state array.
    lane_states: ContentId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct RawLaneStateV1 {
    redeemed: TokenAmount,
    nonce: u64,
}

impl LaneState for RawLaneStateV1 {
    fn redeemed(&self) -> TokenAmount {
        self.redeemed
    }

    fn nonce(&self) -> u64 {
        self.nonce
    }
}

struct ChannelStateV1 {
    raw: RawStateV1,
    chain: Arc<dyn Chain>,
    /// Lane states are materialized from the chain store on first access.
    lanes: Mutex<Option<Vec<RawLaneStateV1>>>,
}

impl ChannelStateV1 {
    async fn lanes(&self) -> Result<Vec<RawLaneStateV1>> {
        let mut cached = self.lanes.lock().await;
        if let Some(lanes) = cached.as_ref() {
            return Ok(lanes.clone());
        }
        let raw = self
            .chain
            .chain_read_obj(self.raw.lane_states)
            .await
            .map_err(|e| ExchangeError::ChainRead(format!("lane states: {e}")))?;
        let lanes: Vec<RawLaneStateV1> = cbor::from_slice(&raw)
            .map_err(|e| ExchangeError::ChainRead(format!("lane states decode: {e}")))?;
        *cached = Some(lanes.clone());
        Ok(lanes)
    }
}

#[async_trait]
impl ChannelState for ChannelStateV1 {
    fn from(&self) -> Address {
        self.raw.from
    }

    fn to(&self) -> Address {
        self.raw.to
    }

    fn settling_at(&self) -> i64 {
        self.raw.settling_at
    }

    fn to_send(&self) -> TokenAmount {
        self.raw.to_send
    }

    async fn lane_count(&self) -> Result<u64> {
        Ok(self.lanes().await?.len() as u64)
    }

    async fn for_each_lane_state(
        &self,
        cb: &mut (dyn for<'a> FnMut(u64, &'a dyn LaneState) -> Result<()> + Send),
    ) -> Result<()> {
        let lanes = self.lanes().await?;
        for (idx, lane) in lanes.iter().enumerate() {
            cb(idx as u64, lane)?;
        }
        Ok(())
    }
}

/// Decode raw actor state with the decoder matching its code tag.
pub fn decode_channel_state(
    actor: &ActorState,
    chain: Arc<dyn Chain>,
) -> Result<Box<dyn ChannelState>> {
    match actor.code.as_str() {
        PAYCH_ACTOR_CODE_V1 => {
            let raw: RawStateV1 = cbor::from_slice(&actor.state)
                .map_err(|e| ExchangeError::ChainRead(format!("actor state decode: {e}")))?;
            Ok(Box::new(ChannelStateV1 {
                raw,
                chain,
                lanes: Mutex::new(None),
            }))
        }
        other => Err(ExchangeError::ChainRead(format!(
            "unknown payment channel actor code {other}"
        ))),
    }
}

/// Read and decode the channel actor state at `addr`.
pub async fn load_channel_state(
    chain: Arc<dyn Chain>,
    addr: Address,
) -> Result<Box<dyn ChannelState>> {
    let actor = chain
        .state_read_actor(addr)
        .await
        .map_err(|e| ExchangeError::ChainRead(format!("actor at {addr}: {e}")))?;
    decode_channel_state(&actor, chain)
}

/// Serialize a v1 channel actor state. Lives here so chain fakes and decoder
/// stay in lockstep about the raw layout.
pub fn encode_state_v1(
    from: Address,
    to: Address,
    settling_at: i64,
    to_send: TokenAmount,
    lane_states: ContentId,
) -> Result<Vec<u8>> {
    cbor::to_vec(&RawStateV1 {
        from,
        to,
        settling_at,
        to_send,
        lane_states,
    })
}

/// Serialize a v1 lane state array for the chain object store.
pub fn encode_lanes_v1(lanes: &[(TokenAmount, u64)]) -> Result<Vec<u8>> {
    let raw: Vec<RawLaneStateV1> = lanes
        .iter()
        .map(|(redeemed, nonce)| RawLaneStateV1 {
            redeemed: *redeemed,
            nonce: *nonce,
        })
        .collect();
    cbor::to_vec(&raw)
}
