use serde::{Deserialize, Serialize};

use pop_paych::Voucher;
use pop_types::{Address, ContentId, RegionCode, Selector, TokenAmount};

/// Voucher type opening a paid retrieval pull.
pub const DEAL_PROPOSAL_VOUCHER_TYPE: &str = "RetrievalDealProposal";

/// Voucher type carrying a signed payment-channel voucher mid-transfer.
pub const DEAL_PAYMENT_VOUCHER_TYPE: &str = "RetrievalDealPayment";

/// Protocol for offer queries and their responses.
pub const QUERY_PROTOCOL_ID: &str = "/myel/pop/query/1.0";

/// Commercial terms of a retrieval deal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealParams {
    pub price_per_byte: TokenAmount,
    pub payment_interval: u64,
    pub payment_interval_increase: u64,
    pub unseal_price: TokenAmount,
}

/// The terms a provider serves content under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ask {
    pub price_per_byte: TokenAmount,
    pub payment_interval: u64,
    pub payment_interval_increase: u64,
    pub unseal_price: TokenAmount,
}

impl Default for Ask {
    fn default() -> Self {
        Self {
            price_per_byte: TokenAmount::ZERO,
            payment_interval: 1 << 20,
            payment_interval_increase: 1 << 20,
            unseal_price: TokenAmount::ZERO,
        }
    }
}

impl Ask {
    pub fn params(&self) -> DealParams {
        DealParams {
            price_per_byte: self.price_per_byte,
            payment_interval: self.payment_interval,
            payment_interval_increase: self.payment_interval_increase,
            unseal_price: self.unseal_price,
        }
    }
}

/// Proposal presented on the transport channel to open a retrieval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealProposal {
    pub payload_cid: ContentId,
    pub selector: Selector,
    pub params: DealParams,
}

/// A signed payment voucher sent mid-transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealPayment {
    pub channel_addr: Address,
    pub voucher: Voucher,
}

/// Gossip query for providers of a root, scoped by region codes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub payload_cid: ContentId,
    pub regions: Vec<RegionCode>,
}

/// A provider's answer: its terms for serving the root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub payload_cid: ContentId,
    pub size: u64,
    pub unseal_price: TokenAmount,
    pub price_per_byte: TokenAmount,
    pub payment_interval: u64,
    pub payment_interval_increase: u64,
    /// Address payment vouchers should be funded toward.
    pub payment_address: Address,
}

impl QueryResponse {
    /// Total price for retrieving the full piece.
    pub fn piece_retrieval_price(&self) -> TokenAmount {
        self.price_per_byte
            .checked_mul(self.size)
            .unwrap_or(TokenAmount::ZERO)
            .saturating_add(self.unseal_price)
    }
}

/// Envelope spoken on the query protocol: a direct ask, or a pushed answer
/// to an earlier gossip query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QueryMessage {
    Query(Query),
    Response(QueryResponse),
}
