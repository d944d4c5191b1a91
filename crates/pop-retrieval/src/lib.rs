pub mod deal;
pub mod offer;
pub mod retrieval;
pub mod session;
pub mod strategy;

pub use deal::{
    Ask, DealParams, DealPayment, DealProposal, Query, QueryMessage, QueryResponse,
    DEAL_PAYMENT_VOUCHER_TYPE, DEAL_PROPOSAL_VOUCHER_TYPE, QUERY_PROTOCOL_ID,
};
pub use offer::{Offer, OfferMgr};
pub use retrieval::Retrieval;
pub use session::{Session, SessionEvent, SessionState, SessionStatus};
pub use strategy::{Decision, SelectCheapest, SelectFirst, SelectFirstLowerThan, Strategy};
