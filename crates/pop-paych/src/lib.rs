pub mod chain;
pub mod funds;
pub mod manager;
pub mod state;
pub mod store;

pub use chain::{
    ActorState, Chain, CreateChannelParams, ExecReturn, Message, MsgLookup, MsgReceipt, Signature,
    SignedMessage, Wallet, PAYCH_ACTOR_CODE_V1,
};
pub use funds::{FundsHandle, FundsRes};
pub use manager::{PaychMgr, VoucherCreateResult};
pub use state::{load_channel_state, ChannelState, LaneState};
pub use store::{
    ChannelDirection, ChannelInfo, LaneMerge, MemoryPaychBackend, PaychBackend, PaychStore,
    Voucher, VoucherInfo,
};
