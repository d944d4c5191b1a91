pub mod hey;
pub mod manager;

pub use hey::{Hey, HeyService, HEY_PROTOCOL_ID, HEY_VERSION};
pub use manager::{PeerEntry, PeerEvent, PeerMgr};
