pub mod dispatch;
pub mod request;

pub use dispatch::{DispatchOptions, PRecord, Replication};
pub use request::{Request, RequestStream, REQUEST_PROTOCOL_ID, REQUEST_VOUCHER_TYPE};
