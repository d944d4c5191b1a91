//! In-memory stand-ins for the external collaborators: a mocknet-style host
//! registry, a scripted chain RPC, a deterministic wallet, and a
//! data-transfer hub that actually moves blocks between stores.

pub mod chain;
pub mod net;
pub mod transport;

pub use chain::{MemChain, TestWallet};
pub use net::{MemHub, MemNet};
pub use transport::{MemTransport, PaymentScript, TransportHub};
