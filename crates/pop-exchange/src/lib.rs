pub mod config;
pub mod exchange;

pub use config::{DispatchConfig, Options};
pub use exchange::Exchange;
