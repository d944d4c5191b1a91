use crate::amount::TokenAmount;
use crate::content::ContentId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not authorized: {0}")]
    Unauthorized(String),

    #[error("insufficient channel funds, shortfall {shortfall}")]
    Insufficient { shortfall: TokenAmount },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("message {mcid} rejected on chain (exit code {exit_code})")]
    ChainReject { mcid: ContentId, exit_code: i64 },

    #[error("chain read failed: {0}")]
    ChainRead(String),

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExchangeError {
    /// Whether the failure is worth retrying on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, ExchangeError::Transient(_) | ExchangeError::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, ExchangeError>;
