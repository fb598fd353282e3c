use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("parent block not found")]
    ParentNotFound,
    #[error("invalid block")]
    InvalidBlock,
    #[error("unknown block producer")]
    UnknownProducer,
    #[error("invalid block producer")]
    InvalidProducer,
    #[error("query expired")]
    QueryExpired,
    #[error("response not found")]
    ResponseNotFound,
    #[error("storage error: {0}")]
    Storage(#[from] rocksdb::Error),
    #[error("encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("state error: {0}")]
    State(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("cryptography error: {0}")]
    Crypto(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl ChainError {
    /// Cancellation never surfaces as a close error from `Chain::stop` and is
    /// only logged at debug level.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ChainError::Cancelled)
    }
}

pub type ChainResult<T> = Result<T, ChainError>;
