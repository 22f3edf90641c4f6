use thiserror::Error;

/// Errors surfaced by the store, the envelope routines and the limiter.
///
/// `NotFound` covers absent, expired and already-consumed records alike so a
/// caller can never tell whether a one-time item existed and was viewed.
#[derive(Debug, Error)]
pub enum Error {
    #[error("not found")]
    NotFound,

    #[error("invalid short code")]
    InvalidIdentifier,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("encryption failure: {0}")]
    Encryption(String),

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("too many requests")]
    RateLimited,

    #[error("random source unavailable")]
    Entropy,
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<redb::Error> for Error {
    fn from(e: redb::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<redb::DatabaseError> for Error {
    fn from(e: redb::DatabaseError) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<redb::TransactionError> for Error {
    fn from(e: redb::TransactionError) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<redb::TableError> for Error {
    fn from(e: redb::TableError) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<redb::StorageError> for Error {
    fn from(e: redb::StorageError) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<redb::CommitError> for Error {
    fn from(e: redb::CommitError) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<bincode::error::EncodeError> for Error {
    fn from(e: bincode::error::EncodeError) -> Self {
        Self::Storage(format!("encode record: {e}"))
    }
}

impl From<bincode::error::DecodeError> for Error {
    fn from(e: bincode::error::DecodeError) -> Self {
        Self::Storage(format!("decode record: {e}"))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Storage(e.to_string())
    }
}
