//! Error types for the copy routing engine.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("state store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("pool request failed (transient): {0}")]
    PoolTransient(String),

    #[error("pool rejected request: {message}")]
    PoolPermanent {
        message: String,
        status: Option<u16>,
    },

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("streaming connection error: {0}")]
    Streaming(String),
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Error::StoreUnavailable(e.to_string())
    }
}

impl Error {
    /// Whether a retry against the pool could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::PoolTransient(_) | Error::StoreUnavailable(_) | Error::Streaming(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
