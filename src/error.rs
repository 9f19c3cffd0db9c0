use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, ExchangeError>;

#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Deliberately uniform: callers never learn which check failed.
    #[error("Signature/verification failed")]
    Security,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("No trusted peer: {0}")]
    PeerNotFound(String),

    #[error("Offer not found: {0}")]
    OfferNotFound(Uuid),

    #[error("No open registration session for exchange: {0}")]
    SessionNotFound(String),

    #[error("Concurrent update detected for {entity} {id}")]
    VersionConflict { entity: &'static str, id: Uuid },
}

impl From<serde_json::Error> for ExchangeError {
    fn from(err: serde_json::Error) -> Self {
        ExchangeError::Serialization(err.to_string())
    }
}

impl From<uuid::Error> for ExchangeError {
    fn from(err: uuid::Error) -> Self {
        ExchangeError::Validation(err.to_string())
    }
}

impl From<std::io::Error> for ExchangeError {
    fn from(err: std::io::Error) -> Self {
        ExchangeError::Io(err.to_string())
    }
}

impl ExchangeError {
    /// True for errors that should abort startup rather than be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ExchangeError::Config(_))
    }
}
