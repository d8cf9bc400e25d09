//! Domain errors

use thiserror::Error;

/// Domain result type
pub type Result<T> = std::result::Result<T, DomainError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Completion error: {0}")]
    Completion(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        DomainError::Protocol(err.to_string())
    }
}

impl From<base64::DecodeError> for DomainError {
    fn from(err: base64::DecodeError) -> Self {
        DomainError::Protocol(format!("invalid base64 payload: {}", err))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for DomainError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        DomainError::Connection(err.to_string())
    }
}

impl From<reqwest::Error> for DomainError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            DomainError::Connection(err.to_string())
        } else {
            DomainError::Completion(err.to_string())
        }
    }
}
