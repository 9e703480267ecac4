use thiserror::Error;

/// Broker error taxonomy. `code()` is what agents see in tool responses.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("cancelled: {0}")]
    Cancelled(String),
    #[error("session closed: {0}")]
    SessionClosed(String),
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("audio failure: {0}")]
    Audio(String),
    #[error("broker internal error: {0}")]
    Internal(String),
}

impl BrokerError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) | Self::SessionNotFound(_) => "invalid_request",
            Self::Cancelled(_) | Self::SessionClosed(_) => "cancelled",
            Self::Audio(_) | Self::Internal(_) => "internal",
        }
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;
