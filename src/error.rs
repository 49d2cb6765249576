use redis::RedisError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    /// The store is unreachable or rejected the command. Never retried here.
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session metadata is missing field '{field}'")]
    MissingField { field: &'static str },

    #[error("Session metadata field '{field}' has invalid value '{value}'")]
    InvalidField { field: &'static str, value: String },

    #[error("Session manager has been stopped")]
    Closed,
}

impl SessionError {
    /// True when the store could not be reached. A stopped manager is not a connectivity
    /// failure; retrying it never succeeds.
    pub fn is_connectivity(&self) -> bool {
        match self {
            SessionError::Redis(e) => {
                e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
            }
            _ => false,
        }
    }
}
