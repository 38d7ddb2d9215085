use oh_pool::PoolError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Broker connection error: {0}")]
    Connection(String),

    #[error("Broker channel error: {0}")]
    Channel(String),

    /// A management API call answered with a non-success status.
    #[error("{operation} (HTTP {status}): {body}")]
    Admin {
        operation: String,
        status: u16,
        body: String,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Dispatch error: {0}")]
    Dispatch(String),
}

impl BrokerError {
    pub fn admin(operation: impl Into<String>, status: u16, body: impl Into<String>) -> Self {
        BrokerError::Admin {
            operation: operation.into(),
            status,
            body: body.into(),
        }
    }

    /// Errors that mean the channel or its connection can no longer be used.
    pub fn is_transport(&self) -> bool {
        matches!(self, BrokerError::Connection(_) | BrokerError::Channel(_))
    }
}
