use thiserror::Error;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Resource unavailable: no pool named '{0}' has been created")]
    Unavailable(String),

    #[error("Pool '{0}' holds a different resource type")]
    TypeMismatch(String),

    #[error("Timed out after {timeout_ms}ms waiting for a resource from pool '{name}'")]
    Timeout { name: String, timeout_ms: u64 },

    #[error("Pool '{0}' has been drained")]
    Closed(String),

    #[error("Failed to create resource for pool '{name}': {reason}")]
    Create { name: String, reason: String },

    #[error("Operation failed: {0}")]
    Operation(String),

    #[cfg(feature = "database")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[cfg(feature = "cache")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[cfg(feature = "http")]
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl PoolError {
    pub fn create(name: &str, reason: impl std::fmt::Display) -> Self {
        PoolError::Create {
            name: name.to_string(),
            reason: reason.to_string(),
        }
    }
}
