//! Pool sizing and borrow behaviour

use std::time::Duration;

use crate::{PoolError, Result};

/// Default borrow timeout applied when the caller does not supply one.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Options for a single named pool.
///
/// Defaults: one resource minimum and maximum, no validation on borrow,
/// 30 second borrow timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolOptions {
    /// Resources created eagerly after the pool is registered
    pub min_size: usize,
    /// Upper bound on live resources (idle plus borrowed)
    pub max_size: usize,
    /// Run the factory's `validate` before lending an idle resource
    pub test_on_borrow: bool,
    /// How long a borrower waits for a free resource
    pub acquire_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 1,
            test_on_borrow: false,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }
}

impl PoolOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sizes(mut self, min_size: usize, max_size: usize) -> Self {
        self.min_size = min_size;
        self.max_size = max_size;
        self
    }

    pub fn with_test_on_borrow(mut self, test_on_borrow: bool) -> Self {
        self.test_on_borrow = test_on_borrow;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Reject sizes and timeouts the pool engine cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(PoolError::Config("max pool size must be greater than 0".to_string()));
        }
        if self.min_size > self.max_size {
            return Err(PoolError::Config(format!(
                "min pool size ({}) must not exceed max pool size ({})",
                self.min_size, self.max_size
            )));
        }
        if self.acquire_timeout.is_zero() {
            return Err(PoolError::Config("acquire timeout must be greater than zero".to_string()));
        }
        Ok(())
    }
}
