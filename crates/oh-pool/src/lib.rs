//! Ohana Resource Pools
//!
//! This crate provides the pooling layer every external backend goes through:
//! - PoolRegistry: named pool store; one pool per name for the process lifetime
//! - Pool: bounded, lazily filled pool with borrow timeout and test-on-borrow
//! - ResourceFactory / FactoryBuilder: create/validate/destroy callbacks
//! - Adapters: PostgreSQL (`db-`), Redis (`redis-`) and outbound HTTP (`http-`)

pub mod adapters;
pub mod error;
pub mod factory;
pub mod options;
pub mod pool;
pub mod registry;

pub use error::PoolError;
pub use factory::{FactoryBuilder, FnFactory, ResourceFactory};
pub use options::{PoolOptions, DEFAULT_ACQUIRE_TIMEOUT};
pub use pool::{Pool, PoolStatus, Pooled};
pub use registry::PoolRegistry;

#[cfg(feature = "database")]
pub use adapters::database::{DatabaseConnection, DatabasePool, DatabasePoolConfig, SqlParam};

#[cfg(feature = "cache")]
pub use adapters::cache::{CacheConnection, CachePool, CachePoolConfig};

#[cfg(feature = "http")]
pub use adapters::http::{HttpInvoker, HttpPool, HttpPoolConfig, HttpRequest};

pub type Result<T> = std::result::Result<T, PoolError>;
