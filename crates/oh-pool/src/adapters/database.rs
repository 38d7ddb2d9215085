//! PostgreSQL pool adapter
//!
//! Each pooled resource is one `PgConnection`. A statement that fails at the
//! transport level (I/O, TLS, protocol) flags the connection unhealthy so the
//! next borrow replaces it.

use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use oh_common::HealthFlag;
use sqlx::postgres::{PgConnection, PgRow};
use sqlx::Connection;
use tracing::{debug, warn};

use crate::factory::ResourceFactory;
use crate::options::PoolOptions;
use crate::pool::Pool;
use crate::registry::PoolRegistry;
use crate::{PoolError, Result};

pub const DATABASE_POOL_PREFIX: &str = "db-";
pub const DEFAULT_DATABASE_MIN_POOL_SIZE: usize = 5;
pub const DEFAULT_DATABASE_MAX_POOL_SIZE: usize = 10;

/// Positional statement parameter (`$1`, `$2`, ...).
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
}

impl From<&str> for SqlParam {
    fn from(value: &str) -> Self {
        SqlParam::Text(value.to_string())
    }
}

impl From<String> for SqlParam {
    fn from(value: String) -> Self {
        SqlParam::Text(value)
    }
}

impl From<i64> for SqlParam {
    fn from(value: i64) -> Self {
        SqlParam::Int(value)
    }
}

impl From<bool> for SqlParam {
    fn from(value: bool) -> Self {
        SqlParam::Bool(value)
    }
}

/// A pooled database connection with its health flag.
pub struct DatabaseConnection {
    conn: PgConnection,
    health: HealthFlag,
}

impl DatabaseConnection {
    /// Raw connection for statements the helpers below do not cover
    /// (e.g. BEGIN/COMMIT around several statements).
    pub fn connection(&mut self) -> &mut PgConnection {
        &mut self.conn
    }

    pub fn health(&self) -> &HealthFlag {
        &self.health
    }

    pub async fn query(&mut self, sql: &str, params: &[SqlParam]) -> Result<Vec<PgRow>> {
        let result = bind_params(sqlx::query(sql), params)
            .fetch_all(&mut self.conn)
            .await;
        self.observe(result)
    }

    pub async fn execute(&mut self, sql: &str, params: &[SqlParam]) -> Result<u64> {
        let result = bind_params(sqlx::query(sql), params)
            .execute(&mut self.conn)
            .await
            .map(|done| done.rows_affected());
        self.observe(result)
    }

    /// Flag the connection when a failure means the socket is no longer usable.
    fn observe<T>(&self, result: std::result::Result<T, sqlx::Error>) -> Result<T> {
        result.map_err(|e| {
            if is_transport_error(&e) {
                warn!(error = %e, "Database connection failed, marking unhealthy");
                self.health.mark_unhealthy();
            }
            PoolError::Database(e)
        })
    }
}

fn is_transport_error(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::WorkerCrashed
    )
}

fn bind_params<'q>(
    mut query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    params: &[SqlParam],
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    for param in params {
        query = match param {
            SqlParam::Text(value) => query.bind(value.clone()),
            SqlParam::Int(value) => query.bind(*value),
            SqlParam::Float(value) => query.bind(*value),
            SqlParam::Bool(value) => query.bind(*value),
            SqlParam::Null => query.bind(Option::<String>::None),
        };
    }
    query
}

/// Opens PostgreSQL connections for a pool.
pub struct DatabaseFactory {
    connection_string: String,
}

impl DatabaseFactory {
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
        }
    }
}

#[async_trait]
impl ResourceFactory for DatabaseFactory {
    type Resource = DatabaseConnection;

    async fn create(&self) -> Result<DatabaseConnection> {
        let conn = PgConnection::connect(&self.connection_string).await?;
        Ok(DatabaseConnection {
            conn,
            health: HealthFlag::new(),
        })
    }

    fn validate(&self, resource: &DatabaseConnection) -> bool {
        resource.health.is_healthy()
    }

    async fn destroy(&self, resource: DatabaseConnection) {
        if let Err(e) = resource.conn.close().await {
            debug!(error = %e, "Error closing database connection");
        }
    }
}

/// Settings for a database pool; sizes default to 5/10.
#[derive(Debug, Clone)]
pub struct DatabasePoolConfig {
    pub name: String,
    pub connection_string: String,
    pub min_pool_size: Option<usize>,
    pub max_pool_size: Option<usize>,
    pub acquire_timeout: Option<Duration>,
}

impl DatabasePoolConfig {
    pub fn new(name: impl Into<String>, connection_string: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connection_string: connection_string.into(),
            min_pool_size: None,
            max_pool_size: None,
            acquire_timeout: None,
        }
    }

    pub fn with_sizes(mut self, min: usize, max: usize) -> Self {
        self.min_pool_size = Some(min);
        self.max_pool_size = Some(max);
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }

    fn pool_options(&self) -> PoolOptions {
        let mut options = PoolOptions::new()
            .with_sizes(
                self.min_pool_size.unwrap_or(DEFAULT_DATABASE_MIN_POOL_SIZE),
                self.max_pool_size.unwrap_or(DEFAULT_DATABASE_MAX_POOL_SIZE),
            )
            .with_test_on_borrow(true);
        if let Some(timeout) = self.acquire_timeout {
            options = options.with_acquire_timeout(timeout);
        }
        options
    }
}

/// Handle to a registered database pool.
#[derive(Clone, Debug)]
pub struct DatabasePool {
    pool: Pool<DatabaseConnection>,
}

impl DatabasePool {
    pub fn create(registry: &PoolRegistry, config: &DatabasePoolConfig) -> Result<Self> {
        let name = format!("{}{}", DATABASE_POOL_PREFIX, config.name);
        let pool = registry.create_pool(
            DatabaseFactory::new(config.connection_string.clone()),
            &name,
            config.pool_options(),
        )?;
        Ok(Self { pool })
    }

    pub fn get(registry: &PoolRegistry, name: &str) -> Result<Self> {
        let pool = registry.get_pool(&format!("{}{}", DATABASE_POOL_PREFIX, name))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<DatabaseConnection> {
        &self.pool
    }

    /// Borrow, run one statement returning rows, release.
    pub async fn query(&self, sql: &str, params: &[SqlParam]) -> Result<Vec<PgRow>> {
        let mut conn = self.pool.acquire().await?;
        let result = conn.query(sql, params).await;
        drop(conn);
        result
    }

    /// Borrow, run one statement returning the affected row count, release.
    pub async fn execute(&self, sql: &str, params: &[SqlParam]) -> Result<u64> {
        let mut conn = self.pool.acquire().await?;
        let result = conn.execute(sql, params).await;
        drop(conn);
        result
    }

    /// Borrow one connection for several statements. The connection is
    /// returned before the closure's error is handed back.
    pub async fn with_connection<T, F>(&self, operation: F) -> Result<T>
    where
        F: for<'c> FnOnce(&'c mut DatabaseConnection) -> BoxFuture<'c, Result<T>>,
    {
        let mut conn = self.pool.acquire().await?;
        let result = operation(&mut *conn).await;
        drop(conn);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_sizes() {
        let options = DatabasePoolConfig::new("main", "postgres://localhost/db").pool_options();
        assert_eq!(options.min_size, 5);
        assert_eq!(options.max_size, 10);
        assert!(options.test_on_borrow);
    }

    #[test]
    fn test_transport_errors_classified() {
        let io = sqlx::Error::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"));
        assert!(is_transport_error(&io));
        assert!(!is_transport_error(&sqlx::Error::RowNotFound));
    }

    #[test]
    fn test_param_conversions() {
        assert_eq!(SqlParam::from("a"), SqlParam::Text("a".to_string()));
        assert_eq!(SqlParam::from(3i64), SqlParam::Int(3));
        assert_eq!(SqlParam::from(true), SqlParam::Bool(true));
    }
}
