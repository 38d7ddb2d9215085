//! Outbound HTTP pool adapter
//!
//! The pooled resource is an [`HttpInvoker`]: a reqwest client bound to a base
//! URL, default headers and optional Basic credentials. A configuration
//! without a `Content-Type` default header is rejected when the pool is
//! created rather than on the first request.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Method, Response};
use tracing::debug;

use crate::factory::ResourceFactory;
use crate::options::PoolOptions;
use crate::pool::Pool;
use crate::registry::PoolRegistry;
use crate::{PoolError, Result};

pub const HTTP_POOL_PREFIX: &str = "http-";
pub const DEFAULT_HTTP_MIN_POOL_SIZE: usize = 1;
pub const DEFAULT_HTTP_MAX_POOL_SIZE: usize = 1;
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

/// One outbound request relative to the invoker's base URL.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

impl HttpRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_json(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// Reusable callable bound to a base URL and default headers.
#[derive(Debug, Clone)]
pub struct HttpInvoker {
    client: Client,
    base_url: String,
    headers: HeaderMap,
    basic_auth: Option<BasicAuth>,
}

impl HttpInvoker {
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn url_for(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        if path.is_empty() {
            self.base_url.clone()
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    pub async fn invoke(&self, request: HttpRequest) -> Result<Response> {
        let url = self.url_for(&request.path);
        let mut builder = self
            .client
            .request(request.method.clone(), &url)
            .headers(self.headers.clone());

        if let Some(auth) = &self.basic_auth {
            builder = builder.basic_auth(&auth.username, Some(&auth.password));
        }
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.body(serde_json::to_vec(body).map_err(|e| {
                PoolError::Operation(format!("failed to encode request body: {}", e))
            })?);
        }

        debug!(method = %request.method, url = %url, "Invoking HTTP request");
        Ok(builder.send().await?)
    }
}

/// Settings for an HTTP pool; sizes default to 1/1.
#[derive(Debug, Clone)]
pub struct HttpPoolConfig {
    pub name: String,
    pub base_url: String,
    pub default_headers: Vec<(String, String)>,
    pub basic_auth: Option<BasicAuth>,
    pub timeout: Duration,
    pub min_pool_size: Option<usize>,
    pub max_pool_size: Option<usize>,
}

impl HttpPoolConfig {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            default_headers: Vec::new(),
            basic_auth: None,
            timeout: DEFAULT_HTTP_TIMEOUT,
            min_pool_size: None,
            max_pool_size: None,
        }
    }

    /// Convenience for the common JSON case.
    pub fn json(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self::new(name, base_url).with_header("Content-Type", "application/json")
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.push((name.into(), value.into()));
        self
    }

    pub fn with_basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.basic_auth = Some(BasicAuth {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_sizes(mut self, min: usize, max: usize) -> Self {
        self.min_pool_size = Some(min);
        self.max_pool_size = Some(max);
        self
    }

    fn header_map(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.default_headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| PoolError::Config(format!("invalid header name '{}': {}", name, e)))?;
            let header_value = HeaderValue::from_str(value)
                .map_err(|e| PoolError::Config(format!("invalid value for header '{}': {}", name, e)))?;
            headers.insert(header_name, header_value);
        }

        if !headers.contains_key(CONTENT_TYPE) {
            return Err(PoolError::Config(format!(
                "HTTP pool '{}' must declare a Content-Type default header",
                self.name
            )));
        }
        Ok(headers)
    }

    fn pool_options(&self) -> PoolOptions {
        PoolOptions::new().with_sizes(
            self.min_pool_size.unwrap_or(DEFAULT_HTTP_MIN_POOL_SIZE),
            self.max_pool_size.unwrap_or(DEFAULT_HTTP_MAX_POOL_SIZE),
        )
    }
}

/// Builds invokers for a pool.
pub struct HttpInvokerFactory {
    base_url: String,
    headers: HeaderMap,
    basic_auth: Option<BasicAuth>,
    timeout: Duration,
}

impl HttpInvokerFactory {
    pub fn from_config(config: &HttpPoolConfig) -> Result<Self> {
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            headers: config.header_map()?,
            basic_auth: config.basic_auth.clone(),
            timeout: config.timeout,
        })
    }
}

#[async_trait]
impl ResourceFactory for HttpInvokerFactory {
    type Resource = HttpInvoker;

    async fn create(&self) -> Result<HttpInvoker> {
        let client = Client::builder().timeout(self.timeout).build()?;
        Ok(HttpInvoker {
            client,
            base_url: self.base_url.clone(),
            headers: self.headers.clone(),
            basic_auth: self.basic_auth.clone(),
        })
    }

    async fn destroy(&self, resource: HttpInvoker) {
        drop(resource);
    }
}

/// Handle to a registered HTTP pool.
#[derive(Clone, Debug)]
pub struct HttpPool {
    pool: Pool<HttpInvoker>,
}

impl HttpPool {
    pub fn create(registry: &PoolRegistry, config: &HttpPoolConfig) -> Result<Self> {
        let factory = HttpInvokerFactory::from_config(config)?;
        let name = format!("{}{}", HTTP_POOL_PREFIX, config.name);
        let pool = registry.create_pool(factory, &name, config.pool_options())?;
        Ok(Self { pool })
    }

    pub fn get(registry: &PoolRegistry, name: &str) -> Result<Self> {
        let pool = registry.get_pool(&format!("{}{}", HTTP_POOL_PREFIX, name))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<HttpInvoker> {
        &self.pool
    }

    /// Borrow an invoker, send the request, release. Transport errors come
    /// back after the invoker has been returned.
    pub async fn invoke(&self, request: HttpRequest) -> Result<Response> {
        let invoker = self.pool.acquire().await?;
        let result = invoker.invoke(request).await;
        drop(invoker);
        result
    }
}
