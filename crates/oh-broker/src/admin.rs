//! Broker management API client
//!
//! Typed list/has/create/delete operations for exchanges, bindings, policies
//! and federation upstreams. Every call borrows an invoker from a pooled HTTP
//! client (`http-broker-admin` by default), and a non-success status becomes
//! a named [`BrokerError::Admin`].
//!
//! `has_*` checks list and filter client-side.

use std::time::Duration;

use async_trait::async_trait;
use oh_pool::{HttpPool, HttpPoolConfig, HttpRequest, PoolRegistry};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::{BrokerError, Result};

pub const ADMIN_POOL_NAME: &str = "broker-admin";
pub const DEFAULT_PAGE_SIZE: u32 = 500;

// ============================================================================
// Resource models
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExchangeInfo {
    pub name: String,
    #[serde(default)]
    pub vhost: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub durable: bool,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default)]
    pub internal: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BindingInfo {
    pub source: String,
    pub destination: String,
    #[serde(default)]
    pub vhost: String,
    #[serde(default)]
    pub destination_type: String,
    #[serde(default)]
    pub routing_key: String,
    #[serde(default)]
    pub properties_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyInfo {
    pub name: String,
    #[serde(default)]
    pub vhost: String,
    #[serde(default)]
    pub pattern: String,
    #[serde(rename = "apply-to", default)]
    pub apply_to: String,
    #[serde(default)]
    pub definition: Value,
    #[serde(default)]
    pub priority: i64,
}

impl PolicyInfo {
    /// The federation upstream this policy applies, if any.
    pub fn federation_upstream(&self) -> Option<&str> {
        self.definition.get("federation-upstream").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FederationUpstreamInfo {
    pub name: String,
    #[serde(default)]
    pub vhost: String,
    #[serde(default)]
    pub component: String,
    #[serde(default)]
    pub value: Value,
}

// ============================================================================
// Create definitions
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeKind {
    Topic,
    Direct,
    Fanout,
    Headers,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Topic => "topic",
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Headers => "headers",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
}

impl ExchangeDefinition {
    pub fn durable_topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Topic,
            durable: true,
            auto_delete: false,
        }
    }

    fn body(&self) -> Value {
        json!({
            "type": self.kind.as_str(),
            "durable": self.durable,
            "auto_delete": self.auto_delete,
            "internal": false,
            "arguments": {}
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingDefinition {
    pub source: String,
    pub destination: String,
    pub routing_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDefinition {
    pub name: String,
    pub pattern: String,
    pub apply_to: String,
    pub federation_upstream: String,
    pub priority: i64,
}

impl PolicyDefinition {
    fn body(&self) -> Value {
        json!({
            "pattern": self.pattern,
            "apply-to": self.apply_to,
            "definition": { "federation-upstream": self.federation_upstream },
            "priority": self.priority
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamDefinition {
    pub name: String,
    pub uri: String,
    pub prefetch_count: u32,
    pub ack_mode: String,
    pub max_hops: u32,
    pub expires_ms: u64,
}

impl UpstreamDefinition {
    fn body(&self) -> Value {
        json!({
            "value": {
                "uri": self.uri,
                "prefetch-count": self.prefetch_count,
                "ack-mode": self.ack_mode,
                "max-hops": self.max_hops,
                "expires": self.expires_ms
            }
        })
    }
}

// ============================================================================
// Admin trait
// ============================================================================

/// Management operations the federation orchestrator depends on.
#[async_trait]
pub trait BrokerAdmin: Send + Sync {
    async fn list_exchanges(&self) -> Result<Vec<ExchangeInfo>>;
    async fn list_bindings(&self) -> Result<Vec<BindingInfo>>;
    async fn list_policies(&self) -> Result<Vec<PolicyInfo>>;
    async fn list_federation_upstreams(&self) -> Result<Vec<FederationUpstreamInfo>>;

    async fn has_exchange(&self, name: &str) -> Result<bool> {
        require("exchange name", name)?;
        Ok(self.list_exchanges().await?.iter().any(|e| e.name == name))
    }

    async fn has_exchange_binding(&self, source: &str, destination: &str, routing_key: &str) -> Result<bool> {
        require("binding source", source)?;
        require("binding destination", destination)?;
        require("binding routing key", routing_key)?;
        Ok(self
            .list_bindings()
            .await?
            .iter()
            .any(|b| b.source == source && b.destination == destination && b.routing_key == routing_key))
    }

    /// Matches on both the policy name and the upstream it applies.
    async fn has_policy(&self, name: &str, upstream: &str) -> Result<bool> {
        require("policy name", name)?;
        require("policy upstream", upstream)?;
        Ok(self
            .list_policies()
            .await?
            .iter()
            .any(|p| p.name == name && p.federation_upstream() == Some(upstream)))
    }

    async fn has_federation_upstream(&self, name: &str) -> Result<bool> {
        require("federation upstream name", name)?;
        Ok(self.list_federation_upstreams().await?.iter().any(|u| u.name == name))
    }

    async fn create_exchange(&self, definition: &ExchangeDefinition) -> Result<()>;
    async fn create_exchange_binding(&self, definition: &BindingDefinition) -> Result<()>;
    async fn create_policy(&self, definition: &PolicyDefinition) -> Result<()>;
    async fn create_federation_upstream(&self, definition: &UpstreamDefinition) -> Result<()>;

    async fn delete_exchange(&self, name: &str) -> Result<()>;
    async fn delete_exchange_binding(&self, definition: &BindingDefinition) -> Result<()>;
    async fn delete_policy(&self, name: &str) -> Result<()>;
    async fn delete_federation_upstream(&self, name: &str) -> Result<()>;
}

pub(crate) fn require(what: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(BrokerError::Validation(format!("{} is required", what)));
    }
    Ok(())
}

// ============================================================================
// HTTP implementation
// ============================================================================

/// Settings for [`BrokerAdminClient::create`].
#[derive(Debug, Clone)]
pub struct AdminSettings {
    /// Management API root, including `/api`
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub vhost: String,
    pub page_size: u32,
    pub timeout: Duration,
    pub min_pool_size: usize,
    pub max_pool_size: usize,
}

impl Default for AdminSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:15672/api".to_string(),
            username: "guest".to_string(),
            password: "guest".to_string(),
            vhost: "/".to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            timeout: Duration::from_secs(10),
            min_pool_size: 1,
            max_pool_size: 1,
        }
    }
}

/// Either RabbitMQ's paged envelope or a bare array.
#[derive(Deserialize)]
#[serde(untagged)]
enum Listing<T> {
    Paged {
        items: Vec<T>,
        #[serde(default)]
        page: u32,
        #[serde(default)]
        page_count: u32,
    },
    Plain(Vec<T>),
}

#[derive(Clone, Debug)]
pub struct BrokerAdminClient {
    http: HttpPool,
    vhost: String,
    page_size: u32,
}

impl BrokerAdminClient {
    pub fn new(http: HttpPool, vhost: impl Into<String>, page_size: u32) -> Self {
        Self {
            http,
            vhost: vhost.into(),
            page_size: page_size.max(1),
        }
    }

    /// Register the admin HTTP pool and build a client over it.
    pub fn create(registry: &PoolRegistry, settings: &AdminSettings) -> Result<Self> {
        let config = HttpPoolConfig::json(ADMIN_POOL_NAME, settings.base_url.clone())
            .with_basic_auth(settings.username.clone(), settings.password.clone())
            .with_timeout(settings.timeout)
            .with_sizes(settings.min_pool_size, settings.max_pool_size);
        let http = HttpPool::create(registry, &config)?;
        Ok(Self::new(http, settings.vhost.clone(), settings.page_size))
    }

    pub fn vhost(&self) -> &str {
        &self.vhost
    }

    /// Borrow an invoker, send the request, and turn a non-success status
    /// into `BrokerError::Admin` named after `operation`.
    pub async fn make_admin_request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<Value>,
        operation: &str,
    ) -> Result<reqwest::Response> {
        let mut request = HttpRequest::new(method, path);
        for (key, value) in query {
            request = request.with_query(*key, value.clone());
        }
        if let Some(body) = body {
            request = request.with_json(body);
        }

        let response = self.http.invoke(request).await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BrokerError::admin(operation, status.as_u16(), body));
        }
        Ok(response)
    }

    fn vhost_path(&self, collection: &str) -> String {
        format!("{}/{}", collection, urlencoding::encode(&self.vhost))
    }

    fn object_path(&self, collection: &str, name: &str) -> String {
        format!("{}/{}", self.vhost_path(collection), urlencoding::encode(name))
    }

    fn binding_path(&self, source: &str, destination: &str) -> String {
        format!(
            "{}/e/{}/e/{}",
            self.vhost_path("bindings"),
            urlencoding::encode(source),
            urlencoding::encode(destination)
        )
    }

    /// Only some management endpoints accept `page`/`page_size`; the others
    /// are fetched in one request.
    async fn list<T: DeserializeOwned>(&self, collection: &str, operation: &str, paged: bool) -> Result<Vec<T>> {
        let path = self.vhost_path(collection);
        let mut items = Vec::new();
        let mut page = 1u32;

        loop {
            let query = if paged {
                vec![("page", page.to_string()), ("page_size", self.page_size.to_string())]
            } else {
                Vec::new()
            };
            let response = self
                .make_admin_request(Method::GET, &path, &query, None, operation)
                .await?;
            let bytes = response.bytes().await?;

            match serde_json::from_slice::<Listing<T>>(&bytes)? {
                Listing::Plain(batch) => {
                    items.extend(batch);
                    break;
                }
                Listing::Paged {
                    items: batch,
                    page: current,
                    page_count,
                } => {
                    items.extend(batch);
                    let current = current.max(page);
                    if current >= page_count {
                        break;
                    }
                    page = current + 1;
                }
            }
        }

        debug!(collection, count = items.len(), "Listed broker objects");
        Ok(items)
    }
}

#[async_trait]
impl BrokerAdmin for BrokerAdminClient {
    async fn list_exchanges(&self) -> Result<Vec<ExchangeInfo>> {
        self.list("exchanges", "Exchange listing failed", true).await
    }

    async fn list_bindings(&self) -> Result<Vec<BindingInfo>> {
        self.list("bindings", "Binding listing failed", false).await
    }

    async fn list_policies(&self) -> Result<Vec<PolicyInfo>> {
        self.list("policies", "Policy listing failed", false).await
    }

    async fn list_federation_upstreams(&self) -> Result<Vec<FederationUpstreamInfo>> {
        self.list(
            "parameters/federation-upstream",
            "Federation upstream listing failed",
            false,
        )
        .await
    }

    async fn create_exchange(&self, definition: &ExchangeDefinition) -> Result<()> {
        require("exchange name", &definition.name)?;
        let path = self.object_path("exchanges", &definition.name);
        self.make_admin_request(Method::PUT, &path, &[], Some(definition.body()), "Exchange creation failed")
            .await?;
        info!(exchange = %definition.name, kind = definition.kind.as_str(), "Created exchange");
        Ok(())
    }

    async fn create_exchange_binding(&self, definition: &BindingDefinition) -> Result<()> {
        require("binding source", &definition.source)?;
        require("binding destination", &definition.destination)?;
        require("binding routing key", &definition.routing_key)?;
        let path = self.binding_path(&definition.source, &definition.destination);
        let body = json!({ "routing_key": definition.routing_key, "arguments": {} });
        self.make_admin_request(Method::POST, &path, &[], Some(body), "Exchange binding creation failed")
            .await?;
        info!(
            source = %definition.source,
            destination = %definition.destination,
            routing_key = %definition.routing_key,
            "Created exchange binding"
        );
        Ok(())
    }

    async fn create_policy(&self, definition: &PolicyDefinition) -> Result<()> {
        require("policy name", &definition.name)?;
        require("policy upstream", &definition.federation_upstream)?;
        let path = self.object_path("policies", &definition.name);
        self.make_admin_request(Method::PUT, &path, &[], Some(definition.body()), "Policy creation failed")
            .await?;
        info!(policy = %definition.name, pattern = %definition.pattern, "Created policy");
        Ok(())
    }

    async fn create_federation_upstream(&self, definition: &UpstreamDefinition) -> Result<()> {
        require("federation upstream name", &definition.name)?;
        require("federation upstream uri", &definition.uri)?;
        let path = self.object_path("parameters/federation-upstream", &definition.name);
        self.make_admin_request(
            Method::PUT,
            &path,
            &[],
            Some(definition.body()),
            "Federation upstream creation failed",
        )
        .await?;
        info!(upstream = %definition.name, "Created federation upstream");
        Ok(())
    }

    async fn delete_exchange(&self, name: &str) -> Result<()> {
        require("exchange name", name)?;
        let path = self.object_path("exchanges", name);
        self.make_admin_request(Method::DELETE, &path, &[], None, "Exchange deletion failed")
            .await?;
        Ok(())
    }

    async fn delete_exchange_binding(&self, definition: &BindingDefinition) -> Result<()> {
        // Bindings are addressed by properties key, so look it up first.
        let bindings = self.list_bindings().await?;
        let Some(binding) = bindings.iter().find(|b| {
            b.source == definition.source
                && b.destination == definition.destination
                && b.routing_key == definition.routing_key
        }) else {
            return Ok(());
        };

        let path = format!(
            "{}/{}",
            self.binding_path(&definition.source, &definition.destination),
            urlencoding::encode(&binding.properties_key)
        );
        self.make_admin_request(Method::DELETE, &path, &[], None, "Exchange binding deletion failed")
            .await?;
        Ok(())
    }

    async fn delete_policy(&self, name: &str) -> Result<()> {
        require("policy name", name)?;
        let path = self.object_path("policies", name);
        self.make_admin_request(Method::DELETE, &path, &[], None, "Policy deletion failed")
            .await?;
        Ok(())
    }

    async fn delete_federation_upstream(&self, name: &str) -> Result<()> {
        require("federation upstream name", name)?;
        let path = self.object_path("parameters/federation-upstream", name);
        self.make_admin_request(Method::DELETE, &path, &[], None, "Federation upstream deletion failed")
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listing_accepts_both_shapes() {
        let paged: Listing<ExchangeInfo> =
            serde_json::from_str(r#"{"items":[{"name":"a"}],"page":1,"page_count":2}"#).unwrap();
        assert!(matches!(paged, Listing::Paged { page_count: 2, .. }));

        let plain: Listing<ExchangeInfo> = serde_json::from_str(r#"[{"name":"a"},{"name":"b"}]"#).unwrap();
        assert!(matches!(plain, Listing::Plain(items) if items.len() == 2));
    }

    #[test]
    fn test_policy_upstream_lookup() {
        let policy: PolicyInfo = serde_json::from_value(json!({
            "name": "p-csa-t1",
            "pattern": "^from-csa-t1$",
            "apply-to": "exchanges",
            "definition": { "federation-upstream": "fu-csa-t1" }
        }))
        .unwrap();
        assert_eq!(policy.federation_upstream(), Some("fu-csa-t1"));
        assert_eq!(policy.apply_to, "exchanges");
    }

    #[test]
    fn test_upstream_body_uses_dashed_keys() {
        let body = UpstreamDefinition {
            name: "fu-csa-t1".to_string(),
            uri: "amqp://remote".to_string(),
            prefetch_count: 1000,
            ack_mode: "on-confirm".to_string(),
            max_hops: 1,
            expires_ms: 3_600_000,
        }
        .body();
        assert_eq!(body["value"]["prefetch-count"], 1000);
        assert_eq!(body["value"]["ack-mode"], "on-confirm");
        assert_eq!(body["value"]["max-hops"], 1);
    }

    #[test]
    fn test_require_rejects_blank() {
        assert!(matches!(require("exchange name", "  "), Err(BrokerError::Validation(_))));
        assert!(require("exchange name", "x").is_ok());
    }
}
