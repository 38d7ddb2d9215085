//! Federation Topology Orchestrator
//!
//! Provisions, per tenant, the four broker objects that relay the tenant's
//! events into the main exchange:
//!
//! | Object               | Name                       |
//! |----------------------|----------------------------|
//! | federation upstream  | `fu-csa-{tenant}`          |
//! | policy               | `p-csa-{tenant}`           |
//! | exchange             | `from-csa-{tenant}`        |
//! | binding → main       | `{tenant}.gql.{client}.#`  |
//!
//! Each step runs only when its existence check fails, so a retried call
//! resumes at whichever object is missing.

use std::sync::Arc;

use tracing::{debug, info};

use crate::admin::{
    require, BindingDefinition, BrokerAdmin, ExchangeDefinition, PolicyDefinition, UpstreamDefinition,
};
use crate::Result;

pub const FEDERATION_UPSTREAM_PREFIX: &str = "fu-csa-";
pub const POLICY_PREFIX: &str = "p-csa-";
pub const EXCHANGE_PREFIX: &str = "from-csa-";

pub const DEFAULT_UPSTREAM_PREFETCH_COUNT: u32 = 1000;
pub const DEFAULT_UPSTREAM_EXPIRES_MS: u64 = 3_600_000;
const UPSTREAM_ACK_MODE: &str = "on-confirm";
const UPSTREAM_MAX_HOPS: u32 = 1;

/// Deterministic object names for one tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantTopology {
    pub tenant_id: String,
    pub upstream_name: String,
    pub policy_name: String,
    pub exchange_name: String,
    /// Routing key of the tenant exchange → main exchange binding
    pub binding_pattern: String,
    /// Exchange-name pattern the policy applies to
    pub upstream_pattern: String,
}

impl TenantTopology {
    pub fn for_tenant(tenant_id: &str, client_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            upstream_name: format!("{}{}", FEDERATION_UPSTREAM_PREFIX, tenant_id),
            policy_name: format!("{}{}", POLICY_PREFIX, tenant_id),
            exchange_name: format!("{}{}", EXCHANGE_PREFIX, tenant_id),
            binding_pattern: format!("{}.gql.{}.#", tenant_id, client_id),
            upstream_pattern: format!("^{}{}$", EXCHANGE_PREFIX, tenant_id),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FederationSettings {
    pub client_id: String,
    /// Exchange tenant exchanges are bound into
    pub main_exchange: String,
    pub upstream_prefetch_count: u32,
    pub upstream_expires_ms: u64,
}

impl FederationSettings {
    pub fn new(client_id: impl Into<String>, main_exchange: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            main_exchange: main_exchange.into(),
            upstream_prefetch_count: DEFAULT_UPSTREAM_PREFETCH_COUNT,
            upstream_expires_ms: DEFAULT_UPSTREAM_EXPIRES_MS,
        }
    }
}

pub struct FederationOrchestrator {
    admin: Arc<dyn BrokerAdmin>,
    settings: FederationSettings,
}

impl FederationOrchestrator {
    pub fn new(admin: Arc<dyn BrokerAdmin>, settings: FederationSettings) -> Self {
        Self { admin, settings }
    }

    pub fn settings(&self) -> &FederationSettings {
        &self.settings
    }

    pub fn topology(&self, tenant_id: &str) -> TenantTopology {
        TenantTopology::for_tenant(tenant_id, &self.settings.client_id)
    }

    /// Create whatever part of the tenant's topology is missing.
    ///
    /// Steps run strictly in order: upstream, policy, exchange, binding. The
    /// first failure aborts the allocation; nothing is rolled back.
    pub async fn allocate_resources(&self, tenant_id: &str, connection_string: &str) -> Result<TenantTopology> {
        require("tenant id", tenant_id)?;
        require("connection string", connection_string)?;

        let topology = self.topology(tenant_id);
        let admin = self.admin.as_ref();
        let mut created = 0u32;

        if !admin.has_federation_upstream(&topology.upstream_name).await? {
            admin
                .create_federation_upstream(&UpstreamDefinition {
                    name: topology.upstream_name.clone(),
                    uri: connection_string.to_string(),
                    prefetch_count: self.settings.upstream_prefetch_count,
                    ack_mode: UPSTREAM_ACK_MODE.to_string(),
                    max_hops: UPSTREAM_MAX_HOPS,
                    expires_ms: self.settings.upstream_expires_ms,
                })
                .await?;
            created += 1;
        }

        if !admin
            .has_policy(&topology.policy_name, &topology.upstream_name)
            .await?
        {
            admin
                .create_policy(&PolicyDefinition {
                    name: topology.policy_name.clone(),
                    pattern: topology.upstream_pattern.clone(),
                    apply_to: "exchanges".to_string(),
                    federation_upstream: topology.upstream_name.clone(),
                    priority: 0,
                })
                .await?;
            created += 1;
        }

        if !admin.has_exchange(&topology.exchange_name).await? {
            admin
                .create_exchange(&ExchangeDefinition::durable_topic(&topology.exchange_name))
                .await?;
            created += 1;
        }

        let binding = self.binding(&topology);
        if !admin
            .has_exchange_binding(&binding.source, &binding.destination, &binding.routing_key)
            .await?
        {
            admin.create_exchange_binding(&binding).await?;
            created += 1;
        }

        if created > 0 {
            info!(tenant = %tenant_id, created, "Allocated federation resources");
        } else {
            debug!(tenant = %tenant_id, "Federation resources already present");
        }
        Ok(topology)
    }

    /// True when all four objects exist for the tenant.
    pub async fn is_federated(&self, tenant_id: &str) -> Result<bool> {
        require("tenant id", tenant_id)?;
        let topology = self.topology(tenant_id);
        let admin = self.admin.as_ref();
        let binding = self.binding(&topology);

        Ok(admin.has_federation_upstream(&topology.upstream_name).await?
            && admin.has_policy(&topology.policy_name, &topology.upstream_name).await?
            && admin.has_exchange(&topology.exchange_name).await?
            && admin
                .has_exchange_binding(&binding.source, &binding.destination, &binding.routing_key)
                .await?)
    }

    /// Remove the tenant's topology in reverse creation order. Objects that
    /// are already gone are skipped.
    pub async fn release_resources(&self, tenant_id: &str) -> Result<()> {
        require("tenant id", tenant_id)?;
        let topology = self.topology(tenant_id);
        let admin = self.admin.as_ref();
        let binding = self.binding(&topology);

        if admin
            .has_exchange_binding(&binding.source, &binding.destination, &binding.routing_key)
            .await?
        {
            admin.delete_exchange_binding(&binding).await?;
        }
        if admin.has_exchange(&topology.exchange_name).await? {
            admin.delete_exchange(&topology.exchange_name).await?;
        }
        if admin
            .has_policy(&topology.policy_name, &topology.upstream_name)
            .await?
        {
            admin.delete_policy(&topology.policy_name).await?;
        }
        if admin.has_federation_upstream(&topology.upstream_name).await? {
            admin.delete_federation_upstream(&topology.upstream_name).await?;
        }

        info!(tenant = %tenant_id, "Released federation resources");
        Ok(())
    }

    fn binding(&self, topology: &TenantTopology) -> BindingDefinition {
        BindingDefinition {
            source: topology.exchange_name.clone(),
            destination: self.settings.main_exchange.clone(),
            routing_key: topology.binding_pattern.clone(),
        }
    }
}
