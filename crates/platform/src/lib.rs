//! Rollout platform client: the applications, tenants, entitlements and gateway
//! services behind one trait, with typed records decoded once at the boundary.

#![forbid(unsafe_code)]

use anyhow::Result;
use rollout_core::{ApplicationDescriptor, CapabilitySet, DiscoveryEntry, Entitlement, Role, Tenant, User};
use serde::{Deserialize, Serialize};

mod http;
pub mod mock;

pub use http::HttpPlatform;
pub use mock::{Call, MockPlatform};

pub const GATEWAY_PORT: u16 = 8000;
pub const APPLICATIONS_PORT: u16 = 9901;
pub const TENANTS_PORT: u16 = 9902;
pub const TENANT_ENTITLEMENTS_PORT: u16 = 9903;

pub const TENANT_HEADER: &str = "X-Okapi-Tenant";
pub const TOKEN_HEADER: &str = "X-Okapi-Token";

/// Entry of a module registry listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryModule {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationSummary {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
}

/// Platform user record as listed by the users service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    pub username: String,
}

/// Tenant-scoped credentials for gateway-fronted endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantSession {
    pub tenant: String,
    pub token: String,
}

impl TenantSession {
    pub fn new(tenant: &str, token: &str) -> Self {
        Self { tenant: tenant.to_string(), token: token.to_string() }
    }
}

/// Supplies access tokens for a tenant. Acquisition itself happens elsewhere.
#[async_trait::async_trait]
pub trait TokenSource: Send + Sync {
    async fn access_token(&self, tenant: &str) -> Result<String>;
}

/// A single token used for every tenant.
pub struct StaticToken(pub String);

#[async_trait::async_trait]
impl TokenSource for StaticToken {
    async fn access_token(&self, _tenant: &str) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Platform services used by the rollout. Every call is a single request/response.
#[async_trait::async_trait]
pub trait PlatformApi: Send + Sync {
    // Module registries
    async fn registry_modules(&self, registry_url: &str) -> Result<Vec<RegistryModule>>;
    async fn module_descriptor(&self, url: &str) -> Result<serde_json::Value>;

    // Applications and discovery
    async fn list_applications(&self) -> Result<Vec<ApplicationSummary>>;
    /// Create with the duplicate check enabled (`check=true`).
    async fn create_application(&self, descriptor: &ApplicationDescriptor) -> Result<()>;
    async fn delete_application(&self, id: &str) -> Result<()>;
    async fn create_discovery(&self, entries: &[DiscoveryEntry]) -> Result<()>;
    /// Full replace of one module's discovery record.
    async fn replace_discovery(&self, entry: &DiscoveryEntry) -> Result<()>;

    // Tenants and entitlements
    async fn list_tenants(&self) -> Result<Vec<Tenant>>;
    async fn create_tenant(&self, name: &str, description: &str) -> Result<()>;
    async fn delete_tenant(&self, id: &str) -> Result<()>;
    async fn create_entitlement(&self, entitlement: &Entitlement, tenant_parameters: &str) -> Result<()>;
    async fn delete_entitlement(&self, entitlement: &Entitlement) -> Result<()>;

    // Roles and capability sets
    async fn list_roles(&self, session: &TenantSession) -> Result<Vec<Role>>;
    async fn find_roles_by_name(&self, session: &TenantSession, name: &str) -> Result<Vec<Role>>;
    async fn create_role(&self, session: &TenantSession, name: &str, description: &str) -> Result<()>;
    async fn delete_role(&self, session: &TenantSession, id: &str) -> Result<()>;
    async fn capability_sets_for_application(&self, session: &TenantSession, application_id: &str) -> Result<Vec<CapabilitySet>>;
    async fn find_capability_sets_by_name(&self, session: &TenantSession, name: &str) -> Result<Vec<CapabilitySet>>;
    async fn detach_role_capability_sets(&self, session: &TenantSession, role_id: &str) -> Result<()>;
    async fn attach_role_capability_sets(&self, session: &TenantSession, role_id: &str, capability_set_ids: &[String]) -> Result<()>;

    // Users
    async fn list_users(&self, session: &TenantSession) -> Result<Vec<UserRecord>>;
    /// Returns the id of the created user.
    async fn create_user(&self, session: &TenantSession, user: &User) -> Result<String>;
    async fn delete_user(&self, session: &TenantSession, id: &str) -> Result<()>;
    async fn attach_credentials(&self, session: &TenantSession, user_id: &str, username: &str, password: &str) -> Result<()>;
    async fn attach_user_roles(&self, session: &TenantSession, user_id: &str, role_ids: &[String]) -> Result<()>;
}
