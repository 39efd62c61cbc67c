//! In-memory platform for tests: serves seeded records and records every mutation.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use rollout_core::{ApplicationDescriptor, CapabilitySet, DiscoveryEntry, Entitlement, Role, Tenant, User};

use crate::{ApplicationSummary, PlatformApi, RegistryModule, TenantSession, UserRecord};

/// Mutating calls observed by the mock, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    CreateApplication(ApplicationDescriptor),
    DeleteApplication(String),
    CreateDiscovery(Vec<DiscoveryEntry>),
    ReplaceDiscovery(DiscoveryEntry),
    CreateTenant(String),
    DeleteTenant(String),
    CreateEntitlement { entitlement: Entitlement, tenant_parameters: String },
    DeleteEntitlement(Entitlement),
    CreateRole { tenant: String, name: String },
    DeleteRole { tenant: String, id: String },
    DetachCapabilitySets { tenant: String, role_id: String },
    AttachCapabilitySets { tenant: String, role_id: String, ids: Vec<String> },
    CreateUser { tenant: String, username: String },
    DeleteUser { tenant: String, id: String },
    AttachCredentials { tenant: String, user_id: String },
    AttachUserRoles { tenant: String, user_id: String, role_ids: Vec<String> },
}

#[derive(Default)]
struct MockState {
    registries: BTreeMap<String, Vec<RegistryModule>>,
    descriptors: BTreeMap<String, serde_json::Value>,
    applications: Vec<ApplicationSummary>,
    tenants: Vec<Tenant>,
    roles: BTreeMap<String, Vec<Role>>,
    capability_sets: BTreeMap<String, Vec<CapabilitySet>>,
    users: BTreeMap<String, Vec<UserRecord>>,
    failing: BTreeSet<&'static str>,
    calls: Vec<Call>,
}

/// Simple in-memory mock implementation for tests.
#[derive(Default)]
pub struct MockPlatform {
    state: Mutex<MockState>,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state(self, f: impl FnOnce(&mut MockState)) -> Self {
        f(&mut self.state.lock().unwrap());
        self
    }

    pub fn with_registry(self, url: &str, ids: &[&str]) -> Self {
        let modules = ids.iter().map(|id| RegistryModule { id: (*id).to_string(), action: None }).collect();
        self.with_state(|s| {
            s.registries.insert(url.to_string(), modules);
        })
    }

    pub fn with_descriptor(self, url: &str, descriptor: serde_json::Value) -> Self {
        self.with_state(|s| {
            s.descriptors.insert(url.to_string(), descriptor);
        })
    }

    pub fn with_application(self, id: &str) -> Self {
        self.with_state(|s| s.applications.push(ApplicationSummary { id: id.to_string(), name: String::new(), version: String::new() }))
    }

    pub fn with_tenant(self, id: &str, name: &str) -> Self {
        self.with_state(|s| s.tenants.push(Tenant { id: id.to_string(), name: name.to_string(), description: None }))
    }

    pub fn with_role(self, tenant: &str, id: &str, name: &str) -> Self {
        self.with_state(|s| {
            s.roles.entry(tenant.to_string()).or_default().push(Role { id: id.to_string(), name: name.to_string(), description: None })
        })
    }

    pub fn with_capability_set(self, tenant: &str, id: &str, name: &str, application_id: &str) -> Self {
        self.with_state(|s| {
            s.capability_sets.entry(tenant.to_string()).or_default().push(CapabilitySet {
                id: id.to_string(),
                name: name.to_string(),
                application_id: application_id.to_string(),
            })
        })
    }

    pub fn with_user(self, tenant: &str, id: &str, username: &str) -> Self {
        self.with_state(|s| {
            s.users.entry(tenant.to_string()).or_default().push(UserRecord { id: id.to_string(), username: username.to_string() })
        })
    }

    /// Make the named operation (trait method name) fail with an error.
    pub fn failing(self, op: &'static str) -> Self {
        self.with_state(|s| {
            s.failing.insert(op);
        })
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    fn check(state: &MockState, op: &'static str) -> Result<()> {
        if state.failing.contains(op) {
            return Err(anyhow!("{} failed: injected error", op));
        }
        Ok(())
    }

    fn record(&self, op: &'static str, call: Call) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        Self::check(&s, op)?;
        s.calls.push(call);
        Ok(())
    }

    fn read<T>(&self, op: &'static str, f: impl FnOnce(&MockState) -> T) -> Result<T> {
        let s = self.state.lock().unwrap();
        Self::check(&s, op)?;
        Ok(f(&s))
    }
}

#[async_trait::async_trait]
impl PlatformApi for MockPlatform {
    async fn registry_modules(&self, registry_url: &str) -> Result<Vec<RegistryModule>> {
        self.read("registry_modules", |s| s.registries.get(registry_url).cloned().unwrap_or_default())
    }

    async fn module_descriptor(&self, url: &str) -> Result<serde_json::Value> {
        self.read("module_descriptor", |s| s.descriptors.get(url).cloned())?
            .ok_or_else(|| anyhow!("fetch module descriptor returned 404 Not Found: {}", url))
    }

    async fn list_applications(&self) -> Result<Vec<ApplicationSummary>> {
        self.read("list_applications", |s| s.applications.clone())
    }

    async fn create_application(&self, descriptor: &ApplicationDescriptor) -> Result<()> {
        self.record("create_application", Call::CreateApplication(descriptor.clone()))?;
        let mut s = self.state.lock().unwrap();
        s.applications.push(ApplicationSummary {
            id: descriptor.id.clone(),
            name: descriptor.name.clone(),
            version: descriptor.version.clone(),
        });
        Ok(())
    }

    async fn delete_application(&self, id: &str) -> Result<()> {
        self.record("delete_application", Call::DeleteApplication(id.to_string()))?;
        self.state.lock().unwrap().applications.retain(|a| a.id != id);
        Ok(())
    }

    async fn create_discovery(&self, entries: &[DiscoveryEntry]) -> Result<()> {
        self.record("create_discovery", Call::CreateDiscovery(entries.to_vec()))
    }

    async fn replace_discovery(&self, entry: &DiscoveryEntry) -> Result<()> {
        self.record("replace_discovery", Call::ReplaceDiscovery(entry.clone()))
    }

    async fn list_tenants(&self) -> Result<Vec<Tenant>> {
        self.read("list_tenants", |s| s.tenants.clone())
    }

    async fn create_tenant(&self, name: &str, description: &str) -> Result<()> {
        self.record("create_tenant", Call::CreateTenant(name.to_string()))?;
        let mut s = self.state.lock().unwrap();
        let id = format!("{}-id", name);
        s.tenants.push(Tenant { id, name: name.to_string(), description: Some(description.to_string()) });
        Ok(())
    }

    async fn delete_tenant(&self, id: &str) -> Result<()> {
        self.record("delete_tenant", Call::DeleteTenant(id.to_string()))?;
        self.state.lock().unwrap().tenants.retain(|t| t.id != id);
        Ok(())
    }

    async fn create_entitlement(&self, entitlement: &Entitlement, tenant_parameters: &str) -> Result<()> {
        self.record(
            "create_entitlement",
            Call::CreateEntitlement { entitlement: entitlement.clone(), tenant_parameters: tenant_parameters.to_string() },
        )
    }

    async fn delete_entitlement(&self, entitlement: &Entitlement) -> Result<()> {
        self.record("delete_entitlement", Call::DeleteEntitlement(entitlement.clone()))
    }

    async fn list_roles(&self, session: &TenantSession) -> Result<Vec<Role>> {
        self.read("list_roles", |s| s.roles.get(&session.tenant).cloned().unwrap_or_default())
    }

    async fn find_roles_by_name(&self, session: &TenantSession, name: &str) -> Result<Vec<Role>> {
        self.read("find_roles_by_name", |s| {
            s.roles.get(&session.tenant).map(|rs| rs.iter().filter(|r| r.name == name).cloned().collect()).unwrap_or_default()
        })
    }

    async fn create_role(&self, session: &TenantSession, name: &str, _description: &str) -> Result<()> {
        self.record("create_role", Call::CreateRole { tenant: session.tenant.clone(), name: name.to_string() })?;
        let mut s = self.state.lock().unwrap();
        let roles = s.roles.entry(session.tenant.clone()).or_default();
        let id = format!("role-{}", roles.len() + 1);
        roles.push(Role { id, name: name.to_string(), description: None });
        Ok(())
    }

    async fn delete_role(&self, session: &TenantSession, id: &str) -> Result<()> {
        self.record("delete_role", Call::DeleteRole { tenant: session.tenant.clone(), id: id.to_string() })?;
        if let Some(roles) = self.state.lock().unwrap().roles.get_mut(&session.tenant) {
            roles.retain(|r| r.id != id);
        }
        Ok(())
    }

    async fn capability_sets_for_application(&self, session: &TenantSession, application_id: &str) -> Result<Vec<CapabilitySet>> {
        self.read("capability_sets_for_application", |s| {
            s.capability_sets
                .get(&session.tenant)
                .map(|cs| cs.iter().filter(|c| c.application_id == application_id).cloned().collect())
                .unwrap_or_default()
        })
    }

    async fn find_capability_sets_by_name(&self, session: &TenantSession, name: &str) -> Result<Vec<CapabilitySet>> {
        self.read("find_capability_sets_by_name", |s| {
            s.capability_sets
                .get(&session.tenant)
                .map(|cs| cs.iter().filter(|c| c.name == name).cloned().collect())
                .unwrap_or_default()
        })
    }

    async fn detach_role_capability_sets(&self, session: &TenantSession, role_id: &str) -> Result<()> {
        self.record(
            "detach_role_capability_sets",
            Call::DetachCapabilitySets { tenant: session.tenant.clone(), role_id: role_id.to_string() },
        )
    }

    async fn attach_role_capability_sets(&self, session: &TenantSession, role_id: &str, capability_set_ids: &[String]) -> Result<()> {
        self.record(
            "attach_role_capability_sets",
            Call::AttachCapabilitySets {
                tenant: session.tenant.clone(),
                role_id: role_id.to_string(),
                ids: capability_set_ids.to_vec(),
            },
        )
    }

    async fn list_users(&self, session: &TenantSession) -> Result<Vec<UserRecord>> {
        self.read("list_users", |s| s.users.get(&session.tenant).cloned().unwrap_or_default())
    }

    async fn create_user(&self, session: &TenantSession, user: &User) -> Result<String> {
        self.record("create_user", Call::CreateUser { tenant: session.tenant.clone(), username: user.username.clone() })?;
        let id = format!("user-{}", user.username);
        let mut s = self.state.lock().unwrap();
        s.users.entry(session.tenant.clone()).or_default().push(UserRecord { id: id.clone(), username: user.username.clone() });
        Ok(id)
    }

    async fn delete_user(&self, session: &TenantSession, id: &str) -> Result<()> {
        self.record("delete_user", Call::DeleteUser { tenant: session.tenant.clone(), id: id.to_string() })?;
        if let Some(users) = self.state.lock().unwrap().users.get_mut(&session.tenant) {
            users.retain(|u| u.id != id);
        }
        Ok(())
    }

    async fn attach_credentials(&self, session: &TenantSession, user_id: &str, _username: &str, _password: &str) -> Result<()> {
        self.record("attach_credentials", Call::AttachCredentials { tenant: session.tenant.clone(), user_id: user_id.to_string() })
    }

    async fn attach_user_roles(&self, session: &TenantSession, user_id: &str, role_ids: &[String]) -> Result<()> {
        self.record(
            "attach_user_roles",
            Call::AttachUserRoles { tenant: session.tenant.clone(), user_id: user_id.to_string(), role_ids: role_ids.to_vec() },
        )
    }
}
