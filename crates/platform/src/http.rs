use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use metrics::{counter, histogram};
use reqwest::{header, Method, RequestBuilder, Response};
use rollout_core::{ApplicationDescriptor, CapabilitySet, DiscoveryEntry, Entitlement, Role, Tenant, User};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::{
    ApplicationSummary, PlatformApi, RegistryModule, TenantSession, UserRecord, APPLICATIONS_PORT, GATEWAY_PORT,
    TENANTS_PORT, TENANT_ENTITLEMENTS_PORT, TENANT_HEADER, TOKEN_HEADER,
};

const PAGE_LIMIT: &str = "10000";

#[derive(Deserialize)]
struct ApplicationList {
    #[serde(rename = "applicationDescriptors", default)]
    application_descriptors: Vec<ApplicationSummary>,
}

#[derive(Deserialize)]
struct TenantList {
    #[serde(default)]
    tenants: Vec<Tenant>,
}

#[derive(Deserialize)]
struct RoleList {
    #[serde(default)]
    roles: Vec<Role>,
}

#[derive(Deserialize)]
struct CapabilitySetList {
    #[serde(rename = "capabilitySets", default)]
    capability_sets: Vec<CapabilitySet>,
}

#[derive(Deserialize)]
struct UserList {
    #[serde(default)]
    users: Vec<UserRecord>,
}

#[derive(Deserialize)]
struct CreatedUser {
    id: String,
}

/// reqwest-backed client. Each logical service listens on its own port of `host`.
pub struct HttpPlatform {
    client: reqwest::Client,
    host: String,
}

impl HttpPlatform {
    pub fn new(host: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build().context("building http client")?;
        Ok(Self { client, host: host.trim_end_matches('/').to_string() })
    }

    fn url(&self, port: u16, path: &str) -> String {
        format!("{}:{}{}", self.host, port, path)
    }

    fn gateway(&self, method: Method, path: &str, session: &TenantSession) -> RequestBuilder {
        self.client
            .request(method, self.url(GATEWAY_PORT, path))
            .header(header::CONTENT_TYPE, "application/json")
            .header(TENANT_HEADER, &session.tenant)
            .header(TOKEN_HEADER, &session.token)
    }

    fn create_application_request(&self, descriptor: &ApplicationDescriptor) -> RequestBuilder {
        self.client.post(self.url(APPLICATIONS_PORT, "/applications")).query(&[("check", "true")]).json(descriptor)
    }

    fn delete_tenant_request(&self, id: &str) -> RequestBuilder {
        self.client.delete(self.url(TENANTS_PORT, &format!("/tenants/{}", id))).query(&[("purge", "true")])
    }

    fn create_entitlement_request(&self, entitlement: &Entitlement, tenant_parameters: &str) -> RequestBuilder {
        self.client
            .post(self.url(TENANT_ENTITLEMENTS_PORT, "/entitlements"))
            .query(&[("purgeOnRollback", "true"), ("ignoreErrors", "false"), ("tenantParameters", tenant_parameters)])
            .json(entitlement)
    }

    fn delete_entitlement_request(&self, entitlement: &Entitlement) -> RequestBuilder {
        self.client
            .delete(self.url(TENANT_ENTITLEMENTS_PORT, "/entitlements"))
            .query(&[("purgeOnRollback", "true"), ("ignoreErrors", "false")])
            .json(entitlement)
    }

    fn find_roles_request(&self, session: &TenantSession, name: &str) -> RequestBuilder {
        let query = format!("name=={}", name);
        self.gateway(Method::GET, "/roles", session).query(&[("query", query.as_str())])
    }

    async fn send(&self, req: RequestBuilder, what: &str) -> Result<Response> {
        let t0 = Instant::now();
        counter!("platform_requests", 1u64);
        let resp = req.send().await.with_context(|| format!("{} request failed", what))?;
        let status = resp.status();
        histogram!("platform_request_ms", t0.elapsed().as_secs_f64() * 1000.0);
        debug!(what, status = %status, took_ms = %t0.elapsed().as_millis(), "platform call");
        if status.is_success() {
            return Ok(resp);
        }
        counter!("platform_request_errors", 1u64);
        let body = resp.text().await.unwrap_or_default();
        Err(anyhow!("{} returned {}: {}", what, status, body.trim()))
    }

    async fn send_unit(&self, req: RequestBuilder, what: &str) -> Result<()> {
        self.send(req, what).await.map(|_| ())
    }

    async fn send_json<T: DeserializeOwned>(&self, req: RequestBuilder, what: &str) -> Result<T> {
        let resp = self.send(req, what).await?;
        resp.json::<T>().await.with_context(|| format!("decoding {} response", what))
    }
}

#[async_trait::async_trait]
impl PlatformApi for HttpPlatform {
    async fn registry_modules(&self, registry_url: &str) -> Result<Vec<RegistryModule>> {
        let url = format!("{}/_/proxy/modules", registry_url.trim_end_matches('/'));
        self.send_json(self.client.get(url), "list registry modules").await
    }

    async fn module_descriptor(&self, url: &str) -> Result<serde_json::Value> {
        self.send_json(self.client.get(url), "fetch module descriptor").await
    }

    async fn list_applications(&self) -> Result<Vec<ApplicationSummary>> {
        let req = self.client.get(self.url(APPLICATIONS_PORT, "/applications"));
        let list: ApplicationList = self.send_json(req, "list applications").await?;
        Ok(list.application_descriptors)
    }

    async fn create_application(&self, descriptor: &ApplicationDescriptor) -> Result<()> {
        self.send_unit(self.create_application_request(descriptor), "create application").await
    }

    async fn delete_application(&self, id: &str) -> Result<()> {
        let req = self.client.delete(self.url(APPLICATIONS_PORT, &format!("/applications/{}", id)));
        self.send_unit(req, "delete application").await
    }

    async fn create_discovery(&self, entries: &[DiscoveryEntry]) -> Result<()> {
        let req = self.client.post(self.url(APPLICATIONS_PORT, "/modules/discovery")).json(&json!({ "discovery": entries }));
        self.send_unit(req, "create module discovery").await
    }

    async fn replace_discovery(&self, entry: &DiscoveryEntry) -> Result<()> {
        let req = self.client.put(self.url(APPLICATIONS_PORT, &format!("/modules/{}/discovery", entry.id))).json(entry);
        self.send_unit(req, "update module discovery").await
    }

    async fn list_tenants(&self) -> Result<Vec<Tenant>> {
        let list: TenantList = self.send_json(self.client.get(self.url(TENANTS_PORT, "/tenants")), "list tenants").await?;
        Ok(list.tenants)
    }

    async fn create_tenant(&self, name: &str, description: &str) -> Result<()> {
        let req = self.client.post(self.url(TENANTS_PORT, "/tenants")).json(&json!({ "name": name, "description": description }));
        self.send_unit(req, "create tenant").await
    }

    async fn delete_tenant(&self, id: &str) -> Result<()> {
        self.send_unit(self.delete_tenant_request(id), "delete tenant").await
    }

    async fn create_entitlement(&self, entitlement: &Entitlement, tenant_parameters: &str) -> Result<()> {
        self.send_unit(self.create_entitlement_request(entitlement, tenant_parameters), "create entitlement").await
    }

    async fn delete_entitlement(&self, entitlement: &Entitlement) -> Result<()> {
        self.send_unit(self.delete_entitlement_request(entitlement), "delete entitlement").await
    }

    async fn list_roles(&self, session: &TenantSession) -> Result<Vec<Role>> {
        let req = self.gateway(Method::GET, "/roles", session).query(&[("offset", "0"), ("limit", PAGE_LIMIT)]);
        let list: RoleList = self.send_json(req, "list roles").await?;
        Ok(list.roles)
    }

    async fn find_roles_by_name(&self, session: &TenantSession, name: &str) -> Result<Vec<Role>> {
        let list: RoleList = self.send_json(self.find_roles_request(session, name), "find role by name").await?;
        Ok(list.roles)
    }

    async fn create_role(&self, session: &TenantSession, name: &str, description: &str) -> Result<()> {
        let req = self.gateway(Method::POST, "/roles", session).json(&json!({ "name": name, "description": description }));
        self.send_unit(req, "create role").await
    }

    async fn delete_role(&self, session: &TenantSession, id: &str) -> Result<()> {
        let req = self.gateway(Method::DELETE, &format!("/roles-keycloak/roles/{}", id), session);
        self.send_unit(req, "delete role").await
    }

    async fn capability_sets_for_application(&self, session: &TenantSession, application_id: &str) -> Result<Vec<CapabilitySet>> {
        let query = format!("applicationId=={}", application_id);
        let req = self
            .gateway(Method::GET, "/capability-sets", session)
            .query(&[("offset", "0"), ("limit", PAGE_LIMIT), ("query", query.as_str())]);
        let list: CapabilitySetList = self.send_json(req, "list capability sets").await?;
        Ok(list.capability_sets)
    }

    async fn find_capability_sets_by_name(&self, session: &TenantSession, name: &str) -> Result<Vec<CapabilitySet>> {
        let query = format!("name={}", name);
        let req = self
            .gateway(Method::GET, "/capability-sets", session)
            .query(&[("offset", "0"), ("limit", "1000"), ("query", query.as_str())]);
        let list: CapabilitySetList = self.send_json(req, "find capability sets by name").await?;
        Ok(list.capability_sets)
    }

    async fn detach_role_capability_sets(&self, session: &TenantSession, role_id: &str) -> Result<()> {
        let req = self.gateway(Method::DELETE, &format!("/roles/{}/capability-sets", role_id), session);
        self.send_unit(req, "detach role capability sets").await
    }

    async fn attach_role_capability_sets(&self, session: &TenantSession, role_id: &str, capability_set_ids: &[String]) -> Result<()> {
        let req = self
            .gateway(Method::POST, "/roles/capability-sets", session)
            .json(&json!({ "roleId": role_id, "capabilitySetIds": capability_set_ids }));
        self.send_unit(req, "attach role capability sets").await
    }

    async fn list_users(&self, session: &TenantSession) -> Result<Vec<UserRecord>> {
        let req = self.gateway(Method::GET, "/users", session).query(&[("offset", "0"), ("limit", PAGE_LIMIT)]);
        let list: UserList = self.send_json(req, "list users").await?;
        Ok(list.users)
    }

    async fn create_user(&self, session: &TenantSession, user: &User) -> Result<String> {
        let body = json!({
            "username": user.username,
            "active": true,
            "type": "staff",
            "personal": {
                "firstName": user.first_name,
                "lastName": user.last_name,
                "email": format!("{}-{}", user.tenant, user.username),
                "preferredContactTypeId": "002",
            },
        });
        let req = self.gateway(Method::POST, "/users-keycloak/users", session).json(&body);
        let created: CreatedUser = self.send_json(req, "create user").await?;
        Ok(created.id)
    }

    async fn delete_user(&self, session: &TenantSession, id: &str) -> Result<()> {
        let req = self.gateway(Method::DELETE, &format!("/users-keycloak/users/{}", id), session);
        self.send_unit(req, "delete user").await
    }

    async fn attach_credentials(&self, session: &TenantSession, user_id: &str, username: &str, password: &str) -> Result<()> {
        // The credentials endpoint authenticates with a bearer token instead of the gateway token header.
        let req = self
            .client
            .post(self.url(GATEWAY_PORT, "/authn/credentials"))
            .header(header::CONTENT_TYPE, "application/json")
            .header(TENANT_HEADER, &session.tenant)
            .bearer_auth(&session.token)
            .json(&json!({ "userId": user_id, "username": username, "password": password }));
        self.send_unit(req, "attach credentials").await
    }

    async fn attach_user_roles(&self, session: &TenantSession, user_id: &str, role_ids: &[String]) -> Result<()> {
        let req = self.gateway(Method::POST, "/roles/users", session).json(&json!({ "userId": user_id, "roleIds": role_ids }));
        self.send_unit(req, "attach user roles").await
    }
}
