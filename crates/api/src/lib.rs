//! Rollout API façade (in-process).
//!
//! [`Orchestrator`] sequences the rollout stages over the platform client, the
//! readiness barriers and the provisioning operations. Frontends (the CLI) call
//! either the whole pipeline or a single stage; every failure comes back as a
//! [`StageFailure`] naming the stage, tenant and entity it happened at.

#![forbid(unsafe_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use metrics::histogram;
use rollout_core::{ApplicationDescriptor, DiscoveryEntry, RolloutConfig, RolloutResult, StageResultExt, Timings};
use rollout_ops::{await_all_healthy, wait_for_drain, HealthProbe, Healthy, LagPolicy, ProbePolicy, ProbeTarget, QueueAdmin};
use rollout_platform::{PlatformApi, TenantSession, TokenSource};
use rollout_provision as provision;
use rollout_provision::{ProvisionedUser, RoleBinding};
use serde::Serialize;
use tracing::{error, info};

pub use rollout_core::{Stage, StageFailure};

pub type StageResult<T> = Result<T, StageFailure>;

/// What one tenant went through during a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TenantReport {
    pub tenant: String,
    pub lag_polls: u32,
    pub roles: Vec<String>,
    pub bindings: Vec<RoleBinding>,
    pub users: Vec<ProvisionedUser>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub application: String,
    pub healthy_modules: Vec<String>,
    pub backend_modules: usize,
    pub frontend_modules: usize,
    pub discovery_entries: usize,
    pub tenants: Vec<TenantReport>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TeardownReport {
    pub users: Vec<String>,
    pub roles: Vec<String>,
    pub entitlements: Vec<String>,
    pub tenants: Vec<String>,
    pub applications: Vec<String>,
}

/// External collaborators of a rollout.
#[derive(Clone)]
pub struct Collaborators {
    pub platform: Arc<dyn PlatformApi>,
    pub probe: Arc<dyn HealthProbe>,
    pub queue_admin: Arc<dyn QueueAdmin>,
    pub tokens: Arc<dyn TokenSource>,
}

/// Runs the rollout for one immutable configuration snapshot.
pub struct Orchestrator {
    config: Arc<RolloutConfig>,
    with: Collaborators,
    timings: Timings,
}

impl Orchestrator {
    pub fn new(config: Arc<RolloutConfig>, with: Collaborators, timings: Timings) -> Self {
        Self { config, with, timings }
    }

    pub fn config(&self) -> &RolloutConfig {
        &self.config
    }

    pub fn timings(&self) -> Timings {
        self.timings
    }

    fn platform(&self) -> &dyn PlatformApi {
        self.with.platform.as_ref()
    }

    async fn staged<T, F>(&self, stage: Stage, tenant: Option<&str>, entity: Option<&str>, fut: F) -> StageResult<T>
    where
        F: Future<Output = RolloutResult<T>>,
    {
        let t0 = Instant::now();
        info!(stage = %stage, tenant = %tenant.unwrap_or("-"), "rollout: stage start");
        let res = fut.await.in_stage(stage, tenant, entity);
        let took_ms = t0.elapsed().as_millis();
        histogram!("stage_latency_ms", t0.elapsed().as_secs_f64() * 1000.0, "stage" => stage.as_str());
        match &res {
            Ok(_) => info!(stage = %stage, tenant = %tenant.unwrap_or("-"), took_ms = %took_ms, "rollout: stage ok"),
            Err(e) => error!(stage = %stage, error = %e, took_ms = %took_ms, "rollout: stage failed"),
        }
        res
    }

    async fn session(&self, tenant: &str) -> RolloutResult<TenantSession> {
        let token = self
            .with
            .tokens
            .access_token(tenant)
            .await
            .with_context(|| format!("acquiring access token for tenant {}", tenant))?;
        Ok(TenantSession::new(tenant, &token))
    }

    /// Deployed backend modules that publish a health port.
    pub fn health_targets(&self) -> Vec<ProbeTarget> {
        self.config
            .backend_modules
            .iter()
            .filter(|(_, m)| m.deploy_module)
            .filter_map(|(name, m)| m.health_port.map(|port| ProbeTarget { module: name.clone(), port }))
            .collect()
    }

    pub async fn await_health(&self) -> StageResult<Vec<Healthy>> {
        let targets = self.health_targets();
        let policy = ProbePolicy::from(&self.timings);
        self.staged(Stage::HealthGate, None, None, async {
            if targets.is_empty() {
                info!("no module publishes a health port; skipping health gate");
                return Ok(Vec::new());
            }
            await_all_healthy(Arc::clone(&self.with.probe), targets, policy).await
        })
        .await
    }

    /// Assemble the application from the registries and create it with its discovery batch.
    pub async fn deploy_application(&self) -> StageResult<(ApplicationDescriptor, usize)> {
        let descriptor = self
            .staged(Stage::Resolve, None, None, provision::assemble_application(self.platform(), &self.config))
            .await?;
        let discovery = self
            .staged(Stage::Application, None, Some(&descriptor.id), provision::create_application(self.platform(), &descriptor))
            .await?;
        Ok((descriptor, discovery))
    }

    pub async fn remove_applications(&self) -> StageResult<Vec<String>> {
        self.staged(Stage::Teardown, None, None, provision::remove_applications(self.platform())).await
    }

    pub async fn update_discovery(&self, id: &str, explicit_url: Option<&str>, restore: bool, server_port: u16) -> StageResult<DiscoveryEntry> {
        let fut = provision::update_discovery(self.platform(), &self.config.network, id, explicit_url, restore, server_port);
        self.staged(Stage::Discovery, None, Some(id), fut).await
    }

    pub async fn create_tenants(&self) -> StageResult<Vec<String>> {
        self.staged(Stage::Tenants, None, None, provision::create_tenants(self.platform(), &self.config)).await
    }

    pub async fn remove_tenants(&self) -> StageResult<Vec<String>> {
        self.staged(Stage::Teardown, None, None, provision::remove_tenants(self.platform(), &self.config)).await
    }

    pub async fn create_entitlements(&self) -> StageResult<Vec<String>> {
        self.staged(Stage::Entitlements, None, None, provision::create_entitlements(self.platform(), &self.config)).await
    }

    pub async fn remove_entitlements(&self) -> StageResult<Vec<String>> {
        self.staged(Stage::Teardown, None, None, provision::remove_entitlements(self.platform(), &self.config)).await
    }

    /// Configured tenants that exist on the platform, by name.
    pub async fn existing_tenants(&self) -> StageResult<Vec<String>> {
        self.staged(Stage::Tenants, None, None, async {
            let tenants = self.platform().list_tenants().await.context("listing tenants")?;
            Ok(provision::configured_tenants(&self.config, tenants).into_iter().map(|t| t.name).collect())
        })
        .await
    }

    /// Block until the capability consumer group has drained the tenant's backlog.
    pub async fn await_capability_sets(&self, tenant: &str) -> StageResult<u32> {
        let group = self.config.capability_consumer_group();
        let policy = LagPolicy::from(&self.timings);
        let fut = wait_for_drain(self.with.queue_admin.as_ref(), &group, tenant, policy);
        self.staged(Stage::CapabilityBarrier, Some(tenant), Some(&group), fut).await
    }

    pub async fn create_roles(&self, tenant: &str) -> StageResult<Vec<String>> {
        self.staged(Stage::Roles, Some(tenant), None, async {
            let session = self.session(tenant).await?;
            provision::create_roles(self.platform(), &self.config, &session).await
        })
        .await
    }

    pub async fn remove_roles(&self, tenant: &str) -> StageResult<Vec<String>> {
        self.staged(Stage::Teardown, Some(tenant), None, async {
            let session = self.session(tenant).await?;
            provision::remove_roles(self.platform(), &self.config, &session).await
        })
        .await
    }

    pub async fn detach_capability_sets(&self, tenant: &str) -> StageResult<Vec<String>> {
        self.staged(Stage::CapabilityBinding, Some(tenant), None, async {
            let session = self.session(tenant).await?;
            provision::detach_capability_sets(self.platform(), &self.config, &session).await
        })
        .await
    }

    pub async fn attach_capability_sets(&self, tenant: &str) -> StageResult<Vec<RoleBinding>> {
        self.staged(Stage::CapabilityBinding, Some(tenant), None, async {
            let session = self.session(tenant).await?;
            provision::attach_capability_sets(self.platform(), &self.config, &session).await
        })
        .await
    }

    /// Detach then attach, so bindings match configuration exactly.
    pub async fn bind_capability_sets(&self, tenant: &str) -> StageResult<Vec<RoleBinding>> {
        self.staged(Stage::CapabilityBinding, Some(tenant), None, async {
            let session = self.session(tenant).await?;
            provision::bind_capability_sets(self.platform(), &self.config, &session).await
        })
        .await
    }

    pub async fn create_users(&self, tenant: &str) -> StageResult<Vec<ProvisionedUser>> {
        self.staged(Stage::Users, Some(tenant), None, async {
            let session = self.session(tenant).await?;
            provision::create_users(self.platform(), &self.config, &session).await
        })
        .await
    }

    pub async fn remove_users(&self, tenant: &str) -> StageResult<Vec<String>> {
        self.staged(Stage::Teardown, Some(tenant), None, async {
            let session = self.session(tenant).await?;
            provision::remove_users(self.platform(), &self.config, &session).await
        })
        .await
    }

    /// Barrier, roles, capability binding and users for one entitled tenant.
    pub async fn provision_tenant(&self, tenant: &str) -> StageResult<TenantReport> {
        let lag_polls = self.await_capability_sets(tenant).await?;
        let roles = self.create_roles(tenant).await?;
        let bindings = self.bind_capability_sets(tenant).await?;
        let users = self.create_users(tenant).await?;
        Ok(TenantReport { tenant: tenant.to_string(), lag_polls, roles, bindings, users })
    }

    /// The whole pipeline. Stops at the first fatal failure.
    pub async fn run(&self) -> StageResult<RunReport> {
        let t0 = Instant::now();
        info!(application = %self.config.application_id(), tenants = self.config.tenants.len(), "rollout: run start");

        let healthy = self.await_health().await?;
        let (descriptor, discovery_entries) = self.deploy_application().await?;
        self.create_tenants().await?;
        let entitled = self.create_entitlements().await?;

        let mut tenants = Vec::with_capacity(entitled.len());
        for tenant in &entitled {
            tenants.push(self.provision_tenant(tenant).await?);
        }

        info!(took_ms = %t0.elapsed().as_millis(), tenants = tenants.len(), "rollout: run ok");
        Ok(RunReport {
            application: descriptor.id,
            healthy_modules: healthy.into_iter().map(|h| h.module).collect(),
            backend_modules: descriptor.backend_modules.len(),
            frontend_modules: descriptor.frontend_modules.len(),
            discovery_entries,
            tenants,
        })
    }

    /// Undo a run: users and roles per tenant, then entitlements, tenants and applications.
    ///
    /// Individual deletes are tolerated; a failed entitlement removal stops the teardown.
    pub async fn teardown(&self) -> StageResult<TeardownReport> {
        let t0 = Instant::now();
        info!(application = %self.config.application_id(), "rollout: teardown start");
        let mut report = TeardownReport::default();
        for tenant in self.existing_tenants().await? {
            report.users.extend(self.remove_users(&tenant).await?);
            report.roles.extend(self.remove_roles(&tenant).await?);
        }
        report.entitlements = self.remove_entitlements().await?;
        report.tenants = self.remove_tenants().await?;
        report.applications = self.remove_applications().await?;
        info!(took_ms = %t0.elapsed().as_millis(), "rollout: teardown ok");
        Ok(report)
    }
}
