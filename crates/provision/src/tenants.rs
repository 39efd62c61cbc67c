//! Tenants and entitlements.
//!
//! Creation trusts configuration and does no existence check. Everything else
//! starts from the platform's tenant list and acts only on tenants whose name is
//! configured, so tenants created by someone else are never touched.

use anyhow::Context;
use rollout_core::{EntityResultExt, Entitlement, RolloutConfig, RolloutResult, Tenant, DEFAULT_DESCRIPTION};
use rollout_platform::PlatformApi;
use tracing::{info, warn};

/// Platform tenants whose name is in the configured tenant set.
pub fn configured_tenants(config: &RolloutConfig, tenants: Vec<Tenant>) -> Vec<Tenant> {
    tenants.into_iter().filter(|t| config.has_tenant(&t.name)).collect()
}

async fn list_configured(platform: &dyn PlatformApi, config: &RolloutConfig) -> RolloutResult<Vec<Tenant>> {
    let tenants = platform.list_tenants().await.context("listing tenants")?;
    Ok(configured_tenants(config, tenants))
}

pub async fn create_tenants(platform: &dyn PlatformApi, config: &RolloutConfig) -> RolloutResult<Vec<String>> {
    let mut created = Vec::with_capacity(config.tenants.len());
    for name in &config.tenants {
        platform
            .create_tenant(name, DEFAULT_DESCRIPTION)
            .await
            .context("creating tenant")
            .for_entity(Some(name.as_str()), format!("tenant {}", name))?;
        info!(tenant = %name, "created tenant (realm)");
        created.push(name.clone());
    }
    Ok(created)
}

/// Purge configured tenants. A failed delete is logged and the rest proceed.
pub async fn remove_tenants(platform: &dyn PlatformApi, config: &RolloutConfig) -> RolloutResult<Vec<String>> {
    let mut removed = Vec::new();
    for tenant in list_configured(platform, config).await? {
        match platform.delete_tenant(&tenant.id).await {
            Ok(()) => {
                info!(tenant = %tenant.name, "removed tenant (realm)");
                removed.push(tenant.name);
            }
            Err(e) => warn!(tenant = %tenant.name, error = %e, "failed to remove tenant"),
        }
    }
    Ok(removed)
}

/// Entitle every configured tenant that exists on the platform to the configured application.
pub async fn create_entitlements(platform: &dyn PlatformApi, config: &RolloutConfig) -> RolloutResult<Vec<String>> {
    let application_id = config.application_id();
    let mut entitled = Vec::new();
    for tenant in list_configured(platform, config).await? {
        let entitlement = Entitlement::new(&tenant.id, &application_id);
        platform
            .create_entitlement(&entitlement, &config.application.tenant_parameters)
            .await
            .context("creating entitlement")
            .for_entity(Some(tenant.name.as_str()), format!("entitlement {}", application_id))?;
        info!(tenant = %tenant.name, application = %application_id, "created tenant entitlement");
        entitled.push(tenant.name);
    }
    Ok(entitled)
}

pub async fn remove_entitlements(platform: &dyn PlatformApi, config: &RolloutConfig) -> RolloutResult<Vec<String>> {
    let application_id = config.application_id();
    let mut removed = Vec::new();
    for tenant in list_configured(platform, config).await? {
        let entitlement = Entitlement::new(&tenant.id, &application_id);
        platform
            .delete_entitlement(&entitlement)
            .await
            .context("removing entitlement")
            .for_entity(Some(tenant.name.as_str()), format!("entitlement {}", application_id))?;
        info!(tenant = %tenant.name, application = %application_id, "removed tenant entitlement");
        removed.push(tenant.name);
    }
    Ok(removed)
}
