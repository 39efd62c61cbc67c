//! Application assembly: registry listings in, one application descriptor plus
//! its discovery batch out.

use std::collections::BTreeSet;

use anyhow::Context;
use metrics::counter;
use rollout_core::{
    sidecar_url, ApplicationDescriptor, DiscoveryEntry, EntityResultExt, ModuleEntry, ModuleRef, RolloutConfig, RolloutError, RolloutResult,
    DEFAULT_DESCRIPTION,
};
use rollout_platform::{PlatformApi, RegistryModule};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Management components are deployed separately and never registered.
pub const MANAGEMENT_MODULE_PREFIX: &str = "mgr-";

/// Registry endpoint serving a module's descriptor.
pub fn descriptor_url(registry_url: &str, module_id: &str) -> String {
    format!("{}/_/proxy/modules/{}", registry_url.trim_end_matches('/'), module_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Placement {
    Backend,
    Frontend,
}

/// Where a module goes, if anywhere.
///
/// A module listed in neither map is skipped, as is one whose entries all decline
/// deployment. Backend wins when both maps deploy it.
pub fn placement(config: &RolloutConfig, name: &str) -> Option<Placement> {
    let backend = config.backend_modules.get(name);
    let frontend = config.frontend_modules.get(name);
    match (backend, frontend) {
        (Some(b), _) if b.deploy_module => Some(Placement::Backend),
        (_, Some(f)) if f.deploy_module => Some(Placement::Frontend),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedModule {
    pub module: ModuleRef,
    pub placement: Placement,
}

/// Select and resolve the modules to register, in listing order.
///
/// A module offered by more than one registry is taken from the first listing.
pub fn plan_modules(config: &RolloutConfig, listings: &[(String, Vec<RegistryModule>)]) -> RolloutResult<Vec<PlannedModule>> {
    let mut seen = BTreeSet::new();
    let mut planned = Vec::new();
    for (registry, modules) in listings {
        for raw in modules {
            let Some(module) = ModuleRef::resolve(&raw.id)? else {
                debug!(registry = %registry, id = %raw.id, "skipping reserved module id");
                continue;
            };
            if module.name.starts_with(MANAGEMENT_MODULE_PREFIX) {
                continue;
            }
            let Some(placement) = placement(config, &module.name) else {
                continue;
            };
            if !seen.insert(module.name.clone()) {
                debug!(registry = %registry, module = %module.name, "module already planned from another registry");
                continue;
            }
            // A backend version override applies even when the module deploys as frontend.
            let backend = config.backend_modules.get(&module.name);
            let version = backend
                .and_then(|b| b.version.clone())
                .or_else(|| config.frontend_modules.get(&module.name).and_then(|f| f.version.clone()));
            let server_port = match placement {
                Placement::Backend => backend.and_then(|b| b.server_port),
                Placement::Frontend => None,
            };
            let mut module = match version {
                Some(v) => module.with_version(&v),
                None => module,
            };
            module.deploy = true;
            module.server_port = server_port;
            planned.push(PlannedModule { module, placement });
        }
    }
    Ok(planned)
}

/// List every configured registry, plan the modules and build the descriptor.
///
/// In fetch-descriptors mode each descriptor is fetched inline from the
/// descriptor registry; otherwise the entry only records where to find it.
pub async fn assemble_application(platform: &dyn PlatformApi, config: &RolloutConfig) -> RolloutResult<ApplicationDescriptor> {
    let registry_url = config.descriptor_registry_url().ok_or_else(|| {
        RolloutError::Config(format!("descriptor registry {} is not among the configured registries", config.descriptor_registry))
    })?;

    let mut listings = Vec::with_capacity(config.registries.len());
    for (name, url) in &config.registries {
        let modules = platform.registry_modules(url).await.with_context(|| format!("listing {} registry", name))?;
        info!(registry = %name, count = modules.len(), "registering registry modules");
        listings.push((name.clone(), modules));
    }
    let planned = plan_modules(config, &listings)?;

    let app = &config.application;
    let mut descriptor = ApplicationDescriptor {
        id: config.application_id(),
        name: app.name.clone(),
        version: app.version.clone(),
        description: DEFAULT_DESCRIPTION.to_string(),
        platform: app.platform.clone(),
        dependencies: app.dependencies.clone(),
        ..Default::default()
    };

    for PlannedModule { module, placement } in planned {
        let url = descriptor_url(registry_url, &module.id);
        let fetched = if app.fetch_descriptors {
            let d = platform
                .module_descriptor(&url)
                .await
                .with_context(|| format!("fetching descriptor from {}", url))
                .for_entity(None, format!("module {}", module.id))?;
            Some(d)
        } else {
            None
        };
        let entry = ModuleEntry {
            id: module.id.clone(),
            name: module.name.clone(),
            version: module.version.clone(),
            url: if fetched.is_none() { Some(url) } else { None },
        };
        match placement {
            Placement::Backend => {
                descriptor.module_descriptors.extend(fetched);
                match module.server_port {
                    Some(port) => descriptor.discovery.push(DiscoveryEntry {
                        id: module.id.clone(),
                        name: module.name.clone(),
                        version: module.version.clone(),
                        location: sidecar_url(&module.name, &config.network, port),
                    }),
                    None => warn!(module = %module.name, "backend module has no server port; no discovery entry"),
                }
                descriptor.backend_modules.push(entry);
            }
            Placement::Frontend => {
                descriptor.ui_module_descriptors.extend(fetched);
                descriptor.frontend_modules.push(entry);
            }
        }
        info!(module = %module.name, version = %module.version, placement = ?placement, "found module for registration");
    }
    Ok(descriptor)
}

/// Submit the descriptor, then its discovery batch when there is one.
/// Returns the number of discovery entries created.
pub async fn create_application(platform: &dyn PlatformApi, descriptor: &ApplicationDescriptor) -> RolloutResult<usize> {
    platform.create_application(descriptor).await.with_context(|| format!("creating application {}", descriptor.id))?;
    counter!("applications_created", 1u64);
    info!(application = %descriptor.id, modules = descriptor.backend_modules.len(), ui_modules = descriptor.frontend_modules.len(), "created application");

    if descriptor.discovery.is_empty() {
        return Ok(0);
    }
    platform.create_discovery(&descriptor.discovery).await.context("creating module discovery")?;
    info!(application = %descriptor.id, count = descriptor.discovery.len(), "created application module discovery");
    Ok(descriptor.discovery.len())
}

/// Delete every registered application. Individual delete failures are tolerated.
pub async fn remove_applications(platform: &dyn PlatformApi) -> RolloutResult<Vec<String>> {
    let mut removed = Vec::new();
    for app in platform.list_applications().await.context("listing applications")? {
        match platform.delete_application(&app.id).await {
            Ok(()) => {
                info!(application = %app.id, "removed application");
                removed.push(app.id);
            }
            Err(e) => warn!(application = %app.id, error = %e, "failed to remove application"),
        }
    }
    Ok(removed)
}
