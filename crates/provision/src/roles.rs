//! Roles and capability-set binding.
//!
//! Roles are configured by lowercase key and created on the platform under a
//! title-cased name; lookups go by the platform name. A name lookup must yield at
//! most one role.

use std::collections::BTreeSet;

use anyhow::Context;
use metrics::counter;
use rollout_core::config::ALL_CAPABILITY_SETS;
use rollout_core::{CapabilitySet, EntityResultExt, Role, RolloutConfig, RolloutError, RolloutResult, DEFAULT_DESCRIPTION};
use rollout_platform::{PlatformApi, TenantSession};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Platform name of a configured role key: `admin` -> `Admin`, `read-only` -> `Read-Only`.
pub fn platform_role_name(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut word_start = true;
    for c in key.chars() {
        if c.is_alphanumeric() {
            if word_start {
                out.extend(c.to_uppercase());
            } else {
                out.extend(c.to_lowercase());
            }
            word_start = false;
        } else {
            out.push(c);
            word_start = true;
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleLookup {
    Found(Role),
    Missing,
}

/// Exact-one-result lookup. Zero matches is `Missing`; more than one is fatal.
pub async fn find_role_by_name(platform: &dyn PlatformApi, session: &TenantSession, name: &str) -> RolloutResult<RoleLookup> {
    let mut roles = platform
        .find_roles_by_name(session, name)
        .await
        .with_context(|| format!("looking up role {} in tenant {}", name, session.tenant))?;
    match roles.len() {
        0 => Ok(RoleLookup::Missing),
        1 => Ok(RoleLookup::Found(roles.remove(0))),
        count => Err(RolloutError::AmbiguousRole { name: name.to_string(), count }),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapabilitySelection {
    /// Every capability set of every registered application.
    All,
    Named(Vec<String>),
}

impl CapabilitySelection {
    /// `all` anywhere in the list selects everything; other names are then ignored.
    pub fn from_names(names: &[String]) -> Self {
        if names.iter().any(|n| n == ALL_CAPABILITY_SETS) {
            return CapabilitySelection::All;
        }
        let mut seen = BTreeSet::new();
        CapabilitySelection::Named(names.iter().filter(|n| seen.insert(n.as_str())).cloned().collect())
    }
}

fn push_unique(into: &mut Vec<CapabilitySet>, seen: &mut BTreeSet<String>, sets: Vec<CapabilitySet>) {
    for set in sets {
        if seen.insert(set.id.clone()) {
            into.push(set);
        }
    }
}

/// Resolve a selection into capability sets, deduplicated by id.
pub async fn select_capability_sets(
    platform: &dyn PlatformApi,
    session: &TenantSession,
    selection: &CapabilitySelection,
) -> RolloutResult<Vec<CapabilitySet>> {
    let mut selected = Vec::new();
    let mut seen = BTreeSet::new();
    match selection {
        CapabilitySelection::All => {
            for app in platform.list_applications().await.context("listing applications")? {
                let sets = platform
                    .capability_sets_for_application(session, &app.id)
                    .await
                    .with_context(|| format!("listing capability sets of {}", app.id))?;
                if sets.is_empty() {
                    debug!(application = %app.id, "application has no capability sets");
                }
                push_unique(&mut selected, &mut seen, sets);
            }
        }
        CapabilitySelection::Named(names) => {
            for name in names {
                let sets = platform
                    .find_capability_sets_by_name(session, name)
                    .await
                    .with_context(|| format!("looking up capability set {}", name))?;
                if sets.is_empty() {
                    warn!(tenant = %session.tenant, capability_set = %name, "capability set not found");
                }
                push_unique(&mut selected, &mut seen, sets);
            }
        }
    }
    Ok(selected)
}

/// Create every configured role of the session's tenant.
pub async fn create_roles(platform: &dyn PlatformApi, config: &RolloutConfig, session: &TenantSession) -> RolloutResult<Vec<String>> {
    let mut created = Vec::new();
    for (key, _) in config.roles_for_tenant(&session.tenant) {
        let name = platform_role_name(key);
        platform
            .create_role(session, &name, DEFAULT_DESCRIPTION)
            .await
            .context("creating role")
            .for_entity(Some(session.tenant.as_str()), format!("role {}", name))?;
        info!(tenant = %session.tenant, role = %name, "created role");
        created.push(name);
    }
    Ok(created)
}

/// Delete platform roles that are configured for the session's tenant. Delete failures are tolerated.
pub async fn remove_roles(platform: &dyn PlatformApi, config: &RolloutConfig, session: &TenantSession) -> RolloutResult<Vec<String>> {
    let roles = platform.list_roles(session).await.context("listing roles")?;
    let mut removed = Vec::new();
    for role in roles {
        match config.role_for(&role.name) {
            Some((_, rc)) if rc.tenant == session.tenant => {}
            _ => continue,
        }
        match platform.delete_role(session, &role.id).await {
            Ok(()) => {
                info!(tenant = %session.tenant, role = %role.name, "removed role");
                removed.push(role.name);
            }
            Err(e) => warn!(tenant = %session.tenant, role = %role.name, error = %e, "failed to remove role"),
        }
    }
    Ok(removed)
}

/// Configured roles of the tenant that exist on the platform. Missing ones are logged and skipped.
async fn resolve_configured_roles<'a>(
    platform: &dyn PlatformApi,
    config: &'a RolloutConfig,
    session: &TenantSession,
) -> RolloutResult<Vec<(Role, &'a [String])>> {
    let mut found = Vec::new();
    for (key, rc) in config.roles_for_tenant(&session.tenant) {
        let name = platform_role_name(key);
        match find_role_by_name(platform, session, &name).await.for_entity(Some(session.tenant.as_str()), format!("role {}", name))? {
            RoleLookup::Found(role) => found.push((role, rc.capability_sets.as_slice())),
            RoleLookup::Missing => warn!(tenant = %session.tenant, role = %name, "did not find configured role by name"),
        }
    }
    Ok(found)
}

/// Strip capability sets from every configured role of the tenant.
pub async fn detach_capability_sets(platform: &dyn PlatformApi, config: &RolloutConfig, session: &TenantSession) -> RolloutResult<Vec<String>> {
    let mut detached = Vec::new();
    for (role, _) in resolve_configured_roles(platform, config, session).await? {
        match platform.detach_role_capability_sets(session, &role.id).await {
            Ok(()) => {
                info!(tenant = %session.tenant, role = %role.name, "detached capability sets from role");
                detached.push(role.name);
            }
            Err(e) => warn!(tenant = %session.tenant, role = %role.name, error = %e, "failed to detach capability sets"),
        }
    }
    Ok(detached)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoleBinding {
    pub role: String,
    pub capability_sets: usize,
}

/// Attach each configured role's selection. A role whose selection is empty is skipped.
pub async fn attach_capability_sets(
    platform: &dyn PlatformApi,
    config: &RolloutConfig,
    session: &TenantSession,
) -> RolloutResult<Vec<RoleBinding>> {
    let mut bindings = Vec::new();
    for (role, names) in resolve_configured_roles(platform, config, session).await? {
        let entity = format!("role {}", role.name);
        let attached = attach_selection(platform, session, &role, names).await.for_entity(Some(session.tenant.as_str()), entity)?;
        if attached > 0 {
            bindings.push(RoleBinding { role: role.name, capability_sets: attached });
        }
    }
    Ok(bindings)
}

async fn attach_selection(platform: &dyn PlatformApi, session: &TenantSession, role: &Role, names: &[String]) -> RolloutResult<usize> {
    let selection = CapabilitySelection::from_names(names);
    let ids: Vec<String> = select_capability_sets(platform, session, &selection).await?.into_iter().map(|c| c.id).collect();
    if ids.is_empty() {
        info!(tenant = %session.tenant, role = %role.name, "no capability sets were attached to role");
        return Ok(0);
    }
    platform
        .attach_role_capability_sets(session, &role.id, &ids)
        .await
        .context("attaching capability sets")?;
    counter!("capability_sets_attached", ids.len() as u64);
    info!(tenant = %session.tenant, role = %role.name, count = ids.len(), "attached capability sets to role");
    Ok(ids.len())
}

/// Detach, then attach: the platform's bindings end up equal to the configured selection.
pub async fn bind_capability_sets(platform: &dyn PlatformApi, config: &RolloutConfig, session: &TenantSession) -> RolloutResult<Vec<RoleBinding>> {
    detach_capability_sets(platform, config, session).await?;
    attach_capability_sets(platform, config, session).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_cases_role_keys() {
        assert_eq!(platform_role_name("admin"), "Admin");
        assert_eq!(platform_role_name("read-only"), "Read-Only");
        assert_eq!(platform_role_name("circ_STAFF"), "Circ_Staff");
    }

    #[test]
    fn all_wins_over_named_sets() {
        let names = vec!["Users".to_string(), "all".to_string()];
        assert_eq!(CapabilitySelection::from_names(&names), CapabilitySelection::All);
    }

    #[test]
    fn named_selection_is_deduplicated_in_order() {
        let names: Vec<String> = ["b", "a", "b"].iter().map(|s| s.to_string()).collect();
        assert_eq!(CapabilitySelection::from_names(&names), CapabilitySelection::Named(vec!["b".into(), "a".into()]));
    }
}
