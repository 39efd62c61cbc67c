use anyhow::Context;
use rollout_core::{EntityResultExt, RolloutConfig, RolloutResult, User};
use rollout_platform::{PlatformApi, TenantSession};
use serde::Serialize;
use tracing::{info, warn};

use crate::roles::{find_role_by_name, platform_role_name, RoleLookup};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisionedUser {
    pub username: String,
    pub id: String,
    pub roles: usize,
}

/// Create each configured user of the session's tenant, set its password and
/// bind the roles that resolve. Roles that do not exist are logged and skipped.
pub async fn create_users(platform: &dyn PlatformApi, config: &RolloutConfig, session: &TenantSession) -> RolloutResult<Vec<ProvisionedUser>> {
    let mut provisioned = Vec::new();
    for user in config.users_for_tenant(&session.tenant) {
        let entity = format!("user {}", user.username);
        provisioned.push(create_user(platform, session, user).await.for_entity(Some(session.tenant.as_str()), entity)?);
    }
    Ok(provisioned)
}

async fn create_user(platform: &dyn PlatformApi, session: &TenantSession, user: User) -> RolloutResult<ProvisionedUser> {
    let id = platform.create_user(session, &user).await.context("creating user")?;
    info!(tenant = %session.tenant, user = %user.username, "created user");

    platform
        .attach_credentials(session, &id, &user.username, &user.password)
        .await
        .context("attaching credentials")?;
    info!(tenant = %session.tenant, user = %user.username, "attached password to user");

    let mut role_ids = Vec::with_capacity(user.role_names.len());
    for key in &user.role_names {
        let name = platform_role_name(key);
        match find_role_by_name(platform, session, &name).await? {
            RoleLookup::Found(role) => role_ids.push(role.id),
            RoleLookup::Missing => warn!(tenant = %session.tenant, user = %user.username, role = %name, "did not find role by name"),
        }
    }
    if role_ids.is_empty() {
        info!(tenant = %session.tenant, user = %user.username, "no roles resolved; skipping role attachment");
    } else {
        platform.attach_user_roles(session, &id, &role_ids).await.context("attaching roles")?;
        info!(tenant = %session.tenant, user = %user.username, count = role_ids.len(), "attached roles to user");
    }
    Ok(ProvisionedUser { username: user.username, id, roles: role_ids.len() })
}

/// Delete platform users whose username is configured for the session's tenant.
pub async fn remove_users(platform: &dyn PlatformApi, config: &RolloutConfig, session: &TenantSession) -> RolloutResult<Vec<String>> {
    let users = platform.list_users(session).await.context("listing users")?;
    let mut removed = Vec::new();
    for user in users {
        let configured = config.users.get(&user.username).map_or(false, |uc| uc.tenant == session.tenant);
        if !configured {
            continue;
        }
        match platform.delete_user(session, &user.id).await {
            Ok(()) => {
                info!(tenant = %session.tenant, user = %user.username, "removed user");
                removed.push(user.username);
            }
            Err(e) => warn!(tenant = %session.tenant, user = %user.username, error = %e, "failed to remove user"),
        }
    }
    Ok(removed)
}
