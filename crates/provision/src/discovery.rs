use anyhow::Context;
use rollout_core::{module_id::ModuleId, sidecar_url, DiscoveryEntry, RolloutResult};
use rollout_platform::PlatformApi;
use tracing::info;

/// Build the discovery record for one module.
///
/// `id` may use `:` as the name/version separator. The explicit location is used
/// unless it is empty or `restore` asks for the default sidecar location.
pub fn discovery_entry(id: &str, explicit_url: Option<&str>, restore: bool, server_port: u16, network: &str) -> RolloutResult<DiscoveryEntry> {
    let id = id.replace(':', "-");
    let parsed = ModuleId::parse_required(&id)?;
    let location = match explicit_url {
        Some(url) if !url.is_empty() && !restore => url.to_string(),
        _ => sidecar_url(&parsed.name, network, server_port),
    };
    Ok(DiscoveryEntry { id, name: parsed.name, version: parsed.version, location })
}

/// Replace a module's discovery record. Always a full replace, never a patch.
pub async fn update_discovery(
    platform: &dyn PlatformApi,
    network: &str,
    id: &str,
    explicit_url: Option<&str>,
    restore: bool,
    server_port: u16,
) -> RolloutResult<DiscoveryEntry> {
    let entry = discovery_entry(id, explicit_url, restore, server_port, network)?;
    platform.replace_discovery(&entry).await.with_context(|| format!("updating discovery of {}", entry.id))?;
    info!(module = %entry.name, location = %entry.location, "updated application module discovery");
    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollout_core::RolloutError;

    #[test]
    fn colon_separated_ids_are_normalized() {
        let e = discovery_entry("mod-users:19.3.0", None, false, 8081, "eureka").unwrap();
        assert_eq!(e.id, "mod-users-19.3.0");
        assert_eq!(e.name, "mod-users");
        assert_eq!(e.version, "19.3.0");
        assert_eq!(e.location, "http://mod-users-sc.eureka:8081");
    }

    #[test]
    fn explicit_location_unless_empty_or_restored() {
        let custom = Some("http://host.docker.internal:9130");
        assert_eq!(discovery_entry("mod-users-19.3.0", custom, false, 8081, "eureka").unwrap().location, custom.unwrap());
        assert_eq!(
            discovery_entry("mod-users-19.3.0", custom, true, 8081, "eureka").unwrap().location,
            "http://mod-users-sc.eureka:8081"
        );
        assert_eq!(
            discovery_entry("mod-users-19.3.0", Some(""), false, 8081, "eureka").unwrap().location,
            "http://mod-users-sc.eureka:8081"
        );
    }

    #[test]
    fn reserved_and_malformed_ids_fail() {
        assert!(matches!(discovery_entry("okapi", None, false, 1, "eureka"), Err(RolloutError::MalformedIdentifier { .. })));
        assert!(matches!(discovery_entry("no-version", None, false, 1, "eureka"), Err(RolloutError::MalformedIdentifier { .. })));
    }
}
