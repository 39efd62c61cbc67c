//! Rollout core types, module id grammar, error taxonomy and configuration snapshot.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

pub mod config;
pub mod error;
pub mod module_id;

pub use config::{RolloutConfig, Timings};
pub use error::{EntityResultExt, RolloutError, RolloutResult, Stage, StageFailure, StageResultExt};
pub use module_id::{ModuleId, Resolution, RESERVED_MODULE_ID};

pub mod prelude {
    pub use super::{
        ApplicationDescriptor, CapabilitySet, DiscoveryEntry, Entitlement, LagSample, ModuleEntry, ModuleRef,
        Role, Tenant, User,
    };
    pub use super::{RolloutConfig, RolloutError, RolloutResult, Stage, StageFailure, StageResultExt};
}

/// Suffix appended to a module name to form its sidecar host name.
pub const SIDECAR_SUFFIX: &str = "-sc";

/// Description attached to every tenant, role and application the rollout creates.
pub const DEFAULT_DESCRIPTION: &str = "Default";

/// Default sidecar location of a backend module inside the container network.
pub fn sidecar_url(module_name: &str, network: &str, server_port: u16) -> String {
    format!("http://{}{}.{}:{}", module_name, SIDECAR_SUFFIX, network, server_port)
}

/// A registry module after id resolution, carrying its deployment settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleRef {
    pub id: String,
    pub name: String,
    pub version: String,
    pub sidecar_name: String,
    pub deploy: bool,
    pub server_port: Option<u16>,
}

impl ModuleRef {
    /// Resolve a raw registry id. `Ok(None)` for the reserved platform id.
    pub fn resolve(raw: &str) -> RolloutResult<Option<Self>> {
        match ModuleId::parse(raw)? {
            Resolution::Reserved => Ok(None),
            Resolution::Resolved(id) => Ok(Some(Self {
                id: raw.to_string(),
                sidecar_name: id.sidecar_name(),
                name: id.name,
                version: id.version,
                deploy: false,
                server_port: None,
            })),
        }
    }

    /// Replace the version, rewriting the id as `<name>-<version>`.
    pub fn with_version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self.id = format!("{}-{}", self.name, version);
        self
    }
}

/// Entry of `modules`/`uiModules` in an application descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleEntry {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Module discovery record: where the platform routes traffic for a module id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryEntry {
    pub id: String,
    pub name: String,
    pub version: String,
    pub location: String,
}

/// Application descriptor as submitted to the applications service.
///
/// Discovery entries are not part of the descriptor document; they are submitted
/// as a separate batch once the application exists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationDescriptor {
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: String,
    pub platform: String,
    pub dependencies: BTreeMap<String, String>,
    #[serde(rename = "modules")]
    pub backend_modules: Vec<ModuleEntry>,
    #[serde(rename = "uiModules")]
    pub frontend_modules: Vec<ModuleEntry>,
    pub module_descriptors: Vec<serde_json::Value>,
    pub ui_module_descriptors: Vec<serde_json::Value>,
    #[serde(skip)]
    pub discovery: Vec<DiscoveryEntry>,
}

impl ApplicationDescriptor {
    pub fn application_id(name: &str, version: &str) -> String {
        format!("{}-{}", name, version)
    }

    pub fn contains_module(&self, name: &str) -> bool {
        self.backend_modules.iter().chain(self.frontend_modules.iter()).any(|m| m.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Binding of a tenant to application versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entitlement {
    pub tenant_id: String,
    #[serde(rename = "applications")]
    pub application_ids: BTreeSet<String>,
}

impl Entitlement {
    pub fn new(tenant_id: &str, application_id: &str) -> Self {
        Self { tenant_id: tenant_id.to_string(), application_ids: BTreeSet::from([application_id.to_string()]) }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilitySet {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub application_id: String,
}

/// One successfully parsed consumer-group lag reading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LagSample {
    pub consumer_group: String,
    pub tenant: String,
    pub lag: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// User to provision, as described by configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub tenant: String,
    pub password: String,
    pub first_name: String,
    pub last_name: String,
    pub role_names: BTreeSet<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_ref_resolves_name_version_and_sidecar() {
        let m = ModuleRef::resolve("mod-users-19.3.0").expect("ok").expect("resolved");
        assert_eq!(m.name, "mod-users");
        assert_eq!(m.version, "19.3.0");
        assert_eq!(m.sidecar_name, "mod-users-sc");
        assert_eq!(m.id, "mod-users-19.3.0");
    }

    #[test]
    fn module_ref_skips_reserved_id() {
        assert!(ModuleRef::resolve("okapi").expect("ok").is_none());
    }

    #[test]
    fn version_override_rewrites_id() {
        let m = ModuleRef::resolve("mod-orders-12.0.0").unwrap().unwrap().with_version("12.1.0-SNAPSHOT.4");
        assert_eq!(m.id, "mod-orders-12.1.0-SNAPSHOT.4");
        assert_eq!(m.version, "12.1.0-SNAPSHOT.4");
    }

    #[test]
    fn descriptor_uses_platform_field_names() {
        let d = ApplicationDescriptor {
            id: "app-platform-minimal-1.0.0".into(),
            name: "app-platform-minimal".into(),
            version: "1.0.0".into(),
            description: DEFAULT_DESCRIPTION.into(),
            platform: "base".into(),
            backend_modules: vec![ModuleEntry { id: "mod-a-1.0.0".into(), name: "mod-a".into(), version: "1.0.0".into(), url: None }],
            discovery: vec![DiscoveryEntry { id: "x".into(), name: "x".into(), version: "1".into(), location: "l".into() }],
            ..Default::default()
        };
        let v = serde_json::to_value(&d).unwrap();
        assert_eq!(v["modules"][0]["id"], "mod-a-1.0.0");
        assert!(v["modules"][0].get("url").is_none());
        assert!(v.get("uiModules").is_some());
        assert!(v.get("uiModuleDescriptors").is_some());
        assert!(v.get("discovery").is_none());
    }

    #[test]
    fn entitlement_wire_shape() {
        let e = Entitlement::new("t-1", "app-1.0.0");
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v, serde_json::json!({"tenantId": "t-1", "applications": ["app-1.0.0"]}));
    }

    #[test]
    fn sidecar_url_uses_network_suffix() {
        assert_eq!(sidecar_url("mod-users", "eureka", 8081), "http://mod-users-sc.eureka:8081");
    }
}
